//! Desired-versus-live comparison
//!
//! The database StatefulSet uses `OnDelete`, so a template change does
//! nothing by itself: the comparison tells the controller whether it has to
//! recreate pods, replace the StatefulSet object, or only patch it.
//! Fields the API server defaults are normalised or skipped so a freshly
//! created object compares equal to the desired one.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::batch::v1::CronJob;
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, PersistentVolumeClaim, Pod, PodSpec, PodTemplateSpec,
    Service, Volume,
};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;

use crate::resources::common::POSTGRES_CONTAINER;

/// Outcome of comparing a live StatefulSet with the desired one
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatefulSetComparison {
    /// Nothing to do
    pub matches: bool,
    /// Immutable fields differ; the object has to be deleted and recreated
    pub replace: bool,
    /// The pod template changed in a way only new pods pick up
    pub rolling_update: bool,
    pub reasons: Vec<String>,
}

impl Default for StatefulSetComparison {
    fn default() -> Self {
        Self {
            matches: true,
            replace: false,
            rolling_update: false,
            reasons: Vec::new(),
        }
    }
}

impl StatefulSetComparison {
    fn differs(&mut self, reason: impl Into<String>) {
        self.matches = false;
        self.reasons.push(reason.into());
    }

    fn needs_replace(&mut self, reason: impl Into<String>) {
        self.replace = true;
        self.differs(reason);
    }

    fn needs_rolling_update(&mut self, reason: impl Into<String>) {
        self.rolling_update = true;
        self.differs(reason);
    }
}

fn map_or_empty(map: Option<&BTreeMap<String, String>>) -> BTreeMap<String, String> {
    map.cloned().unwrap_or_default()
}

/// Compare a live StatefulSet with the desired one
///
/// Only the annotations named in `tracked_annotations` are compared on the
/// StatefulSet's own metadata; anything else there belongs to other actors.
pub fn compare_statefulsets(
    actual: &StatefulSet,
    desired: &StatefulSet,
    tracked_annotations: &[String],
) -> StatefulSetComparison {
    let mut result = StatefulSetComparison::default();
    let (Some(live), Some(want)) = (actual.spec.as_ref(), desired.spec.as_ref()) else {
        result.needs_replace("statefulset spec is missing");
        return result;
    };

    let live_annotations = map_or_empty(actual.metadata.annotations.as_ref());
    let want_annotations = map_or_empty(desired.metadata.annotations.as_ref());
    for key in tracked_annotations {
        if live_annotations.get(key) != want_annotations.get(key) {
            result.differs(format!("annotation {key} changed"));
        }
    }

    if live.replicas != want.replicas {
        result.needs_replace(format!(
            "number of replicas changed from {:?} to {:?}",
            live.replicas, want.replicas
        ));
    }
    if live.service_name != want.service_name {
        result.needs_replace("service name changed");
    }
    if live.selector != want.selector {
        result.needs_replace("selector changed");
    }
    if want.pod_management_policy.is_some()
        && live.pod_management_policy != want.pod_management_policy
    {
        result.needs_replace("pod management policy changed");
    }
    if want.persistent_volume_claim_retention_policy.is_some()
        && live.persistent_volume_claim_retention_policy
            != want.persistent_volume_claim_retention_policy
    {
        result.needs_replace("volume claim retention policy changed");
    }
    compare_claim_templates(
        live.volume_claim_templates.as_deref().unwrap_or_default(),
        want.volume_claim_templates.as_deref().unwrap_or_default(),
        &mut result,
    );

    compare_templates(&live.template, &want.template, &mut result);
    result
}

fn claim_size(claim: &PersistentVolumeClaim) -> Option<String> {
    claim
        .spec
        .as_ref()?
        .resources
        .as_ref()?
        .requests
        .as_ref()?
        .get("storage")
        .map(|q| q.0.clone())
}

fn compare_claim_templates(
    live: &[PersistentVolumeClaim],
    want: &[PersistentVolumeClaim],
    result: &mut StatefulSetComparison,
) {
    if live.len() != want.len() {
        result.needs_replace("number of volume claim templates changed");
        return;
    }
    for (live, want) in live.iter().zip(want) {
        let name = want.metadata.name.clone().unwrap_or_default();
        if live.metadata.name != want.metadata.name {
            result.needs_replace(format!("volume claim template {name} renamed"));
            continue;
        }
        if claim_size(live) != claim_size(want) {
            result.needs_replace(format!("size of volume claim template {name} changed"));
        }
        let storage_class = |c: &PersistentVolumeClaim| {
            c.spec.as_ref().and_then(|s| s.storage_class_name.clone())
        };
        if storage_class(want).is_some() && storage_class(live) != storage_class(want) {
            result.needs_replace(format!("storage class of {name} changed"));
        }
    }
}

fn compare_templates(
    live: &PodTemplateSpec,
    want: &PodTemplateSpec,
    result: &mut StatefulSetComparison,
) {
    let live_meta = live.metadata.clone().unwrap_or_default();
    let want_meta = want.metadata.clone().unwrap_or_default();
    if map_or_empty(live_meta.labels.as_ref()) != map_or_empty(want_meta.labels.as_ref()) {
        result.needs_replace("pod template labels changed");
        result.rolling_update = true;
    }
    if map_or_empty(live_meta.annotations.as_ref()) != map_or_empty(want_meta.annotations.as_ref()) {
        result.needs_rolling_update("pod template annotations changed");
    }

    let live = live.spec.clone().unwrap_or_default();
    let want = want.spec.clone().unwrap_or_default();
    compare_pod_specs(&live, &want, result);
}

fn compare_pod_specs(live: &PodSpec, want: &PodSpec, result: &mut StatefulSetComparison) {
    let service_account = |s: &PodSpec| {
        s.service_account_name
            .clone()
            .filter(|n| n != "default")
    };
    if service_account(live) != service_account(want) {
        result.needs_replace("service account changed");
        result.rolling_update = true;
    }
    if want.termination_grace_period_seconds.is_some()
        && live.termination_grace_period_seconds != want.termination_grace_period_seconds
    {
        result.needs_replace("termination grace period changed");
        result.rolling_update = true;
    }
    if live.affinity != want.affinity {
        result.needs_replace("pod affinity changed");
        result.rolling_update = true;
    }

    if let Some(reason) = compare_containers(&live.containers, &want.containers) {
        result.needs_rolling_update(reason);
    }
    if let Some(reason) = compare_containers(
        live.init_containers.as_deref().unwrap_or_default(),
        want.init_containers.as_deref().unwrap_or_default(),
    ) {
        result.needs_rolling_update(format!("init containers: {reason}"));
    }
    if live.tolerations.as_deref().unwrap_or_default()
        != want.tolerations.as_deref().unwrap_or_default()
    {
        result.needs_rolling_update("tolerations changed");
    }
    if live.topology_spread_constraints.as_deref().unwrap_or_default()
        != want.topology_spread_constraints.as_deref().unwrap_or_default()
    {
        result.needs_rolling_update("topology spread constraints changed");
    }
    if volume_sources(live.volumes.as_deref()) != volume_sources(want.volumes.as_deref()) {
        result.needs_rolling_update("volumes changed");
    }
}

/// Volume names with the ConfigMaps and Secrets they project
fn volume_sources(volumes: Option<&[Volume]>) -> Vec<(String, Vec<String>)> {
    volumes
        .unwrap_or_default()
        .iter()
        .map(|v| {
            let mut refs = Vec::new();
            if let Some(projected) = &v.projected {
                for source in projected.sources.as_deref().unwrap_or_default() {
                    if let Some(cm) = &source.config_map {
                        refs.push(format!("configmap/{}", cm.name));
                    }
                    if let Some(secret) = &source.secret {
                        refs.push(format!("secret/{}", secret.name));
                    }
                }
            }
            if let Some(cm) = &v.config_map {
                refs.push(format!("configmap/{}", cm.name));
            }
            if let Some(secret) = &v.secret {
                refs.push(format!("secret/{}", secret.secret_name.clone().unwrap_or_default()));
            }
            (v.name.clone(), refs)
        })
        .collect()
}

fn normalized_ports(ports: Option<&[ContainerPort]>) -> Vec<(i32, Option<String>, String)> {
    ports
        .unwrap_or_default()
        .iter()
        .map(|p| {
            (
                p.container_port,
                p.name.clone(),
                p.protocol.clone().unwrap_or_else(|| "TCP".to_string()),
            )
        })
        .collect()
}

/// The API server fills in `fieldRef.apiVersion`
fn normalized_env(env: Option<&[EnvVar]>) -> Vec<EnvVar> {
    env.unwrap_or_default()
        .iter()
        .cloned()
        .map(|mut var| {
            if let Some(field) = var.value_from.as_mut().and_then(|v| v.field_ref.as_mut()) {
                field.api_version = None;
            }
            var
        })
        .collect()
}

fn compare_containers(live: &[Container], want: &[Container]) -> Option<String> {
    if live.len() != want.len() {
        return Some(format!(
            "number of containers changed from {} to {}",
            live.len(),
            want.len()
        ));
    }
    for (live, want) in live.iter().zip(want) {
        let name = &want.name;
        if live.name != want.name {
            return Some(format!("container {} renamed to {name}", live.name));
        }
        if live.image != want.image {
            return Some(format!(
                "image of container {name} changed from {:?} to {:?}",
                live.image, want.image
            ));
        }
        if normalized_ports(live.ports.as_deref()) != normalized_ports(want.ports.as_deref()) {
            return Some(format!("ports of container {name} changed"));
        }
        if normalized_env(live.env.as_deref()) != normalized_env(want.env.as_deref()) {
            return Some(format!("environment of container {name} changed"));
        }
        if live.resources.clone().unwrap_or_default() != want.resources.clone().unwrap_or_default() {
            return Some(format!("resources of container {name} changed"));
        }
        if want.security_context.is_some() && live.security_context != want.security_context {
            return Some(format!("security context of container {name} changed"));
        }
    }
    None
}

fn postgres_image(spec: Option<&PodSpec>) -> Option<&str> {
    spec?
        .containers
        .iter()
        .find(|c| c.name == POSTGRES_CONTAINER)
        .and_then(|c| c.image.as_deref())
}

/// Names of pods whose postgres container runs another image than desired
pub fn stale_image_pods(pods: &[Pod], desired: &StatefulSet) -> Vec<String> {
    let Some(image) = desired
        .spec
        .as_ref()
        .and_then(|s| postgres_image(s.template.spec.as_ref()))
    else {
        return Vec::new();
    };
    pods.iter()
        .filter(|pod| postgres_image(pod.spec.as_ref()).is_some_and(|live| live != image))
        .filter_map(|pod| pod.metadata.name.clone())
        .collect()
}

/// Reasons a live Service needs updating; empty when it matches
pub fn compare_services(actual: &Service, desired: &Service) -> Vec<String> {
    let mut reasons = Vec::new();
    let (live, want) = (
        actual.spec.clone().unwrap_or_default(),
        desired.spec.clone().unwrap_or_default(),
    );

    if live.type_.as_deref().unwrap_or("ClusterIP") != want.type_.as_deref().unwrap_or("ClusterIP") {
        reasons.push(format!("type changed from {:?} to {:?}", live.type_, want.type_));
    }
    let ports = |s: &k8s_openapi::api::core::v1::ServiceSpec| {
        s.ports
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(|p| (p.name.clone(), p.port, p.target_port.clone()))
            .collect::<Vec<_>>()
    };
    if ports(&live) != ports(&want) {
        reasons.push("ports changed".to_string());
    }
    if live.selector != want.selector {
        reasons.push("selector changed".to_string());
    }
    if live.load_balancer_source_ranges.as_deref().unwrap_or_default()
        != want.load_balancer_source_ranges.as_deref().unwrap_or_default()
    {
        reasons.push("load balancer source ranges changed".to_string());
    }

    let live_annotations = map_or_empty(actual.metadata.annotations.as_ref());
    for (key, value) in map_or_empty(desired.metadata.annotations.as_ref()) {
        if live_annotations.get(&key) != Some(&value) {
            reasons.push(format!("annotation {key} changed"));
        }
    }
    reasons
}

/// Reasons a live PodDisruptionBudget needs updating
pub fn compare_pdbs(actual: &PodDisruptionBudget, desired: &PodDisruptionBudget) -> Vec<String> {
    let mut reasons = Vec::new();
    let (live, want) = (
        actual.spec.clone().unwrap_or_default(),
        desired.spec.clone().unwrap_or_default(),
    );
    if live.min_available != want.min_available {
        reasons.push("min available changed".to_string());
    }
    if live.selector != want.selector {
        reasons.push("selector changed".to_string());
    }
    reasons
}

/// Reasons a live CronJob needs updating
pub fn compare_cronjobs(actual: &CronJob, desired: &CronJob) -> Vec<String> {
    let mut reasons = Vec::new();
    let (live, want) = (
        actual.spec.clone().unwrap_or_default(),
        desired.spec.clone().unwrap_or_default(),
    );
    if live.schedule != want.schedule {
        reasons.push(format!(
            "schedule changed from {:?} to {:?}",
            live.schedule, want.schedule
        ));
    }
    let container = |spec: &k8s_openapi::api::batch::v1::CronJobSpec| {
        spec.job_template
            .spec
            .as_ref()
            .and_then(|j| j.template.spec.as_ref())
            .and_then(|p| p.containers.first().cloned())
            .unwrap_or_default()
    };
    let (live, want) = (container(&live), container(&want));
    if live.image != want.image {
        reasons.push("image changed".to_string());
    }
    if normalized_env(live.env.as_deref()) != normalized_env(want.env.as_deref()) {
        reasons.push("environment changed".to_string());
    }
    reasons
}
