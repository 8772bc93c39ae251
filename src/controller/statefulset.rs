//! Database StatefulSet sync
//!
//! The StatefulSet uses the `OnDelete` strategy, so template changes are
//! rolled out by the operator itself: affected pods are marked with the
//! rolling-update annotation, which survives operator restarts, and are
//! recreated once Patroni is reachable. Replicas go first; the primary is
//! switched over to a replica before it is recreated.

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use kube::runtime::events::EventType;
use tracing::{debug, info, warn};

use crate::controller::error::{Error, Result};
use crate::controller::patroni_sync::{DesiredPatroni, PatroniSynchronizer};
use crate::controller::sync::ClusterSync;
use crate::resources::builder::generate_statefulset;
use crate::resources::common::{POSTGRES_CONTAINER, PostgresRole, ROLLING_UPDATE_ANNOTATION};
use crate::resources::compare::{compare_statefulsets, stale_image_pods};
use crate::store::{ResourceStore, StoreError};

/// Whether the postgres container of a pod reports ready
pub fn is_pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .and_then(|statuses| statuses.iter().find(|c| c.name == POSTGRES_CONTAINER))
        .is_some_and(|c| c.ready)
}

/// Whether a pod carries the rolling-update annotation
pub fn marked_for_rolling_update(pod: &Pod) -> bool {
    pod.annotations()
        .get(ROLLING_UPDATE_ANNOTATION)
        .is_some_and(|v| v == "true")
}

/// Role Spilo advertises on the pod
pub fn pod_role(pod: &Pod, role_label: &str) -> Option<PostgresRole> {
    let value = pod.labels().get(role_label)?;
    PostgresRole::ALL
        .into_iter()
        .find(|role| role.label_value() == value)
}

fn escape_json_pointer(key: &str) -> String {
    key.replace('~', "~0").replace('/', "~1")
}

/// JSON patch setting the rolling-update annotation on a pod
fn rolling_update_patch(pod: &Pod) -> std::result::Result<json_patch::Patch, StoreError> {
    let operation = if pod.metadata.annotations.is_some() {
        serde_json::json!({
            "op": "add",
            "path": format!("/metadata/annotations/{}", escape_json_pointer(ROLLING_UPDATE_ANNOTATION)),
            "value": "true",
        })
    } else {
        let mut annotations = serde_json::Map::new();
        annotations.insert(ROLLING_UPDATE_ANNOTATION.to_string(), "true".into());
        serde_json::json!({
            "op": "add",
            "path": "/metadata/annotations",
            "value": annotations,
        })
    };
    serde_json::from_value(serde_json::Value::Array(vec![operation]))
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

impl<S: ResourceStore> ClusterSync<'_, S> {
    pub(crate) async fn sync_statefulset(&mut self) -> Result<()> {
        let mut desired = generate_statefulset(self.cluster, self.config())?;
        let existing = self
            .store()
            .get::<StatefulSet>(self.namespace(), self.name())
            .await?;

        let Some(live) = existing else {
            info!("creating statefulset");
            let created = self.store().create(&desired).await?;
            self.state.statefulset = Some(created);
            self.event(EventType::Normal, "StatefulSet", "statefulset created")
                .await;
            self.wait_for_statefulset_pods_ready().await?;
            return Ok(());
        };

        // The restore sequence owns the replica count while it runs
        if self.state.restore_in_progress()
            && let (Some(want), Some(have)) = (desired.spec.as_mut(), live.spec.as_ref())
        {
            want.replicas = have.replicas;
        }

        let pods = self.list_pods().await?;
        let mut to_recreate: Vec<String> = pods
            .iter()
            .filter(|p| marked_for_rolling_update(p))
            .map(|p| p.name_any())
            .collect();

        let comparison = compare_statefulsets(&live, &desired, &self.config().inherited_annotations);
        if comparison.matches {
            self.state.statefulset = Some(live);
        } else {
            let reasons = comparison.reasons.join(", ");
            info!(reasons = %reasons, "statefulset differs from the manifest");
            if comparison.rolling_update {
                self.mark_rolling_update(&pods).await?;
                to_recreate = pods.iter().map(|p| p.name_any()).collect();
            }
            let updated = if comparison.replace {
                self.replace_statefulset(&desired, &reasons).await?
            } else {
                desired.metadata.resource_version = live.metadata.resource_version.clone();
                self.store().update(&desired).await?
            };
            self.state.statefulset = Some(updated);
        }

        if !self.config().enable_lazy_image_upgrade {
            let stale = stale_image_pods(&pods, &desired);
            let unmarked: Vec<Pod> = pods
                .iter()
                .filter(|p| stale.contains(&p.name_any()) && !to_recreate.contains(&p.name_any()))
                .cloned()
                .collect();
            if !unmarked.is_empty() {
                self.mark_rolling_update(&unmarked).await?;
                to_recreate.extend(unmarked.iter().map(|p| p.name_any()));
            }
        }

        let synchronizer = PatroniSynchronizer::new(
            self.ctx.patroni.as_ref(),
            DesiredPatroni::from_cluster(self.cluster, self.config()),
        );
        let mut result = synchronizer
            .sync(&pods, &mut self.state.replication_slots)
            .await;
        if result.reached_any {
            let (wait, primary_first) = (result.wait_interval, result.primary_restart_required);
            synchronizer
                .restart_pending(&pods, wait, primary_first, &mut result)
                .await;
        }
        if !result.errors.is_empty() {
            warn!(errors = ?result.errors, "Patroni configuration sync incomplete");
        }

        if to_recreate.is_empty() {
            return Ok(());
        }
        if result.postpone_pod_recreation(pods.len()) {
            warn!(
                pods = to_recreate.len(),
                "postponing pod recreation until Patroni is reachable"
            );
            return Ok(());
        }
        if self.state.restore_in_progress() {
            debug!("postponing pod recreation until the restore completes");
            return Ok(());
        }
        self.recreate_pods(&to_recreate).await
    }

    async fn replace_statefulset(&mut self, desired: &StatefulSet, reasons: &str) -> Result<StatefulSet> {
        info!(reasons, "replacing statefulset");
        self.event(
            EventType::Normal,
            "StatefulSet",
            &format!("replacing statefulset: {reasons}"),
        )
        .await;
        // Pods keep running while the object is swapped
        match self
            .store()
            .delete_orphaning::<StatefulSet>(self.namespace(), self.name())
            .await
        {
            Ok(()) | Err(StoreError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        let mut fresh = desired.clone();
        fresh.metadata.resource_version = None;
        Ok(self.store().create(&fresh).await?)
    }

    /// Persist the rolling-update flag on pods that do not carry it yet
    pub(crate) async fn mark_rolling_update(&self, pods: &[Pod]) -> Result<()> {
        for pod in pods.iter().filter(|p| !marked_for_rolling_update(p)) {
            let patch = rolling_update_patch(pod)?;
            self.store()
                .patch::<Pod>(self.namespace(), &pod.name_any(), &patch)
                .await?;
            debug!(pod = %pod.name_any(), "marked pod for rolling update");
        }
        Ok(())
    }

    /// Recreate the named pods: replicas first, then switch over and
    /// recreate the primary
    async fn recreate_pods(&mut self, names: &[String]) -> Result<()> {
        let pods = self.list_pods().await?;
        let role_label = self.config().pod_role_label.clone();
        let mut primary = None;
        let mut replicas = Vec::new();
        for pod in pods.iter().filter(|p| names.contains(&p.name_any())) {
            match pod_role(pod, &role_label) {
                Some(PostgresRole::Master) => primary = Some(pod.clone()),
                _ => replicas.push(pod.clone()),
            }
        }

        self.event(
            EventType::Normal,
            "Update",
            &format!("performing rolling update of {} pods", names.len()),
        )
        .await;
        for pod in &replicas {
            self.recreate_pod(pod).await?;
        }

        if let Some(primary) = primary {
            let candidate = self
                .list_pods()
                .await?
                .into_iter()
                .filter(|p| p.name_any() != primary.name_any())
                .find(|p| is_pod_ready(p) && pod_role(p, &role_label) != Some(PostgresRole::Master));
            if let Some(candidate) = candidate {
                let candidate = candidate.name_any();
                info!(from = %primary.name_any(), to = %candidate, "switching over before recreating the primary");
                self.ctx.patroni.switchover(&primary, &candidate).await?;
                self.event(
                    EventType::Normal,
                    "Switchover",
                    &format!("switched over from {} to {candidate}", primary.name_any()),
                )
                .await;
            } else if self.spec().number_of_instances > 1 {
                warn!(pod = %primary.name_any(), "no ready replica to switch over to");
            }
            self.recreate_pod(&primary).await?;
        }
        info!("rolling update complete");
        Ok(())
    }

    async fn recreate_pod(&self, pod: &Pod) -> Result<()> {
        let name = pod.name_any();
        info!(pod = %name, "recreating pod");
        match self.store().delete::<Pod>(self.namespace(), &name).await {
            Ok(()) | Err(StoreError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        self.wait_for_pod_ready(&name, pod.metadata.uid.as_deref())
            .await
    }

    /// Poll until the pod exists, is not the instance with `previous_uid`
    /// and its postgres container is ready
    pub(crate) async fn wait_for_pod_ready(&self, name: &str, previous_uid: Option<&str>) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.config().resource_check_timeout;
        loop {
            if let Some(pod) = self.store().get::<Pod>(self.namespace(), name).await?
                && (previous_uid.is_none() || pod.metadata.uid.as_deref() != previous_uid)
                && is_pod_ready(&pod)
            {
                debug!(pod = %name, "pod is ready");
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Timeout(format!("pod {name} did not become ready")));
            }
            tokio::time::sleep(self.config().resource_check_interval).await;
        }
    }

    /// Poll until the StatefulSet's replica count of pods is ready
    pub(crate) async fn wait_for_statefulset_pods_ready(&self) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.config().resource_check_timeout;
        loop {
            let desired = self
                .store()
                .get::<StatefulSet>(self.namespace(), self.name())
                .await?
                .and_then(|s| s.spec)
                .and_then(|s| s.replicas)
                .unwrap_or_default();
            let ready = self.list_pods().await?.iter().filter(|p| is_pod_ready(p)).count();
            if usize::try_from(desired).is_ok_and(|d| ready >= d) {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Timeout(format!(
                    "{ready} of {desired} pods ready for statefulset {}",
                    self.name()
                )));
            }
            tokio::time::sleep(self.config().resource_check_interval).await;
        }
    }

    /// Set the StatefulSet's replica count in place
    pub(crate) async fn scale_statefulset(&mut self, replicas: i32) -> Result<()> {
        let patch = crate::store::replace_patch("/spec/replicas", serde_json::json!(replicas))?;
        let scaled = self
            .store()
            .patch::<StatefulSet>(self.namespace(), self.name(), &patch)
            .await?;
        info!(replicas, "scaled statefulset");
        self.state.statefulset = Some(scaled);
        Ok(())
    }
}
