//! StatefulSets for the Spilo database pods and the pgBackRest repo host
//!
//! The database StatefulSet uses the `OnDelete` update strategy: the
//! operator recreates pods itself so replicas go before the primary.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{
    StatefulSet, StatefulSetPersistentVolumeClaimRetentionPolicy, StatefulSetSpec,
    StatefulSetUpdateStrategy,
};
use k8s_openapi::api::core::v1::{
    Affinity, ConfigMapKeySelector, ConfigMapProjection, Container, ContainerPort, EnvVar,
    EnvVarSource, HTTPGetAction, ObjectFieldSelector, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PodAffinityTerm, PodAntiAffinity, PodSecurityContext, PodSpec,
    PodTemplateSpec, Probe, ProjectedVolumeSource, SeccompProfile, SecretKeySelector,
    SecretProjection, SecurityContext, Volume, VolumeMount, VolumeProjection,
    VolumeResourceRequirements, WeightedPodAffinityTerm,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use kube::core::ObjectMeta;
use serde_json::{Map, Value, json};

use super::{non_empty, object_meta, resource_requirements};
use super::stream::stream_slot_name;
use crate::config::OperatorConfig;
use crate::controller::error::{Error, Result};
use crate::crd::{PostgresCluster, VolumeSpec};
use crate::resources::common::{
    CLUSTER_LABEL, CLUSTER_NAME_LABEL, MONITORING_USER, POSTGRES_CONTAINER, credential_secret_name,
    headless_service_name, patroni_labels, pgbackrest_cert_secret_name, pgbackrest_configmap_name,
    pod_selector, repo_host_configmap_name, repo_host_statefulset_name, restore_configmap_name,
    standard_labels, wal_volume_name,
};
use crate::resources::patroni::{PATRONI_PORT, is_dcs_parameter};

/// Spilo keeps PGDATA and the pgBackRest spool under this mount
pub const PGDATA_MOUNT: &str = "/home/postgres/pgdata";
pub const PGROOT: &str = "/home/postgres/pgdata/pgroot";
const WAL_MOUNT: &str = "/home/postgres/wal";
pub(super) const PGBACKREST_CONFIG_MOUNT: &str = "/etc/pgbackrest/conf.d";
const PGBACKREST_CERT_MOUNT: &str = "/etc/pgbackrest/certs";
const REPO_HOST_DATA_MOUNT: &str = "/data/pgbackrest";

const DATA_VOLUME: &str = "pgdata";
pub(super) const CONFIG_VOLUME: &str = "pgbackrest-config";
const CERT_VOLUME: &str = "cert-secret";

/// Name of the repo-host container, also used as `CONTAINER` by backup jobs
pub const REPO_HOST_CONTAINER: &str = "pgbackrest";
const RESTORE_CONTAINER: &str = "pgbackrest-restore";
const EXPORTER_CONTAINER: &str = "postgres-exporter";
const EXPORTER_PORT: i32 = 9187;

/// Spilo runs postgres as uid 101 in group 103
const SPILO_UID: i64 = 101;
const SPILO_GID: i64 = 103;

pub(super) fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

pub(super) fn env_field(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub(super) fn env_secret(name: &str, secret: String, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: secret,
                key: key.to_string(),
                optional: Some(false),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Value from the restore marker; the marker usually does not exist
fn env_restore_marker(name: &str, cluster_name: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            config_map_key_ref: Some(ConfigMapKeySelector {
                name: restore_configmap_name(cluster_name),
                key: key.to_string(),
                optional: Some(true),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Postgres parameters the cluster needs, including those implied by
/// other manifest sections
pub fn desired_pg_parameters(cluster: &PostgresCluster) -> BTreeMap<String, String> {
    let mut parameters = cluster.spec.postgresql.parameters.clone();
    if !cluster.spec.streams.is_empty() {
        parameters.insert("wal_level".to_string(), "logical".to_string());
    }
    parameters
}

/// Replication slots Patroni should maintain: the manifest's slots plus
/// one logical slot per event stream
pub fn desired_slots(cluster: &PostgresCluster) -> BTreeMap<String, BTreeMap<String, String>> {
    let mut slots = cluster.spec.patroni.slots.clone();
    for stream in &cluster.spec.streams {
        slots.insert(
            stream_slot_name(&stream.database, &stream.application_id),
            BTreeMap::from([
                ("type".to_string(), "logical".to_string()),
                ("database".to_string(), stream.database.clone()),
                ("plugin".to_string(), "pgoutput".to_string()),
            ]),
        );
    }
    slots
}

/// Render `SPILO_CONFIGURATION`
///
/// Zero values are left out so Patroni keeps its own defaults. Parameters
/// Patroni accepts through the DCS go to `bootstrap.dcs`, the rest to the
/// local `postgresql` section.
pub fn spilo_configuration(cluster: &PostgresCluster, config: &OperatorConfig) -> Result<String> {
    let spec = &cluster.spec;
    let patroni = &spec.patroni;

    let mut initdb = vec![
        json!({"auth-host": "scram-sha-256"}),
        json!({"auth-local": "trust"}),
    ];
    if spec.major_version().is_some_and(|v| v > 14) {
        initdb.extend([
            json!({"encoding": "UTF8"}),
            json!({"locale": "en_US.UTF-8"}),
            json!({"locale-provider": "icu"}),
            json!({"icu-locale": "en_US"}),
        ]);
    }

    let mut dcs = Map::new();
    if patroni.ttl != 0 {
        dcs.insert("ttl".into(), json!(patroni.ttl));
    }
    if patroni.loop_wait != 0 {
        dcs.insert("loop_wait".into(), json!(patroni.loop_wait));
    }
    if patroni.retry_timeout != 0 {
        dcs.insert("retry_timeout".into(), json!(patroni.retry_timeout));
    }
    if patroni.maximum_lag_on_failover > 0.0 {
        dcs.insert(
            "maximum_lag_on_failover".into(),
            json!(patroni.maximum_lag_on_failover),
        );
    }
    if patroni.synchronous_mode {
        dcs.insert("synchronous_mode".into(), json!(true));
    }
    if patroni.synchronous_mode_strict {
        dcs.insert("synchronous_mode_strict".into(), json!(true));
    }
    if let Some(failsafe) = patroni.failsafe_mode.or(config.patroni_failsafe_mode) {
        dcs.insert("failsafe_mode".into(), json!(failsafe));
    }
    let slots = desired_slots(cluster);
    if !slots.is_empty() {
        dcs.insert("slots".into(), json!(slots));
    }

    let (dcs_parameters, local_parameters): (BTreeMap<_, _>, BTreeMap<_, _>) =
        desired_pg_parameters(cluster)
            .into_iter()
            .partition(|(name, _)| is_dcs_parameter(name));
    if !dcs_parameters.is_empty() {
        dcs.insert("postgresql".into(), json!({ "parameters": dcs_parameters }));
    }

    let mut local = Map::new();
    if !local_parameters.is_empty() {
        local.insert("parameters".into(), json!(local_parameters));
    }
    if let Some(pg_hba) = patroni.pg_hba.as_ref().filter(|h| !h.is_empty()) {
        local.insert("pg_hba".into(), json!(pg_hba));
    }

    let document = json!({
        "postgresql": Value::Object(local),
        "bootstrap": {
            "initdb": initdb,
            "dcs": Value::Object(dcs),
        },
    });
    Ok(serde_json::to_string(&document)?)
}

/// Spread pods across nodes and zones
fn generate_anti_affinity(cluster_name: &str) -> Affinity {
    let term = |weight: i32, topology_key: &str| WeightedPodAffinityTerm {
        weight,
        pod_affinity_term: PodAffinityTerm {
            label_selector: Some(LabelSelector {
                match_expressions: Some(vec![LabelSelectorRequirement {
                    key: CLUSTER_LABEL.to_string(),
                    operator: "In".to_string(),
                    values: Some(vec![cluster_name.to_string()]),
                }]),
                ..Default::default()
            }),
            topology_key: topology_key.to_string(),
            ..Default::default()
        },
    };

    Affinity {
        pod_anti_affinity: Some(PodAntiAffinity {
            preferred_during_scheduling_ignored_during_execution: Some(vec![
                term(100, "kubernetes.io/hostname"),
                term(50, "topology.kubernetes.io/zone"),
            ]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn patroni_probe(path: &str, initial_delay: i32, failure_threshold: i32) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(path.to_string()),
            port: IntOrString::Int(i32::from(PATRONI_PORT)),
            scheme: Some("HTTP".to_string()),
            ..Default::default()
        }),
        initial_delay_seconds: Some(initial_delay),
        period_seconds: Some(10),
        timeout_seconds: Some(5),
        success_threshold: Some(1),
        failure_threshold: Some(failure_threshold),
        ..Default::default()
    }
}

pub(super) fn container_security_context() -> SecurityContext {
    SecurityContext {
        run_as_user: Some(SPILO_UID),
        run_as_group: Some(SPILO_GID),
        allow_privilege_escalation: Some(false),
        ..Default::default()
    }
}

fn pod_security_context() -> PodSecurityContext {
    PodSecurityContext {
        fs_group: Some(SPILO_GID),
        run_as_user: Some(SPILO_UID),
        run_as_group: Some(SPILO_GID),
        seccomp_profile: Some(SeccompProfile {
            type_: "RuntimeDefault".to_string(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub(super) fn mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        ..Default::default()
    }
}

fn projected_volume(name: &str, source: VolumeProjection) -> Volume {
    Volume {
        name: name.to_string(),
        projected: Some(ProjectedVolumeSource {
            default_mode: Some(0o640),
            sources: Some(vec![source]),
        }),
        ..Default::default()
    }
}

pub(super) fn config_volume(configmap: String) -> Volume {
    projected_volume(
        CONFIG_VOLUME,
        VolumeProjection {
            config_map: Some(ConfigMapProjection {
                name: configmap,
                optional: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        },
    )
}

fn cert_volume(cluster_name: &str) -> Volume {
    projected_volume(
        CERT_VOLUME,
        VolumeProjection {
            secret: Some(SecretProjection {
                name: pgbackrest_cert_secret_name(cluster_name),
                optional: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        },
    )
}

fn volume_claim_template(name: &str, volume: &VolumeSpec) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: volume.storage_class.clone(),
            volume_attributes_class_name: volume.volume_attributes_class.clone(),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(volume.size.clone()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn retain_claims() -> StatefulSetPersistentVolumeClaimRetentionPolicy {
    StatefulSetPersistentVolumeClaimRetentionPolicy {
        when_deleted: Some("Retain".to_string()),
        when_scaled: Some("Retain".to_string()),
    }
}

fn spilo_env(cluster: &PostgresCluster, config: &OperatorConfig) -> Result<Vec<EnvVar>> {
    let name = cluster.name_any();
    let spec = &cluster.spec;
    let kubernetes_labels = serde_json::to_string(&BTreeMap::from([(
        "application".to_string(),
        "spilo".to_string(),
    )]))?;

    let mut env_vars = vec![
        env("SCOPE", name.clone()),
        env("PGROOT", PGROOT),
        env_field("POD_IP", "status.podIP"),
        env_field("POD_NAMESPACE", "metadata.namespace"),
        env("PGUSER_SUPERUSER", config.super_username.clone()),
        env_secret(
            "PGPASSWORD_SUPERUSER",
            credential_secret_name(&config.super_username, &name),
            "password",
        ),
        env("PGUSER_STANDBY", config.replication_username.clone()),
        env_secret(
            "PGPASSWORD_STANDBY",
            credential_secret_name(&config.replication_username, &name),
            "password",
        ),
        env("PGVERSION", spec.postgresql.version.clone()),
        env("KUBERNETES_SCOPE_LABEL", CLUSTER_NAME_LABEL),
        env("KUBERNETES_ROLE_LABEL", config.pod_role_label.clone()),
        env("KUBERNETES_LABELS", kubernetes_labels),
        env("DCS_ENABLE_KUBERNETES_API", "true"),
        env("SPILO_CONFIGURATION", spilo_configuration(cluster, config)?),
    ];
    if config.kubernetes_use_configmaps {
        env_vars.push(env("KUBERNETES_USE_CONFIGMAPS", "true"));
    }
    if let Some(standby) = &spec.standby {
        if let Some(host) = &standby.standby_host {
            env_vars.push(env("STANDBY_HOST", host.clone()));
        }
        if let Some(port) = &standby.standby_port {
            env_vars.push(env("STANDBY_PORT", port.clone()));
        }
    }
    if spec.pgbackrest().is_some() {
        env_vars.push(env("USE_PGBACKREST", "true"));
    }
    Ok(env_vars)
}

/// Init container that runs a pending pgBackRest restore before Spilo starts.
/// It reads the restore marker, so it is a no-op while no restore is recorded.
fn restore_container(cluster: &PostgresCluster, image: &str, mounts: Vec<VolumeMount>) -> Container {
    let name = cluster.name_any();
    let mut env_vars = vec![
        env("USE_PGBACKREST", "true"),
        env("MODE", "restore"),
        env("PGROOT", PGROOT),
        env("PGVERSION", cluster.spec.postgresql.version.clone()),
        env_restore_marker("RESTORE_COMMAND", &name, "restore_command"),
        env_restore_marker("RESTORE_ENABLE", &name, "restore_enable"),
        env_restore_marker("RESTORE_ID", &name, "restore_id"),
    ];
    if cluster.spec.has_pvc_repo() {
        env_vars.push(env("REPO_HOST", "true"));
    }

    Container {
        name: RESTORE_CONTAINER.to_string(),
        image: Some(image.to_string()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        env: Some(env_vars),
        volume_mounts: Some(mounts),
        security_context: Some(container_security_context()),
        ..Default::default()
    }
}

fn exporter_container(cluster_name: &str, image: &str) -> Container {
    Container {
        name: EXPORTER_CONTAINER.to_string(),
        image: Some(image.to_string()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        ports: Some(vec![ContainerPort {
            container_port: EXPORTER_PORT,
            name: Some("metrics".to_string()),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        env: Some(vec![
            env("DATA_SOURCE_URI", "localhost:5432/postgres?sslmode=disable"),
            env("DATA_SOURCE_USER", MONITORING_USER),
            env_secret(
                "DATA_SOURCE_PASS",
                credential_secret_name(MONITORING_USER, cluster_name),
                "password",
            ),
        ]),
        security_context: Some(container_security_context()),
        ..Default::default()
    }
}

/// Cluster annotations propagated to the StatefulSet
pub fn inherited_annotations(
    cluster: &PostgresCluster,
    config: &OperatorConfig,
) -> BTreeMap<String, String> {
    cluster
        .annotations()
        .iter()
        .filter(|(key, _)| config.inherited_annotations.contains(key))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Generate the database StatefulSet
///
/// Every pod runs Spilo; Patroni decides which one is primary and labels
/// it through the Kubernetes API.
pub fn generate_statefulset(cluster: &PostgresCluster, config: &OperatorConfig) -> Result<StatefulSet> {
    let name = cluster.name_any();
    let spec = &cluster.spec;
    let labels = patroni_labels(&name);
    let image = spec
        .docker_image
        .clone()
        .unwrap_or_else(|| config.docker_image.clone());

    let mut volume_mounts = vec![mount(DATA_VOLUME, PGDATA_MOUNT)];
    if spec.wal_pvc.is_some() {
        volume_mounts.push(mount(&wal_volume_name(&name), WAL_MOUNT));
    }

    let mut volumes = Vec::new();
    let mut init_containers = Vec::new();
    if spec.pgbackrest().is_some() {
        volume_mounts.push(mount(CONFIG_VOLUME, PGBACKREST_CONFIG_MOUNT));
        volume_mounts.push(mount(CERT_VOLUME, PGBACKREST_CERT_MOUNT));
        volumes.push(config_volume(pgbackrest_configmap_name(&name)));
        volumes.push(cert_volume(&name));
        init_containers.push(restore_container(cluster, &image, volume_mounts.clone()));
    }

    let postgres = Container {
        name: POSTGRES_CONTAINER.to_string(),
        image: Some(image),
        image_pull_policy: Some("IfNotPresent".to_string()),
        ports: Some(vec![
            ContainerPort {
                container_port: 5432,
                name: Some("postgresql".to_string()),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            },
            ContainerPort {
                container_port: i32::from(PATRONI_PORT),
                name: Some("patroni".to_string()),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            },
        ]),
        env: Some(spilo_env(cluster, config)?),
        volume_mounts: Some(volume_mounts),
        resources: resource_requirements(spec.resources.as_ref()),
        readiness_probe: Some(patroni_probe("/readiness", 6, 3)),
        liveness_probe: Some(patroni_probe("/liveness", 30, 6)),
        security_context: Some(container_security_context()),
        ..Default::default()
    };

    let mut containers = vec![postgres];
    if let Some(monitoring) = &spec.monitoring {
        containers.push(exporter_container(&name, &monitoring.image));
    }

    let mut claim_templates = vec![volume_claim_template(DATA_VOLUME, &spec.volume)];
    if let Some(wal) = &spec.wal_pvc {
        claim_templates.push(volume_claim_template(&wal_volume_name(&name), wal));
    }

    let mut metadata = object_meta(cluster, name.clone(), labels.clone());
    metadata.annotations = non_empty(inherited_annotations(cluster, config));

    Ok(StatefulSet {
        metadata,
        spec: Some(StatefulSetSpec {
            service_name: Some(headless_service_name(&name)),
            replicas: Some(spec.number_of_instances),
            selector: LabelSelector {
                match_labels: Some(pod_selector(&name)),
                ..Default::default()
            },
            update_strategy: Some(StatefulSetUpdateStrategy {
                type_: Some("OnDelete".to_string()),
                rolling_update: None,
            }),
            pod_management_policy: Some("OrderedReady".to_string()),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    annotations: non_empty(spec.pod_annotations.clone()),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    init_containers: if init_containers.is_empty() {
                        None
                    } else {
                        Some(init_containers)
                    },
                    containers,
                    volumes: if volumes.is_empty() { None } else { Some(volumes) },
                    termination_grace_period_seconds: Some(300),
                    affinity: Some(generate_anti_affinity(&name)),
                    security_context: Some(pod_security_context()),
                    ..Default::default()
                }),
            },
            volume_claim_templates: Some(claim_templates),
            persistent_volume_claim_retention_policy: Some(retain_claims()),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Labels of the pgBackRest repo-host pod
pub fn repo_host_labels(cluster_name: &str) -> BTreeMap<String, String> {
    let mut labels = standard_labels(cluster_name);
    labels.insert(
        "app.kubernetes.io/component".to_string(),
        "pgbackrest-repo-host".to_string(),
    );
    labels
}

/// Selector of the repo-host pod; backup jobs exec into the pod it matches
pub(super) fn repo_host_selector(cluster_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (CLUSTER_LABEL.to_string(), cluster_name.to_string()),
        (
            "app.kubernetes.io/component".to_string(),
            "pgbackrest-repo-host".to_string(),
        ),
    ])
}

/// Generate the pgBackRest repo-host StatefulSet
///
/// Returns `None` when no repository is backed by a PVC.
pub fn generate_repo_host_statefulset(
    cluster: &PostgresCluster,
    config: &OperatorConfig,
) -> Result<Option<StatefulSet>> {
    let Some(pgbackrest) = cluster.spec.pgbackrest() else {
        return Ok(None);
    };
    if !cluster.spec.has_pvc_repo() {
        return Ok(None);
    }

    let name = cluster.name_any();
    let labels = repo_host_labels(&name);
    let image = pgbackrest
        .image
        .clone()
        .unwrap_or_else(|| config.pgbackrest_image.clone());

    let mut volume_mounts = Vec::new();
    let mut claim_templates = Vec::new();
    for (index, repo) in pgbackrest.repos.iter().enumerate() {
        if repo.storage != "pvc" {
            continue;
        }
        super::backup::repo_number(&repo.name)?;
        let volume = repo.volume.as_ref().ok_or_else(|| {
            Error::InvalidConfig(format!("pvc repository {} declares no volume", repo.name))
        })?;
        volume_mounts.push(mount(
            &repo.name,
            &format!("{REPO_HOST_DATA_MOUNT}/repo{}", index + 1),
        ));
        claim_templates.push(volume_claim_template(&repo.name, volume));
    }
    volume_mounts.push(mount(CONFIG_VOLUME, PGBACKREST_CONFIG_MOUNT));
    volume_mounts.push(mount(CERT_VOLUME, PGBACKREST_CERT_MOUNT));

    let container = Container {
        name: REPO_HOST_CONTAINER.to_string(),
        image: Some(image),
        image_pull_policy: Some("IfNotPresent".to_string()),
        env: Some(vec![env("MODE", "repo")]),
        volume_mounts: Some(volume_mounts),
        security_context: Some(container_security_context()),
        ..Default::default()
    };

    Ok(Some(StatefulSet {
        metadata: object_meta(cluster, repo_host_statefulset_name(&name), labels.clone()),
        spec: Some(StatefulSetSpec {
            service_name: Some(headless_service_name(&name)),
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(repo_host_selector(&name)),
                ..Default::default()
            },
            update_strategy: Some(StatefulSetUpdateStrategy {
                type_: Some("RollingUpdate".to_string()),
                rolling_update: None,
            }),
            pod_management_policy: Some("OrderedReady".to_string()),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes: Some(vec![
                        config_volume(repo_host_configmap_name(&name)),
                        cert_volume(&name),
                    ]),
                    security_context: Some(pod_security_context()),
                    ..Default::default()
                }),
            },
            volume_claim_templates: Some(claim_templates),
            persistent_volume_claim_retention_policy: Some(retain_claims()),
            ..Default::default()
        }),
        ..Default::default()
    }))
}
