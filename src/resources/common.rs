//! Common names, labels and ownership helpers
//!
//! Every object the operator creates for a cluster is named and labelled
//! through this module so the controllers and the builders agree.

use std::collections::BTreeMap;

use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::ResourceExt;

use crate::crd::PostgresCluster;

/// API version for PostgresCluster CRD
pub const API_VERSION: &str = "pgcluster.io/v1";

/// Kind for PostgresCluster CRD
pub const KIND: &str = "PostgresCluster";

/// Field manager and event reporter name
pub const FIELD_MANAGER: &str = "pg-cluster-operator";

/// Label carrying the owning cluster's name on every child object
pub const CLUSTER_LABEL: &str = "pgcluster.io/cluster";

/// Patroni scope label (`KUBERNETES_SCOPE_LABEL`)
pub const CLUSTER_NAME_LABEL: &str = "cluster-name";

/// Set on pods that must be recreated; survives operator restarts
pub const ROLLING_UPDATE_ANNOTATION: &str = "pgcluster.io/rolling-update-required";

/// Annotation on the restore marker holding the restore request as JSON
pub const RESTORE_SPEC_ANNOTATION: &str = "InProgressRestoreSpec";

/// Name of the database container in every Spilo pod
pub const POSTGRES_CONTAINER: &str = "postgres";

/// Role used by the metrics exporter sidecar
pub const MONITORING_USER: &str = "cpo_exporter";

/// Login role of the connection pooler
pub const POOLER_USER: &str = "pooler";

/// Role the change data capture consumers connect as
pub const STREAM_USER: &str = "fes_user";

/// Backup types a pgBackRest repository may schedule
pub const BACKUP_TYPES: [&str; 3] = ["full", "incr", "diff"];

/// Repository names pgBackRest accepts
pub const REPO_NAMES: [&str; 4] = ["repo1", "repo2", "repo3", "repo4"];

/// Generate an owner reference for a PostgresCluster
///
/// This ensures that all child resources are properly owned by the cluster
/// and will be garbage collected when the cluster is deleted.
pub fn owner_reference(cluster: &PostgresCluster) -> OwnerReference {
    OwnerReference {
        api_version: API_VERSION.to_string(),
        kind: KIND.to_string(),
        name: cluster.name_any(),
        uid: cluster.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Labels on every object belonging to a cluster
pub fn standard_labels(cluster_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app.kubernetes.io/name".to_string(), cluster_name.to_string()),
        ("app.kubernetes.io/component".to_string(), "postgresql".to_string()),
        ("app.kubernetes.io/managed-by".to_string(), FIELD_MANAGER.to_string()),
        (CLUSTER_LABEL.to_string(), cluster_name.to_string()),
    ])
}

/// Labels for Patroni-managed pods
///
/// `application: spilo` and the scope label are how Patroni's Kubernetes
/// DCS finds the members of a cluster.
pub fn patroni_labels(cluster_name: &str) -> BTreeMap<String, String> {
    let mut labels = standard_labels(cluster_name);
    labels.insert("application".to_string(), "spilo".to_string());
    labels.insert(CLUSTER_NAME_LABEL.to_string(), cluster_name.to_string());
    labels
}

/// Labels selecting only the pods of the database StatefulSet
pub fn pod_selector(cluster_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("application".to_string(), "spilo".to_string()),
        (CLUSTER_NAME_LABEL.to_string(), cluster_name.to_string()),
    ])
}

/// Roles a Patroni member can hold
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PostgresRole {
    Master,
    Replica,
}

impl PostgresRole {
    pub const ALL: [PostgresRole; 2] = [PostgresRole::Master, PostgresRole::Replica];

    /// Value of the role label Spilo sets on its pod
    pub fn label_value(self) -> &'static str {
        match self {
            PostgresRole::Master => "master",
            PostgresRole::Replica => "replica",
        }
    }
}

impl std::fmt::Display for PostgresRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label_value())
    }
}

/// One value per [`PostgresRole`]
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RoleMap<T> {
    pub master: T,
    pub replica: T,
}

impl<T> RoleMap<T> {
    pub fn get(&self, role: PostgresRole) -> &T {
        match role {
            PostgresRole::Master => &self.master,
            PostgresRole::Replica => &self.replica,
        }
    }

    pub fn get_mut(&mut self, role: PostgresRole) -> &mut T {
        match role {
            PostgresRole::Master => &mut self.master,
            PostgresRole::Replica => &mut self.replica,
        }
    }
}

/// Service (and endpoint) name for a role
pub fn service_name(cluster_name: &str, role: PostgresRole) -> String {
    match role {
        PostgresRole::Master => cluster_name.to_string(),
        PostgresRole::Replica => format!("{cluster_name}-repl"),
    }
}

/// Headless service governing the StatefulSet
pub fn headless_service_name(cluster_name: &str) -> String {
    format!("{cluster_name}-clusterpods")
}

pub fn pdb_name(cluster_name: &str) -> String {
    format!("postgres-{cluster_name}-pdb")
}

/// Credentials secret for a role
pub fn credential_secret_name(username: &str, cluster_name: &str) -> String {
    format!("{}.{}.credentials", username.replace('_', "-"), cluster_name)
}

pub fn restore_configmap_name(cluster_name: &str) -> String {
    format!("{cluster_name}-pgbackrest-restore")
}

pub fn pgbackrest_configmap_name(cluster_name: &str) -> String {
    format!("{cluster_name}-pgbackrest-config")
}

pub fn repo_host_configmap_name(cluster_name: &str) -> String {
    format!("{cluster_name}-pgbackrest-repohost-config")
}

pub fn repo_host_statefulset_name(cluster_name: &str) -> String {
    format!("{cluster_name}-pgbackrest-repo-host")
}

pub fn pgbackrest_cert_secret_name(cluster_name: &str) -> String {
    format!("{cluster_name}-pgbackrest-cert")
}

pub fn logical_backup_job_name(cluster_name: &str) -> String {
    trim_cronjob_name(&format!("logical-backup-{cluster_name}"))
}

pub fn backup_cronjob_name(cluster_name: &str, repo: &str, backup_type: &str) -> String {
    trim_cronjob_name(&format!("pgbackrest-{cluster_name}-{repo}-{backup_type}"))
}

/// Volume claim template for the WAL volume; claims are named
/// `<template>-<statefulset>-<ordinal>`
pub fn wal_volume_name(cluster_name: &str) -> String {
    format!("{cluster_name}-wal")
}

pub fn pooler_name(cluster_name: &str, role: PostgresRole) -> String {
    match role {
        PostgresRole::Master => format!("{cluster_name}-pooler"),
        PostgresRole::Replica => format!("{cluster_name}-pooler-repl"),
    }
}

pub fn event_stream_name(cluster_name: &str, application_id: &str) -> String {
    format!("{cluster_name}-{application_id}")
}

/// Name of the first pod, which Patroni bootstraps as primary
pub fn first_pod_name(cluster_name: &str) -> String {
    format!("{cluster_name}-0")
}

/// CronJob names feed into Job and Pod names, which must stay under 63 characters
fn trim_cronjob_name(name: &str) -> String {
    const MAX_CRONJOB_NAME: usize = 52;
    name.chars()
        .take(MAX_CRONJOB_NAME)
        .collect::<String>()
        .trim_end_matches('-')
        .to_string()
}

/// Read a string value from a secret's data (or string data)
pub fn secret_value(secret: &Secret, key: &str) -> Option<String> {
    secret
        .data
        .as_ref()
        .and_then(|d| d.get(key))
        .and_then(|v| String::from_utf8(v.0.clone()).ok())
        .or_else(|| secret.string_data.as_ref().and_then(|d| d.get(key).cloned()))
}

/// Set a string value in a secret's data
pub fn set_secret_value(secret: &mut Secret, key: &str, value: &str) {
    secret
        .data
        .get_or_insert_with(BTreeMap::new)
        .insert(key.to_string(), ByteString(value.as_bytes().to_vec()));
}

/// Remove a key from a secret's data
pub fn remove_secret_value(secret: &mut Secret, key: &str) {
    if let Some(data) = secret.data.as_mut() {
        data.remove(key);
    }
}

/// Convert string pairs into secret data
pub fn secret_data(values: &BTreeMap<String, String>) -> BTreeMap<String, ByteString> {
    values
        .iter()
        .map(|(k, v)| (k.clone(), ByteString(v.as_bytes().to_vec())))
        .collect()
}
