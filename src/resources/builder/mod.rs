//! Desired-state builders
//!
//! Pure functions turning a [`PostgresCluster`] manifest and the
//! [`OperatorConfig`] into the Kubernetes objects the operator keeps in
//! sync. Nothing here talks to the API server; the controllers diff the
//! output against what is live.

mod backup;
mod pdb;
mod pooler;
mod secret;
mod service;
mod statefulset;
mod stream;

pub use backup::{
    generate_logical_backup_cronjob, generate_pgbackrest_configmap, generate_pgbackrest_cronjobs,
    generate_repo_host_configmap, generate_restore_configmap, repo_number, restore_command,
};
pub use pdb::generate_pdb;
pub use pooler::{generate_pooler_deployment, generate_pooler_service, pooler_labels};
pub use secret::{
    generate_credential_secret, generate_monitoring_secret, generate_password,
    generate_pgbackrest_cert_secret,
};
pub use service::{generate_endpoints, generate_headless_service, generate_service};
pub use statefulset::{
    desired_pg_parameters, desired_slots, generate_repo_host_statefulset, generate_statefulset,
    repo_host_labels, spilo_configuration,
};
pub use stream::{generate_event_stream, stream_slot_name};

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ResourceRequirements as K8sResourceRequirements;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::ResourceExt;
use kube::core::ObjectMeta;

use crate::crd::{PostgresCluster, ResourceList, ResourceRequirements};
use crate::resources::common::owner_reference;

/// Metadata shared by every generated object: name, namespace, labels and
/// the controller owner reference
fn object_meta(
    cluster: &PostgresCluster,
    name: impl Into<String>,
    labels: BTreeMap<String, String>,
) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.into()),
        namespace: cluster.namespace(),
        labels: Some(labels),
        owner_references: Some(vec![owner_reference(cluster)]),
        ..Default::default()
    }
}

fn quantities(list: &ResourceList) -> BTreeMap<String, Quantity> {
    let mut map = BTreeMap::new();
    if let Some(cpu) = &list.cpu {
        map.insert("cpu".to_string(), Quantity(cpu.clone()));
    }
    if let Some(memory) = &list.memory {
        map.insert("memory".to_string(), Quantity(memory.clone()));
    }
    map
}

fn resource_requirements(resources: Option<&ResourceRequirements>) -> Option<K8sResourceRequirements> {
    resources.map(|r| K8sResourceRequirements {
        limits: r.limits.as_ref().map(quantities),
        requests: r.requests.as_ref().map(quantities),
        ..Default::default()
    })
}

/// `None` for empty maps so generated objects compare equal to what the
/// API server returns
fn non_empty(map: BTreeMap<String, String>) -> Option<BTreeMap<String, String>> {
    if map.is_empty() { None } else { Some(map) }
}
