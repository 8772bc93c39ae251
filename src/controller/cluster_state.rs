//! In-memory view of each managed cluster
//!
//! A [`ClusterState`] is created on the first event for a cluster, refreshed
//! by every sync pass and dropped when the cluster is deleted. The registry
//! hands out one mutex per cluster; holding it is what serializes
//! overlapping reconciles of the same cluster.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Endpoints, Secret, Service};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use tokio::sync::Mutex;

use crate::controller::roles::RoleRegistry;
use crate::crd::PostgresClusterStatus;
use crate::resources::common::{RESTORE_SPEC_ANNOTATION, RoleMap};

/// Everything the operator last observed or decided about one cluster
#[derive(Clone, Debug, Default)]
pub struct ClusterState {
    pub namespace: String,
    pub name: String,
    pub statefulset: Option<StatefulSet>,
    pub services: RoleMap<Option<Service>>,
    pub endpoints: RoleMap<Option<Endpoints>>,
    /// Credential secrets keyed by secret name
    pub secrets: BTreeMap<String, Secret>,
    pub pdb: Option<PodDisruptionBudget>,
    /// Present while a restore is in progress
    pub restore_marker: Option<ConfigMap>,
    /// Replication slots declared in the manifest and pushed to Patroni
    pub replication_slots: BTreeMap<String, BTreeMap<String, String>>,
    pub roles: RoleRegistry,
    pub status: PostgresClusterStatus,
    /// Roles whose rotated predecessors may be due for removal
    pub retention_queue: Vec<String>,
    /// Password last set in the database, keyed by login name
    pub applied_passwords: BTreeMap<String, String>,
}

impl ClusterState {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn restore_in_progress(&self) -> bool {
        self.restore_marker.is_some()
    }

    /// Restore ID recorded in the marker
    pub fn marker_restore_id(&self) -> Option<&str> {
        self.restore_marker
            .as_ref()
            .and_then(|cm| cm.data.as_ref())
            .and_then(|d| d.get("restore_id"))
            .map(String::as_str)
            .filter(|id| !id.is_empty())
    }

    /// Restore specification JSON stored on the marker
    pub fn marker_restore_spec(&self) -> Option<&str> {
        self.restore_marker
            .as_ref()
            .and_then(|cm| cm.metadata.annotations.as_ref())
            .and_then(|a| a.get(RESTORE_SPEC_ANNOTATION))
            .map(String::as_str)
    }
}

type ClusterKey = (String, String);

/// Per-cluster state and locks, shared by all reconcile tasks
#[derive(Clone, Default)]
pub struct ClusterRegistry {
    clusters: Arc<RwLock<HashMap<ClusterKey, Arc<Mutex<ClusterState>>>>>,
    /// Consecutive failed passes, for requeue backoff
    failures: Arc<RwLock<HashMap<ClusterKey, u32>>>,
}

impl ClusterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// State of a cluster, created empty on first use
    pub fn get_or_create(&self, namespace: &str, name: &str) -> Arc<Mutex<ClusterState>> {
        let key = (namespace.to_string(), name.to_string());
        if let Some(entry) = self
            .clusters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            return entry.clone();
        }
        self.clusters
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(ClusterState::new(namespace, name))))
            .clone()
    }

    /// Forget a deleted cluster
    pub fn remove(&self, namespace: &str, name: &str) -> bool {
        let key = (namespace.to_string(), name.to_string());
        self.failures
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key);
        self.clusters
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key)
            .is_some()
    }

    /// Count a failed pass; returns the failures before this one
    pub fn record_failure(&self, namespace: &str, name: &str) -> u32 {
        let mut failures = self.failures.write().unwrap_or_else(PoisonError::into_inner);
        let count = failures
            .entry((namespace.to_string(), name.to_string()))
            .or_default();
        let previous = *count;
        *count = count.saturating_add(1);
        previous
    }

    pub fn reset_failures(&self, namespace: &str, name: &str) {
        self.failures
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(namespace.to_string(), name.to_string()));
    }

    pub fn len(&self) -> usize {
        self.clusters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
