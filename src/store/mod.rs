//! Access to the namespaced Kubernetes objects a cluster is made of
//!
//! Controllers talk to the API server only through [`ResourceStore`], which
//! keeps "already exists" and "not found" as distinct outcomes so callers can
//! choose between adopting an existing object and creating a new one.

mod kube_store;

pub use kube_store::KubeStore;

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::future::Future;

use k8s_openapi::NamespaceResourceScope;
use kube::Resource;
use kube::runtime::events::EventType;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::crd::{PostgresCluster, PostgresClusterStatus};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("conflict on {0}")]
    Conflict(String),

    #[error("API error {code}: {message}")]
    Api { code: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// 5xx, 409 conflicts, 429 and network failures are worth another attempt
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Conflict(_) | StoreError::Transport(_) => true,
            StoreError::Api { code, .. } => *code >= 500 || *code == 429,
            StoreError::NotFound(_)
            | StoreError::AlreadyExists(_)
            | StoreError::Serialization(_) => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Namespaced Kubernetes kinds the store can hold
pub trait StoredResource:
    Resource<Scope = NamespaceResourceScope, DynamicType = ()>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<K> StoredResource for K where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// CRUD, JSON-patch, exec and event access to namespaced objects
pub trait ResourceStore: Send + Sync + 'static {
    /// Fetch an object; `Ok(None)` when it does not exist
    fn get<K: StoredResource>(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = StoreResult<Option<K>>> + Send;

    /// List objects carrying all of the given labels
    fn list<K: StoredResource>(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> impl Future<Output = StoreResult<Vec<K>>> + Send;

    /// Create an object in the namespace named by its metadata
    fn create<K: StoredResource>(&self, obj: &K) -> impl Future<Output = StoreResult<K>> + Send;

    /// Replace an existing object
    fn update<K: StoredResource>(&self, obj: &K) -> impl Future<Output = StoreResult<K>> + Send;

    /// Apply a JSON-patch document
    fn patch<K: StoredResource>(
        &self,
        namespace: &str,
        name: &str,
        patch: &json_patch::Patch,
    ) -> impl Future<Output = StoreResult<K>> + Send;

    /// Delete an object; `NotFound` when it is already gone
    fn delete<K: StoredResource>(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = StoreResult<()>> + Send;

    /// Delete an object but leave its dependents running
    fn delete_orphaning<K: StoredResource>(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = StoreResult<()>> + Send;

    /// Replace the status subresource of a cluster
    fn patch_status(
        &self,
        cluster: &PostgresCluster,
        status: &PostgresClusterStatus,
    ) -> impl Future<Output = StoreResult<()>> + Send;

    /// Run a command in a pod container and return its stdout
    fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: Vec<String>,
    ) -> impl Future<Output = StoreResult<String>> + Send;

    /// Emit a Kubernetes event on the cluster object
    fn record_event(
        &self,
        cluster: &PostgresCluster,
        type_: EventType,
        reason: &str,
        note: &str,
    ) -> impl Future<Output = StoreResult<()>> + Send;
}

/// Delete an object, treating "already gone" as success.
/// Returns whether anything was deleted.
pub async fn delete_if_exists<K, S>(store: &S, namespace: &str, name: &str) -> StoreResult<bool>
where
    K: StoredResource,
    S: ResourceStore,
{
    match store.delete::<K>(namespace, name).await {
        Ok(()) => Ok(true),
        Err(StoreError::NotFound(_)) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Create an object, adopting the existing one on a name collision
pub async fn create_or_adopt<K, S>(store: &S, obj: &K) -> StoreResult<K>
where
    K: StoredResource,
    S: ResourceStore,
{
    match store.create(obj).await {
        Ok(created) => Ok(created),
        Err(StoreError::AlreadyExists(what)) => {
            let namespace = obj.meta().namespace.clone().unwrap_or_default();
            let name = obj.meta().name.clone().unwrap_or_default();
            store
                .get::<K>(&namespace, &name)
                .await?
                .ok_or(StoreError::NotFound(what))
        }
        Err(e) => Err(e),
    }
}

/// Build a single-operation `replace` JSON patch
pub fn replace_patch(path: &str, value: serde_json::Value) -> StoreResult<json_patch::Patch> {
    serde_json::from_value(serde_json::json!([
        { "op": "replace", "path": path, "value": value }
    ]))
    .map_err(|e| StoreError::Serialization(e.to_string()))
}

/// Label selector string for list calls
pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}
