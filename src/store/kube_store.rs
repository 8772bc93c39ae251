use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, AttachParams, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource, ResourceExt};
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use crate::controller::error::{BackoffConfig, retry_with_backoff};
use crate::crd::{PostgresCluster, PostgresClusterStatus};
use crate::resources::common::FIELD_MANAGER;
use crate::store::{ResourceStore, StoreError, StoreResult, StoredResource, label_selector};

impl From<kube::Error> for StoreError {
    fn from(e: kube::Error) -> Self {
        match e {
            kube::Error::Api(ae) => match (ae.code, ae.reason.as_str()) {
                (404, _) => StoreError::NotFound(ae.message),
                (409, "AlreadyExists") => StoreError::AlreadyExists(ae.message),
                (409, _) => StoreError::Conflict(ae.message),
                (code, _) => StoreError::Api {
                    code,
                    message: ae.message,
                },
            },
            kube::Error::SerdeError(e) => StoreError::Serialization(e.to_string()),
            other => StoreError::Transport(other.to_string()),
        }
    }
}

/// [`ResourceStore`] backed by the Kubernetes API server
///
/// Every call is wrapped in bounded retry with exponential backoff.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    recorder: Recorder,
    backoff: BackoffConfig,
    attempts: u32,
}

impl KubeStore {
    pub fn new(client: Client, attempts: u32) -> Self {
        let reporter = Reporter {
            controller: FIELD_MANAGER.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client.clone(), reporter),
            client,
            backoff: BackoffConfig::for_api_calls(),
            attempts,
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn api<K: StoredResource>(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn namespace_of<K: Resource>(obj: &K) -> StoreResult<String> {
    obj.meta()
        .namespace
        .clone()
        .ok_or_else(|| StoreError::Serialization(format!("{} has no namespace", obj.name_any())))
}

impl ResourceStore for KubeStore {
    async fn get<K: StoredResource>(&self, namespace: &str, name: &str) -> StoreResult<Option<K>> {
        let api = self.api::<K>(namespace);
        retry_with_backoff(&self.backoff, self.attempts, "get", || async {
            api.get_opt(name).await.map_err(StoreError::from)
        })
        .await
    }

    async fn list<K: StoredResource>(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> StoreResult<Vec<K>> {
        let api = self.api::<K>(namespace);
        let params = ListParams::default().labels(&label_selector(labels));
        retry_with_backoff(&self.backoff, self.attempts, "list", || async {
            api.list(&params)
                .await
                .map(|list| list.items)
                .map_err(StoreError::from)
        })
        .await
    }

    async fn create<K: StoredResource>(&self, obj: &K) -> StoreResult<K> {
        let api = self.api::<K>(&namespace_of(obj)?);
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        let created = retry_with_backoff(&self.backoff, self.attempts, "create", || async {
            api.create(&params, obj).await.map_err(StoreError::from)
        })
        .await?;
        debug!(name = %created.name_any(), "created object");
        Ok(created)
    }

    async fn update<K: StoredResource>(&self, obj: &K) -> StoreResult<K> {
        let api = self.api::<K>(&namespace_of(obj)?);
        let name = obj.name_any();
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        retry_with_backoff(&self.backoff, self.attempts, "update", || async {
            api.replace(&name, &params, obj)
                .await
                .map_err(StoreError::from)
        })
        .await
    }

    async fn patch<K: StoredResource>(
        &self,
        namespace: &str,
        name: &str,
        patch: &json_patch::Patch,
    ) -> StoreResult<K> {
        let api = self.api::<K>(namespace);
        let params = PatchParams::default();
        retry_with_backoff(&self.backoff, self.attempts, "patch", || async {
            api.patch(name, &params, &Patch::<()>::Json(patch.clone()))
                .await
                .map_err(StoreError::from)
        })
        .await
    }

    async fn delete<K: StoredResource>(&self, namespace: &str, name: &str) -> StoreResult<()> {
        let api = self.api::<K>(namespace);
        let params = DeleteParams::background();
        retry_with_backoff(&self.backoff, self.attempts, "delete", || async {
            api.delete(name, &params)
                .await
                .map(|_| ())
                .map_err(StoreError::from)
        })
        .await
    }

    async fn delete_orphaning<K: StoredResource>(&self, namespace: &str, name: &str) -> StoreResult<()> {
        let api = self.api::<K>(namespace);
        let params = DeleteParams::orphan();
        retry_with_backoff(&self.backoff, self.attempts, "delete", || async {
            api.delete(name, &params)
                .await
                .map(|_| ())
                .map_err(StoreError::from)
        })
        .await
    }

    async fn patch_status(
        &self,
        cluster: &PostgresCluster,
        status: &PostgresClusterStatus,
    ) -> StoreResult<()> {
        let namespace = namespace_of(cluster)?;
        let api: Api<PostgresCluster> = Api::namespaced(self.client.clone(), &namespace);
        let name = cluster.name_any();
        let body = serde_json::json!({ "status": status });
        let params = PatchParams::apply(FIELD_MANAGER);
        retry_with_backoff(&self.backoff, self.attempts, "patch_status", || async {
            api.patch_status(&name, &params, &Patch::Merge(&body))
                .await
                .map(|_| ())
                .map_err(StoreError::from)
        })
        .await
    }

    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        command: Vec<String>,
    ) -> StoreResult<String> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = AttachParams {
            container: Some(container.to_string()),
            stdin: false,
            stdout: true,
            stderr: true,
            tty: false,
            ..Default::default()
        };

        let mut attached = pods.exec(pod, command, &params).await?;
        let mut stdout = String::new();
        if let Some(mut out) = attached.stdout() {
            out.read_to_string(&mut stdout)
                .await
                .map_err(|e| StoreError::Transport(e.to_string()))?;
        }
        let mut stderr = String::new();
        if let Some(mut err) = attached.stderr() {
            err.read_to_string(&mut stderr)
                .await
                .map_err(|e| StoreError::Transport(e.to_string()))?;
        }

        if let Some(status) = attached.take_status()
            && let Some(status) = status.await
            && status.status.as_deref() != Some("Success")
        {
            return Err(StoreError::Api {
                code: 500,
                message: if stderr.is_empty() {
                    format!("exec in {pod} failed: {:?}", status.message)
                } else {
                    stderr
                },
            });
        }

        Ok(stdout)
    }

    async fn record_event(
        &self,
        cluster: &PostgresCluster,
        type_: EventType,
        reason: &str,
        note: &str,
    ) -> StoreResult<()> {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note: Some(note.to_string()),
            action: "Sync".to_string(),
            secondary: None,
        };
        // Events are best effort
        if let Err(e) = self
            .recorder
            .publish(&event, &cluster.object_ref(&()))
            .await
        {
            warn!(reason, error = %e, "failed to publish event");
        }
        Ok(())
    }
}
