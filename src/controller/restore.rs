//! Resumable restore from a pgBackRest backup
//!
//! A restore stops the cluster, records the request in the restore marker
//! ConfigMap, brings up the first pod alone so it restores the data
//! directory, then scales back out so replicas clone from it. The marker
//! is written before any pod can start the restore and is only removed
//! once every pod is ready, so the marker together with the recorded
//! restore ID is enough to resume after an operator restart.

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Pod};
use kube::ResourceExt;
use kube::runtime::events::EventType;
use tracing::{debug, info, instrument};

use crate::controller::error::{Error, Result};
use crate::controller::statefulset::is_pod_ready;
use crate::controller::sync::ClusterSync;
use crate::crd::{ClusterPhase, RestoreSpec};
use crate::resources::builder::generate_restore_configmap;
use crate::resources::common::{first_pod_name, restore_configmap_name};
use crate::store::{ResourceStore, StoreError, delete_if_exists};

/// Where a restore stands
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RestoreState {
    /// Nothing recorded for the current restore ID
    NotStarted,
    /// Cluster stopped and the request recorded
    Recording,
    /// The first pod is restoring from the repository
    PrimaryRestoring,
    /// Replicas are cloning from the restored primary
    ReplicasRestoring,
    Completed,
}

impl std::fmt::Display for RestoreState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RestoreState::NotStarted => "NotStarted",
            RestoreState::Recording => "Recording",
            RestoreState::PrimaryRestoring => "PrimaryRestoring",
            RestoreState::ReplicasRestoring => "ReplicasRestoring",
            RestoreState::Completed => "Completed",
        };
        f.write_str(s)
    }
}

/// Persisted facts the resume point is derived from
#[derive(Clone, Debug, Default)]
pub struct RestoreFacts<'a> {
    /// Restore ID the manifest asks for
    pub spec_id: Option<&'a str>,
    /// Restore ID recorded in the marker, if the marker exists
    pub marker_id: Option<&'a str>,
    pub marker_present: bool,
    /// Last completed restore
    pub status_id: Option<&'a str>,
    pub first_pod_ready: bool,
    pub replicas: i32,
    pub declared_instances: i32,
}

impl RestoreFacts<'_> {
    /// ID of the restore being processed: the manifest's, else the marker's
    pub fn current_id(&self) -> Option<&str> {
        self.spec_id.or(self.marker_id)
    }
}

/// Transitions of the restore sequence
pub struct RestoreStateMachine;

impl RestoreStateMachine {
    /// State to continue from
    pub fn resume_point(facts: &RestoreFacts<'_>) -> Result<RestoreState> {
        let current = facts.current_id().ok_or_else(|| {
            Error::ContractViolation("restore requested without a restore ID".to_string())
        })?;

        let marker_matches = facts.marker_present && facts.marker_id == Some(current);
        if !marker_matches {
            if facts.status_id == Some(current) && !facts.marker_present {
                return Ok(RestoreState::Completed);
            }
            return Ok(RestoreState::NotStarted);
        }
        if !facts.first_pod_ready {
            return Ok(RestoreState::Recording);
        }
        if facts.replicas != facts.declared_instances {
            return Ok(RestoreState::PrimaryRestoring);
        }
        Ok(RestoreState::ReplicasRestoring)
    }

    /// State after a successful transition out of `state`
    pub fn next(state: RestoreState) -> RestoreState {
        match state {
            RestoreState::NotStarted => RestoreState::Recording,
            RestoreState::Recording => RestoreState::PrimaryRestoring,
            RestoreState::PrimaryRestoring => RestoreState::ReplicasRestoring,
            RestoreState::ReplicasRestoring | RestoreState::Completed => RestoreState::Completed,
        }
    }
}

impl<S: ResourceStore> ClusterSync<'_, S> {
    /// Reload the restore marker; absence means no restore is in progress
    pub async fn refresh_restore_marker(&mut self) -> Result<()> {
        let marker = self
            .store()
            .get::<ConfigMap>(self.namespace(), &restore_configmap_name(self.name()))
            .await?;
        if let Some(marker) = &marker {
            debug!(restore_id = ?marker.data.as_ref().and_then(|d| d.get("restore_id")), "restore marker present");
        }
        self.state.restore_marker = marker;
        Ok(())
    }

    /// Restore request to act on. Once a marker records the manifest's
    /// ID, the request recorded on the marker is authoritative.
    fn current_restore(&self) -> Result<RestoreSpec> {
        let manifest = self.spec().restore().filter(|r| !r.id.is_empty());
        let recorded = match manifest {
            Some(restore) => self.state.marker_restore_id() == Some(restore.id.as_str()),
            None => true,
        };
        if recorded && let Some(raw) = self.state.marker_restore_spec() {
            return serde_json::from_str(raw).map_err(|e| {
                Error::InvalidRestoreSpec(format!("restore marker annotation does not parse: {e}"))
            });
        }
        manifest.cloned().ok_or_else(|| {
            Error::ContractViolation("restore requested without a restore ID".to_string())
        })
    }

    async fn restore_facts_snapshot(&self) -> Result<(bool, i32)> {
        let first_pod_ready = self
            .store()
            .get::<Pod>(self.namespace(), &first_pod_name(self.name()))
            .await?
            .is_some_and(|p| is_pod_ready(&p));
        let replicas = self
            .store()
            .get::<StatefulSet>(self.namespace(), self.name())
            .await?
            .and_then(|s| s.spec)
            .and_then(|s| s.replicas)
            .unwrap_or_default();
        Ok((first_pod_ready, replicas))
    }

    /// Where the restore for the current ID stands
    pub async fn restore_resume_point(&self) -> Result<RestoreState> {
        let (first_pod_ready, replicas) = self.restore_facts_snapshot().await?;
        let facts = RestoreFacts {
            spec_id: self.spec().restore_id(),
            marker_id: self.state.marker_restore_id(),
            marker_present: self.state.restore_in_progress(),
            status_id: self.state.status.restore_id.as_deref(),
            first_pod_ready,
            replicas,
            declared_instances: self.spec().number_of_instances,
        };
        RestoreStateMachine::resume_point(&facts)
    }

    /// Perform the single transition out of `state`
    #[instrument(skip(self), fields(%state))]
    pub async fn restore_step(&mut self, state: RestoreState) -> Result<RestoreState> {
        let restore = self.current_restore()?;
        match state {
            RestoreState::NotStarted => {
                info!(restore_id = %restore.id, repo = %restore.repo, "starting restore");
                self.event(
                    EventType::Normal,
                    "Restore",
                    &format!("restoring backup {} from {}", restore.id, restore.repo),
                )
                .await;
                let marker = generate_restore_configmap(self.cluster, &restore)?;
                self.stop_cluster().await?;
                self.record_restore(marker).await?;
            }
            RestoreState::Recording => {
                self.set_phase(ClusterPhase::Restoring).await?;
                let replicas = self
                    .state
                    .statefulset
                    .as_ref()
                    .and_then(|s| s.spec.as_ref())
                    .and_then(|s| s.replicas);
                if replicas != Some(1) {
                    self.scale_statefulset(1).await?;
                }
            }
            RestoreState::PrimaryRestoring => {
                self.wait_for_pod_ready(&first_pod_name(self.name()), None)
                    .await?;
                info!("primary restored, scaling out replicas");
                self.scale_statefulset(self.spec().number_of_instances)
                    .await?;
            }
            RestoreState::ReplicasRestoring => {
                self.wait_for_statefulset_pods_ready().await?;
                self.set_restore_id(&restore.id).await?;
                delete_if_exists::<ConfigMap, _>(
                    self.store(),
                    self.namespace(),
                    &restore_configmap_name(self.name()),
                )
                .await?;
                self.state.restore_marker = None;
                info!(restore_id = %restore.id, "restore completed");
                self.event(
                    EventType::Normal,
                    "Restore",
                    &format!("restore {} completed", restore.id),
                )
                .await;
            }
            RestoreState::Completed => {}
        }
        Ok(RestoreStateMachine::next(state))
    }

    /// Step until the restore completes or a step fails
    pub(crate) async fn drive_restore(&mut self) -> Result<()> {
        let mut state = self.restore_resume_point().await?;
        debug!(%state, "resuming restore");
        while state != RestoreState::Completed {
            state = self.restore_step(state).await?;
        }
        Ok(())
    }

    pub(crate) async fn process_restore(&mut self) -> Result<()> {
        self.drive_restore().await
    }

    /// Scale to zero and delete every database pod
    async fn stop_cluster(&mut self) -> Result<()> {
        self.scale_statefulset(0).await?;
        for pod in self.list_pods().await? {
            delete_if_exists::<Pod, _>(self.store(), self.namespace(), &pod.name_any()).await?;
        }
        info!("cluster stopped for restore");
        Ok(())
    }

    /// Persist the marker; a stale marker for another ID is overwritten
    async fn record_restore(&mut self, marker: ConfigMap) -> Result<()> {
        let stored = match self.store().create(&marker).await {
            Ok(created) => created,
            Err(StoreError::AlreadyExists(_)) => {
                let mut replacement = marker;
                replacement.metadata.resource_version = self
                    .store()
                    .get::<ConfigMap>(self.namespace(), &restore_configmap_name(self.name()))
                    .await?
                    .and_then(|cm| cm.metadata.resource_version);
                self.store().update(&replacement).await?
            }
            Err(e) => return Err(e.into()),
        };
        self.state.restore_marker = Some(stored);
        Ok(())
    }
}
