//! One sync pass over a cluster
//!
//! [`ClusterSync::sync`] walks [`SyncStep::ORDER`] while the caller holds
//! the cluster's lock. Each step either runs, is skipped because its
//! preconditions do not hold, or fails; the step's severity decides
//! whether a failure aborts the pass.

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use kube::runtime::events::EventType;
use tracing::{debug, info, instrument, warn};

use crate::config::{MajorUpgradeMode, OperatorConfig};
use crate::controller::cluster_state::ClusterState;
use crate::controller::context::Context;
use crate::controller::error::{Error, Result};
use crate::controller::steps::{StepOutcome, SyncStep};
use crate::crd::{ClusterPhase, PostgresCluster, PostgresClusterSpec};
use crate::resources::common::pod_selector;
use crate::store::ResourceStore;

/// A sync pass borrowing the shared context, the manifest and the
/// exclusively locked cluster state
pub struct ClusterSync<'a, S: ResourceStore> {
    pub(crate) ctx: &'a Context<S>,
    pub(crate) cluster: &'a PostgresCluster,
    pub(crate) state: &'a mut ClusterState,
}

impl<'a, S: ResourceStore> ClusterSync<'a, S> {
    pub fn new(ctx: &'a Context<S>, cluster: &'a PostgresCluster, state: &'a mut ClusterState) -> Self {
        state.namespace = cluster.namespace().unwrap_or_default();
        state.name = cluster.name_any();
        state.status = cluster.status.clone().unwrap_or_default();
        Self { ctx, cluster, state }
    }

    pub(crate) fn store(&self) -> &S {
        &self.ctx.store
    }

    pub(crate) fn config(&self) -> &OperatorConfig {
        &self.ctx.config
    }

    pub(crate) fn spec(&self) -> &PostgresClusterSpec {
        &self.cluster.spec
    }

    pub(crate) fn namespace(&self) -> &str {
        &self.state.namespace
    }

    pub(crate) fn name(&self) -> &str {
        &self.state.name
    }

    /// Database pods of the cluster, ordered by name
    pub(crate) async fn list_pods(&self) -> Result<Vec<Pod>> {
        let mut pods: Vec<Pod> = self
            .store()
            .list(self.namespace(), &pod_selector(self.name()))
            .await?;
        pods.sort_by_key(|p| p.name_any());
        Ok(pods)
    }

    /// Events are informational; failing to record one never fails a step
    pub(crate) async fn event(&self, type_: EventType, reason: &str, note: &str) {
        if let Err(e) = self
            .store()
            .record_event(self.cluster, type_, reason, note)
            .await
        {
            debug!(reason, error = %e, "could not record event");
        }
    }

    /// Run every step in order
    #[instrument(skip(self), fields(namespace = %self.state.namespace, name = %self.state.name))]
    pub async fn sync(&mut self) -> Result<()> {
        for step in SyncStep::ORDER {
            let outcome = match self.skip_reason(step) {
                Some(reason) => StepOutcome::Skipped(reason),
                None => {
                    debug!(%step, "running sync step");
                    StepOutcome::classify(step, self.run_step(step).await)
                }
            };

            match outcome {
                StepOutcome::Ok => {}
                StepOutcome::Skipped(reason) => debug!(%step, reason, "sync step skipped"),
                StepOutcome::Soft(e) => {
                    self.count_failure(step);
                    warn!(%step, error = %e, "sync step failed, continuing");
                    self.event(EventType::Warning, "SyncStepFailed", &e.to_string())
                        .await;
                }
                StepOutcome::Fatal(e) => {
                    self.count_failure(step);
                    warn!(%step, error = %e, "error while syncing cluster state");
                    self.record_failure(&e).await;
                    return Err(e);
                }
            }
        }

        self.set_phase(ClusterPhase::Running).await?;
        info!("cluster is in sync");
        Ok(())
    }

    fn count_failure(&self, step: SyncStep) {
        if let Some(health) = &self.ctx.health_state {
            health.metrics.record_step_failure(step.as_str());
        }
    }

    async fn record_failure(&mut self, error: &Error) {
        self.event(EventType::Warning, "SyncFailed", &error.to_string())
            .await;
        let phase = match self.state.status.phase {
            ClusterPhase::Creating => ClusterPhase::CreateFailed,
            ClusterPhase::Updating => ClusterPhase::UpdateFailed,
            _ => ClusterPhase::SyncFailed,
        };
        if let Err(e) = self.set_failed_phase(phase, error).await {
            warn!(error = %e, "could not record failed status");
        }
    }

    /// Why a step does not apply to this pass, if it doesn't
    fn skip_reason(&self, step: SyncStep) -> Option<&'static str> {
        let spec = self.spec();
        match step {
            SyncStep::LogicalBackup if spec.number_of_instances <= 0 => {
                Some("cluster has no instances")
            }
            SyncStep::DatabaseObjects => {
                if !self.config().enable_database_access {
                    Some("database access disabled")
                } else if spec.number_of_instances <= 0 {
                    Some("cluster has no instances")
                } else if spec.is_standby() {
                    Some("standby cluster")
                } else if self.state.restore_in_progress() {
                    Some("restore in progress")
                } else {
                    None
                }
            }
            SyncStep::Streams if spec.streams.is_empty() => Some("no streams declared"),
            SyncStep::Restore if !self.restore_requested() => Some("no restore requested"),
            SyncStep::MajorVersionUpgrade
                if self.config().major_version_upgrade_mode == MajorUpgradeMode::Off =>
            {
                Some("major version upgrades disabled")
            }
            _ => None,
        }
    }

    /// A restore is outstanding or the manifest asks for one not yet done
    pub(crate) fn restore_requested(&self) -> bool {
        if self.state.restore_in_progress() {
            return true;
        }
        match self.spec().restore_id() {
            Some(id) => self.state.status.restore_id.as_deref() != Some(id),
            None => false,
        }
    }

    async fn run_step(&mut self, step: SyncStep) -> Result<()> {
        match step {
            SyncStep::RefreshRestoreMarker => {
                self.refresh_status().await?;
                self.refresh_restore_marker().await
            }
            SyncStep::InitRoles => self.init_roles().await,
            SyncStep::Secrets => self.sync_secrets().await,
            SyncStep::Services => self.sync_services().await,
            SyncStep::BackupConfig => self.sync_backup_config().await,
            SyncStep::Volumes => self.sync_volumes().await,
            SyncStep::StatefulSet => self.sync_statefulset().await,
            SyncStep::PodDisruptionBudget => self.sync_pod_disruption_budget().await,
            SyncStep::LogicalBackup => self.sync_logical_backup_job().await,
            SyncStep::PhysicalBackupSchedules => self.sync_backup_schedules().await,
            SyncStep::DatabaseObjects => self.sync_database_objects().await,
            SyncStep::ConnectionPooler => self.sync_connection_pooler().await,
            SyncStep::MonitoringSecret => self.sync_monitoring_secret().await,
            SyncStep::WalVolumes => self.sync_wal_volumes().await,
            SyncStep::Streams => self.sync_streams().await,
            SyncStep::Restore => self.process_restore().await,
            SyncStep::MajorVersionUpgrade => self.major_version_upgrade().await,
        }
    }
}
