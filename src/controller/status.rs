//! Cluster phase and conditions
//!
//! The status subresource is written only when the phase, the restore ID or
//! the observed generation actually changes, so a converged cluster sees no
//! status writes.

use chrono::Utc;

use crate::controller::error::{Error, Result};
use crate::controller::sync::ClusterSync;
use crate::crd::{ClusterPhase, Condition, PostgresCluster};
use crate::store::ResourceStore;

/// Condition types kept on every cluster
pub mod condition_types {
    pub const READY: &str = "Ready";
    /// Created, updated or restored right now
    pub const PROGRESSING: &str = "Progressing";
    /// The last pass failed
    pub const DEGRADED: &str = "Degraded";
}

/// Conditions of one cluster, updated in place
pub struct PhaseConditions {
    conditions: Vec<Condition>,
    generation: Option<i64>,
}

impl PhaseConditions {
    pub fn new(existing: Vec<Condition>, generation: Option<i64>) -> Self {
        Self {
            conditions: existing,
            generation,
        }
    }

    /// Upsert one condition. `lastTransitionTime` only moves when the
    /// status flips.
    pub fn set(&mut self, type_: &str, value: bool, reason: &str, message: &str) {
        let status = if value { "True" } else { "False" };
        let now = Utc::now().to_rfc3339();
        match self.conditions.iter_mut().find(|c| c.type_ == type_) {
            Some(condition) => {
                if condition.status != status {
                    condition.status = status.to_string();
                    condition.last_transition_time = now;
                }
                condition.reason = reason.to_string();
                condition.message = message.to_string();
                condition.observed_generation = self.generation;
            }
            None => self.conditions.push(Condition {
                type_: type_.to_string(),
                status: status.to_string(),
                reason: reason.to_string(),
                message: message.to_string(),
                last_transition_time: now,
                observed_generation: self.generation,
            }),
        }
    }

    /// Derive all three conditions from a phase
    pub fn apply_phase(mut self, phase: ClusterPhase, message: &str) -> Vec<Condition> {
        use condition_types::*;

        let reason = phase.to_string();
        match phase {
            ClusterPhase::Running => {
                self.set(READY, true, "ClusterSynced", "All resources are in the desired state");
                self.set(PROGRESSING, false, "Stable", "Cluster is stable");
                self.set(DEGRADED, false, "Healthy", "Cluster is healthy");
            }
            ClusterPhase::Creating | ClusterPhase::Updating | ClusterPhase::Restoring => {
                self.set(READY, false, &reason, message);
                self.set(PROGRESSING, true, &reason, message);
                self.set(DEGRADED, false, "NotDegraded", "No failure recorded");
            }
            ClusterPhase::SyncFailed | ClusterPhase::CreateFailed | ClusterPhase::UpdateFailed => {
                self.set(READY, false, &reason, message);
                self.set(PROGRESSING, false, "Failed", message);
                self.set(DEGRADED, true, &reason, message);
            }
            ClusterPhase::Pending | ClusterPhase::Deleting => {
                self.set(READY, false, &reason, message);
            }
        }
        self.conditions
    }
}

impl<S: ResourceStore> ClusterSync<'_, S> {
    /// Adopt the status of the live object. The watch cache can lag behind
    /// this operator's own status writes, and acting on a stale `restoreId`
    /// would start a finished restore again.
    pub async fn refresh_status(&mut self) -> Result<()> {
        if let Some(live) = self
            .store()
            .get::<PostgresCluster>(self.namespace(), self.name())
            .await?
        {
            self.state.status = live.status.unwrap_or_default();
        }
        Ok(())
    }

    /// Move to `phase`; writes nothing when the phase and observed
    /// generation are already current
    pub(crate) async fn set_phase(&mut self, phase: ClusterPhase) -> Result<()> {
        let generation = self.cluster.metadata.generation;
        if self.state.status.phase == phase && self.state.status.observed_generation == generation {
            return Ok(());
        }
        self.write_phase(phase, &format!("Cluster is {phase}")).await
    }

    /// Record a failed phase with the error as the condition message
    pub(crate) async fn set_failed_phase(&mut self, phase: ClusterPhase, error: &Error) -> Result<()> {
        self.write_phase(phase, &error.to_string()).await
    }

    async fn write_phase(&mut self, phase: ClusterPhase, message: &str) -> Result<()> {
        let generation = self.cluster.metadata.generation;
        let mut status = self.state.status.clone();
        status.conditions =
            PhaseConditions::new(status.conditions, generation).apply_phase(phase, message);
        status.phase = phase;
        status.observed_generation = generation;

        self.store().patch_status(self.cluster, &status).await?;
        tracing::debug!(%phase, "status updated");
        self.state.status = status;
        Ok(())
    }

    /// Record the last completed restore
    pub(crate) async fn set_restore_id(&mut self, restore_id: &str) -> Result<()> {
        if self.state.status.restore_id.as_deref() == Some(restore_id) {
            return Ok(());
        }
        let mut status = self.state.status.clone();
        status.restore_id = Some(restore_id.to_string());
        self.store().patch_status(self.cluster, &status).await?;
        self.state.status = status;
        Ok(())
    }
}
