//! Keeps Patroni's dynamic configuration in line with the manifest
//!
//! The configuration lives in the DCS, so one successful `PATCH /config`
//! reaches every member. Pods are tried in order until one accepts the
//! patch. Members that report a pending restart afterwards are restarted,
//! replicas first unless lowered parameters require the primary to go
//! first.

use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use crate::config::OperatorConfig;
use crate::crd::{PatroniSpec, PostgresCluster};
use crate::resources::builder::{desired_pg_parameters, desired_slots};
use crate::resources::patroni::{PatroniApi, PatroniConfig, PatroniConfigDelta, is_dcs_parameter};

/// Parameters whose value on a replica must not be lower than on the
/// primary; lowering them restarts the primary first
pub const PRIMARY_FIRST_WHEN_DECREASED: [&str; 5] = [
    "max_connections",
    "max_prepared_transactions",
    "max_locks_per_transaction",
    "max_worker_processes",
    "max_wal_senders",
];

/// Extra wait on top of `loop_wait` for members to apply a change
const APPLY_GRACE: Duration = Duration::from_secs(2);

/// Patroni settings the cluster should run with
#[derive(Clone, Debug, Default)]
pub struct DesiredPatroni {
    pub patroni: PatroniSpec,
    pub failsafe_mode: Option<bool>,
    pub parameters: BTreeMap<String, String>,
    pub slots: BTreeMap<String, BTreeMap<String, String>>,
}

/// Delta to push and whether it needs the primary restarted first
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConfigChange {
    pub delta: PatroniConfigDelta,
    pub primary_restart_required: bool,
}

impl DesiredPatroni {
    pub fn from_cluster(cluster: &PostgresCluster, config: &OperatorConfig) -> Self {
        Self {
            patroni: cluster.spec.patroni.clone(),
            failsafe_mode: cluster
                .spec
                .patroni
                .failsafe_mode
                .or(config.patroni_failsafe_mode),
            parameters: desired_pg_parameters(cluster),
            slots: desired_slots(cluster),
        }
    }

    /// Compare with the effective configuration. `managed_slots` are the
    /// slots this operator added earlier; only those are ever removed.
    pub fn config_change(
        &self,
        current: &PatroniConfig,
        managed_slots: &BTreeMap<String, BTreeMap<String, String>>,
    ) -> ConfigChange {
        let desired = &self.patroni;
        let mut delta = PatroniConfigDelta::default();

        if desired.loop_wait != 0 && desired.loop_wait != current.loop_wait {
            delta.loop_wait = Some(desired.loop_wait);
        }
        if desired.ttl != 0 && desired.ttl != current.ttl {
            delta.ttl = Some(desired.ttl);
        }
        if desired.retry_timeout != 0 && desired.retry_timeout != current.retry_timeout {
            delta.retry_timeout = Some(desired.retry_timeout);
        }
        if desired.maximum_lag_on_failover != 0.0
            && desired.maximum_lag_on_failover != current.maximum_lag_on_failover
        {
            delta.maximum_lag_on_failover = Some(desired.maximum_lag_on_failover);
        }
        if desired.synchronous_mode != current.synchronous_mode {
            delta.synchronous_mode = Some(desired.synchronous_mode);
        }
        if desired.synchronous_mode_strict != current.synchronous_mode_strict {
            delta.synchronous_mode_strict = Some(desired.synchronous_mode_strict);
        }
        if let Some(failsafe) = self.failsafe_mode
            && current.failsafe_mode != Some(failsafe)
        {
            delta.failsafe_mode = Some(failsafe);
        }
        if let Some(pg_hba) = &desired.pg_hba
            && *pg_hba != current.pg_hba
        {
            delta.pg_hba = Some(pg_hba.clone());
        }

        for (name, slot) in &self.slots {
            if current.slots.get(name) != Some(slot) {
                delta.slots.insert(name.clone(), Some(slot.clone()));
            }
        }
        for name in managed_slots.keys() {
            if !self.slots.contains_key(name) && current.slots.contains_key(name) {
                delta.slots.insert(name.clone(), None);
            }
        }

        // Changed parameters vote, except primary-first ones with a
        // non-numeric value; only a unanimous vote for a lowered
        // primary-first parameter restarts the primary first
        let mut votes = Vec::new();
        for (name, value) in &self.parameters {
            if !is_dcs_parameter(name) {
                continue;
            }
            let effective = current.postgresql.parameters.get(name);
            if effective == Some(value) {
                continue;
            }
            delta.set_parameter(name, value);
            if !PRIMARY_FIRST_WHEN_DECREASED.contains(&name.as_str()) {
                votes.push(false);
                continue;
            }
            // A value that is not a number casts no vote
            let old = effective.and_then(|v| v.parse::<i64>().ok());
            if let (Some(old), Ok(new)) = (old, value.parse::<i64>()) {
                votes.push(new < old);
            }
        }
        let primary_restart_required = !votes.is_empty()
            && votes.iter().all(|v| *v)
            && !delta.has_consensus_changes();

        ConfigChange {
            delta,
            primary_restart_required,
        }
    }
}

/// What a Patroni sync pass did
#[derive(Debug, Default)]
pub struct PatroniSyncResult {
    /// A configuration patch was accepted
    pub patched: bool,
    pub primary_restart_required: bool,
    /// How long members need to apply a change
    pub wait_interval: Duration,
    /// At least one member answered
    pub reached_any: bool,
    /// A member that needed a restart could not be restarted
    pub restart_failed: bool,
    pub errors: Vec<String>,
}

impl PatroniSyncResult {
    /// Pod recreation must wait for a pass where Patroni is reachable and
    /// every pending restart went through
    pub fn postpone_pod_recreation(&self, pod_count: usize) -> bool {
        (pod_count > 0 && !self.reached_any) || self.restart_failed
    }
}

pub struct PatroniSynchronizer<'a> {
    api: &'a dyn PatroniApi,
    desired: DesiredPatroni,
}

impl<'a> PatroniSynchronizer<'a> {
    pub fn new(api: &'a dyn PatroniApi, desired: DesiredPatroni) -> Self {
        Self { api, desired }
    }

    /// Push configuration changes through the first member that accepts
    /// them
    pub async fn sync(
        &self,
        pods: &[Pod],
        managed_slots: &mut BTreeMap<String, BTreeMap<String, String>>,
    ) -> PatroniSyncResult {
        let mut result = PatroniSyncResult {
            wait_interval: Duration::from_secs(u64::from(self.desired.patroni.loop_wait))
                + APPLY_GRACE,
            ..Default::default()
        };

        for pod in pods {
            let name = pod.name_any();
            let current = match self.api.get_config(pod).await {
                Ok(current) => current,
                Err(e) => {
                    debug!(pod = %name, error = %e, "could not read Patroni config");
                    result.errors.push(format!("{name}: {e}"));
                    continue;
                }
            };
            result.reached_any = true;
            if current.is_empty() {
                debug!(pod = %name, "Patroni config not yet initialized");
                continue;
            }
            result.wait_interval =
                Duration::from_secs(u64::from(current.loop_wait)) + APPLY_GRACE;

            let change = self.desired.config_change(&current, managed_slots);
            if change.delta.is_empty() {
                *managed_slots = self.desired.slots.clone();
                break;
            }
            match self.api.set_config(pod, &change.delta).await {
                Ok(()) => {
                    info!(pod = %name, "patched Patroni configuration");
                    result.patched = true;
                    result.primary_restart_required = change.primary_restart_required;
                    *managed_slots = self.desired.slots.clone();
                    // Members pick the change up on their next loop
                    tokio::time::sleep(result.wait_interval).await;
                    break;
                }
                Err(e) => {
                    warn!(pod = %name, error = %e, "could not patch Patroni config");
                    result.errors.push(format!("{name}: {e}"));
                }
            }
        }

        result
    }

    /// Restart members reporting `pending_restart`: replicas first unless
    /// `primary_first`, sleeping `wait` after each restart
    pub async fn restart_pending(
        &self,
        pods: &[Pod],
        wait: Duration,
        primary_first: bool,
        result: &mut PatroniSyncResult,
    ) {
        let mut primaries = Vec::new();
        let mut replicas = Vec::new();
        for pod in pods {
            match self.api.get_member(pod).await {
                Ok(member) if member.pending_restart => {
                    if member.is_primary() {
                        primaries.push(pod);
                    } else {
                        replicas.push(pod);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(pod = %pod.name_any(), error = %e, "could not read Patroni member status");
                    result.errors.push(format!("{}: {e}", pod.name_any()));
                }
            }
        }

        let order = if primary_first {
            [primaries, replicas]
        } else {
            [replicas, primaries]
        };
        for pod in order.into_iter().flatten() {
            let name = pod.name_any();
            match self.api.restart(pod).await {
                Ok(()) => {
                    info!(pod = %name, "restarted postgres to apply pending changes");
                    tokio::time::sleep(wait).await;
                }
                Err(e) => {
                    warn!(pod = %name, error = %e, "could not restart postgres");
                    result.restart_failed = true;
                    result.errors.push(format!("{name}: {e}"));
                }
            }
        }
    }
}
