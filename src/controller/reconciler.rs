//! Reconciliation entry points for PostgresCluster resources
//!
//! `reconcile` takes the cluster's lock, decides whether this is a create,
//! an update or a periodic sync, and runs one [`ClusterSync`] pass.

use std::sync::Arc;
use std::time::{Duration, Instant};

use kube::ResourceExt;
use kube::runtime::controller::Action;
use tracing::{debug, error, info, instrument, warn};

use crate::controller::context::Context;
use crate::controller::error::{BackoffConfig, Error, Result};
use crate::controller::sync::ClusterSync;
use crate::crd::{ClusterPhase, PostgresCluster, PostgresClusterStatus};
use crate::store::{ResourceStore, StoreError};

/// Finalizer name for cleanup
pub const FINALIZER: &str = "pgcluster.io/finalizer";

/// Main reconciliation function
#[instrument(skip(cluster, ctx), fields(name = %cluster.name_any(), namespace = cluster.namespace().unwrap_or_default()))]
pub async fn reconcile<S: ResourceStore>(cluster: Arc<PostgresCluster>, ctx: Arc<Context<S>>) -> Result<Action> {
    let ns = cluster.namespace().unwrap_or_default();
    let name = cluster.name_any();
    let started = Instant::now();

    if cluster.metadata.deletion_timestamp.is_some() {
        return handle_deletion(&cluster, &ctx).await;
    }

    if !has_finalizer(&cluster) {
        add_finalizer(&cluster, &ctx).await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    let state = ctx.registry.get_or_create(&ns, &name);
    let mut state = state.lock().await;
    let mut sync = ClusterSync::new(&ctx, &cluster, &mut state);
    sync.refresh_status().await?;

    match pass_phase(&sync.state.status, cluster.metadata.generation) {
        Some(phase) => {
            info!(%phase, generation = ?cluster.metadata.generation, "manifest changed");
            sync.set_phase(phase).await?;
        }
        None => debug!("periodic sync"),
    }

    let result = sync.sync().await;
    let instances = i64::from(cluster.spec.number_of_instances);
    let ready = state
        .statefulset
        .as_ref()
        .and_then(|sts| sts.status.as_ref())
        .and_then(|s| s.ready_replicas)
        .map(i64::from)
        .unwrap_or_default();
    drop(state);

    if let Some(health) = &ctx.health_state {
        let metrics = &health.metrics;
        metrics.record_reconcile(&ns, &name, started.elapsed().as_secs_f64());
        metrics.set_cluster_instances(&ns, &name, instances, ready);
        if result.is_err() {
            metrics.record_error(&ns, &name);
        }
    }

    match result {
        Ok(()) => {
            ctx.registry.reset_failures(&ns, &name);
            info!("reconciliation completed");
            Ok(Action::requeue(ctx.config.resync_period))
        }
        Err(e) => {
            error!(error = %e, "reconciliation failed");
            Err(e)
        }
    }
}

/// Phase announcing a create or an update before the pass runs; `None` for
/// periodic syncs of an unchanged manifest
fn pass_phase(status: &PostgresClusterStatus, generation: Option<i64>) -> Option<ClusterPhase> {
    match status.phase {
        ClusterPhase::Pending | ClusterPhase::Creating | ClusterPhase::CreateFailed => {
            Some(ClusterPhase::Creating)
        }
        _ if status.observed_generation != generation => {
            Some(ClusterPhase::Updating)
        }
        _ => None,
    }
}

/// Error policy for the controller with exponential backoff
pub fn error_policy<S: ResourceStore>(cluster: Arc<PostgresCluster>, error: &Error, ctx: Arc<Context<S>>) -> Action {
    let ns = cluster.namespace().unwrap_or_default();
    let name = cluster.name_any();
    let attempt = ctx.registry.record_failure(&ns, &name);
    let delay = BackoffConfig::default().delay_for_error(error, attempt);

    if error.is_retryable() {
        warn!(%ns, %name, attempt, error = %error, "retryable error, requeuing in {:?}", delay);
    } else {
        error!(%ns, %name, attempt, error = %error, "non-retryable error, requeuing in {:?}", delay);
    }
    Action::requeue(delay)
}

fn has_finalizer(cluster: &PostgresCluster) -> bool {
    cluster.finalizers().iter().any(|f| f == FINALIZER)
}

async fn set_finalizers<S: ResourceStore>(
    cluster: &PostgresCluster,
    ctx: &Context<S>,
    finalizers: Vec<String>,
) -> Result<()> {
    let patch = serde_json::from_value(serde_json::json!([
        { "op": "add", "path": "/metadata/finalizers", "value": finalizers }
    ]))?;
    let ns = cluster.namespace().unwrap_or_default();
    match ctx
        .store
        .patch::<PostgresCluster>(&ns, &cluster.name_any(), &patch)
        .await
    {
        Ok(_) | Err(StoreError::NotFound(_)) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn add_finalizer<S: ResourceStore>(cluster: &PostgresCluster, ctx: &Context<S>) -> Result<()> {
    let mut finalizers = cluster.finalizers().to_vec();
    finalizers.push(FINALIZER.to_string());
    set_finalizers(cluster, ctx, finalizers).await?;
    info!("added finalizer");
    Ok(())
}

/// Owned objects are garbage collected through their owner references;
/// only the in-memory state and the finalizer are ours to clean up
async fn handle_deletion<S: ResourceStore>(cluster: &PostgresCluster, ctx: &Context<S>) -> Result<Action> {
    let ns = cluster.namespace().unwrap_or_default();
    let name = cluster.name_any();
    info!("handling deletion");

    {
        let state = ctx.registry.get_or_create(&ns, &name);
        let mut state = state.lock().await;
        let mut sync = ClusterSync::new(ctx, cluster, &mut state);
        if let Err(e) = sync.set_phase(ClusterPhase::Deleting).await {
            debug!(error = %e, "could not record deleting phase");
        }
    }
    ctx.registry.remove(&ns, &name);

    if has_finalizer(cluster) {
        let finalizers = cluster
            .finalizers()
            .iter()
            .filter(|f| f.as_str() != FINALIZER)
            .cloned()
            .collect();
        set_finalizers(cluster, ctx, finalizers).await?;
        info!("removed finalizer");
    }
    Ok(Action::await_change())
}
