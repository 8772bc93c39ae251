//! Probe and metrics endpoints
//!
//! `/healthz` answers as long as the process runs, `/readyz` once this
//! replica holds the lease and watches clusters, `/metrics` serves the
//! Prometheus registry.

use std::sync::Arc;

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use tokio::net::TcpListener;
use tokio::sync::RwLock;

/// Address the probe server binds to
pub const HEALTH_ADDR: &str = "0.0.0.0:8080";

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ClusterLabels {
    pub namespace: String,
    pub name: String,
}

impl ClusterLabels {
    fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StepLabels {
    pub step: String,
}

/// Operator metrics, all prefixed `pg_cluster_operator_`
pub struct Metrics {
    pub sync_passes_total: Family<ClusterLabels, Counter>,
    pub sync_failures_total: Family<ClusterLabels, Counter>,
    pub sync_duration_seconds: Family<ClusterLabels, Histogram>,
    /// Failed steps, soft ones included
    pub sync_step_failures_total: Family<StepLabels, Counter>,
    pub cluster_instances_desired: Family<ClusterLabels, Gauge>,
    pub cluster_instances_ready: Family<ClusterLabels, Gauge>,
    registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::with_prefix("pg_cluster_operator");

        let sync_passes_total = Family::<ClusterLabels, Counter>::default();
        registry.register(
            "sync_passes",
            "Sync passes run per cluster",
            sync_passes_total.clone(),
        );
        let sync_failures_total = Family::<ClusterLabels, Counter>::default();
        registry.register(
            "sync_failures",
            "Sync passes aborted by a fatal step",
            sync_failures_total.clone(),
        );
        let sync_duration_seconds = Family::<ClusterLabels, Histogram>::new_with_constructor(|| {
            Histogram::new(exponential_buckets(0.01, 2.0, 14))
        });
        registry.register(
            "sync_duration_seconds",
            "Wall time of one sync pass",
            sync_duration_seconds.clone(),
        );
        let sync_step_failures_total = Family::<StepLabels, Counter>::default();
        registry.register(
            "sync_step_failures",
            "Failed sync steps by step name",
            sync_step_failures_total.clone(),
        );
        let cluster_instances_desired = Family::<ClusterLabels, Gauge>::default();
        registry.register(
            "cluster_instances_desired",
            "numberOfInstances of each cluster",
            cluster_instances_desired.clone(),
        );
        let cluster_instances_ready = Family::<ClusterLabels, Gauge>::default();
        registry.register(
            "cluster_instances_ready",
            "Database pods reporting ready",
            cluster_instances_ready.clone(),
        );

        Self {
            sync_passes_total,
            sync_failures_total,
            sync_duration_seconds,
            sync_step_failures_total,
            cluster_instances_desired,
            cluster_instances_ready,
            registry,
        }
    }

    pub fn record_reconcile(&self, namespace: &str, name: &str, duration_secs: f64) {
        let labels = ClusterLabels::new(namespace, name);
        self.sync_passes_total.get_or_create(&labels).inc();
        self.sync_duration_seconds
            .get_or_create(&labels)
            .observe(duration_secs);
    }

    pub fn record_error(&self, namespace: &str, name: &str) {
        self.sync_failures_total
            .get_or_create(&ClusterLabels::new(namespace, name))
            .inc();
    }

    pub fn record_step_failure(&self, step: &str) {
        self.sync_step_failures_total
            .get_or_create(&StepLabels {
                step: step.to_string(),
            })
            .inc();
    }

    pub fn set_cluster_instances(&self, namespace: &str, name: &str, desired: i64, ready: i64) {
        let labels = ClusterLabels::new(namespace, name);
        self.cluster_instances_desired.get_or_create(&labels).set(desired);
        self.cluster_instances_ready.get_or_create(&labels).set(ready);
    }

    /// Text exposition; empty if encoding fails
    fn encode(&self) -> String {
        let mut buffer = String::new();
        if let Err(e) = encode(&mut buffer, &self.registry) {
            tracing::error!(error = %e, "could not encode metrics");
            return String::new();
        }
        buffer
    }
}

/// State shared between the controller and the probe server
pub struct HealthState {
    ready: RwLock<bool>,
    pub metrics: Metrics,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    pub fn new() -> Self {
        Self {
            ready: RwLock::new(false),
            metrics: Metrics::new(),
        }
    }

    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    pub async fn is_ready(&self) -> bool {
        *self.ready.read().await
    }
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn readyz(State(state): State<Arc<HealthState>>) -> Response {
    if state.is_ready().await {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}

async fn metrics(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        state.metrics.encode(),
    )
}

pub fn create_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Serve probes and metrics on [`HEALTH_ADDR`] until the listener fails
pub async fn run_health_server(state: Arc<HealthState>) -> Result<(), std::io::Error> {
    let listener = TcpListener::bind(HEALTH_ADDR).await?;
    tracing::info!(addr = HEALTH_ADDR, "health server listening");
    axum::serve(listener, create_router(state)).await
}
