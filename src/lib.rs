pub mod config;
pub mod controller;
pub mod crd;
pub mod health;
pub mod resources;
pub mod store;

pub use config::OperatorConfig;
pub use controller::{
    BackoffConfig, ClusterRegistry, ClusterState, ClusterSync, Context, Error, FINALIZER, Result,
    SyncStep, error_policy, reconcile,
};
pub use crd::{PostgresCluster, PostgresEventStream};
pub use health::{HealthState, Metrics};
pub use store::{KubeStore, ResourceStore, StoreError};

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::CronJob;
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::runtime::Controller;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;

use crate::resources::patroni::HttpPatroniClient;
use crate::resources::postgres_client::PostgresAccess;

/// Helper to create a namespaced or cluster-wide API based on scope.
fn scoped_api<T>(client: Client, namespace: Option<&str>) -> Api<T>
where
    T: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <T as Resource>::DynamicType: Default,
    T: Clone + DeserializeOwned + std::fmt::Debug,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// Run the cluster controller.
///
/// Watches PostgresCluster resources and every kind a cluster owns. When
/// `namespace` is `Some(ns)`, only that namespace is watched.
pub async fn run_controller(
    client: Client,
    config: OperatorConfig,
    health_state: Option<Arc<HealthState>>,
    namespace: Option<&str>,
) {
    tracing::info!(
        scope = namespace.unwrap_or("cluster-wide"),
        "starting controller for PostgresCluster resources"
    );

    if let Some(ref state) = health_state {
        state.set_ready(true).await;
    }

    let store = KubeStore::new(client.clone(), config.store_retry_attempts);
    let patroni = HttpPatroniClient::new(config.patroni_retry_attempts);
    let ctx = Arc::new(Context::new(
        store,
        Arc::new(patroni),
        Arc::new(PostgresAccess),
        config,
        health_state,
    ));

    let clusters: Api<PostgresCluster> = scoped_api(client.clone(), namespace);
    let statefulsets: Api<StatefulSet> = scoped_api(client.clone(), namespace);
    let services: Api<Service> = scoped_api(client.clone(), namespace);
    let configmaps: Api<ConfigMap> = scoped_api(client.clone(), namespace);
    let secrets: Api<Secret> = scoped_api(client.clone(), namespace);
    let pdbs: Api<PodDisruptionBudget> = scoped_api(client.clone(), namespace);
    let cronjobs: Api<CronJob> = scoped_api(client.clone(), namespace);
    let deployments: Api<Deployment> = scoped_api(client.clone(), namespace);

    let watcher_config = WatcherConfig::default().any_semantic();

    Controller::new(clusters, watcher_config.clone())
        .owns(statefulsets, watcher_config.clone())
        .owns(services, watcher_config.clone())
        .owns(configmaps, watcher_config.clone())
        .owns(secrets, watcher_config.clone())
        .owns(pdbs, watcher_config.clone())
        .owns(cronjobs, watcher_config.clone())
        .owns(deployments, watcher_config)
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => {
                    tracing::debug!(name = %obj.name, "reconciled");
                }
                Err(e) => {
                    // Watch events for an object that was just deleted
                    let is_not_found = matches!(
                        &e,
                        kube::runtime::controller::Error::ReconcilerFailed(err, _) if err.is_not_found()
                    );
                    if is_not_found {
                        tracing::debug!(error = ?e, "object no longer exists");
                    } else {
                        tracing::error!(error = ?e, "reconciliation error");
                    }
                }
            }
        })
        .await;

    tracing::error!("controller stream ended unexpectedly");
}
