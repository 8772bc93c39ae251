use std::sync::Arc;

use crate::config::OperatorConfig;
use crate::controller::cluster_state::ClusterRegistry;
use crate::health::HealthState;
use crate::resources::patroni::PatroniApi;
use crate::resources::postgres_client::DatabaseAccess;
use crate::store::{KubeStore, ResourceStore};

/// Shared context for the controller
pub struct Context<S: ResourceStore = KubeStore> {
    /// Kubernetes objects
    pub store: S,
    /// Patroni REST API of the database pods
    pub patroni: Arc<dyn PatroniApi>,
    /// In-database role and object sync
    pub database: Arc<dyn DatabaseAccess>,
    pub config: Arc<OperatorConfig>,
    pub registry: ClusterRegistry,
    /// Metrics and readiness; absent in tests
    pub health_state: Option<Arc<HealthState>>,
}

impl<S: ResourceStore> Context<S> {
    pub fn new(
        store: S,
        patroni: Arc<dyn PatroniApi>,
        database: Arc<dyn DatabaseAccess>,
        config: OperatorConfig,
        health_state: Option<Arc<HealthState>>,
    ) -> Self {
        Self {
            store,
            patroni,
            database,
            config: Arc::new(config),
            registry: ClusterRegistry::new(),
            health_state,
        }
    }
}
