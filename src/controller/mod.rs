pub mod cluster_state;
pub mod context;
mod database;
pub mod error;
mod infra;
pub mod patroni_sync;
pub mod reconciler;
pub mod restore;
pub mod roles;
pub mod rotation;
mod secrets;
pub mod statefulset;
pub mod status;
pub mod steps;
pub mod sync;
pub mod upgrade;

pub use cluster_state::{ClusterRegistry, ClusterState};
pub use context::Context;
pub use error::{BackoffConfig, Error, Result};
pub use reconciler::{FINALIZER, error_policy, reconcile};
pub use steps::{Severity, StepOutcome, SyncStep};
pub use sync::ClusterSync;
