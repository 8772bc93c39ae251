//! Error types for the PostgresCluster controller

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use crate::controller::steps::SyncStep;
use crate::resources::certificate::CertificateError;
use crate::resources::patroni::PatroniError;
use crate::resources::postgres_client::DatabaseError;
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("resource store error: {0}")]
    Store(#[from] StoreError),

    #[error("Patroni API error: {0}")]
    Patroni(#[from] PatroniError),

    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("certificate error: {0}")]
    Certificate(#[from] CertificateError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid restore specification: {0}")]
    InvalidRestoreSpec(String),

    #[error("contract violation: {0}")]
    ContractViolation(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("primary pod missing: {0}")]
    PrimaryPodMissing(String),

    #[error("sync step {step} failed: {source}")]
    Step {
        step: SyncStep,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Store(e) => e.is_retryable(),
            Error::Patroni(_) | Error::Database(_) | Error::Timeout(_) => true,
            Error::PrimaryPodMissing(_) => true,
            Error::Step { source, .. } => source.is_retryable(),
            // Domain errors need a manifest or operator change
            Error::Certificate(_)
            | Error::Serialization(_)
            | Error::InvalidConfig(_)
            | Error::InvalidRestoreSpec(_)
            | Error::ContractViolation(_) => false,
        }
    }

    /// True when the underlying store call reported a missing object
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::Store(e) => e.is_not_found(),
            Error::Step { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    /// True when the underlying store call reported a name collision
    pub fn is_already_exists(&self) -> bool {
        match self {
            Error::Store(e) => matches!(e, StoreError::AlreadyExists(_)),
            Error::Step { source, .. } => source.is_already_exists(),
            _ => false,
        }
    }

    pub(crate) fn in_step(self, step: SyncStep) -> Self {
        match self {
            Error::Step { .. } => self,
            other => Error::Step {
                step,
                source: Box::new(other),
            },
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors that know whether repeating the failed call may succeed
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for StoreError {
    fn is_retryable(&self) -> bool {
        StoreError::is_retryable(self)
    }
}

impl Retryable for PatroniError {
    fn is_retryable(&self) -> bool {
        PatroniError::is_retryable(self)
    }
}

impl Retryable for Error {
    fn is_retryable(&self) -> bool {
        Error::is_retryable(self)
    }
}

/// Exponential backoff configuration
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    /// Initial delay for first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for each subsequent retry
    pub multiplier: f64,
    /// Random jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl BackoffConfig {
    /// Short delays for individual API calls inside a sync pass
    pub fn for_api_calls() -> Self {
        Self {
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }

    /// Calculate the backoff delay for a given retry attempt
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay_secs =
            self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);

        let jitter_range = base_delay_secs * self.jitter;
        let jitter = rand::random::<f64>() * jitter_range * 2.0 - jitter_range;
        let delay_with_jitter = (base_delay_secs + jitter).max(0.0);

        Duration::from_secs_f64(delay_with_jitter.min(self.max_delay.as_secs_f64()))
    }

    /// Get the delay for an error, with different handling for retryable vs non-retryable
    pub fn delay_for_error(&self, error: &Error, attempt: u32) -> Duration {
        if error.is_retryable() {
            self.delay_for_attempt(attempt)
        } else {
            // Leave room for a manifest fix before trying again
            self.max_delay
        }
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or
/// `attempts` calls have been made.
pub async fn retry_with_backoff<T, E, F, Fut>(
    backoff: &BackoffConfig,
    attempts: u32,
    what: &str,
    mut op: F,
) -> std::result::Result<T, E>
where
    E: Retryable + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt + 1 < attempts => {
                let delay = backoff.delay_for_attempt(attempt);
                warn!(call = what, attempt, error = %e, "retrying in {:?}", delay);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
