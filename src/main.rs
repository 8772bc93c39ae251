use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use kube_leader_election::{LeaseLock, LeaseLockParams};
use tokio::signal;
use tracing::{error, info, warn};

use pg_cluster_operator::health::{HealthState, run_health_server};
use pg_cluster_operator::{OperatorConfig, run_controller};

const LEASE_NAME: &str = "pg-cluster-operator-leader";
const LEASE_TTL: Duration = Duration::from_secs(15);
const LEASE_RENEW_INTERVAL: Duration = Duration::from_secs(5);

/// Time given to a running sync pass after SIGTERM
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Another provider may already be installed; only a missing one is fatal
    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
        && rustls::crypto::CryptoProvider::get_default().is_none()
    {
        return Err("no rustls crypto provider available".into());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("pg_cluster_operator=info".parse()?)
                .add_directive("kube=warn".parse()?)
                .add_directive("kube_leader_election=info".parse()?),
        )
        .init();

    let config = OperatorConfig::from_env()?;
    info!(
        image = %config.docker_image,
        database_access = config.enable_database_access,
        password_rotation = config.enable_password_rotation,
        upgrade_mode = ?config.major_version_upgrade_mode,
        "pg-cluster-operator starting"
    );
    let watch_namespace = env_non_empty("WATCH_NAMESPACE");

    let client = Client::try_default().await?;
    let health_state = Arc::new(HealthState::new());

    // Probes answer before leadership is settled
    let health_handle = tokio::spawn({
        let health_state = health_state.clone();
        async move {
            if let Err(e) = run_health_server(health_state).await {
                error!(error = %e, "health server failed");
            }
        }
    });

    let lease = operator_lease(client.clone());
    acquire_leadership(&lease).await;
    let renew_handle = tokio::spawn(keep_leadership(lease));

    let controller_handle = tokio::spawn({
        let health_state = health_state.clone();
        async move {
            run_controller(
                client,
                config,
                Some(health_state),
                watch_namespace.as_deref(),
            )
            .await;
        }
    });

    tokio::select! {
        result = controller_handle => {
            if let Err(e) = result {
                error!(error = %e, "controller task panicked");
            }
        }
        result = health_handle => {
            if let Err(e) = result {
                error!(error = %e, "health server task panicked");
            }
        }
        Err(e) = renew_handle => {
            error!(error = %e, "lease renewal task panicked");
        }
        _ = shutdown_signal() => {
            info!("shutdown requested");
            health_state.set_ready(false).await;
            tokio::time::sleep(SHUTDOWN_GRACE).await;
        }
    }

    info!("pg-cluster-operator stopped");
    Ok(())
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

/// Lease in the operator's own namespace, held under the pod name
fn operator_lease(client: Client) -> LeaseLock {
    let holder_id = env_non_empty("POD_NAME").unwrap_or_else(|| {
        warn!("POD_NAME not set, falling back to hostname");
        hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string())
    });
    let namespace = env_non_empty("POD_NAMESPACE").unwrap_or_else(|| {
        warn!("POD_NAMESPACE not set, using default");
        "default".to_string()
    });
    info!(holder_id = %holder_id, namespace = %namespace, lease = LEASE_NAME, "joining leader election");

    LeaseLock::new(
        client,
        &namespace,
        LeaseLockParams {
            holder_id,
            lease_name: LEASE_NAME.to_string(),
            lease_ttl: LEASE_TTL,
        },
    )
}

async fn acquire_leadership(lease: &LeaseLock) {
    loop {
        match lease.try_acquire_or_renew().await {
            Ok(result) if result.acquired_lease => {
                info!("leadership acquired");
                return;
            }
            Ok(_) => info!("another replica leads, waiting"),
            Err(e) => warn!(error = %e, "lease acquisition failed"),
        }
        tokio::time::sleep(LEASE_RENEW_INTERVAL).await;
    }
}

/// Renew until the lease is lost, then exit so the pod restarts into the
/// election. Two replicas must never sync the same cluster.
async fn keep_leadership(lease: LeaseLock) {
    loop {
        tokio::time::sleep(LEASE_RENEW_INTERVAL).await;
        match lease.try_acquire_or_renew().await {
            Ok(result) if result.acquired_lease => {}
            Ok(_) => {
                error!("leadership lost, exiting");
                std::process::exit(1);
            }
            Err(e) => {
                error!(error = %e, "lease renewal failed, exiting");
                std::process::exit(1);
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
