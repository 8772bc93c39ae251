//! Patroni configuration sync, pending restarts and major version upgrades

use std::collections::BTreeMap;

use pg_cluster_operator::config::{MajorUpgradeMode, OperatorConfig};
use pg_cluster_operator::controller::patroni_sync::DesiredPatroni;
use pg_cluster_operator::controller::upgrade::upgrade_command;
use pg_cluster_operator::crd::{ClusterPhase, PatroniSpec};
use pg_cluster_operator::store::StoreError;

use crate::common::*;

fn desired_parameters(parameters: &[(&str, &str)]) -> DesiredPatroni {
    DesiredPatroni {
        parameters: parameters
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        ..Default::default()
    }
}

#[test]
fn test_lowered_max_connections_restarts_primary_first() {
    let change = desired_parameters(&[("max_connections", "50")])
        .config_change(&bootstrapped_config(), &BTreeMap::new());
    assert!(change.primary_restart_required);
    assert_eq!(
        change.delta.postgresql.unwrap().parameters["max_connections"],
        "50"
    );
}

#[test]
fn test_raised_max_connections_restarts_replicas_first() {
    let change = desired_parameters(&[("max_connections", "200")])
        .config_change(&bootstrapped_config(), &BTreeMap::new());
    assert!(!change.delta.is_empty());
    assert!(!change.primary_restart_required);
}

#[test]
fn test_non_numeric_primary_first_value_casts_no_vote() {
    let change = desired_parameters(&[("max_connections", "50"), ("max_wal_senders", "ten")])
        .config_change(&bootstrapped_config(), &BTreeMap::new());
    assert!(change.primary_restart_required);
    assert_eq!(
        change.delta.postgresql.unwrap().parameters["max_wal_senders"],
        "ten"
    );

    // Nothing left to vote
    let change = desired_parameters(&[("max_wal_senders", "ten")])
        .config_change(&bootstrapped_config(), &BTreeMap::new());
    assert!(!change.delta.is_empty());
    assert!(!change.primary_restart_required);
}

#[test]
fn test_unrelated_change_outvotes_the_decrease() {
    let change = desired_parameters(&[("max_connections", "50"), ("work_mem", "8MB")])
        .config_change(&bootstrapped_config(), &BTreeMap::new());
    assert!(!change.primary_restart_required);
}

#[test]
fn test_consensus_change_vetoes_primary_first() {
    let mut desired = desired_parameters(&[("max_connections", "50")]);
    desired.patroni = PatroniSpec {
        ttl: 60,
        ..Default::default()
    };
    let change = desired.config_change(&bootstrapped_config(), &BTreeMap::new());
    assert_eq!(change.delta.ttl, Some(60));
    assert!(!change.primary_restart_required);
}

#[test]
fn test_local_only_parameters_never_reach_the_dcs() {
    let change = desired_parameters(&[("shared_buffers", "1GB")])
        .config_change(&bootstrapped_config(), &BTreeMap::new());
    assert!(change.delta.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_sync_patches_changed_parameters() {
    let env = TestEnv::new();
    env.apply(&create_test_cluster("db", NAMESPACE, 2));
    env.sync("db").await.unwrap();
    assert!(env.patroni.deltas().is_empty());

    env.edit("db", |spec| {
        spec.postgresql
            .parameters
            .insert("max_connections".to_string(), "200".to_string());
    });
    env.sync("db").await.unwrap();

    assert_eq!(env.patroni.deltas().len(), 1);
    assert_eq!(
        env.patroni.config().postgresql.parameters["max_connections"],
        "200"
    );

    // Already effective, nothing more to push
    env.sync("db").await.unwrap();
    assert_eq!(env.patroni.deltas().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_pending_restarts_go_replicas_first() {
    let env = TestEnv::new();
    env.apply(&create_test_cluster("db", NAMESPACE, 3));
    env.sync("db").await.unwrap();

    for pod in ["db-0", "db-1", "db-2"] {
        env.patroni.set_pending_restart(pod);
    }
    env.sync("db").await.unwrap();
    assert_eq!(env.patroni.restarts(), vec!["db-1", "db-2", "db-0"]);

    // Nothing pending any more
    env.sync("db").await.unwrap();
    assert_eq!(env.patroni.restarts().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_lowered_parameter_restarts_primary_first() {
    let env = TestEnv::new();
    env.apply(&create_test_cluster("db", NAMESPACE, 2));
    env.sync("db").await.unwrap();

    env.edit("db", |spec| {
        spec.postgresql
            .parameters
            .insert("max_connections".to_string(), "50".to_string());
    });
    env.patroni.set_pending_restart("db-0");
    env.patroni.set_pending_restart("db-1");
    env.sync("db").await.unwrap();

    assert_eq!(env.patroni.restarts(), vec!["db-0", "db-1"]);
}

#[tokio::test(start_paused = true)]
async fn test_stream_slot_is_added_with_logical_wal() {
    let env = TestEnv::new();
    env.apply(
        &PostgresClusterBuilder::new("db", NAMESPACE)
            .with_instances(1)
            .with_database("orders", "postgres")
            .with_stream("checkout", "orders")
            .build(),
    );
    env.sync("db").await.unwrap();

    let config = env.patroni.config();
    let slot = &config.slots["fes_orders_checkout"];
    assert_eq!(slot["type"], "logical");
    assert_eq!(slot["database"], "orders");
    assert_eq!(config.postgresql.parameters["wal_level"], "logical");

    // Dropping the stream removes the slot the operator added
    env.edit("db", |spec| spec.streams.clear());
    env.sync("db").await.unwrap();
    assert!(!env.patroni.config().slots.contains_key("fes_orders_checkout"));
}

#[tokio::test(start_paused = true)]
async fn test_foreign_slots_are_kept() {
    let env = TestEnv::new();
    let mut config = bootstrapped_config();
    config.slots.insert(
        "migration".to_string(),
        BTreeMap::from([("type".to_string(), "physical".to_string())]),
    );
    env.patroni.set_effective_config(config);
    env.apply(&create_test_cluster("db", NAMESPACE, 1));

    env.sync("db").await.unwrap();
    env.sync("db").await.unwrap();
    assert!(env.patroni.config().slots.contains_key("migration"));
}

#[tokio::test(start_paused = true)]
async fn test_manifest_version_bump_runs_upgrade_on_primary() {
    let env = TestEnv::new();
    env.patroni.set_server_version(150004);
    env.apply(
        &PostgresClusterBuilder::new("db", NAMESPACE)
            .with_instances(2)
            .with_version("16")
            .build(),
    );
    env.sync("db").await.unwrap();

    assert_eq!(
        env.store.execs(),
        vec![("db-0".to_string(), upgrade_command(2))]
    );
    assert!(
        env.store
            .event_reasons()
            .contains(&"MajorVersionUpgrade".to_string())
    );
}

#[tokio::test(start_paused = true)]
async fn test_no_upgrade_when_versions_match_or_mode_is_off() {
    let env = TestEnv::new();
    env.patroni.set_server_version(160002);
    env.apply(
        &PostgresClusterBuilder::new("db", NAMESPACE)
            .with_instances(1)
            .with_version("16")
            .build(),
    );
    env.sync("db").await.unwrap();
    assert!(env.store.execs().is_empty());

    let env = TestEnv::with_config(OperatorConfig {
        major_version_upgrade_mode: MajorUpgradeMode::Off,
        ..test_config()
    });
    env.patroni.set_server_version(150004);
    env.apply(
        &PostgresClusterBuilder::new("db", NAMESPACE)
            .with_instances(1)
            .with_version("16")
            .build(),
    );
    env.sync("db").await.unwrap();
    assert!(env.store.execs().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_downgrade_is_refused() {
    let env = TestEnv::new();
    env.patroni.set_server_version(160002);
    env.apply(
        &PostgresClusterBuilder::new("db", NAMESPACE)
            .with_instances(1)
            .with_version("15")
            .build(),
    );
    env.sync("db").await.unwrap();
    assert!(env.store.execs().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_failed_upgrade_does_not_fail_the_pass() {
    let env = TestEnv::new();
    env.patroni.set_server_version(150004);
    env.store.fail_exec(StoreError::Transport("stream closed".to_string()));
    env.apply(
        &PostgresClusterBuilder::new("db", NAMESPACE)
            .with_instances(1)
            .with_version("16")
            .build(),
    );

    env.sync("db").await.unwrap();
    assert_eq!(env.store.execs().len(), 1);
    assert!(env.store.event_reasons().contains(&"SyncStepFailed".to_string()));
    assert_eq!(env.cluster("db").status.unwrap().phase, ClusterPhase::Running);
}

fn local_pod() -> k8s_openapi::api::core::v1::Pod {
    serde_json::from_value(serde_json::json!({
        "metadata": {"name": "db-0", "namespace": NAMESPACE},
        "status": {"podIP": "127.0.0.1"}
    }))
    .unwrap()
}

/// Serves `responses` in order, one per connection; `None` closes the
/// connection without answering. Returns the port and the accept count.
async fn patroni_server(
    responses: Vec<Option<(u16, &'static str)>>,
) -> (u16, tokio::task::JoinHandle<usize>) {
    use tokio::io::AsyncWriteExt;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = tokio::spawn(async move {
        let mut accepted = 0;
        for response in responses {
            let (mut stream, _) = listener.accept().await.unwrap();
            accepted += 1;
            let Some((status, body)) = response else {
                drop(stream);
                continue;
            };
            read_request(&mut stream).await;
            let reply = format!(
                "HTTP/1.1 {status} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(reply.as_bytes()).await.unwrap();
            stream.shutdown().await.unwrap();
        }
        accepted
    });
    (port, handle)
}

/// Consume the whole request so closing the socket does not reset it
async fn read_request(stream: &mut tokio::net::TcpStream) {
    use tokio::io::AsyncReadExt;

    let mut request = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await.unwrap();
        request.extend_from_slice(&chunk[..n]);
        let text = String::from_utf8_lossy(&request);
        if let Some(end) = text.find("\r\n\r\n") {
            let length = text[..end]
                .lines()
                .find_map(|line| {
                    let (name, value) = line.split_once(':')?;
                    name.eq_ignore_ascii_case("content-length")
                        .then(|| value.trim().parse::<usize>().ok())
                        .flatten()
                })
                .unwrap_or(0);
            if request.len() >= end + 4 + length {
                return;
            }
        }
        if n == 0 {
            return;
        }
    }
}

fn quick_backoff() -> pg_cluster_operator::BackoffConfig {
    pg_cluster_operator::BackoffConfig {
        initial_delay: std::time::Duration::from_millis(1),
        max_delay: std::time::Duration::from_millis(5),
        multiplier: 2.0,
        jitter: 0.0,
    }
}

#[tokio::test]
async fn test_patroni_call_retries_dropped_connection() {
    use pg_cluster_operator::resources::patroni::{HttpPatroniClient, PatroniApi};

    let (port, server) = patroni_server(vec![
        None,
        Some((200, r#"{"state": "running", "role": "primary", "server_version": 160004}"#)),
    ])
    .await;
    let client = HttpPatroniClient::new(3)
        .with_port(port)
        .with_backoff(quick_backoff());

    let member = client.get_member(&local_pod()).await.unwrap();
    assert!(member.is_primary());
    assert_eq!(member.server_version, 160004);
    assert_eq!(server.await.unwrap(), 2);
}

#[tokio::test]
async fn test_patroni_http_error_is_not_retried() {
    use pg_cluster_operator::resources::patroni::{HttpPatroniClient, PatroniApi, PatroniError};

    let (port, server) = patroni_server(vec![Some((412, r#"{"message": "no candidate"}"#))]).await;
    let client = HttpPatroniClient::new(3)
        .with_port(port)
        .with_backoff(quick_backoff());

    let err = client.switchover(&local_pod(), "db-1").await.unwrap_err();
    assert!(matches!(err, PatroniError::Http { status: 412, .. }), "{err}");
    assert!(!err.is_retryable());
    assert_eq!(server.await.unwrap(), 1);
}

#[tokio::test]
async fn test_patroni_gives_up_after_configured_attempts() {
    use pg_cluster_operator::resources::patroni::{HttpPatroniClient, PatroniApi, PatroniError};

    let (port, server) = patroni_server(vec![None, None]).await;
    let client = HttpPatroniClient::new(2)
        .with_port(port)
        .with_backoff(quick_backoff());

    let err = client.get_config(&local_pod()).await.unwrap_err();
    assert!(matches!(err, PatroniError::Connection(..)), "{err}");
    assert_eq!(server.await.unwrap(), 2);
}
