//! Restore sequence against the in-memory store

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Pod};
use kube::core::ObjectMeta;

use pg_cluster_operator::controller::restore::RestoreState;
use pg_cluster_operator::controller::{ClusterSync, Error, SyncStep};
use pg_cluster_operator::crd::{ClusterPhase, RestoreSpec};
use pg_cluster_operator::resources::common::{RESTORE_SPEC_ANNOTATION, restore_configmap_name};

use crate::common::*;

fn cluster(instances: i32) -> pg_cluster_operator::crd::PostgresCluster {
    PostgresClusterBuilder::new("db", NAMESPACE)
        .with_instances(instances)
        .with_s3_repo()
        .build()
}

fn request_restore(env: &TestEnv, id: &str) {
    env.edit("db", |spec| {
        spec.backup
            .get_or_insert_with(Default::default)
            .pgbackrest
            .get_or_insert_with(Default::default)
            .restore = Some(RestoreSpec {
            id: id.to_string(),
            repo: "repo1".to_string(),
            options: BTreeMap::from([("type".to_string(), "immediate".to_string())]),
        });
    });
}

fn replicas(env: &TestEnv) -> Option<i32> {
    env.store
        .object::<StatefulSet>(NAMESPACE, "db")
        .and_then(|s| s.spec)
        .and_then(|s| s.replicas)
}

fn marker(env: &TestEnv) -> Option<ConfigMap> {
    env.store.object(NAMESPACE, &restore_configmap_name("db"))
}

#[tokio::test(start_paused = true)]
async fn test_restore_start_stops_cluster_before_recording() {
    let env = TestEnv::new();
    env.apply(&cluster(3));
    env.sync("db").await.unwrap();
    request_restore(&env, "R1");

    let cluster = env.cluster("db");
    let state = env.ctx.registry.get_or_create(NAMESPACE, "db");
    let mut state = state.lock().await;
    let mut sync = ClusterSync::new(&env.ctx, &cluster, &mut state);
    sync.refresh_restore_marker().await.unwrap();
    assert_eq!(sync.restore_resume_point().await.unwrap(), RestoreState::NotStarted);

    let next = sync.restore_step(RestoreState::NotStarted).await.unwrap();
    assert_eq!(next, RestoreState::Recording);
    drop(sync);

    assert_eq!(replicas(&env), Some(0));
    assert_eq!(env.store.count::<Pod>(NAMESPACE), 0);

    let marker = marker(&env).expect("restore marker written");
    let data = marker.data.unwrap();
    assert_eq!(data["restore_enable"], "true");
    assert_eq!(data["restore_id"], "R1");
    assert_eq!(data["restore_command"], " --repo=1 --type=immediate");
    let recorded: RestoreSpec =
        serde_json::from_str(&marker.metadata.annotations.unwrap()[RESTORE_SPEC_ANNOTATION]).unwrap();
    assert_eq!(recorded.id, "R1");
}

#[tokio::test(start_paused = true)]
async fn test_restore_resumes_from_marker_without_stopping_again() {
    let env = TestEnv::new();
    env.apply(&cluster(3));
    env.sync("db").await.unwrap();
    request_restore(&env, "R1");

    {
        let cluster = env.cluster("db");
        let state = env.ctx.registry.get_or_create(NAMESPACE, "db");
        let mut state = state.lock().await;
        let mut sync = ClusterSync::new(&env.ctx, &cluster, &mut state);
        sync.refresh_restore_marker().await.unwrap();
        sync.restore_step(RestoreState::NotStarted).await.unwrap();
    }

    // A restarted operator starts with empty in-memory state
    env.ctx.registry.remove(NAMESPACE, "db");
    env.store.reset_mutations();
    let before = env.store.replica_patches("db");

    let cluster = env.cluster("db");
    let state = env.ctx.registry.get_or_create(NAMESPACE, "db");
    let mut state = state.lock().await;
    let mut sync = ClusterSync::new(&env.ctx, &cluster, &mut state);
    sync.refresh_restore_marker().await.unwrap();
    let resume = sync.restore_resume_point().await.unwrap();
    assert_eq!(resume, RestoreState::Recording);
    assert_eq!(env.store.mutations(), 0);

    let next = sync.restore_step(resume).await.unwrap();
    assert_eq!(next, RestoreState::PrimaryRestoring);
    drop(sync);

    let after = env.store.replica_patches("db");
    assert_eq!(&after[before.len()..], &[1]);
    assert_eq!(env.cluster("db").status.unwrap().phase, ClusterPhase::Restoring);
}

#[tokio::test(start_paused = true)]
async fn test_restore_completion_records_id_and_removes_marker() {
    let env = TestEnv::new();
    env.apply(&cluster(2));
    env.sync("db").await.unwrap();
    request_restore(&env, "R1");

    let cluster = env.cluster("db");
    let state = env.ctx.registry.get_or_create(NAMESPACE, "db");
    let mut state = state.lock().await;
    let mut sync = ClusterSync::new(&env.ctx, &cluster, &mut state);
    sync.refresh_restore_marker().await.unwrap();

    let mut step = RestoreState::NotStarted;
    let mut visited = vec![step];
    while step != RestoreState::Completed {
        step = sync.restore_step(step).await.unwrap();
        visited.push(step);
    }
    drop(sync);
    assert_eq!(
        visited,
        vec![
            RestoreState::NotStarted,
            RestoreState::Recording,
            RestoreState::PrimaryRestoring,
            RestoreState::ReplicasRestoring,
            RestoreState::Completed,
        ]
    );
    assert!(!state.restore_in_progress());
    drop(state);

    assert!(marker(&env).is_none());
    assert_eq!(env.cluster("db").status.unwrap().restore_id.as_deref(), Some("R1"));
    assert_eq!(env.store.count::<Pod>(NAMESPACE), 2);
}

#[tokio::test(start_paused = true)]
async fn test_restore_end_to_end_in_one_pass() {
    let env = TestEnv::new();
    env.apply(&cluster(3));
    env.sync("db").await.unwrap();
    request_restore(&env, "backup-42");

    env.sync("db").await.unwrap();

    assert_eq!(env.store.replica_patches("db"), vec![0, 1, 3]);
    assert!(marker(&env).is_none());
    let status = env.cluster("db").status.unwrap();
    assert_eq!(status.restore_id.as_deref(), Some("backup-42"));
    assert_eq!(status.phase, ClusterPhase::Running);
    assert_eq!(replicas(&env), Some(3));
    assert!(env.store.event_reasons().contains(&"Restore".to_string()));

    // The finished restore is not repeated
    env.store.reset_mutations();
    env.sync("db").await.unwrap();
    assert_eq!(env.store.mutations(), 0);
    assert_eq!(env.store.replica_patches("db"), vec![0, 1, 3]);
}

#[tokio::test(start_paused = true)]
async fn test_restore_times_out_when_primary_never_becomes_ready() {
    let env = TestEnv::new();
    env.apply(&cluster(2));
    env.sync("db").await.unwrap();
    request_restore(&env, "R1");
    env.store.set_pods_ready(false);

    let err = env.sync("db").await.unwrap_err();
    match err {
        Error::Step { step, source } => {
            assert_eq!(step, SyncStep::Restore);
            assert!(matches!(*source, Error::Timeout(_)));
        }
        other => panic!("unexpected error {other:?}"),
    }
    // The marker stays so the next pass resumes
    assert!(marker(&env).is_some());
    assert_eq!(env.cluster("db").status.unwrap().phase, ClusterPhase::SyncFailed);
}

#[tokio::test(start_paused = true)]
async fn test_restore_without_id_is_a_contract_violation() {
    let env = TestEnv::new();
    env.apply(&cluster(1));
    env.sync("db").await.unwrap();

    let cluster = env.cluster("db");
    let state = env.ctx.registry.get_or_create(NAMESPACE, "db");
    let mut state = state.lock().await;
    let sync = ClusterSync::new(&env.ctx, &cluster, &mut state);
    assert!(matches!(
        sync.restore_resume_point().await,
        Err(Error::ContractViolation(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_unreadable_marker_fails_the_pass() {
    let env = TestEnv::new();
    env.apply(&cluster(1));
    env.sync("db").await.unwrap();

    env.store.seed(&ConfigMap {
        metadata: ObjectMeta {
            name: Some(restore_configmap_name("db")),
            namespace: Some(NAMESPACE.to_string()),
            annotations: Some(BTreeMap::from([(
                RESTORE_SPEC_ANNOTATION.to_string(),
                "{not json".to_string(),
            )])),
            ..Default::default()
        },
        data: Some(BTreeMap::from([("restore_id".to_string(), "R9".to_string())])),
        ..Default::default()
    });

    let err = env.sync("db").await.unwrap_err();
    match err {
        Error::Step { step, source } => {
            assert_eq!(step, SyncStep::Restore);
            assert!(matches!(*source, Error::InvalidRestoreSpec(_)));
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_unknown_repository_is_rejected() {
    let env = TestEnv::new();
    env.apply(&cluster(1));
    env.sync("db").await.unwrap();
    env.edit("db", |spec| {
        spec.backup
            .get_or_insert_with(Default::default)
            .pgbackrest
            .get_or_insert_with(Default::default)
            .restore = Some(RestoreSpec {
            id: "R1".to_string(),
            repo: "repo7".to_string(),
            options: BTreeMap::new(),
        });
    });

    let err = env.sync("db").await.unwrap_err();
    assert!(!err.is_retryable(), "{err}");
    assert!(marker(&env).is_none());
    // Rejected before anything was stopped
    assert_eq!(replicas(&env), Some(1));
    assert_eq!(env.store.count::<Pod>(NAMESPACE), 1);
}

#[tokio::test(start_paused = true)]
async fn test_lagging_watch_cache_does_not_repeat_finished_restore() {
    let env = TestEnv::new();
    env.apply(&cluster(3));
    env.sync("db").await.unwrap();
    request_restore(&env, "R1");
    // Copy the watch cache would still hand out right after the restore
    let cached = env.cluster("db");

    env.sync("db").await.unwrap();
    assert_eq!(env.store.replica_patches("db"), vec![0, 1, 3]);

    for restarted in [false, true] {
        if restarted {
            env.ctx.registry.remove(NAMESPACE, "db");
        }
        let state = env.ctx.registry.get_or_create(NAMESPACE, "db");
        let mut state = state.lock().await;
        ClusterSync::new(&env.ctx, &cached, &mut state)
            .sync()
            .await
            .unwrap();
        drop(state);

        assert_eq!(env.store.replica_patches("db"), vec![0, 1, 3]);
        assert!(marker(&env).is_none());
        assert_eq!(env.cluster("db").status.unwrap().restore_id.as_deref(), Some("R1"));
    }
}

#[tokio::test(start_paused = true)]
async fn test_recorded_restore_takes_precedence_over_manifest() {
    let env = TestEnv::new();
    env.apply(&cluster(1));
    env.sync("db").await.unwrap();
    request_restore(&env, "R1");

    env.store.seed(&ConfigMap {
        metadata: ObjectMeta {
            name: Some(restore_configmap_name("db")),
            namespace: Some(NAMESPACE.to_string()),
            annotations: Some(BTreeMap::from([(
                RESTORE_SPEC_ANNOTATION.to_string(),
                "{not json".to_string(),
            )])),
            ..Default::default()
        },
        data: Some(BTreeMap::from([("restore_id".to_string(), "R1".to_string())])),
        ..Default::default()
    });

    let err = env.sync("db").await.unwrap_err();
    match err {
        Error::Step { step, source } => {
            assert_eq!(step, SyncStep::Restore);
            assert!(matches!(*source, Error::InvalidRestoreSpec(_)));
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_marker_for_other_restore_is_replaced_from_manifest() {
    let env = TestEnv::new();
    env.apply(&cluster(1));
    env.sync("db").await.unwrap();
    request_restore(&env, "R2");

    env.store.seed(&ConfigMap {
        metadata: ObjectMeta {
            name: Some(restore_configmap_name("db")),
            namespace: Some(NAMESPACE.to_string()),
            annotations: Some(BTreeMap::from([(
                RESTORE_SPEC_ANNOTATION.to_string(),
                "{not json".to_string(),
            )])),
            ..Default::default()
        },
        data: Some(BTreeMap::from([("restore_id".to_string(), "R1".to_string())])),
        ..Default::default()
    });

    env.sync("db").await.unwrap();
    assert!(marker(&env).is_none());
    assert_eq!(env.cluster("db").status.unwrap().restore_id.as_deref(), Some("R2"));
}

#[tokio::test(start_paused = true)]
async fn test_overlapping_reconciles_run_restore_once() {
    let env = TestEnv::new();
    env.apply(&cluster(3));
    env.reconcile("db").await.unwrap();
    env.reconcile("db").await.unwrap();
    request_restore(&env, "R1");

    let (first, second) = tokio::join!(env.reconcile("db"), env.reconcile("db"));
    first.unwrap();
    second.unwrap();

    assert_eq!(env.store.replica_patches("db"), vec![0, 1, 3]);
    assert!(marker(&env).is_none());
    let restores = env
        .store
        .event_reasons()
        .into_iter()
        .filter(|reason| reason == "Restore")
        .count();
    assert_eq!(restores, 1);
    assert_eq!(env.cluster("db").status.unwrap().restore_id.as_deref(), Some("R1"));
}

#[tokio::test(start_paused = true)]
async fn test_reconcile_waits_for_running_pass() {
    let env = TestEnv::new();
    env.apply(&cluster(1));
    env.reconcile("db").await.unwrap();
    env.reconcile("db").await.unwrap();
    request_restore(&env, "R1");
    env.store.reset_mutations();

    let held = env.ctx.registry.get_or_create(NAMESPACE, "db");
    let guard = held.lock().await;
    let pass = tokio::spawn(pg_cluster_operator::reconcile(
        std::sync::Arc::new(env.cluster("db")),
        env.ctx.clone(),
    ));

    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
    assert!(!pass.is_finished());
    assert_eq!(env.store.mutations(), 0);

    drop(guard);
    pass.await.unwrap().unwrap();
    assert!(env.store.mutations() > 0);
    assert_eq!(env.cluster("db").status.unwrap().restore_id.as_deref(), Some("R1"));
}
