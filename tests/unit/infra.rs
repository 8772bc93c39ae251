//! Objects around the database StatefulSet

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::CronJob;
use k8s_openapi::api::core::v1::{
    ConfigMap, Endpoints, PersistentVolumeClaim, Secret, Service,
};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use serde_json::json;

use pg_cluster_operator::config::OperatorConfig;
use pg_cluster_operator::crd::{
    ConnectionPoolerSpec, MonitoringSpec, PostgresEventStream, RepoSpec, VolumeSpec,
};
use pg_cluster_operator::resources::common::{
    pdb_name, pgbackrest_cert_secret_name, pgbackrest_configmap_name, repo_host_statefulset_name,
};

use crate::common::*;

fn claim(name: &str, size: &str) -> PersistentVolumeClaim {
    serde_json::from_value(json!({
        "metadata": {"name": name, "namespace": NAMESPACE},
        "spec": {
            "accessModes": ["ReadWriteOnce"],
            "resources": {"requests": {"storage": size}}
        }
    }))
    .unwrap()
}

fn claim_size(env: &TestEnv, name: &str) -> String {
    let claim: PersistentVolumeClaim = env.store.object(NAMESPACE, name).unwrap();
    claim.spec.unwrap().resources.unwrap().requests.unwrap()["storage"].0.clone()
}

fn pvc_repo() -> RepoSpec {
    RepoSpec {
        name: "repo2".to_string(),
        storage: "pvc".to_string(),
        volume: Some(VolumeSpec {
            size: "50Gi".to_string(),
            ..Default::default()
        }),
        schedule: BTreeMap::from([("incr".to_string(), "0 */4 * * *".to_string())]),
        ..Default::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_volume_grows_but_never_shrinks() {
    let env = TestEnv::new();
    env.apply(&create_test_cluster("db", NAMESPACE, 2));
    env.store.seed(&claim("pgdata-db-0", "5Gi"));
    env.store.seed(&claim("pgdata-db-1", "20Gi"));
    // Not ours despite the similar name
    env.store.seed(&claim("pgdata-dbx-0", "1Gi"));

    env.sync("db").await.unwrap();

    assert_eq!(claim_size(&env, "pgdata-db-0"), "10Gi");
    assert_eq!(claim_size(&env, "pgdata-db-1"), "20Gi");
    assert_eq!(claim_size(&env, "pgdata-dbx-0"), "1Gi");
    let resizes: Vec<String> = env
        .store
        .patches()
        .into_iter()
        .filter(|(kind, _, _)| kind == "PersistentVolumeClaim")
        .map(|(_, name, _)| name)
        .collect();
    assert_eq!(resizes, vec!["pgdata-db-0"]);
}

#[tokio::test(start_paused = true)]
async fn test_volume_attributes_class_migration() {
    let env = TestEnv::with_config(OperatorConfig {
        target_volume_attributes_class: Some("fast".to_string()),
        ..test_config()
    });
    env.apply(&create_test_cluster("db", NAMESPACE, 1));
    env.store.seed(&claim("pgdata-db-0", "10Gi"));

    env.sync("db").await.unwrap();
    let claim: PersistentVolumeClaim = env.store.object(NAMESPACE, "pgdata-db-0").unwrap();
    assert_eq!(
        claim.spec.unwrap().volume_attributes_class_name.as_deref(),
        Some("fast")
    );

    env.store.reset_mutations();
    env.sync("db").await.unwrap();
    assert_eq!(env.store.mutations(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_wal_claims_removed_with_wal_volume() {
    let env = TestEnv::new();
    env.apply(&create_test_cluster("db", NAMESPACE, 1));
    env.store.seed(&claim("db-wal-db-0", "5Gi"));
    env.store.seed(&claim("pgdata-db-0", "10Gi"));

    env.sync("db").await.unwrap();

    let claims = env.store.names::<PersistentVolumeClaim>(NAMESPACE);
    assert_eq!(claims, vec!["pgdata-db-0"]);
    assert!(env.store.event_reasons().contains(&"WalVolumes".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_pooler_follows_manifest() {
    let env = TestEnv::new();
    env.apply(
        &PostgresClusterBuilder::new("db", NAMESPACE)
            .with_instances(2)
            .with_pooler()
            .build(),
    );
    env.sync("db").await.unwrap();
    assert_eq!(env.store.names::<Deployment>(NAMESPACE), vec!["db-pooler"]);
    assert!(env.store.names::<Service>(NAMESPACE).contains(&"db-pooler".to_string()));
    assert!(env.database.role("pooler").is_some());

    env.edit("db", |spec| {
        spec.connection_pooler = Some(ConnectionPoolerSpec {
            enable_replica_pooler: true,
            ..Default::default()
        })
    });
    env.sync("db").await.unwrap();
    assert_eq!(
        env.store.names::<Deployment>(NAMESPACE),
        vec!["db-pooler", "db-pooler-repl"]
    );

    env.edit("db", |spec| spec.connection_pooler = None);
    env.sync("db").await.unwrap();
    assert_eq!(env.store.count::<Deployment>(NAMESPACE), 0);
    let services = env.store.names::<Service>(NAMESPACE);
    assert!(!services.iter().any(|s| s.starts_with("db-pooler")));
}

#[tokio::test(start_paused = true)]
async fn test_backup_schedules_follow_repositories() {
    let env = TestEnv::new();
    env.apply(
        &PostgresClusterBuilder::new("db", NAMESPACE)
            .with_s3_repo()
            .build(),
    );
    env.sync("db").await.unwrap();
    assert_eq!(
        env.store.names::<CronJob>(NAMESPACE),
        vec!["pgbackrest-db-repo1-full"]
    );
    let job: CronJob = env.store.object(NAMESPACE, "pgbackrest-db-repo1-full").unwrap();
    assert_eq!(job.spec.unwrap().schedule, "0 1 * * *");
    assert!(env.store.object::<ConfigMap>(NAMESPACE, &pgbackrest_configmap_name("db")).is_some());
    assert!(env.store.object::<Secret>(NAMESPACE, &pgbackrest_cert_secret_name("db")).is_some());

    // Changed schedule is updated in place, undeclared types go away
    env.edit("db", |spec| {
        let repo = &mut spec.backup.as_mut().unwrap().pgbackrest.as_mut().unwrap().repos[0];
        repo.schedule = BTreeMap::from([("diff".to_string(), "0 2 * * *".to_string())]);
    });
    env.sync("db").await.unwrap();
    assert_eq!(
        env.store.names::<CronJob>(NAMESPACE),
        vec!["pgbackrest-db-repo1-diff"]
    );

    env.edit("db", |spec| spec.backup = None);
    env.sync("db").await.unwrap();
    assert_eq!(env.store.count::<CronJob>(NAMESPACE), 0);
    assert!(env.store.object::<ConfigMap>(NAMESPACE, &pgbackrest_configmap_name("db")).is_none());
    assert!(env.store.object::<Secret>(NAMESPACE, &pgbackrest_cert_secret_name("db")).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_certificates_are_issued_once() {
    let env = TestEnv::new();
    env.apply(
        &PostgresClusterBuilder::new("db", NAMESPACE)
            .with_s3_repo()
            .build(),
    );
    env.sync("db").await.unwrap();
    let first: Secret = env.store.object(NAMESPACE, &pgbackrest_cert_secret_name("db")).unwrap();
    let data = first.data.clone().unwrap();
    for key in [
        "key",
        "pgbackrest.ca-roots",
        "pgbackrest-client.crt",
        "pgbackrest-client.key",
        "pgbackrest-repo-host.crt",
        "pgbackrest-repo-host.key",
    ] {
        assert!(data.contains_key(key), "missing {key}");
    }

    env.sync("db").await.unwrap();
    let second: Secret = env.store.object(NAMESPACE, &pgbackrest_cert_secret_name("db")).unwrap();
    assert_eq!(first.data, second.data);
}

#[tokio::test(start_paused = true)]
async fn test_repo_host_exists_only_for_pvc_repositories() {
    let env = TestEnv::new();
    let mut cluster = PostgresClusterBuilder::new("db", NAMESPACE).with_s3_repo().build();
    cluster
        .spec
        .backup
        .as_mut()
        .unwrap()
        .pgbackrest
        .as_mut()
        .unwrap()
        .repos
        .push(pvc_repo());
    env.apply(&cluster);

    env.sync("db").await.unwrap();
    let host = repo_host_statefulset_name("db");
    assert!(env.store.object::<StatefulSet>(NAMESPACE, &host).is_some());
    assert!(env.store.names::<CronJob>(NAMESPACE).contains(&"pgbackrest-db-repo2-incr".to_string()));

    env.store.reset_mutations();
    env.sync("db").await.unwrap();
    assert_eq!(env.store.mutations(), 0);

    env.edit("db", |spec| {
        spec.backup.as_mut().unwrap().pgbackrest.as_mut().unwrap().repos.truncate(1);
    });
    env.sync("db").await.unwrap();
    assert!(env.store.object::<StatefulSet>(NAMESPACE, &host).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_logical_backup_job_toggles() {
    let env = TestEnv::new();
    env.apply(
        &PostgresClusterBuilder::new("db", NAMESPACE)
            .with_logical_backup()
            .build(),
    );
    env.sync("db").await.unwrap();
    let job: CronJob = env.store.object(NAMESPACE, "logical-backup-db").unwrap();
    assert_eq!(job.spec.unwrap().schedule, "30 00 * * *");

    env.edit("db", |spec| spec.logical_backup_schedule = Some("15 3 * * *".to_string()));
    env.sync("db").await.unwrap();
    let job: CronJob = env.store.object(NAMESPACE, "logical-backup-db").unwrap();
    assert_eq!(job.spec.unwrap().schedule, "15 3 * * *");

    env.edit("db", |spec| spec.enable_logical_backup = false);
    env.sync("db").await.unwrap();
    assert_eq!(env.store.count::<CronJob>(NAMESPACE), 0);
}

#[tokio::test(start_paused = true)]
async fn test_pdb_protects_primary() {
    let env = TestEnv::new();
    env.apply(&create_test_cluster("db", NAMESPACE, 2));
    env.sync("db").await.unwrap();
    let pdb: PodDisruptionBudget = env.store.object(NAMESPACE, &pdb_name("db")).unwrap();
    let spec = pdb.spec.unwrap();
    assert_eq!(spec.min_available, Some(IntOrString::Int(1)));
    let selector = spec.selector.unwrap().match_labels.unwrap();
    assert_eq!(selector["spilo-role"], "master");

    env.edit("db", |spec| spec.number_of_instances = 0);
    env.sync("db").await.unwrap();
    let pdb: PodDisruptionBudget = env.store.object(NAMESPACE, &pdb_name("db")).unwrap();
    assert_eq!(pdb.spec.unwrap().min_available, Some(IntOrString::Int(0)));
}

#[tokio::test(start_paused = true)]
async fn test_endpoints_left_to_patroni_configmaps() {
    let env = TestEnv::with_config(OperatorConfig {
        kubernetes_use_configmaps: true,
        ..test_config()
    });
    env.apply(&create_test_cluster("db", NAMESPACE, 1));
    env.sync("db").await.unwrap();

    assert_eq!(env.store.count::<Endpoints>(NAMESPACE), 0);
    let master: Service = env.store.object(NAMESPACE, "db").unwrap();
    let selector = master.spec.unwrap().selector.unwrap();
    assert_eq!(selector["spilo-role"], "master");
}

#[tokio::test(start_paused = true)]
async fn test_service_annotations_update_in_place() {
    let env = TestEnv::new();
    env.apply(&create_test_cluster("db", NAMESPACE, 1));
    env.sync("db").await.unwrap();
    let before: Service = env.store.object(NAMESPACE, "db").unwrap();

    env.edit("db", |spec| {
        spec.service_annotations =
            BTreeMap::from([("external-dns.alpha.kubernetes.io/hostname".to_string(), "db.example.com".to_string())]);
    });
    env.sync("db").await.unwrap();

    let after: Service = env.store.object(NAMESPACE, "db").unwrap();
    assert_eq!(before.metadata.uid, after.metadata.uid);
    assert_eq!(
        after.metadata.annotations.unwrap()["external-dns.alpha.kubernetes.io/hostname"],
        "db.example.com"
    );
}

#[tokio::test(start_paused = true)]
async fn test_monitoring_secret_lifecycle() {
    let env = TestEnv::new();
    env.apply(&create_test_cluster("db", NAMESPACE, 1));
    env.edit("db", |spec| {
        spec.monitoring = Some(MonitoringSpec {
            image: "quay.io/prometheuscommunity/postgres-exporter:v0.15.0".to_string(),
        })
    });
    env.sync("db").await.unwrap();
    assert!(env.store.object::<Secret>(NAMESPACE, "cpo-exporter.db.credentials").is_some());

    env.edit("db", |spec| spec.monitoring = None);
    env.sync("db").await.unwrap();
    assert!(env.store.object::<Secret>(NAMESPACE, "cpo-exporter.db.credentials").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_streams_follow_manifest() {
    let env = TestEnv::new();
    env.apply(
        &PostgresClusterBuilder::new("shop", NAMESPACE)
            .with_database("orders", "app")
            .with_user("app", &[])
            .with_stream("checkout", "orders")
            .with_stream("billing", "orders")
            .build(),
    );
    env.sync("shop").await.unwrap();
    assert_eq!(
        env.store.names::<PostgresEventStream>(NAMESPACE),
        vec!["shop-billing", "shop-checkout"]
    );
    let stream: PostgresEventStream = env.store.object(NAMESPACE, "shop-checkout").unwrap();
    assert_eq!(stream.spec.slot, "fes_orders_checkout");

    env.edit("shop", |spec| spec.streams.retain(|s| s.application_id == "billing"));
    env.sync("shop").await.unwrap();
    assert_eq!(
        env.store.names::<PostgresEventStream>(NAMESPACE),
        vec!["shop-billing"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_fractional_volume_size_is_compared_by_bytes() {
    let env = TestEnv::new();
    let mut cluster = create_test_cluster("db", NAMESPACE, 2);
    cluster.spec.volume.size = "10.5Gi".to_string();
    env.apply(&cluster);
    env.store.seed(&claim("pgdata-db-0", "10Gi"));
    env.store.seed(&claim("pgdata-db-1", "10752Mi"));

    env.sync("db").await.unwrap();

    assert_eq!(claim_size(&env, "pgdata-db-0"), "10.5Gi");
    assert_eq!(claim_size(&env, "pgdata-db-1"), "10752Mi");
}
