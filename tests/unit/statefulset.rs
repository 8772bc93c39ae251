//! Rolling updates driven by StatefulSet template changes

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;

use pg_cluster_operator::controller::statefulset::marked_for_rolling_update;
use pg_cluster_operator::resources::common::POSTGRES_CONTAINER;

use crate::common::*;

const NEW_IMAGE: &str = "ghcr.io/zalando/spilo-17:4.0-p2";

fn pod(env: &TestEnv, name: &str) -> Pod {
    env.store.object(NAMESPACE, name).unwrap()
}

fn image(pod: &Pod) -> Option<String> {
    pod.spec
        .as_ref()?
        .containers
        .iter()
        .find(|c| c.name == POSTGRES_CONTAINER)?
        .image
        .clone()
}

async fn running_cluster(env: &TestEnv, instances: i32) {
    env.apply(&create_test_cluster("db", NAMESPACE, instances));
    env.sync("db").await.unwrap();
    env.sync("db").await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_image_change_recreates_replicas_then_primary() {
    let env = TestEnv::new();
    running_cluster(&env, 3).await;
    let old_uids: Vec<String> = ["db-0", "db-1", "db-2"]
        .iter()
        .map(|n| pod(&env, n).uid().unwrap())
        .collect();

    env.edit("db", |spec| spec.docker_image = Some(NEW_IMAGE.to_string()));
    env.sync("db").await.unwrap();

    for (name, old_uid) in ["db-0", "db-1", "db-2"].iter().zip(&old_uids) {
        let pod = pod(&env, name);
        assert_ne!(pod.uid().as_ref(), Some(old_uid), "{name} was not recreated");
        assert_eq!(image(&pod).as_deref(), Some(NEW_IMAGE));
        assert!(!marked_for_rolling_update(&pod));
    }
    // The primary hands over to a replica before it goes down
    assert_eq!(
        env.patroni.switchovers(),
        vec![("db-0".to_string(), "db-1".to_string())]
    );
    assert!(env.store.event_reasons().contains(&"Switchover".to_string()));

    env.store.reset_mutations();
    env.sync("db").await.unwrap();
    assert_eq!(env.store.mutations(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_single_instance_is_recreated_without_switchover() {
    let env = TestEnv::new();
    running_cluster(&env, 1).await;

    env.edit("db", |spec| spec.docker_image = Some(NEW_IMAGE.to_string()));
    env.sync("db").await.unwrap();

    assert_eq!(image(&pod(&env, "db-0")).as_deref(), Some(NEW_IMAGE));
    assert!(env.patroni.switchovers().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_recreation_postponed_while_patroni_is_unreachable() {
    let env = TestEnv::new();
    running_cluster(&env, 2).await;
    let old_uid = pod(&env, "db-0").uid();

    env.patroni.set_unreachable(true);
    env.edit("db", |spec| spec.docker_image = Some(NEW_IMAGE.to_string()));
    env.sync("db").await.unwrap();

    // Flagged, but still the old instances
    for name in ["db-0", "db-1"] {
        let pod = pod(&env, name);
        assert!(marked_for_rolling_update(&pod), "{name} not flagged");
        assert_ne!(image(&pod).as_deref(), Some(NEW_IMAGE));
    }
    assert_eq!(pod(&env, "db-0").uid(), old_uid);
    let sts: StatefulSet = env.store.object(NAMESPACE, "db").unwrap();
    let template = sts.spec.unwrap().template.spec.unwrap();
    assert_eq!(template.containers[0].image.as_deref(), Some(NEW_IMAGE));

    // The flag outlives the pass; the next reachable pass finishes the job
    env.patroni.set_unreachable(false);
    env.sync("db").await.unwrap();
    for name in ["db-0", "db-1"] {
        let pod = pod(&env, name);
        assert!(!marked_for_rolling_update(&pod));
        assert_eq!(image(&pod).as_deref(), Some(NEW_IMAGE));
    }
    assert_eq!(env.patroni.switchovers().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_flag_from_interrupted_update_is_resumed() {
    let env = TestEnv::new();
    running_cluster(&env, 2).await;
    let old_uid = pod(&env, "db-1").uid();

    let mut flagged = pod(&env, "db-1");
    flagged.annotations_mut().insert(
        pg_cluster_operator::resources::common::ROLLING_UPDATE_ANNOTATION.to_string(),
        "true".to_string(),
    );
    env.store.seed(&flagged);

    env.sync("db").await.unwrap();
    let recreated = pod(&env, "db-1");
    assert_ne!(recreated.uid(), old_uid);
    assert!(!marked_for_rolling_update(&recreated));
    // Only a replica was flagged, so nobody switched over
    assert!(env.patroni.switchovers().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_scale_out_replaces_statefulset_and_keeps_pods() {
    let env = TestEnv::new();
    running_cluster(&env, 2).await;
    let old_uid = pod(&env, "db-0").uid();

    env.edit("db", |spec| spec.number_of_instances = 3);
    env.sync("db").await.unwrap();

    assert_eq!(env.store.count::<Pod>(NAMESPACE), 3);
    assert_eq!(pod(&env, "db-0").uid(), old_uid);
    assert!(env.patroni.switchovers().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_lazy_upgrade_leaves_stale_pods_running() {
    let env = TestEnv::with_config(pg_cluster_operator::config::OperatorConfig {
        enable_lazy_image_upgrade: true,
        ..test_config()
    });
    running_cluster(&env, 2).await;

    // Only the StatefulSet object is behind; its template is not a pod change
    let mut sts: StatefulSet = env.store.object(NAMESPACE, "db").unwrap();
    let container = &mut sts.spec.as_mut().unwrap().template.spec.as_mut().unwrap().containers[0];
    container.image = Some(NEW_IMAGE.to_string());
    env.store.seed(&sts);
    env.edit("db", |spec| spec.docker_image = Some(NEW_IMAGE.to_string()));

    env.sync("db").await.unwrap();
    assert_ne!(image(&pod(&env, "db-0")).as_deref(), Some(NEW_IMAGE));
    assert!(!marked_for_rolling_update(&pod(&env, "db-0")));
}
