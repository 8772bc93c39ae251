//! PgBouncer deployments in front of the master and replica services

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, PodSpec, PodTemplateSpec, Probe, Service, ServicePort, ServiceSpec,
    TCPSocketAction,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use kube::core::ObjectMeta;

use super::object_meta;
use super::statefulset::{container_security_context, env, env_secret};
use crate::config::OperatorConfig;
use crate::crd::{ConnectionPoolerSpec, PostgresCluster};
use crate::resources::common::{
    CLUSTER_LABEL, POOLER_USER, PostgresRole, credential_secret_name, pooler_name, service_name,
    standard_labels,
};

const POOLER_PORT: i32 = 5432;
const POOLER_CONTAINER: &str = "connection-pooler";

/// Labels of the pooler pods for a role
pub fn pooler_labels(cluster_name: &str, role: PostgresRole) -> BTreeMap<String, String> {
    let mut labels = standard_labels(cluster_name);
    labels.insert("app.kubernetes.io/component".to_string(), "pgbouncer".to_string());
    labels.insert("connection-pooler".to_string(), pooler_name(cluster_name, role));
    labels
}

fn pooler_selector(cluster_name: &str, role: PostgresRole) -> BTreeMap<String, String> {
    BTreeMap::from([
        (CLUSTER_LABEL.to_string(), cluster_name.to_string()),
        ("connection-pooler".to_string(), pooler_name(cluster_name, role)),
    ])
}

/// Generate the pooler Deployment for a role
///
/// Each instance connects to the role's service as the pooler user and
/// looks up client credentials through it.
pub fn generate_pooler_deployment(
    cluster: &PostgresCluster,
    config: &OperatorConfig,
    pooler: &ConnectionPoolerSpec,
    role: PostgresRole,
) -> Deployment {
    let cluster_name = cluster.name_any();
    let labels = pooler_labels(&cluster_name, role);

    let container = Container {
        name: POOLER_CONTAINER.to_string(),
        image: Some(config.connection_pooler_image.clone()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        ports: Some(vec![ContainerPort {
            container_port: POOLER_PORT,
            name: Some("pgbouncer".to_string()),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        env: Some(vec![
            env("PGHOST", service_name(&cluster_name, role)),
            env("PGPORT", "5432"),
            env("PGUSER", POOLER_USER),
            env("PGSCHEMA", POOLER_USER),
            env_secret(
                "PGPASSWORD",
                credential_secret_name(POOLER_USER, &cluster_name),
                "password",
            ),
            env("CONNECTION_POOLER_PORT", POOLER_PORT.to_string()),
            env("CONNECTION_POOLER_MODE", pooler.mode.clone()),
        ]),
        readiness_probe: Some(Probe {
            tcp_socket: Some(TCPSocketAction {
                port: IntOrString::Int(POOLER_PORT),
                ..Default::default()
            }),
            period_seconds: Some(10),
            ..Default::default()
        }),
        security_context: Some(container_security_context()),
        ..Default::default()
    };

    Deployment {
        metadata: object_meta(cluster, pooler_name(&cluster_name, role), labels.clone()),
        spec: Some(DeploymentSpec {
            replicas: Some(pooler.number_of_instances),
            selector: LabelSelector {
                match_labels: Some(pooler_selector(&cluster_name, role)),
                ..Default::default()
            },
            strategy: Some(DeploymentStrategy {
                type_: Some("RollingUpdate".to_string()),
                ..Default::default()
            }),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    termination_grace_period_seconds: Some(30),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Generate the Service in front of a pooler Deployment
pub fn generate_pooler_service(cluster: &PostgresCluster, role: PostgresRole) -> Service {
    let cluster_name = cluster.name_any();
    Service {
        metadata: object_meta(
            cluster,
            pooler_name(&cluster_name, role),
            pooler_labels(&cluster_name, role),
        ),
        spec: Some(ServiceSpec {
            selector: Some(pooler_selector(&cluster_name, role)),
            ports: Some(vec![ServicePort {
                name: Some("pgbouncer".to_string()),
                port: POOLER_PORT,
                target_port: Some(IntOrString::Int(POOLER_PORT)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            type_: Some("ClusterIP".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}
