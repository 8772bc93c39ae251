//! Services and endpoints for the master and replica roles
//!
//! Patroni labels each pod with its current role and, unless the leader
//! lock lives in ConfigMaps, writes the master endpoints itself. The master
//! service therefore only carries a selector in ConfigMap mode.

use k8s_openapi::api::core::v1::{Endpoints, Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use super::{non_empty, object_meta};
use crate::config::OperatorConfig;
use crate::crd::PostgresCluster;
use crate::resources::common::{
    PostgresRole, headless_service_name, pod_selector, service_name, standard_labels,
};

const POSTGRES_PORT: i32 = 5432;

fn postgres_port() -> ServicePort {
    ServicePort {
        name: Some("postgresql".to_string()),
        port: POSTGRES_PORT,
        target_port: Some(IntOrString::Int(POSTGRES_PORT)),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

/// Generate the service for a role
pub fn generate_service(
    cluster: &PostgresCluster,
    config: &OperatorConfig,
    role: PostgresRole,
) -> Service {
    let cluster_name = cluster.name_any();
    let mut labels = standard_labels(&cluster_name);
    labels.insert(config.pod_role_label.clone(), role.label_value().to_string());

    // Without ConfigMaps Patroni owns the master endpoints, so a selector
    // would fight it
    let selector = match role {
        PostgresRole::Replica => true,
        PostgresRole::Master => config.kubernetes_use_configmaps,
    }
    .then(|| {
        let mut selector = pod_selector(&cluster_name);
        selector.insert(config.pod_role_label.clone(), role.label_value().to_string());
        selector
    });

    let mut spec = ServiceSpec {
        selector,
        ports: Some(vec![postgres_port()]),
        type_: Some("ClusterIP".to_string()),
        ..Default::default()
    };
    if !cluster.spec.allowed_source_ranges.is_empty() {
        spec.type_ = Some("LoadBalancer".to_string());
        spec.load_balancer_source_ranges = Some(cluster.spec.allowed_source_ranges.clone());
    }

    let mut metadata = object_meta(cluster, service_name(&cluster_name, role), labels);
    metadata.annotations = non_empty(cluster.spec.service_annotations.clone());

    Service {
        metadata,
        spec: Some(spec),
        ..Default::default()
    }
}

/// Generate the headless service governing the StatefulSet
pub fn generate_headless_service(cluster: &PostgresCluster) -> Service {
    let cluster_name = cluster.name_any();
    Service {
        metadata: object_meta(
            cluster,
            headless_service_name(&cluster_name),
            standard_labels(&cluster_name),
        ),
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            selector: Some(pod_selector(&cluster_name)),
            ports: Some(vec![postgres_port()]),
            publish_not_ready_addresses: Some(true),
            type_: Some("ClusterIP".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Generate the empty endpoints object for a role; Patroni fills it in
pub fn generate_endpoints(cluster: &PostgresCluster, config: &OperatorConfig, role: PostgresRole) -> Endpoints {
    let cluster_name = cluster.name_any();
    let mut labels = standard_labels(&cluster_name);
    labels.insert(config.pod_role_label.clone(), role.label_value().to_string());
    Endpoints {
        metadata: object_meta(cluster, service_name(&cluster_name, role), labels),
        subsets: None,
    }
}
