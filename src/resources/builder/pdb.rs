//! PodDisruptionBudget protecting the primary

use k8s_openapi::api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use super::object_meta;
use crate::config::OperatorConfig;
use crate::crd::PostgresCluster;
use crate::resources::common::{PostgresRole, pdb_name, pod_selector, standard_labels};

/// Generate the PodDisruptionBudget
///
/// Only the pod currently labelled master is covered, so a drain never
/// evicts the primary while the cluster has instances. Scaled to zero the
/// budget allows everything.
pub fn generate_pdb(cluster: &PostgresCluster, config: &OperatorConfig) -> PodDisruptionBudget {
    let cluster_name = cluster.name_any();
    let min_available = if cluster.spec.number_of_instances <= 0 { 0 } else { 1 };

    let mut match_labels = pod_selector(&cluster_name);
    match_labels.insert(
        config.pod_role_label.clone(),
        PostgresRole::Master.label_value().to_string(),
    );

    PodDisruptionBudget {
        metadata: object_meta(cluster, pdb_name(&cluster_name), standard_labels(&cluster_name)),
        spec: Some(PodDisruptionBudgetSpec {
            min_available: Some(IntOrString::Int(min_available)),
            selector: Some(LabelSelector {
                match_labels: Some(match_labels),
                ..Default::default()
            }),
            unhealthy_pod_eviction_policy: Some("IfHealthyBudget".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}
