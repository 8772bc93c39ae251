use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use rand::Rng;

use super::object_meta;
use crate::config::OperatorConfig;
use crate::controller::error::Result;
use crate::crd::PostgresCluster;
use crate::resources::certificate::pgbackrest_certificate_data;
use crate::resources::common::{
    MONITORING_USER, credential_secret_name, pgbackrest_cert_secret_name, secret_data,
    standard_labels,
};

/// Generate a secure random password
pub fn generate_password(len: usize) -> String {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::rng();
    (0..len)
        .map(|_| CHARSET[rng.random_range(0..CHARSET.len())] as char)
        .collect()
}

fn opaque_secret(cluster: &PostgresCluster, name: String, values: BTreeMap<String, String>) -> Secret {
    Secret {
        metadata: object_meta(cluster, name, standard_labels(&cluster.name_any())),
        type_: Some("Opaque".to_string()),
        data: Some(secret_data(&values)),
        ..Default::default()
    }
}

/// Generate the credentials Secret of one role
pub fn generate_credential_secret(cluster: &PostgresCluster, username: &str, password: &str) -> Secret {
    opaque_secret(
        cluster,
        credential_secret_name(username, &cluster.name_any()),
        BTreeMap::from([
            ("username".to_string(), username.to_string()),
            ("password".to_string(), password.to_string()),
        ]),
    )
}

/// Generate the exporter's credentials with a fresh hex password
pub fn generate_monitoring_secret(cluster: &PostgresCluster) -> Secret {
    let bytes: [u8; 16] = rand::random();
    let password = bytes.iter().map(|b| format!("{b:02x}")).collect::<String>();
    generate_credential_secret(cluster, MONITORING_USER, &password)
}

/// Generate the pgBackRest TLS secret with a freshly issued CA and leaves
pub fn generate_pgbackrest_cert_secret(cluster: &PostgresCluster, config: &OperatorConfig) -> Result<Secret> {
    let cluster_name = cluster.name_any();
    let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());
    let values = pgbackrest_certificate_data(&cluster_name, &namespace, &config.cluster_domain)?;
    Ok(opaque_secret(cluster, pgbackrest_cert_secret_name(&cluster_name), values))
}
