//! pgBackRest configuration, backup schedules, the restore marker and the
//! logical backup job

use std::collections::BTreeMap;
use std::fmt::Write as _;

use k8s_openapi::api::batch::v1::{CronJob, CronJobSpec, JobSpec, JobTemplateSpec};
use k8s_openapi::api::core::v1::{ConfigMap, Container, PodSpec, PodTemplateSpec, Volume};
use kube::ResourceExt;
use kube::core::ObjectMeta;

use super::object_meta;
use super::statefulset::{
    CONFIG_VOLUME, PGBACKREST_CONFIG_MOUNT, PGDATA_MOUNT, PGROOT, REPO_HOST_CONTAINER,
    config_volume, container_security_context, env, env_field, env_secret, mount,
    repo_host_selector,
};
use crate::config::OperatorConfig;
use crate::controller::error::{Error, Result};
use crate::crd::{PgbackrestSpec, PostgresCluster, RepoSpec, RestoreSpec};
use crate::resources::common::{
    BACKUP_TYPES, CLUSTER_NAME_LABEL, POSTGRES_CONTAINER, PostgresRole, REPO_NAMES,
    RESTORE_SPEC_ANNOTATION, backup_cronjob_name, credential_secret_name, headless_service_name,
    logical_backup_job_name, pgbackrest_configmap_name, pod_selector, repo_host_configmap_name,
    repo_host_statefulset_name, restore_configmap_name, service_name, standard_labels,
};
use crate::store::label_selector;

/// Key of the rendered configuration in both pgBackRest ConfigMaps
pub const PGBACKREST_CONFIG_KEY: &str = "pgbackrest_instance.conf";

const STORAGE_TYPES: [&str; 4] = ["pvc", "s3", "gcs", "azure"];
const CERTS: &str = "/etc/pgbackrest/certs";
const BACKUP_CONTAINER: &str = "pgbackrest-backup";
const LOGICAL_BACKUP_CONTAINER: &str = "logical-backup";

/// Number of a repository named `repo1` to `repo4`
pub fn repo_number(name: &str) -> Result<u8> {
    REPO_NAMES
        .iter()
        .position(|n| *n == name)
        .map(|i| i as u8 + 1)
        .ok_or_else(|| Error::InvalidConfig(format!("repository name {name:?} is not repo1 to repo4")))
}

/// Options appended to `pgbackrest restore`: ` --repo=<n>` followed by the
/// manifest options in key order
pub fn restore_command(restore: &RestoreSpec) -> Result<String> {
    let number = repo_number(&restore.repo)
        .map_err(|_| Error::InvalidRestoreSpec(format!("unknown repository {:?}", restore.repo)))?;
    let mut command = format!(" --repo={number}");
    for (key, value) in &restore.options {
        let _ = write!(command, " --{key}={value}");
    }
    Ok(command)
}

fn host_fqdn(host: &str, cluster: &PostgresCluster, config: &OperatorConfig) -> String {
    format!(
        "{host}.{}.{}.svc.{}",
        headless_service_name(&cluster.name_any()),
        cluster.namespace().unwrap_or_default(),
        config.cluster_domain
    )
}

fn configmap(cluster: &PostgresCluster, name: String, config: String) -> ConfigMap {
    ConfigMap {
        metadata: object_meta(cluster, name, standard_labels(&cluster.name_any())),
        data: Some(BTreeMap::from([(PGBACKREST_CONFIG_KEY.to_string(), config)])),
        ..Default::default()
    }
}

fn validate_repo(repo: &RepoSpec) -> Result<u8> {
    if !STORAGE_TYPES.contains(&repo.storage.as_str()) {
        return Err(Error::InvalidConfig(format!(
            "repository {} has unknown storage {:?}",
            repo.name, repo.storage
        )));
    }
    repo_number(&repo.name)
}

/// Render the configuration mounted into the database pods
pub fn generate_pgbackrest_configmap(
    cluster: &PostgresCluster,
    config: &OperatorConfig,
    pgbackrest: &PgbackrestSpec,
) -> Result<ConfigMap> {
    let cluster_name = cluster.name_any();
    let mut conf = format!(
        "[db]\npg1-path = {PGROOT}/data\npg1-port = 5432\npg1-socket-path = /var/run/postgresql/\n\n\
         [global]\nlog-path = {PGDATA_MOUNT}/pgbackrest/log\nspool-path = {PGDATA_MOUNT}/pgbackrest/spool-path"
    );
    for (key, value) in &pgbackrest.global {
        let _ = write!(conf, "\n{key} = {value}");
    }

    let mut tls_server = false;
    for (index, repo) in pgbackrest.repos.iter().enumerate() {
        validate_repo(repo)?;
        let (name, storage, n) = (&repo.name, &repo.storage, index + 1);
        match storage.as_str() {
            "pvc" => {
                if !tls_server {
                    let _ = write!(
                        conf,
                        "\ntls-server-address = *\n\
                         tls-server-ca-file = {CERTS}/pgbackrest.ca-roots\n\
                         tls-server-cert-file = {CERTS}/pgbackrest-client.crt\n\
                         tls-server-key-file = {CERTS}/pgbackrest-client.key\n\
                         tls-server-auth = {cluster_name}=*"
                    );
                    tls_server = true;
                }
                let host = host_fqdn(
                    &format!("{}-0", repo_host_statefulset_name(&cluster_name)),
                    cluster,
                    config,
                );
                let _ = write!(
                    conf,
                    "\nrepo{n}-host = {host}\n\
                     repo{n}-host-ca-file = {CERTS}/pgbackrest.ca-roots\n\
                     repo{n}-host-cert-file = {CERTS}/pgbackrest-client.crt\n\
                     repo{n}-host-key-file = {CERTS}/pgbackrest-client.key\n\
                     repo{n}-host-type = tls\n\
                     repo{n}-host-user = postgres"
                );
            }
            "s3" => {
                let _ = write!(conf, "\n{name}-s3-bucket = {}", repo.resource);
                if let Some(endpoint) = &repo.endpoint {
                    let _ = write!(conf, "\n{name}-s3-endpoint = {endpoint}");
                }
                if let Some(region) = &repo.region {
                    let _ = write!(conf, "\n{name}-s3-region = {region}");
                }
                let _ = write!(conf, "\n{name}-type = s3");
            }
            "gcs" => {
                let _ = write!(conf, "\n{name}-gcs-bucket = {}", repo.resource);
                if let Some(key) = &repo.key {
                    let _ = write!(conf, "\n{name}-gcs-key = {PGBACKREST_CONFIG_MOUNT}/{key}");
                }
                if let Some(key_type) = &repo.key_type {
                    let _ = write!(conf, "\n{name}-gcs-key-type = {key_type}");
                }
                let _ = write!(conf, "\n{name}-type = gcs");
            }
            _ => {
                let _ = write!(conf, "\n{name}-azure-container = {}", repo.resource);
                for (field, value) in [
                    ("endpoint", &repo.endpoint),
                    ("key", &repo.key),
                    ("account", &repo.account),
                ] {
                    if let Some(value) = value {
                        let _ = write!(conf, "\n{name}-azure-{field} = {value}");
                    }
                }
                let _ = write!(conf, "\n{name}-type = azure");
            }
        }
    }
    conf.push('\n');

    Ok(configmap(cluster, pgbackrest_configmap_name(&cluster_name), conf))
}

/// Render the configuration of the repo host, which reaches every database
/// pod over TLS
pub fn generate_repo_host_configmap(
    cluster: &PostgresCluster,
    config: &OperatorConfig,
    pgbackrest: &PgbackrestSpec,
) -> Result<ConfigMap> {
    let cluster_name = cluster.name_any();
    let mut conf = format!(
        "[global]\nlog-path = /data/pgbackrest/repo1/log\n\
         tls-server-address = *\n\
         tls-server-ca-file = {CERTS}/pgbackrest.ca-roots\n\
         tls-server-cert-file = {CERTS}/pgbackrest-repo-host.crt\n\
         tls-server-key-file = {CERTS}/pgbackrest-repo-host.key\n\
         tls-server-auth = {cluster_name}=*"
    );
    for (index, repo) in pgbackrest.repos.iter().enumerate() {
        validate_repo(repo)?;
        if repo.storage == "pvc" {
            let n = index + 1;
            let _ = write!(conf, "\nrepo{n}-path = /data/pgbackrest/repo{n}");
        }
    }

    conf.push_str("\n\n[db]");
    for (key, value) in &pgbackrest.global {
        let _ = write!(conf, "\n{key} = {value}");
    }
    for ordinal in 0..cluster.spec.number_of_instances.max(0) {
        let n = ordinal + 1;
        let host = host_fqdn(&format!("{cluster_name}-{ordinal}"), cluster, config);
        let _ = write!(
            conf,
            "\npg{n}-host = {host}\n\
             pg{n}-host-ca-file = {CERTS}/pgbackrest.ca-roots\n\
             pg{n}-host-cert-file = {CERTS}/pgbackrest-repo-host.crt\n\
             pg{n}-host-key-file = {CERTS}/pgbackrest-repo-host.key\n\
             pg{n}-host-type = tls\n\
             pg{n}-path = {PGROOT}/data"
        );
    }
    conf.push('\n');

    Ok(configmap(cluster, repo_host_configmap_name(&cluster_name), conf))
}

/// Generate the restore marker recording `restore` before any pod is stopped
pub fn generate_restore_configmap(cluster: &PostgresCluster, restore: &RestoreSpec) -> Result<ConfigMap> {
    let cluster_name = cluster.name_any();
    let data = BTreeMap::from([
        ("restore_enable".to_string(), "true".to_string()),
        ("restore_id".to_string(), restore.id.clone()),
        ("restore_command".to_string(), restore_command(restore)?),
    ]);
    let mut metadata = object_meta(cluster, restore_configmap_name(&cluster_name), standard_labels(&cluster_name));
    metadata.annotations = Some(BTreeMap::from([(
        RESTORE_SPEC_ANNOTATION.to_string(),
        serde_json::to_string(restore)?,
    )]));
    Ok(ConfigMap {
        metadata,
        data: Some(data),
        ..Default::default()
    })
}

fn cronjob(
    cluster: &PostgresCluster,
    name: String,
    schedule: String,
    container: Container,
    volumes: Option<Vec<Volume>>,
) -> CronJob {
    let labels = standard_labels(&cluster.name_any());
    CronJob {
        metadata: object_meta(cluster, name, labels.clone()),
        spec: Some(CronJobSpec {
            schedule,
            concurrency_policy: Some("Forbid".to_string()),
            job_template: JobTemplateSpec {
                spec: Some(JobSpec {
                    template: PodTemplateSpec {
                        metadata: Some(ObjectMeta {
                            labels: Some(labels),
                            ..Default::default()
                        }),
                        spec: Some(PodSpec {
                            containers: vec![container],
                            volumes,
                            restart_policy: Some("Never".to_string()),
                            ..Default::default()
                        }),
                    },
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Generate one CronJob per repository and scheduled backup type
///
/// The job execs `pgbackrest backup` in the primary's postgres container,
/// or in the repo host for PVC repositories.
pub fn generate_pgbackrest_cronjobs(
    cluster: &PostgresCluster,
    config: &OperatorConfig,
    pgbackrest: &PgbackrestSpec,
) -> Result<Vec<CronJob>> {
    let cluster_name = cluster.name_any();
    let image = pgbackrest
        .image
        .clone()
        .unwrap_or_else(|| config.pgbackrest_image.clone());

    let mut jobs = Vec::new();
    for repo in &pgbackrest.repos {
        let number = validate_repo(repo)?;
        let (target_container, selector) = if repo.storage == "pvc" {
            (REPO_HOST_CONTAINER, repo_host_selector(&cluster_name))
        } else {
            let mut selector = pod_selector(&cluster_name);
            selector.insert(
                config.pod_role_label.clone(),
                PostgresRole::Master.label_value().to_string(),
            );
            (POSTGRES_CONTAINER, selector)
        };

        for (backup_type, schedule) in &repo.schedule {
            if !BACKUP_TYPES.contains(&backup_type.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "repository {} schedules unknown backup type {backup_type:?}",
                    repo.name
                )));
            }
            let container = Container {
                name: BACKUP_CONTAINER.to_string(),
                image: Some(image.clone()),
                image_pull_policy: Some("IfNotPresent".to_string()),
                env: Some(vec![
                    env("USE_PGBACKREST", "true"),
                    env("MODE", "backup"),
                    env(
                        "COMMAND_OPTS",
                        format!("--stanza=db --repo={number} --type={backup_type}"),
                    ),
                    env("CONTAINER", target_container),
                    env("SELECTOR", label_selector(&selector)),
                    env_field("POD_NAMESPACE", "metadata.namespace"),
                ]),
                volume_mounts: Some(vec![mount(CONFIG_VOLUME, PGBACKREST_CONFIG_MOUNT)]),
                security_context: Some(container_security_context()),
                ..Default::default()
            };
            jobs.push(cronjob(
                cluster,
                backup_cronjob_name(&cluster_name, &repo.name, backup_type),
                schedule.clone(),
                container,
                Some(vec![config_volume(pgbackrest_configmap_name(&cluster_name))]),
            ));
        }
    }
    Ok(jobs)
}

/// Generate the logical backup CronJob running `pg_dumpall` against the
/// master service
pub fn generate_logical_backup_cronjob(cluster: &PostgresCluster, config: &OperatorConfig) -> CronJob {
    let cluster_name = cluster.name_any();
    let schedule = cluster
        .spec
        .logical_backup_schedule
        .clone()
        .unwrap_or_else(|| config.logical_backup_schedule.clone());

    let container = Container {
        name: LOGICAL_BACKUP_CONTAINER.to_string(),
        image: Some(config.logical_backup_image.clone()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        env: Some(vec![
            env("SCOPE", cluster_name.clone()),
            env("CLUSTER_NAME_LABEL", CLUSTER_NAME_LABEL),
            env_field("POD_NAMESPACE", "metadata.namespace"),
            env("PGHOST", service_name(&cluster_name, PostgresRole::Master)),
            env("PGPORT", "5432"),
            env("PGUSER", config.super_username.clone()),
            env_secret(
                "PGPASSWORD",
                credential_secret_name(&config.super_username, &cluster_name),
                "password",
            ),
            env("PG_VERSION", cluster.spec.postgresql.version.clone()),
        ]),
        security_context: Some(container_security_context()),
        ..Default::default()
    };

    cronjob(cluster, logical_backup_job_name(&cluster_name), schedule, container, None)
}
