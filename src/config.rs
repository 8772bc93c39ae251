//! Operator-wide configuration
//!
//! Values come from environment variables set on the operator Deployment.
//! Every field has a default so the operator starts with an empty
//! environment, which is also what the tests rely on.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::controller::error::{Error, Result};

/// Default Spilo image used for database pods
pub const DEFAULT_SPILO_IMAGE: &str = "ghcr.io/zalando/spilo-16:3.3-p1";

/// Default image for pgBackRest repo-host and backup jobs
pub const DEFAULT_PGBACKREST_IMAGE: &str = "docker.io/pgbackrest/pgbackrest:2.54";

/// Default image for the logical backup cron job
pub const DEFAULT_LOGICAL_BACKUP_IMAGE: &str = "ghcr.io/zalando/postgres-operator/logical-backup:v1.13.0";

/// Default image for the connection pooler
pub const DEFAULT_POOLER_IMAGE: &str = "ghcr.io/zalando/pgbouncer:master-32";

/// How the operator handles major version upgrades
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MajorUpgradeMode {
    /// Never upgrade
    Off,
    /// Upgrade only when the manifest version is raised
    #[default]
    Manual,
    /// Also upgrade clusters below the minimal supported version
    Full,
}

impl FromStr for MajorUpgradeMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "off" => Ok(Self::Off),
            "manual" => Ok(Self::Manual),
            "full" => Ok(Self::Full),
            other => Err(Error::InvalidConfig(format!(
                "unknown major version upgrade mode {other:?}"
            ))),
        }
    }
}

/// Operator configuration shared by every cluster worker
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OperatorConfig {
    /// Image for the Spilo (Patroni + PostgreSQL) container
    pub docker_image: String,
    pub pgbackrest_image: String,
    pub logical_backup_image: String,
    pub logical_backup_schedule: String,
    pub connection_pooler_image: String,

    /// Name of the superuser role
    pub super_username: String,
    /// Name of the replication role
    pub replication_username: String,
    /// Label Patroni sets on each pod with its current role
    pub pod_role_label: String,

    /// Kubernetes cluster DNS domain
    pub cluster_domain: String,
    /// Patroni stores its leader lock in ConfigMaps instead of Endpoints
    pub kubernetes_use_configmaps: bool,
    /// Failsafe mode applied when the manifest does not set one
    pub patroni_failsafe_mode: Option<bool>,

    /// Connect to the database to sync roles, databases and extensions
    pub enable_database_access: bool,
    /// Leave pods with an outdated image running until their next restart
    pub enable_lazy_image_upgrade: bool,

    pub enable_password_rotation: bool,
    pub password_rotation_interval_days: u32,
    pub password_rotation_user_retention_days: u32,
    /// Secret in the cluster namespace holding infrastructure role passwords
    pub infrastructure_roles_secret: Option<String>,

    /// Poll interval for readiness waits
    #[serde(with = "duration_secs")]
    pub resource_check_interval: Duration,
    /// Upper bound for a single readiness wait
    #[serde(with = "duration_secs")]
    pub resource_check_timeout: Duration,
    /// Interval of periodic sync passes over converged clusters
    #[serde(with = "duration_secs")]
    pub resync_period: Duration,

    pub major_version_upgrade_mode: MajorUpgradeMode,
    pub minimal_major_version: u32,
    pub target_major_version: u32,

    /// Migrate data volumes to this VolumeAttributesClass when set
    pub target_volume_attributes_class: Option<String>,

    /// Cluster annotations copied onto the StatefulSet and kept in sync
    pub inherited_annotations: Vec<String>,

    /// Attempts for each Resource Store call before the step fails
    pub store_retry_attempts: u32,

    /// Attempts for each Patroni API call that fails to connect or times out
    pub patroni_retry_attempts: u32,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            docker_image: DEFAULT_SPILO_IMAGE.to_string(),
            pgbackrest_image: DEFAULT_PGBACKREST_IMAGE.to_string(),
            logical_backup_image: DEFAULT_LOGICAL_BACKUP_IMAGE.to_string(),
            logical_backup_schedule: "30 00 * * *".to_string(),
            connection_pooler_image: DEFAULT_POOLER_IMAGE.to_string(),
            super_username: "postgres".to_string(),
            replication_username: "standby".to_string(),
            pod_role_label: "spilo-role".to_string(),
            cluster_domain: "cluster.local".to_string(),
            kubernetes_use_configmaps: false,
            patroni_failsafe_mode: None,
            enable_database_access: true,
            enable_lazy_image_upgrade: false,
            enable_password_rotation: false,
            password_rotation_interval_days: 90,
            password_rotation_user_retention_days: 180,
            infrastructure_roles_secret: None,
            resource_check_interval: Duration::from_secs(3),
            resource_check_timeout: Duration::from_secs(600),
            resync_period: Duration::from_secs(30 * 60),
            major_version_upgrade_mode: MajorUpgradeMode::Manual,
            minimal_major_version: 13,
            target_major_version: 17,
            target_volume_attributes_class: None,
            inherited_annotations: Vec::new(),
            store_retry_attempts: 5,
            patroni_retry_attempts: 3,
        }
    }
}

impl OperatorConfig {
    /// Build the configuration from `PG_OPERATOR_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |name: &str| lookup(&format!("PG_OPERATOR_{name}"));

        if let Some(v) = get("DOCKER_IMAGE") {
            config.docker_image = v;
        }
        if let Some(v) = get("PGBACKREST_IMAGE") {
            config.pgbackrest_image = v;
        }
        if let Some(v) = get("LOGICAL_BACKUP_IMAGE") {
            config.logical_backup_image = v;
        }
        if let Some(v) = get("LOGICAL_BACKUP_SCHEDULE") {
            config.logical_backup_schedule = v;
        }
        if let Some(v) = get("CONNECTION_POOLER_IMAGE") {
            config.connection_pooler_image = v;
        }
        if let Some(v) = get("SUPER_USERNAME") {
            config.super_username = v;
        }
        if let Some(v) = get("REPLICATION_USERNAME") {
            config.replication_username = v;
        }
        if let Some(v) = get("POD_ROLE_LABEL") {
            config.pod_role_label = v;
        }
        if let Some(v) = get("CLUSTER_DOMAIN") {
            config.cluster_domain = v;
        }
        if let Some(v) = get("KUBERNETES_USE_CONFIGMAPS") {
            config.kubernetes_use_configmaps = parse_value("KUBERNETES_USE_CONFIGMAPS", &v)?;
        }
        if let Some(v) = get("ENABLE_PATRONI_FAILSAFE_MODE") {
            config.patroni_failsafe_mode = Some(parse_value("ENABLE_PATRONI_FAILSAFE_MODE", &v)?);
        }
        if let Some(v) = get("ENABLE_DATABASE_ACCESS") {
            config.enable_database_access = parse_value("ENABLE_DATABASE_ACCESS", &v)?;
        }
        if let Some(v) = get("ENABLE_LAZY_IMAGE_UPGRADE") {
            config.enable_lazy_image_upgrade = parse_value("ENABLE_LAZY_IMAGE_UPGRADE", &v)?;
        }
        if let Some(v) = get("ENABLE_PASSWORD_ROTATION") {
            config.enable_password_rotation = parse_value("ENABLE_PASSWORD_ROTATION", &v)?;
        }
        if let Some(v) = get("PASSWORD_ROTATION_INTERVAL") {
            config.password_rotation_interval_days = parse_value("PASSWORD_ROTATION_INTERVAL", &v)?;
        }
        if let Some(v) = get("PASSWORD_ROTATION_USER_RETENTION") {
            config.password_rotation_user_retention_days =
                parse_value("PASSWORD_ROTATION_USER_RETENTION", &v)?;
        }
        if let Some(v) = get("INFRASTRUCTURE_ROLES_SECRET") {
            config.infrastructure_roles_secret = Some(v);
        }
        if let Some(v) = get("RESOURCE_CHECK_INTERVAL") {
            config.resource_check_interval =
                Duration::from_secs(parse_value("RESOURCE_CHECK_INTERVAL", &v)?);
        }
        if let Some(v) = get("RESOURCE_CHECK_TIMEOUT") {
            config.resource_check_timeout =
                Duration::from_secs(parse_value("RESOURCE_CHECK_TIMEOUT", &v)?);
        }
        if let Some(v) = get("RESYNC_PERIOD") {
            config.resync_period = Duration::from_secs(parse_value("RESYNC_PERIOD", &v)?);
        }
        if let Some(v) = get("MAJOR_VERSION_UPGRADE_MODE") {
            config.major_version_upgrade_mode = v.parse()?;
        }
        if let Some(v) = get("MINIMAL_MAJOR_VERSION") {
            config.minimal_major_version = parse_value("MINIMAL_MAJOR_VERSION", &v)?;
        }
        if let Some(v) = get("TARGET_MAJOR_VERSION") {
            config.target_major_version = parse_value("TARGET_MAJOR_VERSION", &v)?;
        }
        if let Some(v) = get("TARGET_VOLUME_ATTRIBUTES_CLASS") {
            config.target_volume_attributes_class = Some(v);
        }
        if let Some(v) = get("INHERITED_ANNOTATIONS") {
            config.inherited_annotations = v
                .split(',')
                .map(str::trim)
                .filter(|a| !a.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(v) = get("STORE_RETRY_ATTEMPTS") {
            config.store_retry_attempts = parse_value("STORE_RETRY_ATTEMPTS", &v)?;
        }
        if let Some(v) = get("PATRONI_RETRY_ATTEMPTS") {
            config.patroni_retry_attempts = parse_value("PATRONI_RETRY_ATTEMPTS", &v)?;
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.password_rotation_interval_days == 0 {
            return Err(Error::InvalidConfig(
                "password rotation interval must be at least one day".to_string(),
            ));
        }
        if self.resource_check_interval.is_zero() {
            return Err(Error::InvalidConfig(
                "resource check interval must be positive".to_string(),
            ));
        }
        if self.store_retry_attempts == 0 {
            return Err(Error::InvalidConfig(
                "store retry attempts must be at least 1".to_string(),
            ));
        }
        if self.patroni_retry_attempts == 0 {
            return Err(Error::InvalidConfig(
                "Patroni retry attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_value<T: FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::InvalidConfig(format!("PG_OPERATOR_{name}: cannot parse {value:?}")))
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}
