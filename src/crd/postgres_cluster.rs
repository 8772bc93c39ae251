use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Desired state of one Patroni-managed PostgreSQL cluster
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[kube(
    group = "pgcluster.io",
    version = "v1",
    kind = "PostgresCluster",
    plural = "postgresclusters",
    shortname = "pgc",
    namespaced,
    status = "PostgresClusterStatus",
    printcolumn = r#"{"name":"Version", "type":"string", "jsonPath":".spec.postgresql.version"}"#,
    printcolumn = r#"{"name":"Instances", "type":"integer", "jsonPath":".spec.numberOfInstances"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Restore", "type":"string", "jsonPath":".status.restoreId"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PostgresClusterSpec {
    /// PostgreSQL version and runtime parameters
    pub postgresql: PostgresqlSpec,

    /// Number of database pods (one primary, the rest replicas)
    #[serde(default = "default_instances")]
    pub number_of_instances: i32,

    /// Overrides the operator's default Spilo image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_image: Option<String>,

    /// Data volume
    pub volume: VolumeSpec,

    /// Resource requirements for the postgres container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// Dynamic configuration pushed through the Patroni API
    #[serde(default)]
    pub patroni: PatroniSpec,

    /// Application roles and their flags (e.g. `superuser`, `createdb`)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub users: BTreeMap<String, Vec<String>>,

    /// Roles rotated by creating a new dated role
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub users_with_secret_rotation: Vec<String>,

    /// Roles rotated by replacing the password only
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub users_with_in_place_secret_rotation: Vec<String>,

    /// Roles never rotated even when rotation is enabled globally
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub users_ignoring_secret_rotation: Vec<String>,

    /// Databases to create, mapped to their owner role
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub databases: BTreeMap<String, String>,

    /// Databases with default schemas, roles and extensions.
    /// An empty map creates one database named after the cluster.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prepared_databases: Option<BTreeMap<String, PreparedDatabase>>,

    /// Physical backup and restore configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup: Option<BackupSpec>,

    /// Create a logical backup cron job
    #[serde(default)]
    pub enable_logical_backup: bool,

    /// Overrides the operator's logical backup schedule
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logical_backup_schedule: Option<String>,

    /// Run as a standby of another cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub standby: Option<StandbySpec>,

    /// Postgres exporter sidecar
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitoring: Option<MonitoringSpec>,

    /// Separate volume for the WAL directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wal_pvc: Option<VolumeSpec>,

    /// Change data capture streams
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub streams: Vec<StreamSpec>,

    /// PgBouncer deployment in front of the primary
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_pooler: Option<ConnectionPoolerSpec>,

    /// CIDRs allowed to reach the load balancer services
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_source_ranges: Vec<String>,

    /// Extra annotations for the master and replica services
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub service_annotations: BTreeMap<String, String>,

    /// Extra annotations for the database pods
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pod_annotations: BTreeMap<String, String>,
}

fn default_instances() -> i32 {
    1
}

/// PostgreSQL version and parameters
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PostgresqlSpec {
    /// Major version (e.g. "16")
    pub version: String,

    /// postgresql.conf parameters
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
}

/// Persistent volume settings
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSpec {
    /// Claim size as a quantity, grown in place but never shrunk
    pub size: String,

    /// Storage class; the cluster default when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,

    /// VolumeAttributesClass for the claim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_attributes_class: Option<String>,
}

/// Container resources
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequirements {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<ResourceList>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests: Option<ResourceList>,
}

/// CPU and memory quantities
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct ResourceList {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

/// Patroni dynamic configuration
///
/// Zero values mean "leave Patroni's current value alone".
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PatroniSpec {
    #[serde(default)]
    pub loop_wait: u32,
    #[serde(default)]
    pub ttl: u32,
    #[serde(default)]
    pub retry_timeout: u32,
    #[serde(default)]
    pub maximum_lag_on_failover: f64,
    #[serde(default)]
    pub synchronous_mode: bool,
    #[serde(default)]
    pub synchronous_mode_strict: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failsafe_mode: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pg_hba: Option<Vec<String>>,
    /// Permanent replication slots, keyed by slot name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub slots: BTreeMap<String, BTreeMap<String, String>>,
}

/// A database prepared with default schemas and roles
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PreparedDatabase {
    /// Schemas to create; defaults to a single `data` schema
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub schemas: BTreeMap<String, PreparedSchema>,

    /// Extensions mapped to the schema they are installed in
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extensions: BTreeMap<String, String>,

    /// Create login roles alongside the NOLOGIN owner/reader/writer roles
    #[serde(default)]
    pub default_users: bool,
}

/// Schema inside a prepared database
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PreparedSchema {
    /// Create owner/reader/writer roles dedicated to this schema
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_roles: Option<bool>,
}

/// Backup configuration
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pgbackrest: Option<PgbackrestSpec>,
}

/// pgBackRest repositories, schedules and restore request
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PgbackrestSpec {
    /// Overrides the operator's pgBackRest image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Options written to the `[global]` section
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub global: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub repos: Vec<RepoSpec>,

    /// Restore request; changing `id` starts a new restore
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore: Option<RestoreSpec>,
}

/// A pgBackRest repository
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RepoSpec {
    /// `repo1` to `repo4`
    pub name: String,

    /// One of `pvc`, `s3`, `gcs`, `azure`
    pub storage: String,

    /// Bucket or container name
    #[serde(default)]
    pub resource: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_type: Option<String>,

    /// Backup type (`full`, `incr`, `diff`) mapped to a cron schedule
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub schedule: BTreeMap<String, String>,

    /// Volume for `pvc` repositories
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<VolumeSpec>,
}

/// Restore request
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RestoreSpec {
    /// Identifier of this restore; must change to request another one
    pub id: String,

    /// Repository to restore from (`repo1` to `repo4`)
    pub repo: String,

    /// Extra `pgbackrest restore` options without the leading `--`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, String>,
}

/// Standby cluster source
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StandbySpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub standby_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub standby_port: Option<String>,
}

/// Postgres exporter sidecar
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringSpec {
    pub image: String,
}

/// A change data capture stream
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StreamSpec {
    pub application_id: String,
    pub database: String,
    /// Table name mapped to the event type emitted for it
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tables: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<u32>,
}

/// PgBouncer configuration
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionPoolerSpec {
    #[serde(default = "default_pooler_instances")]
    pub number_of_instances: i32,

    /// Pool mode: session or transaction
    #[serde(default = "default_pool_mode")]
    pub mode: String,

    /// Also run a pooler in front of the replicas
    #[serde(default)]
    pub enable_replica_pooler: bool,
}

impl Default for ConnectionPoolerSpec {
    fn default() -> Self {
        Self {
            number_of_instances: default_pooler_instances(),
            mode: default_pool_mode(),
            enable_replica_pooler: false,
        }
    }
}

fn default_pooler_instances() -> i32 {
    2
}

fn default_pool_mode() -> String {
    "transaction".to_string()
}

/// Observed state written back by the operator
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PostgresClusterStatus {
    /// Outcome of the most recent sync pass
    #[serde(default)]
    pub phase: ClusterPhase,

    /// Identifier of the last completed restore
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_id: Option<String>,

    /// Generation the last successful pass converged to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Ready, Progressing and Degraded conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// Cluster phase as shown by `kubectl get pgc`
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq)]
pub enum ClusterPhase {
    #[default]
    Pending,
    Creating,
    /// Cluster is running and converged
    Running,
    Updating,
    /// A backup restore is in progress
    Restoring,
    /// The last sync pass failed
    SyncFailed,
    /// Initial creation failed
    CreateFailed,
    /// A spec update failed
    UpdateFailed,
    Deleting,
}

impl std::fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterPhase::Pending => write!(f, "Pending"),
            ClusterPhase::Creating => write!(f, "Creating"),
            ClusterPhase::Running => write!(f, "Running"),
            ClusterPhase::Updating => write!(f, "Updating"),
            ClusterPhase::Restoring => write!(f, "Restoring"),
            ClusterPhase::SyncFailed => write!(f, "SyncFailed"),
            ClusterPhase::CreateFailed => write!(f, "CreateFailed"),
            ClusterPhase::UpdateFailed => write!(f, "UpdateFailed"),
            ClusterPhase::Deleting => write!(f, "Deleting"),
        }
    }
}

/// Status condition
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,

    /// `True`, `False` or `Unknown`
    pub status: String,

    pub reason: String,

    pub message: String,

    pub last_transition_time: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl PostgresClusterSpec {
    /// pgBackRest section, if any
    pub fn pgbackrest(&self) -> Option<&PgbackrestSpec> {
        self.backup.as_ref().and_then(|b| b.pgbackrest.as_ref())
    }

    /// Restore requested by the manifest, if any
    pub fn restore(&self) -> Option<&RestoreSpec> {
        self.pgbackrest().and_then(|p| p.restore.as_ref())
    }

    /// ID of the restore requested by the manifest
    pub fn restore_id(&self) -> Option<&str> {
        self.restore().map(|r| r.id.as_str()).filter(|id| !id.is_empty())
    }

    /// Whether any repository is stored on a PVC served by a repo host
    pub fn has_pvc_repo(&self) -> bool {
        self.pgbackrest()
            .is_some_and(|p| p.repos.iter().any(|r| r.storage == "pvc"))
    }

    pub fn is_standby(&self) -> bool {
        self.standby.is_some()
    }

    /// Major version as a number, if it parses
    pub fn major_version(&self) -> Option<u32> {
        self.postgresql.version.trim().parse().ok()
    }
}
