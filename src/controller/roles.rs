//! Database roles the operator manages for a cluster
//!
//! The registry is rebuilt from the manifest and the operator configuration
//! on every pass. Passwords are filled in later by the secrets step, which
//! is the source of truth for every role except infrastructure roles.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use tracing::{debug, warn};

use crate::config::OperatorConfig;
use crate::controller::error::Result;
use crate::controller::sync::ClusterSync;
use crate::crd::{PostgresCluster, PreparedDatabase, PreparedSchema};
use crate::resources::common::{
    MONITORING_USER, POOLER_USER, STREAM_USER, credential_secret_name, secret_value,
};
use crate::resources::postgres_client::DbRole;
use crate::store::ResourceStore;

/// Where a role comes from; decides rotation eligibility and what must be
/// restarted when its password changes in place
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoleOrigin {
    /// Listed under `users` in the manifest
    Manifest,
    /// Created for a prepared database
    Bootstrap,
    /// Superuser and replication user
    System,
    /// Password supplied by the infrastructure roles secret
    Infrastructure,
    /// Login role of the connection pooler
    Pooler,
    /// Role the change data capture consumers connect as
    Stream,
    /// Role of the metrics exporter sidecar
    Monitoring,
}

/// A role and the credentials the operator keeps for it
#[derive(Clone, Debug, PartialEq)]
pub struct PgUser {
    /// Role the user is declared as; also names its credentials secret
    pub role: String,
    /// Login name in use, differs from `role` after a new-role rotation
    pub name: String,
    pub origin: RoleOrigin,
    pub password: String,
    pub flags: BTreeSet<String>,
    pub member_of: BTreeSet<String>,
    /// Owns a database; never rotated by the global policy
    pub is_db_owner: bool,
}

impl PgUser {
    fn new(role: &str, origin: RoleOrigin, flags: &[&str]) -> Self {
        Self {
            role: role.to_string(),
            name: role.to_string(),
            origin,
            password: String::new(),
            flags: flags.iter().map(|f| f.to_string()).collect(),
            member_of: BTreeSet::new(),
            is_db_owner: false,
        }
    }

    fn member_of(mut self, group: &str) -> Self {
        self.member_of.insert(group.to_string());
        self
    }

    pub fn can_login(&self) -> bool {
        !self.flags.contains("NOLOGIN")
    }

    /// Whether a new-role rotation is in effect
    pub fn is_rotated(&self) -> bool {
        self.name != self.role
    }

    /// The role as it should exist in the database
    pub fn db_role(&self) -> DbRole {
        let mut member_of = self.member_of.clone();
        if self.is_rotated() {
            member_of.insert(self.role.clone());
        }
        DbRole {
            name: self.name.clone(),
            flags: self.flags.clone(),
            member_of,
        }
    }
}

/// All roles of a cluster, keyed by declared role name
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RoleRegistry {
    users: BTreeMap<String, PgUser>,
}

impl RoleRegistry {
    pub fn get(&self, role: &str) -> Option<&PgUser> {
        self.users.get(role)
    }

    pub fn get_mut(&mut self, role: &str) -> Option<&mut PgUser> {
        self.users.get_mut(role)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PgUser> {
        self.users.values()
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Roles that get a credentials secret
    pub fn with_credentials(&self) -> impl Iterator<Item = &PgUser> {
        self.users
            .values()
            .filter(|u| u.can_login() && u.origin != RoleOrigin::Monitoring)
    }

    fn insert(&mut self, user: PgUser) {
        self.users.insert(user.role.clone(), user);
    }

    /// Add a role unless one with that name exists already
    fn insert_new(&mut self, user: PgUser) -> bool {
        if self.users.contains_key(&user.role) {
            return false;
        }
        self.insert(user);
        true
    }
}

/// Name of the database created when `preparedDatabases` is an empty map
pub fn default_prepared_database(cluster_name: &str) -> String {
    cluster_name.replace('-', "_")
}

/// Prepared databases with the cluster default applied
pub fn prepared_databases(cluster: &PostgresCluster) -> BTreeMap<String, PreparedDatabase> {
    match &cluster.spec.prepared_databases {
        Some(dbs) if dbs.is_empty() => BTreeMap::from([(
            default_prepared_database(&cluster.name_any()),
            PreparedDatabase::default(),
        )]),
        Some(dbs) => dbs.clone(),
        None => BTreeMap::new(),
    }
}

/// Schemas of a prepared database; a single `data` schema by default
pub fn prepared_schemas(db: &PreparedDatabase) -> BTreeMap<String, PreparedSchema> {
    if db.schemas.is_empty() {
        BTreeMap::from([(
            "data".to_string(),
            PreparedSchema {
                default_roles: Some(true),
            },
        )])
    } else {
        db.schemas.clone()
    }
}

/// Owner role of a prepared database or schema prefix
pub fn owner_role(prefix: &str) -> String {
    format!("{prefix}_owner")
}

/// NOLOGIN owner/writer/reader roles for a prefix, plus login roles when
/// `default_users` is set. The owner is a member of the writer, which is a
/// member of the reader.
fn default_roles(registry: &mut RoleRegistry, prefix: &str, default_users: bool) {
    let owner = owner_role(prefix);
    let writer = format!("{prefix}_writer");
    let reader = format!("{prefix}_reader");

    registry.insert_new(PgUser::new(&reader, RoleOrigin::Bootstrap, &["NOLOGIN"]));
    registry.insert_new(PgUser::new(&writer, RoleOrigin::Bootstrap, &["NOLOGIN"]).member_of(&reader));
    let mut owner_user =
        PgUser::new(&owner, RoleOrigin::Bootstrap, &["NOLOGIN"]).member_of(&writer);
    owner_user.is_db_owner = true;
    registry.insert_new(owner_user);

    if default_users {
        for group in [&owner, &writer, &reader] {
            let login = format!("{group}_user");
            registry.insert_new(PgUser::new(&login, RoleOrigin::Bootstrap, &["LOGIN"]).member_of(group));
        }
    }
}

/// Upper-case manifest flags; roles log in unless told otherwise
fn manifest_flags(flags: &[String]) -> Vec<String> {
    let mut normalized: Vec<String> = flags.iter().map(|f| f.trim().to_uppercase()).collect();
    if !normalized.iter().any(|f| f == "NOLOGIN" || f == "LOGIN") {
        normalized.push("LOGIN".to_string());
    }
    normalized
}

/// Build the role registry from the manifest, the operator configuration
/// and the infrastructure role passwords
pub fn build_role_registry(
    cluster: &PostgresCluster,
    config: &OperatorConfig,
    infrastructure: &BTreeMap<String, String>,
    monitoring_password: Option<String>,
) -> RoleRegistry {
    let spec = &cluster.spec;
    let mut registry = RoleRegistry::default();

    registry.insert(PgUser::new(
        &config.super_username,
        RoleOrigin::System,
        &["SUPERUSER", "LOGIN", "CREATEDB", "CREATEROLE", "REPLICATION", "BYPASSRLS"],
    ));
    registry.insert(PgUser::new(
        &config.replication_username,
        RoleOrigin::System,
        &["LOGIN", "REPLICATION"],
    ));
    if spec.connection_pooler.is_some() {
        registry.insert(PgUser::new(POOLER_USER, RoleOrigin::Pooler, &["LOGIN"]));
    }
    if !spec.streams.is_empty() {
        registry.insert(PgUser::new(STREAM_USER, RoleOrigin::Stream, &["LOGIN", "REPLICATION"]));
    }
    if spec.monitoring.is_some() {
        let mut monitoring = PgUser::new(MONITORING_USER, RoleOrigin::Monitoring, &["LOGIN"])
            .member_of("pg_monitor");
        monitoring.password = monitoring_password.unwrap_or_default();
        registry.insert(monitoring);
    }

    let db_owners: BTreeSet<&String> = spec.databases.values().collect();
    for (name, flags) in &spec.users {
        if registry.get(name).is_some() {
            warn!(role = %name, "manifest role collides with an operator role, ignoring it");
            continue;
        }
        let flags = manifest_flags(flags);
        let flags: Vec<&str> = flags.iter().map(String::as_str).collect();
        let mut user = PgUser::new(name, RoleOrigin::Manifest, &flags);
        user.is_db_owner = db_owners.contains(name);
        registry.insert(user);
    }

    for (db_name, db) in prepared_databases(cluster) {
        default_roles(&mut registry, &db_name, db.default_users);
        for (schema, settings) in prepared_schemas(&db) {
            if settings.default_roles != Some(false) {
                default_roles(&mut registry, &format!("{db_name}_{schema}"), db.default_users);
            }
        }
    }

    for (name, password) in infrastructure {
        let mut user = PgUser::new(name, RoleOrigin::Infrastructure, &["LOGIN"]);
        user.password = password.clone();
        if !registry.insert_new(user) {
            warn!(role = %name, "infrastructure role collides with a cluster role, ignoring it");
        }
    }

    registry
}

impl<S: ResourceStore> ClusterSync<'_, S> {
    /// Rebuild the role registry
    pub(crate) async fn init_roles(&mut self) -> Result<()> {
        let infrastructure = match &self.config().infrastructure_roles_secret {
            Some(secret_name) => {
                match self.store().get::<Secret>(self.namespace(), secret_name).await? {
                    Some(secret) => secret
                        .data
                        .iter()
                        .flatten()
                        .filter_map(|(role, value)| {
                            String::from_utf8(value.0.clone())
                                .ok()
                                .map(|password| (role.clone(), password))
                        })
                        .collect(),
                    None => {
                        warn!(secret = %secret_name, "infrastructure roles secret not found");
                        BTreeMap::new()
                    }
                }
            }
            None => BTreeMap::new(),
        };

        let monitoring_password = if self.spec().monitoring.is_some() {
            self.store()
                .get::<Secret>(
                    self.namespace(),
                    &credential_secret_name(MONITORING_USER, self.name()),
                )
                .await?
                .and_then(|s| secret_value(&s, "password"))
        } else {
            None
        };

        let mut registry =
            build_role_registry(self.cluster, self.config(), &infrastructure, monitoring_password);

        // Logins in use survive the rebuild until the secrets step re-reads them
        for user in self.state.roles.iter() {
            if let Some(fresh) = registry.get_mut(&user.role)
                && fresh.origin != RoleOrigin::Infrastructure
                && fresh.origin != RoleOrigin::Monitoring
            {
                fresh.name = user.name.clone();
                fresh.password = user.password.clone();
            }
        }

        debug!(roles = registry.len(), "role registry initialized");
        self.state.roles = registry;
        Ok(())
    }
}
