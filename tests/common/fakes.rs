//! Fake Patroni API and database sessions
//!
//! Both keep just enough state for a second pass to observe what the first
//! pass changed, and log every write so tests can assert on it.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;

use pg_cluster_operator::resources::patroni::{
    PatroniApi, PatroniConfig, PatroniConfigDelta, PatroniError, PatroniMemberStatus,
    PatroniPostgresql, PatroniResult,
};
use pg_cluster_operator::resources::postgres_client::{
    ConnectionTarget, DatabaseAccess, DatabaseError, DatabaseResult, DatabaseSession, DbRole,
};

/// Configuration a freshly bootstrapped Spilo cluster reports
pub fn bootstrapped_config() -> PatroniConfig {
    PatroniConfig {
        ttl: 30,
        loop_wait: 10,
        retry_timeout: 10,
        maximum_lag_on_failover: 33554432.0,
        postgresql: PatroniPostgresql {
            parameters: BTreeMap::from([("max_connections".to_string(), "100".to_string())]),
        },
        ..Default::default()
    }
}

#[derive(Default)]
struct PatroniState {
    config: PatroniConfig,
    unreachable: bool,
    server_version: u32,
    pending_restart: BTreeSet<String>,
    deltas: Vec<PatroniConfigDelta>,
    restarts: Vec<String>,
    switchovers: Vec<(String, String)>,
}

/// Patroni of a single cluster sharing one DCS
pub struct FakePatroni {
    state: Mutex<PatroniState>,
    role_label: String,
}

impl Default for FakePatroni {
    fn default() -> Self {
        Self::new()
    }
}

impl FakePatroni {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PatroniState {
                config: bootstrapped_config(),
                ..Default::default()
            }),
            role_label: "spilo-role".to_string(),
        }
    }

    pub fn config(&self) -> PatroniConfig {
        self.state.lock().unwrap().config.clone()
    }

    pub fn set_effective_config(&self, config: PatroniConfig) {
        self.state.lock().unwrap().config = config;
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unwrap().unreachable = unreachable;
    }

    /// e.g. 150004 for 15.4
    pub fn set_server_version(&self, version: u32) {
        self.state.lock().unwrap().server_version = version;
    }

    pub fn set_pending_restart(&self, pod: &str) {
        self.state
            .lock()
            .unwrap()
            .pending_restart
            .insert(pod.to_string());
    }

    pub fn deltas(&self) -> Vec<PatroniConfigDelta> {
        self.state.lock().unwrap().deltas.clone()
    }

    pub fn restarts(&self) -> Vec<String> {
        self.state.lock().unwrap().restarts.clone()
    }

    pub fn switchovers(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().switchovers.clone()
    }

    fn reachable(&self, pod: &Pod) -> PatroniResult<()> {
        if self.state.lock().unwrap().unreachable {
            return Err(PatroniError::Connection(
                pod.name_any(),
                "connection refused".to_string(),
            ));
        }
        Ok(())
    }
}

fn apply_delta(config: &mut PatroniConfig, delta: &PatroniConfigDelta) {
    if let Some(v) = delta.loop_wait {
        config.loop_wait = v;
    }
    if let Some(v) = delta.ttl {
        config.ttl = v;
    }
    if let Some(v) = delta.retry_timeout {
        config.retry_timeout = v;
    }
    if let Some(v) = delta.maximum_lag_on_failover {
        config.maximum_lag_on_failover = v;
    }
    if let Some(v) = delta.synchronous_mode {
        config.synchronous_mode = v;
    }
    if let Some(v) = delta.synchronous_mode_strict {
        config.synchronous_mode_strict = v;
    }
    if let Some(v) = delta.failsafe_mode {
        config.failsafe_mode = Some(v);
    }
    if let Some(v) = &delta.pg_hba {
        config.pg_hba = v.clone();
    }
    for (name, slot) in &delta.slots {
        match slot {
            Some(slot) => {
                config.slots.insert(name.clone(), slot.clone());
            }
            None => {
                config.slots.remove(name);
            }
        }
    }
    if let Some(postgresql) = &delta.postgresql {
        config
            .postgresql
            .parameters
            .extend(postgresql.parameters.clone());
    }
}

#[async_trait]
impl PatroniApi for FakePatroni {
    async fn get_config(&self, pod: &Pod) -> PatroniResult<PatroniConfig> {
        self.reachable(pod)?;
        Ok(self.config())
    }

    async fn get_member(&self, pod: &Pod) -> PatroniResult<PatroniMemberStatus> {
        self.reachable(pod)?;
        let state = self.state.lock().unwrap();
        let role = pod
            .labels()
            .get(&self.role_label)
            .cloned()
            .unwrap_or_else(|| "replica".to_string());
        Ok(PatroniMemberStatus {
            state: "running".to_string(),
            role,
            pending_restart: state.pending_restart.contains(&pod.name_any()),
            server_version: state.server_version,
        })
    }

    async fn set_config(&self, pod: &Pod, delta: &PatroniConfigDelta) -> PatroniResult<()> {
        self.reachable(pod)?;
        let mut state = self.state.lock().unwrap();
        apply_delta(&mut state.config, delta);
        state.deltas.push(delta.clone());
        Ok(())
    }

    async fn restart(&self, pod: &Pod) -> PatroniResult<()> {
        self.reachable(pod)?;
        let mut state = self.state.lock().unwrap();
        state.pending_restart.remove(&pod.name_any());
        state.restarts.push(pod.name_any());
        Ok(())
    }

    async fn switchover(&self, leader: &Pod, candidate: &str) -> PatroniResult<()> {
        self.reachable(leader)?;
        self.state
            .lock()
            .unwrap()
            .switchovers
            .push((leader.name_any(), candidate.to_string()));
        Ok(())
    }
}

#[derive(Default)]
struct DatabaseState {
    roles: BTreeMap<String, DbRole>,
    passwords: BTreeMap<String, String>,
    /// Database name to owner
    databases: BTreeMap<String, String>,
    /// Per database
    schemas: BTreeMap<String, BTreeMap<String, String>>,
    extensions: BTreeMap<String, BTreeMap<String, String>>,
    log: Vec<String>,
    connections: Vec<(String, String)>,
    opens: usize,
    closes: usize,
    refuse_connections: bool,
}

/// In-memory Postgres instance shared by every session
#[derive(Clone, Default)]
pub struct FakeDatabase {
    state: Arc<Mutex<DatabaseState>>,
}

impl FakeDatabase {
    pub fn new() -> Self {
        let db = Self::default();
        db.state.lock().unwrap().databases.insert("postgres".to_string(), "postgres".to_string());
        db
    }

    /// Statements executed so far, e.g. `CREATE ROLE app`
    pub fn log(&self) -> Vec<String> {
        self.state.lock().unwrap().log.clone()
    }

    pub fn clear_log(&self) {
        self.state.lock().unwrap().log.clear();
    }

    pub fn role(&self, name: &str) -> Option<DbRole> {
        self.state.lock().unwrap().roles.get(name).cloned()
    }

    pub fn role_names(&self) -> BTreeSet<String> {
        self.state.lock().unwrap().roles.keys().cloned().collect()
    }

    pub fn password(&self, name: &str) -> Option<String> {
        self.state.lock().unwrap().passwords.get(name).cloned()
    }

    pub fn add_role(&self, role: DbRole) {
        self.state.lock().unwrap().roles.insert(role.name.clone(), role);
    }

    pub fn database_owner(&self, name: &str) -> Option<String> {
        self.state.lock().unwrap().databases.get(name).cloned()
    }

    pub fn schema_owner(&self, database: &str, schema: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .schemas
            .get(database)
            .and_then(|s| s.get(schema))
            .cloned()
    }

    pub fn extension_schema(&self, database: &str, extension: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .extensions
            .get(database)
            .and_then(|e| e.get(extension))
            .cloned()
    }

    /// (user, database) of every opened session
    pub fn connections(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().connections.clone()
    }

    /// Sessions opened and closed
    pub fn session_counts(&self) -> (usize, usize) {
        let state = self.state.lock().unwrap();
        (state.opens, state.closes)
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.state.lock().unwrap().refuse_connections = refuse;
    }
}

#[async_trait]
impl DatabaseAccess for FakeDatabase {
    async fn open(&self, target: &ConnectionTarget) -> DatabaseResult<Box<dyn DatabaseSession>> {
        let mut state = self.state.lock().unwrap();
        if state.refuse_connections {
            return Err(DatabaseError::Connection(
                target.host.clone(),
                "connection refused".to_string(),
            ));
        }
        state.opens += 1;
        state
            .connections
            .push((target.user.clone(), target.database.clone()));
        Ok(Box::new(FakeSession {
            state: self.state.clone(),
            database: target.database.clone(),
        }))
    }
}

struct FakeSession {
    state: Arc<Mutex<DatabaseState>>,
    database: String,
}

impl FakeSession {
    fn write(&self, statement: String, change: impl FnOnce(&mut DatabaseState)) {
        let mut state = self.state.lock().unwrap();
        change(&mut state);
        state.log.push(statement);
    }
}

#[async_trait]
impl DatabaseSession for FakeSession {
    async fn list_roles(&mut self) -> DatabaseResult<BTreeMap<String, DbRole>> {
        Ok(self.state.lock().unwrap().roles.clone())
    }

    async fn create_role(&mut self, role: &DbRole, password: Option<&str>) -> DatabaseResult<()> {
        let role = role.clone();
        let password = password.map(str::to_string);
        self.write(format!("CREATE ROLE {}", role.name), |state| {
            if let Some(password) = password {
                state.passwords.insert(role.name.clone(), password);
            }
            state.roles.insert(role.name.clone(), role);
        });
        Ok(())
    }

    async fn alter_role(&mut self, role: &DbRole, password: Option<&str>) -> DatabaseResult<()> {
        let role = role.clone();
        let password = password.map(str::to_string);
        self.write(format!("ALTER ROLE {}", role.name), |state| {
            if let Some(password) = password {
                state.passwords.insert(role.name.clone(), password);
            }
            let entry = state.roles.entry(role.name.clone()).or_default();
            entry.name = role.name.clone();
            entry.flags = role.flags.clone();
            entry.member_of.extend(role.member_of.iter().cloned());
        });
        Ok(())
    }

    async fn drop_role(&mut self, name: &str) -> DatabaseResult<()> {
        let name = name.to_string();
        self.write(format!("DROP ROLE {name}"), |state| {
            state.roles.remove(&name);
            state.passwords.remove(&name);
        });
        Ok(())
    }

    async fn list_databases(&mut self) -> DatabaseResult<BTreeMap<String, String>> {
        Ok(self.state.lock().unwrap().databases.clone())
    }

    async fn create_database(&mut self, name: &str, owner: &str) -> DatabaseResult<()> {
        let (name, owner) = (name.to_string(), owner.to_string());
        self.write(format!("CREATE DATABASE {name} OWNER {owner}"), |state| {
            state.databases.insert(name, owner);
        });
        Ok(())
    }

    async fn set_database_owner(&mut self, name: &str, owner: &str) -> DatabaseResult<()> {
        let (name, owner) = (name.to_string(), owner.to_string());
        self.write(format!("ALTER DATABASE {name} OWNER TO {owner}"), |state| {
            state.databases.insert(name, owner);
        });
        Ok(())
    }

    async fn list_schemas(&mut self) -> DatabaseResult<BTreeSet<String>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .schemas
            .get(&self.database)
            .map(|s| s.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn create_schema(&mut self, name: &str, owner: &str) -> DatabaseResult<()> {
        let (db, name, owner) = (self.database.clone(), name.to_string(), owner.to_string());
        self.write(format!("CREATE SCHEMA {name} AUTHORIZATION {owner}"), |state| {
            state.schemas.entry(db).or_default().insert(name, owner);
        });
        Ok(())
    }

    async fn list_extensions(&mut self) -> DatabaseResult<BTreeMap<String, String>> {
        let state = self.state.lock().unwrap();
        Ok(state.extensions.get(&self.database).cloned().unwrap_or_default())
    }

    async fn create_extension(&mut self, name: &str, schema: &str) -> DatabaseResult<()> {
        let (db, name, schema) = (self.database.clone(), name.to_string(), schema.to_string());
        self.write(format!("CREATE EXTENSION {name} SCHEMA {schema}"), |state| {
            state.extensions.entry(db).or_default().insert(name, schema);
        });
        Ok(())
    }

    async fn set_extension_schema(&mut self, name: &str, schema: &str) -> DatabaseResult<()> {
        let (db, name, schema) = (self.database.clone(), name.to_string(), schema.to_string());
        self.write(format!("ALTER EXTENSION {name} SET SCHEMA {schema}"), |state| {
            state.extensions.entry(db).or_default().insert(name, schema);
        });
        Ok(())
    }

    async fn close(self: Box<Self>) {
        self.state.lock().unwrap().closes += 1;
    }
}
