//! In-database objects: roles, databases, schemas and extensions
//!
//! Runs against the primary through the master service. Every session is
//! closed before the step returns, whether it succeeded or not.

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use crate::controller::error::{Error, Result};
use crate::controller::roles::{
    PgUser, RoleOrigin, owner_role, prepared_databases, prepared_schemas,
};
use crate::controller::sync::ClusterSync;
use crate::crd::PreparedDatabase;
use crate::resources::common::{PostgresRole, service_name};
use crate::resources::postgres_client::{ConnectionTarget, DatabaseSession, DbRole};
use crate::store::ResourceStore;

/// Port of the database behind the master service
pub const POSTGRES_PORT: u16 = 5432;

const MAINTENANCE_DATABASE: &str = "postgres";

impl<S: ResourceStore> ClusterSync<'_, S> {
    /// Connect to the primary as the superuser
    pub(crate) async fn open_session(&self, database: Option<&str>) -> Result<Box<dyn DatabaseSession>> {
        let superuser = self
            .state
            .roles
            .get(&self.config().super_username)
            .filter(|u| !u.password.is_empty())
            .ok_or_else(|| {
                Error::ContractViolation("superuser credentials are not loaded".to_string())
            })?;

        let target = ConnectionTarget {
            host: format!(
                "{}.{}.svc.{}",
                service_name(self.name(), PostgresRole::Master),
                self.namespace(),
                self.config().cluster_domain
            ),
            port: POSTGRES_PORT,
            database: database.unwrap_or(MAINTENANCE_DATABASE).to_string(),
            user: superuser.name.clone(),
            password: superuser.password.clone(),
        };
        Ok(self.ctx.database.open(&target).await?)
    }

    pub(crate) async fn sync_database_objects(&mut self) -> Result<()> {
        let mut session = self.open_session(None).await?;
        let result = async {
            self.sync_roles(session.as_mut()).await?;
            self.sync_databases(session.as_mut()).await
        }
        .await;
        session.close().await;
        result?;

        for (db_name, db) in prepared_databases(self.cluster) {
            let mut session = self.open_session(Some(&db_name)).await?;
            let result = sync_prepared_database(session.as_mut(), &db_name, &db).await;
            session.close().await;
            result?;
        }
        Ok(())
    }

    /// Create missing roles, then bring options, memberships and passwords
    /// in line. Memberships are granted in a second pass so groups exist
    /// before anyone joins them.
    async fn sync_roles(&mut self, session: &mut dyn DatabaseSession) -> Result<()> {
        let existing = session.list_roles().await?;
        let desired = self.desired_db_roles();

        for (role, password) in &desired {
            if existing.contains_key(&role.name) {
                continue;
            }
            let bare = DbRole {
                member_of: Default::default(),
                ..role.clone()
            };
            session.create_role(&bare, password.as_deref()).await?;
            self.remember_password(&role.name, password.as_deref());
            info!(role = %role.name, "created database role");
        }

        for (role, password) in &desired {
            let live = existing.get(&role.name);
            let drifted = live.is_none_or(|live| {
                live.flags != role.flags || !role.member_of.is_subset(&live.member_of)
            });
            let password = password
                .as_deref()
                .filter(|p| self.state.applied_passwords.get(&role.name).map(String::as_str) != Some(*p));
            if !drifted && password.is_none() {
                continue;
            }
            session.alter_role(role, password).await?;
            self.remember_password(&role.name, password);
            debug!(role = %role.name, "altered database role");
        }
        Ok(())
    }

    fn remember_password(&mut self, login: &str, password: Option<&str>) {
        if let Some(password) = password {
            self.state
                .applied_passwords
                .insert(login.to_string(), password.to_string());
        }
    }

    /// Roles the database should hold, with the password to set for login
    /// roles. A rotated user yields its dated login and the base role it
    /// inherits from.
    fn desired_db_roles(&self) -> Vec<(DbRole, Option<String>)> {
        let password = |user: &PgUser| {
            Some(user.password.clone()).filter(|p| user.can_login() && !p.is_empty())
        };

        let mut roles = Vec::new();
        // System roles are managed by Spilo from the pod environment
        for user in self.state.roles.iter().filter(|u| u.origin != RoleOrigin::System) {
            if user.is_rotated() {
                roles.push((
                    DbRole {
                        name: user.role.clone(),
                        flags: user.flags.clone(),
                        member_of: user.member_of.clone(),
                    },
                    None,
                ));
            }
            roles.push((user.db_role(), password(user)));
        }
        roles
    }

    async fn sync_databases(&self, session: &mut dyn DatabaseSession) -> Result<()> {
        let mut desired: BTreeMap<String, String> = self.spec().databases.clone();
        for db_name in prepared_databases(self.cluster).into_keys() {
            let owner = owner_role(&db_name);
            desired.entry(db_name).or_insert(owner);
        }

        let existing = session.list_databases().await?;
        for (db_name, owner) in &desired {
            if self.state.roles.get(owner).is_none() {
                warn!(database = %db_name, %owner, "database owner is not a declared role, skipping");
                continue;
            }
            match existing.get(db_name) {
                None => {
                    session.create_database(db_name, owner).await?;
                    info!(database = %db_name, %owner, "created database");
                }
                Some(current) if current != owner => {
                    session.set_database_owner(db_name, owner).await?;
                    info!(database = %db_name, from = %current, to = %owner, "changed database owner");
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

/// Schemas and extensions inside one prepared database
async fn sync_prepared_database(
    session: &mut dyn DatabaseSession,
    db_name: &str,
    db: &PreparedDatabase,
) -> Result<()> {
    let existing = session.list_schemas().await?;
    for (schema, settings) in prepared_schemas(db) {
        if existing.contains(&schema) {
            continue;
        }
        let owner = if settings.default_roles == Some(false) {
            owner_role(db_name)
        } else {
            owner_role(&format!("{db_name}_{schema}"))
        };
        session.create_schema(&schema, &owner).await?;
        info!(database = %db_name, %schema, %owner, "created schema");
    }

    let installed = session.list_extensions().await?;
    for (extension, schema) in &db.extensions {
        match installed.get(extension) {
            None => {
                session.create_extension(extension, schema).await?;
                info!(database = %db_name, %extension, %schema, "created extension");
            }
            Some(current) if current != schema => {
                session.set_extension_schema(extension, schema).await?;
                info!(database = %db_name, %extension, from = %current, to = %schema, "moved extension");
            }
            Some(_) => {}
        }
    }
    Ok(())
}
