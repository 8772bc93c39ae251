//! Credentials secrets
//!
//! Every login role gets a `<role>.<cluster>.credentials` secret. Secrets
//! are created once and then owned by their readers: the operator only
//! rewrites them when a rotation is due, when rotation was switched off
//! after a new-role rotation, or when an infrastructure password changed.

use chrono::{Duration, Utc};
use k8s_openapi::api::core::v1::{Pod, Secret};
use kube::ResourceExt;
use tracing::{debug, info, warn};

use crate::controller::error::Result;
use crate::controller::roles::{PgUser, RoleOrigin};
use crate::controller::rotation::{
    NEXT_ROTATION_KEY, RotationMode, RotationSchedule, expired_rotated_roles,
    format_rotation_time, is_rotation_login, rotated_role_name, rotation_mode, schedule,
};
use crate::controller::sync::ClusterSync;
use crate::resources::builder::{generate_credential_secret, generate_password, pooler_labels};
use crate::resources::common::{
    PostgresRole, credential_secret_name, secret_value, set_secret_value,
};
use crate::resources::postgres_client::DatabaseSession;
use crate::store::{ResourceStore, create_or_adopt, delete_if_exists};

/// Length of generated role passwords
pub const PASSWORD_LENGTH: usize = 64;

/// Outcome of reconciling one existing secret
#[derive(Debug, Default)]
struct SecretUpdate {
    changed: bool,
    /// Pods must pick up a new system password
    restart_database_pods: bool,
    /// Poolers must pick up a new pooler password
    restart_poolers: bool,
}

impl<S: ResourceStore> ClusterSync<'_, S> {
    /// Create missing credentials secrets and apply rotation to existing ones
    pub(crate) async fn sync_secrets(&mut self) -> Result<()> {
        let users: Vec<PgUser> = self.state.roles.with_credentials().cloned().collect();
        let mut restart_database_pods = false;
        let mut restart_poolers = false;

        for user in users {
            let name = credential_secret_name(&user.role, self.name());
            let existing = self.store().get::<Secret>(self.namespace(), &name).await?;

            let secret = match existing {
                None => {
                    let password = if user.password.is_empty() {
                        generate_password(PASSWORD_LENGTH)
                    } else {
                        user.password.clone()
                    };
                    let desired = generate_credential_secret(self.cluster, &user.role, &password);
                    let created = create_or_adopt(self.store(), &desired).await?;
                    info!(secret = %name, "created credentials secret");
                    created
                }
                Some(mut secret) => {
                    let update = self.update_secret(&user, &mut secret);
                    restart_database_pods |= update.restart_database_pods;
                    restart_poolers |= update.restart_poolers;
                    if update.changed {
                        match self.store().update(&secret).await {
                            Ok(updated) => {
                                debug!(secret = %name, "updated credentials secret");
                                updated
                            }
                            Err(e) => {
                                warn!(secret = %name, error = %e, "could not update credentials secret");
                                continue;
                            }
                        }
                    } else {
                        secret
                    }
                }
            };

            self.remember_credentials(&user, &secret);
            self.state.secrets.insert(name, secret);
        }

        if restart_database_pods {
            let pods = self.list_pods().await?;
            self.mark_rolling_update(&pods).await?;
        }
        if restart_poolers {
            self.restart_poolers().await?;
        }

        if let Err(e) = self.cleanup_rotated_roles().await {
            warn!(error = %e, "could not remove expired rotated roles");
        }
        Ok(())
    }

    /// Take the login and password from the secret, which wins over the
    /// registry for everything but infrastructure roles
    fn remember_credentials(&mut self, user: &PgUser, secret: &Secret) {
        let Some(entry) = self.state.roles.get_mut(&user.role) else {
            return;
        };
        if let Some(username) = secret_value(secret, "username") {
            entry.name = username;
        }
        if let Some(password) = secret_value(secret, "password") {
            entry.password = password;
        }
    }

    fn update_secret(&mut self, user: &PgUser, secret: &mut Secret) -> SecretUpdate {
        let mut update = SecretUpdate::default();
        let secret_username = secret_value(secret, "username").unwrap_or_default();

        let mode = rotation_mode(user, self.spec(), self.config());
        let foreign_login = match mode {
            Some(_) => !is_rotation_login(&user.role, &secret_username),
            None => secret_username != user.role,
        };
        if foreign_login && user.origin != RoleOrigin::Infrastructure {
            // Rotation was switched off, or the secret names another role
            info!(role = %user.role, login = %secret_username, "resetting credentials secret to its role");
            set_secret_value(secret, "username", &user.role);
            set_secret_value(secret, "password", &generate_password(PASSWORD_LENGTH));
            set_secret_value(secret, NEXT_ROTATION_KEY, "");
            if !self.state.retention_queue.contains(&user.role) {
                self.state.retention_queue.push(user.role.clone());
            }
            update.changed = true;
        } else if let Some(mode) = mode {
            self.rotate_password_in_secret(user, mode, secret, &mut update);
        }

        if user.origin == RoleOrigin::Infrastructure
            && secret_value(secret, "password").as_deref() != Some(user.password.as_str())
        {
            set_secret_value(secret, "username", &user.role);
            set_secret_value(secret, "password", &user.password);
            update.changed = true;
        }
        update
    }

    fn rotate_password_in_secret(
        &mut self,
        user: &PgUser,
        mode: RotationMode,
        secret: &mut Secret,
        update: &mut SecretUpdate,
    ) {
        let now = Utc::now();
        let interval = Duration::days(i64::from(self.config().password_rotation_interval_days));
        let recorded = secret_value(secret, NEXT_ROTATION_KEY);
        let secret_username = secret_value(secret, "username").unwrap_or_default();

        if mode == RotationMode::NewRole
            && secret_username != user.role
            && !self.state.retention_queue.contains(&user.role)
        {
            self.state.retention_queue.push(user.role.clone());
        }

        match schedule(recorded.as_deref(), now, interval) {
            RotationSchedule::Unchanged => {}
            RotationSchedule::Reschedule(next) => {
                set_secret_value(secret, NEXT_ROTATION_KEY, &format_rotation_time(next));
                update.changed = true;
            }
            RotationSchedule::Rotate { next } => {
                match mode {
                    RotationMode::NewRole => {
                        let rotated = rotated_role_name(&user.role, now);
                        info!(role = %user.role, login = %rotated, "rotating password with a new role");
                        set_secret_value(secret, "username", &rotated);
                        if !self.state.retention_queue.contains(&user.role) {
                            self.state.retention_queue.push(user.role.clone());
                        }
                    }
                    RotationMode::InPlace => {
                        info!(role = %user.role, "rotating password in place");
                        match user.origin {
                            RoleOrigin::System => update.restart_database_pods = true,
                            RoleOrigin::Pooler => update.restart_poolers = true,
                            RoleOrigin::Stream => warn!(
                                role = %user.role,
                                "stream consumers must be restarted to use the new password"
                            ),
                            _ => {}
                        }
                    }
                }
                set_secret_value(secret, "password", &generate_password(PASSWORD_LENGTH));
                set_secret_value(secret, NEXT_ROTATION_KEY, &format_rotation_time(next));
                update.changed = true;
            }
        }
    }

    /// Delete pooler pods so their Deployment recreates them with the new
    /// credentials
    async fn restart_poolers(&self) -> Result<()> {
        for role in PostgresRole::ALL {
            let pods: Vec<Pod> = self
                .store()
                .list(self.namespace(), &pooler_labels(self.name(), role))
                .await?;
            if pods.is_empty() {
                continue;
            }
            for pod in &pods {
                delete_if_exists::<Pod, _>(self.store(), self.namespace(), &pod.name_any()).await?;
            }
            info!(role = %role, pods = pods.len(), "restarted pooler pods after password rotation");
        }
        Ok(())
    }

    /// Drop dated roles left behind by new-role rotations once they are
    /// older than the retention period
    async fn cleanup_rotated_roles(&mut self) -> Result<()> {
        let queue = std::mem::take(&mut self.state.retention_queue);
        if queue.is_empty()
            || !self.config().enable_database_access
            || self.spec().number_of_instances <= 0
            || self.spec().is_standby()
        {
            return Ok(());
        }

        let mut session = self.open_session(None).await?;
        let result = self.drop_expired_roles(session.as_mut(), &queue).await;
        session.close().await;
        result
    }

    async fn drop_expired_roles(
        &self,
        session: &mut dyn DatabaseSession,
        queue: &[String],
    ) -> Result<()> {
        let existing = session.list_roles().await?;
        let now = Utc::now();
        let retention =
            Duration::days(i64::from(self.config().password_rotation_user_retention_days));

        for role in queue {
            let in_use = self
                .state
                .roles
                .get(role)
                .map(|u| u.name.clone())
                .unwrap_or_default();
            for expired in expired_rotated_roles(role, existing.keys(), &in_use, now, retention) {
                session.drop_role(&expired).await?;
                info!(role = %expired, "dropped expired rotated role");
            }
        }
        Ok(())
    }
}
