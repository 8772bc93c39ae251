//! Password rotation policy
//!
//! Decides, per role and per pass, whether a credentials secret is due for
//! a new password, whether that happens in place or through a new dated
//! role, and which dated roles have outlived their retention period.

use chrono::{DateTime, Duration, NaiveDate, Utc};

use crate::config::OperatorConfig;
use crate::controller::roles::{PgUser, RoleOrigin};
use crate::crd::PostgresClusterSpec;

/// Suffix format of rotated role names
pub const ROTATION_DATE_FORMAT: &str = "%y%m%d";

/// Secret key holding the next rotation timestamp
pub const NEXT_ROTATION_KEY: &str = "nextRotation";

/// How a role's password is replaced
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RotationMode {
    /// A new login role `<role>YYMMDD` is created each time
    NewRole,
    /// The role keeps its name and gets a new password
    InPlace,
}

/// What the rotation schedule asks for on this pass
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RotationSchedule {
    /// Timestamp on the secret stays as is
    Unchanged,
    /// Timestamp is missing, unreadable or too far out
    Reschedule(DateTime<Utc>),
    /// Rotation is due; `next` is the following rotation
    Rotate { next: DateTime<Utc> },
}

/// Rotation mode for a role, or `None` when it is never rotated
pub fn rotation_mode(
    user: &PgUser,
    spec: &PostgresClusterSpec,
    config: &OperatorConfig,
) -> Option<RotationMode> {
    let listed = |list: &[String]| list.iter().any(|u| u == &user.role);

    if listed(&spec.users_ignoring_secret_rotation) {
        return None;
    }

    let in_place = listed(&spec.users_with_in_place_secret_rotation);
    let requested = in_place || listed(&spec.users_with_secret_rotation);
    let global = config.enable_password_rotation
        && !spec.is_standby()
        && !user.is_db_owner
        && matches!(user.origin, RoleOrigin::Manifest | RoleOrigin::Bootstrap);

    let eligible = global || (requested && user.role != config.super_username);
    if !eligible || !user.can_login() {
        return None;
    }
    if matches!(user.origin, RoleOrigin::Infrastructure | RoleOrigin::Monitoring) {
        return None;
    }

    // Operator roles are referenced by name from pods and poolers
    let operator_role = matches!(
        user.origin,
        RoleOrigin::System | RoleOrigin::Pooler | RoleOrigin::Stream
    );
    if in_place || operator_role {
        Some(RotationMode::InPlace)
    } else {
        Some(RotationMode::NewRole)
    }
}

/// Compare the recorded next rotation with the clock
pub fn schedule(recorded: Option<&str>, now: DateTime<Utc>, interval: Duration) -> RotationSchedule {
    let next = now + interval;
    let Some(recorded) = recorded.and_then(|r| DateTime::parse_from_rfc3339(r).ok()) else {
        return RotationSchedule::Reschedule(next);
    };
    let recorded = recorded.with_timezone(&Utc);

    if now > recorded {
        RotationSchedule::Rotate { next }
    } else if recorded > next {
        // Shortened interval pulls the date forward, never back
        RotationSchedule::Reschedule(next)
    } else {
        RotationSchedule::Unchanged
    }
}

/// Whether `username` is the role itself or one of its rotated logins
pub fn is_rotation_login(role: &str, username: &str) -> bool {
    username == role || rotation_date(role, username).is_some()
}

/// Timestamp format stored in the secret
pub fn format_rotation_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// Name of the role created by a new-role rotation
pub fn rotated_role_name(role: &str, now: DateTime<Utc>) -> String {
    format!("{role}{}", now.format(ROTATION_DATE_FORMAT))
}

/// Creation date encoded in a rotated role name, if `name` is one for `role`
pub fn rotation_date(role: &str, name: &str) -> Option<NaiveDate> {
    let suffix = name.strip_prefix(role)?;
    if suffix.len() != 6 || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    NaiveDate::parse_from_str(suffix, ROTATION_DATE_FORMAT).ok()
}

/// Rotated predecessors of `role` older than the retention period.
/// The login currently in use is never returned.
pub fn expired_rotated_roles<'a>(
    role: &str,
    existing: impl IntoIterator<Item = &'a String>,
    in_use: &str,
    now: DateTime<Utc>,
    retention: Duration,
) -> Vec<String> {
    let cutoff = (now - retention).date_naive();
    existing
        .into_iter()
        .filter(|name| name.as_str() != in_use)
        .filter(|name| rotation_date(role, name).is_some_and(|created| created < cutoff))
        .cloned()
        .collect()
}
