//! The ordered steps of one sync pass and how their failures are treated

use std::fmt;

use crate::controller::error::Error;

/// One step of a sync pass
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SyncStep {
    RefreshRestoreMarker,
    InitRoles,
    Secrets,
    Services,
    BackupConfig,
    Volumes,
    StatefulSet,
    PodDisruptionBudget,
    LogicalBackup,
    PhysicalBackupSchedules,
    DatabaseObjects,
    ConnectionPooler,
    MonitoringSecret,
    WalVolumes,
    Streams,
    Restore,
    MajorVersionUpgrade,
}

/// How a failing step affects the rest of the pass
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    /// Abort the pass and mark the cluster as failed
    Fatal,
    /// Log a warning and continue with the next step
    Soft,
}

impl SyncStep {
    /// Execution order. Infrastructure comes before the restore, and the
    /// major version upgrade must stay last.
    pub const ORDER: [SyncStep; 17] = [
        SyncStep::RefreshRestoreMarker,
        SyncStep::InitRoles,
        SyncStep::Secrets,
        SyncStep::Services,
        SyncStep::BackupConfig,
        SyncStep::Volumes,
        SyncStep::StatefulSet,
        SyncStep::PodDisruptionBudget,
        SyncStep::LogicalBackup,
        SyncStep::PhysicalBackupSchedules,
        SyncStep::DatabaseObjects,
        SyncStep::ConnectionPooler,
        SyncStep::MonitoringSecret,
        SyncStep::WalVolumes,
        SyncStep::Streams,
        SyncStep::Restore,
        SyncStep::MajorVersionUpgrade,
    ];

    pub fn severity(self) -> Severity {
        match self {
            SyncStep::DatabaseObjects | SyncStep::MajorVersionUpgrade => Severity::Soft,
            _ => Severity::Fatal,
        }
    }

    /// A concurrent actor creating the same object is not a failure
    pub fn tolerates_already_exists(self) -> bool {
        matches!(self, SyncStep::StatefulSet)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SyncStep::RefreshRestoreMarker => "refresh-restore-marker",
            SyncStep::InitRoles => "init-roles",
            SyncStep::Secrets => "secrets",
            SyncStep::Services => "services",
            SyncStep::BackupConfig => "backup-config",
            SyncStep::Volumes => "volumes",
            SyncStep::StatefulSet => "statefulset",
            SyncStep::PodDisruptionBudget => "pod-disruption-budget",
            SyncStep::LogicalBackup => "logical-backup",
            SyncStep::PhysicalBackupSchedules => "physical-backup-schedules",
            SyncStep::DatabaseObjects => "database-objects",
            SyncStep::ConnectionPooler => "connection-pooler",
            SyncStep::MonitoringSecret => "monitoring-secret",
            SyncStep::WalVolumes => "wal-volumes",
            SyncStep::Streams => "streams",
            SyncStep::Restore => "restore",
            SyncStep::MajorVersionUpgrade => "major-version-upgrade",
        }
    }
}

impl fmt::Display for SyncStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of running (or not running) one step
#[derive(Debug)]
pub enum StepOutcome {
    Ok,
    /// Preconditions not met; the reason is logged
    Skipped(&'static str),
    Soft(Error),
    Fatal(Error),
}

impl StepOutcome {
    /// Classify the result of a step that ran
    pub fn classify(step: SyncStep, result: Result<(), Error>) -> Self {
        match result {
            Ok(()) => StepOutcome::Ok,
            Err(e) if step.tolerates_already_exists() && e.is_already_exists() => StepOutcome::Ok,
            Err(e) => match step.severity() {
                Severity::Soft => StepOutcome::Soft(e.in_step(step)),
                Severity::Fatal => StepOutcome::Fatal(e.in_step(step)),
            },
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, StepOutcome::Fatal(_))
    }
}
