//! In-place major version upgrades
//!
//! Spilo ships `inplace_upgrade.py`, which runs `pg_upgrade` on the primary
//! and resyncs the replicas. The operator only decides when to start it.

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use kube::runtime::events::EventType;
use tracing::{debug, info, warn};

use crate::config::{MajorUpgradeMode, OperatorConfig};
use crate::controller::error::{Error, Result};
use crate::controller::statefulset::pod_role;
use crate::controller::sync::ClusterSync;
use crate::resources::common::{POSTGRES_CONTAINER, PostgresRole};
use crate::store::ResourceStore;

const UPGRADE_SCRIPT: &str = "/scripts/inplace_upgrade.py";

/// Major version to upgrade to, or `None` when nothing is due.
/// `running` is the version the primary reports.
pub fn upgrade_target(config: &OperatorConfig, declared: Option<u32>, running: u32) -> Option<u32> {
    let mut target = match config.major_version_upgrade_mode {
        MajorUpgradeMode::Off => return None,
        MajorUpgradeMode::Manual => declared?,
        MajorUpgradeMode::Full => declared.unwrap_or(running),
    };
    if config.major_version_upgrade_mode == MajorUpgradeMode::Full
        && running < config.minimal_major_version
    {
        target = target.max(config.target_major_version);
    }
    (target > running).then_some(target)
}

/// Shell command run in the primary's database container
pub fn upgrade_command(instances: i32) -> Vec<String> {
    vec![
        "/bin/bash".to_string(),
        "-c".to_string(),
        format!(
            "set -o pipefail && /usr/bin/python3 {UPGRADE_SCRIPT} {instances} 2>&1 | tee last_upgrade.log"
        ),
    ]
}

impl<S: ResourceStore> ClusterSync<'_, S> {
    pub(crate) async fn major_version_upgrade(&mut self) -> Result<()> {
        if self.spec().is_standby() || self.state.restore_in_progress() {
            debug!("major version upgrade not applicable");
            return Ok(());
        }

        let pods = self.list_pods().await?;
        let label = &self.config().pod_role_label;
        let Some(primary) = pods
            .iter()
            .find(|p| pod_role(p, label) == Some(PostgresRole::Master))
            .cloned()
        else {
            return Err(Error::PrimaryPodMissing(self.name().to_string()));
        };

        let member = self.ctx.patroni.get_member(&primary).await?;
        let Some(running) = member.major_version() else {
            debug!("primary did not report its server version");
            return Ok(());
        };

        let declared = self.spec().major_version();
        if let Some(declared) = declared
            && declared < running
        {
            warn!(declared, running, "manifest version is below the running version, downgrades are not possible");
            return Ok(());
        }
        let Some(target) = upgrade_target(self.config(), declared, running) else {
            return Ok(());
        };

        if !self.all_members_running(&pods).await? {
            info!(target, "postponing major version upgrade until every member is running");
            return Ok(());
        }

        self.event(
            EventType::Normal,
            "MajorVersionUpgrade",
            &format!("starting upgrade from {running} to {target} on {}", primary.name_any()),
        )
        .await;
        info!(from = running, to = target, pod = %primary.name_any(), "starting major version upgrade");

        let output = self
            .store()
            .exec(
                self.namespace(),
                &primary.name_any(),
                POSTGRES_CONTAINER,
                upgrade_command(self.spec().number_of_instances),
            )
            .await;
        match output {
            Ok(output) => {
                debug!(%output, "upgrade script finished");
                self.event(
                    EventType::Normal,
                    "MajorVersionUpgrade",
                    &format!("upgrade from {running} to {target} finished"),
                )
                .await;
                Ok(())
            }
            Err(e) => {
                self.event(
                    EventType::Warning,
                    "MajorVersionUpgrade",
                    &format!("upgrade from {running} to {target} failed: {e}"),
                )
                .await;
                Err(e.into())
            }
        }
    }

    async fn all_members_running(&self, pods: &[Pod]) -> Result<bool> {
        if pods.len() < usize::try_from(self.spec().number_of_instances).unwrap_or_default() {
            return Ok(false);
        }
        for pod in pods {
            if !self.ctx.patroni.get_member(pod).await?.is_running() {
                return Ok(false);
            }
        }
        Ok(true)
    }
}
