//! Sync steps for the objects around the StatefulSet
//!
//! Each step compares what is live with the builders' output and writes
//! only when they differ, so a pass over a converged cluster is read-only.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::CronJob;
use k8s_openapi::api::core::v1::{
    ConfigMap, Endpoints, PersistentVolumeClaim, Secret, Service,
};
use kube::ResourceExt;
use kube::runtime::events::EventType;
use tracing::{debug, info, warn};

use crate::controller::error::{Error, Result};
use crate::controller::sync::ClusterSync;
use crate::crd::{PostgresEventStream, VolumeSpec};
use crate::resources::builder::{
    generate_endpoints, generate_event_stream, generate_headless_service,
    generate_logical_backup_cronjob, generate_monitoring_secret, generate_pdb,
    generate_pgbackrest_cert_secret, generate_pgbackrest_configmap, generate_pgbackrest_cronjobs,
    generate_pooler_deployment, generate_pooler_service, generate_repo_host_configmap,
    generate_repo_host_statefulset, generate_service,
};
use crate::resources::common::{
    BACKUP_TYPES, MONITORING_USER, PostgresRole, REPO_NAMES, backup_cronjob_name,
    credential_secret_name, logical_backup_job_name, pgbackrest_cert_secret_name,
    pgbackrest_configmap_name, pooler_name, repo_host_configmap_name, repo_host_statefulset_name,
    standard_labels, wal_volume_name,
};
use crate::resources::compare::{
    compare_cronjobs, compare_pdbs, compare_services, compare_statefulsets,
};
use crate::store::{ResourceStore, StoreError, StoredResource, create_or_adopt, delete_if_exists};

/// Name of the data volume claim template
const PGDATA_VOLUME: &str = "pgdata";

impl<S: ResourceStore> ClusterSync<'_, S> {
    /// Create `desired` if missing, or update the live object when `differs`
    /// reports reasons. Returns the object as stored.
    async fn ensure<K, F>(&self, desired: &K, differs: F) -> Result<K>
    where
        K: StoredResource,
        F: Fn(&K, &K) -> Vec<String>,
    {
        let name = desired.name_any();
        let Some(live) = self.store().get::<K>(self.namespace(), &name).await? else {
            let created = create_or_adopt(self.store(), desired).await?;
            info!(kind = %K::kind(&()), %name, "created object");
            return Ok(created);
        };

        let reasons = differs(&live, desired);
        if reasons.is_empty() {
            return Ok(live);
        }
        info!(kind = %K::kind(&()), %name, reasons = ?reasons, "updating object");
        let mut update = desired.clone();
        update.meta_mut().resource_version = live.resource_version();
        Ok(self.store().update(&update).await?)
    }

    /// Delete an object if present, logging when something was removed
    async fn remove<K: StoredResource>(&self, name: &str) -> Result<()> {
        if delete_if_exists::<K, _>(self.store(), self.namespace(), name).await? {
            info!(kind = %K::kind(&()), %name, "deleted object");
        }
        Ok(())
    }

    pub(crate) async fn sync_services(&mut self) -> Result<()> {
        for role in PostgresRole::ALL {
            let mut desired = generate_service(self.cluster, self.config(), role);
            let name = desired.name_any();
            let service = match self.store().get::<Service>(self.namespace(), &name).await? {
                None => create_or_adopt(self.store(), &desired).await?,
                Some(live) => {
                    let reasons = compare_services(&live, &desired);
                    if reasons.is_empty() {
                        live
                    } else {
                        info!(service = %name, reasons = ?reasons, "updating service");
                        // Cluster IPs are immutable once assigned
                        if let (Some(spec), Some(live_spec)) = (desired.spec.as_mut(), live.spec.as_ref()) {
                            spec.cluster_ip = live_spec.cluster_ip.clone();
                            spec.cluster_ips = live_spec.cluster_ips.clone();
                        }
                        desired.metadata.resource_version = live.resource_version();
                        self.store().update(&desired).await?
                    }
                }
            };
            *self.state.services.get_mut(role) = Some(service);

            if !self.config().kubernetes_use_configmaps {
                // Addresses belong to Patroni; only existence is ours
                let desired = generate_endpoints(self.cluster, self.config(), role);
                let endpoints = match self
                    .store()
                    .get::<Endpoints>(self.namespace(), &desired.name_any())
                    .await?
                {
                    Some(live) => live,
                    None => create_or_adopt(self.store(), &desired).await?,
                };
                *self.state.endpoints.get_mut(role) = Some(endpoints);
            }
        }

        let headless = generate_headless_service(self.cluster);
        if self
            .store()
            .get::<Service>(self.namespace(), &headless.name_any())
            .await?
            .is_none()
        {
            create_or_adopt(self.store(), &headless).await?;
        }
        Ok(())
    }

    /// pgBackRest configuration, TLS material and the repo host
    pub(crate) async fn sync_backup_config(&mut self) -> Result<()> {
        let Some(pgbackrest) = self.spec().pgbackrest().cloned() else {
            self.remove::<StatefulSet>(&repo_host_statefulset_name(self.name())).await?;
            self.remove::<ConfigMap>(&repo_host_configmap_name(self.name())).await?;
            self.remove::<ConfigMap>(&pgbackrest_configmap_name(self.name())).await?;
            self.remove::<Secret>(&pgbackrest_cert_secret_name(self.name())).await?;
            return Ok(());
        };

        let desired = generate_pgbackrest_configmap(self.cluster, self.config(), &pgbackrest)?;
        self.ensure(&desired, configmap_differs).await?;

        // Certificates are issued once; regenerating them would break the
        // trust between the repo host and running pods
        let cert_name = pgbackrest_cert_secret_name(self.name());
        if self
            .store()
            .get::<Secret>(self.namespace(), &cert_name)
            .await?
            .is_none()
        {
            let secret = generate_pgbackrest_cert_secret(self.cluster, self.config())?;
            create_or_adopt(self.store(), &secret).await?;
            info!(secret = %cert_name, "issued pgBackRest certificates");
        }

        match generate_repo_host_statefulset(self.cluster, self.config())? {
            Some(desired) => {
                let configmap = generate_repo_host_configmap(self.cluster, self.config(), &pgbackrest)?;
                self.ensure(&configmap, configmap_differs).await?;
                self.sync_repo_host(&desired).await?;
            }
            None => {
                self.remove::<StatefulSet>(&repo_host_statefulset_name(self.name())).await?;
                self.remove::<ConfigMap>(&repo_host_configmap_name(self.name())).await?;
            }
        }
        Ok(())
    }

    async fn sync_repo_host(&self, desired: &StatefulSet) -> Result<()> {
        let name = desired.name_any();
        let Some(live) = self.store().get::<StatefulSet>(self.namespace(), &name).await? else {
            create_or_adopt(self.store(), desired).await?;
            info!(statefulset = %name, "created pgBackRest repo host");
            return Ok(());
        };

        let cmp = compare_statefulsets(&live, desired, &self.config().inherited_annotations);
        if cmp.matches {
            return Ok(());
        }
        if cmp.replace {
            info!(statefulset = %name, reasons = ?cmp.reasons, "replacing pgBackRest repo host");
            match self.store().delete::<StatefulSet>(self.namespace(), &name).await {
                Ok(()) | Err(StoreError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
            self.store().create(desired).await?;
        } else {
            debug!(statefulset = %name, reasons = ?cmp.reasons, "updating pgBackRest repo host");
            let mut update = desired.clone();
            update.metadata.resource_version = live.resource_version();
            self.store().update(&update).await?;
        }
        Ok(())
    }

    /// Grow data volumes and move them to the target attributes class
    pub(crate) async fn sync_volumes(&mut self) -> Result<()> {
        let volume = self.spec().volume.clone();
        let prefix = format!("{PGDATA_VOLUME}-{}-", self.name());
        self.sync_claims(&prefix, &volume).await
    }

    async fn sync_claims(&self, prefix: &str, volume: &VolumeSpec) -> Result<()> {
        let claims = self.list_claims(prefix).await?;
        let target_class = volume
            .volume_attributes_class
            .clone()
            .or_else(|| self.config().target_volume_attributes_class.clone());
        let wanted = parse_quantity(&volume.size).ok_or_else(|| {
            Error::InvalidConfig(format!("volume size {:?} is not a quantity", volume.size))
        })?;

        for claim in &claims {
            let name = claim.name_any();
            let spec = claim.spec.clone().unwrap_or_default();
            let current = spec
                .resources
                .as_ref()
                .and_then(|r| r.requests.as_ref())
                .and_then(|r| r.get("storage"))
                .map(|q| q.0.clone())
                .unwrap_or_default();

            match parse_quantity(&current) {
                Some(size) if size < wanted => {
                    info!(claim = %name, from = %current, to = %volume.size, "resizing volume");
                    let patch = add_patch(
                        "/spec/resources/requests/storage",
                        serde_json::json!(volume.size),
                    )?;
                    self.store()
                        .patch::<PersistentVolumeClaim>(self.namespace(), &name, &patch)
                        .await?;
                }
                Some(size) if size > wanted => {
                    warn!(claim = %name, from = %current, to = %volume.size, "volumes cannot shrink");
                }
                _ => {}
            }

            if let Some(class) = &target_class
                && spec.volume_attributes_class_name.as_ref() != Some(class)
            {
                info!(claim = %name, class = %class, "migrating volume attributes class");
                let patch = add_patch("/spec/volumeAttributesClassName", serde_json::json!(class))?;
                self.store()
                    .patch::<PersistentVolumeClaim>(self.namespace(), &name, &patch)
                    .await?;
            }
        }
        Ok(())
    }

    /// Claims created from a StatefulSet volume template carry no labels of
    /// ours, so they are matched by their `<template>-<statefulset>-` prefix
    async fn list_claims(&self, prefix: &str) -> Result<Vec<PersistentVolumeClaim>> {
        let claims: Vec<PersistentVolumeClaim> =
            self.store().list(self.namespace(), &BTreeMap::new()).await?;
        Ok(claims
            .into_iter()
            .filter(|c| c.name_any().starts_with(prefix))
            .collect())
    }

    pub(crate) async fn sync_pod_disruption_budget(&mut self) -> Result<()> {
        let desired = generate_pdb(self.cluster, self.config());
        let pdb = self.ensure(&desired, compare_pdbs).await?;
        self.state.pdb = Some(pdb);
        Ok(())
    }

    pub(crate) async fn sync_logical_backup_job(&mut self) -> Result<()> {
        let name = logical_backup_job_name(self.name());
        if !self.spec().enable_logical_backup {
            return self.remove::<CronJob>(&name).await;
        }
        let desired = generate_logical_backup_cronjob(self.cluster, self.config());
        self.ensure(&desired, compare_cronjobs).await?;
        Ok(())
    }

    /// One CronJob per declared repository schedule; every other
    /// repository and backup type combination is removed
    pub(crate) async fn sync_backup_schedules(&mut self) -> Result<()> {
        let desired = match self.spec().pgbackrest() {
            Some(pgbackrest) => generate_pgbackrest_cronjobs(self.cluster, self.config(), pgbackrest)?,
            None => Vec::new(),
        };
        let declared: BTreeSet<String> = desired.iter().map(ResourceExt::name_any).collect();

        for cronjob in &desired {
            self.ensure(cronjob, compare_cronjobs).await?;
        }
        for repo in REPO_NAMES {
            for backup_type in BACKUP_TYPES {
                let name = backup_cronjob_name(self.name(), repo, backup_type);
                if !declared.contains(&name) {
                    self.remove::<CronJob>(&name).await?;
                }
            }
        }
        Ok(())
    }

    pub(crate) async fn sync_connection_pooler(&mut self) -> Result<()> {
        let pooler = self.spec().connection_pooler.clone();
        for role in PostgresRole::ALL {
            let wanted = match (&pooler, role) {
                (Some(_), PostgresRole::Master) => true,
                (Some(p), PostgresRole::Replica) => p.enable_replica_pooler,
                (None, _) => false,
            };
            let Some(spec) = pooler.as_ref().filter(|_| wanted) else {
                let name = pooler_name(self.name(), role);
                self.remove::<Deployment>(&name).await?;
                self.remove::<Service>(&name).await?;
                continue;
            };

            let deployment = generate_pooler_deployment(self.cluster, self.config(), spec, role);
            self.ensure(&deployment, deployment_differs).await?;
            let service = generate_pooler_service(self.cluster, role);
            self.ensure(&service, compare_services).await?;
        }
        Ok(())
    }

    /// The exporter secret exists exactly while monitoring is configured
    pub(crate) async fn sync_monitoring_secret(&mut self) -> Result<()> {
        let name = credential_secret_name(MONITORING_USER, self.name());
        if self.spec().monitoring.is_none() {
            return self.remove::<Secret>(&name).await;
        }
        if self
            .store()
            .get::<Secret>(self.namespace(), &name)
            .await?
            .is_none()
        {
            create_or_adopt(self.store(), &generate_monitoring_secret(self.cluster)).await?;
            info!(secret = %name, "created monitoring secret");
        }
        Ok(())
    }

    /// Resize WAL volumes, or drop their claims once the WAL volume was
    /// removed from the manifest
    pub(crate) async fn sync_wal_volumes(&mut self) -> Result<()> {
        let prefix = format!("{}-{}-", wal_volume_name(self.name()), self.name());
        if let Some(volume) = self.spec().wal_pvc.clone() {
            return self.sync_claims(&prefix, &volume).await;
        }

        let orphaned: Vec<String> = self
            .list_claims(&prefix)
            .await?
            .iter()
            .map(ResourceExt::name_any)
            .collect();
        for name in &orphaned {
            self.remove::<PersistentVolumeClaim>(name).await?;
        }
        if !orphaned.is_empty() {
            self.event(
                EventType::Normal,
                "WalVolumes",
                &format!("deleted {} WAL volume claims", orphaned.len()),
            )
            .await;
        }
        Ok(())
    }

    /// One event stream per declared application; stale ones are deleted
    pub(crate) async fn sync_streams(&mut self) -> Result<()> {
        let desired: Vec<PostgresEventStream> = self
            .spec()
            .streams
            .iter()
            .map(|stream| generate_event_stream(self.cluster, stream))
            .collect();
        let declared: BTreeSet<String> = desired.iter().map(ResourceExt::name_any).collect();

        for stream in &desired {
            self.ensure(stream, |live: &PostgresEventStream, want| {
                if live.spec == want.spec {
                    Vec::new()
                } else {
                    vec!["stream spec changed".to_string()]
                }
            })
            .await?;
        }

        let live: Vec<PostgresEventStream> = self
            .store()
            .list(self.namespace(), &standard_labels(self.name()))
            .await?;
        for stream in live.iter().filter(|s| !declared.contains(&s.name_any())) {
            self.remove::<PostgresEventStream>(&stream.name_any()).await?;
        }
        Ok(())
    }
}

fn configmap_differs(live: &ConfigMap, desired: &ConfigMap) -> Vec<String> {
    if live.data == desired.data {
        Vec::new()
    } else {
        vec!["data changed".to_string()]
    }
}

fn deployment_differs(live: &Deployment, desired: &Deployment) -> Vec<String> {
    let mut reasons = Vec::new();
    let (live, want) = (
        live.spec.clone().unwrap_or_default(),
        desired.spec.clone().unwrap_or_default(),
    );
    if live.replicas != want.replicas {
        reasons.push(format!("replicas changed from {:?} to {:?}", live.replicas, want.replicas));
    }
    let container = |spec: &k8s_openapi::api::apps::v1::DeploymentSpec| {
        spec.template
            .spec
            .as_ref()
            .and_then(|p| p.containers.first().cloned())
            .unwrap_or_default()
    };
    let (live, want) = (container(&live), container(&want));
    if live.image != want.image {
        reasons.push("image changed".to_string());
    }
    if live.env != want.env {
        reasons.push("environment changed".to_string());
    }
    reasons
}

/// Single-operation `add` patch, which also replaces an existing member
fn add_patch(path: &str, value: serde_json::Value) -> Result<json_patch::Patch> {
    Ok(serde_json::from_value(serde_json::json!([
        { "op": "add", "path": path, "value": value }
    ]))?)
}

/// Storage quantity in bytes, rounded up to a whole byte; `None` for
/// anything unparseable or too large
///
/// Accepts the Kubernetes forms: a decimal number followed by a binary
/// suffix (`Ki` to `Ei`), a decimal suffix (`n` to `E`) or an exponent
/// (`e3`, `E-2`).
pub fn parse_quantity(quantity: &str) -> Option<u128> {
    let quantity = quantity.trim();
    let quantity = quantity.strip_prefix('+').unwrap_or(quantity);
    let split = quantity
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(quantity.len());
    let (number, suffix) = quantity.split_at(split);
    let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
    if (whole.is_empty() && fraction.is_empty()) || fraction.contains('.') {
        return None;
    }
    let mantissa: u128 = format!("{whole}{fraction}").parse().ok()?;

    let (multiplier, divisor): (u128, u128) = match suffix {
        "" => (1, 1),
        "Ki" => (1 << 10, 1),
        "Mi" => (1 << 20, 1),
        "Gi" => (1 << 30, 1),
        "Ti" => (1 << 40, 1),
        "Pi" => (1 << 50, 1),
        "Ei" => (1 << 60, 1),
        "n" => (1, 1_000_000_000),
        "u" => (1, 1_000_000),
        "m" => (1, 1_000),
        "k" => (1_000, 1),
        "M" => (1_000_000, 1),
        "G" => (1_000_000_000, 1),
        "T" => (1_000_000_000_000, 1),
        "P" => (1_000_000_000_000_000, 1),
        "E" => (1_000_000_000_000_000_000, 1),
        exponent => {
            let exponent: i32 = exponent.strip_prefix(['e', 'E'])?.parse().ok()?;
            let power = 10u128.checked_pow(exponent.unsigned_abs())?;
            if exponent < 0 {
                (1, power)
            } else {
                (power, 1)
            }
        }
    };
    let scale = 10u128.checked_pow(u32::try_from(fraction.len()).ok()?)?;
    Some(mantissa.checked_mul(multiplier)?.div_ceil(divisor.checked_mul(scale)?))
}
