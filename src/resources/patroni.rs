//! Patroni REST API client and configuration types
//!
//! The operator reaches each pod's Patroni API directly on port 8008 to
//! read the dynamic configuration, patch it, and restart members.
//!
//! # Requirements
//!
//! The operator must run inside the Kubernetes cluster with network access
//! to pod IPs. The API is plain HTTP without authentication.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::Request;
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use serde::{Deserialize, Deserializer, Serialize};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::controller::error::{BackoffConfig, retry_with_backoff};

/// Overall timeout for one HTTP exchange (connect + request + response)
const OVERALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Patroni REST API port
pub const PATRONI_PORT: u16 = 8008;

/// Parameters Patroni only honours in the member-local `postgresql`
/// section. They are written at bootstrap and never patched through the DCS.
pub const LOCAL_ONLY_PARAMETERS: [&str; 20] = [
    "archive_command",
    "shared_buffers",
    "logging_collector",
    "log_destination",
    "log_directory",
    "log_filename",
    "log_file_mode",
    "log_rotation_age",
    "log_truncate_on_rotation",
    "ssl",
    "ssl_ca_file",
    "ssl_crl_file",
    "ssl_cert_file",
    "ssl_key_file",
    "shared_preload_libraries",
    "bg_mon.listen_address",
    "bg_mon.history_buckets",
    "pg_stat_statements.track_utility",
    "extwlist.extensions",
    "extwlist.custom_path",
];

/// Whether a parameter lives in the DCS and can be changed through `PATCH /config`
pub fn is_dcs_parameter(name: &str) -> bool {
    !LOCAL_ONLY_PARAMETERS.contains(&name)
}

pub type PatroniResult<T> = std::result::Result<T, PatroniError>;

#[derive(Debug, thiserror::Error)]
pub enum PatroniError {
    #[error("pod {0} has no IP")]
    NoPodIp(String),

    #[error("connection to {0} failed: {1}")]
    Connection(String, String),

    #[error("HTTP {status} from {pod}: {body}")]
    Http { pod: String, status: u16, body: String },

    #[error("request to {0} timed out")]
    Timeout(String),

    #[error("malformed response: {0}")]
    Json(#[from] serde_json::Error),
}

impl PatroniError {
    /// A member that is restarting or briefly unreachable answers again
    /// shortly; an HTTP answer is final.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PatroniError::Connection(..) | PatroniError::Timeout(_))
    }
}

/// Dynamic configuration as returned by `GET /config`
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct PatroniConfig {
    #[serde(default)]
    pub ttl: u32,
    #[serde(default)]
    pub loop_wait: u32,
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
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pg_hba: Vec<String>,
    #[serde(default, deserialize_with = "string_slots", skip_serializing_if = "BTreeMap::is_empty")]
    pub slots: BTreeMap<String, BTreeMap<String, String>>,
    #[serde(default)]
    pub postgresql: PatroniPostgresql,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct PatroniPostgresql {
    /// Parameter values rendered as strings; Patroni mixes numbers and strings
    #[serde(default, deserialize_with = "string_values")]
    pub parameters: BTreeMap<String, String>,
}

impl PatroniConfig {
    /// A member still bootstrapping reports an empty configuration
    pub fn is_empty(&self) -> bool {
        *self == PatroniConfig::default() || self.postgresql.parameters.is_empty()
    }
}

/// Member status as returned by `GET /patroni`
#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
pub struct PatroniMemberStatus {
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub pending_restart: bool,
    /// e.g. 160004 for 16.4
    #[serde(default)]
    pub server_version: u32,
}

impl PatroniMemberStatus {
    pub fn is_primary(&self) -> bool {
        matches!(self.role.as_str(), "master" | "primary")
    }

    pub fn is_running(&self) -> bool {
        self.state == "running"
    }

    /// Major version of the running server, if reported
    pub fn major_version(&self) -> Option<u32> {
        (self.server_version > 0).then_some(self.server_version / 10000)
    }
}

/// Changes to push through `PATCH /config`
///
/// Only fields that differ from the effective configuration are set.
#[derive(Serialize, Clone, Debug, Default, PartialEq)]
pub struct PatroniConfigDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loop_wait: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maximum_lag_on_failover: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_timeout: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub synchronous_mode: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub synchronous_mode_strict: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failsafe_mode: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pg_hba: Option<Vec<String>>,
    /// `None` removes the slot
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub slots: BTreeMap<String, Option<BTreeMap<String, String>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub postgresql: Option<PostgresqlDelta>,
}

#[derive(Serialize, Clone, Debug, Default, PartialEq)]
pub struct PostgresqlDelta {
    pub parameters: BTreeMap<String, String>,
}

impl PatroniConfigDelta {
    pub fn is_empty(&self) -> bool {
        !self.has_consensus_changes() && self.postgresql.is_none()
    }

    /// Whether anything besides postgresql parameters changes
    pub fn has_consensus_changes(&self) -> bool {
        self.loop_wait.is_some()
            || self.maximum_lag_on_failover.is_some()
            || self.retry_timeout.is_some()
            || self.ttl.is_some()
            || self.synchronous_mode.is_some()
            || self.synchronous_mode_strict.is_some()
            || self.failsafe_mode.is_some()
            || self.pg_hba.is_some()
            || !self.slots.is_empty()
    }

    pub fn set_parameter(&mut self, name: &str, value: &str) {
        self.postgresql
            .get_or_insert_with(PostgresqlDelta::default)
            .parameters
            .insert(name.to_string(), value.to_string());
    }
}

/// Per-pod Patroni REST operations
#[async_trait]
pub trait PatroniApi: Send + Sync {
    async fn get_config(&self, pod: &Pod) -> PatroniResult<PatroniConfig>;

    async fn get_member(&self, pod: &Pod) -> PatroniResult<PatroniMemberStatus>;

    async fn set_config(&self, pod: &Pod, delta: &PatroniConfigDelta) -> PatroniResult<()>;

    /// Restart postgres if Patroni reports a pending restart
    async fn restart(&self, pod: &Pod) -> PatroniResult<()>;

    /// Hand leadership from `leader` to the member named `candidate`
    async fn switchover(&self, leader: &Pod, candidate: &str) -> PatroniResult<()>;
}

/// [`PatroniApi`] over HTTP/1.1 to the pod IP
///
/// Connection failures and timeouts are retried with backoff.
#[derive(Clone, Debug)]
pub struct HttpPatroniClient {
    port: u16,
    backoff: BackoffConfig,
    attempts: u32,
}

impl Default for HttpPatroniClient {
    fn default() -> Self {
        Self::new(3)
    }
}

impl HttpPatroniClient {
    pub fn new(attempts: u32) -> Self {
        Self {
            port: PATRONI_PORT,
            backoff: BackoffConfig::for_api_calls(),
            attempts: attempts.max(1),
        }
    }

    /// Reach Patroni on a port other than 8008
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    async fn call(
        &self,
        pod: &Pod,
        method: &str,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> PatroniResult<Bytes> {
        let name = pod.name_any();
        let ip = pod
            .status
            .as_ref()
            .and_then(|s| s.pod_ip.clone())
            .ok_or_else(|| PatroniError::NoPodIp(name.clone()))?;
        let addr = format!("{ip}:{}", self.port);

        retry_with_backoff(&self.backoff, self.attempts, path, || {
            let body = body.clone();
            let (name, addr) = (&name, &addr);
            async move {
                timeout(OVERALL_TIMEOUT, send(name, addr, method, path, body))
                    .await
                    .map_err(|_| PatroniError::Timeout(name.clone()))?
            }
        })
        .await
    }
}

async fn send(
    pod: &str,
    host: &str,
    method: &str,
    path: &str,
    body: Option<Vec<u8>>,
) -> PatroniResult<Bytes> {
    let connection_error = |e: String| PatroniError::Connection(pod.to_string(), e);

    let addr: SocketAddr = host
        .parse()
        .map_err(|e| connection_error(format!("invalid address: {e}")))?;
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| connection_error(e.to_string()))?;

    let (mut sender, conn) = http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| connection_error(e.to_string()))?;
    let pod_name = pod.to_string();
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(pod = %pod_name, "Patroni connection closed: {}", e);
        }
    });

    let mut builder = Request::builder()
        .method(method)
        .uri(path)
        .header("Host", host);
    if body.is_some() {
        builder = builder.header("Content-Type", "application/json");
    }
    let req = builder
        .body(Full::new(Bytes::from(body.unwrap_or_default())))
        .map_err(|e| connection_error(e.to_string()))?;

    let response = sender
        .send_request(req)
        .await
        .map_err(|e| connection_error(e.to_string()))?;
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .map_err(|e| connection_error(e.to_string()))?
        .to_bytes();

    trace!(pod, method, path, status = status.as_u16(), "Patroni response");

    if !status.is_success() {
        return Err(PatroniError::Http {
            pod: pod.to_string(),
            status: status.as_u16(),
            body: String::from_utf8_lossy(&bytes).into_owned(),
        });
    }
    Ok(bytes)
}

#[async_trait]
impl PatroniApi for HttpPatroniClient {
    async fn get_config(&self, pod: &Pod) -> PatroniResult<PatroniConfig> {
        let body = self.call(pod, "GET", "/config", None).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn get_member(&self, pod: &Pod) -> PatroniResult<PatroniMemberStatus> {
        let body = self.call(pod, "GET", "/patroni", None).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn set_config(&self, pod: &Pod, delta: &PatroniConfigDelta) -> PatroniResult<()> {
        let body = serde_json::to_vec(delta)?;
        self.call(pod, "PATCH", "/config", Some(body)).await?;
        Ok(())
    }

    async fn restart(&self, pod: &Pod) -> PatroniResult<()> {
        let body = serde_json::to_vec(&serde_json::json!({ "restart_pending": true }))?;
        self.call(pod, "POST", "/restart", Some(body)).await?;
        Ok(())
    }

    async fn switchover(&self, leader: &Pod, candidate: &str) -> PatroniResult<()> {
        let body = serde_json::to_vec(&serde_json::json!({
            "leader": leader.name_any(),
            "candidate": candidate,
        }))?;
        self.call(leader, "POST", "/switchover", Some(body)).await?;
        Ok(())
    }
}

fn value_to_string(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    }
}

fn string_values<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<BTreeMap<String, serde_json::Value>>::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .map(|(k, v)| (k, value_to_string(v)))
        .collect())
}

fn string_slots<'de, D>(
    deserializer: D,
) -> Result<BTreeMap<String, BTreeMap<String, String>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<BTreeMap<String, BTreeMap<String, serde_json::Value>>>::deserialize(
        deserializer,
    )?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .map(|(slot, fields)| {
            let fields = fields
                .into_iter()
                .map(|(k, v)| (k, value_to_string(v)))
                .collect();
            (slot, fields)
        })
        .collect())
}
