use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// PostgresEventStream configures one change data capture consumer
///
/// The operator creates one per application declared in a cluster's
/// `streams`; the consumer reads from the logical replication slot in
/// `slot`.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[kube(
    group = "pgcluster.io",
    version = "v1",
    kind = "PostgresEventStream",
    plural = "postgreseventstreams",
    shortname = "pges",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct PostgresEventStreamSpec {
    pub application_id: String,
    pub cluster: String,
    pub database: String,
    /// Logical replication slot the consumer reads from
    pub slot: String,
    /// Publication covering the streamed tables
    pub publication: String,
    /// Table name mapped to the event type emitted for it
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tables: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<u32>,
}
