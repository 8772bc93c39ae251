use kube::ResourceExt;

use super::object_meta;
use crate::crd::{PostgresCluster, PostgresEventStream, PostgresEventStreamSpec, StreamSpec};
use crate::resources::common::{event_stream_name, standard_labels};

/// Logical replication slot of a stream: `fes_<database>_<application>`
pub fn stream_slot_name(database: &str, application_id: &str) -> String {
    format!("fes_{database}_{application_id}").replace('-', "_")
}

/// Generate the event stream resource consumed by the CDC application
pub fn generate_event_stream(cluster: &PostgresCluster, stream: &StreamSpec) -> PostgresEventStream {
    let cluster_name = cluster.name_any();
    let slot = stream_slot_name(&stream.database, &stream.application_id);
    PostgresEventStream {
        metadata: object_meta(
            cluster,
            event_stream_name(&cluster_name, &stream.application_id),
            standard_labels(&cluster_name),
        ),
        spec: PostgresEventStreamSpec {
            application_id: stream.application_id.clone(),
            cluster: cluster_name,
            database: stream.database.clone(),
            publication: slot.clone(),
            slot,
            tables: stream.tables.clone(),
            batch_size: stream.batch_size,
        },
    }
}
