mod event_stream;
mod postgres_cluster;

pub use event_stream::*;
pub use postgres_cluster::*;
