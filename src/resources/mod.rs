pub mod builder;
pub mod certificate;
pub mod common;
pub mod compare;
pub mod patroni;
pub mod postgres_client;

pub use common::{
    API_VERSION, FIELD_MANAGER, KIND, owner_reference, patroni_labels, standard_labels,
};
