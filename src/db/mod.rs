use serde::Deserialize;
use thiserror::Error;

use crate::credentials::CredentialError;

pub mod lifecycle;
pub mod memory_store;
pub mod persist;
pub mod pg_store;
pub mod reconcile;
pub mod schema;
pub mod store;

pub use memory_store::MemoryStore;
pub use persist::{persist, write_cluster};
pub use pg_store::PgStore;
pub use reconcile::{sweep_decommissions, SweepReport};
pub use store::{CapacityStore, StoreError};

/// Where to reach one Postgres database. The password is never part of the
/// parameters; it comes from a [`crate::credentials::CredentialProvider`].
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct DbParams {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub database: String,
    pub user: String,
}

fn default_port() -> u16 {
    5432
}

#[derive(Error, Debug)]
pub enum PersistError {
    #[error("Invalid field mapping for {table}: {reason}")]
    Configuration { table: String, reason: String },
    #[error("No {table} row with {column} = {key}")]
    Lookup {
        table: String,
        column: String,
        key: String,
    },
    #[error("Column {column} does not exist on {table}")]
    SchemaIntrospection { table: String, column: String },
    #[error("Decommission cutoff of {0} days is out of range")]
    CutoffOutOfRange(u32),
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for PersistError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::UndefinedColumn { table, column } => {
                PersistError::SchemaIntrospection { table, column }
            }
            StoreError::Closed => {
                PersistError::Connection("no open database connection".to_string())
            }
            other => PersistError::Store(other),
        }
    }
}

impl From<CredentialError> for PersistError {
    fn from(err: CredentialError) -> Self {
        PersistError::Connection(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_defaults_when_absent() {
        let text = "host = \"db1\"\ndatabase = \"capacity\"\nuser = \"collector\"";
        let params: DbParams = toml::from_str(text).unwrap();
        assert_eq!(params.port, 5432);
    }

    #[test]
    fn test_store_errors_are_classified() {
        let err: PersistError = StoreError::UndefinedColumn {
            table: "capacity_cluster_host".into(),
            column: "date_modified".into(),
        }
        .into();
        assert!(matches!(err, PersistError::SchemaIntrospection { .. }));
        assert!(matches!(
            PersistError::from(StoreError::Closed),
            PersistError::Connection(_)
        ));
        assert!(matches!(
            PersistError::from(StoreError::Query("boom".into())),
            PersistError::Store(_)
        ));
    }
}
