use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::DbErr;
use thiserror::Error;

use super::schema::{Association, Table};
use crate::capacity::{FieldValue, Fields};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("column {column} is not defined on {table}")]
    UndefinedColumn { table: String, column: String },
    #[error("store is closed")]
    Closed,
    #[error("database error: {0}")]
    Database(#[from] DbErr),
    #[error("{0}")]
    Query(String),
}

/// Row-level operations the reconciliation engine needs from a relational
/// backend. Every call runs inside the transaction opened by [`begin`] when
/// one is open.
///
/// [`begin`]: CapacityStore::begin
#[async_trait]
pub trait CapacityStore: Send {
    async fn begin(&mut self) -> Result<(), StoreError>;
    async fn commit(&mut self) -> Result<(), StoreError>;
    async fn rollback(&mut self) -> Result<(), StoreError>;
    /// Releases the connection. Any open transaction is rolled back.
    async fn close(&mut self) -> Result<(), StoreError>;

    async fn find_id(
        &mut self,
        table: Table,
        key_column: &'static str,
        key: &FieldValue,
    ) -> Result<Option<i32>, StoreError>;
    async fn insert(&mut self, table: Table, fields: &Fields) -> Result<i32, StoreError>;
    async fn update(&mut self, table: Table, id: i32, fields: &Fields) -> Result<(), StoreError>;

    async fn association_members(
        &mut self,
        assoc: &Association,
        owner_id: i32,
    ) -> Result<Vec<i32>, StoreError>;
    async fn insert_association(
        &mut self,
        assoc: &Association,
        owner_id: i32,
        member_id: i32,
    ) -> Result<(), StoreError>;
    async fn delete_association(
        &mut self,
        assoc: &Association,
        owner_id: i32,
        member_id: i32,
    ) -> Result<(), StoreError>;

    /// Names of every table carrying the reporting prefix, as the catalog
    /// reports them.
    async fn capacity_tables(&mut self) -> Result<Vec<String>, StoreError>;
    /// Ids of rows not yet decommissioned whose `date_modified` is older than
    /// `cutoff`. Fails with [`StoreError::UndefinedColumn`] on tables without
    /// lifecycle columns.
    async fn stale_ids(
        &mut self,
        table: Table,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<i32>, StoreError>;
    async fn mark_decommissioned(
        &mut self,
        table: Table,
        id: i32,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
    /// `(referencing table, referencing column)` for every foreign key that
    /// points at `table`, as the catalog reports them.
    async fn foreign_keys_into(
        &mut self,
        table: Table,
    ) -> Result<Vec<(String, String)>, StoreError>;
    async fn delete_referencing(
        &mut self,
        table: Table,
        column: &'static str,
        id: i32,
    ) -> Result<u64, StoreError>;
}
