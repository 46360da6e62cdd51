//! In-process [`CapacityStore`] used for dry runs and tests.
//!
//! It keeps the same contract as the Postgres store: columns outside the
//! allow-list fail as undefined, junction pairs are unique, and junction
//! tables have no lifecycle columns. Transactions snapshot the whole state.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::schema::{
    Association, Table, ASSOCIATIONS, DATE_MODIFIED, DECOMMISSION, DECOMMISSION_DATE, ID,
};
use super::store::{CapacityStore, StoreError};
use crate::capacity::{FieldValue, Fields};

pub type Row = BTreeMap<&'static str, FieldValue>;

#[derive(Debug, Clone, Default)]
struct TableRows {
    last_id: i32,
    rows: BTreeMap<i32, Row>,
}

#[derive(Debug, Clone, Default)]
struct State {
    tables: BTreeMap<Table, TableRows>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: State,
    snapshot: Option<State>,
    closed: bool,
    unmanaged_tables: Vec<String>,
    failing_table: Option<Table>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reports an extra table from the catalog that the allow-list does not know.
    pub fn with_unmanaged_table(mut self, name: &str) -> Self {
        self.unmanaged_tables.push(name.to_string());
        self
    }

    /// Makes every insert and update on `table` fail.
    pub fn fail_writes_to(&mut self, table: Table) {
        self.failing_table = Some(table);
    }

    pub fn in_transaction(&self) -> bool {
        self.snapshot.is_some()
    }

    pub fn row_count(&self, table: Table) -> usize {
        self.state.tables.get(&table).map_or(0, |t| t.rows.len())
    }

    pub fn row(&self, table: Table, id: i32) -> Option<&Row> {
        self.state.tables.get(&table)?.rows.get(&id)
    }

    pub fn field(&self, table: Table, id: i32, column: &str) -> Option<&FieldValue> {
        self.row(table, id)?.get(column)
    }

    pub fn id_of(&self, table: Table, column: &str, value: &FieldValue) -> Option<i32> {
        self.state
            .tables
            .get(&table)?
            .rows
            .iter()
            .find(|(_, row)| row.get(column) == Some(value))
            .map(|(id, _)| *id)
    }

    pub fn association_pairs(&self, assoc: &Association) -> BTreeSet<(i32, i32)> {
        self.state
            .tables
            .get(&assoc.table)
            .map(|t| {
                t.rows
                    .values()
                    .filter_map(|row| {
                        Some((
                            int_of(row.get(assoc.owner_column)?)?,
                            int_of(row.get(assoc.member_column)?)?,
                        ))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Overwrites one column in place, outside any transaction bookkeeping.
    pub fn set_field(&mut self, table: Table, id: i32, column: &'static str, value: FieldValue) {
        if let Some(row) = self
            .state
            .tables
            .get_mut(&table)
            .and_then(|t| t.rows.get_mut(&id))
        {
            row.insert(column, value);
        }
    }

    /// Row counts of every non-empty table.
    pub fn summary(&self) -> Vec<(&'static str, usize)> {
        self.state
            .tables
            .iter()
            .filter(|(_, t)| !t.rows.is_empty())
            .map(|(table, t)| (table.name(), t.rows.len()))
            .collect()
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    fn check_columns<'a>(
        table: Table,
        columns: impl IntoIterator<Item = &'a str>,
    ) -> Result<(), StoreError> {
        for column in columns {
            if table.column(column).is_none() {
                return Err(StoreError::UndefinedColumn {
                    table: table.name().to_string(),
                    column: column.to_string(),
                });
            }
        }
        Ok(())
    }

    fn check_writable(&self, table: Table) -> Result<(), StoreError> {
        if self.failing_table == Some(table) {
            return Err(StoreError::Query(format!("write to {table} rejected")));
        }
        Ok(())
    }

    fn table_mut(&mut self, table: Table) -> &mut TableRows {
        self.state.tables.entry(table).or_default()
    }
}

fn int_of(value: &FieldValue) -> Option<i32> {
    match value {
        FieldValue::Int(v) => i32::try_from(*v).ok(),
        _ => None,
    }
}

#[async_trait]
impl CapacityStore for MemoryStore {
    async fn begin(&mut self) -> Result<(), StoreError> {
        self.ensure_open()?;
        if self.snapshot.is_some() {
            return Err(StoreError::Query("transaction already open".to_string()));
        }
        self.snapshot = Some(self.state.clone());
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        self.ensure_open()?;
        match self.snapshot.take() {
            Some(_) => Ok(()),
            None => Err(StoreError::Query("no open transaction".to_string())),
        }
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        self.ensure_open()?;
        if let Some(previous) = self.snapshot.take() {
            self.state = previous;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), StoreError> {
        if let Some(previous) = self.snapshot.take() {
            self.state = previous;
        }
        self.closed = true;
        Ok(())
    }

    async fn find_id(
        &mut self,
        table: Table,
        key_column: &'static str,
        key: &FieldValue,
    ) -> Result<Option<i32>, StoreError> {
        self.ensure_open()?;
        Self::check_columns(table, [key_column])?;
        Ok(self.id_of(table, key_column, key))
    }

    async fn insert(&mut self, table: Table, fields: &Fields) -> Result<i32, StoreError> {
        self.ensure_open()?;
        Self::check_columns(table, fields.columns())?;
        self.check_writable(table)?;
        let rows = self.table_mut(table);
        rows.last_id += 1;
        let id = rows.last_id;
        let mut row: Row = fields.iter().map(|(c, v)| (c, v.clone())).collect();
        row.insert(ID, FieldValue::Int(i64::from(id)));
        rows.rows.insert(id, row);
        Ok(id)
    }

    async fn update(&mut self, table: Table, id: i32, fields: &Fields) -> Result<(), StoreError> {
        self.ensure_open()?;
        Self::check_columns(table, fields.columns())?;
        self.check_writable(table)?;
        if let Some(row) = self.table_mut(table).rows.get_mut(&id) {
            for (column, value) in fields.iter() {
                row.insert(column, value.clone());
            }
        }
        Ok(())
    }

    async fn association_members(
        &mut self,
        assoc: &Association,
        owner_id: i32,
    ) -> Result<Vec<i32>, StoreError> {
        self.ensure_open()?;
        Ok(self
            .association_pairs(assoc)
            .into_iter()
            .filter(|(owner, _)| *owner == owner_id)
            .map(|(_, member)| member)
            .collect())
    }

    async fn insert_association(
        &mut self,
        assoc: &Association,
        owner_id: i32,
        member_id: i32,
    ) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.check_writable(assoc.table)?;
        if self.association_pairs(assoc).contains(&(owner_id, member_id)) {
            return Err(StoreError::Query(format!(
                "duplicate pair ({owner_id}, {member_id}) in {}",
                assoc.table
            )));
        }
        let fields = Fields::new()
            .with(assoc.owner_column, i64::from(owner_id))
            .with(assoc.member_column, i64::from(member_id));
        self.insert(assoc.table, &fields).await.map(|_| ())
    }

    async fn delete_association(
        &mut self,
        assoc: &Association,
        owner_id: i32,
        member_id: i32,
    ) -> Result<(), StoreError> {
        self.ensure_open()?;
        let owner = FieldValue::Int(i64::from(owner_id));
        let member = FieldValue::Int(i64::from(member_id));
        self.table_mut(assoc.table).rows.retain(|_, row| {
            !(row.get(assoc.owner_column) == Some(&owner)
                && row.get(assoc.member_column) == Some(&member))
        });
        Ok(())
    }

    async fn capacity_tables(&mut self) -> Result<Vec<String>, StoreError> {
        self.ensure_open()?;
        let mut names: Vec<String> = Table::ALL.iter().map(|t| t.name().to_string()).collect();
        names.extend(self.unmanaged_tables.iter().cloned());
        Ok(names)
    }

    async fn stale_ids(
        &mut self,
        table: Table,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<i32>, StoreError> {
        self.ensure_open()?;
        Self::check_columns(table, [DATE_MODIFIED])?;
        let Some(rows) = self.state.tables.get(&table) else {
            return Ok(Vec::new());
        };
        Ok(rows
            .rows
            .iter()
            .filter(|(_, row)| row.get(DECOMMISSION) != Some(&FieldValue::Bool(true)))
            .filter(|(_, row)| match row.get(DATE_MODIFIED) {
                Some(FieldValue::Timestamp(Some(at))) => *at < cutoff,
                _ => false,
            })
            .map(|(id, _)| *id)
            .collect())
    }

    async fn mark_decommissioned(
        &mut self,
        table: Table,
        id: i32,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let fields = Fields::new()
            .with(DECOMMISSION, true)
            .with(DECOMMISSION_DATE, at);
        self.update(table, id, &fields).await
    }

    async fn foreign_keys_into(
        &mut self,
        table: Table,
    ) -> Result<Vec<(String, String)>, StoreError> {
        self.ensure_open()?;
        let mut keys = Vec::new();
        for assoc in ASSOCIATIONS {
            if assoc.owner == table {
                keys.push((
                    assoc.table.name().to_string(),
                    assoc.owner_column.to_string(),
                ));
            }
            if assoc.member == table {
                keys.push((
                    assoc.table.name().to_string(),
                    assoc.member_column.to_string(),
                ));
            }
        }
        Ok(keys)
    }

    async fn delete_referencing(
        &mut self,
        table: Table,
        column: &'static str,
        id: i32,
    ) -> Result<u64, StoreError> {
        self.ensure_open()?;
        Self::check_columns(table, [column])?;
        let target = FieldValue::Int(i64::from(id));
        let rows = &mut self.table_mut(table).rows;
        let before = rows.len();
        rows.retain(|_, row| row.get(column) != Some(&target));
        Ok((before - rows.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::CLUSTER_HOST;

    #[tokio::test]
    async fn test_rollback_restores_the_snapshot() {
        let mut store = MemoryStore::new();
        let vc1 = Fields::new().with("name", "vc1");
        let vc2 = Fields::new().with("name", "vc2");
        store.insert(Table::SourceSystem, &vc1).await.unwrap();
        store.begin().await.unwrap();
        store.insert(Table::SourceSystem, &vc2).await.unwrap();
        store.rollback().await.unwrap();
        assert_eq!(store.row_count(Table::SourceSystem), 1);
        assert!(!store.in_transaction());
    }

    #[tokio::test]
    async fn test_close_discards_open_transaction_and_rejects_calls() {
        let mut store = MemoryStore::new();
        let vc1 = Fields::new().with("name", "vc1");
        store.begin().await.unwrap();
        store.insert(Table::SourceSystem, &vc1).await.unwrap();
        store.close().await.unwrap();
        assert_eq!(store.row_count(Table::SourceSystem), 0);
        let err = store.capacity_tables().await.unwrap_err();
        assert!(matches!(err, StoreError::Closed));
    }

    #[tokio::test]
    async fn test_unknown_column_is_undefined() {
        let mut store = MemoryStore::new();
        let err = store
            .insert(Table::VmSize, &Fields::new().with("raw_cpu_total", 1.0))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UndefinedColumn { .. }));
        let err = store
            .stale_ids(Table::ClusterHost, Utc::now())
            .await
            .unwrap_err();
        match err {
            StoreError::UndefinedColumn { column, .. } => assert_eq!(column, DATE_MODIFIED),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_association_pairs_are_unique() {
        let mut store = MemoryStore::new();
        store.insert_association(&CLUSTER_HOST, 1, 2).await.unwrap();
        assert!(store.insert_association(&CLUSTER_HOST, 1, 2).await.is_err());
        assert_eq!(
            store.association_pairs(&CLUSTER_HOST),
            BTreeSet::from([(1, 2)])
        );
    }
}
