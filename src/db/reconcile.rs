use std::collections::BTreeSet;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::schema::{
    Association, Table, DATE_CREATED, DATE_MODIFIED, DECOMMISSION, DECOMMISSION_DATE, ID,
};
use super::store::CapacityStore;
use super::PersistError;
use crate::capacity::{FieldValue, Fields};

const ENGINE_COLUMNS: [&str; 5] = [
    ID,
    DATE_CREATED,
    DATE_MODIFIED,
    DECOMMISSION,
    DECOMMISSION_DATE,
];

fn reject<T>(table: Table, reason: impl Into<String>) -> Result<T, PersistError> {
    Err(PersistError::Configuration {
        table: table.name().to_string(),
        reason: reason.into(),
    })
}

fn validate_fields(table: Table, key_column: &str, fields: &Fields) -> Result<(), PersistError> {
    if !table.is_entity() {
        return reject(table, "not an entity table");
    }
    let mut seen = BTreeSet::new();
    for column in fields.columns() {
        if !seen.insert(column) {
            return reject(table, format!("column {column} given twice"));
        }
        if ENGINE_COLUMNS.contains(&column) {
            return reject(table, format!("column {column} is managed by the engine"));
        }
        if table.column(column).is_none() {
            return reject(table, format!("unknown column {column}"));
        }
    }
    if !seen.contains(key_column) {
        return reject(table, format!("key column {key_column} has no value"));
    }
    Ok(())
}

/// Inserts or updates the row of `table` whose `key_column` equals the value
/// in `fields`, and returns its id. An updated row is un-decommissioned.
pub async fn upsert_entity(
    store: &mut dyn CapacityStore,
    table: Table,
    key_column: &'static str,
    fields: &Fields,
) -> Result<i32, PersistError> {
    validate_fields(table, key_column, fields)?;
    let Some(key) = fields.get(key_column) else {
        return reject(table, format!("key column {key_column} has no value"));
    };
    let now = Utc::now();

    match store.find_id(table, key_column, key).await? {
        Some(id) => {
            let mut row = fields.clone();
            row.push(DATE_MODIFIED, now);
            row.push(DECOMMISSION, false);
            row.push(DECOMMISSION_DATE, FieldValue::Timestamp(None));
            store.update(table, id, &row).await?;
            debug!(table = %table, id, "updated row");
            Ok(id)
        }
        None => {
            let mut row = fields.clone();
            row.push(DATE_CREATED, now);
            row.push(DATE_MODIFIED, now);
            row.push(DECOMMISSION, false);
            let id = store.insert(table, &row).await?;
            debug!(table = %table, id, "inserted row");
            Ok(id)
        }
    }
}

/// Makes the members of `owner_id` in `assoc` exactly `desired`: missing pairs
/// are inserted first, then pairs outside `desired` are deleted.
pub async fn reconcile_association(
    store: &mut dyn CapacityStore,
    assoc: &Association,
    owner_id: i32,
    desired: &[i32],
) -> Result<(), PersistError> {
    let existing: BTreeSet<i32> = store
        .association_members(assoc, owner_id)
        .await?
        .into_iter()
        .collect();
    let desired: BTreeSet<i32> = desired.iter().copied().collect();

    for member in desired.difference(&existing) {
        store.insert_association(assoc, owner_id, *member).await?;
    }
    for member in existing.difference(&desired) {
        store.delete_association(assoc, owner_id, *member).await?;
    }
    Ok(())
}

/// Tables and columns holding a foreign key into `table`, read from the live
/// catalog and resolved through the allow-list.
pub async fn discover_foreign_keys(
    store: &mut dyn CapacityStore,
    table: Table,
) -> Result<Vec<(Table, &'static str)>, PersistError> {
    let mut keys = Vec::new();
    for (table_name, column_name) in store.foreign_keys_into(table).await? {
        let resolved = Table::from_name(&table_name)
            .and_then(|t| Some((t, t.column(&column_name)?)));
        match resolved {
            Some(key) => keys.push(key),
            None => warn!(
                target_table = %table,
                referencing_table = %table_name,
                column = %column_name,
                "Ignoring foreign key outside the known schema."
            ),
        }
    }
    Ok(keys)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SweepReport {
    pub tables_swept: usize,
    pub tables_skipped: Vec<String>,
    pub tables_ignored: Vec<String>,
    pub rows_decommissioned: usize,
    pub references_removed: u64,
}

/// Decommissions every row not modified within `cutoff_days` and removes the
/// junction rows that reference it. Each table runs in its own transaction;
/// a table without lifecycle columns is rolled back and skipped, any other
/// failure aborts the sweep.
pub async fn sweep_decommissions(
    store: &mut dyn CapacityStore,
    cutoff_days: u32,
) -> Result<SweepReport, PersistError> {
    let now = Utc::now();
    let cutoff = TimeDelta::try_days(i64::from(cutoff_days))
        .and_then(|age| now.checked_sub_signed(age))
        .ok_or(PersistError::CutoffOutOfRange(cutoff_days))?;
    let mut report = SweepReport::default();

    for name in store.capacity_tables().await? {
        let Some(table) = Table::from_name(&name) else {
            warn!(table = %name, "Ignoring table outside the known schema.");
            report.tables_ignored.push(name);
            continue;
        };

        store.begin().await?;
        match sweep_table(store, table, cutoff, now).await {
            Ok((rows, references)) => {
                store.commit().await?;
                report.tables_swept += 1;
                report.rows_decommissioned += rows;
                report.references_removed += references;
                if rows > 0 {
                    info!(table = %table, rows, references, "Decommissioned stale rows.");
                }
            }
            Err(PersistError::SchemaIntrospection { table: skipped, column }) => {
                store.rollback().await?;
                debug!(
                    table = %skipped,
                    column = %column,
                    "Skipping table without lifecycle columns."
                );
                report.tables_skipped.push(skipped);
            }
            Err(e) => {
                if let Err(rollback_err) = store.rollback().await {
                    error!(
                        table = %table,
                        error = %rollback_err,
                        "Rollback after failed sweep failed."
                    );
                }
                return Err(e);
            }
        }
    }
    Ok(report)
}

async fn sweep_table(
    store: &mut dyn CapacityStore,
    table: Table,
    cutoff: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<(usize, u64), PersistError> {
    let ids = store.stale_ids(table, cutoff).await?;
    if ids.is_empty() {
        return Ok((0, 0));
    }
    let dependents = discover_foreign_keys(store, table).await?;
    let mut references = 0;
    for id in &ids {
        store.mark_decommissioned(table, *id, now).await?;
        for (referencing, column) in &dependents {
            references += store
                .delete_referencing(*referencing, column, *id)
                .await?;
        }
    }
    Ok((ids.len(), references))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_store::MemoryStore;
    use crate::db::schema::{CLUSTER_HOST, CLUSTER_SOURCE_SYSTEM};

    fn cluster_fields(mo_id: &str, hosts: u32) -> Fields {
        Fields::new()
            .with("mo_id", mo_id)
            .with("name", format!("cl-{mo_id}"))
            .with("vmhost_count", hosts)
    }

    async fn insert_cluster(store: &mut MemoryStore, mo_id: &str) -> i32 {
        let fields = cluster_fields(mo_id, 1);
        upsert_entity(store, Table::Cluster, "mo_id", &fields)
            .await
            .unwrap()
    }

    fn backdate(store: &mut MemoryStore, table: Table, id: i32, days: i64) {
        let at = Utc::now() - TimeDelta::days(days);
        store.set_field(table, id, DATE_MODIFIED, FieldValue::Timestamp(Some(at)));
    }

    fn decommissioned(store: &MemoryStore, id: i32) -> Option<&FieldValue> {
        store.field(Table::Cluster, id, DECOMMISSION)
    }

    #[tokio::test]
    async fn test_association_reconciliation_is_idempotent_and_prunes() {
        let mut store = MemoryStore::new();
        let (a, b) = (11, 12);
        for _ in 0..2 {
            reconcile_association(&mut store, &CLUSTER_HOST, 1, &[a, b])
                .await
                .unwrap();
        }
        let pairs = store.association_pairs(&CLUSTER_HOST);
        assert_eq!(pairs, BTreeSet::from([(1, a), (1, b)]));

        reconcile_association(&mut store, &CLUSTER_HOST, 1, &[a])
            .await
            .unwrap();
        let pairs = store.association_pairs(&CLUSTER_HOST);
        assert_eq!(pairs, BTreeSet::from([(1, a)]));
    }

    #[tokio::test]
    async fn test_reconciliation_leaves_other_owners_alone() {
        let mut store = MemoryStore::new();
        let cases: [(i32, &[i32]); 3] = [(1, &[5]), (2, &[5, 6, 6]), (2, &[])];
        for (owner, members) in cases {
            reconcile_association(&mut store, &CLUSTER_HOST, owner, members)
                .await
                .unwrap();
        }
        let pairs = store.association_pairs(&CLUSTER_HOST);
        assert_eq!(pairs, BTreeSet::from([(1, 5)]));
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent_and_refreshes_date_modified() {
        let mut store = MemoryStore::new();
        let fields = cluster_fields("domain-c7", 2);
        let id = insert_cluster(&mut store, "domain-c7").await;
        let created = store.field(Table::Cluster, id, DATE_CREATED).cloned();
        backdate(&mut store, Table::Cluster, id, 1);
        let before = store.field(Table::Cluster, id, DATE_MODIFIED).cloned();

        let again = upsert_entity(&mut store, Table::Cluster, "mo_id", &fields)
            .await
            .unwrap();
        assert_eq!(again, id);
        assert_eq!(store.row_count(Table::Cluster), 1);
        assert_eq!(store.field(Table::Cluster, id, DATE_CREATED).cloned(), created);
        assert_ne!(store.field(Table::Cluster, id, DATE_MODIFIED).cloned(), before);
        for (column, value) in fields.iter() {
            assert_eq!(store.field(Table::Cluster, id, column), Some(value));
        }
    }

    #[tokio::test]
    async fn test_upsert_clears_decommission() {
        let mut store = MemoryStore::new();
        let id = insert_cluster(&mut store, "domain-c7").await;
        store
            .mark_decommissioned(Table::Cluster, id, Utc::now())
            .await
            .unwrap();

        insert_cluster(&mut store, "domain-c7").await;
        assert_eq!(decommissioned(&store, id), Some(&FieldValue::Bool(false)));
        assert_eq!(
            store.field(Table::Cluster, id, DECOMMISSION_DATE),
            Some(&FieldValue::Timestamp(None))
        );
    }

    #[tokio::test]
    async fn test_malformed_field_mappings_are_configuration_errors() {
        let mut store = MemoryStore::new();
        let cases = [
            (Table::Cluster, cluster_fields("c1", 1).with("name", "again")),
            (Table::Cluster, cluster_fields("c1", 1).with("cpu_total", 4u32)),
            (Table::Cluster, Fields::new().with("name", "c1")),
            (Table::Cluster, cluster_fields("c1", 1).with(DATE_MODIFIED, Utc::now())),
            (Table::ClusterHost, Fields::new().with("mo_id", "c1")),
        ];
        for (table, fields) in cases {
            let err = upsert_entity(&mut store, table, "mo_id", &fields)
                .await
                .unwrap_err();
            assert!(matches!(err, PersistError::Configuration { .. }), "{err}");
        }
        assert!(store.summary().is_empty());
    }

    #[tokio::test]
    async fn test_sweep_decommissions_stale_rows_and_removes_references() {
        let mut store = MemoryStore::new();
        let vc1 = Fields::new().with("name", "vc1");
        let ss = upsert_entity(&mut store, Table::SourceSystem, "name", &vc1)
            .await
            .unwrap();
        let old = insert_cluster(&mut store, "c-old").await;
        let fresh = insert_cluster(&mut store, "c-new").await;
        let links = [
            (&CLUSTER_SOURCE_SYSTEM, old, ss),
            (&CLUSTER_SOURCE_SYSTEM, fresh, ss),
            (&CLUSTER_HOST, old, 7),
            (&CLUSTER_HOST, fresh, 8),
        ];
        for (assoc, owner, member) in links {
            reconcile_association(&mut store, assoc, owner, &[member])
                .await
                .unwrap();
        }
        backdate(&mut store, Table::Cluster, old, 10);

        let report = sweep_decommissions(&mut store, 3).await.unwrap();

        assert_eq!(report.rows_decommissioned, 1);
        assert_eq!(report.references_removed, 2);
        assert_eq!(report.tables_skipped.len(), 12);
        assert_eq!(report.tables_swept, 7);
        assert_eq!(decommissioned(&store, old), Some(&FieldValue::Bool(true)));
        assert!(matches!(
            store.field(Table::Cluster, old, DECOMMISSION_DATE),
            Some(FieldValue::Timestamp(Some(_)))
        ));
        assert_eq!(decommissioned(&store, fresh), Some(&FieldValue::Bool(false)));
        let hosts = store.association_pairs(&CLUSTER_HOST);
        assert_eq!(hosts, BTreeSet::from([(fresh, 8)]));
        let sources = store.association_pairs(&CLUSTER_SOURCE_SYSTEM);
        assert_eq!(sources, BTreeSet::from([(fresh, ss)]));
        assert!(!store.in_transaction());
    }

    #[tokio::test]
    async fn test_sweep_does_not_restamp_decommissioned_rows() {
        let mut store = MemoryStore::new();
        let id = insert_cluster(&mut store, "c-old").await;
        backdate(&mut store, Table::Cluster, id, 10);
        sweep_decommissions(&mut store, 3).await.unwrap();
        let stamped = store.field(Table::Cluster, id, DECOMMISSION_DATE).cloned();

        let second = sweep_decommissions(&mut store, 3).await.unwrap();
        assert_eq!(second.rows_decommissioned, 0);
        let restamped = store.field(Table::Cluster, id, DECOMMISSION_DATE).cloned();
        assert_eq!(restamped, stamped);
    }

    #[tokio::test]
    async fn test_sweep_ignores_tables_outside_the_allow_list() {
        let mut store = MemoryStore::new().with_unmanaged_table("capacity_legacy_report");
        let report = sweep_decommissions(&mut store, 3).await.unwrap();
        assert_eq!(report.tables_ignored, vec!["capacity_legacy_report"]);
    }

    #[tokio::test]
    async fn test_sweep_aborts_on_other_errors() {
        let mut store = MemoryStore::new();
        let id = insert_cluster(&mut store, "c-old").await;
        backdate(&mut store, Table::Cluster, id, 10);
        store.fail_writes_to(Table::Cluster);

        let err = sweep_decommissions(&mut store, 3).await.unwrap_err();
        assert!(matches!(err, PersistError::Store(_)));
        assert!(!store.in_transaction());
        assert_eq!(decommissioned(&store, id), Some(&FieldValue::Bool(false)));
    }

    #[tokio::test]
    async fn test_sweep_rejects_out_of_range_cutoff() {
        let mut store = MemoryStore::new();
        let id = insert_cluster(&mut store, "c1").await;

        let err = sweep_decommissions(&mut store, 200_000_000)
            .await
            .unwrap_err();
        assert!(matches!(err, PersistError::CutoffOutOfRange(200_000_000)));
        assert!(!store.in_transaction());
        assert_eq!(decommissioned(&store, id), Some(&FieldValue::Bool(false)));
    }

    #[tokio::test]
    async fn test_foreign_keys_resolve_through_the_allow_list() {
        let mut store = MemoryStore::new();
        let keys = discover_foreign_keys(&mut store, Table::Host)
            .await
            .unwrap();
        assert!(keys.contains(&(Table::ClusterHost, "host_id")));
        assert!(keys.contains(&(Table::HostVmSize, "host_id")));
        assert!(keys.contains(&(Table::HostSourceSystem, "host_id")));
        assert_eq!(keys.len(), 3);
    }
}
