use std::collections::{BTreeMap, BTreeSet};

use tracing::{error, info, warn};

use super::pg_store::PgStore;
use super::reconcile::{reconcile_association, sweep_decommissions, upsert_entity, SweepReport};
use super::schema::{
    Table, CLUSTER_DATASTORE, CLUSTER_DATASTORE_CLUSTER, CLUSTER_HA_CAPACITY, CLUSTER_HOST,
    CLUSTER_SOURCE_SYSTEM, CLUSTER_VM_SIZE, DATASTORE_CLUSTER_DATASTORE,
    DATASTORE_CLUSTER_SOURCE_SYSTEM, DATASTORE_SOURCE_SYSTEM, HA_CAPACITY_SOURCE_SYSTEM,
    HOST_SOURCE_SYSTEM, HOST_VM_SIZE,
};
use super::store::CapacityStore;
use super::{DbParams, PersistError};
use crate::capacity::{CapacityRecord, ClusterCapacity, DatastoreCapacity, FieldValue, Fields};
use crate::credentials::CredentialProvider;

const MO_ID: &str = "mo_id";
const VM_SIZE: &str = "vm_size";

/// Persists `cluster` over a dedicated connection that is closed whether or
/// not the write succeeds.
pub async fn persist(
    cluster: &ClusterCapacity,
    params: &DbParams,
    credentials: &dyn CredentialProvider,
) -> Result<i32, PersistError> {
    let mut store = PgStore::connect(params, credentials).await?;
    let result = write_cluster(&mut store, cluster).await;
    if let Err(e) = store.close().await {
        warn!(cluster = %cluster.name, error = %e, "Failed to close database connection.");
    }
    result
}

/// Runs the decommission sweep over a dedicated connection.
pub async fn sweep(
    params: &DbParams,
    credentials: &dyn CredentialProvider,
    cutoff_days: u32,
) -> Result<SweepReport, PersistError> {
    let mut store = PgStore::connect(params, credentials).await?;
    let result = sweep_decommissions(&mut store, cutoff_days).await;
    if let Err(e) = store.close().await {
        warn!(error = %e, "Failed to close database connection.");
    }
    result
}

/// Writes the whole cluster graph in one transaction and returns the
/// cluster's row id. On failure the transaction is rolled back.
pub async fn write_cluster(
    store: &mut dyn CapacityStore,
    cluster: &ClusterCapacity,
) -> Result<i32, PersistError> {
    store.begin().await?;
    match write_cluster_graph(store, cluster).await {
        Ok(cluster_id) => {
            store.commit().await?;
            info!(
                source_system = %cluster.source_system,
                cluster = %cluster.name,
                cluster_id,
                hosts = cluster.hosts.len(),
                "Cluster capacity persisted."
            );
            Ok(cluster_id)
        }
        Err(e) => {
            if let Err(rollback_err) = store.rollback().await {
                error!(cluster = %cluster.name, error = %rollback_err, "Rollback failed.");
            }
            Err(e)
        }
    }
}

async fn upsert_record<R: CapacityRecord + Sync>(
    store: &mut dyn CapacityStore,
    table: Table,
    record: &R,
) -> Result<i32, PersistError> {
    upsert_entity(store, table, MO_ID, &record.fields()).await
}

async fn write_cluster_graph(
    store: &mut dyn CapacityStore,
    cluster: &ClusterCapacity,
) -> Result<i32, PersistError> {
    let source_fields = Fields::new().with("name", cluster.source_system.as_str());
    let ss_id = upsert_entity(store, Table::SourceSystem, "name", &source_fields)
        .await?;

    let cluster_id = upsert_record(store, Table::Cluster, cluster).await?;
    reconcile_association(store, &CLUSTER_SOURCE_SYSTEM, cluster_id, &[ss_id])
        .await?;

    write_vm_sizes(store, cluster, cluster_id).await?;
    write_storage(store, cluster, cluster_id, ss_id).await?;

    let mut ha_ids = Vec::with_capacity(cluster.ha_capacity.len());
    for ha in &cluster.ha_capacity {
        let id = upsert_record(store, Table::HaCapacity, ha).await?;
        reconcile_association(store, &HA_CAPACITY_SOURCE_SYSTEM, id, &[ss_id])
            .await?;
        ha_ids.push(id);
    }
    reconcile_association(store, &CLUSTER_HA_CAPACITY, cluster_id, &ha_ids)
        .await?;

    write_hosts(store, cluster, cluster_id, ss_id).await?;
    Ok(cluster_id)
}

/// Upserts every bucket seen anywhere in the cluster, then links the
/// cluster-level set.
async fn write_vm_sizes(
    store: &mut dyn CapacityStore,
    cluster: &ClusterCapacity,
    cluster_id: i32,
) -> Result<(), PersistError> {
    let buckets: BTreeSet<_> = cluster
        .vm_sizes
        .iter()
        .chain(cluster.hosts.iter().flat_map(|h| h.vm_sizes.iter()))
        .collect();

    let mut ids = BTreeMap::new();
    for size in buckets {
        let id = upsert_entity(store, Table::VmSize, VM_SIZE, &size.fields())
            .await?;
        ids.insert(size.key(), id);
    }
    let cluster_sizes: Vec<i32> = cluster
        .vm_sizes
        .iter()
        .filter_map(|size| ids.get(size.key()).copied())
        .collect();
    reconcile_association(store, &CLUSTER_VM_SIZE, cluster_id, &cluster_sizes)
        .await
}

async fn write_datastore(
    store: &mut dyn CapacityStore,
    ds: &DatastoreCapacity,
    ss_id: i32,
) -> Result<i32, PersistError> {
    let id = upsert_record(store, Table::Datastore, ds).await?;
    reconcile_association(store, &DATASTORE_SOURCE_SYSTEM, id, &[ss_id])
        .await?;
    Ok(id)
}

/// Standalone volumes link to the cluster directly; pooled volumes only
/// through their pool.
async fn write_storage(
    store: &mut dyn CapacityStore,
    cluster: &ClusterCapacity,
    cluster_id: i32,
    ss_id: i32,
) -> Result<(), PersistError> {
    let mut standalone = Vec::with_capacity(cluster.datastores.len());
    for ds in &cluster.datastores {
        standalone.push(write_datastore(store, ds, ss_id).await?);
    }

    let mut pools = Vec::with_capacity(cluster.datastore_clusters.len());
    for pool in &cluster.datastore_clusters {
        let pool_id = upsert_record(store, Table::DatastoreCluster, pool).await?;
        reconcile_association(store, &DATASTORE_CLUSTER_SOURCE_SYSTEM, pool_id, &[ss_id])
            .await?;

        let mut members = Vec::with_capacity(pool.datastores.len());
        for ds in &pool.datastores {
            members.push(write_datastore(store, ds, ss_id).await?);
        }
        reconcile_association(store, &DATASTORE_CLUSTER_DATASTORE, pool_id, &members)
            .await?;
        pools.push(pool_id);
    }

    reconcile_association(store, &CLUSTER_DATASTORE, cluster_id, &standalone)
        .await?;
    reconcile_association(store, &CLUSTER_DATASTORE_CLUSTER, cluster_id, &pools)
        .await
}

/// Hosts resolve their buckets by key; the buckets must already be written.
async fn write_hosts(
    store: &mut dyn CapacityStore,
    cluster: &ClusterCapacity,
    cluster_id: i32,
    ss_id: i32,
) -> Result<(), PersistError> {
    let mut host_ids = Vec::with_capacity(cluster.hosts.len());
    for host in &cluster.hosts {
        let host_id = upsert_record(store, Table::Host, host).await?;
        reconcile_association(store, &HOST_SOURCE_SYSTEM, host_id, &[ss_id])
            .await?;

        let mut size_ids = Vec::with_capacity(host.vm_sizes.len());
        for size in &host.vm_sizes {
            let key = FieldValue::from(size.key());
            let id = store
                .find_id(Table::VmSize, VM_SIZE, &key)
                .await?
                .ok_or_else(|| PersistError::Lookup {
                    table: Table::VmSize.name().to_string(),
                    column: VM_SIZE.to_string(),
                    key: size.key().to_string(),
                })?;
            size_ids.push(id);
        }
        reconcile_association(store, &HOST_VM_SIZE, host_id, &size_ids)
            .await?;
        host_ids.push(host_id);
    }
    reconcile_association(store, &CLUSTER_HOST, cluster_id, &host_ids)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capacity::cluster::fixtures;
    use crate::db::memory_store::MemoryStore;
    use crate::db::schema::DATE_MODIFIED;
    use crate::inventory::{ClusterNode, HardwareMap, LifecycleMap};

    fn build(node: &ClusterNode) -> ClusterCapacity {
        ClusterCapacity::build("vc01", node, &HardwareMap::new(), &LifecycleMap::new())
            .unwrap()
    }

    fn text(value: &str) -> FieldValue {
        FieldValue::from(value)
    }

    fn row_id(store: &MemoryStore, table: Table, column: &str, key: &str) -> i32 {
        store.id_of(table, column, &text(key)).unwrap()
    }

    #[tokio::test]
    async fn test_cluster_graph_is_written() {
        let mut store = MemoryStore::new();
        let cluster = build(&fixtures::cluster());
        let cluster_id = write_cluster(&mut store, &cluster).await.unwrap();

        assert_eq!(store.row_count(Table::SourceSystem), 1);
        assert_eq!(store.row_count(Table::Cluster), 1);
        assert_eq!(store.row_count(Table::Host), 2);
        assert_eq!(store.row_count(Table::Datastore), 3);
        assert_eq!(store.row_count(Table::DatastoreCluster), 1);
        assert_eq!(store.row_count(Table::HaCapacity), 2);
        assert_eq!(store.row_count(Table::VmSize), 3);
        assert!(!store.in_transaction());

        let standalone = row_id(&store, Table::Datastore, MO_ID, "datastore-10");
        assert_eq!(
            store.association_pairs(&CLUSTER_DATASTORE),
            BTreeSet::from([(cluster_id, standalone)])
        );
        let pair_counts = [
            (&DATASTORE_CLUSTER_DATASTORE, 2),
            (&CLUSTER_DATASTORE_CLUSTER, 1),
            (&DATASTORE_SOURCE_SYSTEM, 3),
            (&CLUSTER_HA_CAPACITY, 2),
            (&CLUSTER_HOST, 2),
            (&CLUSTER_VM_SIZE, 3),
        ];
        for (assoc, count) in pair_counts {
            assert_eq!(store.association_pairs(assoc).len(), count);
        }

        let esx01 = row_id(&store, Table::Host, MO_ID, "host-esx01");
        let host_sizes: BTreeSet<i32> = store
            .association_pairs(&HOST_VM_SIZE)
            .into_iter()
            .filter(|(host, _)| *host == esx01)
            .map(|(_, size)| size)
            .collect();
        let expected: BTreeSet<i32> = ["2x4", "4x8"]
            .iter()
            .map(|key| row_id(&store, Table::VmSize, VM_SIZE, key))
            .collect();
        assert_eq!(host_sizes, expected);

        assert_eq!(
            store.field(Table::HaCapacity, 1, "cluster_ha"),
            Some(&text("prod-cl01-ha_n1"))
        );
        let modified = store.field(Table::Cluster, cluster_id, DATE_MODIFIED);
        assert!(modified.is_some());
    }

    #[tokio::test]
    async fn test_rewriting_the_same_cluster_adds_no_rows() {
        let mut store = MemoryStore::new();
        let cluster = build(&fixtures::cluster());
        let first = write_cluster(&mut store, &cluster).await.unwrap();
        let before = store.summary();
        let second = write_cluster(&mut store, &cluster).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(store.summary(), before);
    }

    #[tokio::test]
    async fn test_shrinking_cluster_prunes_associations_only() {
        let mut store = MemoryStore::new();
        let mut node = fixtures::cluster();
        let cluster_id = write_cluster(&mut store, &build(&node)).await.unwrap();

        node.hosts.truncate(1);
        write_cluster(&mut store, &build(&node)).await.unwrap();

        let esx01 = row_id(&store, Table::Host, MO_ID, "host-esx01");
        assert_eq!(
            store.association_pairs(&CLUSTER_HOST),
            BTreeSet::from([(cluster_id, esx01)])
        );
        assert_eq!(store.row_count(Table::Host), 2);
        assert_eq!(store.association_pairs(&CLUSTER_VM_SIZE).len(), 2);
    }

    #[tokio::test]
    async fn test_failure_rolls_back_the_whole_cluster() {
        let mut store = MemoryStore::new();
        store.fail_writes_to(Table::HaCapacity);
        let cluster = build(&fixtures::cluster());
        let err = write_cluster(&mut store, &cluster).await.unwrap_err();
        assert!(matches!(err, PersistError::Store(_)));
        assert!(store.summary().is_empty());
        assert!(!store.in_transaction());
    }

    #[tokio::test]
    async fn test_missing_vm_size_is_a_lookup_error() {
        let mut store = MemoryStore::new();
        let cluster = build(&fixtures::cluster());
        let err = write_hosts(&mut store, &cluster, 1, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, PersistError::Lookup { ref key, .. } if key == "2x4"));
    }

    #[tokio::test]
    async fn test_closed_store_is_a_connection_error() {
        let mut store = MemoryStore::new();
        store.close().await.unwrap();
        let cluster = build(&fixtures::cluster());
        let err = write_cluster(&mut store, &cluster).await.unwrap_err();
        assert!(matches!(err, PersistError::Connection(_)));
    }
}
