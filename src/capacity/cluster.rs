use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use tracing::{debug, warn};

use super::datastore::StorageTotals;
use super::{
    low_avg_max, safe_division, CapacityError, CapacityRecord, DatastoreCapacity,
    DatastoreClusterCapacity, Fields, HostCapacity, VmSize,
};
use crate::inventory::{ClusterNode, HardwareMap, LifecycleMap};

/// Failed-host reservations computed for every cluster.
pub const HA_FACTORS: [u32; 2] = [1, 2];

/// Host-local and scratch volumes are not shared cluster storage.
const EXCLUDED_DATASTORE_MARKERS: [&str; 3] = ["local", "datastore", "swap"];

/// Root aggregate for one cluster of one source system.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterCapacity {
    pub source_system: String,
    pub name: String,
    pub mo_id: String,
    pub vmhost_count: u32,
    pub raw_cpu_total: f64,
    pub raw_cpu_used: f64,
    pub raw_mem_total: f64,
    pub raw_mem_used: f64,
    pub raw_cpu_over_commit: f64,
    /// Mean of the member hosts' CPU over-commit ratios.
    pub raw_avg_cpu_over_commit: f64,
    pub raw_mem_over_commit: f64,
    pub raw_avg_mem_over_commit: f64,
    pub raw_storage_total: f64,
    pub raw_storage_used: f64,
    pub raw_storage_free: f64,
    pub vm_low_cpu: f64,
    pub vm_avg_cpu: f64,
    pub vm_max_cpu: f64,
    pub vm_low_mem: f64,
    pub vm_avg_mem: f64,
    pub vm_max_mem: f64,
    pub hosts: Vec<HostCapacity>,
    pub datastores: Vec<DatastoreCapacity>,
    pub datastore_clusters: Vec<DatastoreClusterCapacity>,
    pub vm_sizes: BTreeSet<VmSize>,
    pub ha_capacity: Vec<HaCapacity>,
}

impl ClusterCapacity {
    /// Builds the whole capacity tree of one cluster. Pure: no I/O beyond the
    /// two lookup maps.
    pub fn build(
        source_system: &str,
        node: &ClusterNode,
        hw_map: &HardwareMap,
        lifecycle_map: &LifecycleMap,
    ) -> Result<Self, CapacityError> {
        let hosts = node
            .hosts
            .iter()
            .map(|host| HostCapacity::build(host, hw_map, lifecycle_map))
            .collect::<Result<Vec<_>, _>>()?;
        let vmhost_count = hosts.len() as u32;
        let host_count = f64::from(vmhost_count);

        let raw_cpu_total: f64 = hosts.iter().map(|h| f64::from(h.cpu_total)).sum();
        let raw_cpu_used: f64 = hosts.iter().map(|h| f64::from(h.cpu_used)).sum();
        let raw_mem_total: f64 = hosts.iter().map(|h| h.mem_total).sum();
        let raw_mem_used: f64 = hosts.iter().map(|h| h.mem_used).sum();

        let raw_avg_cpu_over_commit =
            safe_division(hosts.iter().map(|h| h.cpu_over_commit).sum(), host_count);
        let raw_avg_mem_over_commit =
            safe_division(hosts.iter().map(|h| h.mem_over_commit).sum(), host_count);

        let vm_sizes: BTreeSet<VmSize> = hosts
            .iter()
            .flat_map(|h| h.vm_sizes.iter().cloned())
            .collect();

        let cpus: Vec<f64> = hosts
            .iter()
            .flat_map(|h| h.powered_on.iter().map(|vm| f64::from(vm.vcpu)))
            .collect();
        let mems: Vec<f64> = hosts
            .iter()
            .flat_map(|h| h.powered_on.iter().map(|vm| vm.memory_gb))
            .collect();
        let (vm_low_cpu, vm_avg_cpu, vm_max_cpu) = low_avg_max(&cpus);
        let (vm_low_mem, vm_avg_mem, vm_max_mem) = low_avg_max(&mems);

        let (datastores, datastore_clusters) = collect_storage(node);
        let standalone = |value: fn(&DatastoreCapacity) -> f64| -> f64 {
            datastores.iter().map(value).sum()
        };
        let pooled = |value: fn(&StorageTotals) -> f64| -> f64 {
            datastore_clusters.iter().map(|p| value(&p.totals)).sum()
        };
        let raw_storage_total = standalone(|d| d.total_capacity) + pooled(|t| t.total_capacity);
        let raw_storage_used = standalone(|d| d.total_used) + pooled(|t| t.total_used);
        let raw_storage_free =
            standalone(|d| d.total_free_actual) + pooled(|t| t.total_free_actual);

        let mut cluster = ClusterCapacity {
            source_system: source_system.to_string(),
            name: node.name.clone(),
            mo_id: node.mo_id.clone(),
            vmhost_count,
            raw_cpu_total,
            raw_cpu_used,
            raw_mem_total,
            raw_mem_used,
            raw_cpu_over_commit: safe_division(raw_cpu_used, raw_cpu_total),
            raw_avg_cpu_over_commit,
            raw_mem_over_commit: safe_division(raw_mem_used, raw_mem_total),
            raw_avg_mem_over_commit,
            raw_storage_total,
            raw_storage_used,
            raw_storage_free,
            vm_low_cpu,
            vm_avg_cpu,
            vm_max_cpu,
            vm_low_mem,
            vm_avg_mem,
            vm_max_mem,
            hosts,
            datastores,
            datastore_clusters,
            vm_sizes,
            ha_capacity: Vec::new(),
        };
        cluster.ha_capacity = HA_FACTORS
            .iter()
            .map(|factor| HaCapacity::derive(&cluster, *factor))
            .collect();

        debug!(
            source_system = %cluster.source_system,
            cluster = %cluster.name,
            hosts = cluster.vmhost_count,
            datastores = cluster.datastores.len(),
            datastore_clusters = cluster.datastore_clusters.len(),
            vm_sizes = cluster.vm_sizes.len(),
            "Cluster capacity built."
        );
        Ok(cluster)
    }
}

fn is_excluded(name: &str) -> bool {
    EXCLUDED_DATASTORE_MARKERS
        .iter()
        .any(|marker| name.contains(marker))
}

/// Splits the cluster's volumes into standalone datastores and storage pods.
/// Each pod is built once; a pod member is never also counted standalone.
fn collect_storage(node: &ClusterNode) -> (Vec<DatastoreCapacity>, Vec<DatastoreClusterCapacity>) {
    let mut pools: Vec<DatastoreClusterCapacity> = Vec::new();
    let mut seen_pods: HashSet<&str> = HashSet::new();
    let mut standalone: Vec<DatastoreCapacity> = Vec::new();

    for ds in &node.datastores {
        if is_excluded(&ds.name) {
            debug!(cluster = %node.name, datastore = %ds.name, "Skipping local datastore.");
            continue;
        }
        match ds.pod.as_deref() {
            Some(pod_id) => match node.storage_pods.iter().find(|pod| pod.mo_id == pod_id) {
                Some(pod) => {
                    if seen_pods.insert(pod.mo_id.as_str()) {
                        pools.push(DatastoreClusterCapacity::build(pod));
                    }
                }
                None => {
                    warn!(
                        cluster = %node.name,
                        datastore = %ds.name,
                        pod = %pod_id,
                        "Datastore references an unknown storage pod; counting it standalone."
                    );
                    standalone.push(DatastoreCapacity::build(ds));
                }
            },
            None => standalone.push(DatastoreCapacity::build(ds)),
        }
    }

    let pooled: HashSet<&str> = pools
        .iter()
        .flat_map(|pool| pool.datastores.iter().map(|ds| ds.mo_id.as_str()))
        .collect();
    standalone.retain(|ds| !pooled.contains(ds.mo_id.as_str()));

    (standalone, pools)
}

impl CapacityRecord for ClusterCapacity {
    fn fields(&self) -> Fields {
        Fields::new()
            .with("mo_id", self.mo_id.as_str())
            .with("name", self.name.as_str())
            .with("vmhost_count", self.vmhost_count)
            .with("raw_cpu_total", self.raw_cpu_total)
            .with("raw_cpu_used", self.raw_cpu_used)
            .with("raw_mem_total", self.raw_mem_total)
            .with("raw_mem_used", self.raw_mem_used)
            .with("raw_cpu_over_commit", self.raw_cpu_over_commit)
            .with("raw_avg_cpu_over_commit", self.raw_avg_cpu_over_commit)
            .with("raw_mem_over_commit", self.raw_mem_over_commit)
            .with("raw_avg_mem_over_commit", self.raw_avg_mem_over_commit)
            .with("raw_storage_total", self.raw_storage_total)
            .with("raw_storage_used", self.raw_storage_used)
            .with("raw_storage_free", self.raw_storage_free)
            .with("vm_low_cpu", self.vm_low_cpu)
            .with("vm_avg_cpu", self.vm_avg_cpu)
            .with("vm_max_cpu", self.vm_max_cpu)
            .with("vm_low_mem", self.vm_low_mem)
            .with("vm_avg_mem", self.vm_avg_mem)
            .with("vm_max_mem", self.vm_max_mem)
    }
}

/// Headroom left after reserving `ha_factor` hosts' worth of capacity.
#[derive(Debug, Clone, Serialize)]
pub struct HaCapacity {
    pub mo_id: String,
    pub cluster_ha: String,
    pub cluster: String,
    pub ha_factor: u32,
    pub ha_reserved_cpu: f64,
    pub ha_reserved_mem: f64,
    pub ha_usable_cpu_total: f64,
    pub ha_usable_mem_total: f64,
    pub ha_cpu_over_commit: f64,
    pub ha_cpu_percent_used: f64,
    pub ha_mem_over_commit: f64,
    pub ha_mem_percent_used: f64,
}

impl HaCapacity {
    /// Usable capacity goes negative when the reservation exceeds the cluster;
    /// over-commit is then reported as 0.0 rather than a negative ratio.
    pub fn derive(cluster: &ClusterCapacity, ha_factor: u32) -> Self {
        let host_count = f64::from(cluster.vmhost_count);
        let factor = f64::from(ha_factor);

        let ha_reserved_cpu = safe_division(cluster.raw_cpu_total, host_count) * factor;
        let ha_reserved_mem = safe_division(cluster.raw_mem_total, host_count) * factor;
        let ha_usable_cpu_total = cluster.raw_cpu_total - ha_reserved_cpu;
        let ha_usable_mem_total = cluster.raw_mem_total - ha_reserved_mem;
        let ha_cpu_over_commit = safe_division(cluster.raw_cpu_used, ha_usable_cpu_total);
        let ha_mem_over_commit = safe_division(cluster.raw_mem_used, ha_usable_mem_total);

        HaCapacity {
            mo_id: format!("{}-ha{}", cluster.mo_id, ha_factor),
            cluster_ha: format!("{}-ha_n{}", cluster.name, ha_factor),
            cluster: cluster.name.clone(),
            ha_factor,
            ha_reserved_cpu,
            ha_reserved_mem,
            ha_usable_cpu_total,
            ha_usable_mem_total,
            ha_cpu_over_commit,
            ha_cpu_percent_used: ha_cpu_over_commit * 100.0,
            ha_mem_over_commit,
            ha_mem_percent_used: ha_mem_over_commit * 100.0,
        }
    }
}

impl CapacityRecord for HaCapacity {
    fn fields(&self) -> Fields {
        Fields::new()
            .with("mo_id", self.mo_id.as_str())
            .with("cluster_ha", self.cluster_ha.as_str())
            .with("cluster", self.cluster.as_str())
            .with("ha_factor", self.ha_factor)
            .with("ha_reserved_cpu", self.ha_reserved_cpu)
            .with("ha_reserved_mem", self.ha_reserved_mem)
            .with("ha_usable_cpu_total", self.ha_usable_cpu_total)
            .with("ha_usable_mem_total", self.ha_usable_mem_total)
            .with("ha_cpu_over_commit", self.ha_cpu_over_commit)
            .with("ha_cpu_percent_used", self.ha_cpu_percent_used)
            .with("ha_mem_over_commit", self.ha_mem_over_commit)
            .with("ha_mem_percent_used", self.ha_mem_percent_used)
    }
}
