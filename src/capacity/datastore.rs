use serde::Serialize;

use super::units::bytes_to_tb;
use super::{CapacityRecord, Fields};
use crate::inventory::{DatastoreNode, StoragePodNode};

/// Storage figures of one shared volume, in TB.
#[derive(Debug, Clone, Serialize)]
pub struct DatastoreCapacity {
    pub name: String,
    pub mo_id: String,
    pub total_capacity: f64,
    /// Free space as last committed by the platform.
    pub total_free_committed: f64,
    /// Committed free space minus the uncommitted (thin-provisioned) overhead.
    pub total_free_actual: f64,
    pub total_used: f64,
    pub vm_total: u32,
    pub vm_poweredon_count: u32,
    pub vm_poweredoff_count: u32,
    pub vm_template_count: u32,
}

impl DatastoreCapacity {
    pub fn build(node: &DatastoreNode) -> Self {
        let total_capacity = bytes_to_tb(node.capacity_bytes.unwrap_or(0));
        let total_free_committed = bytes_to_tb(node.free_bytes.unwrap_or(0));
        let uncommitted = bytes_to_tb(node.uncommitted_bytes.unwrap_or(0));

        // The platform only accounts for what it provisioned; files it cannot
        // see still occupy the volume.
        let total_used = (total_capacity - total_free_committed) + uncommitted;
        let total_free_actual = total_capacity - total_used;

        let vm_total = node.vms.len() as u32;
        let vm_poweredon_count = node.vms.iter().filter(|vm| vm.is_powered_on()).count() as u32;
        let vm_template_count = node.vms.iter().filter(|vm| vm.template).count() as u32;

        DatastoreCapacity {
            name: node.name.clone(),
            mo_id: node.mo_id.clone(),
            total_capacity,
            total_free_committed,
            total_free_actual,
            total_used,
            vm_total,
            vm_poweredon_count,
            vm_poweredoff_count: vm_total.saturating_sub(vm_poweredon_count + vm_template_count),
            vm_template_count,
        }
    }
}

impl CapacityRecord for DatastoreCapacity {
    fn fields(&self) -> Fields {
        storage_fields(
            &self.mo_id,
            &self.name,
            &StorageTotals {
                total_capacity: self.total_capacity,
                total_free_committed: self.total_free_committed,
                total_free_actual: self.total_free_actual,
                total_used: self.total_used,
                vm_total: self.vm_total,
                vm_poweredon_count: self.vm_poweredon_count,
                vm_poweredoff_count: self.vm_poweredoff_count,
                vm_template_count: self.vm_template_count,
            },
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StorageTotals {
    pub total_capacity: f64,
    pub total_free_committed: f64,
    pub total_free_actual: f64,
    pub total_used: f64,
    pub vm_total: u32,
    pub vm_poweredon_count: u32,
    pub vm_poweredoff_count: u32,
    pub vm_template_count: u32,
}

impl StorageTotals {
    fn add(&mut self, ds: &DatastoreCapacity) {
        self.total_capacity += ds.total_capacity;
        self.total_free_committed += ds.total_free_committed;
        self.total_free_actual += ds.total_free_actual;
        self.total_used += ds.total_used;
        self.vm_total += ds.vm_total;
        self.vm_poweredon_count += ds.vm_poweredon_count;
        self.vm_poweredoff_count += ds.vm_poweredoff_count;
        self.vm_template_count += ds.vm_template_count;
    }
}

/// A storage pod. Its totals are only ever the sums of its members.
#[derive(Debug, Clone, Serialize)]
pub struct DatastoreClusterCapacity {
    pub name: String,
    pub mo_id: String,
    #[serde(flatten)]
    pub totals: StorageTotals,
    pub datastores: Vec<DatastoreCapacity>,
}

impl DatastoreClusterCapacity {
    pub fn build(pod: &StoragePodNode) -> Self {
        let datastores: Vec<DatastoreCapacity> =
            pod.datastores.iter().map(DatastoreCapacity::build).collect();
        let mut totals = StorageTotals::default();
        for ds in &datastores {
            totals.add(ds);
        }
        DatastoreClusterCapacity {
            name: pod.name.clone(),
            mo_id: pod.mo_id.clone(),
            totals,
            datastores,
        }
    }
}

impl CapacityRecord for DatastoreClusterCapacity {
    fn fields(&self) -> Fields {
        storage_fields(&self.mo_id, &self.name, &self.totals)
    }
}

fn storage_fields(mo_id: &str, name: &str, totals: &StorageTotals) -> Fields {
    Fields::new()
        .with("mo_id", mo_id)
        .with("name", name)
        .with("total_capacity", totals.total_capacity)
        .with("total_free_committed", totals.total_free_committed)
        .with("total_free_actual", totals.total_free_actual)
        .with("total_used", totals.total_used)
        .with("vm_total", totals.vm_total)
        .with("vm_poweredon_count", totals.vm_poweredon_count)
        .with("vm_poweredoff_count", totals.vm_poweredoff_count)
        .with("vm_template_count", totals.vm_template_count)
}
