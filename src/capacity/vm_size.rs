use serde::Serialize;
use std::fmt;

use super::units::mb_to_gb;
use super::{CapacityRecord, Fields};

/// A VM shape bucket, `"{vcpu}x{memory_gb}"`. Identity and equality come from
/// the string alone, so collecting buckets into a set deduplicates them.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct VmSize {
    vm_size: String,
    mo_id: String,
}

impl VmSize {
    pub fn new(vcpu: u32, memory_gb: f64) -> Self {
        Self::from_key(format!("{vcpu}x{memory_gb}"))
    }

    pub fn from_vm(num_cpu: u32, memory_mb: u64) -> Self {
        Self::new(num_cpu, mb_to_gb(memory_mb))
    }

    pub fn from_key(vm_size: String) -> Self {
        let mo_id = format!("vmsize-{vm_size}");
        Self { vm_size, mo_id }
    }

    pub fn key(&self) -> &str {
        &self.vm_size
    }
}

impl fmt::Display for VmSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.vm_size)
    }
}

impl CapacityRecord for VmSize {
    fn fields(&self) -> Fields {
        Fields::new()
            .with("mo_id", self.mo_id.as_str())
            .with("vm_size", self.vm_size.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn test_key_format() {
        assert_eq!(VmSize::from_vm(2, 4096).key(), "2x4");
        assert_eq!(VmSize::from_vm(1, 512).key(), "1x0.5");
        assert_eq!(
            VmSize::new(4, 8.0).fields().get("mo_id"),
            Some(&crate::capacity::FieldValue::from("vmsize-4x8"))
        );
    }

    #[test]
    fn test_buckets_deduplicate_by_key() {
        let set: BTreeSet<VmSize> = [
            VmSize::from_vm(2, 4096),
            VmSize::from_vm(2, 4096),
            VmSize::from_vm(4, 8192),
        ]
        .into_iter()
        .collect();
        let keys: Vec<&str> = set.iter().map(VmSize::key).collect();
        assert_eq!(keys, vec!["2x4", "4x8"]);
    }
}
