use chrono::NaiveDate;
use serde::Serialize;
use std::collections::BTreeSet;
use tracing::debug;

use super::units::{bytes_to_gb, mb_to_gb};
use super::{low_avg_max, safe_division, CapacityError, CapacityRecord, Fields, VmSize};
use crate::inventory::{short_hostname, HardwareMap, HostNode, LifecycleMap};

const SECONDS_PER_DAY: f64 = 86_400.0;

/// vCPU count and memory of one powered-on VM.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct VmShape {
    pub vcpu: u32,
    pub memory_gb: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HostCapacity {
    pub name: String,
    pub mo_id: String,
    pub vendor: Option<String>,
    pub model: Option<String>,
    pub serial_number: Option<String>,
    pub contract_expiry: Option<NaiveDate>,
    pub eol: Option<NaiveDate>,
    pub cpu_total: u32,
    pub cpu_used: u32,
    pub cpu_over_commit: f64,
    pub cpu_percent_used: f64,
    pub mem_total: f64,
    pub mem_used: f64,
    pub mem_granted: f64,
    pub mem_granted_percent: f64,
    pub mem_over_commit: f64,
    pub mem_percent_used: f64,
    pub vm_count: u32,
    pub uptime_days: f64,
    pub vm_low_cpu: f64,
    pub vm_avg_cpu: f64,
    pub vm_max_cpu: f64,
    pub vm_low_mem: f64,
    pub vm_avg_mem: f64,
    pub vm_max_mem: f64,
    pub vm_sizes: BTreeSet<VmSize>,
    /// Powered-on VMs, kept for cluster-wide statistics. Not persisted.
    #[serde(skip)]
    pub powered_on: Vec<VmShape>,
}

impl HostCapacity {
    pub fn build(
        node: &HostNode,
        hw_map: &HardwareMap,
        lifecycle_map: &LifecycleMap,
    ) -> Result<Self, CapacityError> {
        let cpu_total = node.cpu_cores.ok_or_else(|| missing(node, "cpu_cores"))?;
        let memory_bytes = node
            .memory_bytes
            .ok_or_else(|| missing(node, "memory_bytes"))?;

        let mem_total = bytes_to_gb(memory_bytes);
        let mem_granted = mb_to_gb(node.memory_usage_mb.unwrap_or(0));

        let powered_on: Vec<VmShape> = node
            .vms
            .iter()
            .filter(|vm| vm.is_powered_on())
            .map(|vm| VmShape {
                vcpu: vm.num_cpu,
                memory_gb: mb_to_gb(vm.memory_mb),
            })
            .collect();

        let vm_sizes: BTreeSet<VmSize> = powered_on
            .iter()
            .map(|vm| VmSize::new(vm.vcpu, vm.memory_gb))
            .collect();

        let cpu_used: u32 = powered_on.iter().map(|vm| vm.vcpu).sum();
        let mem_used: f64 = powered_on.iter().map(|vm| vm.memory_gb).sum();

        let cpu_over_commit = safe_division(f64::from(cpu_used), f64::from(cpu_total));
        let mem_over_commit = safe_division(mem_used, mem_total);

        let cpus: Vec<f64> = powered_on.iter().map(|vm| f64::from(vm.vcpu)).collect();
        let mems: Vec<f64> = powered_on.iter().map(|vm| vm.memory_gb).collect();
        let (vm_low_cpu, vm_avg_cpu, vm_max_cpu) = low_avg_max(&cpus);
        let (vm_low_mem, vm_avg_mem, vm_max_mem) = low_avg_max(&mems);

        let mut host = HostCapacity {
            name: node.name.clone(),
            mo_id: node.mo_id.clone(),
            vendor: node.vendor.clone(),
            model: None,
            serial_number: None,
            contract_expiry: None,
            eol: None,
            cpu_total,
            cpu_used,
            cpu_over_commit,
            cpu_percent_used: cpu_over_commit * 100.0,
            mem_total,
            mem_used,
            mem_granted,
            mem_granted_percent: safe_division(mem_granted, mem_total) * 100.0,
            mem_over_commit,
            mem_percent_used: mem_over_commit * 100.0,
            vm_count: powered_on.len() as u32,
            uptime_days: node.uptime_seconds.unwrap_or(0) as f64 / SECONDS_PER_DAY,
            vm_low_cpu,
            vm_avg_cpu,
            vm_max_cpu,
            vm_low_mem,
            vm_avg_mem,
            vm_max_mem,
            vm_sizes,
            powered_on,
        };
        host.enrich(node, hw_map, lifecycle_map);
        Ok(host)
    }

    /// Hardware inventory wins for serial and model; the lifecycle record
    /// supplies contract and end-of-life dates, and the serial when the
    /// hardware inventory has no entry.
    fn enrich(&mut self, node: &HostNode, hw_map: &HardwareMap, lifecycle_map: &LifecycleMap) {
        let short_name = short_hostname(&node.name);
        let lifecycle = lifecycle_map.get(&short_name);

        match hw_map.get(&short_name) {
            Some(hw) => {
                self.serial_number = Some(hw.serial.clone());
                self.model = Some(hw.model.clone());
            }
            None => {
                self.serial_number = lifecycle.and_then(|lc| lc.serial_number.clone());
                self.model = node.model.clone();
            }
        }
        if let Some(lc) = lifecycle {
            self.contract_expiry = lc.contract_expiring;
            self.eol = lc.end_of_life;
        }
        debug!(
            host = %self.name,
            short_name = %short_name,
            hardware = hw_map.contains_key(&short_name),
            lifecycle = lifecycle.is_some(),
            "Host enrichment resolved."
        );
    }
}

fn missing(node: &HostNode, field: &'static str) -> CapacityError {
    CapacityError::MissingInventoryField {
        kind: "host",
        name: node.name.clone(),
        field,
    }
}

impl CapacityRecord for HostCapacity {
    fn fields(&self) -> Fields {
        Fields::new()
            .with("mo_id", self.mo_id.as_str())
            .with("name", self.name.as_str())
            .with("vendor", self.vendor.clone())
            .with("model", self.model.clone())
            .with("serial_number", self.serial_number.clone())
            .with("contract_expiry", self.contract_expiry)
            .with("eol", self.eol)
            .with("cpu_total", self.cpu_total)
            .with("cpu_used", self.cpu_used)
            .with("cpu_over_commit", self.cpu_over_commit)
            .with("cpu_percent_used", self.cpu_percent_used)
            .with("mem_total", self.mem_total)
            .with("mem_used", self.mem_used)
            .with("mem_granted", self.mem_granted)
            .with("mem_granted_percent", self.mem_granted_percent)
            .with("mem_over_commit", self.mem_over_commit)
            .with("mem_percent_used", self.mem_percent_used)
            .with("vm_count", self.vm_count)
            .with("uptime_days", self.uptime_days)
            .with("vm_low_cpu", self.vm_low_cpu)
            .with("vm_avg_cpu", self.vm_avg_cpu)
            .with("vm_max_cpu", self.vm_max_cpu)
            .with("vm_low_mem", self.vm_low_mem)
            .with("vm_avg_mem", self.vm_avg_mem)
            .with("vm_max_mem", self.vm_max_mem)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capacity::FieldValue;
    use crate::inventory::{HardwareRecord, LifecycleRecord, PowerState, VmNode};

    fn build(node: &HostNode) -> Result<HostCapacity, CapacityError> {
        HostCapacity::build(node, &HardwareMap::new(), &LifecycleMap::new())
    }

    fn vm(state: PowerState, num_cpu: u32, memory_mb: u64) -> VmNode {
        VmNode {
            name: None,
            power_state: state,
            template: false,
            num_cpu,
            memory_mb,
        }
    }

    fn host(name: &str, vms: Vec<VmNode>) -> HostNode {
        HostNode {
            name: name.to_string(),
            mo_id: format!("host-{name}"),
            cpu_cores: Some(16),
            memory_bytes: Some(128 * 1024 * 1024 * 1024),
            memory_usage_mb: Some(32 * 1024),
            uptime_seconds: Some(172_800),
            vendor: Some("Cisco Systems Inc".to_string()),
            model: Some("UCSB-B200-M4".to_string()),
            vms,
        }
    }

    #[test]
    fn test_build_counts_only_powered_on_vms() {
        let node = host(
            "esx01.corp.example.net",
            vec![
                vm(PowerState::PoweredOn, 2, 4096),
                vm(PowerState::PoweredOn, 2, 4096),
                vm(PowerState::PoweredOn, 4, 8192),
                vm(PowerState::PoweredOff, 8, 65536),
            ],
        );
        let cap = build(&node).unwrap();

        assert_eq!(cap.cpu_total, 16);
        assert_eq!(cap.cpu_used, 8);
        assert_eq!(cap.cpu_over_commit, 0.5);
        assert_eq!(cap.cpu_percent_used, 50.0);
        assert_eq!(cap.mem_total, 128.0);
        assert_eq!(cap.mem_used, 16.0);
        assert_eq!(cap.mem_over_commit, 0.125);
        assert_eq!(cap.mem_granted, 32.0);
        assert_eq!(cap.mem_granted_percent, 25.0);
        assert_eq!(cap.vm_count, 3);
        assert_eq!(cap.uptime_days, 2.0);
        let cpu = (cap.vm_low_cpu, cap.vm_avg_cpu, cap.vm_max_cpu);
        let mem = (cap.vm_low_mem, cap.vm_avg_mem, cap.vm_max_mem);
        assert_eq!(cpu, (2.0, 3.0, 4.0));
        assert_eq!(mem, (4.0, 6.0, 8.0));
        let keys: Vec<&str> = cap.vm_sizes.iter().map(VmSize::key).collect();
        assert_eq!(keys, vec!["2x4", "4x8"]);
    }

    #[test]
    fn test_zero_cores_yields_zero_over_commit() {
        let mut node = host("esx02", vec![vm(PowerState::PoweredOn, 2, 2048)]);
        node.cpu_cores = Some(0);
        node.memory_bytes = Some(0);
        let cap = build(&node).unwrap();
        assert_eq!(cap.cpu_over_commit, 0.0);
        assert_eq!(cap.mem_over_commit, 0.0);
        assert_eq!(cap.mem_granted_percent, 0.0);
    }

    #[test]
    fn test_no_powered_on_vms_defaults_to_zero() {
        let node = host("esx03", vec![vm(PowerState::PoweredOff, 2, 2048)]);
        let cap = build(&node).unwrap();
        assert_eq!(cap.vm_count, 0);
        let cpu = (cap.vm_low_cpu, cap.vm_avg_cpu, cap.vm_max_cpu);
        assert_eq!(cpu, (0.0, 0.0, 0.0));
        assert!(cap.vm_sizes.is_empty());
    }

    #[test]
    fn test_missing_core_count_fails() {
        let mut node = host("esx04", vec![]);
        node.cpu_cores = None;
        let err = build(&node).unwrap_err();
        assert!(matches!(
            err,
            CapacityError::MissingInventoryField { field: "cpu_cores", .. }
        ));
    }

    #[test]
    fn test_hardware_inventory_takes_precedence_over_lifecycle() {
        let node = host("ESX05.corp.example.net", vec![]);
        let hw: HardwareMap = [(
            "esx05".to_string(),
            HardwareRecord {
                serial: "FCH-HW".to_string(),
                model: "UCSB-B200-M5".to_string(),
            },
        )]
        .into_iter()
        .collect();
        let expiry = NaiveDate::from_ymd_opt(2027, 1, 31);
        let eol = NaiveDate::from_ymd_opt(2029, 6, 30);
        let lc: LifecycleMap = [(
            "esx05".to_string(),
            LifecycleRecord {
                common_name: "ESX05".to_string(),
                serial_number: Some("FCH-LC".to_string()),
                contract_expiring: expiry,
                end_of_life: eol,
            },
        )]
        .into_iter()
        .collect();

        let cap = HostCapacity::build(&node, &hw, &lc).unwrap();
        assert_eq!(cap.serial_number.as_deref(), Some("FCH-HW"));
        assert_eq!(cap.model.as_deref(), Some("UCSB-B200-M5"));
        assert_eq!(cap.contract_expiry, expiry);
        assert_eq!(cap.eol, eol);

        let no_hw = HardwareMap::new();
        let cap = HostCapacity::build(&node, &no_hw, &lc).unwrap();
        assert_eq!(cap.serial_number.as_deref(), Some("FCH-LC"));
        assert_eq!(cap.model.as_deref(), Some("UCSB-B200-M4"));
        assert_eq!(cap.vendor.as_deref(), Some("Cisco Systems Inc"));
    }

    #[test]
    fn test_unknown_host_leaves_enrichment_unset() {
        let node = host("esx06", vec![]);
        let cap = build(&node).unwrap();
        assert_eq!(cap.serial_number, None);
        assert_eq!(cap.contract_expiry, None);
        assert_eq!(cap.eol, None);
        let serial = cap.fields().get("serial_number").cloned();
        assert_eq!(serial, Some(FieldValue::Text(None)));
    }
}
