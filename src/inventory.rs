//! Inventory snapshot shapes handed over by the vendor clients, plus the
//! hardware and lifecycle lookup maps used to enrich hosts.
//!
//! All of this is read-only input: the platform clients export one JSON
//! document per source system and the builders in `crate::capacity` walk it.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum InventoryError {
    #[error("Failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse JSON from {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// One virtualization manager and the clusters it reported.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSystemSnapshot {
    pub name: String,
    #[serde(default)]
    pub clusters: Vec<ClusterNode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterNode {
    pub name: String,
    pub mo_id: String,
    #[serde(default)]
    pub hosts: Vec<HostNode>,
    /// Every volume mounted by the cluster, standalone or pool member.
    #[serde(default)]
    pub datastores: Vec<DatastoreNode>,
    #[serde(default)]
    pub storage_pods: Vec<StoragePodNode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostNode {
    pub name: String,
    pub mo_id: String,
    pub cpu_cores: Option<u32>,
    pub memory_bytes: Option<u64>,
    /// Platform working-set estimate, in MB.
    #[serde(default)]
    pub memory_usage_mb: Option<u64>,
    #[serde(default)]
    pub uptime_seconds: Option<u64>,
    #[serde(default)]
    pub vendor: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub vms: Vec<VmNode>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PowerState {
    PoweredOn,
    PoweredOff,
    Suspended,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmNode {
    #[serde(default)]
    pub name: Option<String>,
    pub power_state: PowerState,
    #[serde(default)]
    pub template: bool,
    pub num_cpu: u32,
    pub memory_mb: u64,
}

impl VmNode {
    pub fn is_powered_on(&self) -> bool {
        self.power_state == PowerState::PoweredOn
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatastoreNode {
    pub name: String,
    pub mo_id: String,
    #[serde(default)]
    pub capacity_bytes: Option<u64>,
    #[serde(default)]
    pub free_bytes: Option<u64>,
    /// Space the platform has provisioned but not yet written.
    #[serde(default)]
    pub uncommitted_bytes: Option<u64>,
    #[serde(default)]
    pub vms: Vec<VmNode>,
    /// Id of the storage pod this volume belongs to, if any.
    #[serde(default)]
    pub pod: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoragePodNode {
    pub name: String,
    pub mo_id: String,
    #[serde(default)]
    pub datastores: Vec<DatastoreNode>,
}

/// Serial and model reported by the hardware-management system for a blade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareRecord {
    pub serial: String,
    pub model: String,
}

/// Contract and end-of-life data from the lifecycle database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleRecord {
    pub common_name: String,
    pub serial_number: Option<String>,
    pub contract_expiring: Option<NaiveDate>,
    pub end_of_life: Option<NaiveDate>,
}

/// Keyed by lower-cased short hostname.
pub type HardwareMap = HashMap<String, HardwareRecord>;
/// Keyed by lower-cased common name.
pub type LifecycleMap = HashMap<String, LifecycleRecord>;

/// `ESX01.Corp.Example.NET` -> `esx01`
pub fn short_hostname(name: &str) -> String {
    name.split('.').next().unwrap_or(name).to_lowercase()
}

/// Loads every `*.json` snapshot in `dir`, in file-name order.
pub fn load_snapshots(dir: &Path) -> Result<Vec<SourceSystemSnapshot>, InventoryError> {
    let entries = fs::read_dir(dir).map_err(|source| InventoryError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut paths = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| InventoryError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "json") {
            paths.push(path);
        }
    }
    paths.sort();

    let mut snapshots = Vec::with_capacity(paths.len());
    for path in paths {
        let snapshot: SourceSystemSnapshot = read_json(&path)?;
        debug!(
            source_system = %snapshot.name,
            clusters = snapshot.clusters.len(),
            path = ?path,
            "Loaded inventory snapshot."
        );
        snapshots.push(snapshot);
    }
    info!(count = snapshots.len(), dir = ?dir, "Inventory snapshots loaded.");
    Ok(snapshots)
}

/// Loads the hardware-management export and normalises its keys.
pub fn load_hardware_map(path: &Path) -> Result<HardwareMap, InventoryError> {
    let raw: HashMap<String, HardwareRecord> = read_json(path)?;
    let map: HardwareMap = raw
        .into_iter()
        .map(|(name, record)| (short_hostname(&name), record))
        .collect();
    info!(entries = map.len(), "Hardware inventory map loaded.");
    Ok(map)
}

/// Indexes lifecycle rows by lower-cased common name; later rows win.
pub fn index_lifecycle(records: Vec<LifecycleRecord>) -> LifecycleMap {
    records
        .into_iter()
        .map(|record| (record.common_name.to_lowercase(), record))
        .collect()
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, InventoryError> {
    let contents = fs::read_to_string(path).map_err(|source| InventoryError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&contents).map_err(|source| InventoryError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
