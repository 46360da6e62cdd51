use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::capacity::ClusterCapacity;
use crate::credentials::CredentialProvider;
use crate::db::{self, DbParams, MemoryStore, PersistError, SweepReport};
use crate::inventory::{HardwareMap, LifecycleMap, SourceSystemSnapshot};

/// Destination of built cluster trees.
#[async_trait]
pub trait ClusterSink: Send {
    async fn write(&mut self, cluster: &ClusterCapacity) -> Result<i32, PersistError>;

    async fn sweep(&mut self, cutoff_days: u32) -> Result<SweepReport, PersistError>;
}

/// Writes to Postgres, opening a fresh connection per cluster and per sweep.
pub struct PostgresSink {
    params: DbParams,
    credentials: Arc<dyn CredentialProvider>,
}

impl PostgresSink {
    pub fn new(params: DbParams, credentials: Arc<dyn CredentialProvider>) -> Self {
        Self {
            params,
            credentials,
        }
    }
}

#[async_trait]
impl ClusterSink for PostgresSink {
    async fn write(&mut self, cluster: &ClusterCapacity) -> Result<i32, PersistError> {
        db::persist(cluster, &self.params, self.credentials.as_ref())
            .await
    }

    async fn sweep(&mut self, cutoff_days: u32) -> Result<SweepReport, PersistError> {
        db::persist::sweep(&self.params, self.credentials.as_ref(), cutoff_days)
            .await
    }
}

#[async_trait]
impl ClusterSink for MemoryStore {
    async fn write(&mut self, cluster: &ClusterCapacity) -> Result<i32, PersistError> {
        db::write_cluster(self, cluster).await
    }

    async fn sweep(&mut self, cutoff_days: u32) -> Result<SweepReport, PersistError> {
        db::sweep_decommissions(self, cutoff_days).await
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterFailure {
    pub source_system: String,
    pub cluster: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CollectionReport {
    pub source_systems: usize,
    pub clusters_persisted: usize,
    pub failures: Vec<ClusterFailure>,
    pub sweep: SweepReport,
}

/// Persists every cluster, logging and counting per-cluster failures, then
/// sweeps. Only a sweep failure is returned as an error.
pub async fn run_collection(
    snapshots: &[SourceSystemSnapshot],
    hw_map: &HardwareMap,
    lifecycle_map: &LifecycleMap,
    sink: &mut dyn ClusterSink,
    cutoff_days: u32,
) -> Result<CollectionReport, PersistError> {
    let mut report = CollectionReport {
        source_systems: snapshots.len(),
        ..CollectionReport::default()
    };

    for snapshot in snapshots {
        info!(
            source_system = %snapshot.name,
            clusters = snapshot.clusters.len(),
            "Collecting source system."
        );
        for node in &snapshot.clusters {
            let result = match ClusterCapacity::build(&snapshot.name, node, hw_map, lifecycle_map) {
                Ok(cluster) => sink.write(&cluster).await.map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };
            match result {
                Ok(_) => report.clusters_persisted += 1,
                Err(e) => {
                    error!(
                        source_system = %snapshot.name,
                        cluster = %node.name,
                        error = %e,
                        "Failed to persist cluster capacity."
                    );
                    report.failures.push(ClusterFailure {
                        source_system: snapshot.name.clone(),
                        cluster: node.name.clone(),
                        error: e,
                    });
                }
            }
        }
    }

    if !report.failures.is_empty() {
        warn!(
            failed = report.failures.len(),
            "Some clusters were not persisted."
        );
    }
    report.sweep = sink.sweep(cutoff_days).await?;
    info!(
        persisted = report.clusters_persisted,
        failed = report.failures.len(),
        decommissioned = report.sweep.rows_decommissioned,
        "Collection finished."
    );
    Ok(report)
}
