//! Allow-list of the reporting schema.
//!
//! Table and column identifiers only ever reach SQL from here; names read back
//! from the catalog are resolved through [`Table::from_name`] and
//! [`Table::column`] and dropped when they are not known.
//! The DDL lives in `migrations/20250301000000_capacity_schema.sql`.

use std::fmt;

pub const ID: &str = "id";
pub const DATE_CREATED: &str = "date_created";
pub const DATE_MODIFIED: &str = "date_modified";
pub const DECOMMISSION: &str = "decommission";
pub const DECOMMISSION_DATE: &str = "decommission_date";

/// Prefix shared by every reporting table; the decommission sweep scans it.
pub const TABLE_PREFIX: &str = "capacity_";

const LIFECYCLE: [&str; 4] = [DATE_CREATED, DATE_MODIFIED, DECOMMISSION, DECOMMISSION_DATE];

const SOURCE_SYSTEM_COLUMNS: &[&str] = &["name"];

const CLUSTER_COLUMNS: &[&str] = &[
    "mo_id",
    "name",
    "vmhost_count",
    "raw_cpu_total",
    "raw_cpu_used",
    "raw_mem_total",
    "raw_mem_used",
    "raw_cpu_over_commit",
    "raw_avg_cpu_over_commit",
    "raw_mem_over_commit",
    "raw_avg_mem_over_commit",
    "raw_storage_total",
    "raw_storage_used",
    "raw_storage_free",
    "vm_low_cpu",
    "vm_avg_cpu",
    "vm_max_cpu",
    "vm_low_mem",
    "vm_avg_mem",
    "vm_max_mem",
];

const HOST_COLUMNS: &[&str] = &[
    "mo_id",
    "name",
    "vendor",
    "model",
    "serial_number",
    "contract_expiry",
    "eol",
    "cpu_total",
    "cpu_used",
    "cpu_over_commit",
    "cpu_percent_used",
    "mem_total",
    "mem_used",
    "mem_granted",
    "mem_granted_percent",
    "mem_over_commit",
    "mem_percent_used",
    "vm_count",
    "uptime_days",
    "vm_low_cpu",
    "vm_avg_cpu",
    "vm_max_cpu",
    "vm_low_mem",
    "vm_avg_mem",
    "vm_max_mem",
];

const STORAGE_COLUMNS: &[&str] = &[
    "mo_id",
    "name",
    "total_capacity",
    "total_free_committed",
    "total_free_actual",
    "total_used",
    "vm_total",
    "vm_poweredon_count",
    "vm_poweredoff_count",
    "vm_template_count",
];

const HA_COLUMNS: &[&str] = &[
    "mo_id",
    "cluster_ha",
    "cluster",
    "ha_factor",
    "ha_reserved_cpu",
    "ha_reserved_mem",
    "ha_usable_cpu_total",
    "ha_usable_mem_total",
    "ha_cpu_over_commit",
    "ha_cpu_percent_used",
    "ha_mem_over_commit",
    "ha_mem_percent_used",
];

const VM_SIZE_COLUMNS: &[&str] = &["mo_id", "vm_size"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Table {
    SourceSystem,
    Cluster,
    Host,
    Datastore,
    DatastoreCluster,
    HaCapacity,
    VmSize,
    ClusterSourceSystem,
    HostSourceSystem,
    DatastoreSourceSystem,
    DatastoreClusterSourceSystem,
    HaCapacitySourceSystem,
    ClusterVmSize,
    HostVmSize,
    ClusterDatastore,
    ClusterDatastoreCluster,
    DatastoreClusterDatastore,
    ClusterHaCapacity,
    ClusterHost,
}

impl Table {
    pub const ALL: [Table; 19] = [
        Table::SourceSystem,
        Table::Cluster,
        Table::Host,
        Table::Datastore,
        Table::DatastoreCluster,
        Table::HaCapacity,
        Table::VmSize,
        Table::ClusterSourceSystem,
        Table::HostSourceSystem,
        Table::DatastoreSourceSystem,
        Table::DatastoreClusterSourceSystem,
        Table::HaCapacitySourceSystem,
        Table::ClusterVmSize,
        Table::HostVmSize,
        Table::ClusterDatastore,
        Table::ClusterDatastoreCluster,
        Table::DatastoreClusterDatastore,
        Table::ClusterHaCapacity,
        Table::ClusterHost,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Table::SourceSystem => "capacity_source_system",
            Table::Cluster => "capacity_cluster",
            Table::Host => "capacity_host",
            Table::Datastore => "capacity_datastore",
            Table::DatastoreCluster => "capacity_datastore_cluster",
            Table::HaCapacity => "capacity_ha_capacity",
            Table::VmSize => "capacity_vm_size",
            Table::ClusterSourceSystem => "capacity_cluster_source_system",
            Table::HostSourceSystem => "capacity_host_source_system",
            Table::DatastoreSourceSystem => "capacity_datastore_source_system",
            Table::DatastoreClusterSourceSystem => "capacity_datastore_cluster_source_system",
            Table::HaCapacitySourceSystem => "capacity_ha_capacity_source_system",
            Table::ClusterVmSize => "capacity_cluster_vm_size",
            Table::HostVmSize => "capacity_host_vm_size",
            Table::ClusterDatastore => "capacity_cluster_datastore",
            Table::ClusterDatastoreCluster => "capacity_cluster_datastore_cluster",
            Table::DatastoreClusterDatastore => "capacity_datastore_cluster_datastore",
            Table::ClusterHaCapacity => "capacity_cluster_ha_capacity",
            Table::ClusterHost => "capacity_cluster_host",
        }
    }

    pub fn from_name(name: &str) -> Option<Table> {
        Table::ALL.into_iter().find(|t| t.name() == name)
    }

    /// Entity tables carry the lifecycle columns; junction tables do not.
    pub fn is_entity(self) -> bool {
        self.association().is_none()
    }

    pub fn association(self) -> Option<Association> {
        ASSOCIATIONS.into_iter().find(|a| a.table == self)
    }

    fn data_columns(self) -> &'static [&'static str] {
        match self {
            Table::SourceSystem => SOURCE_SYSTEM_COLUMNS,
            Table::Cluster => CLUSTER_COLUMNS,
            Table::Host => HOST_COLUMNS,
            Table::Datastore | Table::DatastoreCluster => STORAGE_COLUMNS,
            Table::HaCapacity => HA_COLUMNS,
            Table::VmSize => VM_SIZE_COLUMNS,
            _ => &[],
        }
    }

    /// Resolves a column name to its allow-listed identifier.
    pub fn column(self, name: &str) -> Option<&'static str> {
        if name == ID {
            return Some(ID);
        }
        if let Some(assoc) = self.association() {
            return [assoc.owner_column, assoc.member_column]
                .into_iter()
                .find(|c| *c == name);
        }
        self.data_columns()
            .iter()
            .chain(LIFECYCLE.iter())
            .copied()
            .find(|c| *c == name)
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A many-to-many junction: `owner_column` references `owner`,
/// `member_column` references `member`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Association {
    pub table: Table,
    pub owner: Table,
    pub owner_column: &'static str,
    pub member: Table,
    pub member_column: &'static str,
}

const fn association(
    table: Table,
    owner: Table,
    owner_column: &'static str,
    member: Table,
    member_column: &'static str,
) -> Association {
    Association {
        table,
        owner,
        owner_column,
        member,
        member_column,
    }
}

pub const CLUSTER_SOURCE_SYSTEM: Association = association(
    Table::ClusterSourceSystem,
    Table::Cluster,
    "cluster_id",
    Table::SourceSystem,
    "source_system_id",
);
pub const HOST_SOURCE_SYSTEM: Association = association(
    Table::HostSourceSystem,
    Table::Host,
    "host_id",
    Table::SourceSystem,
    "source_system_id",
);
pub const DATASTORE_SOURCE_SYSTEM: Association = association(
    Table::DatastoreSourceSystem,
    Table::Datastore,
    "datastore_id",
    Table::SourceSystem,
    "source_system_id",
);
pub const DATASTORE_CLUSTER_SOURCE_SYSTEM: Association = association(
    Table::DatastoreClusterSourceSystem,
    Table::DatastoreCluster,
    "datastore_cluster_id",
    Table::SourceSystem,
    "source_system_id",
);
pub const HA_CAPACITY_SOURCE_SYSTEM: Association = association(
    Table::HaCapacitySourceSystem,
    Table::HaCapacity,
    "ha_capacity_id",
    Table::SourceSystem,
    "source_system_id",
);
pub const CLUSTER_VM_SIZE: Association = association(
    Table::ClusterVmSize,
    Table::Cluster,
    "cluster_id",
    Table::VmSize,
    "vm_size_id",
);
pub const HOST_VM_SIZE: Association = association(
    Table::HostVmSize,
    Table::Host,
    "host_id",
    Table::VmSize,
    "vm_size_id",
);
pub const CLUSTER_DATASTORE: Association = association(
    Table::ClusterDatastore,
    Table::Cluster,
    "cluster_id",
    Table::Datastore,
    "datastore_id",
);
pub const CLUSTER_DATASTORE_CLUSTER: Association = association(
    Table::ClusterDatastoreCluster,
    Table::Cluster,
    "cluster_id",
    Table::DatastoreCluster,
    "datastore_cluster_id",
);
pub const DATASTORE_CLUSTER_DATASTORE: Association = association(
    Table::DatastoreClusterDatastore,
    Table::DatastoreCluster,
    "datastore_cluster_id",
    Table::Datastore,
    "datastore_id",
);
pub const CLUSTER_HA_CAPACITY: Association = association(
    Table::ClusterHaCapacity,
    Table::Cluster,
    "cluster_id",
    Table::HaCapacity,
    "ha_capacity_id",
);
pub const CLUSTER_HOST: Association = association(
    Table::ClusterHost,
    Table::Cluster,
    "cluster_id",
    Table::Host,
    "host_id",
);

pub const ASSOCIATIONS: [Association; 12] = [
    CLUSTER_SOURCE_SYSTEM,
    HOST_SOURCE_SYSTEM,
    DATASTORE_SOURCE_SYSTEM,
    DATASTORE_CLUSTER_SOURCE_SYSTEM,
    HA_CAPACITY_SOURCE_SYSTEM,
    CLUSTER_VM_SIZE,
    HOST_VM_SIZE,
    CLUSTER_DATASTORE,
    CLUSTER_DATASTORE_CLUSTER,
    DATASTORE_CLUSTER_DATASTORE,
    CLUSTER_HA_CAPACITY,
    CLUSTER_HOST,
];
