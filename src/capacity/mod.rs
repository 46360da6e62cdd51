//! Capacity records built from an inventory snapshot.
//!
//! Builders run top to bottom once per collection: hosts and datastores first,
//! then the cluster aggregate that owns them, then the HA variants derived from
//! the cluster totals. Nothing is mutated after construction.

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use thiserror::Error;

pub mod cluster;
pub mod datastore;
pub mod host;
pub mod units;
pub mod vm_size;

pub use cluster::{ClusterCapacity, HaCapacity};
pub use datastore::{DatastoreCapacity, DatastoreClusterCapacity};
pub use host::HostCapacity;
pub use vm_size::VmSize;

#[derive(Error, Debug)]
pub enum CapacityError {
    #[error("{kind} '{name}' is missing required inventory field '{field}'")]
    MissingInventoryField {
        kind: &'static str,
        name: String,
        field: &'static str,
    },
}

/// A scalar column value of a flattened capacity record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(Option<String>),
    Date(Option<NaiveDate>),
    Timestamp(Option<DateTime<Utc>>),
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Int(v)
    }
}

impl From<u32> for FieldValue {
    fn from(v: u32) -> Self {
        FieldValue::Int(i64::from(v))
    }
}

impl From<usize> for FieldValue {
    fn from(v: usize) -> Self {
        FieldValue::Int(v as i64)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Text(Some(v.to_string()))
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Text(Some(v))
    }
}

impl From<Option<String>> for FieldValue {
    fn from(v: Option<String>) -> Self {
        FieldValue::Text(v)
    }
}

impl From<Option<NaiveDate>> for FieldValue {
    fn from(v: Option<NaiveDate>) -> Self {
        FieldValue::Date(v)
    }
}

impl From<DateTime<Utc>> for FieldValue {
    fn from(v: DateTime<Utc>) -> Self {
        FieldValue::Timestamp(Some(v))
    }
}

/// Ordered column/value pairs of one flattened record.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Fields(Vec<(&'static str, FieldValue)>);

impl Fields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, column: &'static str, value: impl Into<FieldValue>) -> Self {
        self.push(column, value);
        self
    }

    pub fn push(&mut self, column: &'static str, value: impl Into<FieldValue>) {
        self.0.push((column, value.into()));
    }

    pub fn get(&self, column: &str) -> Option<&FieldValue> {
        self.0.iter().find(|(c, _)| *c == column).map(|(_, v)| v)
    }

    pub fn columns(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.0.iter().map(|(c, _)| *c)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &FieldValue)> + '_ {
        self.0.iter().map(|(c, v)| (*c, v))
    }
}

/// A capacity entity that can be persisted, keyed by its `mo_id` column.
pub trait CapacityRecord {
    /// Persisted columns. Nested collections are not included; the mapping
    /// layer persists them as their own records and associations.
    fn fields(&self) -> Fields;
}

/// `x / y`, or `0.0` when `y` is zero or negative.
pub fn safe_division(x: f64, y: f64) -> f64 {
    if y <= 0.0 {
        return 0.0;
    }
    x / y
}

/// Low, ceiling-rounded average and high of a sample; all zero when empty.
pub(crate) fn low_avg_max(values: &[f64]) -> (f64, f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0, 0.0);
    }
    let low = values.iter().copied().fold(f64::INFINITY, f64::min);
    let high = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let avg = (values.iter().sum::<f64>() / values.len() as f64).ceil();
    (low, avg, high)
}
