use serde::{Deserialize, Serialize};

const FACTOR: f64 = 1024.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StorageUnit {
    Byte,
    KB,
    MB,
    GB,
    TB,
}

impl StorageUnit {
    fn exponent(self) -> i32 {
        match self {
            StorageUnit::Byte => 0,
            StorageUnit::KB => 1,
            StorageUnit::MB => 2,
            StorageUnit::GB => 3,
            StorageUnit::TB => 4,
        }
    }

    /// Multiplier taking one unit of `self` to `to`.
    pub fn factor_to(self, to: StorageUnit) -> f64 {
        FACTOR.powi(self.exponent() - to.exponent())
    }
}

pub fn convert(value: f64, from: StorageUnit, to: StorageUnit) -> f64 {
    value * from.factor_to(to)
}

pub fn bytes_to_gb(bytes: u64) -> f64 {
    convert(bytes as f64, StorageUnit::Byte, StorageUnit::GB)
}

pub fn bytes_to_tb(bytes: u64) -> f64 {
    convert(bytes as f64, StorageUnit::Byte, StorageUnit::TB)
}

pub fn mb_to_gb(mb: u64) -> f64 {
    convert(mb as f64, StorageUnit::MB, StorageUnit::GB)
}
