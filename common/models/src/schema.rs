use serde::{Deserialize, Serialize};

use crate::Timestamp;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum DataType {
    #[default]
    Double,
    Int64,
    Boolean,
    Text,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum Encoding {
    #[default]
    Plain,
    Gorilla,
    Rle,
}

/// Schema of one measurement, addressed by its full path
/// (`<storage_group>.<device>.<measurement>`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MeasurementSchema {
    pub full_path: String,
    pub data_type: DataType,
    pub encoding: Encoding,
}

impl MeasurementSchema {
    pub fn new(full_path: impl Into<String>) -> Self {
        Self {
            full_path: full_path.into(),
            data_type: DataType::default(),
            encoding: Encoding::default(),
        }
    }

    pub fn measurement(&self) -> &str {
        self.full_path
            .rsplit('.')
            .next()
            .unwrap_or(&self.full_path)
    }
}

/// One timestamped value; also used as the last-value cache entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct TimeValuePair {
    pub timestamp: Timestamp,
    pub value: f64,
}

impl TimeValuePair {
    pub fn new(timestamp: Timestamp, value: f64) -> Self {
        Self { timestamp, value }
    }
}
