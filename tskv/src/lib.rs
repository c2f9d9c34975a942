pub mod compaction;
pub mod error;
pub mod file_utils;
pub mod mods;
pub mod tsfile;

pub use error::{Error, Result};

pub type TimePartition = i64;
