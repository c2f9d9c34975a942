use std::fs::File;
use std::io::prelude::Read;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    #[snafu(display("Failed to read config file '{}': {}", path.display(), source))]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Failed to parse config file '{}': {}", path.display(), source))]
    ParseFile {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Dispatch order of the compaction scheduler.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CompactionPriority {
    Balance,
    InnerCross,
    CrossInner,
}

impl Default for CompactionPriority {
    fn default() -> Self {
        CompactionPriority::Balance
    }
}

/// Cluster-wide parameters. The fields of [`ClusterConfig`] that take part in
/// the start-up status check must match bit-for-bit across all members.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClusterConfig {
    pub cluster_name: String,
    /// Seed node urls, `host:meta_port:data_port:client_port`.
    pub seed_node_urls: Vec<String>,
    pub replication_num: u32,
    pub hash_salt: u64,
    /// Width of one time partition in milliseconds.
    pub partition_interval: i64,

    pub read_operation_timeout_ms: u64,
    pub write_operation_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// A follower that has not heard from the leader for this long starts
    /// looking for a new one.
    pub heartbeat_expired_ms: u64,
    pub join_retry_interval_ms: u64,
    pub node_report_interval_sec: u64,

    pub enable_auto_create_schema: bool,
    /// Path depth at which auto-create infers the storage group.
    pub default_storage_group_level: usize,
    pub remote_schema_cache_size: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            cluster_name: String::from("default_cluster"),
            seed_node_urls: vec![],
            replication_num: 1,
            hash_salt: 2333,
            partition_interval: 604_800_000,
            read_operation_timeout_ms: 30_000,
            write_operation_timeout_ms: 30_000,
            heartbeat_interval_ms: 1_000,
            heartbeat_expired_ms: 20_000,
            join_retry_interval_ms: 5_000,
            node_report_interval_sec: 10,
            enable_auto_create_schema: true,
            default_storage_group_level: 1,
            remote_schema_cache_size: 100_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    /// Upper bound on concurrently running compaction tasks.
    pub concurrent_compaction_thread: usize,
    /// Accumulated size at which the inner-space selector seals a candidate
    /// set.
    pub target_compaction_file_size: u64,
    pub enable_seq_space_compaction: bool,
    pub enable_unseq_space_compaction: bool,
    pub compaction_priority: CompactionPriority,
    pub hardlink_clean_interval_sec: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            concurrent_compaction_thread: 10,
            target_compaction_file_size: 2_147_483_648,
            enable_seq_space_compaction: true,
            enable_unseq_space_compaction: true,
            compaction_priority: CompactionPriority::default(),
            hardlink_clean_interval_sec: 3_600,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub cluster: ClusterConfig,
    pub storage: StorageConfig,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
        let path = path.as_ref();
        let mut content = String::new();
        File::open(path)
            .and_then(|mut f| f.read_to_string(&mut content))
            .context(ReadFileSnafu { path })?;
        toml::from_str(&content).context(ParseFileSnafu { path })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_config() {
        let config_str = r#"
[cluster]
cluster_name = "cluster_a"
seed_node_urls = ["127.0.0.1:9003:40010:6667"]
replication_num = 2
hash_salt = 31
partition_interval = 86400000

[storage]
target_compaction_file_size = 100
compaction_priority = "inner_cross"
"#;
        let config: Config = toml::from_str(config_str).unwrap();
        assert_eq!(config.cluster.cluster_name, "cluster_a");
        assert_eq!(config.cluster.replication_num, 2);
        assert_eq!(config.cluster.hash_salt, 31);
        assert_eq!(config.storage.target_compaction_file_size, 100);
        assert_eq!(
            config.storage.compaction_priority,
            CompactionPriority::InnerCross
        );
        // unset sections fall back to defaults
        assert_eq!(config.cluster.heartbeat_interval_ms, 1_000);
        assert!(config.storage.enable_seq_space_compaction);
        assert!(toml::to_string_pretty(&config).is_ok());
    }

    #[test]
    fn test_default_round_trip() {
        let config = Config::default();
        let encoded = toml::to_string(&config).unwrap();
        let decoded: Config = toml::from_str(&encoded).unwrap();
        assert_eq!(config, decoded);
    }
}
