use std::path::PathBuf;

use snafu::Snafu;

pub type MetaResult<T, E = MetaError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum MetaError {
    /// Cluster-fatal at join time, never recovered.
    #[snafu(display("Start-up configuration conflicts with the cluster: {}", detail))]
    ConfigInconsistent { detail: String },

    #[snafu(display("Start-up check against the seed nodes failed"))]
    StartUpCheckFailure,

    #[snafu(display("The partition table is not available yet"))]
    PartitionTableUnavailable,

    #[snafu(display("Removing a node would leave fewer members than replicas"))]
    ClusterTooSmall,

    #[snafu(display("A node cannot admit itself into the cluster"))]
    AddSelf,

    #[snafu(display("Storage group of '{}' is not set", path))]
    StorageGroupNotSet { path: String },

    #[snafu(display("Path '{}' does not exist", path))]
    PathNotExist { path: String },

    #[snafu(display("Consistency check failed: {}", message))]
    ConsistencyCheck { message: String },

    #[snafu(display("{} timed out", what))]
    Timeout { what: String },

    #[snafu(display("This node is no longer the leader"))]
    LeadershipStale,

    #[snafu(display("No leader is known in the current term"))]
    NoLeader,

    #[snafu(display("Node {} is not in the cluster", node))]
    NodeNotFound { node: String },

    #[snafu(display("Cannot reach node {}: {}", node, reason))]
    Unreachable { node: String, reason: String },

    #[snafu(display("Log execution failed: {}", reason))]
    LogExecution { reason: String },

    #[snafu(display("Partition table bytes are corrupt: {}", reason))]
    CorruptTable { reason: String },

    #[snafu(display("Plan {} is not supported here", kind))]
    UnsupportedPlan { kind: String },

    #[snafu(display("IO error on '{}': {}", path.display(), source))]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}
