//! Wire messages of the meta group and the client trait carrying them.
//!
//! Only the message kinds and payload shapes live here; the transport
//! below them is a collaborator. Tests run the same messages over an
//! in-process implementation of [`MetaClient`].

use std::sync::Arc;

use async_trait::async_trait;
use models::plan::PhysicalPlan;
use models::{MeasurementSchema, Node, TsStatus};
use serde::{Deserialize, Serialize};

use crate::error::MetaResult;
use crate::raft_log::LogEntry;

/// Response codes of the membership protocol; the exact values round-trip.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ResponseCode {
    Agree,
    IdentifierConflict,
    NewNodeParameterConflict,
    PartitionTableUnavailable,
    ClusterTooSmall,
    Null,
    Reject,
}

/// The start-up parameters that must match bit-for-bit across members.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StartUpStatus {
    pub partition_interval: i64,
    pub hash_salt: u64,
    pub replication_num: u32,
    pub cluster_name: String,
    pub seed_nodes: Vec<Node>,
}

/// Field-by-field diagnostic of a start-up status comparison.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckStatusResponse {
    pub partition_interval_equals: bool,
    pub hash_salt_equals: bool,
    pub replication_num_equals: bool,
    pub seed_node_equals: bool,
    pub cluster_name_equals: bool,
}

impl CheckStatusResponse {
    pub fn consistent(&self) -> bool {
        self.partition_interval_equals
            && self.hash_salt_equals
            && self.replication_num_equals
            && self.seed_node_equals
            && self.cluster_name_equals
    }

    /// The names of the conflicting fields, for the join diagnostic.
    pub fn conflict_detail(&self) -> String {
        let mut fields = Vec::new();
        if !self.partition_interval_equals {
            fields.push("partition interval");
        }
        if !self.hash_salt_equals {
            fields.push("hash salt");
        }
        if !self.replication_num_equals {
            fields.push("replication number");
        }
        if !self.seed_node_equals {
            fields.push("seed nodes");
        }
        if !self.cluster_name_equals {
            fields.push("cluster name");
        }
        fields.join(", ")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddNodeRequest {
    pub node: Node,
    pub status: StartUpStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddNodeResponse {
    pub code: ResponseCode,
    pub partition_table: Option<Vec<u8>>,
    pub check_status: Option<CheckStatusResponse>,
}

impl AddNodeResponse {
    pub fn code(code: ResponseCode) -> Self {
        Self {
            code,
            partition_table: None,
            check_status: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub term: u64,
    pub leader: Node,
    pub last_log_index: u64,
    pub last_log_term: u64,
    /// The leader does not know this follower's identifier yet.
    pub require_identifier: bool,
    /// The identifier this follower reported conflicts; rehash and
    /// re-register.
    pub regenerate_identifier: bool,
    /// Piggybacked full snapshot, sent to blind nodes.
    pub partition_table: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub term: u64,
    pub follower_identifier: Option<i32>,
    pub require_partition_table: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntryRequest {
    pub term: u64,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entry: LogEntry,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntryResponse {
    pub term: u64,
    pub accepted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullSchemaRequest {
    /// Header of the replica group that owns the schemas.
    pub header: Node,
    pub prefix_paths: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullSchemaResponse {
    pub schemas: Vec<MeasurementSchema>,
}

/// One peer's meta service, regardless of what carries the bytes.
#[async_trait]
pub trait MetaClient: Send + Sync {
    async fn add_node(&self, req: AddNodeRequest) -> MetaResult<AddNodeResponse>;
    async fn remove_node(&self, node: Node) -> MetaResult<ResponseCode>;
    async fn heartbeat(&self, req: HeartbeatRequest) -> MetaResult<HeartbeatResponse>;
    async fn append_entry(&self, req: AppendEntryRequest) -> MetaResult<AppendEntryResponse>;
    async fn check_status(&self, status: StartUpStatus) -> MetaResult<CheckStatusResponse>;
    async fn check_alive(&self) -> MetaResult<bool>;
    async fn pull_schema(&self, req: PullSchemaRequest) -> MetaResult<PullSchemaResponse>;
    /// One-way removal notice sent by the leader to an exiled node.
    async fn exile(&self) -> MetaResult<()>;
    /// Forwards a data plan to the receiver, to be handled in the group
    /// named by `header`.
    async fn execute_plan(&self, header: Node, plan: PhysicalPlan) -> MetaResult<TsStatus>;
}

/// Hands out clients for peers; the transport's connection pooling hides
/// behind this seam.
pub trait ClientProvider: Send + Sync {
    fn client(&self, node: &Node) -> Arc<dyn MetaClient>;
}
