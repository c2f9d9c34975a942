//! In-process wiring for member tests: a registry-backed transport plus
//! mock collaborators.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use config::ClusterConfig;
use models::plan::PhysicalPlan;
use models::{MeasurementSchema, Node, NodeIdentifier, TsStatus};
use parking_lot::Mutex;

use super::{DataGroupServices, MetaGroupMember, PlanExecutor};
use crate::coordinator::LatencyOrderedSelector;
use crate::error::{MetaResult, StorageGroupNotSetSnafu, UnreachableSnafu};
use crate::metadata::MetadataManager;
use crate::partition::table::{NodeAdditionResult, NodeRemovalResult};
use crate::partition::SlotPartitionTable;
use crate::rpc::*;

/// Routes messages to members of the same process by endpoint.
#[derive(Default)]
pub struct LocalRegistry {
    members: Mutex<HashMap<(String, u16), Arc<MetaGroupMember>>>,
}

impl LocalRegistry {
    pub fn register(&self, member: &Arc<MetaGroupMember>) {
        let node = member.this_node();
        self.members
            .lock()
            .insert((node.host.clone(), node.meta_port), member.clone());
    }

    fn lookup(&self, node: &Node) -> Option<Arc<MetaGroupMember>> {
        self.members
            .lock()
            .get(&(node.host.clone(), node.meta_port))
            .cloned()
    }
}

pub struct LocalClientProvider {
    pub registry: Arc<LocalRegistry>,
}

impl ClientProvider for LocalClientProvider {
    fn client(&self, node: &Node) -> Arc<dyn MetaClient> {
        Arc::new(LocalClient {
            registry: self.registry.clone(),
            node: node.clone(),
        })
    }
}

pub struct LocalClient {
    registry: Arc<LocalRegistry>,
    node: Node,
}

impl LocalClient {
    fn target(&self) -> MetaResult<Arc<MetaGroupMember>> {
        self.registry.lookup(&self.node).ok_or_else(|| {
            UnreachableSnafu {
                node: self.node.to_string(),
                reason: "not registered",
            }
            .build()
        })
    }
}

#[async_trait]
impl MetaClient for LocalClient {
    async fn add_node(&self, req: AddNodeRequest) -> MetaResult<AddNodeResponse> {
        self.target()?.handle_add_node(req).await
    }

    async fn remove_node(&self, node: Node) -> MetaResult<ResponseCode> {
        self.target()?.handle_remove_node(node).await
    }

    async fn heartbeat(&self, req: HeartbeatRequest) -> MetaResult<HeartbeatResponse> {
        Ok(self.target()?.handle_heartbeat(req).await)
    }

    async fn append_entry(&self, req: AppendEntryRequest) -> MetaResult<AppendEntryResponse> {
        Ok(self.target()?.handle_append_entry(req).await)
    }

    async fn check_status(&self, status: StartUpStatus) -> MetaResult<CheckStatusResponse> {
        Ok(self.target()?.handle_check_status(status))
    }

    async fn check_alive(&self) -> MetaResult<bool> {
        Ok(self.target().is_ok())
    }

    async fn pull_schema(&self, req: PullSchemaRequest) -> MetaResult<PullSchemaResponse> {
        let schemas = self.target()?.metadata.local_schemas(&req.prefix_paths).await?;
        Ok(PullSchemaResponse { schemas })
    }

    async fn exile(&self) -> MetaResult<()> {
        self.target()?.handle_exile().await;
        Ok(())
    }

    async fn execute_plan(&self, header: Node, plan: PhysicalPlan) -> MetaResult<TsStatus> {
        Ok(self.target()?.handle_execute_plan(header, plan).await)
    }
}

/// Metadata mock: a fixed set of storage groups, prefix-matched.
#[derive(Default)]
pub struct TestMetadata {
    pub storage_groups: Mutex<HashSet<String>>,
    pub created_timeseries: Mutex<Vec<String>>,
}

impl TestMetadata {
    pub fn with_groups(groups: &[&str]) -> Arc<Self> {
        let metadata = Self::default();
        *metadata.storage_groups.lock() =
            groups.iter().map(|g| g.to_string()).collect();
        Arc::new(metadata)
    }
}

#[async_trait]
impl MetadataManager for TestMetadata {
    fn storage_group_for(&self, path: &str) -> MetaResult<String> {
        self.storage_groups
            .lock()
            .iter()
            .find(|sg| path == *sg || path.starts_with(&format!("{}.", sg)))
            .cloned()
            .ok_or_else(|| StorageGroupNotSetSnafu { path }.build())
    }

    async fn expand_paths(&self, patterns: &[String]) -> MetaResult<Vec<String>> {
        Ok(patterns
            .iter()
            .map(|p| p.trim_end_matches(".*").to_string())
            .collect())
    }

    async fn create_schema_for(&self, plan: &PhysicalPlan) -> MetaResult<()> {
        let device = match plan {
            PhysicalPlan::InsertRow(p) => p.device.clone(),
            PhysicalPlan::InsertTablet(p) => p.device.clone(),
            PhysicalPlan::CreateTimeSeries(p) => p.path.clone(),
            _ => return Ok(()),
        };
        let sg = device.split('.').take(2).collect::<Vec<_>>().join(".");
        self.storage_groups.lock().insert(sg);
        Ok(())
    }

    async fn create_timeseries(&self, paths: &[String]) -> MetaResult<bool> {
        self.created_timeseries.lock().extend(paths.iter().cloned());
        Ok(!paths.is_empty())
    }

    async fn local_schemas(&self, prefixes: &[String]) -> MetaResult<Vec<MeasurementSchema>> {
        Ok(prefixes
            .iter()
            .map(|p| MeasurementSchema::new(p.clone()))
            .collect())
    }
}

/// Data-plane mock: records executions and answers from a per-header
/// status table.
#[derive(Default)]
pub struct TestDataServices {
    pub executed: Mutex<Vec<(Node, PhysicalPlan)>>,
    pub responses: Mutex<HashMap<NodeIdentifier, TsStatus>>,
    pub built_groups: Mutex<usize>,
    pub pulled_snapshots: Mutex<usize>,
}

#[async_trait]
impl DataGroupServices for TestDataServices {
    async fn build_data_groups(&self, _table: &SlotPartitionTable) -> MetaResult<()> {
        *self.built_groups.lock() += 1;
        Ok(())
    }

    async fn execute_in_local_group(&self, header: &Node, plan: &PhysicalPlan) -> TsStatus {
        self.executed.lock().push((header.clone(), plan.clone()));
        // staged responses serve once, then the group heals to SUCCESS
        self.responses
            .lock()
            .remove(&header.identifier)
            .unwrap_or_else(TsStatus::ok)
    }

    async fn add_node(&self, _node: &Node, _result: &NodeAdditionResult) {}

    async fn remove_node(&self, _node: &Node, _result: &NodeRemovalResult) {}

    async fn pull_snapshots(&self) {
        *self.pulled_snapshots.lock() += 1;
    }

    async fn stop(&self, _keep_serving_pulls: bool) {}
}

#[derive(Default)]
pub struct TestExecutor {
    pub executed: Mutex<Vec<PhysicalPlan>>,
}

#[async_trait]
impl PlanExecutor for TestExecutor {
    async fn process_non_query(&self, plan: &PhysicalPlan) -> MetaResult<bool> {
        self.executed.lock().push(plan.clone());
        Ok(true)
    }
}

/// One wired-up member and handles to its mocks.
pub struct TestNode {
    pub member: Arc<MetaGroupMember>,
    pub metadata: Arc<TestMetadata>,
    pub data_services: Arc<TestDataServices>,
    pub executor: Arc<TestExecutor>,
}

pub fn test_config(seed_urls: Vec<String>) -> ClusterConfig {
    ClusterConfig {
        cluster_name: "test_cluster".to_string(),
        seed_node_urls: seed_urls,
        replication_num: 1,
        hash_salt: 31,
        partition_interval: 1_000,
        read_operation_timeout_ms: 2_000,
        write_operation_timeout_ms: 2_000,
        heartbeat_interval_ms: 50,
        heartbeat_expired_ms: 10_000,
        join_retry_interval_ms: 10,
        node_report_interval_sec: 3_600,
        ..ClusterConfig::default()
    }
}

pub fn test_node(
    registry: &Arc<LocalRegistry>,
    config: ClusterConfig,
    data_dir: &Path,
    meta_port: u16,
) -> TestNode {
    let metadata = TestMetadata::with_groups(&["root.sg"]);
    let data_services = Arc::new(TestDataServices::default());
    let executor = Arc::new(TestExecutor::default());
    let node = Node::new("127.0.0.1", meta_port, meta_port + 1000, meta_port + 2000);
    let member = MetaGroupMember::new(
        node,
        Arc::new(config),
        data_dir.join(format!("node-{}", meta_port)),
        Arc::new(LocalClientProvider {
            registry: registry.clone(),
        }),
        Arc::new(LatencyOrderedSelector::default()),
        metadata.clone(),
        data_services.clone(),
        executor.clone(),
    );
    registry.register(&member);
    TestNode {
        member,
        metadata,
        data_services,
        executor,
    }
}
