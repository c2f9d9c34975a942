pub mod dispatch;
pub mod heartbeat;
pub mod membership;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use config::ClusterConfig;
use models::plan::PhysicalPlan;
use models::{Node, NodeIdentifier, TsStatus};
use parking_lot::{Mutex, RwLock};
use snafu::ResultExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::coordinator::NodeSelector;
use crate::error::{IoSnafu, MetaResult};
use crate::metadata::MetadataManager;
use crate::partition::table::{NodeAdditionResult, NodeRemovalResult};
use crate::partition::{PartitionRouter, SlotPartitionTable};
use crate::raft_log::{LogEntry, LogPayload, MetaLogManager};
use crate::rpc::{ClientProvider, StartUpStatus};

pub const NODE_IDENTIFIER_FILE_NAME: &str = "node_identifier";
pub const PARTITION_FILE_NAME: &str = "partitions";
const TEMP_SUFFIX: &str = ".tmp";

/// What the meta side consumes from the data plane. Passed in at
/// construction; the two sides never hold concrete references to each
/// other.
#[async_trait]
pub trait DataGroupServices: Send + Sync {
    /// Builds (or rebuilds) the local data group members for the table.
    async fn build_data_groups(&self, table: &SlotPartitionTable) -> MetaResult<()>;

    /// Executes a plan in the local member of the group named by `header`.
    async fn execute_in_local_group(&self, header: &Node, plan: &PhysicalPlan) -> TsStatus;

    /// Membership changes committed by the meta group.
    async fn add_node(&self, node: &Node, result: &NodeAdditionResult);
    async fn remove_node(&self, node: &Node, result: &NodeRemovalResult);

    /// A fresh joiner pulls the slots it now owns.
    async fn pull_snapshots(&self);

    /// Stops data services; `keep_serving_pulls` is the softer stop used
    /// when this very node was removed and peers still pull from it.
    async fn stop(&self, keep_serving_pulls: bool);
}

/// The local plan executor collaborator.
#[async_trait]
pub trait PlanExecutor: Send + Sync {
    async fn process_non_query(&self, plan: &PhysicalPlan) -> MetaResult<bool>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeCharacter {
    Follower,
    Candidate,
    Leader,
    Elector,
}

/// The top-level actor of the cluster control plane: owns the node list,
/// the partition table and the plan-routing entry point, and drives the
/// meta group's log.
pub struct MetaGroupMember {
    pub(crate) this_node: RwLock<Node>,
    pub(crate) all_nodes: RwLock<Vec<Node>>,
    pub(crate) id_node_map: RwLock<HashMap<NodeIdentifier, Node>>,
    pub(crate) partition_table: Arc<RwLock<Option<SlotPartitionTable>>>,

    pub(crate) character: RwLock<NodeCharacter>,
    pub(crate) term: AtomicU64,
    pub(crate) leader: RwLock<Option<Node>>,
    /// Nodes that still need the partition table, served on the next
    /// heartbeat.
    pub(crate) blind_nodes: Mutex<HashSet<Node>>,
    /// Nodes whose reported identifier collided; told to regenerate.
    pub(crate) id_conflict_nodes: Mutex<HashSet<Node>>,
    pub(crate) last_heartbeat_received: Mutex<Instant>,

    pub(crate) log_manager: tokio::sync::Mutex<MetaLogManager>,
    pub(crate) router: PartitionRouter,
    pub(crate) config: Arc<ClusterConfig>,
    pub(crate) data_dir: PathBuf,

    pub(crate) provider: Arc<dyn ClientProvider>,
    pub(crate) selector: Arc<dyn NodeSelector>,
    pub(crate) metadata: Arc<dyn MetadataManager>,
    pub(crate) data_services: Arc<dyn DataGroupServices>,
    pub(crate) executor: Arc<dyn PlanExecutor>,

    /// Set once the data sub-servers run; the member answers routing from
    /// then on.
    pub(crate) ready: AtomicBool,
    pub(crate) token: CancellationToken,
}

impl MetaGroupMember {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        this_node: Node,
        config: Arc<ClusterConfig>,
        data_dir: PathBuf,
        provider: Arc<dyn ClientProvider>,
        selector: Arc<dyn NodeSelector>,
        metadata: Arc<dyn MetadataManager>,
        data_services: Arc<dyn DataGroupServices>,
        executor: Arc<dyn PlanExecutor>,
    ) -> Arc<Self> {
        let partition_table: Arc<RwLock<Option<SlotPartitionTable>>> =
            Arc::new(RwLock::new(None));
        let router = PartitionRouter::new(
            partition_table.clone(),
            metadata.clone(),
            config.partition_interval,
        );
        let member = Arc::new(Self {
            this_node: RwLock::new(this_node),
            all_nodes: RwLock::new(vec![]),
            id_node_map: RwLock::new(HashMap::new()),
            partition_table,
            character: RwLock::new(NodeCharacter::Elector),
            term: AtomicU64::new(0),
            leader: RwLock::new(None),
            blind_nodes: Mutex::new(HashSet::new()),
            id_conflict_nodes: Mutex::new(HashSet::new()),
            last_heartbeat_received: Mutex::new(Instant::now()),
            log_manager: tokio::sync::Mutex::new(MetaLogManager::new()),
            router,
            config,
            data_dir,
            provider,
            selector,
            metadata,
            data_services,
            executor,
            ready: AtomicBool::new(false),
            token: CancellationToken::new(),
        });
        member.add_seed_nodes();
        member.load_identifier();
        member
    }

    /// Seeds `all_nodes` from configuration, always including this node.
    fn add_seed_nodes(&self) {
        let mut nodes = vec![self.this_node()];
        for url in &self.config.seed_node_urls {
            match Node::parse_url(url) {
                Some(node) => {
                    if !nodes.iter().any(|n| n.same_endpoint(&node)) {
                        nodes.push(node);
                    }
                }
                None => warn!("Ignoring malformed seed url '{}'", url),
            }
        }
        *self.all_nodes.write() = nodes;
    }

    pub async fn stop(&self) {
        self.token.cancel();
        self.data_services.stop(false).await;
        info!("{} stopped", self.name());
    }

    pub(crate) fn name(&self) -> String {
        format!("MetaMember({})", self.this_node.read())
    }

    // ---- state helpers ----------------------------------------------

    pub fn this_node(&self) -> Node {
        self.this_node.read().clone()
    }

    pub fn all_nodes(&self) -> Vec<Node> {
        self.all_nodes.read().clone()
    }

    pub fn character(&self) -> NodeCharacter {
        *self.character.read()
    }

    pub(crate) fn set_character(&self, character: NodeCharacter) {
        let mut current = self.character.write();
        if *current != character {
            info!("{}: {:?} -> {:?}", self.name(), *current, character);
            *current = character;
        }
    }

    pub fn term(&self) -> u64 {
        self.term.load(Ordering::SeqCst)
    }

    pub fn leader(&self) -> Option<Node> {
        self.leader.read().clone()
    }

    pub(crate) fn set_leader(&self, leader: Option<Node>) {
        *self.leader.write() = leader;
    }

    pub fn is_leader(&self) -> bool {
        self.character() == NodeCharacter::Leader
    }

    /// Whether the data sub-servers are up and routing can be answered.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn partition_table_handle(&self) -> Arc<RwLock<Option<SlotPartitionTable>>> {
        self.partition_table.clone()
    }

    /// Waits a bounded while for some leader to be known.
    pub(crate) async fn wait_leader(&self) {
        let deadline = Instant::now() + Duration::from_millis(self.config.write_operation_timeout_ms);
        while self.leader().is_none() && !self.is_leader() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// When this node wins an election it needs every member's identifier
    /// to police conflicts.
    pub fn on_election_wins(self: &Arc<Self>) {
        self.term.fetch_add(1, Ordering::SeqCst);
        self.set_character(NodeCharacter::Leader);
        self.set_leader(Some(self.this_node()));
        let mut map = self.id_node_map.write();
        if map.is_empty() {
            let this = self.this_node();
            map.insert(this.identifier, this);
        }
    }

    // ---- start-up status --------------------------------------------

    pub fn startup_status(&self) -> StartUpStatus {
        let seed_nodes = self
            .config
            .seed_node_urls
            .iter()
            .filter_map(|url| Node::parse_url(url))
            .collect();
        StartUpStatus {
            partition_interval: self.config.partition_interval,
            hash_salt: self.config.hash_salt,
            replication_num: self.config.replication_num,
            cluster_name: self.config.cluster_name.clone(),
            seed_nodes,
        }
    }

    // ---- identifier persistence -------------------------------------

    /// Loads the persisted identifier, generating and saving a fresh one
    /// the first time the node boots.
    fn load_identifier(&self) {
        let path = self.data_dir.join(NODE_IDENTIFIER_FILE_NAME);
        if let Ok(content) = std::fs::read_to_string(&path) {
            if let Ok(identifier) = content.trim().parse::<NodeIdentifier>() {
                info!("Recovered node identifier {}", identifier);
                self.set_node_identifier(identifier);
                return;
            }
            warn!("Cannot parse the identifier file, generating a new one");
        }
        self.set_node_identifier(self.gen_node_identifier());
    }

    /// Hash of host, meta port and the wall clock.
    pub(crate) fn gen_node_identifier(&self) -> NodeIdentifier {
        let node = self.this_node();
        let mut hash: u64 = 1125899906842597;
        for byte in node.host.as_bytes() {
            hash = hash.wrapping_mul(131).wrapping_add(*byte as u64);
        }
        hash = hash.wrapping_mul(131).wrapping_add(node.meta_port as u64);
        let now = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        hash = hash.wrapping_mul(131).wrapping_add(now);
        hash as NodeIdentifier
    }

    pub(crate) fn set_node_identifier(&self, identifier: NodeIdentifier) {
        info!("The identifier of this node has been set to {}", identifier);
        self.this_node.write().identifier = identifier;
        let path = self.data_dir.join(NODE_IDENTIFIER_FILE_NAME);
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Err(e) = std::fs::write(&path, identifier.to_string()) {
            error!("Cannot save the node identifier: {}", e);
        }
        // keep the seeded copy of this node in sync
        let this = self.this_node();
        let mut nodes = self.all_nodes.write();
        for node in nodes.iter_mut() {
            if node.same_endpoint(&this) {
                node.identifier = identifier;
            }
        }
    }

    // ---- partition table persistence --------------------------------

    /// Writes the serialised table to `partitions.tmp`, then renames it
    /// over `partitions`.
    pub(crate) fn save_partition_table(&self) {
        let bytes = match self.partition_table.read().as_ref() {
            Some(table) => table.serialize(),
            None => return,
        };
        let path = self.data_dir.join(PARTITION_FILE_NAME);
        let tmp = self.data_dir.join(format!("{}{}", PARTITION_FILE_NAME, TEMP_SUFFIX));
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let mut framed = (bytes.len() as u32).to_be_bytes().to_vec();
        framed.extend_from_slice(&bytes);
        let result = std::fs::write(&tmp, &framed).and_then(|_| std::fs::rename(&tmp, &path));
        match result {
            Ok(()) => info!("Partition table is saved"),
            Err(e) => error!("Cannot save the partition table: {}", e),
        }
    }

    /// Loads a persisted table if one survives; prefers `partitions` and
    /// falls back to renaming a leftover `partitions.tmp`.
    pub(crate) async fn load_partition_table(self: &Arc<Self>) -> MetaResult<()> {
        let path = self.data_dir.join(PARTITION_FILE_NAME);
        let tmp = self.data_dir.join(format!("{}{}", PARTITION_FILE_NAME, TEMP_SUFFIX));
        if !path.exists() {
            if !tmp.exists() {
                info!("No partition table file found");
                return Ok(());
            }
            std::fs::rename(&tmp, &path).context(IoSnafu { path: &path })?;
        }
        let framed = std::fs::read(&path).context(IoSnafu { path: &path })?;
        if framed.len() < 4 {
            warn!("Partition table file is truncated, ignoring it");
            return Ok(());
        }
        let len = u32::from_be_bytes(framed[..4].try_into().unwrap()) as usize;
        if framed.len() - 4 < len {
            warn!("Partition table file is truncated, ignoring it");
            return Ok(());
        }
        self.accept_partition_table(&framed[4..4 + len]).await
    }

    /// Installs a serialised table: the local node list, the id map and
    /// the data sub-servers all follow it. Heartbeat copies arrive
    /// repeatedly and install idempotently.
    pub(crate) async fn accept_partition_table(self: &Arc<Self>, bytes: &[u8]) -> MetaResult<()> {
        let table = SlotPartitionTable::deserialize(bytes)?;
        let nodes = table.all_nodes().to_vec();
        // consistent lock order: all_nodes, then id_node_map, then table
        {
            let mut all_nodes = self.all_nodes.write();
            let mut id_map = self.id_node_map.write();
            *all_nodes = nodes.clone();
            id_map.clear();
            for node in &nodes {
                id_map.insert(node.identifier, node.clone());
            }
            *self.partition_table.write() = Some(table.clone());
        }
        self.save_partition_table();
        info!("Received cluster nodes: {:?}", nodes);
        self.start_sub_servers(&table).await;
        Ok(())
    }

    /// Builds the data groups once a table exists.
    pub(crate) async fn start_sub_servers(self: &Arc<Self>, table: &SlotPartitionTable) {
        if let Err(e) = self.data_services.build_data_groups(table).await {
            error!("Cannot build data group members: {}", e);
            return;
        }
        self.ready.store(true, Ordering::SeqCst);
    }

    // ---- log application --------------------------------------------

    /// Applies committed meta-log entries in index order.
    pub(crate) async fn apply_entry(self: &Arc<Self>, entry: &LogEntry) {
        match &entry.payload {
            LogPayload::AddNode(node) => self.apply_add_node(node).await,
            LogPayload::RemoveNode(node) => self.apply_remove_node(node).await,
            LogPayload::Plan(plan) => {
                if let Err(e) = self.executor.process_non_query(plan).await {
                    error!("{}: cannot apply replicated plan: {}", self.name(), e);
                }
            }
        }
    }

    pub(crate) async fn apply_add_node(self: &Arc<Self>, new_node: &Node) {
        let result = {
            let mut nodes = self.all_nodes.write();
            if nodes.contains(new_node) {
                None
            } else {
                info!("Adding a new node {} into {:?}", new_node, *nodes);
                nodes.push(new_node.clone());
                self.id_node_map
                    .write()
                    .insert(new_node.identifier, new_node.clone());
                let mut table = self.partition_table.write();
                table.as_mut().map(|t| t.add_node(new_node.clone()))
            }
        };
        if let Some(result) = result {
            self.save_partition_table();
            self.data_services.add_node(new_node, &result).await;
        }
    }

    pub(crate) async fn apply_remove_node(self: &Arc<Self>, old_node: &Node) {
        let removal = {
            let mut nodes = self.all_nodes.write();
            match nodes.iter().position(|n| n == old_node) {
                None => None,
                Some(position) => {
                    info!("Removing node {} from {:?}", old_node, *nodes);
                    nodes.remove(position);
                    self.id_node_map.write().remove(&old_node.identifier);
                    let mut table = self.partition_table.write();
                    table.as_mut().map(|t| t.remove_node(old_node))
                }
            }
        };
        let Some(result) = removal else { return };
        self.data_services.remove_node(old_node, &result).await;

        let this_node = self.this_node();
        if self.leader().as_ref() == Some(old_node) {
            // the leader is gone; look for the next one right away
            self.set_character(NodeCharacter::Elector);
            self.set_leader(None);
        }
        if *old_node == this_node {
            // softer stop: peers still pull data from this node
            self.token.cancel();
            self.data_services.stop(true).await;
        } else if self.is_leader() {
            // the removed node cannot learn of its removal by heartbeat
            self.exile_node(old_node).await;
        }
        self.save_partition_table();
    }

    // ---- periodic report --------------------------------------------

    pub(crate) fn start_report_task(self: &Arc<Self>) {
        let member = self.clone();
        let interval = Duration::from_secs(self.config.node_report_interval_sec.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = member.token.cancelled() => break,
                    _ = ticker.tick() => {
                        info!("{}", member.gen_member_report().await);
                    }
                }
            }
        });
    }

    pub(crate) async fn gen_member_report(&self) -> String {
        let log_manager = self.log_manager.lock().await;
        format!(
            "MetaMemberReport: character={:?}, leader={:?}, term={}, lastLogIndex={}, commitIndex={}, nodes={}",
            self.character(),
            self.leader().map(|n| n.to_string()),
            self.term(),
            log_manager.last_log_index(),
            log_manager.commit_index(),
            self.all_nodes.read().len(),
        )
    }
}

#[cfg(test)]
pub(crate) mod test_util;

#[cfg(test)]
mod test;
