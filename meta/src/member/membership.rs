//! Cluster membership: start-up checks, build/join, the add/remove-node
//! protocols and the broadcast-to-all-groups quorum.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use models::Node;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::Notify;
use tracing::{info, warn};

use super::{MetaGroupMember, NodeCharacter};
use crate::error::{
    AddSelfSnafu, ConfigInconsistentSnafu, MetaError, MetaResult, StartUpCheckFailureSnafu,
};
use crate::raft_log::LogPayload;
use crate::rpc::{
    AddNodeRequest, AddNodeResponse, AppendEntryRequest, CheckStatusResponse, ResponseCode,
    StartUpStatus,
};

pub const DEFAULT_JOIN_RETRY: usize = 10;
/// Global deadline of the seed start-up check.
pub const START_UP_TIME_THRESHOLD_MS: u64 = 300_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AppendLogResult {
    Ok,
    Timeout,
    LeadershipStale,
}

impl MetaGroupMember {
    pub(crate) fn thread_task_init(self: &Arc<Self>) {
        self.start_heartbeat_task();
        self.start_report_task();
    }

    /// This node is a seed and establishes the initial cluster with the
    /// other seeds.
    pub async fn build_cluster(self: &Arc<Self>) -> MetaResult<()> {
        self.check_seed_nodes_status().await?;
        self.load_partition_table().await?;
        self.thread_task_init();
        if self.all_nodes.read().len() == 1 {
            // a single-member cluster gets no heartbeats to build state
            // from, so the table and leadership are synthesised here
            if self.partition_table.read().is_none() {
                let table = crate::partition::SlotPartitionTable::new(
                    self.all_nodes(),
                    self.config.hash_salt,
                    self.config.replication_num,
                );
                *self.partition_table.write() = Some(table);
                info!("Partition table is set up");
            }
            let this = self.this_node();
            self.id_node_map.write().insert(this.identifier, this);
            self.save_partition_table();
            let table = self.partition_table.read().clone();
            if let Some(table) = table {
                self.start_sub_servers(&table).await;
            }
            self.on_election_wins();
        }
        Ok(())
    }

    /// This node is not a seed; pick one at random and ask to join.
    pub async fn join_cluster(self: &Arc<Self>) -> MetaResult<()> {
        if self.all_nodes.read().len() == 1 {
            return ConfigInconsistentSnafu {
                detail: "seed nodes not provided, cannot join cluster",
            }
            .fail();
        }

        let mut retry = DEFAULT_JOIN_RETRY;
        while retry > 0 {
            let seed = {
                let nodes = self.all_nodes.read();
                let this = self.this_node();
                let others: Vec<Node> = nodes
                    .iter()
                    .filter(|n| !n.same_endpoint(&this))
                    .cloned()
                    .collect();
                others[rand::thread_rng().gen_range(0..others.len())].clone()
            };
            info!("start joining the cluster with the help of {}", seed);
            match self.try_join(&seed).await {
                Ok(true) => {
                    info!("Joined a cluster, starting the heartbeat thread");
                    self.set_character(NodeCharacter::Follower);
                    *self.last_heartbeat_received.lock() = Instant::now();
                    self.thread_task_init();
                    return Ok(());
                }
                Ok(false) => {
                    tokio::time::sleep(Duration::from_millis(self.config.join_retry_interval_ms))
                        .await;
                }
                Err(e @ MetaError::ConfigInconsistent { .. }) => return Err(e),
                Err(e) => warn!("Cannot join the cluster from {}, because: {}", seed, e),
            }
            retry -= 1;
        }
        warn!("Cannot join the cluster after {} retries", DEFAULT_JOIN_RETRY);
        StartUpCheckFailureSnafu.fail()
    }

    async fn try_join(self: &Arc<Self>, seed: &Node) -> MetaResult<bool> {
        let request = AddNodeRequest {
            node: self.this_node(),
            status: self.startup_status(),
        };
        let client = self.provider.client(seed);
        let resp = match tokio::time::timeout(
            Duration::from_millis(self.config.write_operation_timeout_ms),
            client.add_node(request),
        )
        .await
        {
            Err(_) => {
                warn!("Join cluster request to {} timed out", seed);
                return Ok(false);
            }
            Ok(Err(e)) => {
                warn!("Join cluster request to {} failed: {}", seed, e);
                return Ok(false);
            }
            Ok(Ok(resp)) => resp,
        };
        match resp.code {
            ResponseCode::Agree => {
                info!("Node {} admitted this node into the cluster", seed);
                let table = resp.partition_table.unwrap_or_default();
                self.accept_partition_table(&table).await?;
                self.data_services.pull_snapshots().await;
                Ok(true)
            }
            ResponseCode::IdentifierConflict => {
                info!(
                    "The identifier {} conflicts the existing ones, regenerate a new one",
                    self.this_node().identifier
                );
                self.set_node_identifier(self.gen_node_identifier());
                Ok(false)
            }
            ResponseCode::NewNodeParameterConflict => {
                let detail = resp
                    .check_status
                    .map(|c| c.conflict_detail())
                    .unwrap_or_default();
                ConfigInconsistentSnafu { detail }.fail()
            }
            ResponseCode::PartitionTableUnavailable => {
                info!("The cluster has no partition table yet, waiting");
                Ok(false)
            }
            code => {
                warn!("Joining the cluster is rejected by {} for response {:?}", seed, code);
                Ok(false)
            }
        }
    }

    // ---- seed start-up check ----------------------------------------

    /// Pairwise start-up status check against every other seed, with
    /// exponentially backed-off retries until a quorum agrees or the
    /// global deadline passes.
    pub(crate) async fn check_seed_nodes_status(self: &Arc<Self>) -> MetaResult<()> {
        let node_count = self.all_nodes.read().len();
        if node_count == 1 {
            return Ok(());
        }
        let started = Instant::now();
        let mut backoff = Duration::from_millis(1_000);
        loop {
            let (consistent, inconsistent) = self.check_seed_nodes_status_once().await;
            let quorum = node_count / 2 + 1;
            if consistent >= quorum {
                return Ok(());
            }
            if inconsistent >= quorum {
                return ConfigInconsistentSnafu {
                    detail: format!("{} seed nodes report conflicting parameters", inconsistent),
                }
                .fail();
            }
            if started.elapsed() > Duration::from_millis(START_UP_TIME_THRESHOLD_MS) {
                return StartUpCheckFailureSnafu.fail();
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(Duration::from_secs(30));
        }
    }

    /// One round of status checks; this node counts as one agreement.
    async fn check_seed_nodes_status_once(self: &Arc<Self>) -> (usize, usize) {
        let this = self.this_node();
        let others: Vec<Node> = self
            .all_nodes()
            .into_iter()
            .filter(|n| !n.same_endpoint(&this))
            .collect();
        let mut handles = Vec::with_capacity(others.len());
        for seed in others {
            let member = self.clone();
            handles.push(tokio::spawn(async move {
                let client = member.provider.client(&seed);
                let result = tokio::time::timeout(
                    Duration::from_millis(member.config.read_operation_timeout_ms),
                    client.check_status(member.startup_status()),
                )
                .await;
                match result {
                    Ok(Ok(resp)) => Some(resp.consistent()),
                    _ => {
                        warn!(
                            "Start up exception. Cannot connect to node {}. Try again in next turn.",
                            seed
                        );
                        None
                    }
                }
            }));
        }
        let mut consistent = 1;
        let mut inconsistent = 0;
        for handle in handles {
            match handle.await {
                Ok(Some(true)) => consistent += 1,
                Ok(Some(false)) => inconsistent += 1,
                _ => {}
            }
        }
        (consistent, inconsistent)
    }

    /// Answers a seed's start-up status check.
    pub fn handle_check_status(&self, remote: StartUpStatus) -> CheckStatusResponse {
        self.compare_status(&remote)
    }

    fn compare_status(&self, remote: &StartUpStatus) -> CheckStatusResponse {
        let local = self.startup_status();
        let seed_node_equals = remote.seed_nodes.iter().all(|remote_seed| {
            self.all_nodes
                .read()
                .iter()
                .any(|n| n.same_endpoint(remote_seed))
        });
        CheckStatusResponse {
            partition_interval_equals: local.partition_interval == remote.partition_interval,
            hash_salt_equals: local.hash_salt == remote.hash_salt,
            replication_num_equals: local.replication_num == remote.replication_num,
            seed_node_equals,
            cluster_name_equals: local.cluster_name == remote.cluster_name,
        }
    }

    // ---- add-node protocol (leader side) ----------------------------

    pub async fn handle_add_node(
        self: &Arc<Self>,
        request: AddNodeRequest,
    ) -> MetaResult<AddNodeResponse> {
        if self.partition_table.read().is_none() {
            info!("Cannot add node now because the partition table is not set");
            return Ok(AddNodeResponse::code(ResponseCode::PartitionTableUnavailable));
        }
        if request.node.same_endpoint(&self.this_node()) {
            return AddSelfSnafu.fail();
        }
        info!("A node {} wants to join this cluster", request.node);

        self.wait_leader().await;
        if !self.is_leader() {
            // forward to the leader when one is known
            if let Some(leader) = self.leader() {
                let client = self.provider.client(&leader);
                return client.add_node(request).await;
            }
            return Ok(AddNodeResponse::code(ResponseCode::Null));
        }
        self.process_add_node_locally(request).await
    }

    async fn process_add_node_locally(
        self: &Arc<Self>,
        request: AddNodeRequest,
    ) -> MetaResult<AddNodeResponse> {
        let node = request.node.clone();
        if self.all_nodes.read().contains(&node) {
            info!("Node {} is already in the cluster", node);
            return Ok(self.agree_response());
        }
        {
            let id_map = self.id_node_map.read();
            if let Some(conflicting) = id_map.get(&node.identifier) {
                if !conflicting.same_endpoint(&node) {
                    info!("{}'s id conflicts with {}", node, conflicting);
                    return Ok(AddNodeResponse::code(ResponseCode::IdentifierConflict));
                }
            }
        }
        let check = self.compare_status(&request.status);
        if !check.consistent() {
            return Ok(AddNodeResponse {
                code: ResponseCode::NewNodeParameterConflict,
                partition_table: None,
                check_status: Some(check),
            });
        }

        // node adding is serialised under the log lock
        let mut log_manager = self.log_manager.lock().await;
        let prev_log_index = log_manager.last_log_index();
        let prev_log_term = log_manager.last_log_term();
        let entry = log_manager.append(self.term(), LogPayload::AddNode(node.clone()));
        let request = AppendEntryRequest {
            term: self.term(),
            prev_log_index,
            prev_log_term,
            entry: entry.clone(),
        };

        let mut retry_time = 1;
        loop {
            info!(
                "Send the join request of {} to other nodes, retry time: {}",
                node, retry_time
            );
            match self.send_log_to_all_groups(request.clone()).await {
                AppendLogResult::Ok => {
                    info!("Join request of {} is accepted", node);
                    for committed in log_manager.commit_up_to(entry.index) {
                        self.apply_entry(&committed).await;
                    }
                    return Ok(self.agree_response());
                }
                AppendLogResult::Timeout => {
                    info!("Join request of {} timed out", node);
                    retry_time += 1;
                    if self.token.is_cancelled() {
                        return Ok(AddNodeResponse::code(ResponseCode::Null));
                    }
                }
                AppendLogResult::LeadershipStale => {
                    return Ok(AddNodeResponse::code(ResponseCode::Null));
                }
            }
        }
    }

    fn agree_response(&self) -> AddNodeResponse {
        AddNodeResponse {
            code: ResponseCode::Agree,
            partition_table: self.partition_table.read().as_ref().map(|t| t.serialize()),
            check_status: None,
        }
    }

    // ---- remove-node protocol ---------------------------------------

    pub async fn handle_remove_node(self: &Arc<Self>, node: Node) -> MetaResult<ResponseCode> {
        if self.partition_table.read().is_none() {
            return Err(MetaError::PartitionTableUnavailable);
        }
        self.wait_leader().await;
        if !self.is_leader() {
            if let Some(leader) = self.leader() {
                return self.provider.client(&leader).remove_node(node).await;
            }
            return Ok(ResponseCode::Null);
        }

        if self.all_nodes.read().len() <= self.config.replication_num as usize {
            return Ok(ResponseCode::ClusterTooSmall);
        }
        let target = {
            let nodes = self.all_nodes.read();
            nodes.iter().find(|n| n.same_endpoint(&node)).cloned()
        };
        let Some(target) = target else {
            info!("Node {} is not in the cluster", node);
            return Ok(ResponseCode::Reject);
        };

        let mut log_manager = self.log_manager.lock().await;
        let prev_log_index = log_manager.last_log_index();
        let prev_log_term = log_manager.last_log_term();
        let entry = log_manager.append(self.term(), LogPayload::RemoveNode(target.clone()));
        let request = AppendEntryRequest {
            term: self.term(),
            prev_log_index,
            prev_log_term,
            entry: entry.clone(),
        };

        let mut retry_time = 1;
        loop {
            info!(
                "Send the node removal request of {} to other nodes, retry time: {}",
                target, retry_time
            );
            match self.send_log_to_all_groups(request.clone()).await {
                AppendLogResult::Ok => {
                    info!("Removal request of {} is accepted", target);
                    for committed in log_manager.commit_up_to(entry.index) {
                        self.apply_entry(&committed).await;
                    }
                    return Ok(ResponseCode::Agree);
                }
                AppendLogResult::Timeout => {
                    info!("Removal request of {} timed out", target);
                    retry_time += 1;
                    if self.token.is_cancelled() {
                        return Ok(ResponseCode::Null);
                    }
                }
                AppendLogResult::LeadershipStale => return Ok(ResponseCode::Null),
            }
        }
    }

    pub(crate) async fn exile_node(&self, node: &Node) {
        if let Err(e) = self.provider.client(node).exile().await {
            warn!("Cannot inform {} its removal: {}", node, e);
        }
    }

    /// The leader tells this node it was removed from the cluster.
    pub async fn handle_exile(self: &Arc<Self>) {
        let this = self.this_node();
        self.apply_remove_node(&this).await;
    }

    // ---- broadcast to all groups ------------------------------------

    /// Sends one log entry to every node of the ring and succeeds only
    /// when each replica group reaches its quorum. Each node stands for
    /// the `R` overlapping groups it is a member of, so a length-N
    /// remaining-votes array is kept, one slot per group.
    pub(crate) async fn send_log_to_all_groups(
        self: &Arc<Self>,
        request: AppendEntryRequest,
    ) -> AppendLogResult {
        let (nodes, replication) = {
            let table = self.partition_table.read();
            let Some(table) = table.as_ref() else {
                return AppendLogResult::Timeout;
            };
            (table.all_nodes().to_vec(), table.replication() as usize)
        };
        let node_count = nodes.len();
        let quorum = (replication / 2 + 1) as i32;
        let group_remainings = Arc::new(Mutex::new(vec![quorum; node_count]));
        let notify = Arc::new(Notify::new());
        let leadership_stale = Arc::new(AtomicBool::new(false));
        let new_leader_term = Arc::new(AtomicU64::new(request.term));

        let this = self.this_node();
        for (position, node) in nodes.iter().enumerate() {
            if node.same_endpoint(&this) {
                // the local node agrees by construction
                decrease_groups(&mut group_remainings.lock(), position, replication, node_count);
                continue;
            }
            let member = self.clone();
            let node = node.clone();
            let request = request.clone();
            let group_remainings = group_remainings.clone();
            let notify = notify.clone();
            let leadership_stale = leadership_stale.clone();
            let new_leader_term = new_leader_term.clone();
            tokio::spawn(async move {
                let client = member.provider.client(&node);
                let result = tokio::time::timeout(
                    Duration::from_millis(member.config.write_operation_timeout_ms),
                    client.append_entry(request.clone()),
                )
                .await;
                match result {
                    Ok(Ok(resp)) => {
                        if resp.term > request.term {
                            new_leader_term.fetch_max(resp.term, Ordering::SeqCst);
                            leadership_stale.store(true, Ordering::SeqCst);
                        } else if resp.accepted {
                            decrease_groups(
                                &mut group_remainings.lock(),
                                position,
                                replication,
                                node_count,
                            );
                        }
                        notify.notify_waiters();
                    }
                    Ok(Err(e)) => warn!("Cannot send log to node {}: {}", node, e),
                    Err(_) => warn!("Sending log to node {} timed out", node),
                }
            });
        }

        let deadline =
            Instant::now() + Duration::from_millis(self.config.write_operation_timeout_ms);
        loop {
            if leadership_stale.load(Ordering::SeqCst) {
                // a higher term answered; this leadership is over
                self.term
                    .fetch_max(new_leader_term.load(Ordering::SeqCst), Ordering::SeqCst);
                return AppendLogResult::LeadershipStale;
            }
            if group_remainings.lock().iter().all(|r| *r <= 0) {
                return AppendLogResult::Ok;
            }
            let now = Instant::now();
            if now >= deadline {
                return AppendLogResult::Timeout;
            }
            let wait = (deadline - now).min(Duration::from_millis(20));
            let _ = tokio::time::timeout(wait, notify.notified()).await;
        }
    }
}

impl MetaGroupMember {
    /// Replicates one entry within the meta group itself: one majority
    /// over the node ring, not per-group quorums.
    pub(crate) async fn send_log_to_meta_group(
        self: &Arc<Self>,
        request: AppendEntryRequest,
    ) -> AppendLogResult {
        let nodes = self.all_nodes();
        let quorum = (nodes.len() / 2 + 1) as i32;
        // this node accepts its own entry
        let remaining = Arc::new(Mutex::new(quorum - 1));
        let notify = Arc::new(Notify::new());
        let leadership_stale = Arc::new(AtomicBool::new(false));
        let new_leader_term = Arc::new(AtomicU64::new(request.term));

        let this = self.this_node();
        for node in nodes {
            if node.same_endpoint(&this) {
                continue;
            }
            let member = self.clone();
            let request = request.clone();
            let remaining = remaining.clone();
            let notify = notify.clone();
            let leadership_stale = leadership_stale.clone();
            let new_leader_term = new_leader_term.clone();
            tokio::spawn(async move {
                let client = member.provider.client(&node);
                let result = tokio::time::timeout(
                    Duration::from_millis(member.config.write_operation_timeout_ms),
                    client.append_entry(request.clone()),
                )
                .await;
                match result {
                    Ok(Ok(resp)) => {
                        if resp.term > request.term {
                            new_leader_term.fetch_max(resp.term, Ordering::SeqCst);
                            leadership_stale.store(true, Ordering::SeqCst);
                        } else if resp.accepted {
                            *remaining.lock() -= 1;
                        }
                        notify.notify_waiters();
                    }
                    Ok(Err(e)) => warn!("Cannot send log to node {}: {}", node, e),
                    Err(_) => warn!("Sending log to node {} timed out", node),
                }
            });
        }

        let deadline =
            Instant::now() + Duration::from_millis(self.config.write_operation_timeout_ms);
        loop {
            if leadership_stale.load(Ordering::SeqCst) {
                self.term
                    .fetch_max(new_leader_term.load(Ordering::SeqCst), Ordering::SeqCst);
                return AppendLogResult::LeadershipStale;
            }
            if *remaining.lock() <= 0 {
                return AppendLogResult::Ok;
            }
            let now = Instant::now();
            if now >= deadline {
                return AppendLogResult::Timeout;
            }
            // notify_waiters carries no permit; cap the wait so a wake-up
            // racing the check above cannot stall the whole deadline
            let wait = (deadline - now).min(Duration::from_millis(20));
            let _ = tokio::time::timeout(wait, notify.notified()).await;
        }
    }
}

/// An accepting node at ring position `position` is a member of the `r`
/// groups headed by positions `position`, `position - 1`, ...; each of those
/// counters comes down by one.
fn decrease_groups(remainings: &mut [i32], position: usize, r: usize, node_count: usize) {
    for j in 0..r {
        let group_index = (position as i64 - j as i64).rem_euclid(node_count as i64) as usize;
        remainings[group_index] -= 1;
    }
}
