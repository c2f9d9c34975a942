//! Heartbeats and their side-channels.
//!
//! The leader's heartbeat may piggyback the serialised partition table
//! (for blind nodes) and may ask a follower for its identifier; the
//! follower's response may request the table or report the identifier.
//! Responses can arrive out of order; everything they carry installs
//! idempotently.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use models::{Node, NodeIdentifier};
use tracing::{debug, info, warn};

use super::{MetaGroupMember, NodeCharacter};
use crate::partition::SlotPartitionTable;
use crate::rpc::{
    AppendEntryRequest, AppendEntryResponse, HeartbeatRequest, HeartbeatResponse,
};

impl MetaGroupMember {
    /// Drives heartbeats while leader and watches for leader loss
    /// otherwise.
    pub(crate) fn start_heartbeat_task(self: &Arc<Self>) {
        let member = self.clone();
        let interval = Duration::from_millis(self.config.heartbeat_interval_ms.max(10));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = member.token.cancelled() => break,
                    _ = ticker.tick() => match member.character() {
                        NodeCharacter::Leader => member.send_heartbeats_once().await,
                        NodeCharacter::Follower => member.check_leader_expiry(),
                        _ => {}
                    },
                }
            }
        });
    }

    fn check_leader_expiry(self: &Arc<Self>) {
        let expired = self.last_heartbeat_received.lock().elapsed()
            > Duration::from_millis(self.config.heartbeat_expired_ms);
        if expired {
            warn!("{}: leader {:?} expired", self.name(), self.leader());
            self.set_leader(None);
            self.set_character(NodeCharacter::Elector);
        }
    }

    pub(crate) async fn send_heartbeats_once(self: &Arc<Self>) {
        let this = self.this_node();
        let (last_log_index, last_log_term) = {
            let log_manager = self.log_manager.lock().await;
            (log_manager.last_log_index(), log_manager.last_log_term())
        };
        for node in self.all_nodes() {
            if node.same_endpoint(&this) {
                continue;
            }
            let member = self.clone();
            let this = this.clone();
            tokio::spawn(async move {
                let request = member.build_heartbeat_request(&node, &this, last_log_index, last_log_term);
                let sent_table = request.partition_table.is_some();
                let client = member.provider.client(&node);
                let result = tokio::time::timeout(
                    Duration::from_millis(member.config.read_operation_timeout_ms),
                    client.heartbeat(request),
                )
                .await;
                match result {
                    Ok(Ok(resp)) => {
                        if sent_table {
                            member.blind_nodes.lock().remove(&node);
                        }
                        member.process_heartbeat_response(resp, &node).await;
                    }
                    Ok(Err(e)) => debug!("Cannot heartbeat {}: {}", node, e),
                    Err(_) => debug!("Heartbeat to {} timed out", node),
                }
            });
        }
    }

    fn build_heartbeat_request(
        &self,
        receiver: &Node,
        this: &Node,
        last_log_index: u64,
        last_log_term: u64,
    ) -> HeartbeatRequest {
        let know_identifier = self
            .id_node_map
            .read()
            .values()
            .any(|n| n.same_endpoint(receiver));
        let regenerate = self
            .id_conflict_nodes
            .lock()
            .iter()
            .any(|n| n.same_endpoint(receiver));
        let partition_table = if self.is_node_blind(receiver) {
            self.partition_table.read().as_ref().map(|t| t.serialize())
        } else {
            None
        };
        HeartbeatRequest {
            term: self.term(),
            leader: this.clone(),
            last_log_index,
            last_log_term,
            require_identifier: !know_identifier || regenerate,
            regenerate_identifier: regenerate,
            partition_table,
        }
    }

    /// Follower side of one heartbeat.
    pub async fn handle_heartbeat(self: &Arc<Self>, request: HeartbeatRequest) -> HeartbeatResponse {
        let current_term = self.term();
        if request.term < current_term {
            return HeartbeatResponse {
                term: current_term,
                follower_identifier: None,
                require_partition_table: false,
            };
        }
        self.term.store(request.term, Ordering::SeqCst);
        self.set_leader(Some(request.leader.clone()));
        if !request.leader.same_endpoint(&self.this_node()) {
            self.set_character(NodeCharacter::Follower);
        }
        *self.last_heartbeat_received.lock() = Instant::now();

        let mut response = HeartbeatResponse {
            term: self.term(),
            follower_identifier: None,
            require_partition_table: false,
        };
        if request.require_identifier {
            if request.regenerate_identifier {
                // the previously sent id conflicted
                self.set_node_identifier(self.gen_node_identifier());
            }
            let identifier = self.this_node().identifier;
            debug!("Send identifier {} to the leader", identifier);
            response.follower_identifier = Some(identifier);
        }
        if self.partition_table.read().is_none() {
            match &request.partition_table {
                Some(bytes) => {
                    if let Err(e) = self.accept_partition_table(bytes).await {
                        warn!("Cannot accept the piggybacked partition table: {}", e);
                    }
                }
                None => {
                    debug!("Request cluster nodes from the leader");
                    response.require_partition_table = true;
                }
            }
        }
        response
    }

    /// Leader side of one heartbeat response.
    pub(crate) async fn process_heartbeat_response(
        self: &Arc<Self>,
        response: HeartbeatResponse,
        receiver: &Node,
    ) {
        if let Some(identifier) = response.follower_identifier {
            self.register_node_identifier(receiver, identifier);
            if self.all_nodes_id_known() && self.partition_table.read().is_none() {
                let table = SlotPartitionTable::new(
                    self.all_nodes(),
                    self.config.hash_salt,
                    self.config.replication_num,
                );
                *self.partition_table.write() = Some(table.clone());
                info!("Partition table is set up");
                self.save_partition_table();
                self.start_sub_servers(&table).await;
            }
        }
        if response.require_partition_table {
            debug!("Node {} requires the node list", receiver);
            self.blind_nodes.lock().insert(receiver.clone());
        }
    }

    pub fn is_node_blind(&self, node: &Node) -> bool {
        self.blind_nodes.lock().iter().any(|n| n.same_endpoint(node))
    }

    /// Registers a follower's identifier unless it collides with another
    /// node, in which case the follower is told to regenerate on the next
    /// heartbeat.
    pub(crate) fn register_node_identifier(&self, node: &Node, identifier: NodeIdentifier) {
        // consistent lock order: all_nodes, then id_node_map
        let mut all_nodes = self.all_nodes.write();
        let mut id_map = self.id_node_map.write();
        if let Some(conflicting) = id_map.get(&identifier) {
            if !conflicting.same_endpoint(node) {
                info!("{}'s identifier {} conflicts with {}", node, identifier, conflicting);
                self.id_conflict_nodes.lock().insert(node.clone());
                return;
            }
        }
        self.id_conflict_nodes.lock().retain(|n| !n.same_endpoint(node));
        let mut registered = node.clone();
        registered.identifier = identifier;
        id_map.insert(identifier, registered);
        for known in all_nodes.iter_mut() {
            if known.same_endpoint(node) {
                known.identifier = identifier;
            }
        }
    }

    fn all_nodes_id_known(&self) -> bool {
        let nodes = self.all_nodes();
        let id_map = self.id_node_map.read();
        nodes
            .iter()
            .all(|node| id_map.values().any(|n| n.same_endpoint(node)))
    }

    /// Follower side of log replication: entries append in index order
    /// and apply as soon as they are accepted.
    pub async fn handle_append_entry(self: &Arc<Self>, request: AppendEntryRequest) -> AppendEntryResponse {
        let current_term = self.term();
        if request.term < current_term {
            return AppendEntryResponse {
                term: current_term,
                accepted: false,
            };
        }
        self.term.store(request.term, Ordering::SeqCst);
        *self.last_heartbeat_received.lock() = Instant::now();

        let accepted;
        let committed;
        {
            let mut log_manager = self.log_manager.lock().await;
            accepted = log_manager.append_replicated(
                request.prev_log_index,
                request.prev_log_term,
                request.entry.clone(),
            );
            committed = if accepted {
                log_manager.commit_up_to(request.entry.index)
            } else {
                vec![]
            };
        }
        for entry in &committed {
            self.apply_entry(entry).await;
        }
        AppendEntryResponse {
            term: self.term(),
            accepted,
        }
    }
}
