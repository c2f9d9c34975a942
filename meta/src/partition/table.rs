use std::collections::BTreeMap;

use models::{Node, NodeIdentifier, SlotId, TimePartitionId};

use super::{slot_for, PartitionGroup, SLOT_COUNT};
use crate::error::{ClusterTooSmallSnafu, CorruptTableSnafu, MetaResult};

const SERIAL_VERSION: u32 = 1;

/// Slots that changed hands when a node joined, so data-plane code can
/// pull them from their previous owners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAdditionResult {
    pub lost_slots: Vec<(SlotId, Node)>,
}

/// Slots redistributed away from a removed node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRemovalResult {
    pub redistributed: Vec<(SlotId, Node)>,
}

/// Deterministic assignment of the virtual slots to the node ring.
///
/// The ring is total-ordered by identifier ascending; a routing key hashes
/// to a slot, and the slot's owner plus its `R - 1` ring successors form
/// the key's replica group. The same (node list, salt, replication)
/// produce the same table on every member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotPartitionTable {
    /// Ring order: identifier ascending.
    nodes: Vec<Node>,
    /// Owner identifier of each slot.
    slot_owners: Vec<NodeIdentifier>,
    salt: u64,
    replication: u32,
}

impl SlotPartitionTable {
    pub fn new(mut nodes: Vec<Node>, salt: u64, replication: u32) -> Self {
        nodes.sort_by_key(|n| n.identifier);
        let node_count = nodes.len();
        let slot_owners = (0..SLOT_COUNT as usize)
            .map(|slot| nodes[slot * node_count / SLOT_COUNT as usize].identifier)
            .collect();
        Self {
            nodes,
            slot_owners,
            salt,
            replication,
        }
    }

    pub fn all_nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn salt(&self) -> u64 {
        self.salt
    }

    pub fn replication(&self) -> u32 {
        self.replication
    }

    /// The replica group of (storage group, time partition).
    pub fn route(&self, storage_group: &str, partition: TimePartitionId) -> MetaResult<PartitionGroup> {
        let slot = slot_for(storage_group, partition, self.salt);
        self.group_for_slot(slot)
    }

    pub fn group_for_slot(&self, slot: SlotId) -> MetaResult<PartitionGroup> {
        if self.nodes.len() < self.replication as usize {
            return ClusterTooSmallSnafu.fail();
        }
        let owner = self.slot_owners[slot as usize];
        let position = self
            .nodes
            .iter()
            .position(|n| n.identifier == owner)
            .unwrap_or(0);
        Ok(self.group_at(position))
    }

    /// The group headed by `header`.
    pub fn header_group(&self, header: &Node) -> MetaResult<PartitionGroup> {
        if self.nodes.len() < self.replication as usize {
            return ClusterTooSmallSnafu.fail();
        }
        let position = self
            .nodes
            .iter()
            .position(|n| n == header)
            .unwrap_or(0);
        Ok(self.group_at(position))
    }

    /// Every replica group of the ring, one headed by each node.
    pub fn all_groups(&self) -> MetaResult<Vec<PartitionGroup>> {
        if self.nodes.len() < self.replication as usize {
            return ClusterTooSmallSnafu.fail();
        }
        Ok((0..self.nodes.len()).map(|i| self.group_at(i)).collect())
    }

    fn group_at(&self, position: usize) -> PartitionGroup {
        let replicas = (0..self.replication as usize)
            .map(|k| self.nodes[(position + k) % self.nodes.len()].clone())
            .collect();
        PartitionGroup::new(replicas)
    }

    /// Admits `node` into the ring, handing it `SLOT_COUNT / N` slots.
    /// The move rule is deterministic so every replica derives the same
    /// table: repeatedly take the lowest-numbered slot from the owner
    /// currently holding the most (ties to the smallest identifier).
    pub fn add_node(&mut self, node: Node) -> NodeAdditionResult {
        if self.nodes.iter().any(|n| n.identifier == node.identifier) {
            return NodeAdditionResult { lost_slots: vec![] };
        }
        self.nodes.push(node.clone());
        self.nodes.sort_by_key(|n| n.identifier);

        let take = SLOT_COUNT as usize / self.nodes.len();
        let mut owned = self.slots_by_owner();
        let mut lost_slots = Vec::with_capacity(take);
        for _ in 0..take {
            let Some((&richest, _)) = owned
                .iter()
                .filter(|(id, slots)| **id != node.identifier && !slots.is_empty())
                .max_by_key(|(id, slots)| (slots.len(), std::cmp::Reverse(**id)))
            else {
                break;
            };
            let slot = owned.get_mut(&richest).and_then(|s| s.pop());
            if let Some(slot) = slot {
                self.slot_owners[slot as usize] = node.identifier;
                lost_slots.push((slot, self.node_by_id(richest).clone()));
            }
        }
        NodeAdditionResult { lost_slots }
    }

    /// Removes `node`, redistributing its slots: each goes to the
    /// remaining owner holding the fewest (ties to the smallest
    /// identifier).
    pub fn remove_node(&mut self, node: &Node) -> NodeRemovalResult {
        let Some(position) = self.nodes.iter().position(|n| n.identifier == node.identifier)
        else {
            return NodeRemovalResult {
                redistributed: vec![],
            };
        };
        self.nodes.remove(position);

        let orphans: Vec<SlotId> = (0..SLOT_COUNT)
            .filter(|&slot| self.slot_owners[slot as usize] == node.identifier)
            .collect();
        let mut owned = self.slots_by_owner();
        owned.remove(&node.identifier);
        let mut redistributed = Vec::with_capacity(orphans.len());
        for slot in orphans {
            let Some((&poorest, _)) = owned
                .iter()
                .min_by_key(|(id, slots)| (slots.len(), **id))
            else {
                break;
            };
            self.slot_owners[slot as usize] = poorest;
            owned.entry(poorest).or_default().push(slot);
            redistributed.push((slot, self.node_by_id(poorest).clone()));
        }
        NodeRemovalResult { redistributed }
    }

    /// Current owners' slot lists; each list ends up sorted descending so
    /// `pop` hands out the lowest-numbered slot first.
    fn slots_by_owner(&self) -> BTreeMap<NodeIdentifier, Vec<SlotId>> {
        let mut owned: BTreeMap<NodeIdentifier, Vec<SlotId>> = BTreeMap::new();
        for n in &self.nodes {
            owned.entry(n.identifier).or_default();
        }
        for slot in (0..SLOT_COUNT).rev() {
            owned
                .entry(self.slot_owners[slot as usize])
                .or_default()
                .push(slot);
        }
        owned
    }

    fn node_by_id(&self, identifier: NodeIdentifier) -> &Node {
        self.nodes
            .iter()
            .find(|n| n.identifier == identifier)
            .unwrap_or(&self.nodes[0])
    }

    /// Wire form: version, salt, replication, node list, then the
    /// slot-to-owner-index array; everything big-endian.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64 + SLOT_COUNT as usize * 4);
        buf.extend_from_slice(&SERIAL_VERSION.to_be_bytes());
        buf.extend_from_slice(&self.salt.to_be_bytes());
        buf.extend_from_slice(&self.replication.to_be_bytes());
        buf.extend_from_slice(&(self.nodes.len() as u32).to_be_bytes());
        for node in &self.nodes {
            buf.extend_from_slice(&node.identifier.to_be_bytes());
            buf.extend_from_slice(&(node.host.len() as u32).to_be_bytes());
            buf.extend_from_slice(node.host.as_bytes());
            buf.extend_from_slice(&(node.meta_port as u32).to_be_bytes());
            buf.extend_from_slice(&(node.data_port as u32).to_be_bytes());
            buf.extend_from_slice(&(node.client_port as u32).to_be_bytes());
        }
        for owner in &self.slot_owners {
            let index = self
                .nodes
                .iter()
                .position(|n| n.identifier == *owner)
                .unwrap_or(0) as u32;
            buf.extend_from_slice(&index.to_be_bytes());
        }
        buf
    }

    pub fn deserialize(buf: &[u8]) -> MetaResult<Self> {
        let mut cursor = Cursor::new(buf);
        let version = cursor.read_u32()?;
        if version != SERIAL_VERSION {
            return CorruptTableSnafu {
                reason: format!("unknown version {}", version),
            }
            .fail();
        }
        let salt = cursor.read_u64()?;
        let replication = cursor.read_u32()?;
        let node_count = cursor.read_u32()? as usize;
        let mut nodes = Vec::with_capacity(node_count);
        for _ in 0..node_count {
            let identifier = cursor.read_u32()? as i32;
            let host_len = cursor.read_u32()? as usize;
            let host = cursor.read_string(host_len)?;
            let meta_port = cursor.read_u32()? as u16;
            let data_port = cursor.read_u32()? as u16;
            let client_port = cursor.read_u32()? as u16;
            let mut node = Node::new(host, meta_port, data_port, client_port);
            node.identifier = identifier;
            nodes.push(node);
        }
        let mut slot_owners = Vec::with_capacity(SLOT_COUNT as usize);
        for _ in 0..SLOT_COUNT {
            let index = cursor.read_u32()? as usize;
            let owner = nodes.get(index).ok_or_else(|| {
                CorruptTableSnafu {
                    reason: format!("owner index {} out of range", index),
                }
                .build()
            })?;
            slot_owners.push(owner.identifier);
        }
        Ok(Self {
            nodes,
            slot_owners,
            salt,
            replication,
        })
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, len: usize) -> MetaResult<&'a [u8]> {
        if self.buf.len() - self.pos < len {
            return CorruptTableSnafu {
                reason: format!("truncated at offset {}", self.pos),
            }
            .fail();
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn read_u32(&mut self) -> MetaResult<u32> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn read_u64(&mut self) -> MetaResult<u64> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn read_string(&mut self, len: usize) -> MetaResult<String> {
        Ok(String::from_utf8_lossy(self.take(len)?).into_owned())
    }
}
