pub mod router;
pub mod table;

use models::{Node, SlotId, TimePartitionId};

pub use router::PartitionRouter;
pub use table::{NodeAdditionResult, NodeRemovalResult, SlotPartitionTable};

/// Number of virtual buckets the hash space is divided into.
pub const SLOT_COUNT: u32 = 10_000;

/// An ordered list of the replicas owning a slot; the first node is the
/// group header, the group's identity in routing and logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionGroup {
    nodes: Vec<Node>,
}

impl PartitionGroup {
    pub fn new(nodes: Vec<Node>) -> Self {
        Self { nodes }
    }

    pub fn header(&self) -> &Node {
        &self.nodes[0]
    }

    pub fn contains(&self, node: &Node) -> bool {
        self.nodes.contains(node)
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl std::fmt::Display for PartitionGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "group[{}]", self.header())
    }
}

/// Maps a routing key to its slot. BKDR-style byte hashing keeps the
/// mapping identical on every platform and release; never a std hasher.
pub fn slot_for(storage_group: &str, partition: TimePartitionId, salt: u64) -> SlotId {
    let mut hash: u64 = salt;
    for byte in storage_group.as_bytes() {
        hash = hash.wrapping_mul(131).wrapping_add(*byte as u64);
    }
    hash = hash.wrapping_mul(131).wrapping_add(partition as u64);
    (hash % SLOT_COUNT as u64) as SlotId
}
