use std::collections::HashMap;
use std::time::Duration;

use models::Node;
use parking_lot::Mutex;

use crate::partition::PartitionGroup;

/// Chooses which member of a replica group to talk to first.
pub trait NodeSelector: Send + Sync {
    /// The group's members, best candidate first.
    fn order(&self, group: &PartitionGroup) -> Vec<Node>;

    /// Feeds an observed round-trip back into the policy.
    fn record(&self, node: &Node, latency: Duration);
}

/// Orders members by a decaying average of observed latency; nodes never
/// measured sort first so they get probed.
#[derive(Default)]
pub struct LatencyOrderedSelector {
    stats: Mutex<HashMap<Node, u64>>,
}

impl NodeSelector for LatencyOrderedSelector {
    fn order(&self, group: &PartitionGroup) -> Vec<Node> {
        let stats = self.stats.lock();
        let mut nodes = group.nodes().to_vec();
        nodes.sort_by_key(|n| stats.get(n).copied().unwrap_or(0));
        nodes
    }

    fn record(&self, node: &Node, latency: Duration) {
        let sample = latency.as_micros() as u64;
        let mut stats = self.stats.lock();
        let avg = stats.entry(node.clone()).or_insert(sample);
        *avg = (*avg * 3 + sample) / 4;
    }
}
