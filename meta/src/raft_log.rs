use models::plan::PhysicalPlan;
use models::Node;
use serde::{Deserialize, Serialize};

/// What a meta-group log entry carries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum LogPayload {
    AddNode(Node),
    RemoveNode(Node),
    /// A deferred user plan replicated through the meta group.
    Plan(PhysicalPlan),
}

/// A term-indexed record of the meta group's log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    pub term: u64,
    pub index: u64,
    pub payload: LogPayload,
}

/// In-memory log of the meta group.
///
/// Appends are serialised by the member's log lock; committed entries are
/// returned to the member in index order for application, so the same
/// sequence of Add/Remove operations produces bitwise identical partition
/// tables on every node.
#[derive(Default)]
pub struct MetaLogManager {
    entries: Vec<LogEntry>,
    commit_index: u64,
}

impl MetaLogManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_log_index(&self) -> u64 {
        self.entries.last().map(|e| e.index).unwrap_or(0)
    }

    pub fn last_log_term(&self) -> u64 {
        self.entries.last().map(|e| e.term).unwrap_or(0)
    }

    pub fn commit_index(&self) -> u64 {
        self.commit_index
    }

    /// Appends a new entry at the next index of `term`.
    pub fn append(&mut self, term: u64, payload: LogPayload) -> LogEntry {
        let entry = LogEntry {
            term,
            index: self.last_log_index() + 1,
            payload,
        };
        self.entries.push(entry.clone());
        entry
    }

    /// Accepts a replicated entry if it directly follows the local log.
    /// Re-sent entries already present are accepted idempotently.
    pub fn append_replicated(
        &mut self,
        prev_log_index: u64,
        prev_log_term: u64,
        entry: LogEntry,
    ) -> bool {
        if let Some(existing) = self.entries.iter().find(|e| e.index == entry.index) {
            return existing.term == entry.term;
        }
        if self.last_log_index() != prev_log_index {
            return false;
        }
        if prev_log_index != 0 && self.last_log_term() != prev_log_term {
            return false;
        }
        self.entries.push(entry);
        true
    }

    /// Advances the commit index and drains the newly committed entries,
    /// oldest first, for the caller to apply.
    pub fn commit_up_to(&mut self, index: u64) -> Vec<LogEntry> {
        let newly: Vec<LogEntry> = self
            .entries
            .iter()
            .filter(|e| e.index > self.commit_index && e.index <= index)
            .cloned()
            .collect();
        if index > self.commit_index {
            self.commit_index = index;
        }
        newly
    }
}
