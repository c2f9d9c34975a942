use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::list::TsFileResourceList;
use super::resource::TsFileResource;
use crate::TimePartition;

/// Per-partition sequence and unsequence lists of one storage group.
#[derive(Default)]
pub struct PartitionLists {
    sequence: HashMap<TimePartition, TsFileResourceList>,
    unsequence: HashMap<TimePartition, TsFileResourceList>,
}

impl PartitionLists {
    pub fn list(&self, partition: TimePartition, sequence: bool) -> Option<&TsFileResourceList> {
        self.space(sequence).get(&partition)
    }

    pub fn list_mut(
        &mut self,
        partition: TimePartition,
        sequence: bool,
    ) -> &mut TsFileResourceList {
        self.space_mut(sequence).entry(partition).or_default()
    }

    fn space(&self, sequence: bool) -> &HashMap<TimePartition, TsFileResourceList> {
        if sequence {
            &self.sequence
        } else {
            &self.unsequence
        }
    }

    fn space_mut(&mut self, sequence: bool) -> &mut HashMap<TimePartition, TsFileResourceList> {
        if sequence {
            &mut self.sequence
        } else {
            &mut self.unsequence
        }
    }

    /// Looks a resource up by path across both spaces of every partition.
    pub fn find_by_path(&self, path: &Path) -> Option<Arc<TsFileResource>> {
        self.sequence
            .values()
            .chain(self.unsequence.values())
            .find_map(|list| list.find_by_path(path))
    }

    /// The partition whose list holds the file at `path`, if any.
    pub fn partition_containing(&self, path: &Path, sequence: bool) -> Option<TimePartition> {
        self.space(sequence)
            .iter()
            .find(|(_, list)| list.find_by_path(path).is_some())
            .map(|(partition, _)| *partition)
    }
}

/// Owner of one storage group's file lists, guarded by a read-write lock:
/// data writers and selectors hold the shared side, compaction commits and
/// flushes hold the exclusive side.
pub struct TsFileManager {
    storage_group: String,
    sg_dir: PathBuf,
    lists: RwLock<PartitionLists>,
}

impl TsFileManager {
    pub fn new(storage_group: impl Into<String>, sg_dir: impl AsRef<Path>) -> Self {
        Self {
            storage_group: storage_group.into(),
            sg_dir: sg_dir.as_ref().to_path_buf(),
            lists: RwLock::new(PartitionLists::default()),
        }
    }

    pub fn storage_group(&self) -> &str {
        &self.storage_group
    }

    pub fn sg_dir(&self) -> &Path {
        &self.sg_dir
    }

    pub fn read(&self) -> RwLockReadGuard<'_, PartitionLists> {
        self.lists.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, PartitionLists> {
        self.lists.write()
    }

    /// Registers a freshly flushed (or recovered) file.
    pub fn add(
        &self,
        resource: Arc<TsFileResource>,
        partition: TimePartition,
        sequence: bool,
    ) {
        self.lists.write().list_mut(partition, sequence).push(resource);
    }

    /// Every time partition holding files, across both spaces.
    pub fn partitions(&self) -> Vec<TimePartition> {
        let lists = self.lists.read();
        let mut partitions: Vec<TimePartition> = lists
            .sequence
            .keys()
            .chain(lists.unsequence.keys())
            .copied()
            .collect();
        partitions.sort_unstable();
        partitions.dedup();
        partitions
    }

    /// Snapshot of one partition's list, for selectors running under the
    /// shared lock.
    pub fn partition_files(
        &self,
        partition: TimePartition,
        sequence: bool,
    ) -> Vec<Arc<TsFileResource>> {
        self.lists
            .read()
            .list(partition, sequence)
            .map(|l| l.as_slice().to_vec())
            .unwrap_or_default()
    }
}
