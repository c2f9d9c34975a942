use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use config::{CompactionPriority, StorageConfig};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::picker;
use super::task::{CompactionTask, CompactionTaskFactory, TaskContext};
use crate::tsfile::TsFileManager;
use crate::TimePartition;

/// Runs a closure when dropped; pairs the task-counter decrements with the
/// task body whatever way it exits.
pub struct DeferGuard<F: FnOnce()>(Option<F>);

impl<F: FnOnce()> Drop for DeferGuard<F> {
    fn drop(&mut self) {
        if let Some(f) = self.0.take() {
            f()
        }
    }
}

/// Per-node compaction admission and dispatch, driven by a periodic tick
/// and by post-flush hooks. One instance serves every storage group.
pub struct CompactionScheduler {
    config: Arc<StorageConfig>,
    factory: Arc<dyn CompactionTaskFactory>,
    current_task_num: Arc<AtomicUsize>,
    compacting_partitions: Arc<Mutex<HashMap<(String, TimePartition), usize>>>,
    token: CancellationToken,
}

impl CompactionScheduler {
    pub fn new(config: Arc<StorageConfig>, factory: Arc<dyn CompactionTaskFactory>) -> Self {
        Self {
            config,
            factory,
            current_task_num: Arc::new(AtomicUsize::new(0)),
            compacting_partitions: Arc::new(Mutex::new(HashMap::new())),
            token: CancellationToken::new(),
        }
    }

    pub fn current_task_num(&self) -> usize {
        self.current_task_num.load(Ordering::SeqCst)
    }

    pub fn is_partition_compacting(&self, storage_group: &str, partition: TimePartition) -> bool {
        self.compacting_partitions
            .lock()
            .contains_key(&(storage_group.to_string(), partition))
    }

    /// Cancels running tasks; they roll back at their next device boundary.
    pub fn stop(&self) {
        self.token.cancel();
    }

    /// The periodic driver; post-flush hooks call
    /// [`Self::compaction_schedule`] directly in between ticks.
    pub fn start_periodic<F>(self: &Arc<Self>, interval: Duration, managers: F)
    where
        F: Fn() -> Vec<Arc<TsFileManager>> + Send + Sync + 'static,
    {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = scheduler.token.cancelled() => break,
                    _ = ticker.tick() => {
                        for manager in managers() {
                            for partition in manager.partitions() {
                                scheduler.compaction_schedule(&manager, partition);
                            }
                        }
                    }
                }
            }
        });
    }

    /// One scheduling pass over a storage group's time partition. Every
    /// submission round reads the live lists under the shared lock, so a
    /// merge finishing mid-pass is seen instead of a stale snapshot.
    pub fn compaction_schedule(&self, manager: &Arc<TsFileManager>, partition: TimePartition) {
        if self.current_task_num() >= self.config.concurrent_compaction_thread {
            return;
        }
        match self.config.compaction_priority {
            CompactionPriority::Balance => {
                loop {
                    if self.current_task_num() >= self.config.concurrent_compaction_thread {
                        break;
                    }
                    let mut submitted = false;
                    submitted |= self.try_submit_inner(manager, partition, true);
                    submitted |= self.try_submit_inner(manager, partition, false);
                    submitted |= self.try_submit_cross(manager, partition);
                    if !submitted {
                        break;
                    }
                }
            }
            CompactionPriority::InnerCross => {
                self.try_submit_inner(manager, partition, true);
                self.try_submit_inner(manager, partition, false);
                self.try_submit_cross(manager, partition);
            }
            CompactionPriority::CrossInner => {
                self.try_submit_cross(manager, partition);
                self.try_submit_inner(manager, partition, true);
                self.try_submit_inner(manager, partition, false);
            }
        }
    }

    fn try_submit_inner(
        &self,
        manager: &Arc<TsFileManager>,
        partition: TimePartition,
        sequence: bool,
    ) -> bool {
        if (sequence && !self.config.enable_seq_space_compaction)
            || (!sequence && !self.config.enable_unseq_space_compaction)
        {
            return false;
        }
        let selections = {
            let lists = manager.read();
            let files = lists
                .list(partition, sequence)
                .map(|l| l.as_slice().to_vec())
                .unwrap_or_default();
            let selections = picker::select_inner_space_candidates(
                &files,
                self.config.target_compaction_file_size,
            );
            // claim the files under the lock so no later pass selects them
            // again before the tasks start
            for selection in &selections {
                for file in selection {
                    file.set_merging(true);
                }
            }
            selections
        };
        let mut submitted = false;
        for selection in selections {
            if self.current_task_num() >= self.config.concurrent_compaction_thread {
                for file in &selection {
                    file.set_merging(false);
                }
                continue;
            }
            let ctx = TaskContext {
                storage_group: manager.storage_group().to_string(),
                manager: manager.clone(),
                partition,
                selected: selection,
                sequence,
                token: self.token.child_token(),
            };
            self.submit_task(
                manager.storage_group().to_string(),
                partition,
                self.factory.create_task(ctx),
            );
            submitted = true;
        }
        submitted
    }

    fn try_submit_cross(&self, manager: &Arc<TsFileManager>, partition: TimePartition) -> bool {
        if !self.config.enable_unseq_space_compaction {
            return false;
        }
        let lists = manager.read();
        let seq_files = lists
            .list(partition, true)
            .map(|l| l.as_slice().to_vec())
            .unwrap_or_default();
        let unseq_files = lists
            .list(partition, false)
            .map(|l| l.as_slice().to_vec())
            .unwrap_or_default();
        picker::select_cross_space_candidates(&seq_files, &unseq_files).is_some()
    }

    fn submit_task(
        &self,
        storage_group: String,
        partition: TimePartition,
        mut task: Box<dyn CompactionTask>,
    ) {
        self.current_task_num.fetch_add(1, Ordering::SeqCst);
        let key = (storage_group.clone(), partition);
        *self.compacting_partitions.lock().entry(key.clone()).or_insert(0) += 1;

        let current_task_num = self.current_task_num.clone();
        let compacting_partitions = self.compacting_partitions.clone();
        tokio::spawn(async move {
            let _guard = DeferGuard(Some(move || {
                current_task_num.fetch_sub(1, Ordering::SeqCst);
                let mut partitions = compacting_partitions.lock();
                if let Some(active) = partitions.get_mut(&key) {
                    *active -= 1;
                    if *active == 0 {
                        partitions.remove(&key);
                    }
                }
            }));
            match task.do_compaction().await {
                Ok(()) => info!("{} [Compaction] task finished", storage_group),
                Err(e) => error!("{} [Compaction] task failed: {}", storage_group, e),
            }
        });
    }
}
