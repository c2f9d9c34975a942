use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use models::Timestamp;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::log::CompactionLogger;
use crate::error::{CancelledSnafu, Result};
use crate::file_utils;
use crate::mods::{self, ModificationFile};
use crate::tsfile::{TsFileManager, TsFileReader, TsFileResource, TsFileWriter};
use crate::TimePartition;

/// One selected merge, ready to execute.
pub struct TaskContext {
    pub storage_group: String,
    pub manager: Arc<TsFileManager>,
    pub partition: TimePartition,
    /// Sources in list order (oldest first).
    pub selected: Vec<Arc<TsFileResource>>,
    pub sequence: bool,
    pub token: CancellationToken,
}

#[async_trait]
pub trait CompactionTask: Send {
    async fn do_compaction(&mut self) -> Result<()>;
}

/// Builds tasks for the selections the scheduler admits. A tagged factory
/// with concrete constructors; the scheduler never discovers task types at
/// runtime.
pub trait CompactionTaskFactory: Send + Sync {
    fn create_task(&self, ctx: TaskContext) -> Box<dyn CompactionTask>;
}

pub struct SizeTieredTaskFactory;

impl CompactionTaskFactory for SizeTieredTaskFactory {
    fn create_task(&self, ctx: TaskContext) -> Box<dyn CompactionTask> {
        Box::new(SizeTieredCompactionTask { ctx })
    }
}

/// Inner-space size-tiered merge of one selected file set into a single
/// target file, with a redo log making every step crash-recoverable.
pub struct SizeTieredCompactionTask {
    ctx: TaskContext,
}

#[async_trait]
impl CompactionTask for SizeTieredCompactionTask {
    async fn do_compaction(&mut self) -> Result<()> {
        let target_path = file_utils::make_inner_target_path(self.ctx.selected[0].path());
        let log_path = file_utils::compaction_log_path(
            self.ctx.manager.sg_dir(),
            &self.ctx.storage_group,
        );
        // any failure before `end` reaches the log is a rollback; after
        // that the log stays behind and recovery retries the commit
        let target = match self.write_phase(&target_path, &log_path).await {
            Ok(target) => target,
            Err(e) => {
                error!(
                    "{} [Compaction] task failed, rolling back: {}",
                    self.ctx.storage_group, e
                );
                rollback(&self.ctx.selected, &target_path, &log_path).await;
                return Err(e);
            }
        };
        let source_paths: Vec<_> = self
            .ctx
            .selected
            .iter()
            .map(|r| r.path().to_path_buf())
            .collect();
        if let Err(e) = commit_merge(
            &self.ctx.manager,
            self.ctx.partition,
            self.ctx.sequence,
            &source_paths,
            &self.ctx.selected,
            target,
        )
        .await
        {
            error!(
                "{} [Compaction] commit failed, recovery will retry: {}",
                self.ctx.storage_group, e
            );
            return Err(e);
        }
        file_utils::remove_file_if_exists(&log_path).await?;
        info!(
            "{} [Compaction] finished merging into {:?}",
            self.ctx.storage_group, target_path
        );
        Ok(())
    }
}

impl SizeTieredCompactionTask {
    /// Runs the merge up to and including the fsynced `end` record, and
    /// builds the target resource.
    async fn write_phase(
        &self,
        target_path: &std::path::Path,
        log_path: &std::path::Path,
    ) -> Result<Arc<TsFileResource>> {
        let ctx = &self.ctx;
        info!(
            "{} [Compaction] merging {} files of partition {} into {:?}",
            ctx.storage_group,
            ctx.selected.len(),
            ctx.partition,
            target_path
        );

        {
            let _guard = ctx.manager.write();
            for resource in &ctx.selected {
                resource.set_merging(true);
            }
        }

        let mut logger = CompactionLogger::create(log_path).await?;
        for resource in &ctx.selected {
            logger.log_source(resource.path()).await?;
        }
        logger.log_target(target_path).await?;
        logger.log_sequence(ctx.sequence).await?;

        let mut writer = TsFileWriter::create(target_path).await?;
        let ranges = merge_into_target(
            &ctx.selected,
            &mut writer,
            &mut logger,
            &HashSet::new(),
            &ctx.token,
            &ctx.storage_group,
        )
        .await?;
        writer.seal().await?;
        logger.log_end().await?;

        let target = Arc::new(TsFileResource::new(target_path, writer.offset()));
        for (device, (min_ts, max_ts)) in &ranges {
            target.update_device_range(device, *min_ts, *max_ts);
        }
        target.close();
        Ok(target)
    }
}

/// Merges every device of `sources` not yet in `done_devices` into the
/// target writer, in sorted device order, recording a resumable boundary
/// after each device. Returns the written device time ranges.
pub(crate) async fn merge_into_target(
    sources: &[Arc<TsFileResource>],
    writer: &mut TsFileWriter,
    logger: &mut CompactionLogger,
    done_devices: &HashSet<String>,
    token: &CancellationToken,
    storage_group: &str,
) -> Result<HashMap<String, (Timestamp, Timestamp)>> {
    let mut readers = Vec::with_capacity(sources.len());
    let mut deletions = Vec::with_capacity(sources.len());
    for source in sources {
        readers.push(TsFileReader::open(source.path()).await?);
        deletions.push(ModificationFile::normal_for(source.path()).read_all().await?);
    }

    let mut devices: BTreeSet<String> = BTreeSet::new();
    for reader in &readers {
        devices.extend(reader.devices());
    }

    let mut ranges = HashMap::new();
    for device in devices {
        if done_devices.contains(&device) {
            continue;
        }
        if token.is_cancelled() {
            return CancelledSnafu { storage_group }.fail();
        }
        let mut points = Vec::new();
        for (reader, dels) in readers.iter().zip(deletions.iter()) {
            let read = mods::filter_deleted(&device, reader.read_device(&device), dels);
            points.extend(read);
        }
        if points.is_empty() {
            continue;
        }
        // stable on timestamp, so equal-timestamp points keep source order
        points.sort_by_key(|p| p.timestamp);
        let min_ts = points[0].timestamp;
        let max_ts = points[points.len() - 1].timestamp;
        let offset = writer.write_device(&device, &points).await?;
        writer.sync().await?;
        logger.device_finished(&device, offset).await?;
        ranges.insert(device, (min_ts, max_ts));
    }
    Ok(ranges)
}

/// Swaps the target in for its sources: list fixup under the exclusive
/// lock, then disk cleanup. Safe to re-run after a crash mid-commit: a
/// target already in the list is not inserted twice, only the sources are
/// removed, and missing source files are skipped.
pub(crate) async fn commit_merge(
    manager: &TsFileManager,
    partition: TimePartition,
    sequence: bool,
    source_paths: &[std::path::PathBuf],
    sources_in_list: &[Arc<TsFileResource>],
    target: Arc<TsFileResource>,
) -> Result<()> {
    {
        let mut lists = manager.write();
        let list = lists.list_mut(partition, sequence);
        if list.find_by_path(target.path()).is_none() {
            match sources_in_list.first() {
                Some(first) => list.insert_before(target.clone(), first),
                None => list.push(target.clone()),
            }
        }
        for source in sources_in_list {
            list.remove(source);
        }
    }
    for path in source_paths {
        file_utils::remove_file_if_exists(path).await?;
        ModificationFile::normal_for(path).remove().await?;
    }
    mods::rename_compaction_mods_to_target(source_paths, target.path()).await?;
    for source in sources_in_list {
        source.set_merging(false);
    }
    Ok(())
}

/// Pre-`end` failure handling: the target is discarded, the sources stay
/// in the list with their flags cleared, the log goes away.
pub(crate) async fn rollback(
    sources: &[Arc<TsFileResource>],
    target_path: &std::path::Path,
    log_path: &std::path::Path,
) {
    if let Err(e) = file_utils::remove_file_if_exists(target_path).await {
        error!("[Compaction] cannot discard target {:?}: {}", target_path, e);
    }
    for source in sources {
        source.set_merging(false);
    }
    if let Err(e) = file_utils::remove_file_if_exists(log_path).await {
        error!("[Compaction] cannot remove log {:?}: {}", log_path, e);
    }
}

#[cfg(test)]
mod test {
    use models::TimeValuePair;

    use super::*;
    use crate::compaction::log::CompactionLogAnalyzer;
    use crate::mods::Deletion;

    async fn write_source(
        dir: &std::path::Path,
        file_id: u64,
        device_points: &[(&str, Vec<TimeValuePair>)],
    ) -> Arc<TsFileResource> {
        let path = file_utils::make_tsfile_path(dir, file_id);
        let mut writer = TsFileWriter::create(&path).await.unwrap();
        for (device, points) in device_points {
            writer.write_device(device, points).await.unwrap();
        }
        writer.seal().await.unwrap();
        let resource = Arc::new(TsFileResource::new(&path, writer.offset()));
        for (device, points) in device_points {
            let min = points.iter().map(|p| p.timestamp).min().unwrap();
            let max = points.iter().map(|p| p.timestamp).max().unwrap();
            resource.update_device_range(device, min, max);
        }
        resource.close();
        resource
    }

    fn points(range: std::ops::Range<i64>) -> Vec<TimeValuePair> {
        range.map(|t| TimeValuePair::new(t, t as f64)).collect()
    }

    fn task_ctx(
        manager: &Arc<TsFileManager>,
        selected: Vec<Arc<TsFileResource>>,
    ) -> TaskContext {
        TaskContext {
            storage_group: manager.storage_group().to_string(),
            manager: manager.clone(),
            partition: 0,
            selected,
            sequence: true,
            token: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_merge_preserves_point_union() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(TsFileManager::new("root.sg1", dir.path()));
        let s1 = write_source(
            dir.path(),
            1,
            &[("root.sg1.d1", points(0..5)), ("root.sg1.d2", points(10..12))],
        )
        .await;
        let s2 = write_source(dir.path(), 2, &[("root.sg1.d1", points(3..8))]).await;
        manager.add(s1.clone(), 0, true);
        manager.add(s2.clone(), 0, true);

        let mut task = SizeTieredTaskFactory
            .create_task(task_ctx(&manager, vec![s1.clone(), s2.clone()]));
        task.do_compaction().await.unwrap();

        let files = manager.partition_files(0, true);
        assert_eq!(files.len(), 1);
        let target = &files[0];
        assert!(!s1.path().exists());
        assert!(!s2.path().exists());
        assert!(target.path().exists());

        let reader = TsFileReader::open(target.path()).await.unwrap();
        let d1 = reader.read_device("root.sg1.d1");
        // the union multiset, time-sorted: 3 and 4 appear in both sources
        let ts: Vec<i64> = d1.iter().map(|p| p.timestamp).collect();
        assert_eq!(ts, vec![0, 1, 2, 3, 3, 4, 4, 5, 6, 7]);
        assert_eq!(reader.read_device("root.sg1.d2"), points(10..12));
        assert_eq!(target.device_range("root.sg1.d1"), Some((0, 7)));

        // the redo log is gone after a successful pass
        assert!(!file_utils::compaction_log_path(dir.path(), "root.sg1").exists());
    }

    #[tokio::test]
    async fn test_merge_applies_mods() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(TsFileManager::new("root.sg1", dir.path()));
        let s1 = write_source(dir.path(), 1, &[("root.sg1.d1", points(0..10))]).await;
        ModificationFile::normal_for(s1.path())
            .append(&Deletion::new("root.sg1.d1", 1, 2, 4))
            .await
            .unwrap();
        manager.add(s1.clone(), 0, true);

        let mut task = SizeTieredTaskFactory.create_task(task_ctx(&manager, vec![s1]));
        task.do_compaction().await.unwrap();

        let files = manager.partition_files(0, true);
        let reader = TsFileReader::open(files[0].path()).await.unwrap();
        let ts: Vec<i64> = reader
            .read_device("root.sg1.d1")
            .iter()
            .map(|p| p.timestamp)
            .collect();
        assert_eq!(ts, vec![0, 1, 5, 6, 7, 8, 9]);
    }

    #[tokio::test]
    async fn test_queued_deletions_follow_target() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(TsFileManager::new("root.sg1", dir.path()));
        let s1 = write_source(dir.path(), 1, &[("root.sg1.d1", points(0..10))]).await;
        // a deletion arrives while the merge is running
        let queued = Deletion::new("root.sg1.d1", 2, 0, 3);
        ModificationFile::compaction_for(s1.path())
            .append(&queued)
            .await
            .unwrap();
        manager.add(s1.clone(), 0, true);

        let mut task = SizeTieredTaskFactory.create_task(task_ctx(&manager, vec![s1]));
        task.do_compaction().await.unwrap();

        let files = manager.partition_files(0, true);
        let target_mods = ModificationFile::normal_for(files[0].path());
        assert_eq!(target_mods.read_all().await.unwrap(), vec![queued]);
    }

    #[tokio::test]
    async fn test_cancelled_task_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(TsFileManager::new("root.sg1", dir.path()));
        let s1 = write_source(dir.path(), 1, &[("root.sg1.d1", points(0..5))]).await;
        manager.add(s1.clone(), 0, true);

        let mut ctx = task_ctx(&manager, vec![s1.clone()]);
        ctx.token.cancel();
        let mut task = SizeTieredTaskFactory.create_task(ctx);
        assert!(task.do_compaction().await.is_err());

        // sources intact, flags cleared, no target, no log
        let files = manager.partition_files(0, true);
        assert_eq!(files.len(), 1);
        assert!(Arc::ptr_eq(&files[0], &s1));
        assert!(!s1.is_merging());
        assert!(s1.path().exists());
        assert!(!file_utils::make_inner_target_path(s1.path()).exists());
        assert!(!file_utils::compaction_log_path(dir.path(), "root.sg1").exists());
    }

    #[tokio::test]
    async fn test_log_records_before_end() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = file_utils::compaction_log_path(dir.path(), "root.sg1");
        let mut logger = CompactionLogger::create(&log_path).await.unwrap();
        let s1 = write_source(dir.path(), 1, &[("root.sg1.d1", points(0..5))]).await;
        logger.log_source(s1.path()).await.unwrap();
        let target = file_utils::make_inner_target_path(s1.path());
        logger.log_target(&target).await.unwrap();
        logger.log_sequence(true).await.unwrap();

        let mut writer = TsFileWriter::create(&target).await.unwrap();
        let token = CancellationToken::new();
        merge_into_target(
            &[s1],
            &mut writer,
            &mut logger,
            &HashSet::new(),
            &token,
            "root.sg1",
        )
        .await
        .unwrap();

        let analyzer = CompactionLogAnalyzer::analyze(&log_path).await.unwrap();
        assert!(analyzer.devices.contains("root.sg1.d1"));
        assert_eq!(analyzer.offset, writer.offset());
        assert!(!analyzer.end);
    }
}
