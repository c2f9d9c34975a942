use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use models::Timestamp;
use snafu::ResultExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::log::{CompactionLogAnalyzer, CompactionLogger};
use super::task::{commit_merge, merge_into_target};
use crate::error::{IoSnafu, Result};
use crate::file_utils::{self, COMPACTION_LOG_SUFFIX};
use crate::tsfile::{format, TsFileManager, TsFileReader, TsFileResource, TsFileWriter};
use crate::TimePartition;

/// Startup recovery of interrupted merges, one pass per storage group.
///
/// For every compaction log found the pass restores either the pre-merge
/// state or the fully merged state, never a mix, and is idempotent: once a
/// log is consumed a second pass finds nothing to do.
pub struct CompactionRecoverTask {
    manager: Arc<TsFileManager>,
    token: CancellationToken,
}

impl CompactionRecoverTask {
    pub fn new(manager: Arc<TsFileManager>, token: CancellationToken) -> Self {
        Self { manager, token }
    }

    pub async fn recover(&self) -> Result<()> {
        let sg_dir = self.manager.sg_dir().to_path_buf();
        let mut dir = match tokio::fs::read_dir(&sg_dir).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e).context(IoSnafu { path: &sg_dir }),
        };
        while let Some(entry) = dir.next_entry().await.context(IoSnafu { path: &sg_dir })? {
            let path = entry.path();
            let is_log = path
                .file_name()
                .map(|n| n.to_string_lossy().ends_with(COMPACTION_LOG_SUFFIX))
                .unwrap_or(false);
            if is_log {
                // a failing log must not poison the rest of the pass
                if self.recover_one(&path).await.is_err() {
                    warn!(
                        "{} [Compaction] log {:?} left unrecovered",
                        self.manager.storage_group(),
                        path
                    );
                }
            }
        }
        Ok(())
    }

    async fn recover_one(&self, log_path: &Path) -> Result<()> {
        let storage_group = self.manager.storage_group();
        info!(
            "{} [Compaction] recovering from log {:?}",
            storage_group, log_path
        );
        let log = match CompactionLogAnalyzer::analyze(log_path).await {
            Ok(log) => log,
            Err(e) => {
                // abandoned: the target goes, the sources stand
                warn!(
                    "{} [Compaction] abandoning corrupt log {:?}: {}",
                    storage_group, log_path, e
                );
                let partial = CompactionLogAnalyzer::analyze_lenient(log_path).await;
                if let Some(target) = partial.target {
                    file_utils::remove_file_if_exists(&target).await?;
                }
                file_utils::remove_file_if_exists(log_path).await?;
                return Ok(());
            }
        };

        let target_path = match &log.target {
            Some(target) if !log.sources.is_empty() => target.clone(),
            _ => {
                file_utils::remove_file_if_exists(log_path).await?;
                return Ok(());
            }
        };
        if log.devices.is_empty() {
            // the merge never really started
            file_utils::remove_file_if_exists(&target_path).await?;
            file_utils::remove_file_if_exists(log_path).await?;
            return Ok(());
        }

        let (sources, partition) = {
            let lists = self.manager.read();
            let sources: Vec<Arc<TsFileResource>> = log
                .sources
                .iter()
                .filter_map(|p| lists.find_by_path(p))
                .collect();
            let partition = log
                .sources
                .iter()
                .find_map(|p| lists.partition_containing(p, log.sequence))
                .or_else(|| lists.partition_containing(&target_path, log.sequence))
                .unwrap_or(0);
            (sources, partition)
        };
        {
            let _guard = self.manager.write();
            for source in &sources {
                source.set_merging(true);
            }
        }

        let result = self
            .do_recover(&log, log_path, &target_path, &sources, partition)
            .await;
        if let Err(e) = &result {
            error!(
                "{} [Compaction] recover from {:?} failed: {}",
                storage_group, log_path, e
            );
        }
        for source in &sources {
            source.set_merging(false);
        }
        // the log always goes last
        file_utils::remove_file_if_exists(log_path).await?;
        result
    }

    async fn do_recover(
        &self,
        log: &CompactionLogAnalyzer,
        log_path: &Path,
        target_path: &Path,
        sources: &[Arc<TsFileResource>],
        partition: TimePartition,
    ) -> Result<()> {
        if !log.end {
            if !file_utils::try_exists(target_path) || sources.len() != log.sources.len() {
                // cannot resume; the pre-merge state stands
                file_utils::remove_file_if_exists(target_path).await?;
                return Ok(());
            }
            if format::has_crashed(target_path).await? {
                format::truncate(target_path, log.offset).await?;
                let mut writer = TsFileWriter::open_at(target_path, log.offset).await?;
                // the same log keeps growing across the resumed merge
                let mut logger = CompactionLogger::open_append(log_path).await?;
                merge_into_target(
                    sources,
                    &mut writer,
                    &mut logger,
                    &log.devices,
                    &self.token,
                    self.manager.storage_group(),
                )
                .await?;
                writer.seal().await?;
                logger.log_end().await?;
            }
            // a sealed target without `end` finished writing every device;
            // committing is all that is left
        }
        let target = self.load_target_resource(target_path).await?;
        commit_merge(
            &self.manager,
            partition,
            log.sequence,
            &log.sources,
            sources,
            target,
        )
        .await
    }

    /// Builds the target resource by scanning the sealed target file.
    async fn load_target_resource(&self, target_path: &Path) -> Result<Arc<TsFileResource>> {
        let reader = TsFileReader::open(target_path).await?;
        let size = tokio::fs::metadata(target_path)
            .await
            .context(IoSnafu { path: target_path })?
            .len();
        let resource = Arc::new(TsFileResource::new(target_path, size));
        let mut ranges: HashMap<String, (Timestamp, Timestamp)> = HashMap::new();
        for device in reader.devices() {
            let points = reader.read_device(&device);
            if let (Some(first), Some(last)) = (points.first(), points.last()) {
                ranges.insert(device, (first.timestamp, last.timestamp));
            }
        }
        for (device, (min_ts, max_ts)) in ranges {
            resource.update_device_range(&device, min_ts, max_ts);
        }
        resource.close();
        Ok(resource)
    }
}
