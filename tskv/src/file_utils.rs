use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{IoSnafu, Result};
use snafu::ResultExt;

pub const TSFILE_SUFFIX: &str = ".tsf";
pub const MODS_SUFFIX: &str = ".mods";
pub const COMPACTION_MODS_SUFFIX: &str = ".compaction.mods";
pub const COMPACTION_LOG_SUFFIX: &str = ".compaction.log";
pub const HARDLINK_DIR: &str = "hardlink";

pub fn make_tsfile_path(dir: impl AsRef<Path>, file_id: u64) -> PathBuf {
    dir.as_ref().join(format!("{:06}{}", file_id, TSFILE_SUFFIX))
}

/// Target path of an inner-space merge, derived from the list-order-first
/// source so recovery can re-derive it from the log alone.
pub fn make_inner_target_path(first_source: &Path) -> PathBuf {
    let stem = first_source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    first_source.with_file_name(format!("{}.inner{}", stem, TSFILE_SUFFIX))
}

pub fn mods_path(tsfile: &Path) -> PathBuf {
    append_suffix(tsfile, MODS_SUFFIX)
}

pub fn compaction_mods_path(tsfile: &Path) -> PathBuf {
    append_suffix(tsfile, COMPACTION_MODS_SUFFIX)
}

pub fn compaction_log_path(sg_dir: impl AsRef<Path>, storage_group: &str) -> PathBuf {
    sg_dir
        .as_ref()
        .join(format!("{}{}", storage_group, COMPACTION_LOG_SUFFIX))
}

fn append_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(suffix);
    path.with_file_name(name)
}

pub fn try_exists(path: impl AsRef<Path>) -> bool {
    path.as_ref().exists()
}

pub async fn remove_file_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).context(IoSnafu { path }),
    }
}

pub async fn rename(old: &Path, new: &Path) -> Result<()> {
    info!("rename file from {:?} to {:?}", old, new);
    tokio::fs::rename(old, new)
        .await
        .context(IoSnafu { path: old })
}

/// Writes `data` to `<path>.tmp` and renames it over `path`.
pub async fn atomic_replace(path: &Path, data: &[u8]) -> Result<()> {
    let tmp = append_suffix(path, ".tmp");
    tokio::fs::write(&tmp, data)
        .await
        .context(IoSnafu { path: &tmp })?;
    let file = tokio::fs::File::open(&tmp)
        .await
        .context(IoSnafu { path: &tmp })?;
    file.sync_all().await.context(IoSnafu { path: &tmp })?;
    tokio::fs::rename(&tmp, path)
        .await
        .context(IoSnafu { path })
}

/// Hourly janitor deleting expired hard links under the data directory.
/// Hard links are created when a file is pulled while it is being merged;
/// once the pull window has passed they only waste space.
pub struct HardLinkCleaner {
    dir: PathBuf,
    max_age: Duration,
}

impl HardLinkCleaner {
    pub fn new(data_dir: impl AsRef<Path>, max_age: Duration) -> Self {
        Self {
            dir: data_dir.as_ref().join(HARDLINK_DIR),
            max_age,
        }
    }

    pub fn start(self, interval: Duration, token: CancellationToken) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.clean_once().await {
                            error!("Hard link clean pass failed: {}", e);
                        }
                    }
                }
            }
        });
    }

    pub async fn clean_once(&self) -> Result<()> {
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e).context(IoSnafu { path: &self.dir }),
        };
        let now = SystemTime::now();
        while let Some(entry) = dir
            .next_entry()
            .await
            .context(IoSnafu { path: &self.dir })?
        {
            let path = entry.path();
            let modified = match entry.metadata().await.and_then(|m| m.modified()) {
                Ok(t) => t,
                Err(e) => {
                    warn!("Cannot stat hard link {:?}: {}", path, e);
                    continue;
                }
            };
            let expired = now
                .duration_since(modified)
                .map(|age| age > self.max_age)
                .unwrap_or(false);
            if expired {
                info!("Removing expired hard link {:?}", path);
                remove_file_if_exists(&path).await?;
            }
        }
        Ok(())
    }
}
