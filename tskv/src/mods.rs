//! Modification files.
//!
//! Each tsfile may have a sibling `.mods` file holding the deletions that
//! apply to it, one per line: `path,max_version,start_ts,end_ts`. While a
//! file is being merged, new deletions go to a `.compaction.mods` sibling
//! instead; at commit those records are folded into the merge target's
//! `.mods` so they keep applying.

use std::path::{Path, PathBuf};

use models::Timestamp;
use snafu::ResultExt;
use tokio::io::AsyncWriteExt;

use crate::error::{IoSnafu, ModsCorruptSnafu, Result};
use crate::file_utils;

/// One deletion record: every point of a series matching `path` with a
/// timestamp in `[start, end]` and a version at most `max_version` is gone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deletion {
    pub path: String,
    pub max_version: u64,
    pub start: Timestamp,
    pub end: Timestamp,
}

impl Deletion {
    pub fn new(path: impl Into<String>, max_version: u64, start: Timestamp, end: Timestamp) -> Self {
        Self {
            path: path.into(),
            max_version,
            start,
            end,
        }
    }

    /// Whether this deletion covers `device`: an exact match or a strict
    /// path prefix (`root.sg.d1` covers `root.sg.d1` and `root.sg.d1.s1`).
    pub fn matches_device(&self, device: &str) -> bool {
        device == self.path
            || (device.len() > self.path.len()
                && device.starts_with(&self.path)
                && device.as_bytes()[self.path.len()] == b'.')
    }

    pub fn covers(&self, device: &str, ts: Timestamp) -> bool {
        self.matches_device(device) && self.start <= ts && ts <= self.end
    }

    fn to_line(&self) -> String {
        format!(
            "{},{},{},{}\n",
            self.path, self.max_version, self.start, self.end
        )
    }

    fn parse_line(path: &Path, line: &str) -> Result<Deletion> {
        let corrupt = || {
            ModsCorruptSnafu {
                path,
                reason: format!("bad record '{}'", line),
            }
            .build()
        };
        let mut fields = line.split(',');
        let series = fields.next().ok_or_else(corrupt)?;
        let max_version = fields
            .next()
            .and_then(|f| f.parse().ok())
            .ok_or_else(corrupt)?;
        let start = fields
            .next()
            .and_then(|f| f.parse().ok())
            .ok_or_else(corrupt)?;
        let end = fields
            .next()
            .and_then(|f| f.parse().ok())
            .ok_or_else(corrupt)?;
        if fields.next().is_some() || series.is_empty() {
            return Err(corrupt());
        }
        Ok(Deletion::new(series, max_version, start, end))
    }
}

/// Line-oriented deletion file bound to one tsfile.
pub struct ModificationFile {
    path: PathBuf,
}

impl ModificationFile {
    pub fn normal_for(tsfile: &Path) -> Self {
        Self {
            path: file_utils::mods_path(tsfile),
        }
    }

    pub fn compaction_for(tsfile: &Path) -> Self {
        Self {
            path: file_utils::compaction_mods_path(tsfile),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, deletion: &Deletion) -> Result<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .context(IoSnafu { path: &self.path })?;
        file.write_all(deletion.to_line().as_bytes())
            .await
            .context(IoSnafu { path: &self.path })?;
        file.sync_data().await.context(IoSnafu { path: &self.path })
    }

    /// Reads every record; a missing file holds no deletions.
    pub async fn read_all(&self) -> Result<Vec<Deletion>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e).context(IoSnafu { path: &self.path }),
        };
        content
            .lines()
            .filter(|l| !l.is_empty())
            .map(|l| Deletion::parse_line(&self.path, l))
            .collect()
    }

    pub async fn remove(&self) -> Result<()> {
        file_utils::remove_file_if_exists(&self.path).await
    }
}

/// Folds the `.compaction.mods` records of every source into the target's
/// `.mods`, then removes the source-scoped files. Called at merge commit so
/// deletions queued during the merge now reference the target.
pub async fn rename_compaction_mods_to_target(
    sources: &[PathBuf],
    target: &Path,
) -> Result<()> {
    let target_mods = ModificationFile::normal_for(target);
    for source in sources {
        let queued = ModificationFile::compaction_for(source);
        for deletion in queued.read_all().await? {
            target_mods.append(&deletion).await?;
        }
        queued.remove().await?;
    }
    Ok(())
}

/// Drops the points of `device` that any of `deletions` covers.
pub fn filter_deleted(
    device: &str,
    points: Vec<models::TimeValuePair>,
    deletions: &[Deletion],
) -> Vec<models::TimeValuePair> {
    if deletions.iter().all(|d| !d.matches_device(device)) {
        return points;
    }
    points
        .into_iter()
        .filter(|p| !deletions.iter().any(|d| d.covers(device, p.timestamp)))
        .collect()
}
