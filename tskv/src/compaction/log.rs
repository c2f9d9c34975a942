//! Compaction redo log.
//!
//! One append-only text file per active compaction, recording in order:
//! the source file paths, the target path, the sequence flag, a
//! `device`/`offset` pair after each completed device, and a terminal
//! `end`. Every record is fsynced before the merge proceeds, so the log
//! is authoritative at recovery: an fsynced `end` means the merge is
//! committed, anything less is rolled back or resumed.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use snafu::ResultExt;
use tokio::io::AsyncWriteExt;

use crate::error::{CompactionLogCorruptSnafu, IoSnafu, Result};

const SOURCE_NAME: &str = "source";
const TARGET_NAME: &str = "target";
const SEQUENCE_NAME: &str = "seq";
const DEVICE_NAME: &str = "device";
const OFFSET_NAME: &str = "offset";
const END_NAME: &str = "end";

pub struct CompactionLogger {
    path: PathBuf,
    file: tokio::fs::File,
}

impl CompactionLogger {
    pub async fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = tokio::fs::File::create(&path)
            .await
            .context(IoSnafu { path: &path })?;
        Ok(Self { path, file })
    }

    /// Reopens an existing log to continue a resumed merge.
    pub async fn open_append(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .context(IoSnafu { path: &path })?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn log_source(&mut self, source: &Path) -> Result<()> {
        self.append(&format!("{} {}\n", SOURCE_NAME, source.display()))
            .await
    }

    pub async fn log_target(&mut self, target: &Path) -> Result<()> {
        self.append(&format!("{} {}\n", TARGET_NAME, target.display()))
            .await
    }

    pub async fn log_sequence(&mut self, sequence: bool) -> Result<()> {
        self.append(&format!("{} {}\n", SEQUENCE_NAME, sequence)).await
    }

    /// Marks `device` complete, `offset` being the target-file length at
    /// the block boundary.
    pub async fn device_finished(&mut self, device: &str, offset: u64) -> Result<()> {
        self.append(&format!(
            "{} {}\n{} {}\n",
            DEVICE_NAME, device, OFFSET_NAME, offset
        ))
        .await
    }

    pub async fn log_end(&mut self) -> Result<()> {
        self.append(&format!("{}\n", END_NAME)).await
    }

    async fn append(&mut self, record: &str) -> Result<()> {
        self.file
            .write_all(record.as_bytes())
            .await
            .context(IoSnafu { path: &self.path })?;
        self.file
            .sync_data()
            .await
            .context(IoSnafu { path: &self.path })
    }
}

/// Parsed view of a compaction log.
#[derive(Debug, Default)]
pub struct CompactionLogAnalyzer {
    pub sources: Vec<PathBuf>,
    pub target: Option<PathBuf>,
    pub sequence: bool,
    pub devices: HashSet<String>,
    /// Target-file length after the last completed device.
    pub offset: u64,
    pub end: bool,
}

impl CompactionLogAnalyzer {
    pub async fn analyze(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await.context(IoSnafu { path })?;
        let mut analyzer = CompactionLogAnalyzer::default();
        for line in content.lines().filter(|l| !l.is_empty()) {
            let corrupt = |reason: String| CompactionLogCorruptSnafu { path, reason }.build();
            let (kind, rest) = match line.split_once(' ') {
                Some((k, r)) => (k, Some(r)),
                None => (line, None),
            };
            match (kind, rest) {
                (SOURCE_NAME, Some(p)) => analyzer.sources.push(PathBuf::from(p)),
                (TARGET_NAME, Some(p)) => analyzer.target = Some(PathBuf::from(p)),
                (SEQUENCE_NAME, Some(flag)) => {
                    analyzer.sequence = flag
                        .parse()
                        .map_err(|_| corrupt(format!("bad sequence flag '{}'", flag)))?;
                }
                (DEVICE_NAME, Some(device)) => {
                    analyzer.devices.insert(device.to_string());
                }
                (OFFSET_NAME, Some(offset)) => {
                    analyzer.offset = offset
                        .parse()
                        .map_err(|_| corrupt(format!("bad offset '{}'", offset)))?;
                }
                (END_NAME, None) => analyzer.end = true,
                _ => return Err(corrupt(format!("unknown record '{}'", line))),
            }
        }
        Ok(analyzer)
    }

    /// Best-effort parse of a corrupt log, keeping whatever records still
    /// make sense. Used only to find the target that must be discarded
    /// when the log is abandoned.
    pub async fn analyze_lenient(path: &Path) -> Self {
        let content = tokio::fs::read_to_string(path).await.unwrap_or_default();
        let mut analyzer = CompactionLogAnalyzer::default();
        for line in content.lines() {
            match line.split_once(' ') {
                Some((SOURCE_NAME, p)) => analyzer.sources.push(PathBuf::from(p)),
                Some((TARGET_NAME, p)) => analyzer.target = Some(PathBuf::from(p)),
                _ => {}
            }
        }
        analyzer
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_log_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("root.sg1.compaction.log");
        let mut logger = CompactionLogger::create(&path).await.unwrap();
        logger.log_source(Path::new("/data/000001.tsf")).await.unwrap();
        logger.log_source(Path::new("/data/000002.tsf")).await.unwrap();
        logger.log_target(Path::new("/data/000001.inner.tsf")).await.unwrap();
        logger.log_sequence(true).await.unwrap();
        logger.device_finished("root.sg1.d1", 128).await.unwrap();
        logger.device_finished("root.sg1.d2", 256).await.unwrap();

        let analyzer = CompactionLogAnalyzer::analyze(&path).await.unwrap();
        assert_eq!(
            analyzer.sources,
            vec![PathBuf::from("/data/000001.tsf"), PathBuf::from("/data/000002.tsf")]
        );
        assert_eq!(analyzer.target, Some(PathBuf::from("/data/000001.inner.tsf")));
        assert!(analyzer.sequence);
        assert_eq!(analyzer.devices.len(), 2);
        assert_eq!(analyzer.offset, 256);
        assert!(!analyzer.end);

        let mut logger = CompactionLogger::open_append(&path).await.unwrap();
        logger.log_end().await.unwrap();
        let analyzer = CompactionLogAnalyzer::analyze(&path).await.unwrap();
        assert!(analyzer.end);
    }

    #[tokio::test]
    async fn test_unknown_record_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("root.sg1.compaction.log");
        tokio::fs::write(&path, "source /data/000001.tsf\ngarbage record\n")
            .await
            .unwrap();
        assert!(CompactionLogAnalyzer::analyze(&path).await.is_err());
    }
}
