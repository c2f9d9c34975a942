use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use models::Timestamp;
use parking_lot::RwLock;

use crate::file_utils;

/// Handle to one on-disk time-series file.
///
/// Created when a memtable flushes; merged away by compaction or appended
/// to by deletions (through the sibling mods file); destroyed only after a
/// successful merge's log has recorded its end.
#[derive(Debug)]
pub struct TsFileResource {
    path: PathBuf,
    size: AtomicU64,
    /// Min/max timestamp per device contained in the file.
    device_ranges: RwLock<HashMap<String, (Timestamp, Timestamp)>>,
    /// Set while the file takes part in a compaction.
    merging: AtomicBool,
    /// A file is only a compaction candidate once its writer has sealed it.
    closed: AtomicBool,
}

impl TsFileResource {
    pub fn new(path: impl AsRef<Path>, size: u64) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            size: AtomicU64::new(size),
            device_ranges: RwLock::new(HashMap::new()),
            merging: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mods_path(&self) -> PathBuf {
        file_utils::mods_path(&self.path)
    }

    pub fn compaction_mods_path(&self) -> PathBuf {
        file_utils::compaction_mods_path(&self.path)
    }

    pub fn file_size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    pub fn set_file_size(&self, size: u64) {
        self.size.store(size, Ordering::Release);
    }

    pub fn is_merging(&self) -> bool {
        self.merging.load(Ordering::Acquire)
    }

    pub fn set_merging(&self, merging: bool) {
        self.merging.store(merging, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn update_device_range(&self, device: &str, min_ts: Timestamp, max_ts: Timestamp) {
        let mut ranges = self.device_ranges.write();
        let entry = ranges
            .entry(device.to_string())
            .or_insert((Timestamp::MAX, Timestamp::MIN));
        entry.0 = entry.0.min(min_ts);
        entry.1 = entry.1.max(max_ts);
    }

    pub fn device_range(&self, device: &str) -> Option<(Timestamp, Timestamp)> {
        self.device_ranges.read().get(device).copied()
    }

    pub fn devices(&self) -> Vec<String> {
        self.device_ranges.read().keys().cloned().collect()
    }
}

impl Display for TsFileResource {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?} {{ size: {}, merging: {}, closed: {} }}",
            self.path,
            self.file_size(),
            self.is_merging(),
            self.is_closed()
        )
    }
}

#[cfg(test)]
pub(crate) fn faked_resource(size: u64) -> TsFileResource {
    use std::sync::atomic::AtomicUsize;
    static NEXT: AtomicUsize = AtomicUsize::new(0);
    let id = NEXT.fetch_add(1, Ordering::Relaxed);
    let r = TsFileResource::new(format!("/faked/{:06}.tsf", id), size);
    r.close();
    r
}
