use std::sync::Arc;

use crate::tsfile::TsFileResource;

/// Inner-space candidate selection.
///
/// Walks the partition's list newest to oldest, accumulating candidate
/// files; a file that is still open, already merging, or at least
/// `target_file_size` on its own breaks the run and flushes any partial
/// accumulation. When the accumulated size first exceeds the target the
/// run is sealed into one selection. Whatever is left after the walk is
/// returned as a final, possibly undersized, selection.
///
/// Each returned selection is in list order (oldest first); selections are
/// returned in the order they were sealed.
pub fn select_inner_space_candidates(
    files: &[Arc<TsFileResource>],
    target_file_size: u64,
) -> Vec<Vec<Arc<TsFileResource>>> {
    let mut selections = Vec::new();
    let mut selected: Vec<Arc<TsFileResource>> = Vec::new();
    let mut selected_size = 0u64;
    for file in files.iter().rev() {
        if file.file_size() >= target_file_size || file.is_merging() || !file.is_closed() {
            selected.clear();
            selected_size = 0;
            continue;
        }
        selected.push(file.clone());
        selected_size += file.file_size();
        if selected_size > target_file_size {
            selected.reverse();
            selections.push(std::mem::take(&mut selected));
            selected_size = 0;
        }
    }
    // leftovers below the target still merge, as the trailing remainder
    if !selected.is_empty() {
        selected.reverse();
        selections.push(selected);
    }
    selections
}

/// Cross-space selection: pairs unsequence files with the sequence files
/// they overlap.
#[derive(Debug)]
pub struct CrossSpaceSelection {
    pub sequence_files: Vec<Arc<TsFileResource>>,
    pub unsequence_files: Vec<Arc<TsFileResource>>,
}

/// Cross-space selection is dispatched by the scheduler but selects
/// nothing at this revision; the hook exists so the priority orders stay
/// exercised end-to-end.
pub fn select_cross_space_candidates(
    _sequence_files: &[Arc<TsFileResource>],
    _unsequence_files: &[Arc<TsFileResource>],
) -> Option<CrossSpaceSelection> {
    None
}
