use std::path::Path;
use std::sync::Arc;

use super::resource::TsFileResource;

/// An ordered sequence of file resources, time-ascending by creation.
///
/// The list itself carries no lock; [`super::TsFileManager`] guards all of
/// a storage group's lists behind one read-write lock, so either the lists
/// are quiescent or exactly one writer (a compaction commit or a flush)
/// holds the exclusive side.
#[derive(Default)]
pub struct TsFileResourceList {
    files: Vec<Arc<TsFileResource>>,
}

impl TsFileResourceList {
    pub fn push(&mut self, resource: Arc<TsFileResource>) {
        self.files.push(resource);
    }

    /// Inserts `resource` immediately before `before`, or at the end when
    /// `before` is not present.
    pub fn insert_before(&mut self, resource: Arc<TsFileResource>, before: &Arc<TsFileResource>) {
        match self.position_of(before) {
            Some(pos) => self.files.insert(pos, resource),
            None => self.files.push(resource),
        }
    }

    pub fn remove(&mut self, resource: &Arc<TsFileResource>) -> bool {
        match self.position_of(resource) {
            Some(pos) => {
                self.files.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn find_by_path(&self, path: &Path) -> Option<Arc<TsFileResource>> {
        self.files.iter().find(|r| r.path() == path).cloned()
    }

    pub fn as_slice(&self) -> &[Arc<TsFileResource>] {
        &self.files
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    fn position_of(&self, resource: &Arc<TsFileResource>) -> Option<usize> {
        self.files.iter().position(|r| Arc::ptr_eq(r, resource))
    }
}
