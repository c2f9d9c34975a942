pub mod cache;
pub mod puller;

use async_trait::async_trait;
use models::plan::PhysicalPlan;
use models::MeasurementSchema;

use crate::error::MetaResult;

pub use cache::{CachedMeta, RemoteMetaCache};
pub use puller::MetaPuller;

/// The metadata collaborator the cluster core consumes: storage-group
/// resolution, wildcard freezing, schema creation and local schema serving.
/// The cluster implementation backs misses with [`RemoteMetaCache`] and
/// [`MetaPuller`].
#[async_trait]
pub trait MetadataManager: Send + Sync {
    /// The storage group owning `path`. `StorageGroupNotSet` when the
    /// group is unknown locally.
    fn storage_group_for(&self, path: &str) -> MetaResult<String>;

    /// Resolves wildcard patterns to the concrete full paths existing now,
    /// freezing them before a deletion is forwarded.
    async fn expand_paths(&self, patterns: &[String]) -> MetaResult<Vec<String>>;

    /// Auto-creates the storage group and series a plan needs. Used when a
    /// split yields nothing and auto-create is enabled.
    async fn create_schema_for(&self, plan: &PhysicalPlan) -> MetaResult<()>;

    /// Creates the given timeseries; `false` when nothing was created.
    async fn create_timeseries(&self, paths: &[String]) -> MetaResult<bool>;

    /// Serves a peer's pull request from local metadata.
    async fn local_schemas(&self, prefixes: &[String]) -> MetaResult<Vec<MeasurementSchema>>;
}
