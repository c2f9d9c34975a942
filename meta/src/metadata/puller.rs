use std::sync::Arc;

use tracing::{debug, warn};

use super::cache::{CachedMeta, RemoteMetaCache};
use crate::coordinator::NodeSelector;
use crate::error::{MetaResult, PathNotExistSnafu, UnreachableSnafu};
use crate::partition::PartitionGroup;
use crate::rpc::{ClientProvider, PullSchemaRequest};
use models::MeasurementSchema;

/// Pulls measurement schemas from the replica group owning them, feeding
/// the [`RemoteMetaCache`].
pub struct MetaPuller {
    provider: Arc<dyn ClientProvider>,
    selector: Arc<dyn NodeSelector>,
    cache: Arc<RemoteMetaCache>,
}

impl MetaPuller {
    pub fn new(
        provider: Arc<dyn ClientProvider>,
        selector: Arc<dyn NodeSelector>,
        cache: Arc<RemoteMetaCache>,
    ) -> Self {
        Self {
            provider,
            selector,
            cache,
        }
    }

    pub fn cache(&self) -> &Arc<RemoteMetaCache> {
        &self.cache
    }

    /// Pulls the schemas under `prefix_paths` from `group`, trying its
    /// members in latency order until one answers. Every returned schema
    /// is cached.
    pub async fn pull_schemas(
        &self,
        group: &PartitionGroup,
        prefix_paths: Vec<String>,
    ) -> MetaResult<Vec<MeasurementSchema>> {
        let request = PullSchemaRequest {
            header: group.header().clone(),
            prefix_paths,
        };
        for node in self.selector.order(group) {
            let started = std::time::Instant::now();
            match self.provider.client(&node).pull_schema(request.clone()).await {
                Ok(resp) => {
                    self.selector.record(&node, started.elapsed());
                    debug!(
                        "Pulled {} schemas of {:?} from {}",
                        resp.schemas.len(),
                        request.prefix_paths,
                        node
                    );
                    for schema in &resp.schemas {
                        self.cache
                            .put(schema.full_path.clone(), CachedMeta::new(schema.clone()));
                    }
                    return Ok(resp.schemas);
                }
                Err(e) => {
                    warn!("Cannot pull schemas from {}: {}", node, e);
                }
            }
        }
        UnreachableSnafu {
            node: group.to_string(),
            reason: "no member of the group answered the schema pull",
        }
        .fail()
    }

    /// Cache-through lookup of one full path.
    pub async fn get_schema(
        &self,
        group: &PartitionGroup,
        full_path: &str,
    ) -> MetaResult<MeasurementSchema> {
        if let Some(cached) = self.cache.get(full_path) {
            return Ok(cached.schema);
        }
        self.pull_schemas(group, vec![full_path.to_string()]).await?;
        match self.cache.get(full_path) {
            Some(cached) => Ok(cached.schema),
            None => PathNotExistSnafu { path: full_path }.fail(),
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use models::Node;

    use super::*;
    use crate::coordinator::LatencyOrderedSelector;
    use crate::error::MetaError;
    use crate::rpc::*;

    /// A provider whose first node always fails and whose second serves
    /// one schema.
    struct FlakyProvider {
        calls: Arc<AtomicUsize>,
    }

    struct FlakyClient {
        fail: bool,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl MetaClient for FlakyClient {
        async fn add_node(&self, _req: AddNodeRequest) -> MetaResult<AddNodeResponse> {
            unimplemented!()
        }
        async fn remove_node(&self, _node: Node) -> MetaResult<ResponseCode> {
            unimplemented!()
        }
        async fn heartbeat(&self, _req: HeartbeatRequest) -> MetaResult<HeartbeatResponse> {
            unimplemented!()
        }
        async fn append_entry(&self, _req: AppendEntryRequest) -> MetaResult<AppendEntryResponse> {
            unimplemented!()
        }
        async fn check_status(&self, _status: StartUpStatus) -> MetaResult<CheckStatusResponse> {
            unimplemented!()
        }
        async fn check_alive(&self) -> MetaResult<bool> {
            Ok(true)
        }
        async fn pull_schema(&self, req: PullSchemaRequest) -> MetaResult<PullSchemaResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(MetaError::Timeout {
                    what: "pull".to_string(),
                });
            }
            Ok(PullSchemaResponse {
                schemas: req
                    .prefix_paths
                    .iter()
                    .map(|p| MeasurementSchema::new(p.clone()))
                    .collect(),
            })
        }
        async fn exile(&self) -> MetaResult<()> {
            Ok(())
        }
        async fn execute_plan(
            &self,
            _header: Node,
            _plan: models::plan::PhysicalPlan,
        ) -> MetaResult<models::TsStatus> {
            unimplemented!()
        }
    }

    impl ClientProvider for FlakyProvider {
        fn client(&self, node: &Node) -> Arc<dyn MetaClient> {
            Arc::new(FlakyClient {
                fail: node.identifier == 1,
                calls: self.calls.clone(),
            })
        }
    }

    fn node(id: i32) -> Node {
        let mut n = Node::new("10.0.0.1", 9000 + id as u16, 40000, 6667);
        n.identifier = id;
        n
    }

    #[tokio::test]
    async fn test_pull_tries_members_in_order_and_caches() {
        let calls = Arc::new(AtomicUsize::new(0));
        let puller = MetaPuller::new(
            Arc::new(FlakyProvider {
                calls: calls.clone(),
            }),
            Arc::new(LatencyOrderedSelector::default()),
            Arc::new(RemoteMetaCache::new(16)),
        );
        let group = PartitionGroup::new(vec![node(1), node(2)]);

        let schema = puller.get_schema(&group, "root.sg.d1.s1").await.unwrap();
        assert_eq!(schema.full_path, "root.sg.d1.s1");
        // node 1 failed, node 2 answered
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // the second lookup is served from the cache
        puller.get_schema(&group, "root.sg.d1.s1").await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
