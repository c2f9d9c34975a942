//! Non-query plan dispatch: classification, splitting, forwarding and the
//! reassembly of per-row results.

use std::sync::Arc;
use std::time::Duration;

use models::plan::PhysicalPlan;
use models::{Node, StatusCode, TsStatus};
use tracing::{debug, error, info, warn};

use super::membership::AppendLogResult;
use super::MetaGroupMember;
use crate::error::MetaError;
use crate::partition::PartitionGroup;
use crate::raft_log::LogPayload;
use crate::rpc::AppendEntryRequest;

impl MetaGroupMember {
    /// The plan-routing entry point: executes a non-query plan wherever
    /// the cluster needs it to run.
    pub async fn execute_non_query_plan(self: &Arc<Self>, plan: &PhysicalPlan) -> TsStatus {
        if plan.is_local() {
            self.execute_locally(plan).await
        } else if plan.is_global_meta() {
            self.process_non_partitioned_meta_plan(plan).await
        } else if plan.is_global_data() {
            self.process_non_partitioned_data_plan(plan).await
        } else {
            self.process_partitioned_plan(plan).await
        }
    }

    /// A forwarded plan arriving from a peer, to be handled here.
    pub async fn handle_execute_plan(self: &Arc<Self>, header: Node, plan: PhysicalPlan) -> TsStatus {
        if plan.is_global_meta() {
            self.process_non_partitioned_meta_plan(&plan).await
        } else {
            self.data_services.execute_in_local_group(&header, &plan).await
        }
    }

    async fn execute_locally(&self, plan: &PhysicalPlan) -> TsStatus {
        match self.executor.process_non_query(plan).await {
            Ok(true) => TsStatus::new(StatusCode::Success, "Execute successfully"),
            Ok(false) => TsStatus::new(StatusCode::ExecuteStatementError, ""),
            Err(e) => {
                error!("{}: server Internal Error: {}", self.name(), e);
                TsStatus::new(StatusCode::InternalServerError, e.to_string())
            }
        }
    }

    /// A global meta plan is replicated through the meta group's log: the
    /// leader appends and waits for a majority, everyone applies at
    /// commit.
    pub(crate) async fn process_non_partitioned_meta_plan(
        self: &Arc<Self>,
        plan: &PhysicalPlan,
    ) -> TsStatus {
        if self.is_leader() {
            return self.replicate_meta_plan(plan).await;
        }
        self.wait_leader().await;
        if self.is_leader() {
            return self.replicate_meta_plan(plan).await;
        }
        let Some(leader) = self.leader() else {
            return TsStatus::new(StatusCode::NoLeader, "no leader in the current term");
        };
        debug!("Forwarding meta plan {:?} to the leader {}", plan, leader);
        let client = self.provider.client(&leader);
        match client.execute_plan(leader.clone(), plan.clone()).await {
            Ok(status) => status.with_redirect(leader.host.clone(), leader.client_port),
            Err(e) => TsStatus::new(StatusCode::ExecuteStatementError, e.to_string()),
        }
    }

    async fn replicate_meta_plan(self: &Arc<Self>, plan: &PhysicalPlan) -> TsStatus {
        let mut log_manager = self.log_manager.lock().await;
        let prev_log_index = log_manager.last_log_index();
        let prev_log_term = log_manager.last_log_term();
        let entry = log_manager.append(self.term(), LogPayload::Plan(plan.clone()));
        let request = AppendEntryRequest {
            term: self.term(),
            prev_log_index,
            prev_log_term,
            entry: entry.clone(),
        };
        loop {
            match self.send_log_to_meta_group(request.clone()).await {
                AppendLogResult::Ok => {
                    for committed in log_manager.commit_up_to(entry.index) {
                        self.apply_entry(&committed).await;
                    }
                    return TsStatus::ok();
                }
                AppendLogResult::Timeout => {
                    info!("Replicating meta plan timed out, retrying");
                    if self.token.is_cancelled() {
                        return TsStatus::time_out();
                    }
                }
                AppendLogResult::LeadershipStale => {
                    return TsStatus::new(StatusCode::NoLeader, "leadership is stale");
                }
            }
        }
    }

    /// A global data plan goes to every replica group; wildcard paths are
    /// frozen to concrete ones before anything is forwarded.
    pub(crate) async fn process_non_partitioned_data_plan(
        self: &Arc<Self>,
        plan: &PhysicalPlan,
    ) -> TsStatus {
        let plan = match self.freeze_paths(plan).await {
            Ok(plan) => plan,
            Err(e) => return TsStatus::new(StatusCode::ExecuteStatementError, e.to_string()),
        };
        if let Err(e) = self.sync_leader().await {
            debug!("Forwarding global data plan to the meta leader: {}", e);
            self.wait_leader().await;
            let Some(leader) = self.leader() else {
                return TsStatus::new(StatusCode::NoLeader, "no leader in the current term");
            };
            let client = self.provider.client(&leader);
            return match client.execute_plan(leader.clone(), plan).await {
                Ok(status) => status,
                Err(e) => TsStatus::new(StatusCode::ExecuteStatementError, e.to_string()),
            };
        }
        let groups = {
            let table = self.partition_table.read();
            match table.as_ref().map(|t| t.all_groups()) {
                Some(Ok(groups)) => groups,
                _ => return TsStatus::new(StatusCode::PartitionTableNotReady, ""),
            }
        };
        debug!("Forwarding global data plan to {} groups", groups.len());
        let mut error_groups = Vec::new();
        for group in groups {
            let status = self.forward_to_single_group(&plan, &group).await;
            if !status.is_success() {
                error_groups.push(format!("[{:?}@{}:{}]", status.code, group.header(), status.message));
            }
        }
        if error_groups.is_empty() {
            TsStatus::ok()
        } else {
            TsStatus::new(
                StatusCode::ExecuteStatementError,
                format!("The following errors occurred when executing the query, please retry or contact the DBA: {}", error_groups.join(", ")),
            )
        }
    }

    /// Expands wildcard paths of deletion plans via the metadata
    /// collaborator so executor nodes never have to ask the (possibly
    /// already mutated) metadata holders.
    async fn freeze_paths(&self, plan: &PhysicalPlan) -> Result<PhysicalPlan, MetaError> {
        match plan {
            PhysicalPlan::DeleteTimeSeries { paths } => {
                let frozen = self.metadata.expand_paths(paths).await?;
                Ok(PhysicalPlan::DeleteTimeSeries { paths: frozen })
            }
            PhysicalPlan::Deletion { paths, start, end } => {
                let frozen = self.metadata.expand_paths(paths).await?;
                Ok(PhysicalPlan::Deletion {
                    paths: frozen,
                    start: *start,
                    end: *end,
                })
            }
            other => Ok(other.clone()),
        }
    }

    /// A partitioned plan is split by the router and each sub-plan is
    /// forwarded to its group.
    pub(crate) async fn process_partitioned_plan(self: &Arc<Self>, plan: &PhysicalPlan) -> TsStatus {
        debug!("{}: Received a partitioned plan {:?}", self.name(), plan);
        if self.partition_table.read().is_none() {
            return TsStatus::new(StatusCode::PartitionTableNotReady, "");
        }
        let routed = match self.split_plan(plan).await {
            Ok(routed) => routed,
            Err(MetaError::ConsistencyCheck { message }) => {
                return TsStatus::new(StatusCode::ConsistencyFailure, message)
            }
            Err(e) => {
                debug!("{}: cannot split {:?}: {}", self.name(), plan, e);
                vec![]
            }
        };
        if routed.is_empty() {
            if self.config.enable_auto_create_schema
                && (plan.is_insert() || matches!(plan, PhysicalPlan::CreateTimeSeries(_)))
            {
                if let Err(e) = self.metadata.create_schema_for(plan).await {
                    error!("Failed to set storage group or create timeseries, because {}", e);
                } else {
                    return Box::pin(self.execute_non_query_plan(plan)).await;
                }
            }
            error!("{}: Cannot find storage groups for {:?}", self.name(), plan);
            return TsStatus::new(StatusCode::NoStorageGroup, "");
        }
        self.forward_plan(&routed, plan).await
    }

    /// Splits via the router; an unknown storage group triggers one
    /// leader sync and a single retry before giving up.
    async fn split_plan(
        self: &Arc<Self>,
        plan: &PhysicalPlan,
    ) -> Result<Vec<(PhysicalPlan, PartitionGroup)>, MetaError> {
        match self.router.split_and_route(plan) {
            Ok(routed) => Ok(routed),
            Err(MetaError::StorageGroupNotSet { .. }) => {
                self.sync_leader().await?;
                self.router.split_and_route(plan)
            }
            Err(e) => Err(e),
        }
    }

    /// Message-level consistency check with the leader.
    pub(crate) async fn sync_leader(&self) -> Result<(), MetaError> {
        if self.is_leader() {
            return Ok(());
        }
        let Some(leader) = self.leader() else {
            return Err(MetaError::ConsistencyCheck {
                message: "no leader to sync with".to_string(),
            });
        };
        match self.provider.client(&leader).check_alive().await {
            Ok(true) => Ok(()),
            Ok(false) | Err(_) => Err(MetaError::ConsistencyCheck {
                message: format!("leader {} did not answer the consistency check", leader),
            }),
        }
    }

    // ---- forwarding -------------------------------------------------

    pub(crate) async fn forward_plan(
        self: &Arc<Self>,
        routed: &[(PhysicalPlan, PartitionGroup)],
        plan: &PhysicalPlan,
    ) -> TsStatus {
        let status = self.forward_core(routed, plan).await;
        // one-shot create-and-retry for missing measurements
        if plan.is_insert()
            && status.code == StatusCode::TimeseriesNotExist
            && self.config.enable_auto_create_schema
        {
            let paths = timeseries_paths(plan);
            match self.metadata.create_timeseries(&paths).await {
                Ok(true) => return self.forward_core(routed, plan).await,
                Ok(false) => error!("{}: cannot auto create timeseries", self.name()),
                Err(e) => {
                    return TsStatus::new(StatusCode::ExecuteStatementError, e.to_string())
                }
            }
        }
        debug!("{}: executed {:?} with answer {}", self.name(), plan, status);
        status
    }

    async fn forward_core(
        self: &Arc<Self>,
        routed: &[(PhysicalPlan, PartitionGroup)],
        plan: &PhysicalPlan,
    ) -> TsStatus {
        if routed.len() == 1 {
            let (sub, group) = &routed[0];
            return self.forward_to_single_group(sub, group).await;
        }
        if let PhysicalPlan::InsertTablet(tablet) = plan {
            return self.forward_tablet_plan(routed, tablet.row_count()).await;
        }
        self.forward_to_multiple_groups(routed).await
    }

    pub(crate) async fn forward_to_single_group(
        self: &Arc<Self>,
        plan: &PhysicalPlan,
        group: &PartitionGroup,
    ) -> TsStatus {
        if group.contains(&self.this_node()) {
            debug!("Execute {:?} in a local group of {}", plan, group.header());
            self.data_services
                .execute_in_local_group(group.header(), plan)
                .await
        } else {
            debug!("Forward {:?} to a remote group of {}", plan, group.header());
            self.forward_plan_to_group(plan, group).await
        }
    }

    /// Tries the group's members in latency order; only when every member
    /// times out does the caller see TIME_OUT.
    async fn forward_plan_to_group(&self, plan: &PhysicalPlan, group: &PartitionGroup) -> TsStatus {
        for node in self.selector.order(group) {
            let started = std::time::Instant::now();
            let client = self.provider.client(&node);
            let result = tokio::time::timeout(
                Duration::from_millis(self.config.write_operation_timeout_ms),
                client.execute_plan(group.header().clone(), plan.clone()),
            )
            .await;
            match result {
                Ok(Ok(status)) if status.code != StatusCode::TimeOut => {
                    self.selector.record(&node, started.elapsed());
                    let status = if status.redirect_node.is_none() {
                        status.with_redirect(node.host.clone(), node.client_port)
                    } else {
                        status
                    };
                    return status;
                }
                Ok(Ok(_)) | Err(_) => warn!("Forward {:?} to {} timed out", plan, node),
                Ok(Err(e)) => warn!("Forward {:?} to {} failed: {}", plan, node, e),
            }
        }
        warn!("Forward {:?} to {} timed out", plan, group);
        TsStatus::time_out()
    }

    async fn forward_to_multiple_groups(
        self: &Arc<Self>,
        routed: &[(PhysicalPlan, PartitionGroup)],
    ) -> TsStatus {
        let mut error_groups = Vec::new();
        for (sub, group) in routed {
            let status = self.forward_to_single_group(sub, group).await;
            if !status.is_success() {
                error_groups.push(format!(
                    "[{:?}@{}:{}]",
                    status.code,
                    group.header(),
                    status.message
                ));
            }
        }
        if error_groups.is_empty() {
            TsStatus::ok()
        } else {
            TsStatus::new(
                StatusCode::ExecuteStatementError,
                format!("The following errors occurred when executing the query, please retry or contact the DBA: {}", error_groups.join(", ")),
            )
        }
    }

    /// Collects per-group results of a split tablet and reweaves the
    /// per-row statuses back into the original row order.
    async fn forward_tablet_plan(
        self: &Arc<Self>,
        routed: &[(PhysicalPlan, PartitionGroup)],
        row_count: usize,
    ) -> TsStatus {
        let mut no_failure = true;
        let mut is_batch_failure = false;
        let mut sub_status: Option<Vec<TsStatus>> = None;
        let mut error_groups = Vec::new();

        for (sub, group) in routed {
            let status = self.forward_to_single_group(sub, group).await;
            debug!("{}: from {:?},{},{}", self.name(), sub, group, status);
            no_failure = status.is_success() && no_failure;
            if status.code == StatusCode::MultipleError {
                is_batch_failure = true;
                let combined =
                    sub_status.get_or_insert_with(|| vec![TsStatus::ok(); row_count]);
                let PhysicalPlan::InsertTablet(tablet) = sub else {
                    continue;
                };
                // positions of this sub-plan's rows in the original tablet
                match &tablet.row_indices {
                    Some(indices) => {
                        for (k, row_status) in status.sub_status.iter().enumerate() {
                            if let Some(&row) = indices.get(k) {
                                combined[row] = row_status.clone();
                            }
                        }
                    }
                    None => {
                        for (row, row_status) in status.sub_status.iter().enumerate() {
                            if row < combined.len() {
                                combined[row] = row_status.clone();
                            }
                        }
                    }
                }
            }
            if !status.is_success() {
                error_groups.push(format!(
                    "[{:?}@{}:{}]",
                    status.code,
                    group.header(),
                    status.message
                ));
            }
        }

        if no_failure {
            TsStatus::ok()
        } else if is_batch_failure {
            TsStatus::multiple_error(sub_status.unwrap_or_default())
        } else {
            TsStatus::new(
                StatusCode::ExecuteStatementError,
                format!("The following errors occurred when executing the query, please retry or contact the DBA: {}", error_groups.join(", ")),
            )
        }
    }
}

/// Full paths of the measurements an insert touches, for auto-create.
fn timeseries_paths(plan: &PhysicalPlan) -> Vec<String> {
    match plan {
        PhysicalPlan::InsertRow(insert) => insert
            .measurements
            .iter()
            .map(|m| format!("{}.{}", insert.device, m))
            .collect(),
        PhysicalPlan::InsertTablet(tablet) => tablet
            .measurements
            .iter()
            .map(|m| format!("{}.{}", tablet.device, m))
            .collect(),
        _ => vec![],
    }
}
