use std::collections::BTreeMap;
use std::sync::Arc;

use models::plan::{InsertTabletPlan, PhysicalPlan};
use models::{time_partition, TimePartitionId};
use parking_lot::RwLock;

use super::{PartitionGroup, SlotPartitionTable};
use crate::error::{MetaResult, PartitionTableUnavailableSnafu, UnsupportedPlanSnafu};
use crate::metadata::MetadataManager;

/// Splits a partitioned plan into sub-plans, each targetting exactly one
/// replica group of the current partition table.
pub struct PartitionRouter {
    table: Arc<RwLock<Option<SlotPartitionTable>>>,
    metadata: Arc<dyn MetadataManager>,
    partition_interval: i64,
}

impl PartitionRouter {
    pub fn new(
        table: Arc<RwLock<Option<SlotPartitionTable>>>,
        metadata: Arc<dyn MetadataManager>,
        partition_interval: i64,
    ) -> Self {
        Self {
            table,
            metadata,
            partition_interval,
        }
    }

    /// Splitting an already single-group sub-plan returns it unchanged, so
    /// routing is idempotent.
    pub fn split_and_route(
        &self,
        plan: &PhysicalPlan,
    ) -> MetaResult<Vec<(PhysicalPlan, PartitionGroup)>> {
        let guard = self.table.read();
        let table = guard
            .as_ref()
            .ok_or_else(|| PartitionTableUnavailableSnafu.build())?;
        match plan {
            PhysicalPlan::InsertRow(insert) => {
                let storage_group = self.metadata.storage_group_for(&insert.device)?;
                let partition = time_partition(insert.time, self.partition_interval);
                let group = table.route(&storage_group, partition)?;
                Ok(vec![(plan.clone(), group)])
            }
            PhysicalPlan::InsertTablet(tablet) => self.split_tablet(table, tablet),
            PhysicalPlan::CreateTimeSeries(create) => {
                // schema creation lands on the group owning the storage
                // group's slot
                let storage_group = self.metadata.storage_group_for(&create.path)?;
                let group = table.route(&storage_group, 0)?;
                Ok(vec![(plan.clone(), group)])
            }
            _ => UnsupportedPlanSnafu {
                kind: format!("{:?}", plan),
            }
            .fail(),
        }
    }

    /// Groups the tablet's rows by time partition; rows of one partition
    /// form one sub-plan carrying their original row indices.
    fn split_tablet(
        &self,
        table: &SlotPartitionTable,
        tablet: &InsertTabletPlan,
    ) -> MetaResult<Vec<(PhysicalPlan, PartitionGroup)>> {
        let storage_group = self.metadata.storage_group_for(&tablet.device)?;
        let mut rows_by_partition: BTreeMap<TimePartitionId, Vec<usize>> = BTreeMap::new();
        for (row, time) in tablet.times.iter().enumerate() {
            rows_by_partition
                .entry(time_partition(*time, self.partition_interval))
                .or_default()
                .push(row);
        }
        if rows_by_partition.len() == 1 {
            let (partition, _) = rows_by_partition.iter().next().unwrap();
            let group = table.route(&storage_group, *partition)?;
            return Ok(vec![(PhysicalPlan::InsertTablet(tablet.clone()), group)]);
        }
        let mut routed = Vec::with_capacity(rows_by_partition.len());
        for (partition, rows) in rows_by_partition {
            let group = table.route(&storage_group, partition)?;
            routed.push((
                PhysicalPlan::InsertTablet(tablet.project_rows(&rows)),
                group,
            ));
        }
        Ok(routed)
    }
}
