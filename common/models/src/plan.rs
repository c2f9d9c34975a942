use serde::{Deserialize, Serialize};

use crate::Timestamp;

/// A parsed non-query plan. The grammar producing these is a collaborator;
/// the cluster core only classifies, splits and forwards them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum PhysicalPlan {
    InsertRow(InsertRowPlan),
    InsertTablet(InsertTabletPlan),
    CreateTimeSeries(CreateTimeSeriesPlan),
    SetStorageGroup { storage_group: String },
    /// Paths may contain wildcards until the meta member freezes them.
    DeleteTimeSeries { paths: Vec<String> },
    Deletion {
        paths: Vec<String>,
        start: Timestamp,
        end: Timestamp,
    },
    Flush,
}

impl PhysicalPlan {
    /// A plan with no cluster effect, executed by the local executor.
    pub fn is_local(&self) -> bool {
        matches!(self, PhysicalPlan::Flush)
    }

    /// A plan applied to the meta group through its Raft log.
    pub fn is_global_meta(&self) -> bool {
        matches!(self, PhysicalPlan::SetStorageGroup { .. })
    }

    /// A plan broadcast to every data replica group.
    pub fn is_global_data(&self) -> bool {
        matches!(
            self,
            PhysicalPlan::DeleteTimeSeries { .. } | PhysicalPlan::Deletion { .. }
        )
    }

    pub fn is_insert(&self) -> bool {
        matches!(
            self,
            PhysicalPlan::InsertRow(_) | PhysicalPlan::InsertTablet(_)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InsertRowPlan {
    pub device: String,
    pub time: Timestamp,
    pub measurements: Vec<String>,
    pub values: Vec<f64>,
}

/// A batch insert for one device. When the tablet is split by the plan
/// router, each sub-plan records the positions its rows held in the
/// original tablet so per-row results can be rewoven into the combined
/// response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InsertTabletPlan {
    pub device: String,
    pub times: Vec<Timestamp>,
    pub measurements: Vec<String>,
    /// One column per measurement, each of `times.len()` values.
    pub columns: Vec<Vec<f64>>,
    /// `None` for an unsplit tablet; `Some(indices)` on a sub-plan, where
    /// `indices[k]` is the row's position in the original tablet.
    pub row_indices: Option<Vec<usize>>,
}

impl InsertTabletPlan {
    pub fn row_count(&self) -> usize {
        self.times.len()
    }

    /// Builds the sub-plan carrying the rows at `indices`.
    pub fn project_rows(&self, indices: &[usize]) -> InsertTabletPlan {
        InsertTabletPlan {
            device: self.device.clone(),
            times: indices.iter().map(|&i| self.times[i]).collect(),
            measurements: self.measurements.clone(),
            columns: self
                .columns
                .iter()
                .map(|col| indices.iter().map(|&i| col[i]).collect())
                .collect(),
            row_indices: Some(match &self.row_indices {
                // a re-split maps through the existing indices
                Some(orig) => indices.iter().map(|&i| orig[i]).collect(),
                None => indices.to_vec(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreateTimeSeriesPlan {
    pub path: String,
}

#[cfg(test)]
mod test {
    use super::*;

    fn tablet() -> InsertTabletPlan {
        InsertTabletPlan {
            device: "root.sg.d1".to_string(),
            times: vec![10, 20, 30],
            measurements: vec!["s1".to_string(), "s2".to_string()],
            columns: vec![vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]],
            row_indices: None,
        }
    }

    #[test]
    fn test_project_rows() {
        let plan = tablet();
        let sub = plan.project_rows(&[0, 2]);
        assert_eq!(sub.times, vec![10, 30]);
        assert_eq!(sub.columns, vec![vec![1.0, 3.0], vec![4.0, 6.0]]);
        assert_eq!(sub.row_indices, Some(vec![0, 2]));
    }

    #[test]
    fn test_project_rows_nested() {
        let plan = tablet();
        let sub = plan.project_rows(&[1, 2]);
        let sub_sub = sub.project_rows(&[1]);
        // positions always refer to the original tablet
        assert_eq!(sub_sub.row_indices, Some(vec![2]));
        assert_eq!(sub_sub.times, vec![30]);
    }
}
