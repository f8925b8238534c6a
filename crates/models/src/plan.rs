//! Physical plan model.
//!
//! The planner partitions query execution into a root node, optional
//! aggregation-tier intermediates, and storage-tier leaves. The plan is
//! read-only once handed to the coordinator.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tsq_common::{Result, TsqError};

/// Root executor placement and its expected response count.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Root {
    /// Indicator (host:port identity) of the root node.
    pub indicator: String,
    /// Number of responses the root waits for.
    ///
    /// Equals the intermediate count when intermediates exist, else the
    /// leaf count.
    pub num_of_task: i32,
}

/// One intermediate or leaf executor placement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    /// Indicator of the target node.
    pub indicator: String,
}

impl Target {
    /// Build a target from a node indicator.
    pub fn new(indicator: impl Into<String>) -> Self {
        Self {
            indicator: indicator.into(),
        }
    }
}

/// Placement of query operators across cluster nodes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalPlan {
    /// Root (coordinator-side) executor.
    pub root: Root,
    /// Aggregation-tier executors; may be empty.
    #[serde(default)]
    pub intermediates: Vec<Target>,
    /// Storage-tier executors.
    #[serde(default)]
    pub leaves: Vec<Target>,
}

impl PhysicalPlan {
    /// Validate the structural invariants the coordinator relies on.
    pub fn validate(&self) -> Result<()> {
        if self.root.num_of_task < 1 {
            return Err(TsqError::InvalidPlan(
                "num_of_task must be >= 1".to_string(),
            ));
        }
        if self.leaves.is_empty() {
            return Err(TsqError::InvalidPlan(
                "no leaf executors".to_string(),
            ));
        }
        let expected = if self.intermediates.is_empty() {
            self.leaves.len()
        } else {
            self.intermediates.len()
        };
        if self.root.num_of_task as usize != expected {
            return Err(TsqError::InvalidPlan(format!(
                "num_of_task {} does not match fanout {}",
                self.root.num_of_task, expected
            )));
        }
        let mut seen = HashSet::new();
        for indicator in self
            .intermediates
            .iter()
            .chain(self.leaves.iter())
            .map(|t| t.indicator.as_str())
        {
            if !seen.insert(indicator) {
                return Err(TsqError::InvalidPlan(format!(
                    "duplicate indicator {indicator}"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf_only_plan() -> PhysicalPlan {
        PhysicalPlan {
            root: Root {
                indicator: "broker-1:9000".to_string(),
                num_of_task: 2,
            },
            intermediates: vec![],
            leaves: vec![Target::new("storage-1:9000"), Target::new("storage-2:9000")],
        }
    }

    #[test]
    fn valid_leaf_only_plan() {
        leaf_only_plan().validate().expect("valid plan");
    }

    #[test]
    fn num_of_task_tracks_intermediates_when_present() {
        let mut plan = leaf_only_plan();
        plan.intermediates = vec![Target::new("broker-2:9000")];
        assert!(plan.validate().is_err());
        plan.root.num_of_task = 1;
        plan.validate().expect("valid with one intermediate");
    }

    #[test]
    fn rejects_duplicate_indicators() {
        let mut plan = leaf_only_plan();
        plan.leaves[1] = Target::new("storage-1:9000");
        assert!(plan.validate().is_err());
    }

    #[test]
    fn roundtrips_through_json() {
        let plan = leaf_only_plan();
        let json = serde_json::to_vec(&plan).expect("encode plan");
        let back: PhysicalPlan = serde_json::from_slice(&json).expect("decode plan");
        assert_eq!(back, plan);
    }
}
