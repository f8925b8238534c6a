//! Query execution statistics merged across the cluster.
//!
//! The root merges one [`QueryStats`] per intermediate and one
//! [`LeafNodeStats`] per leaf into a single tree that travels with the
//! terminal event.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Per-leaf execution statistics reported by storage nodes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafNodeStats {
    /// Leaf-side execution cost in nanoseconds.
    #[serde(default)]
    pub total_cost: i64,
    /// Response payload size in bytes, filled by the receiving side.
    #[serde(default)]
    pub net_payload: i64,
    /// Number of series scanned on the leaf.
    #[serde(default)]
    pub num_of_series: u64,
}

/// Aggregated statistics for one distributed query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryStats {
    /// Query start, unix nanoseconds.
    #[serde(default)]
    pub start: i64,
    /// Query end, unix nanoseconds; zero while in flight.
    #[serde(default)]
    pub end: i64,
    /// Root-side merge cost in nanoseconds.
    #[serde(default)]
    pub total_cost: i64,
    /// Total response bytes received across the fanout.
    #[serde(default)]
    pub net_payload: i64,
    /// Stats of intermediate tasks keyed by node indicator.
    #[serde(default)]
    pub intermediate_nodes: HashMap<String, QueryStats>,
    /// Stats of leaf tasks keyed by node indicator.
    #[serde(default)]
    pub leaf_nodes: HashMap<String, LeafNodeStats>,
}

impl QueryStats {
    /// Create an empty stats tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge stats reported by an intermediate task.
    pub fn merge_intermediate_task_stats(&mut self, node: &str, stats: QueryStats) {
        self.net_payload += stats.net_payload;
        self.intermediate_nodes.insert(node.to_string(), stats);
    }

    /// Merge stats reported by a leaf task.
    pub fn merge_leaf_task_stats(&mut self, node: &str, stats: LeafNodeStats) {
        self.net_payload += stats.net_payload;
        self.leaf_nodes.insert(node.to_string(), stats);
    }
}
