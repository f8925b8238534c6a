#![deny(missing_docs)]

//! Shared data models for TSQ query coordination.
//!
//! Architecture role:
//! - the physical plan handed from the planner to the coordinator
//! - the statement payloads carried inside task requests
//! - the query statistics tree merged across the cluster
//!
//! All models serialize as JSON; the coordinator treats them as opaque
//! bytes on the wire and decodes them at the consuming tier.

/// Physical plan placement of query operators on cluster nodes.
pub mod plan;
/// Execution statistics merged across responses.
pub mod stats;
/// Parsed statement payloads.
pub mod stmt;

pub use plan::{PhysicalPlan, Root, Target};
pub use stats::{LeafNodeStats, QueryStats};
pub use stmt::{Interval, MetricMetadata, Query, Request, TimeRange};
