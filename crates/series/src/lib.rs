#![deny(missing_docs)]

//! Time-series result model shared by the coordinator and aggregation layers.
//!
//! Architecture role:
//! - field typing and the encoded point payload codec
//! - grouped per-tag-set iterators flowing through the merge pipeline
//! - the terminal [`TimeSeriesEvent`] delivered on result channels

use std::collections::HashMap;

use tsq_common::TsqError;
use tsq_models::QueryStats;

/// Field typing, aggregation identity, and the point payload codec.
pub mod field;

pub use field::{AggregateFunc, AggregatorSpec, FieldType};

/// One series group: a tag identity plus encoded field payloads.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupedIterator {
    tags: String,
    fields: HashMap<String, Vec<u8>>,
}

impl GroupedIterator {
    /// Build a grouped iterator over encoded field payloads.
    pub fn new(tags: impl Into<String>, fields: HashMap<String, Vec<u8>>) -> Self {
        Self {
            tags: tags.into(),
            fields,
        }
    }

    /// Tag identity of the group (flattened tag values).
    pub fn tags(&self) -> &str {
        &self.tags
    }

    /// Encoded field payloads keyed by field name.
    pub fn fields(&self) -> &HashMap<String, Vec<u8>> {
        &self.fields
    }
}

/// Merged series groups produced by an aggregator result set.
pub type GroupedIterators = Vec<GroupedIterator>;

/// Terminal event delivered once on a metric task's event channel.
#[derive(Debug)]
pub enum TimeSeriesEvent {
    /// The fanout completed and partial results merged successfully.
    Completed {
        /// Per-field aggregation identity observed across responses.
        aggregator_specs: HashMap<String, AggregatorSpec>,
        /// Merged series groups.
        series_list: GroupedIterators,
        /// Merged execution statistics, when any peer reported them.
        stats: Option<QueryStats>,
    },
    /// The query failed; no further events follow.
    Failed {
        /// The surfaced failure.
        source: TsqError,
        /// Statistics gathered before the failure.
        stats: Option<QueryStats>,
    },
}

impl TimeSeriesEvent {
    /// Returns whether this is a failure event.
    pub fn is_failed(&self) -> bool {
        matches!(self, TimeSeriesEvent::Failed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grouped_iterator_exposes_identity() {
        let mut fields = HashMap::new();
        fields.insert("usage".to_string(), field::encode_points(&[(1_000, 1.0)]));
        let group = GroupedIterator::new("host=a", fields);
        assert_eq!(group.tags(), "host=a");
        assert!(group.fields().contains_key("usage"));
    }

    #[test]
    fn event_failure_flag() {
        let failed = TimeSeriesEvent::Failed {
            source: TsqError::Timeout,
            stats: None,
        };
        assert!(failed.is_failed());
        let completed = TimeSeriesEvent::Completed {
            aggregator_specs: HashMap::new(),
            series_list: Vec::new(),
            stats: None,
        };
        assert!(!completed.is_failed());
    }
}
