//! Parsed statement payloads carried inside task requests.
//!
//! The SQL grammar and parser live outside this repository; the
//! coordinator only serializes these statements into request payloads and
//! hands them to the executing tier.

use serde::{Deserialize, Serialize};
use tsq_common::{Result, TsqError};

/// Downsampling interval in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Interval(
    /// Interval length in milliseconds.
    pub i64,
);

impl Interval {
    /// Interval length in milliseconds, clamped to at least one.
    pub fn millis(self) -> i64 {
        self.0.max(1)
    }
}

/// Query time range `[start, end)` in unix milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    /// Inclusive start.
    pub start: i64,
    /// Exclusive end.
    pub end: i64,
}

impl TimeRange {
    /// Returns whether `timestamp` falls inside the range.
    pub fn contains(&self, timestamp: i64) -> bool {
        timestamp >= self.start && timestamp < self.end
    }
}

/// A parsed metric data query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Query {
    /// Metric to query.
    pub metric_name: String,
    /// Selected field names; empty selects all fields.
    #[serde(default)]
    pub fields: Vec<String>,
    /// Grouping tag keys.
    #[serde(default)]
    pub group_by: Vec<String>,
    /// Downsampling interval.
    pub interval: Interval,
    /// Query time range.
    pub time_range: TimeRange,
}

impl Query {
    /// Serialize the query as a JSON request payload.
    pub fn marshal(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| TsqError::Decode(e.to_string()))
    }
}

/// A metric metadata suggestion request (metric names, tag keys, tag values).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricMetadata {
    /// Metric name or prefix to suggest against.
    #[serde(default)]
    pub metric_name: String,
    /// Tag key when suggesting tag values.
    #[serde(default)]
    pub tag_key: String,
    /// Max suggestions per leaf.
    pub limit: usize,
}

impl MetricMetadata {
    /// Serialize the suggestion as a JSON request payload.
    pub fn marshal(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| TsqError::Decode(e.to_string()))
    }
}

/// Caller request identity attached to a query submission.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// Externally assigned request id, propagated to leaf requests.
    pub request_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_marshal_roundtrip() {
        let query = Query {
            metric_name: "cpu.load".to_string(),
            fields: vec!["usage".to_string()],
            group_by: vec!["host".to_string()],
            interval: Interval(10_000),
            time_range: TimeRange {
                start: 1_000,
                end: 61_000,
            },
        };
        let payload = query.marshal().expect("encode query");
        let back: Query = serde_json::from_slice(&payload).expect("decode query");
        assert_eq!(back, query);
    }

    #[test]
    fn metadata_marshal_roundtrip() {
        let suggest = MetricMetadata {
            metric_name: "cpu".to_string(),
            tag_key: "host".to_string(),
            limit: 100,
        };
        let payload = suggest.marshal().expect("encode metadata");
        let back: MetricMetadata = serde_json::from_slice(&payload).expect("decode metadata");
        assert_eq!(back, suggest);
    }

    #[test]
    fn time_range_bounds() {
        let range = TimeRange { start: 10, end: 20 };
        assert!(range.contains(10));
        assert!(range.contains(19));
        assert!(!range.contains(20));
        assert!(!range.contains(9));
    }

    #[test]
    fn interval_clamps_to_one_milli() {
        assert_eq!(Interval(0).millis(), 1);
        assert_eq!(Interval(10_000).millis(), 10_000);
    }
}
