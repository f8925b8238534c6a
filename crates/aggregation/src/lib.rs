#![deny(missing_docs)]

//! Grouping aggregation over partial time-series results.
//!
//! Architecture role:
//! - the [`GroupingAggregator`] seam the coordinator merges through
//! - the default interval-bucket merge implementation
//!
//! The coordinator makes no assumption about aggregator internals; any
//! implementation of the trait is substitutable.

use std::collections::{BTreeMap, HashMap};

use tsq_common::Result;
use tsq_models::{Interval, TimeRange};
use tsq_series::field::{decode_points, encode_points};
use tsq_series::{AggregatorSpec, GroupedIterator, GroupedIterators};

/// Merges per-series iterators across partial responses honoring the query
/// interval and time range.
pub trait GroupingAggregator: Send {
    /// Merge one series group into the aggregation state.
    fn aggregate(&mut self, series: GroupedIterator) -> Result<()>;

    /// Snapshot the merged series groups.
    fn result_set(&self) -> GroupedIterators;
}

/// Default [`GroupingAggregator`]: buckets points into interval slots inside
/// the query time range and merges per field type.
pub struct TimeSeriesMergeAggregator {
    slot_width: i64,
    time_range: TimeRange,
    specs: HashMap<String, AggregatorSpec>,
    // tags -> field name -> slot timestamp -> merged value
    groups: BTreeMap<String, BTreeMap<String, BTreeMap<i64, f64>>>,
}

impl TimeSeriesMergeAggregator {
    /// Build an aggregator for `specs` over the given interval and range.
    ///
    /// `interval_ratio` widens the slot width for downsampled merges; the
    /// coordinator always merges at ratio 1.
    pub fn new(
        interval: Interval,
        interval_ratio: usize,
        time_range: TimeRange,
        specs: Vec<AggregatorSpec>,
    ) -> Self {
        let slot_width = interval.millis() * interval_ratio.max(1) as i64;
        Self {
            slot_width,
            time_range,
            specs: specs
                .into_iter()
                .map(|spec| (spec.field_name.clone(), spec))
                .collect(),
            groups: BTreeMap::new(),
        }
    }

}

impl GroupingAggregator for TimeSeriesMergeAggregator {
    fn aggregate(&mut self, series: GroupedIterator) -> Result<()> {
        let group = self.groups.entry(series.tags().to_string()).or_default();
        for (field_name, payload) in series.fields() {
            // fields without a registered spec were not requested; skip
            let Some(spec) = self.specs.get(field_name) else {
                continue;
            };
            let points = decode_points(payload)?;
            let buckets = group.entry(field_name.clone()).or_default();
            for (timestamp, value) in points {
                if !self.time_range.contains(timestamp) {
                    continue;
                }
                let slot = self.time_range.start
                    + ((timestamp - self.time_range.start) / self.slot_width) * self.slot_width;
                buckets
                    .entry(slot)
                    .and_modify(|current| *current = spec.field_type.merge(*current, value))
                    .or_insert(value);
            }
        }
        Ok(())
    }

    fn result_set(&self) -> GroupedIterators {
        self.groups
            .iter()
            .map(|(tags, fields)| {
                let encoded = fields
                    .iter()
                    .map(|(name, buckets)| {
                        let points: Vec<(i64, f64)> =
                            buckets.iter().map(|(ts, value)| (*ts, *value)).collect();
                        (name.clone(), encode_points(&points))
                    })
                    .collect();
                GroupedIterator::new(tags.clone(), encoded)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tsq_series::FieldType;

    fn sum_spec(field: &str) -> AggregatorSpec {
        AggregatorSpec {
            field_name: field.to_string(),
            field_type: FieldType::Sum,
            functions: vec![],
        }
    }

    fn series(tags: &str, field: &str, points: &[(i64, f64)]) -> GroupedIterator {
        let mut fields = HashMap::new();
        fields.insert(field.to_string(), encode_points(points));
        GroupedIterator::new(tags, fields)
    }

    fn range() -> TimeRange {
        TimeRange {
            start: 0,
            end: 60_000,
        }
    }

    #[test]
    fn merges_same_slot_across_responses() {
        let mut agg = TimeSeriesMergeAggregator::new(
            Interval(10_000),
            1,
            range(),
            vec![sum_spec("usage")],
        );
        agg.aggregate(series("host=a", "usage", &[(1_000, 1.0), (12_000, 2.0)]))
            .expect("first partial");
        agg.aggregate(series("host=a", "usage", &[(3_000, 4.0)]))
            .expect("second partial");

        let result = agg.result_set();
        assert_eq!(result.len(), 1);
        let points = decode_points(&result[0].fields()["usage"]).expect("decode merged");
        assert_eq!(points, vec![(0, 5.0), (10_000, 2.0)]);
    }

    #[test]
    fn keeps_groups_separate_by_tags() {
        let mut agg = TimeSeriesMergeAggregator::new(
            Interval(10_000),
            1,
            range(),
            vec![sum_spec("usage")],
        );
        agg.aggregate(series("host=a", "usage", &[(0, 1.0)]))
            .expect("group a");
        agg.aggregate(series("host=b", "usage", &[(0, 2.0)]))
            .expect("group b");

        let result = agg.result_set();
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].tags(), "host=a");
        assert_eq!(result[1].tags(), "host=b");
    }

    #[test]
    fn drops_points_outside_time_range() {
        let mut agg = TimeSeriesMergeAggregator::new(
            Interval(10_000),
            1,
            range(),
            vec![sum_spec("usage")],
        );
        agg.aggregate(series("host=a", "usage", &[(-5_000, 1.0), (60_000, 2.0), (5_000, 3.0)]))
            .expect("partial");

        let result = agg.result_set();
        let points = decode_points(&result[0].fields()["usage"]).expect("decode merged");
        assert_eq!(points, vec![(0, 3.0)]);
    }

    #[test]
    fn min_field_type_keeps_smallest() {
        let spec = AggregatorSpec {
            field_name: "latency".to_string(),
            field_type: FieldType::Min,
            functions: vec![],
        };
        let mut agg = TimeSeriesMergeAggregator::new(Interval(10_000), 1, range(), vec![spec]);
        agg.aggregate(series("host=a", "latency", &[(0, 9.0)]))
            .expect("first");
        agg.aggregate(series("host=a", "latency", &[(100, 3.0)]))
            .expect("second");

        let result = agg.result_set();
        let points = decode_points(&result[0].fields()["latency"]).expect("decode merged");
        assert_eq!(points, vec![(0, 3.0)]);
    }

    #[test]
    fn unknown_fields_are_skipped() {
        let mut agg = TimeSeriesMergeAggregator::new(
            Interval(10_000),
            1,
            range(),
            vec![sum_spec("usage")],
        );
        agg.aggregate(series("host=a", "unrequested", &[(0, 1.0)]))
            .expect("unknown field");
        let result = agg.result_set();
        assert!(result[0].fields().is_empty());
    }
}
