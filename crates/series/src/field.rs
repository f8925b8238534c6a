//! Field typing, aggregation identity, and the point payload codec.

use serde::{Deserialize, Serialize};
use tsq_common::{Result, TsqError};

/// Width of one encoded point: i64 timestamp + f64 value, little-endian.
const POINT_WIDTH: usize = 16;

/// How values of a field merge across partial results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldType {
    /// Values at the same slot add up.
    Sum,
    /// Smallest value wins.
    Min,
    /// Largest value wins.
    Max,
    /// First observed value wins.
    First,
    /// Last observed value wins.
    Last,
}

impl FieldType {
    /// Merge `next` into `current` according to the field type.
    pub fn merge(self, current: f64, next: f64) -> f64 {
        match self {
            FieldType::Sum => current + next,
            FieldType::Min => current.min(next),
            FieldType::Max => current.max(next),
            FieldType::First => current,
            FieldType::Last => next,
        }
    }

    /// Decode a wire field-type discriminant.
    pub fn from_wire(value: i32) -> Result<Self> {
        match value {
            1 => Ok(FieldType::Sum),
            2 => Ok(FieldType::Min),
            3 => Ok(FieldType::Max),
            4 => Ok(FieldType::First),
            5 => Ok(FieldType::Last),
            other => Err(TsqError::Decode(format!("unknown field type {other}"))),
        }
    }

    /// Wire discriminant for this field type.
    pub fn to_wire(self) -> i32 {
        match self {
            FieldType::Sum => 1,
            FieldType::Min => 2,
            FieldType::Max => 3,
            FieldType::First => 4,
            FieldType::Last => 5,
        }
    }
}

/// Downstream aggregation functions requested over a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AggregateFunc {
    /// Sum over the interval.
    Sum,
    /// Minimum over the interval.
    Min,
    /// Maximum over the interval.
    Max,
    /// Arithmetic mean over the interval.
    Avg,
    /// Sample count over the interval.
    Count,
    /// Latest sample in the interval.
    Last,
}

impl AggregateFunc {
    /// Decode a wire function discriminant; unknown values are dropped by
    /// callers rather than failing the whole response.
    pub fn from_wire(value: i32) -> Option<Self> {
        match value {
            1 => Some(AggregateFunc::Sum),
            2 => Some(AggregateFunc::Min),
            3 => Some(AggregateFunc::Max),
            4 => Some(AggregateFunc::Avg),
            5 => Some(AggregateFunc::Count),
            6 => Some(AggregateFunc::Last),
            _ => None,
        }
    }

    /// Wire discriminant for this function.
    pub fn to_wire(self) -> i32 {
        match self {
            AggregateFunc::Sum => 1,
            AggregateFunc::Min => 2,
            AggregateFunc::Max => 3,
            AggregateFunc::Avg => 4,
            AggregateFunc::Count => 5,
            AggregateFunc::Last => 6,
        }
    }
}

/// Aggregation identity of one field, agreed on by the planner across tiers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatorSpec {
    /// Field name.
    pub field_name: String,
    /// Merge semantics of the field.
    pub field_type: FieldType,
    /// Downstream functions to evaluate over the merged series.
    pub functions: Vec<AggregateFunc>,
}

/// Encode `(timestamp_ms, value)` points as a fixed-width payload.
pub fn encode_points(points: &[(i64, f64)]) -> Vec<u8> {
    let mut out = Vec::with_capacity(points.len() * POINT_WIDTH);
    for (timestamp, value) in points {
        out.extend_from_slice(&timestamp.to_le_bytes());
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

/// Decode a fixed-width point payload.
pub fn decode_points(payload: &[u8]) -> Result<Vec<(i64, f64)>> {
    if payload.len() % POINT_WIDTH != 0 {
        return Err(TsqError::Decode(format!(
            "field payload length {} is not a multiple of {POINT_WIDTH}",
            payload.len()
        )));
    }
    let mut points = Vec::with_capacity(payload.len() / POINT_WIDTH);
    for chunk in payload.chunks_exact(POINT_WIDTH) {
        let timestamp = i64::from_le_bytes(chunk[..8].try_into().expect("8-byte slice"));
        let value = f64::from_le_bytes(chunk[8..].try_into().expect("8-byte slice"));
        points.push((timestamp, value));
    }
    Ok(points)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_codec_roundtrip() {
        let points = vec![(1_000, 1.5), (11_000, -2.0), (21_000, 0.0)];
        let decoded = decode_points(&encode_points(&points)).expect("decode points");
        assert_eq!(decoded, points);
    }

    #[test]
    fn decode_rejects_truncated_payload() {
        let mut payload = encode_points(&[(1, 1.0)]);
        payload.pop();
        assert!(decode_points(&payload).is_err());
    }

    #[test]
    fn merge_semantics_per_field_type() {
        assert_eq!(FieldType::Sum.merge(2.0, 3.0), 5.0);
        assert_eq!(FieldType::Min.merge(2.0, 3.0), 2.0);
        assert_eq!(FieldType::Max.merge(2.0, 3.0), 3.0);
        assert_eq!(FieldType::First.merge(2.0, 3.0), 2.0);
        assert_eq!(FieldType::Last.merge(2.0, 3.0), 3.0);
    }

    #[test]
    fn wire_discriminants_roundtrip() {
        for ft in [
            FieldType::Sum,
            FieldType::Min,
            FieldType::Max,
            FieldType::First,
            FieldType::Last,
        ] {
            assert_eq!(FieldType::from_wire(ft.to_wire()).expect("known type"), ft);
        }
        assert!(FieldType::from_wire(42).is_err());
        assert_eq!(AggregateFunc::from_wire(99), None);
    }
}
