//! Wire messages and the streaming task service for the TSQ RPC mesh.
//!
//! RPC schema source: `proto/tsq_common.proto`.
//!
//! Key generated types (under [`v1`]):
//! - [`v1::TaskRequest`] / [`v1::TaskResponse`]
//! - [`v1::TimeSeriesList`] / [`v1::TimeSeries`] / [`v1::FieldAggSpec`]
//! - `task_service_client::TaskServiceClient`
//! - `task_service_server::{TaskService, TaskServiceServer}`

use prost::Message;
use tsq_common::{Result, TsqError};

#[allow(missing_docs)]
pub mod v1 {
    tonic::include_proto!("tsq.common.v1");
}

pub use v1::task_service_client::TaskServiceClient;
pub use v1::task_service_server::{TaskService, TaskServiceServer};
pub use v1::{
    FieldAggSpec, RequestType, TaskRequest, TaskResponse, TaskType, TimeSeries, TimeSeriesList,
};

/// Encode a time-series list into a response payload.
pub fn encode_time_series_list(list: &TimeSeriesList) -> Vec<u8> {
    list.encode_to_vec()
}

/// Decode a response payload as a time-series list.
pub fn decode_time_series_list(payload: &[u8]) -> Result<TimeSeriesList> {
    TimeSeriesList::decode(payload).map_err(|e| TsqError::Decode(e.to_string()))
}
