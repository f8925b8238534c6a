#![deny(missing_docs)]

//! Distributed query task coordination for a clustered time-series database.
//!
//! Architecture role:
//! - fans a precomputed physical plan out over the RPC mesh
//! - collects partial time-series results from many leaves
//! - merges them through the grouping aggregation pipeline
//! - delivers one merged event stream per query to the caller
//!
//! Key modules:
//! - [`manager`] — task table, submission flows, response routing, TTL sweep
//! - [`context`] — per-query collection state machines
//! - [`pool`] — bounded worker pool for fanout and response processing
//! - [`transport`] — stream factory seams the core consumes
//! - [`processor`] — intermediate-tier request orchestration
//! - [`grpc`] — tonic service and factory implementations

/// Per-query task contexts.
pub mod context;
/// Tonic service and transport factory implementations.
pub mod grpc;
/// Task manager and submission flows.
pub mod manager;
/// Bounded worker pool.
pub mod pool;
/// Intermediate-tier request orchestration.
pub mod processor;
/// Transport seams consumed by the task manager.
pub mod transport;

pub use context::{TaskContext, TaskRole};
pub use grpc::{GrpcTaskClientFactory, GrpcTaskServerFactory, TaskHandler};
pub use manager::{QueryContext, TaskManager};
pub use pool::{Pool, Task};
pub use processor::IntermediateTaskProcessor;
pub use transport::{
    TaskClientFactory, TaskReceiver, TaskRequestSender, TaskResponseSender, TaskServerFactory,
};
