#![deny(missing_docs)]

//! Shared configuration, error types, and observability primitives for TSQ crates.
//!
//! Architecture role:
//! - defines coordinator/runtime configuration passed across layers
//! - provides the common [`TsqError`] / [`Result`] contracts
//! - hosts the query/pool statistics bundles
//!
//! Key modules:
//! - [`config`]
//! - [`error`]
//! - [`metrics`]
//! - [`timeutil`]

/// Shared coordinator/runtime configuration types.
pub mod config;
/// Shared error taxonomy.
pub mod error;
/// Statistics bundles and Prometheus rendering helpers.
pub mod metrics;
/// Unix-millisecond clock helpers.
pub mod timeutil;

pub use config::CoordinatorConfig;
pub use error::{Result, TsqError};
pub use metrics::{PoolStatistics, QueryStatistics};
