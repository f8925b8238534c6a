//! Transport seams consumed by the task manager.
//!
//! The coordinator never owns connections: an external membership layer
//! keeps client streams dialed per peer and registers server-side response
//! streams as peers connect. The task manager only looks streams up by
//! node indicator and pushes messages through them.

use std::sync::Arc;

use tsq_protocol::{TaskRequest, TaskResponse};

/// Outbound request stream to one peer.
pub trait TaskRequestSender: Send + Sync {
    /// Push one task request onto the stream.
    ///
    /// An error means the stream is broken; the caller reports it as a
    /// task-send failure and the membership layer re-dials.
    fn send(&self, req: TaskRequest) -> Result<(), ()>;
}

/// Outbound response stream to one peer, server side.
pub trait TaskResponseSender: Send + Sync {
    /// Push one task response onto the stream.
    fn send(&self, resp: TaskResponse) -> Result<(), ()>;
}

/// Client stream registry keyed by target node indicator.
pub trait TaskClientFactory: Send + Sync {
    /// Look up the request stream dialed to `target_node`, if any.
    fn task_client(&self, target_node: &str) -> Option<Arc<dyn TaskRequestSender>>;
}

/// Server stream registry keyed by peer node indicator.
pub trait TaskServerFactory: Send + Sync {
    /// Look up the response stream of the peer `target_node`, if connected.
    fn response_stream(&self, target_node: &str) -> Option<Arc<dyn TaskResponseSender>>;
}

/// Inbound response sink; implemented by the task manager.
pub trait TaskReceiver: Send + Sync {
    /// Route one inbound response from `from_node` to its task context.
    fn receive(&self, resp: TaskResponse, from_node: &str) -> tsq_common::Result<()>;
}
