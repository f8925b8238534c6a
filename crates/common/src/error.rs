use thiserror::Error;

/// Canonical TSQ error taxonomy used across crates.
///
/// Classification guidance:
/// - [`TsqError::NoSendStream`] / [`TsqError::TaskSend`] /
///   [`TsqError::ResponseSend`]: transport-level dispatch failures
/// - [`TsqError::Timeout`] / [`TsqError::MissingIntermediateAcks`]:
///   intermediate-ack handshake outcomes
/// - [`TsqError::UnknownTask`]: a response arrived for an id that is not
///   (or is no longer) in the task table
/// - [`TsqError::Decode`]: a payload did not unmarshal
/// - [`TsqError::Server`]: an error message surfaced by a remote peer
/// - [`TsqError::Io`]: raw IO failures from std APIs
#[derive(Debug, Error)]
pub enum TsqError {
    /// No client or server stream exists for the target node.
    #[error("no send stream, target node: {0}")]
    NoSendStream(String),

    /// Sending a task request on an established stream failed.
    #[error("send task request failed, target node: {0}")]
    TaskSend(String),

    /// Sending a task response upstream failed.
    #[error("send task response failed, parent node: {0}")]
    ResponseSend(String),

    /// The caller's context was cancelled while waiting on intermediate acks.
    #[error("task timeout while waiting for intermediate acks")]
    Timeout,

    /// The ack channel closed before every intermediate replied.
    #[error("missing acks from intermediate nodes")]
    MissingIntermediateAcks,

    /// A response named a task id with no live context.
    #[error("task not found, may be evicted, task id: {0}")]
    UnknownTask(String),

    /// The physical plan violates a structural invariant.
    #[error("invalid physical plan: {0}")]
    InvalidPlan(String),

    /// Wire payload or serialized statement failed to decode.
    #[error("decode payload failed: {0}")]
    Decode(String),

    /// Error message surfaced by a remote peer.
    ///
    /// Carries the remote message verbatim; use [`is_not_found`] to detect
    /// the tolerable partial "not found" case.
    #[error("{0}")]
    Server(String),

    /// Transparent std IO failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Standard TSQ result alias.
pub type Result<T> = std::result::Result<T, TsqError>;

/// Returns whether a remote error message describes a "not found" outcome.
///
/// Substring match is kept for wire compatibility with older peers; newer
/// peers also set the structured `not_found` response flag.
pub fn is_not_found(err_msg: &str) -> bool {
    err_msg.contains("not found")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_detection() {
        assert!(is_not_found("tsdb: shard not found"));
        assert!(is_not_found("metric not found"));
        assert!(!is_not_found("connection reset by peer"));
    }

    #[test]
    fn error_display_carries_context() {
        let err = TsqError::NoSendStream("storage-1:9000".to_string());
        assert!(err.to_string().contains("storage-1:9000"));
        assert_eq!(
            TsqError::MissingIntermediateAcks.to_string(),
            "missing acks from intermediate nodes"
        );
    }
}
