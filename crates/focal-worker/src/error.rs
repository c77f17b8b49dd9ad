//! Harness error types.

use std::time::Duration;

use focal_models::{ErrorKind, ProcessingError, RequestId};
use thiserror::Error;

pub type HarnessResult<T> = Result<T, HarnessError>;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("No live worker is available")]
    WorkerUnavailable,

    #[error("Request {request_id} timed out after {after:?}")]
    Timeout { request_id: RequestId, after: Duration },

    #[error("Worker crashed: {0}")]
    WorkerCrashed(String),

    #[error("Worker failed to start: {0}")]
    WorkerStartup(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Worker reported {kind:?} error: {message}")]
    Worker { kind: ErrorKind, message: String },

    #[error("Image source failed: {0}")]
    Source(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl HarnessError {
    pub fn worker_crashed(msg: impl Into<String>) -> Self {
        Self::WorkerCrashed(msg.into())
    }

    pub fn worker_startup(msg: impl Into<String>) -> Self {
        Self::WorkerStartup(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn source(msg: impl Into<String>) -> Self {
        Self::Source(msg.into())
    }

    /// Check if the caller may retry (after backing off).
    ///
    /// `WorkerUnavailable` is deliberately not retryable so callers fall
    /// back at once instead of piling onto a restarting worker.
    pub fn is_retryable(&self) -> bool {
        match self {
            HarnessError::Timeout { .. } | HarnessError::WorkerCrashed(_) => true,
            HarnessError::Worker { kind, .. } => kind.is_retryable(),
            _ => false,
        }
    }

    /// Short tag used as the fallback reason on a center-fallback focal point.
    pub fn reason(&self) -> &'static str {
        match self {
            HarnessError::WorkerUnavailable => "worker-unavailable",
            HarnessError::Timeout { .. } => "timeout",
            HarnessError::WorkerCrashed(_) => "worker-crashed",
            HarnessError::WorkerStartup(_) => "worker-startup",
            HarnessError::Protocol(_) => "protocol-error",
            HarnessError::Worker { kind: ErrorKind::Decode, .. } => "decode-error",
            HarnessError::Worker { kind: ErrorKind::DetectorInit, .. } => "detector-init-error",
            HarnessError::Worker { kind: ErrorKind::Transient, .. } => "processing-error",
            HarnessError::Source(_) => "source-error",
            HarnessError::Io(_) | HarnessError::Json(_) => "internal-error",
        }
    }
}

impl From<ProcessingError> for HarnessError {
    fn from(err: ProcessingError) -> Self {
        HarnessError::Worker {
            kind: err.kind,
            message: err.message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy() {
        let timeout = HarnessError::Timeout {
            request_id: 4,
            after: Duration::from_secs(20),
        };
        assert!(timeout.is_retryable());
        assert!(HarnessError::worker_crashed("eof").is_retryable());
        assert!(!HarnessError::WorkerUnavailable.is_retryable());

        let decode: HarnessError = ProcessingError::new(ErrorKind::Decode, "bad header").into();
        assert!(!decode.is_retryable());
        assert_eq!(decode.reason(), "decode-error");

        let transient: HarnessError = ProcessingError::new(ErrorKind::Transient, "oom").into();
        assert!(transient.is_retryable());
    }

    #[test]
    fn test_timeout_message_names_request() {
        let err = HarnessError::Timeout {
            request_id: 12,
            after: Duration::from_millis(1500),
        };
        assert_eq!(err.to_string(), "Request 12 timed out after 1.5s");
    }
}
