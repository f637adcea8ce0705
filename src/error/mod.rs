//! Error taxonomy for the request pipeline.
//!
//! # Data Flow
//! ```text
//! Any stage failure
//!     → PipelineError (closed set of kinds)
//!     → contract.rs (ErrorMapper: kind → status + ApiError list)
//!     → ErrorResponseBody {error_id, errors[]} serialized as JSON
//!     → response filters → sender → finalizer
//! ```
//!
//! # Design Decisions
//! - Every variant maps to exactly one HTTP status
//! - Errors never escape a connection task; they become responses
//! - `ResponseSendFailure` is the only kind that may end in a silent close

pub mod contract;

use std::collections::BTreeMap;
use std::time::Duration;

use thiserror::Error;

pub use contract::{ApiError, ErrorMapper, ErrorResponseBody, ErrorEntry, ERROR_UID_HEADER};

/// Free-form metadata attached to an error entry.
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Message used when a request stalls before its last chunk arrives.
pub const INCOMPLETE_REQUEST_CAUSE: &str = "Unfinished/invalid HTTP request";

/// Message used when a request body exceeds the configured limit.
pub const REQUEST_TOO_LARGE_CAUSE: &str = "The request exceeded the maximum payload size allowed";

/// One violated validation constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldViolation {
    /// Dotted path of the offending field.
    pub field: String,
    /// Machine-readable constraint code, e.g. `NOT_BLANK`.
    pub code: String,
    /// Human-readable explanation.
    pub message: String,
}

impl FieldViolation {
    pub fn new(field: impl Into<String>, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            code: code.into(),
            message: message.into(),
        }
    }
}

/// What was being waited on when a deadline expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// The endpoint's future did not complete in time.
    Endpoint,
    /// No TCP connection to the downstream target could be made in time.
    DownstreamConnect,
    /// The downstream connection was idle for too long mid-call.
    DownstreamIdle,
}

impl std::fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeoutKind::Endpoint => write!(f, "endpoint execution"),
            TimeoutKind::DownstreamConnect => write!(f, "downstream connect"),
            TimeoutKind::DownstreamIdle => write!(f, "downstream call"),
        }
    }
}

/// Every way a request can fail inside the pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Undecodable request, stalled upload, oversized body or bad content.
    #[error("malformed request: {cause}")]
    MalformedRequest { cause: String, metadata: Metadata },

    /// Rejected by the security validator.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Authenticated but not permitted.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Content failed validation; one entry per violated field.
    #[error("invalid content: {} violation(s)", .0.len())]
    InvalidContent(Vec<FieldViolation>),

    /// The endpoint requires a body and none was sent.
    #[error("missing expected content")]
    MissingContent,

    /// No endpoint matched the path.
    #[error("no endpoint matches path {path}")]
    NotFound { path: String },

    /// An endpoint matched the path but not the method.
    #[error("method {method} not allowed for path {path}")]
    MethodNotAllowed { method: String, path: String },

    /// A deadline expired.
    #[error("{kind} timed out after {}ms", .after.as_millis())]
    Timeout { kind: TimeoutKind, after: Duration },

    /// I/O or protocol failure while talking to the downstream target.
    #[error("downstream call failed: {0}")]
    DownstreamFailure(String),

    /// The response could not be serialized or written.
    #[error("response could not be sent: {0}")]
    ResponseSendFailure(String),

    /// Anything else, including panics inside endpoints.
    #[error("unhandled error: {0}")]
    Unhandled(String),
}

impl PipelineError {
    /// Malformed request with a `cause` metadata entry.
    pub fn malformed(cause: impl Into<String>) -> Self {
        let cause = cause.into();
        let mut metadata = Metadata::new();
        metadata.insert("cause".into(), serde_json::Value::String(cause.clone()));
        PipelineError::MalformedRequest { cause, metadata }
    }

    /// Attach a metadata entry. Only malformed-request errors carry metadata.
    pub fn with_metadata(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        if let PipelineError::MalformedRequest { metadata, .. } = &mut self {
            metadata.insert(key.to_string(), value.into());
        }
        self
    }

    /// The request stalled before its final chunk arrived.
    pub fn incomplete_request(timeout: Duration) -> Self {
        Self::malformed(INCOMPLETE_REQUEST_CAUSE)
            .with_metadata("incomplete_http_call_timeout_millis", timeout.as_millis() as u64)
    }

    /// The request body is larger than the effective limit.
    pub fn request_too_large(limit: usize) -> Self {
        Self::malformed(REQUEST_TOO_LARGE_CAUSE).with_metadata("max_request_size_bytes", limit as u64)
    }

    /// Short label used for metrics and span tags.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::MalformedRequest { .. } => "malformed_request",
            PipelineError::Unauthorized(_) => "unauthorized",
            PipelineError::Forbidden(_) => "forbidden",
            PipelineError::InvalidContent(_) => "invalid_content",
            PipelineError::MissingContent => "missing_content",
            PipelineError::NotFound { .. } => "not_found",
            PipelineError::MethodNotAllowed { .. } => "method_not_allowed",
            PipelineError::Timeout { .. } => "timeout",
            PipelineError::DownstreamFailure(_) => "downstream_failure",
            PipelineError::ResponseSendFailure(_) => "response_send_failure",
            PipelineError::Unhandled(_) => "unhandled",
        }
    }
}

/// Result alias for pipeline operations.
pub type PipelineResult<T> = Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_carries_cause_metadata() {
        let err = PipelineError::malformed("bad json");
        match err {
            PipelineError::MalformedRequest { cause, metadata } => {
                assert_eq!(cause, "bad json");
                assert_eq!(metadata["cause"], "bad json");
            }
            other => panic!("unexpected variant {:?}", other),
        }
    }

    #[test]
    fn incomplete_request_records_timeout() {
        let err = PipelineError::incomplete_request(Duration::from_millis(250));
        let PipelineError::MalformedRequest { cause, metadata } = err else {
            panic!("expected malformed request");
        };
        assert_eq!(cause, INCOMPLETE_REQUEST_CAUSE);
        assert_eq!(metadata["incomplete_http_call_timeout_millis"], 250);
    }

    #[test]
    fn error_display() {
        let err = PipelineError::Timeout {
            kind: TimeoutKind::Endpoint,
            after: Duration::from_millis(1500),
        };
        assert_eq!(err.to_string(), "endpoint execution timed out after 1500ms");

        let err = PipelineError::InvalidContent(vec![
            FieldViolation::new("name", "NOT_BLANK", "name is required"),
            FieldViolation::new("age", "MIN", "age must be positive"),
        ]);
        assert!(err.to_string().contains("2 violation"));
    }
}
