//! Downstream call failures.

use std::time::Duration;

use thiserror::Error;

use crate::error::{PipelineError, TimeoutKind};

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("connecting to {target} failed: {source}")]
    Connect {
        target: String,
        #[source]
        source: std::io::Error,
    },

    #[error("connecting to {target} timed out after {}ms", .after.as_millis())]
    ConnectTimeout { target: String, after: Duration },

    #[error("no TLS connector configured for {target}")]
    TlsUnavailable { target: String },

    #[error("HTTP handshake with {target} failed: {source}")]
    Handshake {
        target: String,
        #[source]
        source: hyper::Error,
    },

    #[error("downstream request failed: {0}")]
    Request(#[source] hyper::Error),

    #[error("request body upload stopped: {0}")]
    Upload(String),

    #[error("downstream idle for more than {}ms", .0.as_millis())]
    IdleTimeout(Duration),

    #[error("invalid downstream request: {0}")]
    InvalidRequest(String),

    #[error("downstream call cancelled")]
    Cancelled,
}

impl From<ProxyError> for PipelineError {
    fn from(err: ProxyError) -> Self {
        match err {
            ProxyError::ConnectTimeout { after, .. } => PipelineError::Timeout {
                kind: TimeoutKind::DownstreamConnect,
                after,
            },
            ProxyError::IdleTimeout(after) => PipelineError::Timeout {
                kind: TimeoutKind::DownstreamIdle,
                after,
            },
            ProxyError::InvalidRequest(msg) => PipelineError::Unhandled(msg),
            other => PipelineError::DownstreamFailure(other.to_string()),
        }
    }
}
