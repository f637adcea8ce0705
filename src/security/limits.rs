//! Request body size limits.
//!
//! # Responsibilities
//! - Reject a declared `Content-Length` above the limit before reading the body
//! - Reject an accumulating body as soon as it crosses the limit
//!
//! # Design Decisions
//! - A limit of 0 disables checking
//! - Before routing, the ceiling is the largest limit any endpoint accepts;
//!   after routing, the matched endpoint's own limit applies
//! - Oversized bodies are malformed requests (400), matching decode failures

use crate::error::PipelineError;
use crate::http::request::RequestInfo;

/// Body size limit in bytes; `None` is unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestSizeLimit(Option<usize>);

impl RequestSizeLimit {
    pub const UNLIMITED: RequestSizeLimit = RequestSizeLimit(None);

    pub fn new(limit: Option<usize>) -> Self {
        Self(limit.filter(|l| *l > 0))
    }

    /// Interpret a configured byte count where 0 disables the limit.
    pub fn from_bytes(bytes: usize) -> Self {
        Self::new(Some(bytes))
    }

    pub fn bytes(&self) -> Option<usize> {
        self.0
    }

    /// Check the declared length, if any.
    pub fn check_declared(&self, request: &RequestInfo) -> Result<(), PipelineError> {
        let Some(limit) = self.0 else {
            return Ok(());
        };
        match request.content_length()? {
            Some(declared) if declared > limit as u64 => {
                tracing::debug!(
                    declared = declared,
                    limit = limit,
                    path = %request.path(),
                    "Request rejected, declared body too large"
                );
                Err(PipelineError::request_too_large(limit))
            }
            _ => Ok(()),
        }
    }

    /// Check a running byte count.
    pub fn check_accumulated(&self, received: usize) -> Result<(), PipelineError> {
        match self.0 {
            Some(limit) if received > limit => Err(PipelineError::request_too_large(limit)),
            _ => Ok(()),
        }
    }
}
