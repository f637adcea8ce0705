//! Endpoint lookup.
//!
//! # Responsibilities
//! - Store endpoints in registration order
//! - Resolve a request to one endpoint plus its path params
//! - Distinguish "no such path" (404) from "path exists, wrong method" (405)
//!
//! # Design Decisions
//! - Immutable after construction (thread-safe without locks)
//! - O(n) scan in registration order; the first endpoint that matches wins
//! - Explicit NoMatch rather than silent default

use std::collections::HashMap;

use crate::endpoint::Endpoint;
use crate::error::PipelineError;
use crate::http::request::RequestInfo;
use crate::routing::matcher::MatchResult;

/// An endpoint selected for a request.
#[derive(Debug, Clone)]
pub struct MatchedEndpoint {
    pub endpoint: Endpoint,
    pub template: String,
    pub params: HashMap<String, String>,
}

/// Ordered endpoint list.
#[derive(Debug, Clone, Default)]
pub struct EndpointRegistry {
    endpoints: Vec<Endpoint>,
}

impl EndpointRegistry {
    pub fn new(endpoints: Vec<Endpoint>) -> Self {
        for endpoint in &endpoints {
            tracing::debug!(
                endpoint = %endpoint.name(),
                templates = ?endpoint.matcher().templates().iter().map(|t| t.as_str()).collect::<Vec<_>>(),
                proxy = endpoint.is_proxy(),
                "Endpoint registered"
            );
        }
        Self { endpoints }
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    /// Resolve the endpoint for `request`.
    pub fn route(&self, request: &RequestInfo) -> Result<MatchedEndpoint, PipelineError> {
        let mut method_mismatch = false;

        for endpoint in &self.endpoints {
            match endpoint.matcher().matches(request) {
                MatchResult::Matched { template, params } => {
                    return Ok(MatchedEndpoint {
                        endpoint: endpoint.clone(),
                        template,
                        params,
                    });
                }
                MatchResult::MethodMismatch => method_mismatch = true,
                MatchResult::NoMatch => {}
            }
        }

        if method_mismatch {
            Err(PipelineError::MethodNotAllowed {
                method: request.method().to_string(),
                path: request.path().to_string(),
            })
        } else {
            Err(PipelineError::NotFound {
                path: request.path().to_string(),
            })
        }
    }

    /// Largest body any endpoint accepts, used before routing has run.
    /// `None` when some endpoint, or the global setting, is unlimited.
    pub fn max_request_size_ceiling(&self, global: usize) -> Option<usize> {
        if self.endpoints.is_empty() {
            return (global > 0).then_some(global);
        }
        self.endpoints
            .iter()
            .map(|e| e.effective_max_request_size(global))
            .try_fold(0usize, |max, limit| limit.map(|l| max.max(l)))
    }
}
