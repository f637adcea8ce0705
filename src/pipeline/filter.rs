//! Request and response filters.
//!
//! # Responsibilities
//! - Let application code inspect or rewrite the request at its first and last chunk
//! - Let a filter answer the request itself, skipping routing-dependent work
//! - Let every filter adjust the outgoing response
//!
//! # Design Decisions
//! - Filters are split into a before-security and an after-security group,
//!   each kept in registration order
//! - Response hooks run in reverse registration order, for every response,
//!   including short-circuited and error responses
//! - A failing hook is logged and skipped; the request and its response carry on

use std::sync::Arc;

use futures_util::future::BoxFuture;

use crate::error::PipelineError;
use crate::http::request::RequestInfo;
use crate::http::response::ResponseInfo;
use crate::pipeline::exchange::Exchange;
use crate::pipeline::stage::{Outcome, Stage};

/// What a request hook decided.
#[derive(Debug)]
pub enum FilterAction {
    Continue,
    /// Answer now; later filters and the endpoint do not run.
    ShortCircuit(ResponseInfo),
}

/// Application hook around every request.
pub trait RequestAndResponseFilter: Send + Sync {
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// False places the filter's request hooks after security validation.
    fn should_execute_before_security_validation(&self) -> bool {
        true
    }

    fn filter_request_first_chunk(&self, _request: &mut RequestInfo) -> Result<FilterAction, PipelineError> {
        Ok(FilterAction::Continue)
    }

    /// Runs once the full body is assembled. Never runs for proxied requests.
    fn filter_request_last_chunk(&self, _request: &mut RequestInfo) -> Result<FilterAction, PipelineError> {
        Ok(FilterAction::Continue)
    }

    fn filter_response(&self, _response: &mut ResponseInfo, _request: &RequestInfo) -> Result<(), PipelineError> {
        Ok(())
    }
}

/// Which request hook a [`FilterStage`] invokes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterHook {
    FirstChunk,
    LastChunk,
}

/// Runs one request hook of one filter group.
pub struct FilterStage {
    name: &'static str,
    hook: FilterHook,
    filters: Vec<Arc<dyn RequestAndResponseFilter>>,
}

impl FilterStage {
    /// The filters of `all` whose group matches `before_security`, in registration order.
    pub fn new(
        name: &'static str,
        hook: FilterHook,
        all: &[Arc<dyn RequestAndResponseFilter>],
        before_security: bool,
    ) -> Self {
        let filters = all
            .iter()
            .filter(|f| f.should_execute_before_security_validation() == before_security)
            .cloned()
            .collect();
        Self { name, hook, filters }
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

impl Stage for FilterStage {
    fn name(&self) -> &'static str {
        self.name
    }

    fn process<'a>(&'a self, exchange: &'a mut Exchange) -> BoxFuture<'a, Outcome> {
        Box::pin(async move {
            if self.filters.is_empty() {
                return Outcome::Continue;
            }
            // Last-chunk hooks need an assembled body, which proxied requests never have.
            if self.hook == FilterHook::LastChunk && !exchange.request().is_complete_request_with_all_chunks() {
                return Outcome::Continue;
            }

            for filter in &self.filters {
                let request = exchange.request_mut();
                let result = match self.hook {
                    FilterHook::FirstChunk => filter.filter_request_first_chunk(request),
                    FilterHook::LastChunk => filter.filter_request_last_chunk(request),
                };
                match result {
                    Ok(FilterAction::Continue) => {}
                    Ok(FilterAction::ShortCircuit(response)) => {
                        tracing::debug!(
                            filter = filter.name(),
                            hook = ?self.hook,
                            status = %response.status(),
                            "Filter short-circuited the request"
                        );
                        return Outcome::ShortCircuit(response);
                    }
                    Err(e) => {
                        tracing::error!(
                            filter = filter.name(),
                            hook = ?self.hook,
                            error = %e,
                            "Request filter failed, ignoring"
                        );
                    }
                }
            }
            Outcome::Continue
        })
    }
}

/// Run every response hook, last registered first.
pub fn apply_response_filters(
    filters: &[Arc<dyn RequestAndResponseFilter>],
    response: &mut ResponseInfo,
    request: &RequestInfo,
) {
    for filter in filters.iter().rev() {
        if let Err(e) = filter.filter_response(response, request) {
            tracing::error!(filter = filter.name(), error = %e, "Response filter failed, ignoring");
        }
    }
}
