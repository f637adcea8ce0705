//! Application endpoints.
//!
//! # Data Flow
//! ```text
//! EndpointRegistry (ordered) → Matcher → Endpoint
//!     Direct      → execute() → ResponseInfo
//!     ProxyRouter → downstream_request_first_chunk() → proxy client
//!                 → handle_downstream_response_first_chunk() → relayed response
//! ```
//!
//! # Design Decisions
//! - `Endpoint` is a closed sum type; the pipeline matches on it instead of
//!   probing a class hierarchy
//! - Endpoint futures borrow the endpoint; the pipeline holds the `Arc` for
//!   as long as the future lives
//! - Everything an endpoint may need from the server arrives through
//!   [`ExecutionContext`], never through ambient state

pub mod downstream;
pub mod proxy_route;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::error::PipelineError;
use crate::http::request::RequestInfo;
use crate::http::response::ResponseInfo;
use crate::net::ConnectionContext;
use crate::observability::tracing::SpanHandle;
use crate::pipeline::worker_pool::WorkerPool;
use crate::routing::matcher::Matcher;
use crate::validation::ContentDeserializer;

pub use downstream::{DownstreamRequestFirstChunkInfo, DownstreamRequestHead, DownstreamResponseHead};
pub use proxy_route::SimpleProxyRouterEndpoint;

/// Handed to every endpoint invocation.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub worker_pool: WorkerPool,
    pub connection: Arc<ConnectionContext>,
    /// The request's span; child spans for outbound calls hang off it.
    pub span: SpanHandle,
    /// Cancelled when the endpoint times out or the connection closes.
    pub cancel: CancellationToken,
}

/// Behaviour shared by both endpoint kinds.
pub trait EndpointBase: Send + Sync {
    fn matcher(&self) -> &Matcher;

    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Per-endpoint body limit; `Some(0)` lifts the limit for this endpoint.
    fn max_request_size_override(&self) -> Option<usize> {
        None
    }

    fn timeout_override(&self) -> Option<Duration> {
        None
    }
}

/// An endpoint that produces the response itself.
pub trait DirectEndpoint: EndpointBase {
    fn execute<'a>(
        &'a self,
        request: Arc<RequestInfo>,
        ctx: ExecutionContext,
    ) -> BoxFuture<'a, Result<ResponseInfo, PipelineError>>;

    /// `None` keeps the body raw.
    fn content_deserializer(&self) -> Option<Arc<dyn ContentDeserializer>> {
        None
    }

    /// Run the pre-execution work chain on the worker pool.
    fn should_validate_asynchronously(&self) -> bool {
        false
    }

    /// Reject empty bodies with a missing-content error.
    fn requires_content(&self) -> bool {
        false
    }

    fn is_decompress_payload_allowed(&self) -> bool {
        true
    }

    /// Whether the content validator runs for this endpoint.
    fn validate_content(&self) -> bool {
        true
    }
}

/// An endpoint that forwards the request to another service.
pub trait ProxyRouterEndpoint: EndpointBase {
    fn downstream_request_first_chunk<'a>(
        &'a self,
        request: Arc<RequestInfo>,
        ctx: ExecutionContext,
    ) -> BoxFuture<'a, Result<DownstreamRequestFirstChunkInfo, PipelineError>>;

    /// Rewrite the downstream response head before it is relayed.
    fn handle_downstream_response_first_chunk(
        &self,
        _response: &mut DownstreamResponseHead,
        _request: &RequestInfo,
    ) -> Result<(), PipelineError> {
        Ok(())
    }
}

/// A registered endpoint.
#[derive(Clone)]
pub enum Endpoint {
    Direct(Arc<dyn DirectEndpoint>),
    ProxyRouter(Arc<dyn ProxyRouterEndpoint>),
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = if self.is_proxy() { "ProxyRouter" } else { "Direct" };
        f.debug_struct("Endpoint")
            .field("kind", &kind)
            .field("name", &self.name())
            .field("matcher", self.matcher())
            .finish()
    }
}

impl Endpoint {
    pub fn direct(endpoint: impl DirectEndpoint + 'static) -> Self {
        Endpoint::Direct(Arc::new(endpoint))
    }

    pub fn proxy(endpoint: impl ProxyRouterEndpoint + 'static) -> Self {
        Endpoint::ProxyRouter(Arc::new(endpoint))
    }

    pub fn is_proxy(&self) -> bool {
        matches!(self, Endpoint::ProxyRouter(_))
    }

    pub fn matcher(&self) -> &Matcher {
        match self {
            Endpoint::Direct(e) => e.matcher(),
            Endpoint::ProxyRouter(e) => e.matcher(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Endpoint::Direct(e) => e.name(),
            Endpoint::ProxyRouter(e) => e.name(),
        }
    }

    pub fn max_request_size_override(&self) -> Option<usize> {
        match self {
            Endpoint::Direct(e) => e.max_request_size_override(),
            Endpoint::ProxyRouter(e) => e.max_request_size_override(),
        }
    }

    pub fn timeout_override(&self) -> Option<Duration> {
        match self {
            Endpoint::Direct(e) => e.timeout_override(),
            Endpoint::ProxyRouter(e) => e.timeout_override(),
        }
    }

    /// Body limit after applying the override; `None` means unlimited.
    pub fn effective_max_request_size(&self, global: usize) -> Option<usize> {
        let limit = self.max_request_size_override().unwrap_or(global);
        (limit > 0).then_some(limit)
    }
}

/// A direct endpoint built from an async closure.
pub struct HandlerEndpoint<F> {
    name: String,
    matcher: Matcher,
    handler: F,
    deserializer: Option<Arc<dyn ContentDeserializer>>,
    validate_asynchronously: bool,
    requires_content: bool,
    decompress_allowed: bool,
    max_request_size: Option<usize>,
    timeout: Option<Duration>,
}

impl<F, Fut> HandlerEndpoint<F>
where
    F: Fn(Arc<RequestInfo>, ExecutionContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ResponseInfo, PipelineError>> + Send + 'static,
{
    pub fn new(name: impl Into<String>, matcher: Matcher, handler: F) -> Self {
        Self {
            name: name.into(),
            matcher,
            handler,
            deserializer: None,
            validate_asynchronously: false,
            requires_content: false,
            decompress_allowed: true,
            max_request_size: None,
            timeout: None,
        }
    }

    pub fn with_deserializer(mut self, deserializer: impl ContentDeserializer + 'static) -> Self {
        self.deserializer = Some(Arc::new(deserializer));
        self
    }

    pub fn validate_asynchronously(mut self) -> Self {
        self.validate_asynchronously = true;
        self
    }

    pub fn requiring_content(mut self) -> Self {
        self.requires_content = true;
        self
    }

    pub fn without_decompression(mut self) -> Self {
        self.decompress_allowed = false;
        self
    }

    pub fn with_max_request_size(mut self, bytes: usize) -> Self {
        self.max_request_size = Some(bytes);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl<F, Fut> EndpointBase for HandlerEndpoint<F>
where
    F: Fn(Arc<RequestInfo>, ExecutionContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ResponseInfo, PipelineError>> + Send + 'static,
{
    fn matcher(&self) -> &Matcher {
        &self.matcher
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn max_request_size_override(&self) -> Option<usize> {
        self.max_request_size
    }

    fn timeout_override(&self) -> Option<Duration> {
        self.timeout
    }
}

impl<F, Fut> DirectEndpoint for HandlerEndpoint<F>
where
    F: Fn(Arc<RequestInfo>, ExecutionContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ResponseInfo, PipelineError>> + Send + 'static,
{
    fn execute<'a>(
        &'a self,
        request: Arc<RequestInfo>,
        ctx: ExecutionContext,
    ) -> BoxFuture<'a, Result<ResponseInfo, PipelineError>> {
        Box::pin((self.handler)(request, ctx))
    }

    fn content_deserializer(&self) -> Option<Arc<dyn ContentDeserializer>> {
        self.deserializer.clone()
    }

    fn should_validate_asynchronously(&self) -> bool {
        self.validate_asynchronously
    }

    fn requires_content(&self) -> bool {
        self.requires_content
    }

    fn is_decompress_payload_allowed(&self) -> bool {
        self.decompress_allowed
    }
}
