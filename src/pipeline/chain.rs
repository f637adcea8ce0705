//! The assembled pipeline: stage list, error mapping, response filters and sending.

use std::sync::Arc;

use axum::body::Body;
use http::{Request, Response, StatusCode};

use crate::config::ServerConfig;
use crate::endpoint::Endpoint;
use crate::error::{ErrorMapper, PipelineError};
use crate::http::body::CompletionBody;
use crate::http::decompression::PayloadDecompressor;
use crate::http::request::RequestInfo;
use crate::http::response::ResponseInfo;
use crate::net::ConnectionContext;
use crate::observability::access_log::AccessLogger;
use crate::observability::metrics::MetricsListener;
use crate::observability::tracing::{Annotation, LoggingSpanSink, SpanHandle, SpanPolicy, SpanSink, TraceContext};
use crate::pipeline::exchange::Exchange;
use crate::pipeline::execution::ExecutionStage;
use crate::pipeline::filter::{apply_response_filters, FilterHook, FilterStage, RequestAndResponseFilter};
use crate::pipeline::finalizer::{FinalizerHandle, FinalizerSinks, RequestFinalizer};
use crate::pipeline::request_stages::{BodyAssemblyStage, RequestSizeStage, RoutingStage};
use crate::pipeline::sender::{ConnectionAbort, ResponseSender};
use crate::pipeline::stage::{Outcome, PipelineHook, Stage};
use crate::pipeline::work_chain::{SecurityValidationStage, WorkChainStage};
use crate::pipeline::worker_pool::WorkerPool;
use crate::proxy::{DownstreamConnector, ProxyTimeouts, StreamingProxyClient};
use crate::routing::EndpointRegistry;
use crate::security::RequestSecurityValidator;
use crate::validation::ContentValidator;

/// Application-supplied parts of a server.
#[derive(Default)]
pub struct ServerComponents {
    /// Tried in order; the first match wins.
    pub endpoints: Vec<Endpoint>,
    pub filters: Vec<Arc<dyn RequestAndResponseFilter>>,
    pub security_validator: Option<Arc<dyn RequestSecurityValidator>>,
    pub content_validator: Option<Arc<dyn ContentValidator>>,
    pub payload_decompressor: Option<Arc<dyn PayloadDecompressor>>,
    pub metrics_listener: Option<Arc<dyn MetricsListener>>,
    pub access_logger: Option<Arc<dyn AccessLogger>>,
    /// Defaults to logging completed spans.
    pub span_sink: Option<Arc<dyn SpanSink>>,
    /// Defaults to plain TCP.
    pub downstream_connector: Option<Arc<dyn DownstreamConnector>>,
    pub pipeline_hooks: Vec<Arc<dyn PipelineHook>>,
}

/// Runs each request through the stages and produces exactly one response.
pub struct Pipeline {
    stages: Vec<Arc<dyn Stage>>,
    filters: Vec<Arc<dyn RequestAndResponseFilter>>,
    error_mapper: ErrorMapper,
    sender: ResponseSender,
    span_policy: SpanPolicy,
    span_sink: Arc<dyn SpanSink>,
    sinks: FinalizerSinks,
    proxy_client: Arc<StreamingProxyClient>,
    worker_pool: WorkerPool,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.stage_names())
            .field("filters", &self.filters.len())
            .field("worker_pool", &self.worker_pool)
            .finish()
    }
}

impl Pipeline {
    pub fn new(config: &ServerConfig, components: ServerComponents) -> Self {
        let ServerComponents {
            endpoints,
            filters,
            security_validator,
            content_validator,
            payload_decompressor,
            metrics_listener,
            access_logger,
            span_sink,
            downstream_connector,
            pipeline_hooks,
        } = components;

        let global_max = config.limits.max_request_size_bytes;
        let registry = EndpointRegistry::new(endpoints);
        let worker_pool = WorkerPool::new(config.workers.pool_size);
        let proxy_client = Arc::new(StreamingProxyClient::new(
            ProxyTimeouts::from(&config.timeouts),
            downstream_connector,
        ));

        // Head-only stages run before the body is read; last-chunk filters
        // and the work chain need the assembled body.
        let mut stages: Vec<Arc<dyn Stage>> = vec![
            Arc::new(RequestSizeStage::new(&registry, global_max)),
            Arc::new(FilterStage::new(
                "filters.before_security.first_chunk",
                FilterHook::FirstChunk,
                &filters,
                true,
            )),
            Arc::new(RoutingStage::new(registry, global_max)),
            Arc::new(SecurityValidationStage::new(security_validator.clone())),
            Arc::new(FilterStage::new(
                "filters.after_security.first_chunk",
                FilterHook::FirstChunk,
                &filters,
                false,
            )),
            Arc::new(BodyAssemblyStage::new(
                global_max,
                config.timeouts.incomplete_call(),
                payload_decompressor,
            )),
            Arc::new(FilterStage::new(
                "filters.before_security.last_chunk",
                FilterHook::LastChunk,
                &filters,
                true,
            )),
            Arc::new(FilterStage::new(
                "filters.after_security.last_chunk",
                FilterHook::LastChunk,
                &filters,
                false,
            )),
            Arc::new(WorkChainStage::new(
                security_validator,
                content_validator,
                worker_pool.clone(),
            )),
            Arc::new(ExecutionStage::new(
                config.timeouts.endpoint(),
                worker_pool.clone(),
                Arc::clone(&proxy_client),
                global_max,
            )),
        ];
        for hook in &pipeline_hooks {
            hook.on_pipeline_created(&mut stages);
        }

        let pipeline = Self {
            stages,
            filters,
            error_mapper: ErrorMapper::new(),
            sender: ResponseSender::new(),
            span_policy: SpanPolicy::new(config.tracing.clone()),
            span_sink: span_sink.unwrap_or_else(|| Arc::new(LoggingSpanSink)),
            sinks: FinalizerSinks {
                metrics: metrics_listener,
                access_logger,
            },
            proxy_client,
            worker_pool,
        };
        tracing::debug!(stages = ?pipeline.stage_names(), "Pipeline assembled");
        pipeline
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub fn proxy_client(&self) -> &Arc<StreamingProxyClient> {
        &self.proxy_client
    }

    pub fn worker_pool(&self) -> &WorkerPool {
        &self.worker_pool
    }

    pub fn metrics_listener(&self) -> Option<&Arc<dyn MetricsListener>> {
        self.sinks.metrics.as_ref()
    }

    /// Process one request from `connection`.
    ///
    /// Only fails when not even the last-ditch response could be built; the
    /// connection is then closed without a response.
    pub async fn handle(
        &self,
        request: Request<Body>,
        connection: Arc<ConnectionContext>,
    ) -> Result<Response<CompletionBody>, ConnectionAbort> {
        let (parts, body) = request.into_parts();
        let info = RequestInfo::from_parts(&parts);

        let span = SpanHandle::start(
            format!("{} {}", info.method(), info.path()),
            TraceContext::from_headers(&parts.headers),
            self.span_policy.clone(),
            Arc::clone(&self.span_sink),
        );
        span.annotate(Annotation::WireReceiveStart);
        span.tag_http("http.method", info.method().to_string());
        span.tag_http("http.path", info.path().to_string());

        let finalizer = RequestFinalizer::begin(&info, span.clone(), Arc::clone(&connection), self.sinks.clone());
        let mut exchange = Exchange::new(info, body, connection, span, FinalizerHandle::new(finalizer));

        let mut response = match self.run_stages(&mut exchange).await {
            Outcome::Continue => match exchange.response.take() {
                Some(response) => response,
                None => self.error_response(
                    &mut exchange,
                    PipelineError::Unhandled("pipeline finished without a response".into()),
                ),
            },
            Outcome::ShortCircuit(response) => response,
            Outcome::Error(e) => self.error_response(&mut exchange, e),
        };

        apply_response_filters(&self.filters, &mut response, exchange.request());

        let method = exchange.request().method().clone();
        let span = exchange.span.clone();
        self.sender.send(response, &method, &span, &mut exchange.finalizer)
    }

    async fn run_stages(&self, exchange: &mut Exchange) -> Outcome {
        for stage in &self.stages {
            match stage.process(exchange).await {
                Outcome::Continue => continue,
                other => {
                    tracing::trace!(stage = stage.name(), "Stage ended the request early");
                    return other;
                }
            }
        }
        Outcome::Continue
    }

    fn error_response(&self, exchange: &mut Exchange, err: PipelineError) -> ResponseInfo {
        exchange.cancel.cancel();
        if let Some(finalizer) = exchange.finalizer.get() {
            finalizer.record_error(&format!("{}: {}", err.kind(), err));
        }
        exchange.span.tag("error.kind", err.kind());
        self.error_mapper.to_response(&err).unwrap_or_else(|e| {
            tracing::error!(error = %e, "Failed to build error response");
            ResponseInfo::empty(StatusCode::INTERNAL_SERVER_ERROR)
        })
    }
}
