//! Endpoint execution under a deadline.
//!
//! # Responsibilities
//! - Invoke a direct endpoint, or drive a proxy router endpoint's downstream call
//! - Turn panics inside endpoint code into unhandled errors
//! - Enforce the endpoint timeout and cancel everything tied to the request when it fires
//!
//! # Design Decisions
//! - The endpoint future is raced against the deadline; losing drops it, so
//!   a late completion is never observed
//! - For proxied calls the deadline covers the endpoint's own work of picking
//!   the target; the downstream call is bounded by the connect and idle timeouts

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::endpoint::{DirectEndpoint, Endpoint, ExecutionContext, ProxyRouterEndpoint};
use crate::error::{PipelineError, TimeoutKind};
use crate::http::request::RequestInfo;
use crate::http::response::ResponseInfo;
use crate::observability::tracing::Annotation;
use crate::pipeline::exchange::Exchange;
use crate::pipeline::stage::{Outcome, Stage};
use crate::pipeline::worker_pool::WorkerPool;
use crate::proxy::{ProxyCall, StreamingProxyClient};
use crate::resilience::timeouts::with_deadline;

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "endpoint panicked".to_string()
    }
}

/// Await `fut` under `timeout`, catching panics. A timeout cancels `cancel`.
async fn guarded<T, F>(timeout: Duration, cancel: &CancellationToken, fut: F) -> Result<T, PipelineError>
where
    F: Future<Output = Result<T, PipelineError>>,
{
    match with_deadline(TimeoutKind::Endpoint, timeout, AssertUnwindSafe(fut).catch_unwind()).await {
        Ok(Ok(result)) => result,
        Ok(Err(panic)) => {
            let message = panic_message(panic);
            tracing::error!(panic = %message, "Endpoint panicked");
            Err(PipelineError::Unhandled(format!("endpoint panicked: {}", message)))
        }
        Err(timeout) => {
            cancel.cancel();
            Err(timeout)
        }
    }
}

pub struct ExecutionStage {
    default_timeout: Duration,
    worker_pool: WorkerPool,
    proxy_client: Arc<StreamingProxyClient>,
    global_max: usize,
}

impl ExecutionStage {
    pub fn new(
        default_timeout: Duration,
        worker_pool: WorkerPool,
        proxy_client: Arc<StreamingProxyClient>,
        global_max: usize,
    ) -> Self {
        Self {
            default_timeout,
            worker_pool,
            proxy_client,
            global_max,
        }
    }

    fn context(&self, exchange: &Exchange) -> ExecutionContext {
        ExecutionContext {
            worker_pool: self.worker_pool.clone(),
            connection: Arc::clone(&exchange.connection),
            span: exchange.span.clone(),
            cancel: exchange.cancel.clone(),
        }
    }

    async fn execute_direct(
        &self,
        endpoint: &Arc<dyn DirectEndpoint>,
        exchange: &mut Exchange,
        timeout: Duration,
    ) -> Result<ResponseInfo, PipelineError> {
        let request = exchange.request_arc();
        let ctx = self.context(exchange);
        let cancel = exchange.cancel.clone();
        // A panic while building the future must be caught as well as one while polling it.
        let call = std::panic::catch_unwind(AssertUnwindSafe(|| endpoint.execute(request, ctx)))
            .map_err(|panic| PipelineError::Unhandled(format!("endpoint panicked: {}", panic_message(panic))))?;
        guarded(timeout, &cancel, call).await
    }

    async fn execute_proxy(
        &self,
        endpoint: &Arc<dyn ProxyRouterEndpoint>,
        exchange: &mut Exchange,
        timeout: Duration,
        max_request_size: Option<usize>,
    ) -> Result<ResponseInfo, PipelineError> {
        let request: Arc<RequestInfo> = exchange.request_arc();
        let ctx = self.context(exchange);
        let cancel = exchange.cancel.clone();
        let target = guarded(
            timeout,
            &cancel,
            endpoint.downstream_request_first_chunk(Arc::clone(&request), ctx),
        )
        .await?;

        tracing::debug!(
            endpoint = endpoint.name(),
            host = %target.host,
            port = target.port,
            https = target.is_https,
            path = %target.first_chunk.path_and_query,
            "Proxying request downstream"
        );

        let body = exchange.take_body().unwrap_or_else(Body::empty);
        let downstream = self
            .proxy_client
            .forward(ProxyCall {
                target,
                body,
                max_request_size,
                span: exchange.span.clone(),
                cancel,
            })
            .await?;

        let mut head = downstream.head;
        endpoint.handle_downstream_response_first_chunk(&mut head, &request)?;
        Ok(ResponseInfo::proxied(head.status, head.headers, Body::new(downstream.body)))
    }
}

impl Stage for ExecutionStage {
    fn name(&self) -> &'static str {
        "execution"
    }

    fn process<'a>(&'a self, exchange: &'a mut Exchange) -> BoxFuture<'a, Outcome> {
        Box::pin(async move {
            let Some(endpoint) = exchange.endpoint.as_ref().map(|m| m.endpoint.clone()) else {
                return Outcome::Error(PipelineError::Unhandled("execution ran before routing".into()));
            };
            let timeout = endpoint.timeout_override().unwrap_or(self.default_timeout);

            exchange.span.annotate(Annotation::EndpointStart);
            let result = match &endpoint {
                Endpoint::Direct(direct) => self.execute_direct(direct, exchange, timeout).await,
                Endpoint::ProxyRouter(proxy) => {
                    let max = endpoint.effective_max_request_size(self.global_max);
                    self.execute_proxy(proxy, exchange, timeout, max).await
                }
            };
            exchange.span.annotate(Annotation::EndpointFinish);

            match result {
                Ok(response) => {
                    exchange.response = Some(response);
                    Outcome::Continue
                }
                Err(e) => Outcome::Error(e),
            }
        })
    }
}
