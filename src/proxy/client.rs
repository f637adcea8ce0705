//! Streaming proxy client.
//!
//! # Responsibilities
//! - Reuse or open a connection to the target from the pool
//! - Stream the caller's body downstream with its original framing
//! - Hand back the downstream head and a streaming body as soon as the head arrives
//! - Propagate trace headers and wrap the call in a child span when asked;
//!   the child span ends with the downstream response body
//!
//! # Design Decisions
//! - The outbound request keeps every inbound header except `Host` and the
//!   B3 set, so `Transfer-Encoding`/`Content-Length` pick the same framing
//! - The connection travels with the response body and goes back to the
//!   pool only when both directions finished cleanly

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use http::header::CONNECTION;
use http::{HeaderMap, Request, Version};
use hyper_util::rt::TokioIo;
use tokio_util::sync::CancellationToken;

use crate::config::TimeoutConfig;
use crate::endpoint::{DownstreamRequestFirstChunkInfo, DownstreamResponseHead};
use crate::error::PipelineError;
use crate::observability::tracing::{Annotation, SpanHandle};
use crate::proxy::body::{DownstreamBody, UploadBody, UploadFailure, UploadState};
use crate::proxy::connector::{DownstreamConnector, TcpConnector};
use crate::proxy::error::ProxyError;
use crate::proxy::pool::{ConnectionLease, ConnectionPool, PoolKey, PooledConnection};

/// One call to forward.
pub struct ProxyCall {
    pub target: DownstreamRequestFirstChunkInfo,
    /// The caller's body, still streaming.
    pub body: Body,
    pub max_request_size: Option<usize>,
    /// The request's span.
    pub span: SpanHandle,
    pub cancel: CancellationToken,
}

/// The downstream response, head received and body still streaming.
pub struct DownstreamResponse {
    pub head: DownstreamResponseHead,
    pub body: DownstreamBody,
}

#[derive(Debug, Clone, Copy)]
pub struct ProxyTimeouts {
    pub connect: Duration,
    /// Max idle time between downstream chunks.
    pub idle: Duration,
    /// Max idle time between chunks of the caller's upload.
    pub incomplete_call: Duration,
}

impl From<&TimeoutConfig> for ProxyTimeouts {
    fn from(config: &TimeoutConfig) -> Self {
        Self {
            connect: config.downstream_connect(),
            idle: config.downstream_idle(),
            incomplete_call: config.incomplete_call(),
        }
    }
}

pub struct StreamingProxyClient {
    pool: Arc<ConnectionPool>,
    connector: Arc<dyn DownstreamConnector>,
    timeouts: ProxyTimeouts,
}

impl std::fmt::Debug for StreamingProxyClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingProxyClient")
            .field("pool", &self.pool)
            .field("timeouts", &self.timeouts)
            .finish()
    }
}

impl StreamingProxyClient {
    pub fn new(timeouts: ProxyTimeouts, connector: Option<Arc<dyn DownstreamConnector>>) -> Self {
        Self {
            pool: Arc::new(ConnectionPool::new(timeouts.idle)),
            connector: connector.unwrap_or_else(|| Arc::new(TcpConnector)),
            timeouts,
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    async fn connect(&self, key: &PoolKey, relaxed_tls: bool) -> Result<PooledConnection, ProxyError> {
        let io = tokio::time::timeout(self.timeouts.connect, self.connector.connect(key, relaxed_tls))
            .await
            .map_err(|_| ProxyError::ConnectTimeout {
                target: key.to_string(),
                after: self.timeouts.connect,
            })??;

        let (sender, conn) = hyper::client::conn::http1::handshake::<_, UploadBody>(TokioIo::new(io))
            .await
            .map_err(|source| ProxyError::Handshake {
                target: key.to_string(),
                source,
            })?;

        let id = self.pool.next_connection_id();
        let target = key.to_string();
        let task = tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::debug!(target_addr = %target, connection = id, error = %e, "Downstream connection ended with error");
            }
        });
        tracing::debug!(target_addr = %key, connection = id, "Opened downstream connection");
        Ok(PooledConnection::new(id, sender, task))
    }

    async fn acquire(&self, key: &PoolKey, relaxed_tls: bool) -> Result<PooledConnection, ProxyError> {
        match self.pool.checkout(key).await {
            Some(conn) => Ok(conn),
            None => self.connect(key, relaxed_tls).await,
        }
    }

    /// Forward `call` and return once the downstream response head arrives.
    pub async fn forward(&self, call: ProxyCall) -> Result<DownstreamResponse, PipelineError> {
        let ProxyCall {
            target,
            body,
            max_request_size,
            span,
            cancel,
        } = call;
        let key = PoolKey::new(target.host.clone(), target.port, target.is_https);

        let subspan = target.perform_subspan.then(|| {
            let child = span.child(format!("downstream {} {}", target.first_chunk.method, key));
            child.tag_http("http.method", target.first_chunk.method.to_string());
            child.tag_http("http.url", format!("{}{}", key, target.first_chunk.path_and_query));
            child
        });

        let result = self
            .send(&key, &target, body, max_request_size, &span, subspan.as_ref(), cancel)
            .await;

        // On success the child stays open; the response body closes it.
        if let (Some(child), Err(e)) = (&subspan, &result) {
            child.annotate(Annotation::Error);
            child.tag("error", e.to_string());
            child.complete();
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn send(
        &self,
        key: &PoolKey,
        target: &DownstreamRequestFirstChunkInfo,
        body: Body,
        max_request_size: Option<usize>,
        span: &SpanHandle,
        subspan: Option<&SpanHandle>,
        cancel: CancellationToken,
    ) -> Result<DownstreamResponse, PipelineError> {
        let (method, uri, mut headers) = target.outbound_parts()?;
        if target.add_tracing_headers {
            subspan.unwrap_or(span).context().inject(&mut headers);
        }

        let upload_state = Arc::new(UploadState::new());
        let upload = UploadBody::new(
            body,
            Arc::clone(&upload_state),
            max_request_size,
            self.timeouts.incomplete_call,
            cancel.clone(),
        );

        let mut request = Request::builder()
            .method(method)
            .uri(uri)
            .version(Version::HTTP_11)
            .body(upload)
            .map_err(|e| ProxyError::InvalidRequest(e.to_string()))?;
        *request.headers_mut() = headers;

        let mut conn = tokio::select! {
            conn = self.acquire(key, target.relaxed_https_validation) => conn?,
            _ = cancel.cancelled() => return Err(ProxyError::Cancelled.into()),
        };

        tracing::debug!(
            target_addr = %key,
            connection = conn.id,
            method = %request.method(),
            uri = %request.uri(),
            "Forwarding request downstream"
        );

        let response_future = conn.sender.send_request(request);
        let response = tokio::select! {
            response = response_future => response,
            _ = cancel.cancelled() => return Err(ProxyError::Cancelled.into()),
            err = self.head_idle_timeout(&upload_state) => return Err(err.into()),
        };

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                drop(conn);
                return Err(match upload_state.failure() {
                    Some(UploadFailure::TooLarge(limit)) => PipelineError::request_too_large(limit),
                    Some(UploadFailure::Incomplete(after)) => PipelineError::incomplete_request(after),
                    Some(UploadFailure::Cancelled) => ProxyError::Cancelled.into(),
                    _ => {
                        tracing::warn!(target_addr = %key, error = %e, "Downstream request failed");
                        ProxyError::Request(e).into()
                    }
                });
            }
        };

        let (parts, incoming) = response.into_parts();
        let keep_alive = parts.version == Version::HTTP_11 && !wants_close(&parts.headers);
        let lease = ConnectionLease::new(Arc::clone(&self.pool), key.clone(), conn, upload_state, keep_alive);

        tracing::debug!(target_addr = %key, status = %parts.status, "Downstream response head received");
        if let Some(child) = subspan {
            child.tag_http("http.status_code", parts.status.as_u16().to_string());
            child.annotate(Annotation::DownstreamHeadersReceived);
        }
        Ok(DownstreamResponse {
            head: DownstreamResponseHead {
                status: parts.status,
                headers: parts.headers,
            },
            body: match subspan {
                Some(child) => DownstreamBody::new(incoming, lease, self.timeouts.idle, cancel, child.clone(), true),
                None => DownstreamBody::new(incoming, lease, self.timeouts.idle, cancel, span.clone(), false),
            },
        })
    }

    /// Resolves once neither the upload nor the downstream made progress
    /// for the idle timeout while waiting for the response head.
    async fn head_idle_timeout(&self, upload: &UploadState) -> ProxyError {
        let idle = self.timeouts.idle;
        loop {
            let deadline = upload.last_progress() + idle;
            tokio::time::sleep_until(deadline.into()).await;
            if upload.last_progress() + idle <= std::time::Instant::now() {
                return ProxyError::IdleTimeout(idle);
            }
        }
    }
}

fn wants_close(headers: &HeaderMap) -> bool {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.split(',').any(|token| token.trim().eq_ignore_ascii_case("close")))
}
