//! HTTP server: accept loop, per-connection service stack and shutdown.
//!
//! # Responsibilities
//! - Accept connections under the open-connection ceiling
//! - Serve HTTP/1.1 on each admitted connection through the pipeline
//! - Wrap the pipeline with request tracing and response compression
//! - Reap expired pooled downstream connections
//! - Drain open connections on shutdown

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use http::{Request, Response};
use hyper::body::Incoming;
use hyper_util::rt::{TokioIo, TokioTimer};
use hyper_util::service::TowerToHyperService;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tower::{Service, ServiceBuilder};
use tower_http::compression::CompressionLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use crate::config::ServerConfig;
use crate::http::body::CompletionBody;
use crate::http::compression::CompressionPolicy;
use crate::net::{Admission, ConnectionContext, ConnectionGuard, Listener};
use crate::pipeline::{ConnectionAbort, Pipeline, ServerComponents};

/// Adapts the pipeline to a tower service bound to one connection.
#[derive(Clone)]
pub struct PipelineService {
    pipeline: Arc<Pipeline>,
    connection: Arc<ConnectionContext>,
}

impl PipelineService {
    pub fn new(pipeline: Arc<Pipeline>, connection: Arc<ConnectionContext>) -> Self {
        Self { pipeline, connection }
    }
}

impl Service<Request<Incoming>> for PipelineService {
    type Response = Response<CompletionBody>;
    type Error = ConnectionAbort;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request<Incoming>) -> Self::Future {
        let pipeline = Arc::clone(&self.pipeline);
        let connection = Arc::clone(&self.connection);
        Box::pin(async move { pipeline.handle(request.map(Body::new), connection).await })
    }
}

/// The server: one pipeline shared by every connection.
pub struct HttpServer {
    config: ServerConfig,
    pipeline: Arc<Pipeline>,
}

impl HttpServer {
    pub fn new(config: ServerConfig, components: ServerComponents) -> Self {
        let pipeline = Arc::new(Pipeline::new(&config, components));
        Self { config, pipeline }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    /// Serve connections from `listener` until `shutdown` fires, then drain.
    pub async fn run(self, listener: TcpListener, mut shutdown: broadcast::Receiver<()>) -> Result<(), std::io::Error> {
        let listener = Listener::from_tcp(listener, self.config.listener.max_open_connections);
        let local_addr = listener.local_addr()?;
        tracing::info!(address = %local_addr, "HTTP server starting");

        let stop = CancellationToken::new();
        let reaper = spawn_pool_reaper(Arc::clone(&self.pipeline), stop.clone());

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("Shutdown requested, no longer accepting connections");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok(Admission::Admitted { stream, peer_addr, guard }) => {
                        self.spawn_connection(stream, peer_addr, local_addr, guard, stop.child_token());
                    }
                    Ok(Admission::Rejected { .. }) => {
                        if let Some(metrics) = self.pipeline.metrics_listener() {
                            metrics.on_connection_rejected();
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Accept failed");
                    }
                },
            }
        }

        stop.cancel();
        let drain_limit = self.config.timeouts.endpoint() + self.config.timeouts.keep_alive_idle();
        if tokio::time::timeout(drain_limit, listener.tracker().wait_for_drain()).await.is_err() {
            tracing::warn!(
                open_connections = listener.tracker().active_count(),
                "Connections still open after drain period"
            );
        }
        reaper.abort();

        tracing::info!("HTTP server stopped");
        Ok(())
    }

    fn spawn_connection(
        &self,
        stream: TcpStream,
        peer_addr: SocketAddr,
        local_addr: SocketAddr,
        guard: ConnectionGuard,
        stop: CancellationToken,
    ) {
        let connection = Arc::new(ConnectionContext::new(
            guard.id(),
            Some(peer_addr),
            Some(local_addr),
            CancellationToken::new(),
        ));
        let metrics = self.pipeline.metrics_listener().cloned();
        if let Some(metrics) = &metrics {
            metrics.on_connection_opened();
        }

        let lifecycle_level = if self.config.observability.debug_connection_lifecycle_logging {
            Level::DEBUG
        } else {
            Level::TRACE
        };
        log_lifecycle(lifecycle_level, &connection, "Connection opened");

        let service = ServiceBuilder::new()
            .layer(
                TraceLayer::new_for_http()
                    .make_span_with(DefaultMakeSpan::new().level(lifecycle_level))
                    .on_request(DefaultOnRequest::new().level(lifecycle_level))
                    .on_response(DefaultOnResponse::new().level(lifecycle_level)),
            )
            .layer(
                CompressionLayer::new()
                    .compress_when(CompressionPolicy::new(self.config.limits.response_compression_threshold_bytes)),
            )
            .service(PipelineService::new(Arc::clone(&self.pipeline), Arc::clone(&connection)));
        let service = TowerToHyperService::new(service);

        let mut builder = hyper::server::conn::http1::Builder::new();
        builder
            .timer(TokioTimer::new())
            .keep_alive(true)
            .header_read_timeout(self.config.timeouts.keep_alive_idle());

        tokio::spawn(async move {
            let conn = builder.serve_connection(TokioIo::new(stream), service);
            tokio::pin!(conn);
            let mut draining = false;
            loop {
                tokio::select! {
                    result = conn.as_mut() => {
                        if let Err(e) = result {
                            log_lifecycle(lifecycle_level, &connection, &format!("Connection ended with error: {}", e));
                        }
                        break;
                    }
                    _ = stop.cancelled(), if !draining => {
                        draining = true;
                        conn.as_mut().graceful_shutdown();
                    }
                }
            }

            connection.close();
            if let Some(metrics) = &metrics {
                metrics.on_connection_closed();
            }
            log_lifecycle(lifecycle_level, &connection, "Connection closed");
            drop(guard);
        });
    }
}

fn log_lifecycle(level: Level, connection: &ConnectionContext, message: &str) {
    let peer = connection.peer_addr().map(|a| a.to_string()).unwrap_or_default();
    if level == Level::DEBUG {
        tracing::debug!(connection_id = %connection.id(), peer_addr = %peer, "{}", message);
    } else {
        tracing::trace!(connection_id = %connection.id(), peer_addr = %peer, "{}", message);
    }
}

/// Periodically drop pooled downstream connections idle past their timeout.
fn spawn_pool_reaper(pipeline: Arc<Pipeline>, stop: CancellationToken) -> tokio::task::JoinHandle<()> {
    let period = (pipeline.proxy_client().pool().idle_timeout() / 2).max(Duration::from_millis(100));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {
                    pipeline.proxy_client().pool().evict_expired();
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{Endpoint, HandlerEndpoint};
    use crate::http::response::ResponseInfo;
    use crate::routing::Matcher;
    use http::StatusCode;

    #[tokio::test]
    async fn serves_and_stops_on_shutdown() {
        let components = ServerComponents {
            endpoints: vec![Endpoint::direct(HandlerEndpoint::new(
                "hello",
                Matcher::single("/hello").unwrap(),
                |_req, _ctx| async { Ok(ResponseInfo::text(StatusCode::OK, "hi")) },
            ))],
            ..Default::default()
        };
        let server = HttpServer::new(ServerConfig::default(), components);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(server.run(listener, rx));

        let body = reqwest::get(format!("http://{}/hello", addr))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "hi");

        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
