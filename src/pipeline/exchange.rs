//! Per-request state carried through the stages.

use std::sync::Arc;

use axum::body::Body;
use tokio_util::sync::CancellationToken;

use crate::http::request::RequestInfo;
use crate::http::response::ResponseInfo;
use crate::net::ConnectionContext;
use crate::observability::tracing::SpanHandle;
use crate::pipeline::finalizer::FinalizerHandle;
use crate::routing::MatchedEndpoint;

/// One request's journey through the pipeline.
///
/// The request is shared with endpoints as an `Arc`; stages that mutate it
/// before execution get a unique copy through [`request_mut`](Self::request_mut),
/// which never clones in practice because nothing else holds it yet.
pub struct Exchange {
    request: Arc<RequestInfo>,
    body: Option<Body>,
    pub endpoint: Option<MatchedEndpoint>,
    /// Set by the execution stage.
    pub response: Option<ResponseInfo>,
    pub connection: Arc<ConnectionContext>,
    pub span: SpanHandle,
    /// Child of the connection's token; cancelled on timeout or failure.
    pub cancel: CancellationToken,
    pub finalizer: FinalizerHandle,
}

impl std::fmt::Debug for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exchange")
            .field("request", &self.request)
            .field("endpoint", &self.endpoint.as_ref().map(|m| m.template.as_str()))
            .field("body_pending", &self.body.is_some())
            .field("connection", &self.connection.id())
            .finish()
    }
}

impl Exchange {
    pub fn new(
        request: RequestInfo,
        body: Body,
        connection: Arc<ConnectionContext>,
        span: SpanHandle,
        finalizer: FinalizerHandle,
    ) -> Self {
        let cancel = connection.cancel_token().child_token();
        Self {
            request: Arc::new(request),
            body: Some(body),
            endpoint: None,
            response: None,
            connection,
            span,
            cancel,
            finalizer,
        }
    }

    pub fn request(&self) -> &RequestInfo {
        &self.request
    }

    pub fn request_mut(&mut self) -> &mut RequestInfo {
        Arc::make_mut(&mut self.request)
    }

    /// A shared handle for endpoints and worker-pool jobs.
    pub fn request_arc(&self) -> Arc<RequestInfo> {
        Arc::clone(&self.request)
    }

    /// Take the unread inbound body. Later calls return `None`.
    pub fn take_body(&mut self) -> Option<Body> {
        self.body.take()
    }

    pub fn has_pending_body(&self) -> bool {
        self.body.is_some()
    }
}
