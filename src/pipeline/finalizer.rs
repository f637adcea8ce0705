//! Single-fire request finalization.
//!
//! Runs last for every request, whichever way it ended: the response body
//! finished, the write failed, or the connection vanished before a response
//! existed. It completes the span, emits the closing metrics event and
//! writes the access log line. A flag guarantees it runs once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use http::{Method, Version};

use crate::http::request::RequestInfo;
use crate::net::ConnectionContext;
use crate::observability::access_log::{AccessLogEntry, AccessLogger};
use crate::observability::metrics::{MetricsListener, RequestMetricsInfo, ServerMetricsEvent};
use crate::observability::tracing::{Annotation, SpanHandle};

/// How the response write ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    WriteFailed,
}

#[derive(Debug, Default)]
struct ResponseRecord {
    status: Option<u16>,
    content_length: Option<u64>,
    error_uid: Option<String>,
    error: Option<String>,
    route: Option<String>,
}

/// Observers notified at finalization.
#[derive(Clone, Default)]
pub struct FinalizerSinks {
    pub metrics: Option<Arc<dyn MetricsListener>>,
    pub access_logger: Option<Arc<dyn AccessLogger>>,
}

/// Per-request finalization state.
pub struct RequestFinalizer {
    fired: AtomicBool,
    started: Instant,
    span: SpanHandle,
    sinks: FinalizerSinks,
    method: Method,
    uri: String,
    path: String,
    version: Version,
    referer: Option<String>,
    user_agent: Option<String>,
    connection: Arc<ConnectionContext>,
    record: Mutex<ResponseRecord>,
}

impl std::fmt::Debug for RequestFinalizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestFinalizer")
            .field("method", &self.method)
            .field("uri", &self.uri)
            .field("fired", &self.has_fired())
            .finish()
    }
}

impl RequestFinalizer {
    /// Create the finalizer and emit `RequestReceived`.
    pub fn begin(
        request: &RequestInfo,
        span: SpanHandle,
        connection: Arc<ConnectionContext>,
        sinks: FinalizerSinks,
    ) -> Arc<Self> {
        let finalizer = Arc::new(Self {
            fired: AtomicBool::new(false),
            started: Instant::now(),
            span,
            sinks,
            method: request.method().clone(),
            uri: request.uri().to_string(),
            path: request.path().to_string(),
            version: request.version(),
            referer: request.header("referer").map(str::to_string),
            user_agent: request.header("user-agent").map(str::to_string),
            connection,
            record: Mutex::new(ResponseRecord::default()),
        });

        if let Some(metrics) = &finalizer.sinks.metrics {
            metrics.on_event(ServerMetricsEvent::RequestReceived, &finalizer.metrics_info(None));
        }
        finalizer
    }

    /// Remember the matched route template.
    pub fn record_route(&self, template: &str) {
        if let Ok(mut record) = self.record.lock() {
            record.route = Some(template.to_string());
        }
    }

    /// Remember the failure that produced the response, for the error annotation.
    pub fn record_error(&self, error: &str) {
        if let Ok(mut record) = self.record.lock() {
            record.error = Some(error.to_string());
        }
    }

    /// Remember what is about to be written.
    pub fn record_response(&self, status: u16, content_length: Option<u64>, error_uid: Option<String>) {
        if let Ok(mut record) = self.record.lock() {
            record.status = Some(status);
            record.content_length = content_length;
            record.error_uid = error_uid;
        }
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    pub fn span(&self) -> &SpanHandle {
        &self.span
    }

    fn metrics_info(&self, record: Option<&ResponseRecord>) -> RequestMetricsInfo {
        RequestMetricsInfo {
            method: self.method.clone(),
            path: self.path.clone(),
            route: record.and_then(|r| r.route.clone()),
            status: record.and_then(|r| r.status),
            elapsed: record.map(|_| self.started.elapsed()),
        }
    }

    /// Finalize the request. Only the first call has any effect.
    pub fn finalize(&self, outcome: SendOutcome) -> bool {
        if self.fired.swap(true, Ordering::AcqRel) {
            return false;
        }

        let record = self
            .record
            .lock()
            .map(|mut r| std::mem::take(&mut *r))
            .unwrap_or_default();
        let elapsed = self.started.elapsed();

        if let Some(status) = record.status {
            self.span.tag_http("http.status_code", status.to_string());
        }
        if let Some(route) = &record.route {
            self.span.tag_http("http.route", route.clone());
        }
        let failed = outcome == SendOutcome::WriteFailed
            || record.error.is_some()
            || record.status.map_or(false, |s| s >= 500);
        if failed {
            self.span.annotate(Annotation::Error);
            let reason = record
                .error
                .clone()
                .unwrap_or_else(|| "response write failed".to_string());
            self.span.tag("error", reason);
        }
        if outcome == SendOutcome::Sent {
            self.span.annotate(Annotation::WireSendFinish);
        }
        self.span.complete();

        if let Some(metrics) = &self.sinks.metrics {
            let event = match outcome {
                SendOutcome::Sent => ServerMetricsEvent::ResponseSent,
                SendOutcome::WriteFailed => ServerMetricsEvent::ResponseWriteFailed,
            };
            metrics.on_event(event, &self.metrics_info(Some(&record)));
        }

        if let Some(logger) = &self.sinks.access_logger {
            logger.log(&AccessLogEntry {
                peer_addr: self.connection.peer_addr(),
                method: self.method.clone(),
                uri: self.uri.clone(),
                version: self.version,
                status: record.status,
                content_length: record.content_length,
                referer: self.referer.clone(),
                user_agent: self.user_agent.clone(),
                trace_id: self.span.context().trace_id.clone(),
                error_uid: record.error_uid.clone(),
                elapsed,
                write_failed: outcome == SendOutcome::WriteFailed,
            });
        }

        tracing::debug!(
            connection_id = %self.connection.id(),
            trace_id = %self.span.context().trace_id,
            status = record.status.unwrap_or_default(),
            outcome = ?outcome,
            elapsed_ms = elapsed.as_millis() as u64,
            "Request finalized"
        );
        true
    }
}

/// Owns a finalizer until the sender hands it to the response body.
///
/// Dropping the handle while it still owns the finalizer means the request
/// ended without a response being handed to the connection, which counts as
/// a failed write.
#[derive(Debug)]
pub struct FinalizerHandle {
    inner: Option<Arc<RequestFinalizer>>,
}

impl FinalizerHandle {
    pub fn new(finalizer: Arc<RequestFinalizer>) -> Self {
        Self {
            inner: Some(finalizer),
        }
    }

    pub fn get(&self) -> Option<&Arc<RequestFinalizer>> {
        self.inner.as_ref()
    }

    /// Transfer ownership, e.g. into the response body.
    pub fn take(&mut self) -> Option<Arc<RequestFinalizer>> {
        self.inner.take()
    }
}

impl Drop for FinalizerHandle {
    fn drop(&mut self) {
        if let Some(finalizer) = self.inner.take() {
            finalizer.finalize(SendOutcome::WriteFailed);
        }
    }
}
