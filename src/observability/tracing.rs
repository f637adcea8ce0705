//! Distributed tracing support.
//!
//! # Responsibilities
//! - Extract trace context from incoming B3 headers
//! - Propagate trace context to downstream requests
//! - Record one span per request and optional child spans per downstream call
//!
//! # Design Decisions
//! - Context is passed explicitly; there is no thread-local span stack
//! - A span completes exactly once and is handed to a [`SpanSink`]
//! - The default sink logs completed spans through `tracing`

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use http::{HeaderMap, HeaderValue};

use crate::config::TracingConfig;

pub const TRACE_ID_HEADER: &str = "x-b3-traceid";
pub const SPAN_ID_HEADER: &str = "x-b3-spanid";
pub const PARENT_SPAN_ID_HEADER: &str = "x-b3-parentspanid";
pub const SAMPLED_HEADER: &str = "x-b3-sampled";

/// All propagation header names.
pub const PROPAGATION_HEADERS: [&str; 4] = [
    TRACE_ID_HEADER,
    SPAN_ID_HEADER,
    PARENT_SPAN_ID_HEADER,
    SAMPLED_HEADER,
];

fn new_id() -> String {
    format!("{:016x}", rand::random::<u64>())
}

/// Identity of one span within a trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: Option<String>,
    pub sampled: bool,
}

impl TraceContext {
    /// Start a new trace.
    pub fn new_root() -> Self {
        Self {
            trace_id: new_id(),
            span_id: new_id(),
            parent_span_id: None,
            sampled: true,
        }
    }

    /// A child of this span in the same trace.
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            span_id: new_id(),
            parent_span_id: Some(self.span_id.clone()),
            sampled: self.sampled,
        }
    }

    /// Continue the caller's trace when B3 headers are present, otherwise start a new one.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };

        match (header(TRACE_ID_HEADER), header(SPAN_ID_HEADER)) {
            (Some(trace_id), Some(span_id)) => {
                let sampled = header(SAMPLED_HEADER)
                    .map(|v| v != "0" && !v.eq_ignore_ascii_case("false"))
                    .unwrap_or(true);
                TraceContext {
                    trace_id: trace_id.to_string(),
                    span_id: span_id.to_string(),
                    parent_span_id: None,
                    sampled,
                }
                .child()
            }
            (Some(trace_id), None) => TraceContext {
                trace_id: trace_id.to_string(),
                ..TraceContext::new_root()
            },
            _ => TraceContext::new_root(),
        }
    }

    /// Replace any propagation headers in `headers` with this context's.
    pub fn inject(&self, headers: &mut HeaderMap) {
        for name in PROPAGATION_HEADERS {
            headers.remove(name);
        }
        let mut put = |name: &'static str, value: &str| {
            if let Ok(v) = HeaderValue::from_str(value) {
                headers.insert(name, v);
            }
        };
        put(TRACE_ID_HEADER, &self.trace_id);
        put(SPAN_ID_HEADER, &self.span_id);
        if let Some(parent) = &self.parent_span_id {
            put(PARENT_SPAN_ID_HEADER, parent);
        }
        put(SAMPLED_HEADER, if self.sampled { "1" } else { "0" });
    }
}

/// Lifecycle points a span may be annotated at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Annotation {
    WireReceiveStart,
    WireReceiveFinish,
    EndpointStart,
    EndpointFinish,
    WireSendStart,
    WireSendFinish,
    DownstreamHeadersReceived,
    DownstreamComplete,
    Error,
}

impl Annotation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Annotation::WireReceiveStart => "wr.start",
            Annotation::WireReceiveFinish => "wr.finish",
            Annotation::EndpointStart => "endpoint.start",
            Annotation::EndpointFinish => "endpoint.finish",
            Annotation::WireSendStart => "ws.start",
            Annotation::WireSendFinish => "ws.finish",
            Annotation::DownstreamHeadersReceived => "downstream.headers",
            Annotation::DownstreamComplete => "downstream.complete",
            Annotation::Error => "error",
        }
    }
}

/// Decides which annotations and tags are recorded.
#[derive(Debug, Clone)]
pub struct SpanPolicy {
    config: TracingConfig,
}

impl SpanPolicy {
    pub fn new(config: TracingConfig) -> Self {
        Self { config }
    }

    pub fn records(&self, annotation: Annotation) -> bool {
        match annotation {
            Annotation::WireReceiveStart | Annotation::WireReceiveFinish => {
                self.config.annotate_wire_receive
            }
            Annotation::EndpointStart | Annotation::EndpointFinish => self.config.annotate_endpoint,
            Annotation::WireSendStart | Annotation::WireSendFinish => self.config.annotate_wire_send,
            Annotation::Error => self.config.annotate_errors,
            Annotation::DownstreamHeadersReceived | Annotation::DownstreamComplete => true,
        }
    }

    pub fn tags_http(&self) -> bool {
        self.config.tag_http
    }
}

impl Default for SpanPolicy {
    fn default() -> Self {
        Self::new(TracingConfig::default())
    }
}

/// A span after completion, as delivered to a sink.
#[derive(Debug, Clone)]
pub struct CompletedSpan {
    pub name: String,
    pub context: TraceContext,
    pub start_epoch_micros: u64,
    pub duration: Duration,
    pub annotations: Vec<(String, Duration)>,
    pub tags: BTreeMap<String, String>,
}

/// Receives each completed span exactly once.
pub trait SpanSink: Send + Sync {
    fn span_completed(&self, span: CompletedSpan);
}

/// Logs completed spans.
#[derive(Debug, Default)]
pub struct LoggingSpanSink;

impl SpanSink for LoggingSpanSink {
    fn span_completed(&self, span: CompletedSpan) {
        if !span.context.sampled {
            return;
        }
        let annotations = span
            .annotations
            .iter()
            .map(|(name, at)| format!("{}@{}us", name, at.as_micros()))
            .collect::<Vec<_>>()
            .join(",");
        tracing::debug!(
            target: "sluice::span",
            name = %span.name,
            trace_id = %span.context.trace_id,
            span_id = %span.context.span_id,
            parent_span_id = span.context.parent_span_id.as_deref().unwrap_or("-"),
            duration_us = span.duration.as_micros() as u64,
            annotations = %annotations,
            tags = ?span.tags,
            "Span completed"
        );
    }
}

struct SpanRecord {
    name: String,
    annotations: Vec<(String, Duration)>,
    tags: BTreeMap<String, String>,
}

struct SpanInner {
    context: TraceContext,
    started: Instant,
    start_epoch_micros: u64,
    record: Mutex<SpanRecord>,
    completed: AtomicBool,
    policy: SpanPolicy,
    sink: Arc<dyn SpanSink>,
}

/// Shared handle to an in-flight span.
#[derive(Clone)]
pub struct SpanHandle {
    inner: Arc<SpanInner>,
}

impl std::fmt::Debug for SpanHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpanHandle")
            .field("context", &self.inner.context)
            .field("completed", &self.is_completed())
            .finish()
    }
}

impl SpanHandle {
    pub fn start(
        name: impl Into<String>,
        context: TraceContext,
        policy: SpanPolicy,
        sink: Arc<dyn SpanSink>,
    ) -> Self {
        let start_epoch_micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or_default();
        Self {
            inner: Arc::new(SpanInner {
                context,
                started: Instant::now(),
                start_epoch_micros,
                record: Mutex::new(SpanRecord {
                    name: name.into(),
                    annotations: Vec::new(),
                    tags: BTreeMap::new(),
                }),
                completed: AtomicBool::new(false),
                policy,
                sink,
            }),
        }
    }

    /// Open a child span that reports to the same sink.
    pub fn child(&self, name: impl Into<String>) -> SpanHandle {
        SpanHandle::start(
            name,
            self.inner.context.child(),
            self.inner.policy.clone(),
            Arc::clone(&self.inner.sink),
        )
    }

    pub fn context(&self) -> &TraceContext {
        &self.inner.context
    }

    pub fn policy(&self) -> &SpanPolicy {
        &self.inner.policy
    }

    pub fn annotate(&self, annotation: Annotation) {
        if !self.inner.policy.records(annotation) || self.is_completed() {
            return;
        }
        let at = self.inner.started.elapsed();
        if let Ok(mut record) = self.inner.record.lock() {
            record.annotations.push((annotation.as_str().to_string(), at));
        }
    }

    pub fn tag(&self, key: impl Into<String>, value: impl Into<String>) {
        if self.is_completed() {
            return;
        }
        if let Ok(mut record) = self.inner.record.lock() {
            record.tags.insert(key.into(), value.into());
        }
    }

    /// Tag with an HTTP field when the policy records HTTP tags.
    pub fn tag_http(&self, key: &str, value: impl Into<String>) {
        if self.inner.policy.tags_http() {
            self.tag(key, value);
        }
    }

    pub fn rename(&self, name: impl Into<String>) {
        if let Ok(mut record) = self.inner.record.lock() {
            record.name = name.into();
        }
    }

    pub fn is_completed(&self) -> bool {
        self.inner.completed.load(Ordering::Acquire)
    }

    /// Complete the span. Returns false if it was already completed.
    pub fn complete(&self) -> bool {
        if self.inner.completed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let (name, annotations, tags) = match self.inner.record.lock() {
            Ok(mut record) => (
                record.name.clone(),
                std::mem::take(&mut record.annotations),
                std::mem::take(&mut record.tags),
            ),
            Err(_) => (String::from("unknown"), Vec::new(), BTreeMap::new()),
        };
        self.inner.sink.span_completed(CompletedSpan {
            name,
            context: self.inner.context.clone(),
            start_epoch_micros: self.inner.start_epoch_micros,
            duration: self.inner.started.elapsed(),
            annotations,
            tags,
        });
        true
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub spans: Mutex<Vec<CompletedSpan>>,
    }

    impl SpanSink for RecordingSink {
        fn span_completed(&self, span: CompletedSpan) {
            self.spans.lock().unwrap().push(span);
        }
    }

    #[test]
    fn continues_incoming_trace() {
        let mut headers = HeaderMap::new();
        headers.insert(TRACE_ID_HEADER, HeaderValue::from_static("abc123"));
        headers.insert(SPAN_ID_HEADER, HeaderValue::from_static("def456"));
        headers.insert(SAMPLED_HEADER, HeaderValue::from_static("0"));

        let ctx = TraceContext::from_headers(&headers);
        assert_eq!(ctx.trace_id, "abc123");
        assert_eq!(ctx.parent_span_id.as_deref(), Some("def456"));
        assert_ne!(ctx.span_id, "def456");
        assert!(!ctx.sampled);
    }

    #[test]
    fn starts_new_trace_without_headers() {
        let ctx = TraceContext::from_headers(&HeaderMap::new());
        assert_eq!(ctx.trace_id.len(), 16);
        assert!(ctx.parent_span_id.is_none());
        assert!(ctx.sampled);
    }

    #[test]
    fn inject_replaces_existing_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(TRACE_ID_HEADER, HeaderValue::from_static("stale"));
        let ctx = TraceContext::new_root().child();
        ctx.inject(&mut headers);

        assert_eq!(headers.get(TRACE_ID_HEADER).unwrap(), ctx.trace_id.as_str());
        assert_eq!(
            headers.get(PARENT_SPAN_ID_HEADER).unwrap(),
            ctx.parent_span_id.as_deref().unwrap()
        );
        assert_eq!(headers.get(SAMPLED_HEADER).unwrap(), "1");
    }

    #[test]
    fn span_completes_once() {
        let sink = Arc::new(RecordingSink::default());
        let span = SpanHandle::start("GET /x", TraceContext::new_root(), SpanPolicy::default(), sink.clone());
        span.annotate(Annotation::WireReceiveStart);
        span.tag("http.method", "GET");

        assert!(span.complete());
        assert!(!span.complete());
        span.annotate(Annotation::Error);

        let spans = sink.spans.lock().unwrap();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].annotations.len(), 1);
        assert_eq!(spans[0].tags["http.method"], "GET");
    }

    #[test]
    fn policy_filters_annotations() {
        let sink = Arc::new(RecordingSink::default());
        let policy = SpanPolicy::new(TracingConfig {
            annotate_endpoint: false,
            ..TracingConfig::default()
        });
        let span = SpanHandle::start("s", TraceContext::new_root(), policy, sink.clone());
        span.annotate(Annotation::EndpointStart);
        span.annotate(Annotation::WireSendStart);
        span.complete();

        let spans = sink.spans.lock().unwrap();
        assert_eq!(spans[0].annotations.len(), 1);
        assert_eq!(spans[0].annotations[0].0, "ws.start");
    }

    #[test]
    fn child_span_shares_trace() {
        let sink = Arc::new(RecordingSink::default());
        let parent = SpanHandle::start("p", TraceContext::new_root(), SpanPolicy::default(), sink);
        let child = parent.child("downstream");
        assert_eq!(child.context().trace_id, parent.context().trace_id);
        assert_eq!(child.context().parent_span_id.as_deref(), Some(parent.context().span_id.as_str()));
    }
}
