//! Logs, metrics, spans and access lines.
//!
//! # Data Flow
//! ```text
//! Request pipeline produces:
//!     → logging.rs (tracing-subscriber setup, text or JSON)
//!     → metrics.rs (received → sent | write-failed, connection gauges)
//!     → tracing.rs (one span per request, child spans per downstream call)
//!     → access_log.rs (one line per completed request)
//!
//! Consumers:
//!     → stdout
//!     → Metrics endpoint (Prometheus scrape)
//!     → SpanSink implementations (logging by default)
//! ```
//!
//! # Design Decisions
//! - JSON output is a config switch, text is the default
//! - Trace context flows explicitly through the pipeline, never thread-locals
//! - The finalizer owns the single emission of metrics, span and access line

pub mod access_log;
pub mod logging;
pub mod metrics;
pub mod tracing;
