//! Metrics collection and exposition.
//!
//! # Metrics
//! - `sluice_requests_received_total` (counter): requests entering the pipeline
//! - `sluice_responses_sent_total` (counter): by method, status
//! - `sluice_response_write_failures_total` (counter): by method
//! - `sluice_request_duration_seconds` (histogram): receive → final write
//! - `sluice_open_connections` (gauge): inbound connections currently open
//! - `sluice_connections_rejected_total` (counter): admission control rejections
//!
//! # Design Decisions
//! - The pipeline talks to a [`MetricsListener`]; the `metrics` facade is one implementation
//! - Every request yields `RequestReceived` then exactly one of `ResponseSent`/`ResponseWriteFailed`

use std::net::SocketAddr;
use std::time::Duration;

use http::Method;

/// Per-request lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerMetricsEvent {
    RequestReceived,
    ResponseSent,
    ResponseWriteFailed,
}

/// What a metrics listener learns about a request.
#[derive(Debug, Clone)]
pub struct RequestMetricsInfo {
    pub method: Method,
    pub path: String,
    pub route: Option<String>,
    pub status: Option<u16>,
    pub elapsed: Option<Duration>,
}

/// Receives server metrics events.
pub trait MetricsListener: Send + Sync {
    fn on_event(&self, event: ServerMetricsEvent, info: &RequestMetricsInfo);

    fn on_connection_opened(&self) {}

    fn on_connection_closed(&self) {}

    fn on_connection_rejected(&self) {}
}

/// Records events through the `metrics` facade.
#[derive(Debug, Default, Clone)]
pub struct PrometheusMetricsListener;

impl MetricsListener for PrometheusMetricsListener {
    fn on_event(&self, event: ServerMetricsEvent, info: &RequestMetricsInfo) {
        let method = info.method.to_string();
        match event {
            ServerMetricsEvent::RequestReceived => {
                metrics::counter!("sluice_requests_received_total", "method" => method).increment(1);
            }
            ServerMetricsEvent::ResponseSent => {
                let status = info.status.unwrap_or(0).to_string();
                metrics::counter!(
                    "sluice_responses_sent_total",
                    "method" => method.clone(),
                    "status" => status
                )
                .increment(1);
                if let Some(elapsed) = info.elapsed {
                    metrics::histogram!("sluice_request_duration_seconds", "method" => method)
                        .record(elapsed.as_secs_f64());
                }
            }
            ServerMetricsEvent::ResponseWriteFailed => {
                metrics::counter!("sluice_response_write_failures_total", "method" => method).increment(1);
            }
        }
    }

    fn on_connection_opened(&self) {
        metrics::gauge!("sluice_open_connections").increment(1.0);
    }

    fn on_connection_closed(&self) {
        metrics::gauge!("sluice_open_connections").decrement(1.0);
    }

    fn on_connection_rejected(&self) {
        metrics::counter!("sluice_connections_rejected_total").increment(1);
    }
}

/// Install the Prometheus exporter and its scrape listener.
pub fn init_metrics(addr: SocketAddr) {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(addr);
    match builder.install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn facade_listener_accepts_all_events_without_recorder() {
        let listener = PrometheusMetricsListener;
        let info = RequestMetricsInfo {
            method: Method::GET,
            path: "/x".into(),
            route: None,
            status: Some(200),
            elapsed: Some(Duration::from_millis(3)),
        };
        listener.on_event(ServerMetricsEvent::RequestReceived, &info);
        listener.on_event(ServerMetricsEvent::ResponseSent, &info);
        listener.on_event(ServerMetricsEvent::ResponseWriteFailed, &info);
        listener.on_connection_opened();
        listener.on_connection_closed();
        listener.on_connection_rejected();
    }
}
