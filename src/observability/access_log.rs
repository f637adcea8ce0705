//! Access logging.
//!
//! One line per completed request, emitted by the finalizer after the
//! response was written (or failed to be).

use std::net::SocketAddr;
use std::time::Duration;

use http::{Method, Version};

/// Everything an access log line may contain.
#[derive(Debug, Clone)]
pub struct AccessLogEntry {
    pub peer_addr: Option<SocketAddr>,
    pub method: Method,
    pub uri: String,
    pub version: Version,
    pub status: Option<u16>,
    pub content_length: Option<u64>,
    pub referer: Option<String>,
    pub user_agent: Option<String>,
    pub trace_id: String,
    pub error_uid: Option<String>,
    pub elapsed: Duration,
    pub write_failed: bool,
}

impl AccessLogEntry {
    /// Combined-log-style rendering with trace and timing suffixes.
    pub fn format_line(&self) -> String {
        let quoted = |v: &Option<String>| match v {
            Some(v) => format!("\"{}\"", v),
            None => "\"-\"".to_string(),
        };
        format!(
            "{} - - \"{} {} {:?}\" {} {} {} {} trace_id={} error_uid={} elapsed_ms={}{}",
            self.peer_addr
                .map(|a| a.ip().to_string())
                .unwrap_or_else(|| "-".to_string()),
            self.method,
            self.uri,
            self.version,
            self.status.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string()),
            self.content_length
                .map(|l| l.to_string())
                .unwrap_or_else(|| "-".to_string()),
            quoted(&self.referer),
            quoted(&self.user_agent),
            self.trace_id,
            self.error_uid.as_deref().unwrap_or("-"),
            self.elapsed.as_millis(),
            if self.write_failed { " write_failed" } else { "" },
        )
    }
}

/// Receives one entry per completed request.
pub trait AccessLogger: Send + Sync {
    fn log(&self, entry: &AccessLogEntry);
}

/// Writes access lines to the `sluice::access` tracing target.
#[derive(Debug, Default, Clone)]
pub struct TracingAccessLogger;

impl AccessLogger for TracingAccessLogger {
    fn log(&self, entry: &AccessLogEntry) {
        tracing::info!(target: "sluice::access", "{}", entry.format_line());
    }
}
