//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the server.
//! All types derive Serde traits for deserialization from config files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration for the server.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// Listener configuration (bind address, admission control).
    pub listener: ListenerConfig,

    /// Request size and compression limits.
    pub limits: LimitsConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Worker pool used for off-I/O-thread work.
    pub workers: WorkerConfig,

    /// Distributed tracing annotation and tag strategy.
    pub tracing: TracingConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Config-driven proxy endpoints.
    pub proxy_routes: Vec<ProxyRouteConfig>,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Maximum concurrently open inbound connections. -1 disables the cap.
    pub max_open_connections: i64,

    /// Number of I/O worker threads. 0 uses the runtime default.
    pub io_workers: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            max_open_connections: 20_000,
            io_workers: 0,
        }
    }
}

/// Request and response size limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Global maximum request body size in bytes. 0 means unlimited.
    pub max_request_size_bytes: usize,

    /// Responses at or below this size are never compressed.
    pub response_compression_threshold_bytes: u16,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_request_size_bytes: 0,
            response_compression_threshold_bytes: 500,
        }
    }
}

/// Timeout configuration for various operations.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Default deadline for endpoint futures, in milliseconds.
    pub endpoint_ms: u64,

    /// Downstream TCP connect timeout in milliseconds.
    pub downstream_connect_ms: u64,

    /// How long a downstream connection may sit idle, pooled or mid-call.
    pub downstream_idle_ms: u64,

    /// How long a started request may wait for its next body chunk.
    pub incomplete_call_ms: u64,

    /// How long an inbound keep-alive connection may wait for its next request.
    pub keep_alive_idle_ms: u64,
}

impl TimeoutConfig {
    pub fn endpoint(&self) -> Duration {
        Duration::from_millis(self.endpoint_ms)
    }

    pub fn downstream_connect(&self) -> Duration {
        Duration::from_millis(self.downstream_connect_ms)
    }

    pub fn downstream_idle(&self) -> Duration {
        Duration::from_millis(self.downstream_idle_ms)
    }

    pub fn incomplete_call(&self) -> Duration {
        Duration::from_millis(self.incomplete_call_ms)
    }

    pub fn keep_alive_idle(&self) -> Duration {
        Duration::from_millis(self.keep_alive_idle_ms)
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            endpoint_ms: 58_000,
            downstream_connect_ms: 10_000,
            downstream_idle_ms: 5_000,
            incomplete_call_ms: 5_000,
            keep_alive_idle_ms: 5_000,
        }
    }
}

/// Bounded worker pool configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Maximum number of tasks running on the pool at once.
    pub pool_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { pool_size: 64 }
    }
}

/// Which span annotations and tags are recorded.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TracingConfig {
    /// Annotate wire-receive start/finish.
    pub annotate_wire_receive: bool,

    /// Annotate endpoint start/finish.
    pub annotate_endpoint: bool,

    /// Annotate wire-send start/finish.
    pub annotate_wire_send: bool,

    /// Annotate failures with an `error` annotation.
    pub annotate_errors: bool,

    /// Tag spans with method, path, route and status.
    pub tag_http: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            annotate_wire_receive: true,
            annotate_endpoint: true,
            annotate_wire_send: true,
            annotate_errors: true,
            tag_http: true,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format: "pretty" or "json".
    pub log_format: String,

    /// Log each connection's lifecycle at DEBUG instead of TRACE.
    pub debug_connection_lifecycle_logging: bool,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,

    /// Emit one access log line per request.
    pub access_log_enabled: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            debug_connection_lifecycle_logging: false,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
            access_log_enabled: true,
        }
    }
}

/// A proxy endpoint declared in configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyRouteConfig {
    /// Route identifier for logging.
    pub name: String,

    /// Path template to match, e.g. `/api/**`.
    pub path: String,

    /// Allowed methods. Empty allows all.
    #[serde(default)]
    pub methods: Vec<String>,

    /// Downstream host.
    pub host: String,

    /// Downstream port.
    pub port: u16,

    /// Connect to the downstream over TLS.
    #[serde(default)]
    pub tls: bool,

    /// Prefix removed from the path before forwarding.
    #[serde(default)]
    pub strip_prefix: Option<String>,

    /// Attach B3 tracing headers to the outbound request.
    #[serde(default = "default_true")]
    pub propagate_tracing_headers: bool,

    /// Wrap the downstream call in its own child span.
    #[serde(default = "default_true")]
    pub subspan: bool,

    /// Skip certificate validation for the downstream TLS handshake.
    #[serde(default)]
    pub relaxed_tls: bool,
}

fn default_true() -> bool {
    true
}
