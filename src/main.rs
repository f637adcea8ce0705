//! sluice server binary.
//!
//! Loads a TOML config, mounts the configured proxy routes and serves until
//! SIGINT or SIGTERM.
//!
//! # Architecture Overview
//!
//! ```text
//!     Client ──▶ net::Listener (admission) ──▶ http::HttpServer (hyper, per connection)
//!                                                   │
//!                                                   ▼
//!                                          pipeline::Pipeline
//!               size → filters → routing → body → work chain → filters → execution
//!                                                   │                        │
//!                                                   │            proxy::StreamingProxyClient ──▶ Downstream
//!                                                   ▼
//!     Client ◀── CompletionBody ◀── ResponseSender ◀── response filters ◀── ErrorMapper
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;

use sluice::config::loader::load_config;
use sluice::config::validation::validate_config;
use sluice::config::ServerConfig;
use sluice::endpoint::{Endpoint, SimpleProxyRouterEndpoint};
use sluice::http::{HttpPayloadDecompressor, HttpServer};
use sluice::lifecycle::{spawn_signal_handler, Shutdown};
use sluice::observability::access_log::TracingAccessLogger;
use sluice::observability::logging;
use sluice::observability::metrics::{init_metrics, PrometheusMetricsListener};
use sluice::pipeline::ServerComponents;

#[derive(Parser, Debug)]
#[command(name = "sluice")]
#[command(about = "Non-blocking HTTP server and streaming proxy", long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listener bind address.
    #[arg(short, long)]
    bind: Option<String>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ServerConfig::default(),
    };
    if let Some(bind) = cli.bind {
        config.listener.bind_address = bind;
    }
    if let Err(errors) = validate_config(&config) {
        for error in &errors {
            eprintln!("invalid configuration: {}", error);
        }
        return Err(format!("{} configuration error(s)", errors.len()).into());
    }

    let mut runtime = tokio::runtime::Builder::new_multi_thread();
    runtime.enable_all();
    if config.listener.io_workers > 0 {
        runtime.worker_threads(config.listener.io_workers);
    }
    runtime.build()?.block_on(serve(config))
}

async fn serve(config: ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    logging::init(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "sluice starting");

    let mut components = ServerComponents {
        payload_decompressor: Some(Arc::new(HttpPayloadDecompressor)),
        ..Default::default()
    };

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => {
                init_metrics(addr);
                components.metrics_listener = Some(Arc::new(PrometheusMetricsListener));
            }
            Err(e) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                error = %e,
                "Failed to parse metrics address"
            ),
        }
    }
    if config.observability.access_log_enabled {
        components.access_logger = Some(Arc::new(TracingAccessLogger));
    }

    for route in &config.proxy_routes {
        let endpoint = SimpleProxyRouterEndpoint::from_config(route)
            .map_err(|e| format!("proxy route {}: {}", route.name, e))?;
        tracing::info!(
            route = %route.name,
            path = %route.path,
            downstream = %format!("{}:{}", route.host, route.port),
            "Proxy route mounted"
        );
        components.endpoints.push(Endpoint::proxy(endpoint));
    }

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    tracing::info!(
        address = %listener.local_addr()?,
        max_open_connections = config.listener.max_open_connections,
        endpoint_timeout_ms = config.timeouts.endpoint_ms,
        "Listening for connections"
    );

    let shutdown = Arc::new(Shutdown::new());
    spawn_signal_handler(Arc::clone(&shutdown));

    let server = HttpServer::new(config, components);
    server.run(listener, shutdown.subscribe()).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
