//! Non-blocking HTTP server engine with a staged request pipeline and a streaming proxy client.

pub mod config;
pub mod endpoint;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod pipeline;
pub mod proxy;
pub mod resilience;
pub mod routing;
pub mod security;
pub mod validation;

pub use config::ServerConfig;
pub use endpoint::{DirectEndpoint, Endpoint, HandlerEndpoint, ProxyRouterEndpoint};
pub use error::PipelineError;
pub use http::{HttpServer, RequestInfo, ResponseInfo};
pub use lifecycle::Shutdown;
pub use pipeline::{Pipeline, ServerComponents};
