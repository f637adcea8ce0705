//! Server configuration: TOML schema, loading and semantic checks.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ServerConfig (validated, immutable)
//!     → handed to HttpServer::new, which derives the pipeline from it
//! ```
//!
//! # Design Decisions
//! - No reload: a restart picks up a changed file
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks
//! - Application wiring (endpoints, filters, validators) is code, not config

pub mod loader;
pub mod schema;
pub mod validation;

pub use schema::{
    LimitsConfig, ListenerConfig, ObservabilityConfig, ProxyRouteConfig, ServerConfig,
    TimeoutConfig, TracingConfig, WorkerConfig,
};
