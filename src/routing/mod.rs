//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! RequestInfo (method, normalized path)
//!     → router.rs (scan endpoints in registration order)
//!     → matcher.rs (path templates, then method, then predicate)
//!     → MatchedEndpoint {endpoint, template, params} | NotFound | MethodNotAllowed
//! ```
//!
//! # Design Decisions
//! - Matchers compiled at startup, immutable at runtime
//! - No regex in hot path (segment matching only)
//! - Deterministic: same input always matches same endpoint
//! - First match wins (registration order)

pub mod matcher;
pub mod router;

pub use matcher::{MatchResult, Matcher, PathTemplate};
pub use router::{EndpointRegistry, MatchedEndpoint};
