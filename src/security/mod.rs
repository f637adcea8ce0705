//! Request size limits and endpoint-scoped security validators.
//!
//! # Data Flow
//! ```text
//! Incoming request:
//!     → limits.rs (declared and accumulated body size)
//!     → [routing picks the endpoint]
//!     → validator.rs (endpoint-scoped authentication, first step of the work chain)
//!     → content deserialization and validation
//! ```
//!
//! # Design Decisions
//! - Fail closed: a validator error aborts the request before the endpoint runs
//! - Proxied requests are still validated; only their bodies go unexamined
//! - Size is checked against the declared length first, then as bytes arrive

pub mod limits;
pub mod validator;

pub use limits::RequestSizeLimit;
pub use validator::{
    should_validate, BasicAuthSecurityValidator, PolymorphicSecurityValidator, RequestSecurityValidator,
};
