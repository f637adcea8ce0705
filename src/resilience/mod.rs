//! Deadlines for endpoint work, downstream connects and streaming bodies.
//!
//! # Data Flow
//! ```text
//! Endpoint execution / downstream connect:
//!     → timeouts.rs (with_deadline)
//! Streaming bodies (incoming upload, proxied request and response):
//!     → timeouts.rs (IdleDeadline, reset per chunk)
//! ```
//!
//! # Design Decisions
//! - Every downstream call and every body stream has a deadline
//! - No automatic retries: a proxied body cannot be replayed once streamed

pub mod timeouts;

pub use timeouts::{with_deadline, IdleDeadline};
