//! TCP accept side: admission control and connection identity.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept, open-connection ceiling)
//!         → rejected: socket closed immediately
//!     → connection.rs (ID, open count guard, ConnectionContext)
//!     → http::HttpServer serves it
//! ```
//!
//! # Design Decisions
//! - Admission control is a single shared atomic counter, checked on accept
//! - Existing connections are never affected by the ceiling
//! - Closing a connection cancels every request-scoped token derived from it

pub mod connection;
pub mod listener;

pub use connection::{ConnectionContext, ConnectionGuard, ConnectionId, ConnectionTracker};
pub use listener::{Admission, Listener, ListenerError};
