//! Streaming proxy subsystem.
//!
//! # Data Flow
//! ```text
//! DownstreamRequestFirstChunkInfo + caller's body
//!     → client.rs (build outbound head, inject B3 headers, open subspan)
//!     → pool.rs (checkout idle connection for host/port/tls, or connector.rs to open one)
//!     → body.rs UploadBody (caller's chunks streamed downstream)
//!     → downstream response head → endpoint hook → relayed to caller
//!     → body.rs DownstreamBody (downstream chunks streamed back)
//!     → clean end: connection returned to pool; error/abort: connection evicted
//! ```
//!
//! # Design Decisions
//! - HTTP/1.1 only toward downstream targets
//! - One in-flight call per connection; the pool never shares a checked-out connection
//! - A response arriving before the upload finished evicts the connection, so the
//!   aborted upload cannot touch the next call

pub mod body;
pub mod client;
pub mod connector;
pub mod error;
pub mod pool;

pub use client::{DownstreamResponse, ProxyCall, ProxyTimeouts, StreamingProxyClient};
pub use connector::{DownstreamConnector, DownstreamIo, TcpConnector};
pub use error::ProxyError;
pub use pool::{ConnectionPool, PoolKey};
