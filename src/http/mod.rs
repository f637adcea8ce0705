//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! Admitted TCP connection
//!     → server.rs (hyper HTTP/1.1, trace and compression layers)
//!     → request.rs (RequestInfo: head, accumulated body, attributes, content)
//!     → [pipeline stages]
//!     → response.rs (ResponseInfo: buffered, streaming or proxied payload)
//!     → body.rs (CompletionBody fires the finalizer when the write ends)
//!     → Send to client
//! ```
//!
//! # Design Decisions
//! - One connection task per socket; all request stages run on it
//! - Compression is decided per response; proxied and opted-out responses skip it
//! - Request decompression is opt-in per endpoint

pub mod body;
pub mod compression;
pub mod decompression;
pub mod request;
pub mod response;
pub mod server;

pub use body::CompletionBody;
pub use compression::CompressionPolicy;
pub use decompression::{HttpPayloadDecompressor, PayloadDecompressor};
pub use request::RequestInfo;
pub use response::{Payload, PreventCompression, ResponseInfo};
pub use server::{HttpServer, PipelineService};
