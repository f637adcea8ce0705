//! Request processing pipeline.
//!
//! # Data Flow
//! ```text
//! hyper request
//!     → RequestSizeStage (declared length vs. loosest endpoint limit)
//!     → FilterStage (before-security, first chunk)
//!     → RoutingStage (EndpointRegistry → MatchedEndpoint)
//!     → SecurityValidationStage (request head, fast validators)
//!     → FilterStage (after-security, first chunk)
//!     → BodyAssemblyStage (direct endpoints only, per-chunk deadline, inflation)
//!     → FilterStage (before-security then after-security, last chunk)
//!     → WorkChainStage (slow security → deserialize → validate, inline or on WorkerPool)
//!     → ExecutionStage (direct endpoint, or proxy client for proxy routers)
//!
//! any stage error or short-circuit
//!     → ErrorMapper → response filters (reverse order)
//!     → ResponseSender → CompletionBody → RequestFinalizer (once)
//! ```
//!
//! # Design Decisions
//! - Stages run sequentially on the connection's task; off-thread work is
//!   awaited and its result applied back on that task
//! - A stage ends the request by returning anything other than `Continue`;
//!   no later request stage observes it
//! - Finalization is owned by a handle that moves into the response body, so
//!   it fires exactly once however the request ends

pub mod chain;
pub mod exchange;
pub mod execution;
pub mod filter;
pub mod finalizer;
pub mod request_stages;
pub mod sender;
pub mod stage;
pub mod work_chain;
pub mod worker_pool;

pub use chain::{Pipeline, ServerComponents};
pub use exchange::Exchange;
pub use filter::{FilterAction, RequestAndResponseFilter};
pub use finalizer::{FinalizerHandle, RequestFinalizer, SendOutcome};
pub use sender::{ConnectionAbort, ResponseSender};
pub use stage::{Outcome, PipelineHook, Stage};
pub use worker_pool::WorkerPool;
