//! Process lifecycle: signals and graceful shutdown.
//!
//! # Data Flow
//! ```text
//! Shutdown (shutdown.rs):
//!     Trigger → accept loop stops → connections finish in-flight requests → pool reaper exits
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Shutdown::trigger
//! ```
//!
//! # Design Decisions
//! - Shutdown order: accept loop first, then open connections, then the reaper
//! - Keep-alive connections are told to close after their current response

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
pub use signals::{spawn_signal_handler, wait_for_termination};
