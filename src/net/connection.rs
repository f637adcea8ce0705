//! Connection identity, open-connection accounting and per-connection context.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Count open inbound connections (the admission-control counter)
//! - Carry per-connection state handed to endpoints
//! - Cancel work tied to a connection when it closes

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Counts open connections and admits new ones under a ceiling.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    active_count: Arc<AtomicU64>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new connection unconditionally.
    pub fn track(&self) -> ConnectionGuard {
        self.active_count.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard {
            active_count: Arc::clone(&self.active_count),
            id: ConnectionId::new(),
        }
    }

    /// Record a new connection if fewer than `max` are open. `None` disables the ceiling.
    pub fn try_track(&self, max: Option<u64>) -> Option<ConnectionGuard> {
        let Some(max) = max else {
            return Some(self.track());
        };

        self.active_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |open| {
                (open < max).then_some(open + 1)
            })
            .ok()
            .map(|_| ConnectionGuard {
                active_count: Arc::clone(&self.active_count),
                id: ConnectionId::new(),
            })
    }

    /// Get current open connection count.
    pub fn active_count(&self) -> u64 {
        self.active_count.load(Ordering::SeqCst)
    }

    /// Wait until all connections are closed.
    pub async fn wait_for_drain(&self) {
        while self.active_count.load(Ordering::SeqCst) > 0 {
            tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        }
    }
}

/// Guard that tracks a connection's lifetime.
/// Decrements the open count when dropped.
#[derive(Debug)]
pub struct ConnectionGuard {
    active_count: Arc<AtomicU64>,
    id: ConnectionId,
}

impl ConnectionGuard {
    /// Get this connection's ID.
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active_count.fetch_sub(1, Ordering::SeqCst);
        tracing::trace!(connection_id = %self.id, "Connection closed");
    }
}

/// Per-connection context handed to endpoints.
///
/// The token is cancelled when the connection closes; request-scoped tokens
/// are children of it, so downstream calls tied to the connection stop too.
#[derive(Debug)]
pub struct ConnectionContext {
    id: ConnectionId,
    peer_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
    opened_at: Instant,
    cancel: CancellationToken,
}

impl ConnectionContext {
    pub fn new(
        id: ConnectionId,
        peer_addr: Option<SocketAddr>,
        local_addr: Option<SocketAddr>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            peer_addr,
            local_addr,
            opened_at: Instant::now(),
            cancel,
        }
    }

    /// A context not bound to any socket, for tests and embedding.
    pub fn detached() -> Self {
        Self::new(ConnectionId::new(), None, None, CancellationToken::new())
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn opened_at(&self) -> Instant {
        self.opened_at
    }

    /// Token cancelled when the connection closes.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Cancel everything tied to this connection.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
