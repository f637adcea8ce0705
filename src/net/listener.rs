//! TCP listener with open-connection admission control.
//!
//! # Responsibilities
//! - Accept incoming TCP connections
//! - Enforce `max_open_connections` (−1 disables) on accept
//! - Close rejected connections immediately; open ones are unaffected

use std::net::SocketAddr;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};

use crate::net::connection::{ConnectionGuard, ConnectionTracker};

/// Error type for listener operations.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    Bind(std::io::Error),
    /// Failed to accept connection.
    #[error("Failed to accept: {0}")]
    Accept(std::io::Error),
}

/// Result of one accept.
#[derive(Debug)]
pub enum Admission {
    /// The connection may be served; the guard holds its slot.
    Admitted {
        stream: TcpStream,
        peer_addr: SocketAddr,
        guard: ConnectionGuard,
    },
    /// The ceiling was reached; the socket has already been closed.
    Rejected { peer_addr: SocketAddr },
}

/// A TCP listener that caps concurrently open connections.
pub struct Listener {
    inner: TcpListener,
    tracker: ConnectionTracker,
    max_open: Option<u64>,
}

impl Listener {
    /// Bind to `addr`.
    pub async fn bind(addr: &str, max_open_connections: i64) -> Result<Self, ListenerError> {
        let addr: SocketAddr = addr.parse().map_err(|e| {
            ListenerError::Bind(std::io::Error::new(std::io::ErrorKind::InvalidInput, e))
        })?;
        let listener = TcpListener::bind(addr).await.map_err(ListenerError::Bind)?;
        Ok(Self::from_tcp(listener, max_open_connections))
    }

    /// Wrap an already-bound listener.
    pub fn from_tcp(inner: TcpListener, max_open_connections: i64) -> Self {
        let max_open = u64::try_from(max_open_connections).ok();
        if let Ok(local_addr) = inner.local_addr() {
            tracing::info!(
                address = %local_addr,
                max_open_connections = max_open_connections,
                "Listener bound"
            );
        }
        Self {
            inner,
            tracker: ConnectionTracker::new(),
            max_open,
        }
    }

    /// Accept the next connection and decide whether to admit it.
    pub async fn accept(&self) -> Result<Admission, ListenerError> {
        let (stream, peer_addr) = self.inner.accept().await.map_err(ListenerError::Accept)?;

        match self.tracker.try_track(self.max_open) {
            Some(guard) => {
                tracing::debug!(
                    connection_id = %guard.id(),
                    peer_addr = %peer_addr,
                    open_connections = self.tracker.active_count(),
                    "Connection accepted"
                );
                Ok(Admission::Admitted {
                    stream,
                    peer_addr,
                    guard,
                })
            }
            None => {
                drop(stream);
                tracing::warn!(
                    peer_addr = %peer_addr,
                    max_open_connections = self.max_open.unwrap_or_default(),
                    "Connection rejected, too many open connections"
                );
                Ok(Admission::Rejected { peer_addr })
            }
        }
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.inner.local_addr()
    }

    /// The open-connection counter.
    pub fn tracker(&self) -> &ConnectionTracker {
        &self.tracker
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn rejects_beyond_ceiling_and_keeps_existing() {
        let listener = Listener::bind("127.0.0.1:0", 1).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let _client1 = TcpStream::connect(addr).await.unwrap();
        let first = listener.accept().await.unwrap();
        assert!(matches!(first, Admission::Admitted { .. }));

        let mut client2 = TcpStream::connect(addr).await.unwrap();
        let second = listener.accept().await.unwrap();
        assert!(matches!(second, Admission::Rejected { .. }));

        // Rejected socket is closed: the client reads EOF.
        let mut buf = [0u8; 1];
        let read = client2.read(&mut buf).await.unwrap_or(0);
        assert_eq!(read, 0);

        assert_eq!(listener.tracker().active_count(), 1);
        drop(first);
        assert_eq!(listener.tracker().active_count(), 0);
    }

    #[tokio::test]
    async fn minus_one_disables_ceiling() {
        let listener = Listener::bind("127.0.0.1:0", -1).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut admitted = Vec::new();
        let mut clients = Vec::new();
        for _ in 0..5 {
            clients.push(TcpStream::connect(addr).await.unwrap());
            admitted.push(listener.accept().await.unwrap());
        }
        assert!(admitted.iter().all(|a| matches!(a, Admission::Admitted { .. })));
    }
}
