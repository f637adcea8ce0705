//! Pool of idle downstream connections.
//!
//! # Responsibilities
//! - Keep idle HTTP/1.1 connections per (host, port, tls)
//! - Hand each connection to at most one call at a time
//! - Drop connections that idled past the timeout or saw an error
//!
//! # Design Decisions
//! - A checked-out connection is owned by its call; returning it is an explicit move
//! - Dropping a connection aborts its I/O task, so an evicted connection can never
//!   deliver bytes to a later call
//! - LIFO reuse keeps the warmest connection busy and lets the rest expire

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use hyper::client::conn::http1::SendRequest;
use tokio::task::JoinHandle;

use crate::proxy::body::{UploadBody, UploadState};

/// Identity of a downstream target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl PoolKey {
    pub fn new(host: impl Into<String>, port: u16, tls: bool) -> Self {
        Self {
            host: host.into(),
            port,
            tls,
        }
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.tls { "https" } else { "http" };
        write!(f, "{}://{}:{}", scheme, self.host, self.port)
    }
}

/// One downstream connection and the task driving its I/O.
pub(crate) struct PooledConnection {
    pub id: u64,
    pub sender: SendRequest<UploadBody>,
    task: JoinHandle<()>,
    last_used: Instant,
}

impl PooledConnection {
    pub fn new(id: u64, sender: SendRequest<UploadBody>, task: JoinHandle<()>) -> Self {
        Self {
            id,
            sender,
            task,
            last_used: Instant::now(),
        }
    }

    fn is_expired(&self, idle_timeout: Duration) -> bool {
        self.last_used.elapsed() >= idle_timeout
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Idle connections keyed by target.
pub struct ConnectionPool {
    idle: DashMap<PoolKey, VecDeque<PooledConnection>>,
    idle_timeout: Duration,
    next_id: AtomicU64,
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("idle_timeout", &self.idle_timeout)
            .field("idle_connections", &self.idle_count())
            .finish()
    }
}

impl ConnectionPool {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            idle: DashMap::new(),
            idle_timeout,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub(crate) fn next_connection_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Idle connections across all targets.
    pub fn idle_count(&self) -> usize {
        self.idle.iter().map(|entry| entry.value().len()).sum()
    }

    /// Take an idle connection for `key`, skipping dead and expired ones.
    pub(crate) async fn checkout(&self, key: &PoolKey) -> Option<PooledConnection> {
        loop {
            let candidate = {
                let mut queue = self.idle.get_mut(key)?;
                loop {
                    let conn = queue.pop_back()?;
                    if conn.is_expired(self.idle_timeout) || conn.sender.is_closed() {
                        tracing::debug!(target_addr = %key, connection = conn.id, "Discarding stale downstream connection");
                        continue;
                    }
                    break conn;
                }
            };

            let mut conn = candidate;
            match conn.sender.ready().await {
                Ok(()) => {
                    tracing::trace!(target_addr = %key, connection = conn.id, "Reusing pooled downstream connection");
                    return Some(conn);
                }
                Err(e) => {
                    tracing::debug!(target_addr = %key, connection = conn.id, error = %e, "Pooled connection closed");
                }
            }
        }
    }

    /// Return a connection after a clean call.
    pub(crate) fn release(&self, key: &PoolKey, mut conn: PooledConnection) {
        if conn.sender.is_closed() {
            return;
        }
        conn.last_used = Instant::now();
        tracing::trace!(target_addr = %key, connection = conn.id, "Returning downstream connection to pool");
        self.idle.entry(key.clone()).or_default().push_back(conn);
    }

    /// Drop every idle connection past the idle timeout.
    pub fn evict_expired(&self) -> usize {
        let mut evicted = 0;
        for mut entry in self.idle.iter_mut() {
            let before = entry.value().len();
            entry.value_mut().retain(|conn| !conn.is_expired(self.idle_timeout));
            evicted += before - entry.value().len();
        }
        self.idle.retain(|_, queue| !queue.is_empty());
        if evicted > 0 {
            tracing::debug!(evicted = evicted, "Evicted idle downstream connections");
        }
        evicted
    }
}

/// A connection checked out for one call.
///
/// Returned to the pool only when the response ended cleanly, the upload
/// completed and the downstream did not ask to close. Anything else,
/// including being dropped mid-stream, evicts the connection.
pub(crate) struct ConnectionLease {
    pool: Arc<ConnectionPool>,
    key: PoolKey,
    conn: Option<PooledConnection>,
    upload: Arc<UploadState>,
    keep_alive: bool,
}

impl ConnectionLease {
    pub fn new(
        pool: Arc<ConnectionPool>,
        key: PoolKey,
        conn: PooledConnection,
        upload: Arc<UploadState>,
        keep_alive: bool,
    ) -> Self {
        Self {
            pool,
            key,
            conn: Some(conn),
            upload,
            keep_alive,
        }
    }

    /// The response ended cleanly.
    pub fn finish(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        if !self.keep_alive {
            tracing::debug!(target_addr = %self.key, connection = conn.id, "Downstream asked to close the connection");
        } else if !self.upload.is_complete() {
            tracing::debug!(
                target_addr = %self.key,
                connection = conn.id,
                "Downstream responded before the upload finished, aborting upload"
            );
        } else {
            self.pool.release(&self.key, conn);
        }
    }

    /// The call failed; never reuse this connection.
    pub fn evict(&mut self) {
        if let Some(conn) = self.conn.take() {
            tracing::debug!(target_addr = %self.key, connection = conn.id, "Evicting downstream connection");
        }
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        self.evict();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn connection(pool: &ConnectionPool) -> (PooledConnection, tokio::net::TcpStream) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, server) = tokio::join!(tokio::net::TcpStream::connect(addr), listener.accept());
        let io = hyper_util::rt::TokioIo::new(client.unwrap());
        let (sender, conn) = hyper::client::conn::http1::handshake::<_, UploadBody>(io).await.unwrap();
        let task = tokio::spawn(async move {
            let _ = conn.await;
        });
        (
            PooledConnection::new(pool.next_connection_id(), sender, task),
            server.unwrap().0,
        )
    }

    #[tokio::test]
    async fn released_connection_is_reused() {
        let pool = ConnectionPool::new(Duration::from_secs(5));
        let key = PoolKey::new("127.0.0.1", 1, false);
        let (conn, _server) = connection(&pool).await;
        let id = conn.id;

        pool.release(&key, conn);
        assert_eq!(pool.idle_count(), 1);
        let reused = pool.checkout(&key).await.unwrap();
        assert_eq!(reused.id, id);
        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test]
    async fn expired_connections_are_skipped() {
        let pool = ConnectionPool::new(Duration::from_millis(20));
        let key = PoolKey::new("127.0.0.1", 1, false);
        let (conn, _server) = connection(&pool).await;
        pool.release(&key, conn);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(pool.checkout(&key).await.is_none());
    }

    #[tokio::test]
    async fn reaper_drops_expired() {
        let pool = ConnectionPool::new(Duration::from_millis(20));
        let key = PoolKey::new("127.0.0.1", 1, false);
        let (a, _sa) = connection(&pool).await;
        let (b, _sb) = connection(&pool).await;
        pool.release(&key, a);
        pool.release(&key, b);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(pool.evict_expired(), 2);
        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test]
    async fn incomplete_upload_evicts_on_finish() {
        let pool = Arc::new(ConnectionPool::new(Duration::from_secs(5)));
        let key = PoolKey::new("127.0.0.1", 1, false);
        let (conn, _server) = connection(&pool).await;

        let mut lease = ConnectionLease::new(pool.clone(), key.clone(), conn, Arc::new(UploadState::new()), true);
        lease.finish();
        assert_eq!(pool.idle_count(), 0);

        let (conn, _server) = connection(&pool).await;
        let upload = Arc::new(UploadState::new());
        upload.mark_complete();
        let mut lease = ConnectionLease::new(pool.clone(), key, conn, upload, true);
        lease.finish();
        assert_eq!(pool.idle_count(), 1);
    }
}
