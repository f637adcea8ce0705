//! Opening transport connections to downstream targets.

use futures_util::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::proxy::error::ProxyError;
use crate::proxy::pool::PoolKey;

/// A bidirectional byte stream to a downstream target.
pub trait DownstreamIo: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> DownstreamIo for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Opens connections for the proxy client's pool.
///
/// Plain TCP is built in. TLS targets need an application-supplied
/// connector that wraps the stream, honouring `relaxed_tls` for certificate
/// checks.
pub trait DownstreamConnector: Send + Sync {
    fn connect<'a>(
        &'a self,
        key: &'a PoolKey,
        relaxed_tls: bool,
    ) -> BoxFuture<'a, Result<Box<dyn DownstreamIo>, ProxyError>>;
}

/// Plain TCP connector.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

impl DownstreamConnector for TcpConnector {
    fn connect<'a>(
        &'a self,
        key: &'a PoolKey,
        _relaxed_tls: bool,
    ) -> BoxFuture<'a, Result<Box<dyn DownstreamIo>, ProxyError>> {
        Box::pin(async move {
            if key.tls {
                return Err(ProxyError::TlsUnavailable { target: key.to_string() });
            }
            let stream = TcpStream::connect((key.host.as_str(), key.port))
                .await
                .map_err(|source| ProxyError::Connect {
                    target: key.to_string(),
                    source,
                })?;
            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!(target_addr = %key, error = %e, "Failed to set TCP_NODELAY");
            }
            Ok(Box::new(stream) as Box<dyn DownstreamIo>)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tls_without_connector_fails() {
        let key = PoolKey::new("localhost", 443, true);
        let err = TcpConnector.connect(&key, false).await.err().unwrap();
        assert!(matches!(err, ProxyError::TlsUnavailable { .. }));
    }

    #[tokio::test]
    async fn connects_over_tcp() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let key = PoolKey::new("127.0.0.1", port, false);
        let (connected, accepted) = tokio::join!(TcpConnector.connect(&key, false), listener.accept());
        assert!(connected.is_ok());
        assert!(accepted.is_ok());
    }
}
