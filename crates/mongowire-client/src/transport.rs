//! Byte-stream transports
//!
//! The pool opens connections through a [`Connector`], so plain TCP, TLS
//! wrappers and in-process test streams all plug in the same way.

use std::time::Duration;

use async_trait::async_trait;
use mongowire_common::{ConnectionError, ConnectionErrorKind, Host, Result};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

/// A bidirectional byte stream
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Opens transports to a host
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, host: &Host) -> Result<BoxedStream>;
}

/// Plain TCP transport
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, host: &Host) -> Result<BoxedStream> {
        let stream = tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect((host.hostname.as_str(), host.port)),
        )
        .await
        .map_err(|_| ConnectionError::new(ConnectionErrorKind::CannotConnect, None))??;

        stream.set_nodelay(true)?;
        debug!("TCP connection established to {}", host);

        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongowire_common::Error;

    #[tokio::test]
    async fn test_tcp_connect_refused() {
        // Bind then drop to get a port nobody listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = TcpConnector::default().connect(&Host::new("127.0.0.1", port)).await;
        assert!(matches!(result, Err(Error::Io(_))));
    }

    #[tokio::test]
    async fn test_tcp_connect() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let accept = tokio::spawn(async move { listener.accept().await.map(|_| ()) });
        let stream = TcpConnector::default().connect(&Host::new("127.0.0.1", port)).await;
        assert!(stream.is_ok());
        accept.await.unwrap().unwrap();
    }
}
