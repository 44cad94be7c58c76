//! TCP transport implementation

use crate::transport::traits::{BoxedStream, TransportAcceptor, TransportConnector, TransportStream};
use anyhow::Result;
use async_trait::async_trait;
use battletap_shared::{PeerIdentity, SessionError};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

/// TCP stream wrapper implementing TransportStream
pub struct TcpTransportStream {
    inner: TcpStream,
}

impl TcpTransportStream {
    pub fn new(stream: TcpStream) -> Self {
        // Game payloads are a handful of bytes
        let _ = stream.set_nodelay(true);
        Self { inner: stream }
    }
}

impl AsyncRead for TcpTransportStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TcpTransportStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[async_trait]
impl TransportStream for TcpTransportStream {
    async fn shutdown(&mut self) -> Result<()> {
        tokio::io::AsyncWriteExt::shutdown(&mut self.inner).await?;
        Ok(())
    }
}

/// TCP connector; the peer identity is a `host:port` string
#[derive(Debug, Default)]
pub struct TcpConnector;

impl TcpConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TransportConnector for TcpConnector {
    async fn connect(&self, peer: &PeerIdentity) -> Result<BoxedStream> {
        debug!("[TCP] Connecting to {}", peer);
        let stream = TcpStream::connect(peer.as_str()).await?;
        Ok(Box::new(TcpTransportStream::new(stream)))
    }

    fn name(&self) -> &'static str {
        "TCP"
    }
}

/// TCP acceptor bound to a local address
pub struct TcpAcceptor {
    listener: TcpListener,
}

impl TcpAcceptor {
    /// Bind the listening socket
    ///
    /// A bind failure means this node has no way to take inbound peers.
    pub async fn bind(addr: &str) -> Result<Self, SessionError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| SessionError::AdapterUnavailable(format!("bind {}: {}", addr, e)))?;
        if let Ok(local) = listener.local_addr() {
            info!("[TCP] Listening on {}", local);
        }
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

#[async_trait]
impl TransportAcceptor for TcpAcceptor {
    async fn accept(&self) -> Result<(BoxedStream, PeerIdentity)> {
        let (stream, addr) = self.listener.accept().await?;
        debug!("[TCP] Accepted {}", addr);
        Ok((
            Box::new(TcpTransportStream::new(stream)),
            PeerIdentity::new(addr.to_string()),
        ))
    }

    fn name(&self) -> &'static str {
        "TCP"
    }
}
