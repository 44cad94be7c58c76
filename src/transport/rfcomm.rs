//! RFCOMM transport implementation for Bluetooth connections

use crate::transport::bt_discovery::BtDiscovery;
use crate::transport::traits::{BoxedStream, TransportAcceptor, TransportConnector, TransportStream};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use battletap_shared::{PeerIdentity, SessionError};
use bluer::rfcomm::{Listener as RfcommListener, SocketAddr as RfcommAddr, Stream as RfcommStream};
use bluer::Address;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::info;

/// Default RFCOMM channel for the game service
pub const DEFAULT_RFCOMM_CHANNEL: u8 = 1;

/// RFCOMM stream wrapper implementing TransportStream
pub struct RfcommTransportStream {
    inner: RfcommStream,
    peer_addr: Address,
}

impl RfcommTransportStream {
    /// Create a new RFCOMM transport stream
    pub fn new(stream: RfcommStream, peer_addr: Address) -> Self {
        Self {
            inner: stream,
            peer_addr,
        }
    }

    /// Get the peer Bluetooth address
    pub fn peer_address(&self) -> Address {
        self.peer_addr
    }
}

impl AsyncRead for RfcommTransportStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for RfcommTransportStream {
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
impl TransportStream for RfcommTransportStream {
    async fn shutdown(&mut self) -> Result<()> {
        tokio::io::AsyncWriteExt::shutdown(&mut self.inner).await?;
        Ok(())
    }
}

/// Parse a peer identity as a Bluetooth MAC address
pub fn parse_address(peer: &PeerIdentity) -> Result<Address> {
    peer.as_str()
        .parse::<Address>()
        .map_err(|e| anyhow!("invalid Bluetooth address {}: {}", peer, e))
}

/// RFCOMM connector; the peer identity is the remote MAC address
pub struct RfcommConnector {
    channel: u8,
}

impl RfcommConnector {
    pub fn new(channel: u8) -> Self {
        Self { channel }
    }
}

impl Default for RfcommConnector {
    fn default() -> Self {
        Self::new(DEFAULT_RFCOMM_CHANNEL)
    }
}

#[async_trait]
impl TransportConnector for RfcommConnector {
    async fn connect(&self, peer: &PeerIdentity) -> Result<BoxedStream> {
        let target_addr = parse_address(peer)?;
        let socket_addr = RfcommAddr::new(target_addr, self.channel);
        info!("[BT] Connecting to {} channel {}", target_addr, self.channel);

        let stream = RfcommStream::connect(socket_addr)
            .await
            .map_err(|e| anyhow!("RFCOMM connect failed: {}", e))?;

        let stream = RfcommTransportStream::new(stream, target_addr);
        info!("[BT] Connected to {}", stream.peer_address());
        Ok(Box::new(stream))
    }

    fn name(&self) -> &'static str {
        "Bluetooth"
    }
}

/// RFCOMM acceptor listening on a local channel
pub struct RfcommAcceptor {
    listener: RfcommListener,
}

impl RfcommAcceptor {
    /// Power the adapter and bind the listening channel
    pub async fn bind(channel: u8) -> Result<Self, SessionError> {
        let adapter = BtDiscovery::get_adapter().await?;
        let local = adapter
            .address()
            .await
            .map_err(|e| SessionError::AdapterUnavailable(e.to_string()))?;

        let listener = RfcommListener::bind(RfcommAddr::new(Address::any(), channel))
            .await
            .map_err(|e| SessionError::AdapterUnavailable(format!("RFCOMM bind: {}", e)))?;
        info!("[BT] Listening on {} channel {}", local, channel);

        Ok(Self { listener })
    }
}

#[async_trait]
impl TransportAcceptor for RfcommAcceptor {
    async fn accept(&self) -> Result<(BoxedStream, PeerIdentity)> {
        let (stream, remote) = self.listener.accept().await?;
        let stream = RfcommTransportStream::new(stream, remote.addr);
        let peer = PeerIdentity::new(stream.peer_address().to_string());
        info!("[BT] Accepted {}", peer);
        Ok((Box::new(stream), peer))
    }

    fn name(&self) -> &'static str {
        "Bluetooth"
    }
}
