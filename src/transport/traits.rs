//! Transport trait abstraction for pluggable stream backends

use anyhow::Result;
use async_trait::async_trait;
use battletap_shared::PeerIdentity;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

/// A transport stream that can read and write bytes
#[async_trait]
pub trait TransportStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    /// Close the transport gracefully
    async fn shutdown(&mut self) -> Result<()>;
}

/// Type-erased stream handed to a connection worker
pub type BoxedStream = Box<dyn TransportStream>;

/// Factory for outbound connections
#[async_trait]
pub trait TransportConnector: Send + Sync {
    /// Attempt one connection to `peer`, returning a stream on success
    async fn connect(&self, peer: &PeerIdentity) -> Result<BoxedStream>;

    /// Human-readable name for this transport
    fn name(&self) -> &'static str;
}

/// Source of inbound connections
#[async_trait]
pub trait TransportAcceptor: Send + Sync {
    /// Wait for the next inbound peer
    ///
    /// Dropping the returned future abandons the wait; the acceptor stays
    /// usable for a later call.
    async fn accept(&self) -> Result<(BoxedStream, PeerIdentity)>;

    /// Human-readable name for this transport
    fn name(&self) -> &'static str;
}

/// The transport capabilities a session manager can use
#[derive(Clone)]
pub struct Transport {
    pub connector: Arc<dyn TransportConnector>,
    pub acceptor: Option<Arc<dyn TransportAcceptor>>,
}

impl Transport {
    /// Outbound-only transport
    pub fn connect_only(connector: Arc<dyn TransportConnector>) -> Self {
        Self {
            connector,
            acceptor: None,
        }
    }

    /// Transport that can both listen and connect
    pub fn new(connector: Arc<dyn TransportConnector>, acceptor: Arc<dyn TransportAcceptor>) -> Self {
        Self {
            connector,
            acceptor: Some(acceptor),
        }
    }

    pub fn can_listen(&self) -> bool {
        self.acceptor.is_some()
    }
}
