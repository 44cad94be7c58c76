//! In-process transport built on `tokio::io::duplex`
//!
//! Peers are addressed by name. A `MemoryNetwork` routes connections from
//! connectors to whichever acceptor (or remote listener) registered that
//! name. Remote ends can inject inbound peers, stall outbound attempts and
//! fault a live connection, which makes the transport useful for loopback
//! runs and for driving a session manager from tests.

use crate::transport::traits::{BoxedStream, TransportAcceptor, TransportConnector, TransportStream};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use battletap_shared::PeerIdentity;
use std::collections::{HashMap, HashSet};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::mpsc;

/// Size of the in-memory pipe in each direction
const PIPE_CAPACITY: usize = 4096;

/// A connection waiting in a listener's queue
struct PendingConnection {
    stream: DuplexStream,
    fault: Arc<AtomicBool>,
    peer: PeerIdentity,
}

#[derive(Default)]
struct Registry {
    listeners: HashMap<String, mpsc::UnboundedSender<PendingConnection>>,
    stalled: HashSet<String>,
}

/// Counts the streams a connector or acceptor has handed out and not yet dropped
#[derive(Debug, Default)]
pub struct StreamCounter {
    live: AtomicUsize,
    peak: AtomicUsize,
}

impl StreamCounter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Streams currently alive
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Highest number of streams ever alive at once
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn guard(self: &Arc<Self>) -> LiveGuard {
        let now = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        LiveGuard(self.clone())
    }
}

struct LiveGuard(Arc<StreamCounter>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Named in-process network
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    registry: Arc<Mutex<Registry>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, name: &str) -> mpsc::UnboundedReceiver<PendingConnection> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().listeners.insert(name.to_string(), tx);
        rx
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Registry> {
        // Registry holds plain maps; a poisoned lock still has consistent data
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Acceptor for inbound connections addressed to `name`
    pub fn acceptor(&self, name: &str) -> MemoryAcceptor {
        MemoryAcceptor {
            incoming: tokio::sync::Mutex::new(self.register(name)),
            counter: StreamCounter::new(),
        }
    }

    /// Connector whose outbound connections present themselves as `local_name`
    pub fn connector(&self, local_name: &str) -> MemoryConnector {
        MemoryConnector {
            network: self.clone(),
            local: PeerIdentity::new(local_name),
            counter: StreamCounter::new(),
        }
    }

    /// Listener for a peer that the caller drives by hand
    pub fn remote_listener(&self, name: &str) -> RemoteListener {
        RemoteListener {
            incoming: self.register(name),
        }
    }

    /// Make every connect attempt to `name` hang until abandoned
    pub fn stall(&self, name: &str) {
        self.lock().stalled.insert(name.to_string());
    }

    /// Deliver an inbound connection from `peer` to the acceptor named `to`
    pub fn inject(&self, to: &str, peer: &str) -> Result<RemoteEnd> {
        let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
        let fault = Arc::new(AtomicBool::new(false));
        self.deliver(
            to,
            PendingConnection {
                stream: local,
                fault: fault.clone(),
                peer: PeerIdentity::new(peer),
            },
        )?;
        Ok(RemoteEnd {
            stream: remote,
            fault,
        })
    }

    fn deliver(&self, to: &str, pending: PendingConnection) -> Result<()> {
        let registry = self.lock();
        let tx = registry
            .listeners
            .get(to)
            .ok_or_else(|| anyhow!("connection refused: no listener named {}", to))?;
        tx.send(pending)
            .map_err(|_| anyhow!("connection refused: listener {} is gone", to))
    }

    fn is_stalled(&self, name: &str) -> bool {
        self.lock().stalled.contains(name)
    }
}

/// Session-side end of an in-memory connection
pub struct MemoryStream {
    inner: DuplexStream,
    fault: Arc<AtomicBool>,
    _live: LiveGuard,
}

impl MemoryStream {
    fn faulted(&self) -> bool {
        self.fault.load(Ordering::SeqCst)
    }
}

fn reset() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionReset, "connection reset by peer")
}

impl AsyncRead for MemoryStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.faulted() {
            return Poll::Ready(Err(reset()));
        }
        let polled = Pin::new(&mut self.inner).poll_read(cx, buf);
        match polled {
            // A fault drops the remote end, which wakes us with EOF first
            Poll::Ready(Ok(())) if self.faulted() => Poll::Ready(Err(reset())),
            other => other,
        }
    }
}

impl AsyncWrite for MemoryStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.faulted() {
            return Poll::Ready(Err(reset()));
        }
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
impl TransportStream for MemoryStream {
    async fn shutdown(&mut self) -> Result<()> {
        tokio::io::AsyncWriteExt::shutdown(&mut self.inner).await?;
        Ok(())
    }
}

/// Hand-driven end of an in-memory connection
pub struct RemoteEnd {
    pub stream: DuplexStream,
    fault: Arc<AtomicBool>,
}

impl RemoteEnd {
    /// Break the connection: both directions fail on the session side
    pub fn fault(self) {
        self.fault.store(true, Ordering::SeqCst);
        drop(self.stream);
    }
}

/// Accepts connections for a hand-driven peer
pub struct RemoteListener {
    incoming: mpsc::UnboundedReceiver<PendingConnection>,
}

impl RemoteListener {
    /// Wait for the next connection; `None` once the network is gone
    pub async fn accept(&mut self) -> Option<(RemoteEnd, PeerIdentity)> {
        let pending = self.incoming.recv().await?;
        Some((
            RemoteEnd {
                stream: pending.stream,
                fault: pending.fault,
            },
            pending.peer,
        ))
    }
}

/// In-memory acceptor
pub struct MemoryAcceptor {
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<PendingConnection>>,
    counter: Arc<StreamCounter>,
}

impl MemoryAcceptor {
    /// Share a stream counter with another connector or acceptor
    pub fn with_counter(mut self, counter: Arc<StreamCounter>) -> Self {
        self.counter = counter;
        self
    }

    pub fn counter(&self) -> Arc<StreamCounter> {
        self.counter.clone()
    }
}

#[async_trait]
impl TransportAcceptor for MemoryAcceptor {
    async fn accept(&self) -> Result<(BoxedStream, PeerIdentity)> {
        let mut incoming = self.incoming.lock().await;
        let pending = incoming
            .recv()
            .await
            .ok_or_else(|| anyhow!("memory network closed"))?;
        let stream = MemoryStream {
            inner: pending.stream,
            fault: pending.fault,
            _live: self.counter.guard(),
        };
        Ok((Box::new(stream), pending.peer))
    }

    fn name(&self) -> &'static str {
        "Memory"
    }
}

/// In-memory connector
pub struct MemoryConnector {
    network: MemoryNetwork,
    local: PeerIdentity,
    counter: Arc<StreamCounter>,
}

impl MemoryConnector {
    /// Share a stream counter with another connector or acceptor
    pub fn with_counter(mut self, counter: Arc<StreamCounter>) -> Self {
        self.counter = counter;
        self
    }

    pub fn counter(&self) -> Arc<StreamCounter> {
        self.counter.clone()
    }
}

#[async_trait]
impl TransportConnector for MemoryConnector {
    async fn connect(&self, peer: &PeerIdentity) -> Result<BoxedStream> {
        if self.network.is_stalled(peer.as_str()) {
            std::future::pending::<()>().await;
        }

        let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
        let fault = Arc::new(AtomicBool::new(false));
        self.network.deliver(
            peer.as_str(),
            PendingConnection {
                stream: remote,
                fault: fault.clone(),
                peer: self.local.clone(),
            },
        )?;

        Ok(Box::new(MemoryStream {
            inner: local,
            fault,
            _live: self.counter.guard(),
        }))
    }

    fn name(&self) -> &'static str {
        "Memory"
    }
}
