//! Connection worker: one accept or connect attempt and the session it opens
//!
//! A worker resolves its attempt exactly once. On success it splits the
//! stream and runs a read task and a write task until the stream fails or
//! the worker is cancelled. Everything it learns goes back to the manager as
//! a `WorkerSignal` tagged with the worker's generation, so the manager can
//! discard signals from a worker it has already abandoned.

use crate::config::SessionConfig;
use crate::transport::{BoxedStream, TransportAcceptor, TransportConnector, TransportStream};
use battletap_shared::PeerIdentity;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What a worker reports back to the session manager
#[derive(Debug)]
pub(crate) enum WorkerSignal {
    /// An inbound peer was accepted and is being bound
    Accepted { peer: PeerIdentity },
    /// The stream is up; `outbound` feeds the write loop
    Established {
        peer: PeerIdentity,
        outbound: mpsc::UnboundedSender<Bytes>,
    },
    /// The accept or connect attempt failed
    Failed { reason: String },
    /// One read call's worth of bytes
    Data(Bytes),
    /// One outbound message was fully written
    Sent(Bytes),
    /// The established stream closed or faulted
    Closed { reason: String },
}

/// Which way a worker obtains its stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum WorkerMode {
    Listen,
    Connect(PeerIdentity),
}

/// Signal sender bound to one worker generation
#[derive(Clone)]
pub(crate) struct SignalTx {
    generation: u64,
    tx: mpsc::UnboundedSender<(u64, WorkerSignal)>,
}

impl SignalTx {
    pub(crate) fn new(generation: u64, tx: mpsc::UnboundedSender<(u64, WorkerSignal)>) -> Self {
        Self { generation, tx }
    }

    fn send(&self, signal: WorkerSignal) {
        // The manager outlives its workers; a closed channel means it is shutting down
        let _ = self.tx.send((self.generation, signal));
    }
}

/// Handle to a running worker
pub(crate) struct ConnectionWorker {
    generation: u64,
    mode: WorkerMode,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ConnectionWorker {
    /// Spawn a worker that waits for one inbound peer
    pub(crate) fn spawn_listen(
        acceptor: Arc<dyn TransportAcceptor>,
        config: SessionConfig,
        signals: SignalTx,
    ) -> Self {
        let generation = signals.generation;
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            run_listen(acceptor, config, signals, token).await;
        });

        Self {
            generation,
            mode: WorkerMode::Listen,
            cancel,
            task,
        }
    }

    /// Spawn a worker that makes one outbound attempt to `peer`
    pub(crate) fn spawn_connect(
        connector: Arc<dyn TransportConnector>,
        peer: PeerIdentity,
        config: SessionConfig,
        signals: SignalTx,
    ) -> Self {
        let generation = signals.generation;
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let target = peer.clone();
        let task = tokio::spawn(async move {
            run_connect(connector, target, config, signals, token).await;
        });

        Self {
            generation,
            mode: WorkerMode::Connect(peer),
            cancel,
            task,
        }
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn mode(&self) -> &WorkerMode {
        &self.mode
    }

    /// Cancel the worker and wait until its accept/connect, read and write
    /// contexts have all exited and the stream is closed
    pub(crate) async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!("[WORKER] Worker {} ended abnormally: {}", self.generation, e);
        }
        debug!("[WORKER] Worker {} shut down", self.generation);
    }
}

async fn run_listen(
    acceptor: Arc<dyn TransportAcceptor>,
    config: SessionConfig,
    signals: SignalTx,
    cancel: CancellationToken,
) {
    debug!("[WORKER] Waiting for inbound peer on {}", acceptor.name());

    let accepted = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            debug!("[WORKER] Accept cancelled");
            return;
        }
        result = acceptor.accept() => result,
    };

    match accepted {
        Ok((stream, peer)) => {
            info!("[WORKER] Accepted {} via {}", peer, acceptor.name());
            signals.send(WorkerSignal::Accepted { peer: peer.clone() });
            run_session(stream, peer, config, signals, cancel).await;
        }
        Err(e) => {
            warn!("[WORKER] Accept failed: {}", e);
            signals.send(WorkerSignal::Failed {
                reason: e.to_string(),
            });
        }
    }
}

async fn run_connect(
    connector: Arc<dyn TransportConnector>,
    peer: PeerIdentity,
    config: SessionConfig,
    signals: SignalTx,
    cancel: CancellationToken,
) {
    info!("[WORKER] Connecting to {} via {}", peer, connector.name());

    // One bounded attempt, no retry
    let attempt = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            debug!("[WORKER] Connect to {} cancelled", peer);
            return;
        }
        result = timeout(config.connect_timeout, connector.connect(&peer)) => result,
    };

    let reason = match attempt {
        Ok(Ok(stream)) => {
            info!("[WORKER] Connected to {}", peer);
            run_session(stream, peer, config, signals, cancel).await;
            return;
        }
        Ok(Err(e)) => e.to_string(),
        Err(_) => format!("timed out after {:?}", config.connect_timeout),
    };

    warn!("[WORKER] Connect to {} failed: {}", peer, reason);
    signals.send(WorkerSignal::Failed { reason });
}

/// Reports the end of a session at most once, whichever loop sees it first
struct TeardownLatch {
    fired: AtomicBool,
    signals: SignalTx,
    cancel: CancellationToken,
}

impl TeardownLatch {
    fn fire(&self, reason: String) {
        // A cancelled session was ended by the manager; nothing to report
        if self.cancel.is_cancelled() {
            return;
        }
        if !self.fired.swap(true, Ordering::SeqCst) {
            info!("[WORKER] Session ended: {}", reason);
            self.signals.send(WorkerSignal::Closed { reason });
            self.cancel.cancel();
        }
    }
}

async fn run_session(
    stream: BoxedStream,
    peer: PeerIdentity,
    config: SessionConfig,
    signals: SignalTx,
    cancel: CancellationToken,
) {
    let (reader, writer) = tokio::io::split(stream);
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<Bytes>();

    // Sent before either loop exists, so no data can overtake it
    signals.send(WorkerSignal::Established {
        peer: peer.clone(),
        outbound: outbound_tx,
    });

    let session_cancel = cancel.child_token();
    let latch = Arc::new(TeardownLatch {
        fired: AtomicBool::new(false),
        signals: signals.clone(),
        cancel: session_cancel.clone(),
    });

    let read_task = tokio::spawn(read_loop(
        reader,
        config.read_buffer_size,
        signals.clone(),
        latch.clone(),
        session_cancel.clone(),
    ));
    let write_task = tokio::spawn(write_loop(
        writer,
        outbound_rx,
        signals,
        latch,
        session_cancel,
    ));

    let (reader, writer) = tokio::join!(read_task, write_task);
    match (reader, writer) {
        (Ok(reader), Ok(writer)) => {
            let mut stream = reader.unsplit(writer);
            match timeout(config.shutdown_grace, TransportStream::shutdown(&mut *stream)).await {
                Ok(Ok(())) => debug!("[WORKER] Stream to {} closed", peer),
                Ok(Err(e)) => debug!("[WORKER] Stream to {} closed uncleanly: {}", peer, e),
                Err(_) => debug!("[WORKER] Stream to {} shutdown timed out", peer),
            }
        }
        _ => warn!("[WORKER] Session loop for {} panicked", peer),
    }
}

async fn read_loop(
    mut reader: ReadHalf<BoxedStream>,
    buffer_size: usize,
    signals: SignalTx,
    latch: Arc<TeardownLatch>,
    cancel: CancellationToken,
) -> ReadHalf<BoxedStream> {
    let mut buf = vec![0u8; buffer_size.max(1)];

    loop {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = reader.read(&mut buf) => result,
        };

        match result {
            Ok(0) => {
                latch.fire("peer closed the stream".into());
                break;
            }
            Ok(n) => {
                // No framing: one read call is one message
                signals.send(WorkerSignal::Data(Bytes::copy_from_slice(&buf[..n])));
            }
            Err(e) => {
                latch.fire(format!("read error: {}", e));
                break;
            }
        }
    }

    reader
}

async fn write_loop(
    mut writer: WriteHalf<BoxedStream>,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
    signals: SignalTx,
    latch: Arc<TeardownLatch>,
    cancel: CancellationToken,
) -> WriteHalf<BoxedStream> {
    loop {
        let message = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            message = outbound.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        // Pending messages are discarded once the session is cancelled
        let written = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = write_message(&mut writer, &message) => result,
        };

        match written {
            Ok(()) => signals.send(WorkerSignal::Sent(message)),
            Err(e) => {
                latch.fire(format!("write error: {}", e));
                break;
            }
        }
    }

    writer
}

async fn write_message(writer: &mut WriteHalf<BoxedStream>, message: &[u8]) -> std::io::Result<()> {
    writer.write_all(message).await?;
    writer.flush().await
}
