//! Session manager with a single active connection worker
//!
//! The state lives in an actor task. Public operations are commands to that
//! task and return once the transition they cause has been applied and
//! announced. Worker signals go through the same task, which drops anything
//! sent by a worker it has already abandoned.

use super::listener::EventReceiver;
use super::worker::{ConnectionWorker, SignalTx, WorkerMode, WorkerSignal};
use crate::config::SessionConfig;
use crate::transport::Transport;
use battletap_shared::{
    notice, InboundEvent, PeerIdentity, SessionError, SessionEvent, SessionState,
    SessionStateMachine, TransitionResult,
};
use bytes::Bytes;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

enum Command {
    Start {
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Connect {
        peer: PeerIdentity,
        reply: oneshot::Sender<()>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

/// Feed of the current session's write loop; `Some` only while CONNECTED
type OutboundSlot = Arc<Mutex<Option<mpsc::UnboundedSender<Bytes>>>>;

fn lock_slot(slot: &OutboundSlot) -> MutexGuard<'_, Option<mpsc::UnboundedSender<Bytes>>> {
    slot.lock().unwrap_or_else(|e| e.into_inner())
}

/// Manages one point-to-point session over a pluggable transport
pub struct SessionManager {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<SessionState>,
    outbound: OutboundSlot,
    events: mpsc::UnboundedSender<InboundEvent>,
    task: JoinHandle<()>,
}

impl SessionManager {
    /// Create a session manager in `NONE` and spawn its actor task
    ///
    /// Returns the manager and the receiving end of its event channel.
    pub fn new(config: SessionConfig, transport: Transport) -> (Self, EventReceiver) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::None);
        let outbound: OutboundSlot = Arc::new(Mutex::new(None));

        let actor = SessionActor {
            config,
            transport,
            fsm: SessionStateMachine::new(),
            worker: None,
            peer: None,
            next_generation: 0,
            outbound: outbound.clone(),
            events: event_tx.clone(),
            state: state_tx,
            signals: signal_tx,
        };
        let task = tokio::spawn(actor.run(command_rx, signal_rx));

        let manager = Self {
            commands: command_tx,
            state: state_rx,
            outbound,
            events: event_tx,
            task,
        };
        (manager, event_rx)
    }

    /// Current session state
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watch the session state
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Start listening for an inbound peer
    ///
    /// Fails with `AdapterUnavailable` when the transport cannot accept.
    pub async fn start(&self) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Start { reply })?;
        rx.await.map_err(|_| SessionError::Closed)?
    }

    /// Tear down whatever is running and make one attempt to reach `peer`
    ///
    /// Returns once the manager is CONNECTING; the outcome arrives as events.
    pub async fn connect(&self, peer: impl Into<PeerIdentity>) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Connect {
            peer: peer.into(),
            reply,
        })?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    /// Tear down the worker and return to `NONE`
    ///
    /// Returns only after every worker context has exited.
    pub async fn stop(&self) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Stop { reply })?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    /// Queue bytes for the connected peer without waiting for the write
    pub fn send(&self, data: impl Into<Bytes>) -> Result<(), SessionError> {
        let data = data.into();
        let slot = lock_slot(&self.outbound);

        let queued = match slot.as_ref() {
            // Nothing to put on the wire
            Some(_) if data.is_empty() => return Ok(()),
            Some(tx) => tx.send(data).is_ok(),
            None => false,
        };
        drop(slot);

        if queued {
            Ok(())
        } else {
            let state = self.state();
            debug!("[SESSION] Rejected send in state {}", state);
            let _ = self
                .events
                .send(InboundEvent::Notice(notice::NOT_CONNECTED.into()));
            Err(SessionError::InvalidStateUsage {
                operation: "send",
                state,
            })
        }
    }

    /// Stop the session and wait for the actor task to finish
    pub async fn shutdown(self) {
        drop(self.commands);
        if let Err(e) = self.task.await {
            warn!("[SESSION] Manager task ended abnormally: {}", e);
        }
    }

    fn request(&self, command: Command) -> Result<(), SessionError> {
        self.commands.send(command).map_err(|_| SessionError::Closed)
    }
}

struct SessionActor {
    config: SessionConfig,
    transport: Transport,
    fsm: SessionStateMachine,
    worker: Option<ConnectionWorker>,
    peer: Option<PeerIdentity>,
    next_generation: u64,
    outbound: OutboundSlot,
    events: mpsc::UnboundedSender<InboundEvent>,
    state: watch::Sender<SessionState>,
    signals: mpsc::UnboundedSender<(u64, WorkerSignal)>,
}

impl SessionActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut signals: mpsc::UnboundedReceiver<(u64, WorkerSignal)>,
    ) {
        info!(
            "[SESSION] Manager started (connect via {}, listen: {})",
            self.transport.connector.name(),
            self.transport.can_listen()
        );

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some((generation, signal)) = signals.recv() => {
                    self.handle_signal(generation, signal).await;
                }
            }
        }

        self.teardown().await;
        info!("[SESSION] Manager stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start { reply } => {
                let result = self.start_listening().await;
                let _ = reply.send(result);
            }
            Command::Connect { peer, reply } => {
                self.connect(peer).await;
                let _ = reply.send(());
            }
            Command::Stop { reply } => {
                self.teardown().await;
                self.apply(SessionEvent::Stop);
                let _ = reply.send(());
            }
        }
    }

    async fn start_listening(&mut self) -> Result<(), SessionError> {
        let acceptor = self.transport.acceptor.clone().ok_or_else(|| {
            SessionError::AdapterUnavailable(format!(
                "{} transport cannot accept inbound peers",
                self.transport.connector.name()
            ))
        })?;

        if self.fsm.state() == SessionState::Listening {
            return Ok(());
        }

        self.teardown().await;
        self.settle();
        self.apply(SessionEvent::Start);
        let signals = self.next_signals();
        self.worker = Some(ConnectionWorker::spawn_listen(
            acceptor,
            self.config.clone(),
            signals,
        ));
        Ok(())
    }

    async fn connect(&mut self, peer: PeerIdentity) {
        info!("[SESSION] Connect requested: {}", peer);
        self.teardown().await;
        self.settle();
        self.apply(SessionEvent::Connect);
        let signals = self.next_signals();
        self.worker = Some(ConnectionWorker::spawn_connect(
            self.transport.connector.clone(),
            peer,
            self.config.clone(),
            signals,
        ));
    }

    async fn handle_signal(&mut self, generation: u64, signal: WorkerSignal) {
        let current = self.worker.as_ref().map(ConnectionWorker::generation);
        if current != Some(generation) {
            debug!("[SESSION] Dropping signal from stale worker {}: {:?}", generation, signal);
            return;
        }

        match signal {
            WorkerSignal::Accepted { peer } => {
                self.peer = Some(peer);
                self.apply(SessionEvent::InboundAccepted);
            }
            WorkerSignal::Established { peer, outbound } => {
                *lock_slot(&self.outbound) = Some(outbound);
                self.peer = Some(peer.clone());
                if self.apply(SessionEvent::Established) {
                    self.emit(InboundEvent::PeerBound(peer));
                }
            }
            WorkerSignal::Data(data) => {
                if let Some(peer) = self.peer.clone() {
                    self.emit(InboundEvent::DataReceived { data, peer });
                }
            }
            WorkerSignal::Sent(data) => {
                self.emit(InboundEvent::DataSent(data));
            }
            WorkerSignal::Failed { reason } => {
                let listening = matches!(
                    self.worker.as_ref().map(ConnectionWorker::mode),
                    Some(WorkerMode::Listen)
                );
                self.teardown().await;

                if listening {
                    self.apply(SessionEvent::ListenFailed);
                    self.emit(InboundEvent::Notice(format!("Listening failed: {}", reason)));
                    // A broken acceptor would fail again
                    self.recover(&SessionError::AdapterUnavailable(reason)).await;
                } else {
                    self.apply(SessionEvent::ConnectFailed);
                    self.emit(InboundEvent::Notice(format!(
                        "{}: {}",
                        notice::UNABLE_TO_CONNECT,
                        reason
                    )));
                    self.recover(&SessionError::ConnectFailed(reason)).await;
                }
            }
            WorkerSignal::Closed { reason } => {
                warn!("[SESSION] Connection lost: {}", reason);
                self.teardown().await;
                self.apply(SessionEvent::StreamClosed);
                self.emit(InboundEvent::Notice(notice::CONNECTION_LOST.into()));
                self.recover(&SessionError::StreamFault(reason)).await;
            }
        }
    }

    /// Resume listening after a recoverable failure, when configured to
    async fn recover(&mut self, error: &SessionError) {
        if !error.is_recoverable() {
            debug!("[SESSION] Staying idle after: {}", error);
            return;
        }
        if !self.config.relisten || !self.transport.can_listen() {
            return;
        }
        if let Err(e) = self.start_listening().await {
            warn!("[SESSION] Could not resume listening: {}", e);
        }
    }

    /// Announce the end of an abandoned attempt or session before moving on
    fn settle(&mut self) {
        if matches!(
            self.fsm.state(),
            SessionState::Connecting | SessionState::Connected
        ) {
            self.apply(SessionEvent::Stop);
        }
    }

    /// Close the outbound path and wait for the worker to exit
    async fn teardown(&mut self) {
        lock_slot(&self.outbound).take();
        self.peer = None;
        if let Some(worker) = self.worker.take() {
            debug!("[SESSION] Tearing down worker {}", worker.generation());
            worker.shutdown().await;
        }
    }

    fn next_signals(&mut self) -> SignalTx {
        self.next_generation += 1;
        SignalTx::new(self.next_generation, self.signals.clone())
    }

    /// Apply an event to the state machine, announcing any state change
    fn apply(&mut self, event: SessionEvent) -> bool {
        match self.fsm.process_event(event) {
            TransitionResult::Success(state) => {
                info!("[SESSION] State -> {} ({:?})", state, event);
                self.state.send_replace(state);
                self.emit(InboundEvent::StateChanged(state));
                true
            }
            TransitionResult::Unchanged(_) => false,
            TransitionResult::Invalid { from, event } => {
                warn!("[SESSION] Ignoring {:?} in state {}", event, from);
                false
            }
        }
    }

    fn emit(&self, event: InboundEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryNetwork, StreamCounter, TcpAcceptor, TcpConnector};
    use battletap_shared::state_machine::is_valid_transition;
    use battletap_shared::wire;
    use proptest::prelude::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);
    const QUIET: Duration = Duration::from_millis(150);

    async fn next_event(events: &mut EventReceiver) -> InboundEvent {
        timeout(WAIT, events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    /// Collect events until the channel stays quiet for `QUIET`
    async fn drain(events: &mut EventReceiver) -> Vec<InboundEvent> {
        let mut seen = Vec::new();
        while let Ok(Some(event)) = timeout(QUIET, events.recv()).await {
            seen.push(event);
        }
        seen
    }

    fn state_changed(state: SessionState) -> InboundEvent {
        InboundEvent::StateChanged(state)
    }

    fn memory_manager(
        network: &MemoryNetwork,
        name: &str,
        config: SessionConfig,
    ) -> (SessionManager, EventReceiver, Arc<StreamCounter>) {
        let counter = StreamCounter::new();
        let connector = network.connector(name).with_counter(counter.clone());
        let acceptor = network.acceptor(name).with_counter(counter.clone());
        let transport = Transport::new(Arc::new(connector), Arc::new(acceptor));
        let (manager, events) = SessionManager::new(config, transport);
        (manager, events, counter)
    }

    /// Start listening and accept an injected "peer-42"
    async fn connected_board(
        config: SessionConfig,
    ) -> (MemoryNetwork, SessionManager, EventReceiver, crate::transport::RemoteEnd) {
        let network = MemoryNetwork::new();
        let (manager, mut events, _) = memory_manager(&network, "board", config);

        manager.start().await.unwrap();
        assert_eq!(next_event(&mut events).await, state_changed(SessionState::Listening));

        let remote = network.inject("board", "peer-42").unwrap();
        assert_eq!(next_event(&mut events).await, state_changed(SessionState::Connecting));
        assert_eq!(next_event(&mut events).await, state_changed(SessionState::Connected));
        assert_eq!(
            next_event(&mut events).await,
            InboundEvent::PeerBound(PeerIdentity::new("peer-42"))
        );
        assert_eq!(manager.state(), SessionState::Connected);

        (network, manager, events, remote)
    }

    #[tokio::test]
    async fn test_inbound_peer_is_bound_in_order() {
        let (_network, manager, mut events, _remote) =
            connected_board(SessionConfig::default()).await;

        assert!(drain(&mut events).await.is_empty());
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_end_signal_round_trip() {
        let (_network, manager, mut events, mut remote) =
            connected_board(SessionConfig::default()).await;

        manager.send(Bytes::from_static(wire::END_SIGNAL)).unwrap();
        assert_eq!(
            next_event(&mut events).await,
            InboundEvent::DataSent(Bytes::from_static(b"end"))
        );

        let mut buf = [0u8; 16];
        let n = timeout(WAIT, remote.stream.read(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf[..n], b"end");
        // Exactly one write: nothing else follows
        assert!(timeout(QUIET, remote.stream.read(&mut buf)).await.is_err());

        remote.stream.write_all(b"end").await.unwrap();
        match next_event(&mut events).await {
            InboundEvent::DataReceived { data, peer } => {
                assert!(wire::is_end_signal(&data));
                assert_eq!(peer.as_str(), "peer-42");
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(drain(&mut events).await.is_empty());

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_send_rejected_unless_connected() {
        let network = MemoryNetwork::new();
        let (manager, mut events, _) = memory_manager(&network, "board", SessionConfig::default());

        let err = manager.send("end").unwrap_err();
        assert_eq!(
            err,
            SessionError::InvalidStateUsage {
                operation: "send",
                state: SessionState::None,
            }
        );
        assert_eq!(
            next_event(&mut events).await,
            InboundEvent::Notice(notice::NOT_CONNECTED.into())
        );

        manager.start().await.unwrap();
        assert_eq!(next_event(&mut events).await, state_changed(SessionState::Listening));

        assert!(matches!(
            manager.send("end"),
            Err(SessionError::InvalidStateUsage {
                state: SessionState::Listening,
                ..
            })
        ));
        // Only the notice: no state change, no data
        assert_eq!(
            drain(&mut events).await,
            vec![InboundEvent::Notice(notice::NOT_CONNECTED.into())]
        );
        assert_eq!(manager.state(), SessionState::Listening);
    }

    #[tokio::test]
    async fn test_empty_send_writes_nothing() {
        let (_network, manager, mut events, mut remote) =
            connected_board(SessionConfig::default()).await;

        manager.send(Bytes::new()).unwrap();
        assert!(drain(&mut events).await.is_empty());

        let mut buf = [0u8; 4];
        assert!(timeout(QUIET, remote.stream.read(&mut buf)).await.is_err());
    }

    #[tokio::test]
    async fn test_stream_fault_tears_down_once() {
        let (_network, manager, mut events, remote) =
            connected_board(SessionConfig::default().without_relisten()).await;

        // Make the write loop hit the fault as well as the read loop
        let _ = manager.send("end");
        remote.fault();

        let seen = drain(&mut events).await;
        let nones = seen
            .iter()
            .filter(|e| **e == state_changed(SessionState::None))
            .count();
        assert_eq!(nones, 1, "events: {:?}", seen);
        assert!(seen.contains(&InboundEvent::Notice(notice::CONNECTION_LOST.into())));
        assert!(!seen.iter().any(|e| matches!(e, InboundEvent::DataReceived { .. })));
        assert_eq!(manager.state(), SessionState::None);
        assert!(manager.send("end").is_err());
    }

    #[tokio::test]
    async fn test_lost_connection_resumes_listening() {
        let (network, manager, mut events, remote) =
            connected_board(SessionConfig::default()).await;

        drop(remote);
        assert_eq!(next_event(&mut events).await, state_changed(SessionState::None));
        assert_eq!(
            next_event(&mut events).await,
            InboundEvent::Notice(notice::CONNECTION_LOST.into())
        );
        assert_eq!(next_event(&mut events).await, state_changed(SessionState::Listening));

        // The board takes the next challenger
        let _remote = network.inject("board", "peer-43").unwrap();
        assert_eq!(next_event(&mut events).await, state_changed(SessionState::Connecting));
        assert_eq!(next_event(&mut events).await, state_changed(SessionState::Connected));
        assert_eq!(
            next_event(&mut events).await,
            InboundEvent::PeerBound(PeerIdentity::new("peer-43"))
        );
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_while_connecting_unblocks() {
        let network = MemoryNetwork::new();
        network.stall("ghost");
        let (manager, mut events, counter) =
            memory_manager(&network, "board", SessionConfig::default());

        manager.connect("ghost").await.unwrap();
        assert_eq!(next_event(&mut events).await, state_changed(SessionState::Connecting));

        timeout(Duration::from_secs(1), manager.stop())
            .await
            .expect("stop should unblock the pending connect")
            .unwrap();
        assert_eq!(next_event(&mut events).await, state_changed(SessionState::None));

        // Nothing from the abandoned attempt
        assert!(drain(&mut events).await.is_empty());
        assert_eq!(counter.live(), 0);
        assert_eq!(manager.state(), SessionState::None);
    }

    #[tokio::test]
    async fn test_connect_failure_resumes_listening() {
        let network = MemoryNetwork::new();
        let (manager, mut events, _) = memory_manager(&network, "board", SessionConfig::default());

        manager.start().await.unwrap();
        assert_eq!(next_event(&mut events).await, state_changed(SessionState::Listening));

        manager.connect("nobody").await.unwrap();
        assert_eq!(next_event(&mut events).await, state_changed(SessionState::Connecting));
        assert_eq!(next_event(&mut events).await, state_changed(SessionState::None));
        match next_event(&mut events).await {
            InboundEvent::Notice(text) => assert!(text.starts_with(notice::UNABLE_TO_CONNECT)),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(next_event(&mut events).await, state_changed(SessionState::Listening));
    }

    #[tokio::test]
    async fn test_connect_timeout_without_acceptor() {
        let network = MemoryNetwork::new();
        network.stall("ghost");
        let config = SessionConfig {
            connect_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let transport = Transport::connect_only(Arc::new(network.connector("solo")));
        let (manager, mut events) = SessionManager::new(config, transport);

        manager.connect("ghost").await.unwrap();
        assert_eq!(next_event(&mut events).await, state_changed(SessionState::Connecting));
        assert_eq!(next_event(&mut events).await, state_changed(SessionState::None));
        match next_event(&mut events).await {
            InboundEvent::Notice(text) => assert!(text.contains("timed out")),
            other => panic!("unexpected event {:?}", other),
        }
        // Cannot listen, so it stays in NONE
        assert!(drain(&mut events).await.is_empty());
        assert_eq!(manager.state(), SessionState::None);
    }

    #[tokio::test]
    async fn test_start_without_acceptor_is_unavailable() {
        let network = MemoryNetwork::new();
        let transport = Transport::connect_only(Arc::new(network.connector("solo")));
        let (manager, mut events) = SessionManager::new(SessionConfig::default(), transport);

        let err = manager.start().await.unwrap_err();
        assert!(matches!(err, SessionError::AdapterUnavailable(_)));
        assert!(drain(&mut events).await.is_empty());
        assert_eq!(manager.state(), SessionState::None);
    }

    #[tokio::test]
    async fn test_rapid_connects_keep_one_handle() {
        let network = MemoryNetwork::new();
        let _a = network.remote_listener("a");
        let _b = network.remote_listener("b");
        let (manager, mut events, counter) =
            memory_manager(&network, "board", SessionConfig::default().without_relisten());

        for _ in 0..10 {
            manager.connect("a").await.unwrap();
            manager.connect("b").await.unwrap();
        }

        let mut state = manager.watch_state();
        timeout(WAIT, state.wait_for(|s| *s == SessionState::Connected))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(counter.peak(), 1);
        assert_eq!(counter.live(), 1);

        let bound: Vec<_> = drain(&mut events)
            .await
            .into_iter()
            .filter_map(|e| match e {
                InboundEvent::PeerBound(peer) => Some(peer),
                _ => None,
            })
            .collect();
        assert_eq!(bound.last(), Some(&PeerIdentity::new("b")));

        manager.stop().await.unwrap();
        assert_eq!(counter.live(), 0);
    }

    #[tokio::test]
    async fn test_listen_failure_stays_idle() {
        let network = MemoryNetwork::new();
        let (manager, mut events, _) = memory_manager(&network, "board", SessionConfig::default());

        manager.start().await.unwrap();
        assert_eq!(next_event(&mut events).await, state_changed(SessionState::Listening));

        // Taking over the name closes the board's inbound queue
        let _thief = network.remote_listener("board");
        assert_eq!(next_event(&mut events).await, state_changed(SessionState::None));
        match next_event(&mut events).await {
            InboundEvent::Notice(text) => assert!(text.starts_with("Listening failed")),
            other => panic!("unexpected event {:?}", other),
        }
        // Not recoverable, so no relisten despite the default config
        assert!(drain(&mut events).await.is_empty());
        assert_eq!(manager.state(), SessionState::None);
    }

    #[tokio::test]
    async fn test_connect_while_connected_stops_first() {
        let (network, manager, mut events, _remote) =
            connected_board(SessionConfig::default()).await;
        let _b = network.remote_listener("b");

        manager.connect("b").await.unwrap();
        assert_eq!(next_event(&mut events).await, state_changed(SessionState::None));
        assert_eq!(next_event(&mut events).await, state_changed(SessionState::Connecting));
        assert_eq!(next_event(&mut events).await, state_changed(SessionState::Connected));
        assert_eq!(
            next_event(&mut events).await,
            InboundEvent::PeerBound(PeerIdentity::new("b"))
        );

        manager.start().await.unwrap();
        assert_eq!(next_event(&mut events).await, state_changed(SessionState::None));
        assert_eq!(next_event(&mut events).await, state_changed(SessionState::Listening));
        assert!(drain(&mut events).await.is_empty());
    }

    #[tokio::test]
    async fn test_connect_while_connecting_announces_abandon() {
        let network = MemoryNetwork::new();
        network.stall("ghost");
        let (manager, mut events, _) = memory_manager(&network, "board", SessionConfig::default());

        manager.connect("ghost").await.unwrap();
        assert_eq!(next_event(&mut events).await, state_changed(SessionState::Connecting));

        manager.connect("ghost").await.unwrap();
        assert_eq!(
            drain(&mut events).await,
            vec![
                state_changed(SessionState::None),
                state_changed(SessionState::Connecting),
            ]
        );
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_writes_in_order_and_reads_bounded() {
        let config = SessionConfig {
            read_buffer_size: 16,
            ..Default::default()
        };
        let (_network, manager, mut events, mut remote) = connected_board(config).await;

        // Larger than the pipe, so the write loop has to wait on the reader
        let large = Bytes::from(vec![7u8; 10_000]);
        manager.send(large.clone()).unwrap();
        manager.send("end").unwrap();

        let mut received = Vec::new();
        let mut buf = [0u8; 1024];
        while received.len() < 10_003 {
            let n = timeout(WAIT, remote.stream.read(&mut buf)).await.unwrap().unwrap();
            assert!(n > 0);
            received.extend_from_slice(&buf[..n]);
        }
        assert_eq!(&received[..10_000], &large[..]);
        assert_eq!(&received[10_000..], b"end");

        assert_eq!(next_event(&mut events).await, InboundEvent::DataSent(large));
        assert_eq!(
            next_event(&mut events).await,
            InboundEvent::DataSent(Bytes::from_static(b"end"))
        );

        let payload: Vec<u8> = (0..40u8).collect();
        remote.stream.write_all(&payload).await.unwrap();

        let mut delivered = Vec::new();
        while delivered.len() < payload.len() {
            match next_event(&mut events).await {
                InboundEvent::DataReceived { data, .. } => {
                    assert!(data.len() <= 16, "chunk of {} bytes", data.len());
                    delivered.extend_from_slice(&data);
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(delivered, payload);
        manager.shutdown().await;
    }

    #[derive(Debug, Clone, Copy)]
    enum Op {
        Start,
        ConnectReachable,
        ConnectUnreachable,
        Stop,
    }

    fn any_op() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::Start),
            Just(Op::ConnectReachable),
            Just(Op::ConnectUnreachable),
            Just(Op::Stop),
        ]
    }

    /// Drive a fresh manager through `ops`, then stop it
    ///
    /// Returns every announced state, the final state and the stream counter.
    async fn run_ops(ops: Vec<Op>) -> (Vec<SessionState>, SessionState, Arc<StreamCounter>) {
        let network = MemoryNetwork::new();
        let _a = network.remote_listener("a");
        let (manager, mut events, counter) =
            memory_manager(&network, "board", SessionConfig::default());

        for op in ops {
            match op {
                Op::Start => manager.start().await.unwrap(),
                Op::ConnectReachable => manager.connect("a").await.unwrap(),
                Op::ConnectUnreachable => manager.connect("nobody").await.unwrap(),
                Op::Stop => manager.stop().await.unwrap(),
            }
            assert!(counter.live() <= 1);
            tokio::task::yield_now().await;
        }
        manager.stop().await.unwrap();

        let states = drain(&mut events)
            .await
            .into_iter()
            .filter_map(|e| match e {
                InboundEvent::StateChanged(state) => Some(state),
                _ => None,
            })
            .collect();
        let last = manager.state();
        manager.shutdown().await;
        (states, last, counter)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn prop_transitions_follow_table(ops in proptest::collection::vec(any_op(), 1..24)) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let (states, last, counter) = runtime.block_on(run_ops(ops));

            let mut from = SessionState::None;
            for to in states {
                prop_assert!(is_valid_transition(from, to), "{} -> {}", from, to);
                from = to;
            }
            prop_assert_eq!(from, SessionState::None);
            prop_assert_eq!(last, SessionState::None);
            prop_assert!(counter.peak() <= 1);
            prop_assert_eq!(counter.live(), 0);
        }
    }

    #[tokio::test]
    async fn test_two_nodes_over_tcp() {
        let acceptor = TcpAcceptor::bind("127.0.0.1:0").await.unwrap();
        let addr = acceptor.local_addr().unwrap().to_string();

        let (board, mut board_events) = SessionManager::new(
            SessionConfig::default(),
            Transport::new(Arc::new(TcpConnector::new()), Arc::new(acceptor)),
        );
        let (challenger, mut challenger_events) = SessionManager::new(
            SessionConfig::default(),
            Transport::connect_only(Arc::new(TcpConnector::new())),
        );

        board.start().await.unwrap();
        assert_eq!(next_event(&mut board_events).await, state_changed(SessionState::Listening));

        challenger.connect(addr.as_str()).await.unwrap();
        assert_eq!(
            next_event(&mut challenger_events).await,
            state_changed(SessionState::Connecting)
        );
        assert_eq!(
            next_event(&mut challenger_events).await,
            state_changed(SessionState::Connected)
        );
        assert_eq!(
            next_event(&mut challenger_events).await,
            InboundEvent::PeerBound(PeerIdentity::new(addr.clone()))
        );

        assert_eq!(next_event(&mut board_events).await, state_changed(SessionState::Connecting));
        assert_eq!(next_event(&mut board_events).await, state_changed(SessionState::Connected));
        assert!(matches!(next_event(&mut board_events).await, InboundEvent::PeerBound(_)));

        challenger.send("end").unwrap();
        assert_eq!(
            next_event(&mut challenger_events).await,
            InboundEvent::DataSent(Bytes::from_static(b"end"))
        );
        match next_event(&mut board_events).await {
            InboundEvent::DataReceived { data, .. } => assert!(wire::is_end_signal(&data)),
            other => panic!("unexpected event {:?}", other),
        }

        challenger.stop().await.unwrap();
        assert_eq!(
            next_event(&mut challenger_events).await,
            state_changed(SessionState::None)
        );
        assert_eq!(next_event(&mut board_events).await, state_changed(SessionState::None));
        assert_eq!(
            next_event(&mut board_events).await,
            InboundEvent::Notice(notice::CONNECTION_LOST.into())
        );
        assert_eq!(next_event(&mut board_events).await, state_changed(SessionState::Listening));

        board.shutdown().await;
        challenger.shutdown().await;
    }
}
