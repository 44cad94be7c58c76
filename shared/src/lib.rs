//! BattleTap Shared Session Types
//!
//! This crate provides the types exchanged between a session manager and its
//! listener, the session state machine, and the error taxonomy used by both
//! peers of a two-player game.

pub mod error;
pub mod state_machine;

use bytes::Bytes;
use std::fmt;

pub use error::SessionError;
pub use state_machine::{SessionEvent, SessionStateMachine, TransitionResult};

/// Wire-level constants
///
/// The wire carries raw bytes with no header or length prefix. Whatever a
/// single read call returns is treated as one logical message, so a payload
/// split across reads arrives as two messages.
pub mod wire {
    /// Payload that tells the other player the game is over
    pub const END_SIGNAL: &[u8] = b"end";

    /// Default upper bound for a single read call
    pub const DEFAULT_READ_BUFFER_SIZE: usize = 1024;

    /// Check whether a received chunk is the end-of-game signal
    pub fn is_end_signal(chunk: &[u8]) -> bool {
        chunk == END_SIGNAL
    }
}

/// Human-readable notices delivered to the listener
pub mod notice {
    pub const UNABLE_TO_CONNECT: &str = "Unable to connect device";
    pub const CONNECTION_LOST: &str = "Device connection was lost";
    pub const NOT_CONNECTED: &str = "You are not connected to a device";
}

/// Opaque identity of a remote endpoint (socket address, Bluetooth MAC, ...)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerIdentity(String);

impl PeerIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerIdentity {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for PeerIdentity {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Connection state of a session manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub enum SessionState {
    /// Doing nothing
    #[default]
    None,
    /// Waiting for an inbound peer
    Listening,
    /// Binding a stream (outbound attempt or freshly accepted inbound peer)
    Connecting,
    /// Stream established, read and write loops running
    Connected,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::None => write!(f, "NONE"),
            SessionState::Listening => write!(f, "LISTENING"),
            SessionState::Connecting => write!(f, "CONNECTING"),
            SessionState::Connected => write!(f, "CONNECTED"),
        }
    }
}

/// Events delivered to the session listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    /// The session moved to a new state
    StateChanged(SessionState),
    /// A chunk of bytes arrived from the connected peer
    DataReceived { data: Bytes, peer: PeerIdentity },
    /// An outbound message was fully written to the stream
    DataSent(Bytes),
    /// A peer has been bound to the session
    PeerBound(PeerIdentity),
    /// Human-readable report of a failure or usage error
    Notice(String),
}
