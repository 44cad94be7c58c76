//! Session State Machine
//!
//! Defines the valid transitions between `NONE`, `LISTENING`, `CONNECTING`
//! and `CONNECTED`. The session manager owns one instance and is the only
//! place the state is mutated.

use crate::SessionState;

/// Events that can trigger state transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// `start()` requested
    Start,
    /// An inbound peer was accepted while listening
    InboundAccepted,
    /// `connect(peer)` requested
    Connect,
    /// The stream is established and the loops are running
    Established,
    /// The outbound attempt failed
    ConnectFailed,
    /// The accept call failed
    ListenFailed,
    /// The established stream closed or faulted
    StreamClosed,
    /// `stop()` requested
    Stop,
}

/// Result of a state transition attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionResult {
    /// Transition was valid and state changed
    Success(SessionState),
    /// Transition was valid but the state is unchanged
    Unchanged(SessionState),
    /// Transition was invalid from current state
    Invalid {
        from: SessionState,
        event: SessionEvent,
    },
}

/// The session state machine
#[derive(Debug, Default)]
pub struct SessionStateMachine {
    current_state: SessionState,
}

impl SessionStateMachine {
    /// Create a new state machine in `NONE`
    pub fn new() -> Self {
        Self::default()
    }

    /// Get current state
    pub fn state(&self) -> SessionState {
        self.current_state
    }

    /// Process an event and return the transition result
    pub fn process_event(&mut self, event: SessionEvent) -> TransitionResult {
        match next_state(self.current_state, event) {
            Some(state) if state == self.current_state => TransitionResult::Unchanged(state),
            Some(state) => {
                self.current_state = state;
                TransitionResult::Success(state)
            }
            None => TransitionResult::Invalid {
                from: self.current_state,
                event,
            },
        }
    }
}

/// Get the next state for a given event, if the transition is valid
pub fn next_state(from: SessionState, event: SessionEvent) -> Option<SessionState> {
    use SessionEvent::*;
    use SessionState::*;

    match (from, event) {
        (_, Stop) => Some(None),

        // An active session must be stopped before starting over
        (None, Start) | (Listening, Start) => Some(Listening),
        (None, Connect) | (Listening, Connect) => Some(Connecting),

        // Inbound peers are bound through CONNECTING
        (Listening, InboundAccepted) => Some(Connecting),
        (Listening, ListenFailed) => Some(None),

        (Connecting, Established) => Some(Connected),
        (Connecting, ConnectFailed) => Some(None),

        (Connected, StreamClosed) => Some(None),

        // Invalid transition
        _ => Option::None,
    }
}

/// Check whether `from -> to` is a transition the table allows
pub fn is_valid_transition(from: SessionState, to: SessionState) -> bool {
    use SessionState::*;

    matches!(
        (from, to),
        (None, Listening)
            | (None, Connecting)
            | (Listening, Connecting)
            | (Listening, None)
            | (Connecting, Connected)
            | (Connecting, None)
            | (Connected, None)
    )
}
