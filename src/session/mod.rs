//! Peer session management
//!
//! This module handles:
//! - The session state machine (NONE, LISTENING, CONNECTING, CONNECTED)
//! - One connection worker at a time, listening or connecting
//! - Concurrent read and write loops over the established stream
//! - Ordered event delivery to a single listener

mod listener;
mod manager;
mod worker;

pub use listener::{spawn_listener, EventReceiver, SessionListener};
pub use manager::SessionManager;
