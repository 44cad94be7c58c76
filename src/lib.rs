//! BattleTap peer node
//!
//! Pairs two players over a reliable byte stream and lets either side send
//! the `"end"` signal that finishes the game. The session manager owns the
//! connection state; transports plug in underneath it.

pub mod config;
pub mod session;
pub mod transport;

pub use battletap_shared::{
    notice, wire, InboundEvent, PeerIdentity, SessionError, SessionState,
};
pub use config::SessionConfig;
pub use session::{spawn_listener, EventReceiver, SessionListener, SessionManager};
pub use transport::Transport;
