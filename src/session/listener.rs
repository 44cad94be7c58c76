//! Event delivery to the session listener
//!
//! The `EventReceiver` returned by `SessionManager::new` is the primary
//! interface; a caller that also drives the manager (the `battletap` binary)
//! drains it directly in its own select loop. `spawn_listener` covers
//! callback-style consumers that only observe events.

use battletap_shared::InboundEvent;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Receiving end of a session manager's event channel
pub type EventReceiver = mpsc::UnboundedReceiver<InboundEvent>;

/// Reacts to session events
///
/// Called from a single dispatch task, never concurrently. Implementations
/// must not block for long.
pub trait SessionListener: Send + 'static {
    fn on_event(&mut self, event: InboundEvent);
}

impl<F> SessionListener for F
where
    F: FnMut(InboundEvent) + Send + 'static,
{
    fn on_event(&mut self, event: InboundEvent) {
        self(event)
    }
}

/// Drain `events` into `listener` on a dedicated task
///
/// The task ends once the session manager is dropped.
pub fn spawn_listener<L: SessionListener>(mut events: EventReceiver, mut listener: L) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            listener.on_event(event);
        }
        debug!("[SESSION] Event channel closed");
    })
}
