//! Session configuration

use battletap_shared::wire;
use std::time::Duration;

/// Configuration for a session manager
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Upper bound for one outbound connect attempt
    pub connect_timeout: Duration,
    /// Maximum bytes taken from the stream per read call
    pub read_buffer_size: usize,
    /// Go back to listening after a failed connect or a lost connection
    pub relisten: bool,
    /// Grace period for a clean stream shutdown on teardown
    pub shutdown_grace: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(12),
            read_buffer_size: wire::DEFAULT_READ_BUFFER_SIZE,
            relisten: true,
            shutdown_grace: Duration::from_millis(500),
        }
    }
}

impl SessionConfig {
    /// Same configuration with relisten switched off
    pub fn without_relisten(mut self) -> Self {
        self.relisten = false;
        self
    }
}
