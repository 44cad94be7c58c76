//! Stream transports a session can run over
//!
//! TCP and the in-memory network are always available; RFCOMM and device
//! discovery need the `bluetooth` feature (BlueZ via `bluer`).

#[cfg(feature = "bluetooth")]
pub mod bt_discovery;
pub mod memory;
#[cfg(feature = "bluetooth")]
pub mod rfcomm;
pub mod tcp;
pub mod traits;

#[cfg(feature = "bluetooth")]
pub use bt_discovery::{BtDiscovery, BtDiscoveryConfig, DiscoveredPeer, DISCOVERABLE_WINDOW};
pub use memory::{MemoryAcceptor, MemoryConnector, MemoryNetwork, RemoteEnd, RemoteListener, StreamCounter};
#[cfg(feature = "bluetooth")]
pub use rfcomm::{RfcommAcceptor, RfcommConnector, RfcommTransportStream, DEFAULT_RFCOMM_CHANNEL};
pub use tcp::{TcpAcceptor, TcpConnector, TcpTransportStream};
pub use traits::{BoxedStream, Transport, TransportAcceptor, TransportConnector, TransportStream};
