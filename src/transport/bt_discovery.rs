//! Bluetooth device discovery for finding opponents

use anyhow::Result;
use battletap_shared::{PeerIdentity, SessionError};
use bluer::{Adapter, Address, Device};
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info};

/// Configuration for Bluetooth discovery
#[derive(Debug, Clone)]
pub struct BtDiscoveryConfig {
    /// How long to scan for devices
    pub scan_duration: Duration,
    /// Device name prefix to match (all devices when unset)
    pub name_prefix: Option<String>,
}

impl Default for BtDiscoveryConfig {
    fn default() -> Self {
        Self {
            scan_duration: Duration::from_secs(12),
            name_prefix: None,
        }
    }
}

/// How long the listening side stays discoverable
pub const DISCOVERABLE_WINDOW: Duration = Duration::from_secs(300);

/// Information about a discovered device
#[derive(Debug, Clone)]
pub struct DiscoveredPeer {
    /// Bluetooth MAC address
    pub address: Address,
    /// Advertised name, if any
    pub name: Option<String>,
    /// Signal strength (if available)
    pub rssi: Option<i16>,
}

impl DiscoveredPeer {
    /// Identity to hand to `SessionManager::connect`
    pub fn identity(&self) -> PeerIdentity {
        PeerIdentity::new(self.address.to_string())
    }
}

/// Bluetooth device discovery service
pub struct BtDiscovery {
    config: BtDiscoveryConfig,
}

impl BtDiscovery {
    /// Create a new discovery service
    pub fn new(config: BtDiscoveryConfig) -> Self {
        Self { config }
    }

    /// Get the default Bluetooth adapter, powering it on when needed
    pub async fn get_adapter() -> Result<Adapter, SessionError> {
        let unavailable = |e: bluer::Error| SessionError::AdapterUnavailable(e.to_string());

        let session = bluer::Session::new().await.map_err(unavailable)?;
        let adapter = session.default_adapter().await.map_err(unavailable)?;
        if !adapter.is_powered().await.map_err(unavailable)? {
            info!("[BT] Powering on adapter {}", adapter.name());
            adapter.set_powered(true).await.map_err(unavailable)?;
        }
        Ok(adapter)
    }

    /// Make the adapter visible to scanning opponents for `window`
    ///
    /// A zero window keeps the adapter discoverable until switched off.
    pub async fn make_discoverable(adapter: &Adapter, window: Duration) -> Result<(), SessionError> {
        let unavailable = |e: bluer::Error| SessionError::AdapterUnavailable(e.to_string());

        adapter
            .set_discoverable_timeout(discoverable_timeout_secs(window))
            .await
            .map_err(unavailable)?;
        if !adapter.is_discoverable().await.map_err(unavailable)? {
            adapter.set_discoverable(true).await.map_err(unavailable)?;
        }
        info!("[BT] Adapter {} discoverable for {:?}", adapter.name(), window);
        Ok(())
    }

    /// Scan for nearby devices, strongest signal first
    pub async fn discover(&self, adapter: &Adapter) -> Result<Vec<DiscoveredPeer>> {
        let mut peers = Vec::new();
        let mut seen: HashSet<Address> = HashSet::new();

        info!("[BT] Discovery started");
        let discover = adapter.discover_devices().await?;
        tokio::pin!(discover);

        let scan_result = timeout(self.config.scan_duration, async {
            use futures::StreamExt;
            while let Some(evt) = discover.next().await {
                if let bluer::AdapterEvent::DeviceAdded(addr) = evt {
                    if !seen.insert(addr) {
                        continue;
                    }

                    if let Ok(device) = adapter.device(addr) {
                        if let Some(peer) = self.inspect(&device).await {
                            debug!("[BT] Device: {:?}, {}", peer.name, peer.address);
                            peers.push(peer);
                        }
                    }
                }
            }
        })
        .await;

        // Timeout is expected, not an error
        if scan_result.is_err() {
            info!("[BT] Discovery finished: {} device(s)", peers.len());
        }

        sort_by_signal(&mut peers);
        Ok(peers)
    }

    /// Build a peer entry if the device passes the name filter
    async fn inspect(&self, device: &Device) -> Option<DiscoveredPeer> {
        let name = device.name().await.ok().flatten();
        if !matches_prefix(self.config.name_prefix.as_deref(), name.as_deref()) {
            return None;
        }

        Some(DiscoveredPeer {
            address: device.address(),
            name,
            rssi: device.rssi().await.ok().flatten(),
        })
    }
}

fn discoverable_timeout_secs(window: Duration) -> u32 {
    u32::try_from(window.as_secs()).unwrap_or(u32::MAX)
}

fn matches_prefix(prefix: Option<&str>, name: Option<&str>) -> bool {
    match (prefix, name) {
        (None, _) => true,
        (Some(prefix), Some(name)) => name.starts_with(prefix),
        (Some(_), None) => false,
    }
}

fn sort_by_signal(peers: &mut [DiscoveredPeer]) {
    peers.sort_by(|a, b| {
        let rssi_a = a.rssi.unwrap_or(i16::MIN);
        let rssi_b = b.rssi.unwrap_or(i16::MIN);
        rssi_b.cmp(&rssi_a)
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BtDiscoveryConfig::default();
        assert_eq!(config.scan_duration, Duration::from_secs(12));
        assert!(config.name_prefix.is_none());
    }

    #[test]
    fn test_discoverable_timeout() {
        assert_eq!(discoverable_timeout_secs(DISCOVERABLE_WINDOW), 300);
        assert_eq!(discoverable_timeout_secs(Duration::ZERO), 0);
        assert_eq!(discoverable_timeout_secs(Duration::from_secs(u64::MAX)), u32::MAX);
    }

    #[test]
    fn test_name_filter() {
        assert!(matches_prefix(None, None));
        assert!(matches_prefix(Some("Battle"), Some("BattleTap-7")));
        assert!(!matches_prefix(Some("Battle"), Some("Headset")));
        assert!(!matches_prefix(Some("Battle"), None));
    }

    #[test]
    fn test_sort_by_signal() {
        let peer = |last: u8, rssi: Option<i16>| DiscoveredPeer {
            address: Address::new([0, 0, 0, 0, 0, last]),
            name: None,
            rssi,
        };
        let mut peers = vec![peer(1, Some(-80)), peer(2, None), peer(3, Some(-40))];
        sort_by_signal(&mut peers);

        let order: Vec<u8> = peers.iter().map(|p| p.address.0[5]).collect();
        assert_eq!(order, vec![3, 1, 2]);
        assert_eq!(peers[0].identity().as_str(), "00:00:00:00:00:03");
    }
}
