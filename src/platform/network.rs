//! Current network type (Wi-Fi vs. cellular).

use std::fs;
use std::path::PathBuf;
use std::sync::RwLock;

use tracing::trace;

/// Kind of network the device is currently using.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkType {
    /// Connected via Wi-Fi.
    Wifi,
    /// Connected via a mobile data modem.
    Cellular,
    /// Connected via something else (ethernet, VPN, ...).
    Other,
    /// No active network.
    None,
}

/// Answers "which network is active right now".
pub trait NetworkTypeProvider: Send + Sync {
    /// Current network type.
    fn current(&self) -> NetworkType;
}

/// Derives the network type from `/sys/class/net/<iface>/operstate`.
///
/// Wi-Fi wins over cellular when both are up, matching how Android routes
/// default traffic.
pub struct SysfsNetworkType {
    root: PathBuf,
    wifi_prefixes: Vec<String>,
    cellular_prefixes: Vec<String>,
}

impl SysfsNetworkType {
    /// Create a provider reading interfaces under `root`.
    pub fn new(root: impl Into<PathBuf>, wifi_prefixes: Vec<String>, cellular_prefixes: Vec<String>) -> Self {
        Self {
            root: root.into(),
            wifi_prefixes,
            cellular_prefixes,
        }
    }

    fn up_interfaces(&self) -> Vec<String> {
        let Ok(entries) = fs::read_dir(&self.root) else {
            return Vec::new();
        };
        entries
            .flatten()
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().to_string();
                let state = fs::read_to_string(entry.path().join("operstate")).ok()?;
                let state = state.trim();
                // Point-to-point modem links often report "unknown" while carrying traffic.
                (state == "up" || state == "unknown").then_some(name)
            })
            .collect()
    }
}

impl NetworkTypeProvider for SysfsNetworkType {
    fn current(&self) -> NetworkType {
        let up = self.up_interfaces();
        trace!("Interfaces up: {:?}", up);

        let matches = |prefixes: &[String]| {
            up.iter()
                .any(|name| prefixes.iter().any(|p| name.starts_with(p.as_str())))
        };

        if matches(&self.wifi_prefixes) {
            NetworkType::Wifi
        } else if matches(&self.cellular_prefixes) {
            NetworkType::Cellular
        } else if up.iter().any(|name| name != "lo") {
            NetworkType::Other
        } else {
            NetworkType::None
        }
    }
}

/// A provider whose answer is set explicitly.
pub struct FixedNetworkType {
    current: RwLock<NetworkType>,
}

impl FixedNetworkType {
    /// Create a provider reporting `network`.
    pub fn new(network: NetworkType) -> Self {
        Self {
            current: RwLock::new(network),
        }
    }

    /// Change the reported network type.
    pub fn set(&self, network: NetworkType) {
        *self.current.write().unwrap_or_else(|p| p.into_inner()) = network;
    }
}

impl NetworkTypeProvider for FixedNetworkType {
    fn current(&self) -> NetworkType {
        *self.current.read().unwrap_or_else(|p| p.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_iface(root: &std::path::Path, name: &str, state: &str) {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("operstate"), format!("{state}\n")).unwrap();
    }

    fn provider(root: &std::path::Path) -> SysfsNetworkType {
        SysfsNetworkType::new(
            root,
            vec!["wlan".to_string()],
            vec!["rmnet".to_string()],
        )
    }

    #[test]
    fn test_wifi_detected() {
        let dir = tempfile::tempdir().unwrap();
        fake_iface(dir.path(), "lo", "unknown");
        fake_iface(dir.path(), "wlan0", "up");
        fake_iface(dir.path(), "rmnet0", "down");

        assert_eq!(provider(dir.path()).current(), NetworkType::Wifi);
    }

    #[test]
    fn test_cellular_detected() {
        let dir = tempfile::tempdir().unwrap();
        fake_iface(dir.path(), "wlan0", "down");
        fake_iface(dir.path(), "rmnet_data0", "up");

        assert_eq!(provider(dir.path()).current(), NetworkType::Cellular);
    }

    #[test]
    fn test_wifi_preferred_over_cellular() {
        let dir = tempfile::tempdir().unwrap();
        fake_iface(dir.path(), "wlan0", "up");
        fake_iface(dir.path(), "rmnet0", "up");

        assert_eq!(provider(dir.path()).current(), NetworkType::Wifi);
    }

    #[test]
    fn test_only_loopback_is_none() {
        let dir = tempfile::tempdir().unwrap();
        fake_iface(dir.path(), "lo", "unknown");

        assert_eq!(provider(dir.path()).current(), NetworkType::None);
    }

    #[test]
    fn test_ethernet_is_other() {
        let dir = tempfile::tempdir().unwrap();
        fake_iface(dir.path(), "eth0", "up");

        assert_eq!(provider(dir.path()).current(), NetworkType::Other);
    }

    #[test]
    fn test_fixed_provider_can_change() {
        let fixed = FixedNetworkType::new(NetworkType::Wifi);
        assert_eq!(fixed.current(), NetworkType::Wifi);
        fixed.set(NetworkType::Cellular);
        assert_eq!(fixed.current(), NetworkType::Cellular);
    }
}
