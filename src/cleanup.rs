//! Startup garbage collection for crashed sessions.
//!
//! If appfence is killed with `SIGKILL` or the device loses power, the
//! controller's cleanup never runs. This leaves:
//!
//! - The `appfence` chain, still linked from `OUTPUT`
//! - `<prefix><n>` dummy interfaces with their routing tables
//!
//! Run [`cleanup_stale_resources`] before building a controller.

use std::fs;
use std::path::Path;

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::privileged::{PrivilegedCommand, PrivilegedExecutor};

/// Leftovers found on the system.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StaleResources {
    /// Whether our packet-filter chain exists.
    pub chain: bool,
    /// Dummy interfaces carrying our name prefix.
    pub interfaces: Vec<String>,
}

impl StaleResources {
    /// Whether nothing was found.
    pub fn is_empty(&self) -> bool {
        !self.chain && self.interfaces.is_empty()
    }
}

/// Find leftovers from an earlier run.
pub fn list_stale_resources(config: &Config, executor: &dyn PrivilegedExecutor) -> StaleResources {
    let chain = config.privileged.chain_name();
    StaleResources {
        chain: executor
            .execute(&PrivilegedCommand::iptables(["-S", chain]))
            .is_ok(),
        interfaces: stale_interfaces(
            &config.platform.sys_class_net(),
            config.interfaces.name_prefix(),
        ),
    }
}

fn stale_interfaces(sys_class_net: &Path, prefix: &str) -> Vec<String> {
    let entries = match fs::read_dir(sys_class_net) {
        Ok(e) => e,
        Err(e) => {
            debug!("Cannot read {}: {}", sys_class_net.display(), e);
            return Vec::new();
        }
    };

    let mut found: Vec<String> = entries
        .flatten()
        .map(|entry| entry.file_name().to_string_lossy().to_string())
        .filter(|name| host_octet(name, prefix).is_some())
        .collect();
    found.sort();
    found
}

/// `<prefix><n>` with `n` a host octet.
fn host_octet(name: &str, prefix: &str) -> Option<u8> {
    name.strip_prefix(prefix)?.parse().ok()
}

/// Remove leftovers from an earlier run. Returns what was found.
///
/// Every step is best effort; failures are logged and skipped.
pub fn cleanup_stale_resources(config: &Config, executor: &dyn PrivilegedExecutor) -> StaleResources {
    if !executor.is_available() {
        debug!("No superuser shell, skipping stale resource cleanup");
        return StaleResources::default();
    }
    info!("Checking for stale resources from crashed sessions");
    let stale = list_stale_resources(config, executor);

    if stale.chain {
        let chain = config.privileged.chain_name();
        info!("Removing stale chain {}", chain);
        for cmd in [
            PrivilegedCommand::iptables(["-D", "OUTPUT", "-j", chain]),
            PrivilegedCommand::iptables(["-F", chain]),
            PrivilegedCommand::iptables(["-X", chain]),
        ] {
            if let Err(e) = executor.execute(&cmd) {
                warn!("Stale chain cleanup step failed: {}", e);
            }
        }
    }

    let prefix = config.interfaces.name_prefix();
    for name in &stale.interfaces {
        let Some(octet) = host_octet(name, prefix) else {
            continue;
        };
        let table = (config.interfaces.routing_table_base() + u32::from(octet)).to_string();
        info!("Removing stale interface {}", name);
        for cmd in [
            PrivilegedCommand::ip(["rule", "del", "table", table.as_str()]),
            PrivilegedCommand::ip(["route", "flush", "table", table.as_str()]),
            PrivilegedCommand::iptables(["-D", "INPUT", "-i", name.as_str(), "-j", "DROP"]),
            PrivilegedCommand::iptables(["-D", "FORWARD", "-i", name.as_str(), "-j", "DROP"]),
            PrivilegedCommand::ip(["link", "del", name.as_str()]),
        ] {
            // The earlier run may have died before adding some of these.
            if let Err(e) = executor.execute(&cmd) {
                debug!("Stale interface step skipped: {}", e);
            }
        }
    }

    stale
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::privileged::{Program, RecordingExecutor};
    use tempfile::tempdir;

    fn config_with_sysfs(root: &Path) -> Config {
        let mut config = Config::default();
        config.platform.sys_class_net = Some(root.to_path_buf());
        config
    }

    #[test]
    fn test_finds_prefixed_interfaces_only() {
        let dir = tempdir().unwrap();
        for name in ["lo", "wlan0", "af7", "af12", "afx"] {
            fs::create_dir(dir.path().join(name)).unwrap();
        }
        let found = stale_interfaces(dir.path(), "af");
        assert_eq!(found, vec!["af12", "af7"]);
    }

    #[test]
    fn test_cleanup_removes_chain_and_interfaces() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("af9")).unwrap();
        let mut config = config_with_sysfs(dir.path());
        config.interfaces.name_prefix = Some("af".to_string());
        let exec = RecordingExecutor::new(true);

        let stale = cleanup_stale_resources(&config, &exec);
        assert!(stale.chain);
        assert_eq!(stale.interfaces, vec!["af9"]);

        let rendered: Vec<String> = exec.commands().iter().map(|c| c.to_string()).collect();
        assert!(rendered.contains(&"iptables -X appfence".to_string()));
        assert!(rendered.contains(&"ip link del af9".to_string()));
        assert!(rendered.contains(&"ip rule del table 1009".to_string()));
    }

    #[test]
    fn test_cleanup_skipped_without_privilege() {
        let dir = tempdir().unwrap();
        let exec = RecordingExecutor::new(false);
        let stale = cleanup_stale_resources(&config_with_sysfs(dir.path()), &exec);
        assert!(stale.is_empty());
        assert!(exec.commands_for(Program::Iptables).is_empty());
    }
}
