//! Configuration schema definitions.
//!
//! This module defines the structure of the appfence configuration files.
//! Configuration is loaded from multiple sources and merged in order:
//!
//! 1. Embedded defaults
//! 2. System config: `/etc/appfence/config.toml`
//! 3. User config: `~/.config/appfence/config.toml`
//! 4. Additional config file (via `--config` flag)
//!
//! Scalars are stored as `Option` so that a later file only overrides the
//! values it actually sets. Accessors resolve the effective value.

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

/// Default number of concurrent proxy connection handlers.
pub const DEFAULT_WORKER_CAPACITY: usize = 100;

/// Default cap on the bytes buffered while reading a single request.
pub const DEFAULT_MAX_REQUEST_BYTES: usize = 64 * 1024;

/// Default name of the packet-filter chain owned by appfence.
pub const DEFAULT_CHAIN_NAME: &str = "appfence";

/// Default prefix for per-package virtual interfaces.
pub const DEFAULT_INTERFACE_PREFIX: &str = "afence";

/// Top-level configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// App-level proxy settings.
    #[serde(default)]
    pub proxy: ProxySettings,

    /// Privileged packet-filter settings.
    #[serde(default)]
    pub privileged: PrivilegedSettings,

    /// Virtual interface settings.
    #[serde(default)]
    pub interfaces: InterfaceSettings,

    /// Process and bypass monitoring settings.
    #[serde(default)]
    pub monitor: MonitorSettings,

    /// Host platform paths and interface naming.
    #[serde(default)]
    pub platform: PlatformSettings,
}

impl Config {
    /// Merge another config into this one.
    ///
    /// Lists are appended, scalars are overridden when set.
    pub fn merge(&mut self, other: Config) {
        self.proxy.merge(other.proxy);
        self.privileged.merge(other.privileged);
        self.interfaces.merge(other.interfaces);
        self.monitor.merge(other.monitor);
        self.platform.merge(other.platform);
    }
}

/// Settings for the per-package proxy server.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ProxySettings {
    /// Maximum concurrent connection handlers per proxy.
    #[serde(default)]
    pub worker_capacity: Option<usize>,

    /// Maximum bytes buffered for one request before the connection is dropped.
    #[serde(default)]
    pub max_request_bytes: Option<usize>,

    /// Seconds to wait for a client to finish sending its request.
    #[serde(default)]
    pub client_timeout_secs: Option<u64>,

    /// Seconds to wait for the upstream TCP connect.
    #[serde(default)]
    pub connect_timeout_secs: Option<u64>,

    /// Domains blocked in addition to the built-in set.
    #[serde(default)]
    pub blocked_domains: Vec<String>,

    /// URL regexes blocked in addition to the built-in set.
    #[serde(default)]
    pub blocked_url_patterns: Vec<String>,

    /// User-Agent keywords whose requests are blocked.
    #[serde(default)]
    pub blocked_user_agents: Vec<String>,
}

impl ProxySettings {
    fn merge(&mut self, other: ProxySettings) {
        if other.worker_capacity.is_some() {
            self.worker_capacity = other.worker_capacity;
        }
        if other.max_request_bytes.is_some() {
            self.max_request_bytes = other.max_request_bytes;
        }
        if other.client_timeout_secs.is_some() {
            self.client_timeout_secs = other.client_timeout_secs;
        }
        if other.connect_timeout_secs.is_some() {
            self.connect_timeout_secs = other.connect_timeout_secs;
        }
        self.blocked_domains.extend(other.blocked_domains);
        self.blocked_url_patterns.extend(other.blocked_url_patterns);
        self.blocked_user_agents.extend(other.blocked_user_agents);
    }

    /// Effective worker capacity (at least one).
    pub fn worker_capacity(&self) -> usize {
        self.worker_capacity.unwrap_or(DEFAULT_WORKER_CAPACITY).max(1)
    }

    /// Effective request buffer cap.
    pub fn max_request_bytes(&self) -> usize {
        self.max_request_bytes.unwrap_or(DEFAULT_MAX_REQUEST_BYTES)
    }

    /// Effective client read timeout.
    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs.unwrap_or(30))
    }

    /// Effective upstream connect timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.unwrap_or(10))
    }
}

/// Settings for the root-only packet-filter tier.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PrivilegedSettings {
    /// Path or name of the `su` binary.
    #[serde(default)]
    pub su_binary: Option<String>,

    /// Name of the chain appfence creates and jumps to from OUTPUT.
    #[serde(default)]
    pub chain_name: Option<String>,

    /// Interface match used for the Wi-Fi scoped drop (iptables glob).
    #[serde(default)]
    pub wifi_interface: Option<String>,

    /// Interface match used for the cellular scoped drop (iptables glob).
    #[serde(default)]
    pub cellular_interface: Option<String>,

    /// Extra TCP ports dropped for a blocked UID.
    #[serde(default)]
    pub extra_blocked_ports: Vec<u16>,
}

impl PrivilegedSettings {
    fn merge(&mut self, other: PrivilegedSettings) {
        if other.su_binary.is_some() {
            self.su_binary = other.su_binary;
        }
        if other.chain_name.is_some() {
            self.chain_name = other.chain_name;
        }
        if other.wifi_interface.is_some() {
            self.wifi_interface = other.wifi_interface;
        }
        if other.cellular_interface.is_some() {
            self.cellular_interface = other.cellular_interface;
        }
        self.extra_blocked_ports.extend(other.extra_blocked_ports);
    }

    /// Effective `su` binary.
    pub fn su_binary(&self) -> &str {
        self.su_binary.as_deref().unwrap_or("su")
    }

    /// Effective chain name.
    pub fn chain_name(&self) -> &str {
        self.chain_name.as_deref().unwrap_or(DEFAULT_CHAIN_NAME)
    }

    /// Effective Wi-Fi interface match.
    pub fn wifi_interface(&self) -> &str {
        self.wifi_interface.as_deref().unwrap_or("wlan+")
    }

    /// Effective cellular interface match.
    pub fn cellular_interface(&self) -> &str {
        self.cellular_interface.as_deref().unwrap_or("rmnet+")
    }
}

/// Settings for the per-package virtual interface tier.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct InterfaceSettings {
    /// Network address of the /24 pool.
    #[serde(default)]
    pub pool_base: Option<Ipv4Addr>,

    /// Interface name prefix; the host octet is appended.
    #[serde(default)]
    pub name_prefix: Option<String>,

    /// First routing table number; the host octet is added.
    #[serde(default)]
    pub routing_table_base: Option<u32>,
}

impl InterfaceSettings {
    fn merge(&mut self, other: InterfaceSettings) {
        if other.pool_base.is_some() {
            self.pool_base = other.pool_base;
        }
        if other.name_prefix.is_some() {
            self.name_prefix = other.name_prefix;
        }
        if other.routing_table_base.is_some() {
            self.routing_table_base = other.routing_table_base;
        }
    }

    /// Effective pool network address.
    pub fn pool_base(&self) -> Ipv4Addr {
        self.pool_base.unwrap_or(Ipv4Addr::new(10, 47, 0, 0))
    }

    /// Effective interface name prefix.
    pub fn name_prefix(&self) -> &str {
        self.name_prefix.as_deref().unwrap_or(DEFAULT_INTERFACE_PREFIX)
    }

    /// Effective routing table base.
    pub fn routing_table_base(&self) -> u32 {
        self.routing_table_base.unwrap_or(1000)
    }
}

/// Settings for the process monitor and bypass detector.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MonitorSettings {
    /// Poll interval for process watchers in milliseconds.
    #[serde(default)]
    pub process_poll_ms: Option<u64>,

    /// Poll interval for bypass watchers in milliseconds.
    #[serde(default)]
    pub bypass_poll_ms: Option<u64>,

    /// resolv.conf watched for DNS changes.
    #[serde(default)]
    pub resolv_conf: Option<PathBuf>,
}

impl MonitorSettings {
    fn merge(&mut self, other: MonitorSettings) {
        if other.process_poll_ms.is_some() {
            self.process_poll_ms = other.process_poll_ms;
        }
        if other.bypass_poll_ms.is_some() {
            self.bypass_poll_ms = other.bypass_poll_ms;
        }
        if other.resolv_conf.is_some() {
            self.resolv_conf = other.resolv_conf;
        }
    }

    /// Effective process watcher interval.
    pub fn process_poll_interval(&self) -> Duration {
        Duration::from_millis(self.process_poll_ms.unwrap_or(2000).max(10))
    }

    /// Effective bypass watcher interval.
    pub fn bypass_poll_interval(&self) -> Duration {
        Duration::from_millis(self.bypass_poll_ms.unwrap_or(5000).max(10))
    }

    /// Effective resolv.conf path.
    pub fn resolv_conf(&self) -> PathBuf {
        self.resolv_conf
            .clone()
            .unwrap_or_else(|| PathBuf::from("/etc/resolv.conf"))
    }
}

/// How running processes are mapped to packages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessSource {
    /// Scan `/proc/<pid>/cmdline` directly.
    #[default]
    Procfs,
    /// Parse `ps -A` run through the superuser shell (procfs mounted `hidepid`).
    Ps,
}

/// Host platform paths.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PlatformSettings {
    /// Package registry listing (`<package> <uid> ...` per line).
    #[serde(default)]
    pub packages_list: Option<PathBuf>,

    /// procfs mount point.
    #[serde(default)]
    pub proc_root: Option<PathBuf>,

    /// sysfs network class directory.
    #[serde(default)]
    pub sys_class_net: Option<PathBuf>,

    /// Interface name prefixes that indicate Wi-Fi.
    #[serde(default)]
    pub wifi_prefixes: Vec<String>,

    /// Interface name prefixes that indicate cellular.
    #[serde(default)]
    pub cellular_prefixes: Vec<String>,

    /// Process lookup backend.
    #[serde(default)]
    pub process_source: Option<ProcessSource>,
}

impl PlatformSettings {
    fn merge(&mut self, other: PlatformSettings) {
        if other.packages_list.is_some() {
            self.packages_list = other.packages_list;
        }
        if other.proc_root.is_some() {
            self.proc_root = other.proc_root;
        }
        if other.sys_class_net.is_some() {
            self.sys_class_net = other.sys_class_net;
        }
        self.wifi_prefixes.extend(other.wifi_prefixes);
        self.cellular_prefixes.extend(other.cellular_prefixes);
        if other.process_source.is_some() {
            self.process_source = other.process_source;
        }
    }

    /// Effective process lookup backend.
    pub fn process_source(&self) -> ProcessSource {
        self.process_source.unwrap_or_default()
    }

    /// Effective packages.list path.
    pub fn packages_list(&self) -> PathBuf {
        self.packages_list
            .clone()
            .unwrap_or_else(|| PathBuf::from("/data/system/packages.list"))
    }

    /// Effective procfs root.
    pub fn proc_root(&self) -> PathBuf {
        self.proc_root.clone().unwrap_or_else(|| PathBuf::from("/proc"))
    }

    /// Effective sysfs network directory.
    pub fn sys_class_net(&self) -> PathBuf {
        self.sys_class_net
            .clone()
            .unwrap_or_else(|| PathBuf::from("/sys/class/net"))
    }

    /// Wi-Fi prefixes, falling back to `wlan`.
    pub fn wifi_prefixes(&self) -> Vec<String> {
        if self.wifi_prefixes.is_empty() {
            vec!["wlan".to_string()]
        } else {
            self.wifi_prefixes.clone()
        }
    }

    /// Cellular prefixes, falling back to common modem names.
    pub fn cellular_prefixes(&self) -> Vec<String> {
        if self.cellular_prefixes.is_empty() {
            vec!["rmnet".to_string(), "ccmni".to_string(), "wwan".to_string()]
        } else {
            self.cellular_prefixes.clone()
        }
    }
}
