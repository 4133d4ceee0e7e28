//! Configuration system for appfence.
//!
//! This module provides TOML configuration loading with hierarchy merging.
//!
//! # Configuration Hierarchy
//!
//! Configuration is loaded from multiple sources and merged in order:
//!
//! 1. System config: `/etc/appfence/config.toml`
//! 2. User config: `~/.config/appfence/config.toml`
//! 3. Additional config file (via `--config` flag)
//!
//! Every file is optional; the embedded defaults describe a working setup.
//!
//! # Merge Behavior
//!
//! - **Lists** (blocked domains, URL patterns, extra ports) are **merged** (appended)
//! - **Scalars** (capacities, timeouts, paths) are **overridden**
//!
//! ```toml
//! [proxy]
//! worker_capacity = 100
//! blocked_domains = ["tiktok.com"]
//!
//! [privileged]
//! wifi_interface = "wlan+"
//! cellular_interface = "rmnet+"
//! ```

mod error;
mod loader;
mod schema;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use schema::{
    Config, InterfaceSettings, MonitorSettings, PlatformSettings, PrivilegedSettings,
    ProcessSource, ProxySettings, DEFAULT_CHAIN_NAME, DEFAULT_INTERFACE_PREFIX, DEFAULT_WORKER_CAPACITY,
};
