//! Configuration loading with hierarchy merging.
//!
//! Configuration is loaded from multiple sources and merged in order:
//!
//! 1. Embedded defaults (compiled into binary)
//! 2. System config: `/etc/appfence/config.toml`
//! 3. User config: `~/.config/appfence/config.toml`
//! 4. Additional config file (via `--config` flag)
//!
//! Lists (blocked domains, URL patterns) are **merged** (appended).
//! Scalars (capacities, timeouts, paths) are **overridden**.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::error::ConfigError;
use super::schema::Config;

/// System-wide configuration path.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/appfence/config.toml";

/// User configuration directory name.
pub const USER_CONFIG_DIR: &str = "appfence";

/// User configuration filename.
pub const USER_CONFIG_FILE: &str = "config.toml";

/// Configuration loader with support for hierarchy merging.
pub struct ConfigLoader {
    /// Path to system-wide configuration.
    system_path: PathBuf,
    /// Path to user configuration.
    user_path: PathBuf,
}

impl ConfigLoader {
    /// Create a new ConfigLoader with default paths.
    #[must_use]
    pub fn new() -> Self {
        let user_config_dir = dirs::config_dir()
            .map(|p| p.join(USER_CONFIG_DIR))
            .unwrap_or_else(|| PathBuf::from(".config").join(USER_CONFIG_DIR));

        Self {
            system_path: PathBuf::from(SYSTEM_CONFIG_PATH),
            user_path: user_config_dir.join(USER_CONFIG_FILE),
        }
    }

    /// Create a ConfigLoader with custom paths (for testing).
    #[must_use]
    pub fn with_paths(system_path: PathBuf, user_path: PathBuf) -> Self {
        Self {
            system_path,
            user_path,
        }
    }

    /// Load and merge configuration from all sources.
    ///
    /// Missing system and user files are skipped. A missing `extra` file is
    /// an error, since the operator asked for it explicitly. Invalid TOML is
    /// always an error.
    pub fn load(&self, extra: Option<&Path>) -> Result<Config, ConfigError> {
        let mut config = Config::default();
        debug!("Loaded embedded default configuration");

        if let Some(system_config) = self.load_file(&self.system_path)? {
            config.merge(system_config);
            debug!("Loaded system config from {:?}", self.system_path);
        } else {
            debug!("No system config found at {:?}", self.system_path);
        }

        if let Some(user_config) = self.load_file(&self.user_path)? {
            config.merge(user_config);
            debug!("Loaded user config from {:?}", self.user_path);
        } else {
            debug!("No user config found at {:?}", self.user_path);
        }

        if let Some(extra_path) = extra {
            match self.load_file(extra_path)? {
                Some(extra_config) => {
                    config.merge(extra_config);
                    debug!("Loaded additional config from {:?}", extra_path);
                }
                None => {
                    return Err(ConfigError::ReadError {
                        path: extra_path.to_path_buf(),
                        source: std::io::Error::new(
                            std::io::ErrorKind::NotFound,
                            "Specified config file not found",
                        ),
                    });
                }
            }
        }

        validate(&config)?;
        Ok(config)
    }

    /// Load a config file, returning None if it doesn't exist.
    fn load_file(&self, path: &Path) -> Result<Option<Config>, ConfigError> {
        match fs::read_to_string(path) {
            Ok(contents) => {
                let config: Config =
                    toml::from_str(&contents).map_err(|e| ConfigError::ParseError {
                        path: path.to_path_buf(),
                        source: e,
                    })?;
                Ok(Some(config))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ConfigError::ReadError {
                path: path.to_path_buf(),
                source: e,
            }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Reject values that would only fail later, deep inside an enforcement task.
fn validate(config: &Config) -> Result<(), ConfigError> {
    for pattern in &config.proxy.blocked_url_patterns {
        if let Err(e) = regex::Regex::new(pattern) {
            return Err(ConfigError::InvalidValue {
                field: "proxy.blocked_url_patterns".to_string(),
                message: format!("{pattern}: {e}"),
            });
        }
    }

    if config.interfaces.pool_base().octets()[3] != 0 {
        return Err(ConfigError::InvalidValue {
            field: "interfaces.pool_base".to_string(),
            message: "must be the network address of a /24 (last octet 0)".to_string(),
        });
    }

    // Linux caps interface names at 15 bytes; three digits are appended.
    if config.interfaces.name_prefix().len() > 12 {
        return Err(ConfigError::InvalidValue {
            field: "interfaces.name_prefix".to_string(),
            message: "must be at most 12 characters".to_string(),
        });
    }

    Ok(())
}
