//! Authoritative block-state store.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::proxy::NetworkPolicy;

/// The last block/allow decision recorded for a package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppBlockState {
    /// Package identifier.
    pub package_id: String,
    /// Block while on Wi-Fi.
    pub block_wifi: bool,
    /// Block while on cellular.
    pub block_cellular: bool,
    /// Whether the package is supposed to be blocked.
    pub is_blocked: bool,
    /// When the decision was recorded.
    pub timestamp: DateTime<Utc>,
}

impl AppBlockState {
    /// The transport policy this state asks for.
    pub fn network_policy(&self) -> NetworkPolicy {
        NetworkPolicy::new(self.block_wifi, self.block_cellular)
    }
}

/// One entry per package ever blocked or allowed. Entries are overwritten,
/// never removed.
#[derive(Debug, Default)]
pub struct BlockStateStore {
    states: Mutex<HashMap<String, AppBlockState>>,
}

impl BlockStateStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, AppBlockState>> {
        match self.states.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self, package: &str, policy: NetworkPolicy, is_blocked: bool) -> AppBlockState {
        let state = AppBlockState {
            package_id: package.to_string(),
            block_wifi: policy.block_wifi,
            block_cellular: policy.block_cellular,
            is_blocked,
            timestamp: Utc::now(),
        };
        self.lock().insert(package.to_string(), state.clone());
        state
    }

    /// Record a block decision.
    pub fn record_block(&self, package: &str, policy: NetworkPolicy) -> AppBlockState {
        self.write(package, policy, true)
    }

    /// Record an allow decision, keeping the last transport flags.
    pub fn record_allow(&self, package: &str) -> AppBlockState {
        let policy = self
            .get(package)
            .map(|s| s.network_policy())
            .unwrap_or_else(NetworkPolicy::both);
        self.write(package, policy, false)
    }

    /// State of `package`, if it was ever touched.
    pub fn get(&self, package: &str) -> Option<AppBlockState> {
        self.lock().get(package).cloned()
    }

    /// Whether `package` is currently supposed to be blocked.
    pub fn is_blocked(&self, package: &str) -> bool {
        self.lock().get(package).is_some_and(|s| s.is_blocked)
    }

    /// Packages whose last state is blocked, sorted.
    pub fn blocked_packages(&self) -> Vec<String> {
        let mut blocked: Vec<String> = self
            .lock()
            .values()
            .filter(|s| s.is_blocked)
            .map(|s| s.package_id.clone())
            .collect();
        blocked.sort();
        blocked
    }

    /// Every recorded state, sorted by package.
    pub fn all(&self) -> Vec<AppBlockState> {
        let mut all: Vec<AppBlockState> = self.lock().values().cloned().collect();
        all.sort_by(|a, b| a.package_id.cmp(&b.package_id));
        all
    }
}
