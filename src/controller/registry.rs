//! Runtime resources owned per package.
//!
//! Each package gets one slot guarded by an async mutex. Every reconcile for
//! the package runs while holding it, so at most one proxy listener, one
//! interceptor scope and one interface can ever exist per package.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Mutex as AsyncMutex;

use crate::proxy::AppProxyServer;

/// What is currently running for one package.
#[derive(Default)]
pub(crate) struct AppRuntime {
    pub(crate) proxy: Option<AppProxyServer>,
    pub(crate) monitored: bool,
}

pub(crate) type Slot = Arc<AsyncMutex<AppRuntime>>;

/// Package → runtime slot.
#[derive(Default)]
pub(crate) struct AppRegistry {
    slots: Mutex<HashMap<String, Slot>>,
}

impl AppRegistry {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        match self.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// The slot for `package`, created on first use.
    pub(crate) fn slot(&self, package: &str) -> Slot {
        self.lock()
            .entry(package.to_string())
            .or_default()
            .clone()
    }

    /// Every slot, sorted by package.
    pub(crate) fn slots(&self) -> Vec<(String, Slot)> {
        let mut all: Vec<(String, Slot)> = self
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_slot_is_shared_per_package() {
        let registry = AppRegistry::default();
        let a1 = registry.slot("pkg.a");
        let a2 = registry.slot("pkg.a");
        let b = registry.slot("pkg.b");

        assert!(Arc::ptr_eq(&a1, &a2));
        assert!(!Arc::ptr_eq(&a1, &b));

        a1.lock().await.monitored = true;
        assert!(a2.lock().await.monitored);
        assert_eq!(registry.slots().len(), 2);
    }
}
