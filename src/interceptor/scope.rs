//! Shared per-package bookkeeping for interceptors.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::proxy::PolicyEngine;

/// Policy handed to each interceptor when it starts for a package.
#[derive(Clone)]
pub struct InterceptPolicy {
    /// The package's policy engine, shared with its proxy.
    pub engine: Arc<PolicyEngine>,
    /// Loopback port of the package's proxy, when one is running.
    pub proxy_port: Option<u16>,
}

impl InterceptPolicy {
    /// Policy for a package whose proxy listens on `proxy_port`.
    pub fn new(engine: Arc<PolicyEngine>, proxy_port: Option<u16>) -> Self {
        Self { engine, proxy_port }
    }
}

/// An interception layer that can be toggled per package.
///
/// Layers are independent: none assumes another is active.
pub trait Interceptor: Send + Sync {
    /// Short layer name for logs.
    fn name(&self) -> &'static str;

    /// Begin intercepting for `package`. Restarting replaces the policy.
    fn start(&self, package: &str, policy: &InterceptPolicy);

    /// Stop intercepting for `package`. Unknown packages are ignored.
    fn stop(&self, package: &str);

    /// Whether `package` is currently intercepted by this layer.
    fn is_active(&self, package: &str) -> bool;
}

/// Package → policy map guarded by a mutex.
#[derive(Default)]
pub(crate) struct PolicyScope {
    policies: Mutex<HashMap<String, InterceptPolicy>>,
}

impl PolicyScope {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, InterceptPolicy>> {
        match self.policies.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn insert(&self, package: &str, policy: &InterceptPolicy) {
        self.lock().insert(package.to_string(), policy.clone());
    }

    pub(crate) fn remove(&self, package: &str) -> bool {
        self.lock().remove(package).is_some()
    }

    pub(crate) fn get(&self, package: &str) -> Option<InterceptPolicy> {
        self.lock().get(package).cloned()
    }

    pub(crate) fn contains(&self, package: &str) -> bool {
        self.lock().contains_key(package)
    }

    pub(crate) fn packages(&self) -> Vec<String> {
        let mut packages: Vec<String> = self.lock().keys().cloned().collect();
        packages.sort();
        packages
    }
}
