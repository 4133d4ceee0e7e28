//! DNS interception.
//!
//! Refuses name resolution for blocked domains, and for every name while the
//! package's current transport is blocked.

use tracing::debug;

use super::scope::{InterceptPolicy, Interceptor, PolicyScope};

/// DNS-level interceptor.
#[derive(Default)]
pub struct DnsInterceptor {
    scope: PolicyScope,
}

impl DnsInterceptor {
    /// Create an interceptor with no packages.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `package` may resolve `name`.
    pub fn permits_resolution(&self, package: &str, name: &str) -> bool {
        let Some(policy) = self.scope.get(package) else {
            return true;
        };
        let name = name.trim_end_matches('.');
        let allowed = !policy.engine.evaluate_target(name, "").is_block();
        if !allowed {
            debug!("Refused DNS lookup of {} for {}", name, package);
        }
        allowed
    }
}

impl Interceptor for DnsInterceptor {
    fn name(&self) -> &'static str {
        "dns"
    }

    fn start(&self, package: &str, policy: &InterceptPolicy) {
        self.scope.insert(package, policy);
    }

    fn stop(&self, package: &str) {
        self.scope.remove(package);
    }

    fn is_active(&self, package: &str) -> bool {
        self.scope.contains(package)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interceptor::tests_support::{policy, policy_on};
    use crate::platform::NetworkType;
    use crate::proxy::NetworkPolicy;

    #[test]
    fn test_blocked_names_refused() {
        let dns = DnsInterceptor::new();
        dns.start("pkg.a", &policy(None));

        assert!(!dns.permits_resolution("pkg.a", "api.TikTok.com."));
        assert!(dns.permits_resolution("pkg.a", "example.com"));
        assert!(dns.permits_resolution("pkg.b", "tiktok.com"));
    }

    #[test]
    fn test_blocked_transport_refuses_everything() {
        let dns = DnsInterceptor::new();
        dns.start(
            "pkg.a",
            &policy_on(NetworkType::Cellular, NetworkPolicy::new(false, true)),
        );
        assert!(!dns.permits_resolution("pkg.a", "example.com"));
    }
}
