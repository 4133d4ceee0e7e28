//! Embedded browser navigation interception.

use tracing::debug;

use super::http::url_host;
use super::scope::{InterceptPolicy, Interceptor, PolicyScope};
use crate::proxy::Decision;

/// Schemes that never touch the network.
const LOCAL_SCHEMES: &[&str] = &["about:", "data:", "file:", "javascript:"];

/// WebView-level interceptor.
#[derive(Default)]
pub struct WebViewInterceptor {
    scope: PolicyScope,
}

impl WebViewInterceptor {
    /// Create an interceptor with no packages.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide whether a WebView in `package` may navigate to `url`.
    pub fn check_navigation(&self, package: &str, url: &str) -> Decision {
        let Some(policy) = self.scope.get(package) else {
            return Decision::Allow;
        };
        let lower = url.to_ascii_lowercase();
        if LOCAL_SCHEMES.iter().any(|s| lower.starts_with(s)) {
            return Decision::Allow;
        }

        let host = url_host(url).unwrap_or_default();
        let decision = policy.engine.evaluate_target(&host, url);
        if decision.is_block() {
            debug!("Blocked WebView navigation in {} to {}", package, url);
        }
        decision
    }
}

impl Interceptor for WebViewInterceptor {
    fn name(&self) -> &'static str {
        "webview"
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
