//! HTTP client interception.
//!
//! Applies the package's URL policy to requests made through in-process
//! HTTP clients that do not honor the proxy.

use tracing::debug;

use super::scope::{InterceptPolicy, Interceptor, PolicyScope};
use crate::proxy::Decision;

/// HTTP-level interceptor.
#[derive(Default)]
pub struct HttpInterceptor {
    scope: PolicyScope,
}

impl HttpInterceptor {
    /// Create an interceptor with no packages.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide whether `package` may fetch `url`.
    pub fn check_url(&self, package: &str, url: &str) -> Decision {
        let Some(policy) = self.scope.get(package) else {
            return Decision::Allow;
        };
        let host = url_host(url).unwrap_or_default();
        let decision = policy.engine.evaluate_target(&host, url);
        debug!("HTTP {} {} -> {:?}", package, url, decision);
        decision
    }
}

impl Interceptor for HttpInterceptor {
    fn name(&self) -> &'static str {
        "http"
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

/// Host of an absolute `scheme://authority/...` URL, lowercase.
pub(crate) fn url_host(url: &str) -> Option<String> {
    let (_, rest) = url.split_once("://")?;
    let end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    crate::proxy::request::parse_host_port(&rest[..end], 0)
        .ok()
        .map(|(host, _)| host)
}
