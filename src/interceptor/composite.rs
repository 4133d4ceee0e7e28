//! The four interception layers bundled per controller.

use std::sync::Arc;

use tracing::info;

use super::dns::DnsInterceptor;
use super::http::HttpInterceptor;
use super::scope::{InterceptPolicy, Interceptor};
use super::socket::SocketInterceptor;
use super::webview::WebViewInterceptor;

/// Socket, HTTP, DNS and WebView interceptors.
///
/// Each layer keeps its own package set, so layers can also be toggled one
/// at a time through [`layers`](Self::layers).
#[derive(Clone)]
pub struct NetworkInterceptor {
    socket: Arc<SocketInterceptor>,
    http: Arc<HttpInterceptor>,
    dns: Arc<DnsInterceptor>,
    webview: Arc<WebViewInterceptor>,
}

impl NetworkInterceptor {
    /// Create all four layers, idle.
    pub fn new() -> Self {
        Self {
            socket: Arc::new(SocketInterceptor::new()),
            http: Arc::new(HttpInterceptor::new()),
            dns: Arc::new(DnsInterceptor::new()),
            webview: Arc::new(WebViewInterceptor::new()),
        }
    }

    /// All layers as trait objects.
    pub fn layers(&self) -> [&dyn Interceptor; 4] {
        [
            self.socket.as_ref(),
            self.http.as_ref(),
            self.dns.as_ref(),
            self.webview.as_ref(),
        ]
    }

    /// Start every layer for `package`.
    pub fn start_all(&self, package: &str, policy: &InterceptPolicy) {
        for layer in self.layers() {
            layer.start(package, policy);
        }
        info!("Interceptors started for {}", package);
    }

    /// Stop every layer for `package`.
    pub fn stop_all(&self, package: &str) {
        for layer in self.layers() {
            layer.stop(package);
        }
        info!("Interceptors stopped for {}", package);
    }

    /// Names of the layers active for `package`.
    pub fn active_layers(&self, package: &str) -> Vec<&'static str> {
        self.layers()
            .into_iter()
            .filter(|layer| layer.is_active(package))
            .map(|layer| layer.name())
            .collect()
    }

    /// Whether any layer is active for `package`.
    pub fn is_intercepting(&self, package: &str) -> bool {
        self.layers().iter().any(|layer| layer.is_active(package))
    }

    /// Socket layer.
    pub fn socket(&self) -> &SocketInterceptor {
        &self.socket
    }

    /// HTTP layer.
    pub fn http(&self) -> &HttpInterceptor {
        &self.http
    }

    /// DNS layer.
    pub fn dns(&self) -> &DnsInterceptor {
        &self.dns
    }

    /// WebView layer.
    pub fn webview(&self) -> &WebViewInterceptor {
        &self.webview
    }
}

impl Default for NetworkInterceptor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interceptor::tests_support::policy;

    #[test]
    fn test_start_and_stop_all() {
        let interceptor = NetworkInterceptor::new();
        interceptor.start_all("pkg.a", &policy(Some(1234)));

        assert_eq!(
            interceptor.active_layers("pkg.a"),
            vec!["socket", "http", "dns", "webview"]
        );
        assert!(!interceptor.is_intercepting("pkg.b"));

        interceptor.stop_all("pkg.a");
        assert!(interceptor.active_layers("pkg.a").is_empty());
    }

    #[test]
    fn test_layers_toggle_independently() {
        let interceptor = NetworkInterceptor::new();
        interceptor.dns().start("pkg.a", &policy(None));

        assert_eq!(interceptor.active_layers("pkg.a"), vec!["dns"]);
        assert!(interceptor.is_intercepting("pkg.a"));
        assert!(interceptor.socket().permits_connection("pkg.a", "10.1.1.1:80".parse().unwrap()));
        assert!(!interceptor.dns().permits_resolution("pkg.a", "reddit.com"));

        interceptor.stop_all("pkg.a");
        interceptor.stop_all("pkg.a");
        assert!(!interceptor.is_intercepting("pkg.a"));
    }
}
