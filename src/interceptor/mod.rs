//! App-level interception layers.
//!
//! Interceptors enforce the same policy as a package's proxy at places the
//! proxy cannot see: raw sockets, in-process HTTP clients, name resolution
//! and embedded browsers. They need no privileges.

pub mod composite;
pub mod dns;
pub mod http;
pub mod scope;
pub mod socket;
pub mod webview;

pub use composite::NetworkInterceptor;
pub use dns::DnsInterceptor;
pub use http::HttpInterceptor;
pub use scope::{InterceptPolicy, Interceptor};
pub use socket::SocketInterceptor;
pub use webview::WebViewInterceptor;

#[cfg(test)]
pub(crate) mod tests_support {
    use std::sync::Arc;

    use super::InterceptPolicy;
    use crate::platform::{FixedNetworkType, NetworkType};
    use crate::proxy::{ContentPolicy, NetworkPolicy, PolicyEngine};

    pub(crate) fn policy_on(network: NetworkType, net_policy: NetworkPolicy) -> InterceptPolicy {
        let engine = PolicyEngine::new(
            Arc::new(ContentPolicy::builtin().unwrap()),
            net_policy,
            Arc::new(FixedNetworkType::new(network)),
        );
        InterceptPolicy::new(Arc::new(engine), None)
    }

    pub(crate) fn policy(proxy_port: Option<u16>) -> InterceptPolicy {
        let mut policy = policy_on(NetworkType::Other, NetworkPolicy::both());
        policy.proxy_port = proxy_port;
        policy
    }
}
