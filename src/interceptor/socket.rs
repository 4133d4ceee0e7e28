//! Raw socket interception.
//!
//! An intercepted package may only open TCP/UDP sockets to its own proxy on
//! loopback. Anything else would bypass the proxy's policy.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use super::scope::{InterceptPolicy, Interceptor, PolicyScope};

/// Socket-level interceptor.
#[derive(Default)]
pub struct SocketInterceptor {
    scope: PolicyScope,
    refused: AtomicU64,
}

impl SocketInterceptor {
    /// Create an interceptor with no packages.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `package` may open a socket to `addr`.
    pub fn permits_connection(&self, package: &str, addr: SocketAddr) -> bool {
        let Some(policy) = self.scope.get(package) else {
            return true;
        };

        let to_proxy = addr.ip().is_loopback() && Some(addr.port()) == policy.proxy_port;
        if !to_proxy {
            self.refused.fetch_add(1, Ordering::Relaxed);
            debug!("Refused socket from {} to {}", package, addr);
        }
        to_proxy
    }

    /// Connections refused since creation.
    pub fn refused_count(&self) -> u64 {
        self.refused.load(Ordering::Relaxed)
    }
}

impl Interceptor for SocketInterceptor {
    fn name(&self) -> &'static str {
        "socket"
    }

    fn start(&self, package: &str, policy: &InterceptPolicy) {
        self.scope.insert(package, policy);
        debug!("Socket interception started for {}", package);
    }

    fn stop(&self, package: &str) {
        if self.scope.remove(package) {
            debug!("Socket interception stopped for {}", package);
        }
    }

    fn is_active(&self, package: &str) -> bool {
        self.scope.contains(package)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interceptor::tests_support::policy;

    #[test]
    fn test_inactive_package_is_unrestricted() {
        let socket = SocketInterceptor::new();
        assert!(socket.permits_connection("pkg.a", "93.184.216.34:443".parse().unwrap()));
        assert_eq!(socket.refused_count(), 0);
    }

    #[test]
    fn test_only_proxy_port_reachable() {
        let socket = SocketInterceptor::new();
        socket.start("pkg.a", &policy(Some(40000)));

        assert!(socket.permits_connection("pkg.a", "127.0.0.1:40000".parse().unwrap()));
        assert!(!socket.permits_connection("pkg.a", "127.0.0.1:40001".parse().unwrap()));
        assert!(!socket.permits_connection("pkg.a", "93.184.216.34:443".parse().unwrap()));
        assert!(socket.permits_connection("pkg.b", "93.184.216.34:443".parse().unwrap()));
        assert_eq!(socket.refused_count(), 2);
    }

    #[test]
    fn test_stop_lifts_restriction() {
        let socket = SocketInterceptor::new();
        socket.start("pkg.a", &policy(None));
        assert!(socket.is_active("pkg.a"));
        assert!(!socket.permits_connection("pkg.a", "10.0.0.1:80".parse().unwrap()));

        socket.stop("pkg.a");
        assert!(!socket.is_active("pkg.a"));
        assert!(socket.permits_connection("pkg.a", "10.0.0.1:80".parse().unwrap()));
    }
}
