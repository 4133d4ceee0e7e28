//! Request policy evaluation.
//!
//! # Evaluation Order
//!
//! 1. Network type (blocked transport → block regardless of target)
//! 2. Blocked domains (case-insensitive substring of the host)
//! 3. Blocked URL patterns (regex over the full URL)
//! 4. Header filter
//! 5. Body filter
//!
//! The first check that fires decides. Anything that passes every check is
//! forwarded.
//!
//! # Example
//!
//! ```ignore
//! use appfence::proxy::policy::{ContentPolicy, Decision, NetworkPolicy, PolicyEngine};
//!
//! let content = Arc::new(ContentPolicy::builtin()?);
//! let engine = PolicyEngine::new(content, NetworkPolicy::both(), provider);
//! match engine.evaluate(&request) {
//!     Decision::Allow => forward(),
//!     Decision::Block(reason) => reply_403(reason),
//! }
//! ```

use std::sync::{Arc, RwLock};

use regex::Regex;
use serde::Serialize;
use tracing::debug;

use super::error::{ProxyError, ProxyResult};
use super::filters::{PassThroughBody, PassThroughHeaders, RequestFilter};
use super::request::HttpRequest;
use crate::config::ProxySettings;
use crate::platform::{NetworkType, NetworkTypeProvider};
use crate::telemetry::BlockReason;

/// Domains blocked for every package.
pub const BUILTIN_BLOCKED_DOMAINS: &[&str] = &[
    "facebook.com",
    "instagram.com",
    "tiktok.com",
    "twitter.com",
    "youtube.com",
    "netflix.com",
    "snapchat.com",
    "reddit.com",
];

/// URL patterns blocked for every package: media, streaming and downloads.
pub const BUILTIN_BLOCKED_URL_PATTERNS: &[&str] = &[
    r"(?i)\.(mp4|m4v|mkv|webm|avi|mov|flv|m3u8|mpd)(\?|#|$)",
    r"(?i)/(video|videos|stream|streaming|live)/",
    r"(?i)/(download|downloads)/",
    r"(?i)\.(apk|exe|zip|rar|7z|dmg|iso)(\?|#|$)",
];

/// Outcome of evaluating a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Forward the request.
    Allow,
    /// Refuse the request.
    Block(BlockReason),
}

impl Decision {
    /// Whether this decision blocks.
    pub fn is_block(self) -> bool {
        matches!(self, Decision::Block(_))
    }
}

/// Which transports are blocked for a package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NetworkPolicy {
    /// Block while the device is on Wi-Fi.
    pub block_wifi: bool,
    /// Block while the device is on cellular.
    pub block_cellular: bool,
}

impl NetworkPolicy {
    /// Create a policy from the two flags.
    pub fn new(block_wifi: bool, block_cellular: bool) -> Self {
        Self {
            block_wifi,
            block_cellular,
        }
    }

    /// Block on both transports.
    pub fn both() -> Self {
        Self::new(true, true)
    }

    /// Whether both transports are blocked.
    pub fn blocks_all(&self) -> bool {
        self.block_wifi && self.block_cellular
    }

    /// Whether traffic on `network` is blocked.
    pub fn blocks(&self, network: NetworkType) -> bool {
        match network {
            NetworkType::Wifi => self.block_wifi,
            NetworkType::Cellular => self.block_cellular,
            NetworkType::Other | NetworkType::None => false,
        }
    }
}

/// Static blocked-domain and blocked-URL sets.
///
/// Shared by every package's proxy and interceptors.
#[derive(Debug, Clone)]
pub struct ContentPolicy {
    domains: Vec<String>,
    url_patterns: Vec<Regex>,
}

impl ContentPolicy {
    /// Compile the built-in lists plus extra domains and patterns.
    pub fn new(extra_domains: &[String], extra_patterns: &[String]) -> ProxyResult<Self> {
        let domains = BUILTIN_BLOCKED_DOMAINS
            .iter()
            .map(|d| d.to_string())
            .chain(extra_domains.iter().cloned())
            .map(|d| d.trim().to_lowercase())
            .filter(|d| !d.is_empty())
            .collect();

        let mut url_patterns = Vec::new();
        let sources = BUILTIN_BLOCKED_URL_PATTERNS
            .iter()
            .map(|p| p.to_string())
            .chain(extra_patterns.iter().cloned());
        for pattern in sources {
            let regex = Regex::new(&pattern).map_err(|e| ProxyError::InvalidPattern {
                pattern: pattern.clone(),
                message: e.to_string(),
            })?;
            url_patterns.push(regex);
        }

        Ok(Self {
            domains,
            url_patterns,
        })
    }

    /// Build from proxy settings.
    pub fn from_settings(settings: &ProxySettings) -> ProxyResult<Self> {
        Self::new(&settings.blocked_domains, &settings.blocked_url_patterns)
    }

    /// Only the built-in lists.
    pub fn builtin() -> ProxyResult<Self> {
        Self::new(&[], &[])
    }

    /// Whether `host` contains a blocked domain.
    pub fn domain_blocked(&self, host: &str) -> bool {
        let host = host.to_lowercase();
        self.domains.iter().any(|d| host.contains(d.as_str()))
    }

    /// Whether `url` matches a blocked pattern.
    pub fn url_blocked(&self, url: &str) -> bool {
        self.url_patterns.iter().any(|re| re.is_match(url))
    }

    /// Number of blocked domains.
    pub fn domain_count(&self) -> usize {
        self.domains.len()
    }
}

/// Per-package policy engine.
pub struct PolicyEngine {
    content: Arc<ContentPolicy>,
    network: RwLock<NetworkPolicy>,
    network_type: Arc<dyn NetworkTypeProvider>,
    header_filter: Arc<dyn RequestFilter>,
    body_filter: Arc<dyn RequestFilter>,
}

impl PolicyEngine {
    /// Create an engine with pass-through header and body filters.
    pub fn new(
        content: Arc<ContentPolicy>,
        network: NetworkPolicy,
        network_type: Arc<dyn NetworkTypeProvider>,
    ) -> Self {
        Self {
            content,
            network: RwLock::new(network),
            network_type,
            header_filter: Arc::new(PassThroughHeaders),
            body_filter: Arc::new(PassThroughBody),
        }
    }

    /// Replace the header and body filters.
    pub fn with_filters(
        mut self,
        header_filter: Arc<dyn RequestFilter>,
        body_filter: Arc<dyn RequestFilter>,
    ) -> Self {
        self.header_filter = header_filter;
        self.body_filter = body_filter;
        self
    }

    /// Current transport policy.
    pub fn network_policy(&self) -> NetworkPolicy {
        match self.network.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Replace the transport policy in place.
    pub fn set_network_policy(&self, policy: NetworkPolicy) {
        match self.network.write() {
            Ok(mut guard) => *guard = policy,
            Err(poisoned) => *poisoned.into_inner() = policy,
        }
    }

    /// Shared content lists.
    pub fn content(&self) -> &ContentPolicy {
        &self.content
    }

    /// Whether the device's current transport is blocked.
    pub fn network_blocked(&self) -> bool {
        self.network_policy().blocks(self.network_type.current())
    }

    /// Evaluate a host/URL pair (no header or body available).
    ///
    /// Used for CONNECT tunnels and by the interceptors.
    pub fn evaluate_target(&self, host: &str, url: &str) -> Decision {
        if self.network_blocked() {
            return Decision::Block(BlockReason::NetworkType);
        }
        if self.content.domain_blocked(host) {
            return Decision::Block(BlockReason::BlockedDomain);
        }
        if !url.is_empty() && self.content.url_blocked(url) {
            return Decision::Block(BlockReason::BlockedUrl);
        }
        Decision::Allow
    }

    /// Evaluate a complete request.
    pub fn evaluate(&self, request: &HttpRequest) -> Decision {
        let url = if request.is_connect() { "" } else { request.url.as_str() };
        let decision = match self.evaluate_target(request.host(), url) {
            Decision::Allow if !self.header_filter.allows(request) => {
                Decision::Block(BlockReason::HeaderFilter)
            }
            Decision::Allow if !self.body_filter.allows(request) => {
                Decision::Block(BlockReason::BodyFilter)
            }
            other => other,
        };
        debug!("Policy for {} {}: {:?}", request.method, request.url, decision);
        decision
    }
}
