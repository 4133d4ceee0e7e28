//! Per-package HTTP proxy.
//!
//! Traffic from a blocked package is redirected to a loopback listener owned
//! by that package. The proxy:
//! - Parses each HTTP/1.x request (absolute-form, origin-form, CONNECT)
//! - Blocks by current network type, domain, URL pattern and filters
//! - Answers blocked requests with `403 Forbidden`
//! - Forwards everything else and streams the response back
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   127.0.0.1:<port>   ┌────────────────┐
//! │   pkg.app    │ ───────────────────▶ │ AppProxyServer │
//! └──────────────┘                      │  PolicyEngine  │
//!                                       └───────┬────────┘
//!                                    403 ◀──────┤ allow
//!                                               ▼
//!                                       ┌────────────────┐
//!                                       │    upstream    │
//!                                       └────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use appfence::proxy::{AppProxyServer, ContentPolicy, NetworkPolicy, PolicyEngine};
//!
//! let content = Arc::new(ContentPolicy::from_settings(&config.proxy)?);
//! let policy = Arc::new(PolicyEngine::new(content, NetworkPolicy::both(), network));
//! let server = AppProxyServer::start("com.example.app", policy, &config.proxy).await?;
//! println!("redirect to 127.0.0.1:{}", server.port());
//! server.stop().await;
//! ```

pub mod error;
pub mod filters;
pub mod policy;
pub mod request;
pub mod server;

pub use error::{ProxyError, ProxyResult};
pub use filters::{
    HeaderKeywordFilter, PassThroughBody, PassThroughHeaders, PassThroughResponse, RequestFilter,
    ResponseFilter,
};
pub use policy::{ContentPolicy, Decision, NetworkPolicy, PolicyEngine};
pub use request::HttpRequest;
pub use server::AppProxyServer;
