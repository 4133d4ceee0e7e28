//! Request and response filter hooks.
//!
//! Filters run after the built-in network, domain and URL checks. The
//! defaults let everything through; deployments plug their own in through
//! [`PolicyEngine::with_filters`](super::policy::PolicyEngine::with_filters)
//! and [`AppProxyServer`](super::server::AppProxyServer).

use bytes::Bytes;

use super::request::HttpRequest;

/// Decides whether a parsed request may be forwarded.
pub trait RequestFilter: Send + Sync {
    /// Return `false` to block the request.
    fn allows(&self, request: &HttpRequest) -> bool;
}

/// Rewrites upstream response bytes on their way back to the app.
pub trait ResponseFilter: Send + Sync {
    /// Transform one chunk read from upstream.
    fn filter_chunk(&self, chunk: Bytes) -> Bytes {
        chunk
    }
}

/// Header filter that allows every request.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassThroughHeaders;

impl RequestFilter for PassThroughHeaders {
    fn allows(&self, _request: &HttpRequest) -> bool {
        true
    }
}

/// Body filter that allows every request.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassThroughBody;

impl RequestFilter for PassThroughBody {
    fn allows(&self, _request: &HttpRequest) -> bool {
        true
    }
}

/// Response filter that returns chunks unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassThroughResponse;

impl ResponseFilter for PassThroughResponse {}

/// Blocks requests carrying a header whose value contains a keyword.
///
/// Keywords are matched case-insensitively.
#[derive(Debug, Clone)]
pub struct HeaderKeywordFilter {
    header: String,
    keywords: Vec<String>,
}

impl HeaderKeywordFilter {
    /// Block when `header` contains any of `keywords`.
    pub fn new(header: impl Into<String>, keywords: &[String]) -> Self {
        Self {
            header: header.into(),
            keywords: keywords.iter().map(|k| k.to_lowercase()).collect(),
        }
    }
}

impl RequestFilter for HeaderKeywordFilter {
    fn allows(&self, request: &HttpRequest) -> bool {
        match request.header(&self.header) {
            Some(value) => {
                let value = value.to_lowercase();
                !self.keywords.iter().any(|k| value.contains(k))
            }
            None => true,
        }
    }
}
