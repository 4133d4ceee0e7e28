//! Error types for proxy operations.
//!
//! This module defines structured error types for the per-package proxy:
//! - Server errors (binding)
//! - Request errors (malformed input, oversized requests)
//! - Upstream errors (connect, forwarding)
//! - Policy errors (invalid patterns)

use thiserror::Error;

/// Unified error type for proxy operations.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// I/O error (socket operations).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Could not bind the local listener.
    #[error("Failed to bind proxy listener on {addr}: {source}")]
    Bind {
        /// Address we tried to bind.
        addr: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The client sent something that is not an HTTP request.
    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    /// The request did not fit in the buffer.
    #[error("Request exceeds {limit} bytes")]
    RequestTooLarge {
        /// Configured cap.
        limit: usize,
    },

    /// Failed to connect to upstream server.
    #[error("Failed to connect to upstream '{addr}': {message}")]
    UpstreamConnect {
        /// The address we tried to connect to.
        addr: String,
        /// Error message.
        message: String,
    },

    /// The client or upstream took too long.
    #[error("Connection timeout")]
    Timeout,

    /// A blocked-URL pattern failed to compile.
    #[error("Invalid URL pattern {pattern:?}: {message}")]
    InvalidPattern {
        /// The pattern source.
        pattern: String,
        /// Compiler message.
        message: String,
    },
}

/// Result type for proxy operations.
pub type ProxyResult<T> = Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_error_display() {
        let err = ProxyError::MalformedRequest("missing method".to_string());
        assert!(err.to_string().contains("missing method"));
    }

    #[test]
    fn test_upstream_connect_error() {
        let err = ProxyError::UpstreamConnect {
            addr: "example.com:80".to_string(),
            message: "connection refused".to_string(),
        };
        assert!(err.to_string().contains("example.com:80"));
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let proxy_err: ProxyError = io_err.into();
        assert!(matches!(proxy_err, ProxyError::Io(_)));
    }
}
