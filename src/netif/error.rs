//! Virtual interface tier error types.

use thiserror::Error;

use crate::privileged::CommandError;

/// Errors from the virtual interface tier.
#[derive(Debug, Error)]
pub enum NetifError {
    /// Every address in the pool is assigned.
    #[error("Address pool {base}/24 exhausted")]
    PoolExhausted {
        /// Pool network address.
        base: std::net::Ipv4Addr,
    },

    /// Creating the link failed.
    #[error("Failed to create interface {name}: {source}")]
    LinkCreate {
        /// Interface name.
        name: String,
        /// Underlying command failure.
        #[source]
        source: CommandError,
    },

    /// Some other required command failed.
    #[error("Interface command failed: {0}")]
    Command(#[from] CommandError),
}
