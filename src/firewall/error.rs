//! Packet-filter tier error types.

use thiserror::Error;

use crate::platform::PlatformError;
use crate::privileged::CommandError;

/// Errors from the privileged packet-filter tier.
#[derive(Debug, Error)]
pub enum FirewallError {
    /// The package could not be mapped to a UID.
    #[error("UID resolution failed: {0}")]
    UidResolution(#[from] PlatformError),

    /// A command that must succeed did not.
    #[error("Packet-filter command failed: {0}")]
    Command(#[from] CommandError),

    /// Not a single rule could be installed for the UID.
    #[error("No rules applied for uid {uid} ({attempted} attempted)")]
    NoRulesApplied {
        /// Target UID.
        uid: u32,
        /// Rules attempted.
        attempted: usize,
    },
}
