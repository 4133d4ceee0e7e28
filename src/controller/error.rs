//! Controller error types.

use thiserror::Error;

use crate::proxy::ProxyError;

/// Errors raised while building a [`PerAppNetworkController`](super::PerAppNetworkController).
///
/// Once built, block and allow never fail; per-tier problems are reported in
/// an [`EnforcementReport`](super::EnforcementReport).
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Enforcement work is spawned on the current tokio runtime.
    #[error("The controller must be built inside a tokio runtime")]
    NoRuntime,

    /// A configured domain or URL pattern is invalid.
    #[error("Invalid content policy: {0}")]
    Policy(#[from] ProxyError),
}
