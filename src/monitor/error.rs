//! Monitoring error types.

use thiserror::Error;

use crate::platform::PlatformError;

/// Errors from the process monitor and bypass detector.
#[derive(Debug, Error)]
pub enum MonitorError {
    /// The process table could not be queried.
    #[error("Process lookup failed: {0}")]
    ProcessLookup(#[from] PlatformError),

    /// Watchers need a tokio runtime to poll on.
    #[error("No async runtime available to run watcher {0}")]
    NoRuntime(&'static str),
}
