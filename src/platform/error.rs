//! Error types for host platform queries.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from the package registry and process table.
#[derive(Debug, Error)]
pub enum PlatformError {
    /// The package is not installed (or not visible to us).
    #[error("Package not found: {0}")]
    PackageNotFound(String),

    /// Failed to read a registry or procfs file.
    #[error("Failed to read {path}: {source}")]
    Read {
        /// File that could not be read.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A listing did not have the expected shape.
    #[error("Failed to parse {what}: {message}")]
    Parse {
        /// What was being parsed.
        what: &'static str,
        /// Description of the problem.
        message: String,
    },
}
