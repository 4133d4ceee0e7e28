//! Error types for privileged command execution.

use thiserror::Error;

/// Errors raised while building or running a privileged command.
#[derive(Debug, Error)]
pub enum CommandError {
    /// No superuser shell is reachable on this device.
    #[error("Superuser access is not available")]
    PrivilegeUnavailable,

    /// An argument contained characters outside the allowed set.
    #[error("Refusing unsafe argument {arg:?} for {program}")]
    UnsafeArgument {
        /// Program the argument was destined for.
        program: &'static str,
        /// The offending argument.
        arg: String,
    },

    /// The shell process could not be spawned.
    #[error("Failed to run `{cmd}`: {source}")]
    Spawn {
        /// Rendered command line.
        cmd: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The command ran but exited unsuccessfully.
    #[error("`{cmd}` exited with {code:?}: {stderr}")]
    NonZeroExit {
        /// Rendered command line.
        cmd: String,
        /// Exit code, if the process was not killed by a signal.
        code: Option<i32>,
        /// Captured standard error.
        stderr: String,
    },
}
