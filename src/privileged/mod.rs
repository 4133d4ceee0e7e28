//! Privileged command execution.
//!
//! Replaces string-built `su -c '...'` invocations with a closed set of
//! programs and validated arguments:
//!
//! ```ignore
//! use appfence::privileged::{PrivilegedCommand, PrivilegedExecutor, SuExecutor};
//!
//! let exec = SuExecutor::new("su");
//! if exec.is_available() {
//!     exec.run(&PrivilegedCommand::iptables(["-N", "appfence"]));
//! }
//! ```

pub mod command;
pub mod error;
pub mod executor;

pub use command::{PrivilegedCommand, Program};
pub use error::CommandError;
pub use executor::{
    DirectExecutor, PrivilegedExecutor, RecordingExecutor, SuExecutor, UnprivilegedExecutor,
};
