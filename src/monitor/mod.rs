//! Process monitoring and anti-bypass detection.
//!
//! Both halves share one lifecycle rule: their watchers start when the first
//! package is registered and stop when the last one leaves
//! ([`RefCountedWatchers`]).

pub mod bypass;
pub mod error;
pub mod process;
pub mod procfs;
pub mod watcher;

pub use bypass::{
    AntiBypassDetector, BypassEvent, BypassProbe, BypassWatcher, ExpectedChanges, FingerprintWatcher,
};
pub use error::MonitorError;
pub use process::{
    ProbeKind, ProcessMonitor, ProcessMonitoringState, ProcessWatcher, ProcfsWatcher,
};
pub use watcher::{RefCountedWatchers, Watcher};
