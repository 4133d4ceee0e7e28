//! Telemetry and audit logging for appfence.
//!
//! # Architecture
//!
//! - **Audit logging** (syslog): enforcement events go to syslog as JSON
//! - **Debug logging** (tracing): diagnostics go to stderr via `tracing`
//! - These are completely separate concerns
//!
//! # Usage
//!
//! ```ignore
//! use appfence::telemetry::{self, AuditEvent};
//!
//! telemetry::init_logger()?;
//! telemetry::record(AuditEvent::AppAllowed { package: "com.example".into() });
//! ```
//!
//! # Event Format
//!
//! ```json
//! {"ts":"2026-01-07T14:32:01Z","event":"app_blocked","package":"com.example","block_wifi":true,"block_cellular":true}
//! ```

mod error;
mod events;
mod syslog;

pub use error::TelemetryError;
pub use events::{AuditEvent, BlockReason};
pub use syslog::{init_logger, record, try_audit, AuditLogger, SYSLOG_TAG};
