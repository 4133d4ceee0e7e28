//! Telemetry error types.

use thiserror::Error;

/// Errors that can occur during telemetry operations.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Failed to connect to syslog.
    #[error("Failed to connect to syslog: {0}")]
    SyslogConnection(String),

    /// Logger already initialized.
    #[error("Audit logger already initialized")]
    AlreadyInitialized,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = TelemetryError::SyslogConnection("no socket".to_string());
        assert_eq!(err.to_string(), "Failed to connect to syslog: no socket");
        assert_eq!(
            TelemetryError::AlreadyInitialized.to_string(),
            "Audit logger already initialized"
        );
    }
}
