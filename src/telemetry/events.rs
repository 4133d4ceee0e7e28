//! Audit event types for structured logging.
//!
//! These events are logged to syslog with the `APPFENCE` tag so that block
//! decisions and tampering can be reconstructed after the fact.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Audit events for security logging.
///
/// Each variant represents a significant enforcement event.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    /// A package was marked as blocked.
    AppBlocked {
        /// Package identifier.
        package: String,
        /// Whether Wi-Fi traffic is blocked.
        block_wifi: bool,
        /// Whether cellular traffic is blocked.
        block_cellular: bool,
    },

    /// A package was marked as allowed again.
    AppAllowed {
        /// Package identifier.
        package: String,
    },

    /// The proxy refused a request.
    RequestBlocked {
        /// Package the proxy belongs to.
        package: String,
        /// Target host of the request.
        host: String,
        /// Reason for blocking.
        reason: BlockReason,
    },

    /// The proxy forwarded a request upstream.
    RequestForwarded {
        /// Package the proxy belongs to.
        package: String,
        /// Target host of the request.
        host: String,
    },

    /// Packet-filter rules were installed for a UID.
    RulesInstalled {
        /// Package identifier.
        package: String,
        /// Resolved UID.
        uid: u32,
        /// Number of rules that applied.
        count: usize,
    },

    /// Packet-filter rules were removed for a UID.
    RulesRemoved {
        /// Resolved UID.
        uid: u32,
        /// Number of rules removed.
        count: usize,
    },

    /// A virtual interface was created for a package.
    InterfaceCreated {
        /// Package identifier.
        package: String,
        /// Interface name.
        interface: String,
        /// Assigned address.
        address: String,
    },

    /// A virtual interface was destroyed.
    InterfaceDestroyed {
        /// Package identifier.
        package: String,
        /// Interface name.
        interface: String,
    },

    /// A bypass watcher observed a change while packages were monitored.
    BypassDetected {
        /// Name of the watcher that fired.
        watcher: String,
        /// Packages being monitored at the time.
        packages: Vec<String>,
        /// Human-readable description of the change.
        detail: String,
    },
}

/// Reasons for blocking a proxied request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    /// The active network type is blocked for this package.
    NetworkType,
    /// Host matched the blocked-domain set.
    BlockedDomain,
    /// URL matched a blocked pattern.
    BlockedUrl,
    /// A header filter rejected the request.
    HeaderFilter,
    /// A body filter rejected the request.
    BodyFilter,
}

/// Wrapper for serializing events with timestamp.
#[derive(Debug, Clone, Serialize)]
pub struct TimestampedEvent<'a> {
    /// ISO8601 timestamp.
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,

    /// The actual event (flattened into this struct).
    #[serde(flatten)]
    pub event: &'a AuditEvent,
}

impl AuditEvent {
    /// Wrap this event with a timestamp for serialization.
    pub fn with_timestamp(&self) -> TimestampedEvent<'_> {
        TimestampedEvent {
            timestamp: Utc::now(),
            event: self,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_blocked_serialization() {
        let event = AuditEvent::AppBlocked {
            package: "com.example.app".to_string(),
            block_wifi: true,
            block_cellular: false,
        };

        let json = serde_json::to_string(&event.with_timestamp()).unwrap();

        assert!(json.contains("\"event\":\"app_blocked\""));
        assert!(json.contains("\"package\":\"com.example.app\""));
        assert!(json.contains("\"block_wifi\":true"));
        assert!(json.contains("\"block_cellular\":false"));
        assert!(json.contains("\"ts\""));
    }

    #[test]
    fn test_request_blocked_serialization() {
        let event = AuditEvent::RequestBlocked {
            package: "com.example.app".to_string(),
            host: "facebook.com".to_string(),
            reason: BlockReason::BlockedDomain,
        };

        let json = serde_json::to_string(&event.with_timestamp()).unwrap();

        assert!(json.contains("\"event\":\"request_blocked\""));
        assert!(json.contains("\"reason\":\"blocked_domain\""));
    }

    #[test]
    fn test_bypass_detected_serialization() {
        let event = AuditEvent::BypassDetected {
            watcher: "dns-settings".to_string(),
            packages: vec!["pkg.a".to_string()],
            detail: "resolv.conf changed".to_string(),
        };

        let json = serde_json::to_string(&event.with_timestamp()).unwrap();

        assert!(json.contains("\"event\":\"bypass_detected\""));
        assert!(json.contains("\"packages\":[\"pkg.a\"]"));
    }

    #[test]
    fn test_rules_removed_serialization() {
        let event = AuditEvent::RulesRemoved { uid: 10123, count: 9 };
        let json = serde_json::to_string(&event.with_timestamp()).unwrap();

        assert!(json.contains("\"event\":\"rules_removed\""));
        assert!(json.contains("\"uid\":10123"));
        assert!(json.contains("\"count\":9"));
    }
}
