//! Per-tier enforcement results.

use std::fmt;

use serde::Serialize;
use tokio::task::{JoinError, JoinHandle};

/// Tier names used in reports.
pub mod tier {
    /// Per-package HTTP proxy.
    pub const PROXY: &str = "proxy";
    /// Socket/HTTP/DNS/WebView interceptors.
    pub const INTERCEPTOR: &str = "interceptor";
    /// Per-UID packet filter rules.
    pub const FIREWALL: &str = "firewall";
    /// Virtual interface and its policies.
    pub const INTERFACE: &str = "interface";
    /// Anti-bypass and process monitoring.
    pub const MONITORING: &str = "monitoring";
}

/// Which way a reconcile converged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Enforcement was brought up.
    Block,
    /// Enforcement was torn down.
    Allow,
}

/// What happened to one tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "detail")]
pub enum TierOutcome {
    /// The tier is enforcing.
    Applied,
    /// The tier's resources were released (or there were none).
    Released,
    /// The tier does not exist on this device.
    Unavailable,
    /// The tier was attempted and failed.
    Failed(String),
}

impl TierOutcome {
    /// Whether the tier failed.
    pub fn is_failure(&self) -> bool {
        matches!(self, TierOutcome::Failed(_))
    }
}

impl fmt::Display for TierOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TierOutcome::Applied => write!(f, "applied"),
            TierOutcome::Released => write!(f, "released"),
            TierOutcome::Unavailable => write!(f, "unavailable"),
            TierOutcome::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Outcome of one tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TierReport {
    /// Tier name, one of [`tier`].
    pub tier: &'static str,
    /// What happened.
    pub outcome: TierOutcome,
}

impl TierReport {
    /// Pair a tier name with its outcome.
    pub fn new(tier: &'static str, outcome: TierOutcome) -> Self {
        Self { tier, outcome }
    }
}

/// Result of one reconcile for one package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnforcementReport {
    /// Package reconciled.
    pub package: String,
    /// Direction the package converged to.
    pub action: Action,
    /// One entry per tier, in execution order.
    pub tiers: Vec<TierReport>,
}

impl EnforcementReport {
    /// Outcome of the named tier.
    pub fn outcome(&self, tier: &str) -> Option<&TierOutcome> {
        self.tiers.iter().find(|t| t.tier == tier).map(|t| &t.outcome)
    }

    /// Tiers that failed.
    pub fn failures(&self) -> Vec<&TierReport> {
        self.tiers.iter().filter(|t| t.outcome.is_failure()).collect()
    }

    /// Whether no tier failed.
    pub fn is_clean(&self) -> bool {
        self.failures().is_empty()
    }
}

/// Handle to the asynchronous half of a block or allow call.
///
/// Dropping it leaves the work running.
#[derive(Debug)]
pub struct EnforcementTask {
    handle: JoinHandle<EnforcementReport>,
}

impl EnforcementTask {
    pub(crate) fn new(handle: JoinHandle<EnforcementReport>) -> Self {
        Self { handle }
    }

    /// Wait for enforcement to finish.
    pub async fn wait(self) -> Result<EnforcementReport, JoinError> {
        self.handle.await
    }

    /// Whether the work has finished.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_lookup_and_failures() {
        let report = EnforcementReport {
            package: "pkg.a".to_string(),
            action: Action::Block,
            tiers: vec![
                TierReport::new(tier::PROXY, TierOutcome::Applied),
                TierReport::new(tier::FIREWALL, TierOutcome::Failed("no uid".to_string())),
                TierReport::new(tier::INTERFACE, TierOutcome::Unavailable),
            ],
        };

        assert_eq!(report.outcome(tier::PROXY), Some(&TierOutcome::Applied));
        assert_eq!(report.outcome(tier::MONITORING), None);
        assert_eq!(report.failures().len(), 1);
        assert!(!report.is_clean());
        assert_eq!(report.tiers[1].outcome.to_string(), "failed: no uid");
    }

    #[test]
    fn test_report_serializes_outcome_tag() {
        let report = TierReport::new(tier::PROXY, TierOutcome::Failed("bind".to_string()));
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"status\":\"failed\""));
        assert!(json.contains("\"detail\":\"bind\""));
    }
}
