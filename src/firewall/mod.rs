//! Privileged packet-filter tier.
//!
//! Resolves a package to its UID and drops that UID's DNS, web and proxy
//! traffic with owner-matched iptables rules in a dedicated chain. Every
//! applied rule is recorded so that unblocking replays it with `-D`.

pub mod controller;
pub mod error;
pub mod rules;

pub use controller::{RuleSummary, SystemNetworkController};
pub use error::FirewallError;
pub use rules::{BLOCKED_TCP_PORTS, RuleSet, block_rules};
