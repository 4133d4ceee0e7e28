//! Privilege-dependent enforcement.
//!
//! Whether a superuser shell exists is decided once, when the controller is
//! built, and captured as an [`EnforcementTier`]. The controller then calls
//! the same methods on every device: [`PrivilegedTier`] does the kernel-level
//! work and [`AppLevelOnly`] reports itself unavailable.
//!
//! Tier methods block on subprocesses; the controller calls them from
//! `spawn_blocking`.

use std::sync::Arc;

use tracing::{info, warn};

use super::report::{tier, TierOutcome, TierReport};
use crate::firewall::SystemNetworkController;
use crate::netif::NetworkInterfaceController;
use crate::proxy::NetworkPolicy;

/// Kernel-level enforcement selected at startup.
pub trait EnforcementTier: Send + Sync {
    /// Whether this tier runs privileged commands.
    fn is_privileged(&self) -> bool;

    /// Bring up enforcement for `package`.
    fn enforce(&self, package: &str, policy: NetworkPolicy) -> Vec<TierReport>;

    /// Tear down everything [`enforce`](Self::enforce) created for `package`.
    fn release(&self, package: &str) -> Vec<TierReport>;

    /// Tear down everything for every package.
    fn cleanup(&self) -> Vec<TierReport>;

    /// Firewall whose rules should be supervised, if any.
    fn firewall(&self) -> Option<Arc<SystemNetworkController>> {
        None
    }
}

/// Tier used when no superuser shell is reachable.
#[derive(Debug, Default, Clone, Copy)]
pub struct AppLevelOnly;

fn unavailable() -> Vec<TierReport> {
    vec![
        TierReport::new(tier::FIREWALL, TierOutcome::Unavailable),
        TierReport::new(tier::INTERFACE, TierOutcome::Unavailable),
    ]
}

impl EnforcementTier for AppLevelOnly {
    fn is_privileged(&self) -> bool {
        false
    }

    fn enforce(&self, _package: &str, _policy: NetworkPolicy) -> Vec<TierReport> {
        unavailable()
    }

    fn release(&self, _package: &str) -> Vec<TierReport> {
        unavailable()
    }

    fn cleanup(&self) -> Vec<TierReport> {
        unavailable()
    }
}

/// Per-UID packet filtering plus a per-package virtual interface.
pub struct PrivilegedTier {
    firewall: Arc<SystemNetworkController>,
    interfaces: NetworkInterfaceController,
}

impl PrivilegedTier {
    /// Combine the two privileged controllers.
    pub fn new(
        firewall: Arc<SystemNetworkController>,
        interfaces: NetworkInterfaceController,
    ) -> Self {
        Self {
            firewall,
            interfaces,
        }
    }

    /// The virtual interface controller.
    pub fn interfaces(&self) -> &NetworkInterfaceController {
        &self.interfaces
    }
}

impl EnforcementTier for PrivilegedTier {
    fn is_privileged(&self) -> bool {
        true
    }

    fn enforce(&self, package: &str, policy: NetworkPolicy) -> Vec<TierReport> {
        // The interface needs the UID; without one both halves are skipped.
        let uid = match self.firewall.uid_for(package) {
            Ok(uid) => uid,
            Err(e) => {
                warn!("Skipping privileged tier for {}: {}", package, e);
                let reason = e.to_string();
                return vec![
                    TierReport::new(tier::FIREWALL, TierOutcome::Failed(reason.clone())),
                    TierReport::new(tier::INTERFACE, TierOutcome::Failed(reason)),
                ];
            }
        };

        let firewall = match self.firewall.block_package(package, policy) {
            Ok(summary) => {
                if summary.failed > 0 {
                    warn!(
                        "{} of {} rules for {} failed",
                        summary.failed,
                        summary.installed + summary.failed,
                        package
                    );
                }
                TierOutcome::Applied
            }
            Err(e) => {
                warn!("Firewall block of {} failed: {}", package, e);
                TierOutcome::Failed(e.to_string())
            }
        };

        let interface = match self.interfaces.create_interface(package, uid, policy) {
            Ok(iface) => {
                info!("{} isolated on {}", package, iface.interface_name);
                TierOutcome::Applied
            }
            Err(e) => {
                warn!("Interface for {} failed: {}", package, e);
                TierOutcome::Failed(e.to_string())
            }
        };

        vec![
            TierReport::new(tier::FIREWALL, firewall),
            TierReport::new(tier::INTERFACE, interface),
        ]
    }

    fn release(&self, package: &str) -> Vec<TierReport> {
        let firewall = match self.firewall.unblock_package(package) {
            Ok(_) => TierOutcome::Released,
            Err(e) => {
                warn!("Firewall unblock of {} failed: {}", package, e);
                TierOutcome::Failed(e.to_string())
            }
        };
        let interface = match self.interfaces.destroy_interface(package) {
            Ok(_) => TierOutcome::Released,
            Err(e) => {
                warn!("Removing interface of {} failed: {}", package, e);
                TierOutcome::Failed(e.to_string())
            }
        };
        vec![
            TierReport::new(tier::FIREWALL, firewall),
            TierReport::new(tier::INTERFACE, interface),
        ]
    }

    fn cleanup(&self) -> Vec<TierReport> {
        let interfaces = self.interfaces.cleanup();
        let firewall = match self.firewall.cleanup() {
            Ok(removed) => {
                info!(
                    "Privileged cleanup removed {} rules and {} interfaces",
                    removed, interfaces
                );
                TierOutcome::Released
            }
            Err(e) => {
                warn!("Firewall cleanup failed: {}", e);
                TierOutcome::Failed(e.to_string())
            }
        };
        vec![
            TierReport::new(tier::FIREWALL, firewall),
            TierReport::new(tier::INTERFACE, TierOutcome::Released),
        ]
    }

    fn firewall(&self) -> Option<Arc<SystemNetworkController>> {
        Some(self.firewall.clone())
    }
}
