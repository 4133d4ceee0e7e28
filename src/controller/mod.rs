//! Per-app network controller.
//!
//! The only entry point other subsystems need. It owns the authoritative
//! block-state map and drives every enforcement tier:
//!
//! ```text
//! block_app_internet(pkg) ──▶ BlockStateStore (sync)
//!                       └──▶ reconcile(pkg) (async, per-package lock)
//!                              ├─ AppProxyServer + NetworkInterceptor
//!                              ├─ EnforcementTier (firewall, interface)
//!                              └─ AntiBypassDetector + ProcessMonitor
//! ```
//!
//! Each reconcile yields an [`EnforcementReport`] with one outcome per tier.
//! A failing tier never stops the others from being attempted.

mod builder;
mod error;
mod orchestrator;
mod registry;
mod report;
mod state;
mod tier;

pub use builder::ControllerBuilder;
pub use error::ControllerError;
pub use orchestrator::PerAppNetworkController;
pub use report::{tier as tiers, Action, EnforcementReport, EnforcementTask, TierOutcome, TierReport};
pub use state::{AppBlockState, BlockStateStore};
pub use tier::{AppLevelOnly, EnforcementTier, PrivilegedTier};
