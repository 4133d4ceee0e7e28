//! Host platform collaborators.
//!
//! - [`PackageRegistry`]: package identifier → UID
//! - [`NetworkTypeProvider`]: is the device on Wi-Fi or cellular
//! - [`ProcessTable`]: package identifier → running pids

pub mod error;
pub mod network;
pub mod packages;
pub mod process;

pub use error::PlatformError;
pub use network::{FixedNetworkType, NetworkType, NetworkTypeProvider, SysfsNetworkType};
pub use packages::{PackageRegistry, PackagesListRegistry, StaticPackageRegistry};
pub use process::{
    parse_ps_listing, process_name_matches, ProcessTable, ProcfsProcessTable, PsProcessTable,
    StaticProcessTable,
};
