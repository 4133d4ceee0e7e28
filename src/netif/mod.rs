//! Privileged virtual interface tier.
//!
//! Each blocked package gets a dummy link with an address from a private
//! /24 and up to three policies attached to it: a 100% loss qdisc,
//! INPUT/FORWARD drops and, when every transport is blocked, a UID routing
//! rule into an unreachable table.

pub mod error;
pub mod interface;
pub mod policies;
pub mod pool;

pub use error::NetifError;
pub use interface::{NetworkInterfaceController, VirtualNetworkInterface};
pub use policies::{InterfaceFilter, InterfacePolicy, RoutingPolicy, TrafficShaper};
pub use pool::AddressPool;
