//! appfence: per-application internet access control.
//!
//! Given a package identifier, appfence stops that application's network
//! traffic (or only its Wi-Fi or cellular traffic) while leaving other
//! applications alone, and watches for attempts to get around the block.
//!
//! # Enforcement tiers
//!
//! - **Proxy**: a loopback HTTP proxy per package with domain, URL and
//!   network-type policy (always available)
//! - **Interceptor**: socket, HTTP, DNS and WebView hooks enforcing the same
//!   policy (always available)
//! - **Firewall**: per-UID packet filter rules (superuser only)
//! - **Interface**: an isolated virtual interface per package (superuser only)
//! - **Monitoring**: process watchers and anti-bypass detection
//!
//! Start at [`controller::ControllerBuilder`].

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod cleanup;
pub mod cli;
pub mod cli_handler;
pub mod config;
pub mod controller;
pub mod firewall;
pub mod interceptor;
pub mod monitor;
pub mod netif;
pub mod platform;
pub mod privileged;
pub mod proxy;
pub mod telemetry;
