//! Per-package virtual interfaces.
//!
//! # Lifecycle
//!
//! ```text
//! create:  allocate address → ip link add <name> type dummy → ip addr add
//!          → ip link set up → shaper, routing, filter
//! destroy: filter, routing, shaper → ip link del → release address
//! ```
//!
//! The record is inserted before any command runs. A destroy that arrives
//! while a create or reconfigure is still running only drops the record;
//! the configuring call then tears down what it built and releases the
//! address itself, so the name cannot be handed out twice.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tracing::{debug, info, warn};

use super::error::NetifError;
use super::policies::{InterfaceFilter, InterfacePolicy, RoutingPolicy, TrafficShaper};
use super::pool::AddressPool;
use crate::config::InterfaceSettings;
use crate::privileged::{PrivilegedCommand, PrivilegedExecutor};
use crate::proxy::NetworkPolicy;
use crate::telemetry::{self, AuditEvent};

/// A package's virtual interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VirtualNetworkInterface {
    /// Owning package.
    pub package_id: String,
    /// Link name (`<prefix><host octet>`).
    pub interface_name: String,
    /// Address from the pool.
    pub ip_address: Ipv4Addr,
    /// Pool netmask.
    pub subnet_mask: Ipv4Addr,
    /// Whether the link came up with its policies.
    pub is_active: bool,
    /// Package UID used by the routing policy.
    pub uid: u32,
    /// Routing table reserved for this interface.
    pub routing_table: u32,
    /// Transports blocked for the package.
    pub policy: NetworkPolicy,
}

struct NetifState {
    pool: AddressPool,
    interfaces: HashMap<String, VirtualNetworkInterface>,
    /// Packages whose create or reconfigure is running.
    configuring: HashSet<String>,
    /// Destroyed while configuring; the configuring call tears down.
    cancelled: HashSet<String>,
}

/// Creates, configures and destroys per-package interfaces.
pub struct NetworkInterfaceController {
    executor: Arc<dyn PrivilegedExecutor>,
    settings: InterfaceSettings,
    state: Mutex<NetifState>,
    shaper: TrafficShaper,
    routing: RoutingPolicy,
    filter: InterfaceFilter,
}

impl NetworkInterfaceController {
    /// Create a controller with an empty pool.
    pub fn new(executor: Arc<dyn PrivilegedExecutor>, settings: InterfaceSettings) -> Self {
        Self {
            shaper: TrafficShaper::new(executor.clone()),
            routing: RoutingPolicy::new(executor.clone()),
            filter: InterfaceFilter::new(executor.clone()),
            state: Mutex::new(NetifState {
                pool: AddressPool::new(settings.pool_base()),
                interfaces: HashMap::new(),
                configuring: HashSet::new(),
                cancelled: HashSet::new(),
            }),
            executor,
            settings,
        }
    }

    fn lock(&self) -> MutexGuard<'_, NetifState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn policies(&self) -> [&dyn InterfacePolicy; 3] {
        [&self.shaper, &self.routing, &self.filter]
    }

    /// Create and configure the interface for `package`.
    ///
    /// An existing interface with the same `policy` is returned unchanged;
    /// with a different one its policies are re-applied in place.
    pub fn create_interface(
        &self,
        package: &str,
        uid: u32,
        policy: NetworkPolicy,
    ) -> Result<VirtualNetworkInterface, NetifError> {
        let (iface, fresh) = {
            let mut guard = self.lock();
            let state = &mut *guard;
            match state.interfaces.get_mut(package) {
                Some(existing) if existing.policy == policy => return Ok(existing.clone()),
                Some(existing) => {
                    existing.policy = policy;
                    state.configuring.insert(package.to_string());
                    (existing.clone(), false)
                }
                None => {
                    let base = state.pool.base();
                    let address = state
                        .pool
                        .allocate()
                        .ok_or(NetifError::PoolExhausted { base })?;
                    let octet = address.octets()[3];
                    let iface = VirtualNetworkInterface {
                        package_id: package.to_string(),
                        interface_name: format!("{}{}", self.settings.name_prefix(), octet),
                        ip_address: address,
                        subnet_mask: Ipv4Addr::new(255, 255, 255, 0),
                        is_active: false,
                        uid,
                        routing_table: self.settings.routing_table_base() + u32::from(octet),
                        policy,
                    };
                    state.interfaces.insert(package.to_string(), iface.clone());
                    state.configuring.insert(package.to_string());
                    (iface, true)
                }
            }
        };
        let name = iface.interface_name.as_str();

        if fresh {
            if let Err(source) = self
                .executor
                .execute(&PrivilegedCommand::ip(["link", "add", name, "type", "dummy"]))
            {
                let mut state = self.lock();
                state.configuring.remove(package);
                if !state.cancelled.remove(package) {
                    state.interfaces.remove(package);
                }
                state.pool.release(iface.ip_address);
                return Err(NetifError::LinkCreate {
                    name: name.to_string(),
                    source,
                });
            }

            let cidr = format!("{}/24", iface.ip_address);
            for cmd in [
                PrivilegedCommand::ip(["addr", "add", cidr.as_str(), "dev", name]),
                PrivilegedCommand::ip(["link", "set", name, "up"]),
            ] {
                if let Err(e) = self.executor.execute(&cmd) {
                    warn!("Configuring {} failed: {}", name, e);
                }
            }
        }

        self.configure(&iface);

        let active = {
            let mut state = self.lock();
            state.configuring.remove(package);
            if state.cancelled.remove(package) {
                None
            } else {
                state.interfaces.get_mut(package).map(|record| {
                    record.is_active = true;
                    record.clone()
                })
            }
        };
        let Some(active) = active else {
            debug!("{} destroyed while configuring {}", package, name);
            self.teardown(&iface)?;
            return Ok(VirtualNetworkInterface {
                is_active: false,
                ..iface
            });
        };

        if fresh {
            info!(
                "Created {} ({}) for {}",
                active.interface_name, active.ip_address, package
            );
            telemetry::record(AuditEvent::InterfaceCreated {
                package: package.to_string(),
                interface: active.interface_name.clone(),
                address: active.ip_address.to_string(),
            });
        } else {
            info!("Reconfigured {} for {}", active.interface_name, package);
        }
        Ok(active)
    }

    /// Apply the policies `iface` wants and remove the rest.
    fn configure(&self, iface: &VirtualNetworkInterface) {
        let name = iface.interface_name.as_str();
        for policy in self.policies() {
            if !policy.wanted(iface) {
                policy.remove(name);
            } else if policy.apply(iface) == 0 {
                warn!("{} did not apply on {}", policy.name(), name);
            }
        }
    }

    /// Remove the interface of `package`. Returns whether one existed.
    pub fn destroy_interface(&self, package: &str) -> Result<bool, NetifError> {
        let iface = {
            let mut state = self.lock();
            let Some(iface) = state.interfaces.remove(package) else {
                return Ok(false);
            };
            if state.configuring.contains(package) {
                state.cancelled.insert(package.to_string());
                debug!("Deferring removal of {} until configured", iface.interface_name);
                return Ok(true);
            }
            iface
        };
        self.teardown(&iface)?;
        Ok(true)
    }

    fn teardown(&self, iface: &VirtualNetworkInterface) -> Result<(), NetifError> {
        let name = iface.interface_name.as_str();
        for policy in self.policies().into_iter().rev() {
            policy.remove(name);
        }
        let result = self
            .executor
            .execute(&PrivilegedCommand::ip(["link", "del", name]));
        self.lock().pool.release(iface.ip_address);

        info!("Destroyed {} for {}", name, iface.package_id);
        telemetry::record(AuditEvent::InterfaceDestroyed {
            package: iface.package_id.clone(),
            interface: name.to_string(),
        });
        result.map(|_| ()).map_err(NetifError::from)
    }

    /// The interface of `package`, if any.
    pub fn interface_for(&self, package: &str) -> Option<VirtualNetworkInterface> {
        self.lock().interfaces.get(package).cloned()
    }

    /// Snapshot of every interface, sorted by address.
    pub fn interfaces(&self) -> Vec<VirtualNetworkInterface> {
        let mut all: Vec<_> = self.lock().interfaces.values().cloned().collect();
        all.sort_by_key(|i| i.ip_address);
        all
    }

    /// Names of policies applied on `interface_name`.
    pub fn applied_policies(&self, interface_name: &str) -> Vec<&'static str> {
        self.policies()
            .into_iter()
            .filter(|p| p.is_applied(interface_name))
            .map(|p| p.name())
            .collect()
    }

    /// Destroy every interface. Returns how many were removed.
    pub fn cleanup(&self) -> usize {
        let packages: Vec<String> = self.lock().interfaces.keys().cloned().collect();
        let mut removed = 0;
        for package in packages {
            match self.destroy_interface(&package) {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!("Removing interface of {} failed: {}", package, e);
                    removed += 1;
                }
            }
        }
        removed
    }
}
