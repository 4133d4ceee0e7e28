//! Per-interface policies: traffic control, routing and packet filtering.
//!
//! Each sub-controller records the commands that applied for an interface
//! together with their undo, and removal replays the undos newest first.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};

use super::interface::VirtualNetworkInterface;
use crate::privileged::{PrivilegedCommand, PrivilegedExecutor};

/// A policy attached to a virtual interface.
pub trait InterfacePolicy: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Whether this policy belongs on `iface` given its transport flags.
    fn wanted(&self, _iface: &VirtualNetworkInterface) -> bool {
        true
    }

    /// Apply to `iface`. Returns the number of steps that applied.
    fn apply(&self, iface: &VirtualNetworkInterface) -> usize;

    /// Undo whatever applied for the named interface. Returns steps undone.
    fn remove(&self, interface_name: &str) -> usize;

    /// Whether anything is applied for the named interface.
    fn is_applied(&self, interface_name: &str) -> bool;
}

/// A command plus the command that reverses it.
struct Step {
    apply: PrivilegedCommand,
    undo: PrivilegedCommand,
}

/// Applied steps keyed by interface name.
struct AppliedSteps {
    executor: Arc<dyn PrivilegedExecutor>,
    steps: Mutex<HashMap<String, Vec<Step>>>,
}

impl AppliedSteps {
    fn new(executor: Arc<dyn PrivilegedExecutor>) -> Self {
        Self {
            executor,
            steps: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<Step>>> {
        match self.steps.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn apply(&self, policy: &'static str, interface: &str, planned: Vec<Step>) -> usize {
        self.remove(policy, interface);

        let mut applied = Vec::with_capacity(planned.len());
        for step in planned {
            match self.executor.execute(&step.apply) {
                Ok(_) => applied.push(step),
                Err(e) => warn!("{} step on {} did not apply: {}", policy, interface, e),
            }
        }
        let count = applied.len();
        if count > 0 {
            self.lock().insert(interface.to_string(), applied);
        }
        debug!("{} applied {} steps on {}", policy, count, interface);
        count
    }

    fn remove(&self, policy: &'static str, interface: &str) -> usize {
        let Some(steps) = self.lock().remove(interface) else {
            return 0;
        };
        steps
            .iter()
            .rev()
            .filter(|step| match self.executor.execute(&step.undo) {
                Ok(_) => true,
                Err(e) => {
                    warn!("{} undo on {} failed: {}", policy, interface, e);
                    false
                }
            })
            .count()
    }

    fn contains(&self, interface: &str) -> bool {
        self.lock().contains_key(interface)
    }
}

/// Drops everything leaving the interface with a 100% loss qdisc.
pub struct TrafficShaper {
    applied: AppliedSteps,
}

impl TrafficShaper {
    /// Create a shaper that runs commands through `executor`.
    pub fn new(executor: Arc<dyn PrivilegedExecutor>) -> Self {
        Self {
            applied: AppliedSteps::new(executor),
        }
    }
}

impl InterfacePolicy for TrafficShaper {
    fn name(&self) -> &'static str {
        "traffic-shaper"
    }

    fn apply(&self, iface: &VirtualNetworkInterface) -> usize {
        let dev = iface.interface_name.as_str();
        let steps = vec![Step {
            apply: PrivilegedCommand::tc(["qdisc", "add", "dev", dev, "root", "netem", "loss", "100%"]),
            undo: PrivilegedCommand::tc(["qdisc", "del", "dev", dev, "root"]),
        }];
        self.applied.apply(self.name(), dev, steps)
    }

    fn remove(&self, interface_name: &str) -> usize {
        self.applied.remove(self.name(), interface_name)
    }

    fn is_applied(&self, interface_name: &str) -> bool {
        self.applied.contains(interface_name)
    }
}

/// Sends the package's UID to a routing table whose default is unreachable.
///
/// Only wanted when every transport is blocked. A per-transport block is left
/// to the interface-matched firewall rules.
pub struct RoutingPolicy {
    applied: AppliedSteps,
}

impl RoutingPolicy {
    /// Create a routing policy that runs commands through `executor`.
    pub fn new(executor: Arc<dyn PrivilegedExecutor>) -> Self {
        Self {
            applied: AppliedSteps::new(executor),
        }
    }
}

impl InterfacePolicy for RoutingPolicy {
    fn name(&self) -> &'static str {
        "routing"
    }

    fn wanted(&self, iface: &VirtualNetworkInterface) -> bool {
        iface.policy.blocks_all()
    }

    fn apply(&self, iface: &VirtualNetworkInterface) -> usize {
        let uid_range = format!("{0}-{0}", iface.uid);
        let table = iface.routing_table.to_string();
        let steps = vec![
            Step {
                apply: PrivilegedCommand::ip(["route", "add", "unreachable", "default", "table", table.as_str()]),
                undo: PrivilegedCommand::ip(["route", "del", "unreachable", "default", "table", table.as_str()]),
            },
            Step {
                apply: PrivilegedCommand::ip(["rule", "add", "uidrange", uid_range.as_str(), "table", table.as_str()]),
                undo: PrivilegedCommand::ip(["rule", "del", "uidrange", uid_range.as_str(), "table", table.as_str()]),
            },
        ];
        self.applied.apply(self.name(), &iface.interface_name, steps)
    }

    fn remove(&self, interface_name: &str) -> usize {
        self.applied.remove(self.name(), interface_name)
    }

    fn is_applied(&self, interface_name: &str) -> bool {
        self.applied.contains(interface_name)
    }
}

/// Drops inbound and forwarded packets on the interface.
pub struct InterfaceFilter {
    applied: AppliedSteps,
}

impl InterfaceFilter {
    /// Create a filter that runs commands through `executor`.
    pub fn new(executor: Arc<dyn PrivilegedExecutor>) -> Self {
        Self {
            applied: AppliedSteps::new(executor),
        }
    }
}

impl InterfacePolicy for InterfaceFilter {
    fn name(&self) -> &'static str {
        "interface-filter"
    }

    fn apply(&self, iface: &VirtualNetworkInterface) -> usize {
        let dev = iface.interface_name.as_str();
        let steps = ["INPUT", "FORWARD"]
            .into_iter()
            .filter_map(|chain| {
                let apply = PrivilegedCommand::iptables(["-A", chain, "-i", dev, "-j", "DROP"]);
                let undo = apply.to_delete()?;
                Some(Step { apply, undo })
            })
            .collect();
        self.applied.apply(self.name(), dev, steps)
    }

    fn remove(&self, interface_name: &str) -> usize {
        self.applied.remove(self.name(), interface_name)
    }

    fn is_applied(&self, interface_name: &str) -> bool {
        self.applied.contains(interface_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::privileged::RecordingExecutor;
    use crate::proxy::NetworkPolicy;
    use std::net::Ipv4Addr;

    fn iface() -> VirtualNetworkInterface {
        VirtualNetworkInterface {
            package_id: "pkg.a".to_string(),
            interface_name: "afence2".to_string(),
            ip_address: Ipv4Addr::new(10, 47, 0, 2),
            subnet_mask: Ipv4Addr::new(255, 255, 255, 0),
            is_active: true,
            uid: 10100,
            routing_table: 1002,
            policy: NetworkPolicy::both(),
        }
    }

    fn rendered(cmds: &[PrivilegedCommand]) -> Vec<String> {
        cmds.iter().map(|c| c.render().unwrap()).collect()
    }

    #[test]
    fn test_shaper_apply_and_remove() {
        let exec = Arc::new(RecordingExecutor::new(true));
        let shaper = TrafficShaper::new(exec.clone());

        assert_eq!(shaper.apply(&iface()), 1);
        assert!(shaper.is_applied("afence2"));
        assert_eq!(shaper.remove("afence2"), 1);
        assert!(!shaper.is_applied("afence2"));

        assert_eq!(
            rendered(&exec.commands()),
            vec![
                "tc qdisc add dev afence2 root netem loss 100%",
                "tc qdisc del dev afence2 root",
            ]
        );
    }

    #[test]
    fn test_routing_undone_in_reverse() {
        let exec = Arc::new(RecordingExecutor::new(true));
        let routing = RoutingPolicy::new(exec.clone());
        routing.apply(&iface());
        exec.clear();

        assert_eq!(routing.remove("afence2"), 2);
        assert_eq!(
            rendered(&exec.commands()),
            vec![
                "ip rule del uidrange 10100-10100 table 1002",
                "ip route del unreachable default table 1002",
            ]
        );
    }

    #[test]
    fn test_routing_wanted_only_for_whole_device_block() {
        let routing = RoutingPolicy::new(Arc::new(RecordingExecutor::new(true)));
        assert!(routing.wanted(&iface()));

        let wifi_only = VirtualNetworkInterface {
            policy: NetworkPolicy::new(true, false),
            ..iface()
        };
        assert!(!routing.wanted(&wifi_only));
        assert!(TrafficShaper::new(Arc::new(RecordingExecutor::new(true))).wanted(&wifi_only));
    }

    #[test]
    fn test_filter_only_undoes_what_applied() {
        let exec = Arc::new(RecordingExecutor::new(true));
        exec.fail_on(PrivilegedCommand::iptables(["-A", "FORWARD", "-i", "afence2", "-j", "DROP"]));
        let filter = InterfaceFilter::new(exec.clone());

        assert_eq!(filter.apply(&iface()), 1);
        exec.clear();
        assert_eq!(filter.remove("afence2"), 1);
        assert_eq!(
            rendered(&exec.commands()),
            vec!["iptables -D INPUT -i afence2 -j DROP"]
        );
    }

    #[test]
    fn test_remove_unknown_interface_is_noop() {
        let exec = Arc::new(RecordingExecutor::new(true));
        let filter = InterfaceFilter::new(exec.clone());
        assert_eq!(filter.remove("afence9"), 0);
        assert!(exec.commands().is_empty());
    }
}
