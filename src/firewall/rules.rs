//! Rule construction and the per-UID record of installed rules.
//!
//! Every rule is an `iptables -A <chain> ...` command carrying
//! `-m owner --uid-owner <uid>`. The exact command is kept once it applies,
//! so removal replays the same arguments with `-D`.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::config::PrivilegedSettings;
use crate::privileged::PrivilegedCommand;
use crate::proxy::NetworkPolicy;

/// TCP ports dropped for a blocked UID: DNS, HTTP, HTTPS and common proxies.
pub const BLOCKED_TCP_PORTS: &[u16] = &[53, 80, 443, 8080, 8443];

/// Build the ordered rule list for one UID.
///
/// When both transports are blocked the port drops apply on every
/// interface. When only one is, they are scoped to that transport's
/// interface match. Loopback is always let through so the package can reach
/// its local proxy.
pub fn block_rules(
    settings: &PrivilegedSettings,
    uid: u32,
    policy: NetworkPolicy,
) -> Vec<PrivilegedCommand> {
    let chain = settings.chain_name();
    let uid = uid.to_string();
    let rule = |extra: &[&str], target: &str| {
        let mut args = vec!["-A", chain];
        args.extend_from_slice(extra);
        args.extend_from_slice(&["-m", "owner", "--uid-owner", uid.as_str(), "-j", target]);
        PrivilegedCommand::iptables(args)
    };

    let mut ports: Vec<u16> = BLOCKED_TCP_PORTS.to_vec();
    for port in &settings.extra_blocked_ports {
        if !ports.contains(port) {
            ports.push(*port);
        }
    }

    let scopes: Vec<Option<&str>> = match (policy.block_wifi, policy.block_cellular) {
        (true, true) => vec![None],
        (true, false) => vec![Some(settings.wifi_interface())],
        (false, true) => vec![Some(settings.cellular_interface())],
        (false, false) => vec![],
    };

    let mut rules = vec![rule(&["-o", "lo"], "RETURN")];
    for scope in scopes {
        let out: Vec<&str> = match scope {
            Some(iface) => vec!["-o", iface],
            None => vec![],
        };
        let mut udp_dns = out.clone();
        udp_dns.extend_from_slice(&["-p", "udp", "--dport", "53"]);
        rules.push(rule(&udp_dns, "DROP"));

        for port in &ports {
            let port = port.to_string();
            let mut tcp = out.clone();
            tcp.extend_from_slice(&["-p", "tcp", "--dport", port.as_str()]);
            rules.push(rule(&tcp, "DROP"));
        }
    }
    if policy.block_wifi {
        rules.push(rule(&["-o", settings.wifi_interface()], "DROP"));
    }
    if policy.block_cellular {
        rules.push(rule(&["-o", settings.cellular_interface()], "DROP"));
    }
    rules
}

/// Rules that applied, keyed by UID, plus which packages hold each UID.
///
/// Packages that share a UID share its rules; the rules go away when the
/// last of them is released.
#[derive(Debug, Default)]
pub struct RuleSet {
    rules: BTreeMap<u32, Vec<PrivilegedCommand>>,
    holders: HashMap<u32, BTreeSet<String>>,
    package_uids: HashMap<String, u32>,
}

impl RuleSet {
    /// Empty record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the recorded rules for `uid`, returning the old ones.
    pub fn replace(&mut self, uid: u32, rules: Vec<PrivilegedCommand>) -> Vec<PrivilegedCommand> {
        self.rules.insert(uid, rules).unwrap_or_default()
    }

    /// Forget and return the recorded rules for `uid`.
    pub fn take(&mut self, uid: u32) -> Vec<PrivilegedCommand> {
        self.rules.remove(&uid).unwrap_or_default()
    }

    /// Recorded rules for `uid`.
    pub fn get(&self, uid: u32) -> &[PrivilegedCommand] {
        self.rules.get(&uid).map(Vec::as_slice).unwrap_or_default()
    }

    /// Every recorded rule.
    pub fn all(&self) -> Vec<PrivilegedCommand> {
        self.rules.values().flatten().cloned().collect()
    }

    /// UIDs with recorded rules.
    pub fn uids(&self) -> Vec<u32> {
        self.rules.keys().copied().collect()
    }

    /// Mark `package` as holding `uid`.
    pub fn hold(&mut self, package: &str, uid: u32) {
        self.package_uids.insert(package.to_string(), uid);
        self.holders.entry(uid).or_default().insert(package.to_string());
    }

    /// Release `package`. Returns its UID and whether no holder is left.
    pub fn release(&mut self, package: &str) -> Option<(u32, bool)> {
        let uid = self.package_uids.remove(package)?;
        let last = match self.holders.get_mut(&uid) {
            Some(set) => {
                set.remove(package);
                set.is_empty()
            }
            None => true,
        };
        if last {
            self.holders.remove(&uid);
        }
        Some((uid, last))
    }

    /// UID recorded for `package`.
    pub fn uid_of(&self, package: &str) -> Option<u32> {
        self.package_uids.get(package).copied()
    }

    /// Drop every record.
    pub fn clear(&mut self) {
        self.rules.clear();
        self.holders.clear();
        self.package_uids.clear();
    }

    /// Whether nothing is recorded.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty() && self.package_uids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rendered(rules: &[PrivilegedCommand]) -> Vec<String> {
        rules.iter().map(|r| r.render().unwrap()).collect()
    }

    #[test]
    fn test_block_both_transports() {
        let rules = rendered(&block_rules(
            &PrivilegedSettings::default(),
            10123,
            NetworkPolicy::both(),
        ));

        assert_eq!(
            rules,
            vec![
                "iptables -A appfence -o lo -m owner --uid-owner 10123 -j RETURN",
                "iptables -A appfence -p udp --dport 53 -m owner --uid-owner 10123 -j DROP",
                "iptables -A appfence -p tcp --dport 53 -m owner --uid-owner 10123 -j DROP",
                "iptables -A appfence -p tcp --dport 80 -m owner --uid-owner 10123 -j DROP",
                "iptables -A appfence -p tcp --dport 443 -m owner --uid-owner 10123 -j DROP",
                "iptables -A appfence -p tcp --dport 8080 -m owner --uid-owner 10123 -j DROP",
                "iptables -A appfence -p tcp --dport 8443 -m owner --uid-owner 10123 -j DROP",
                "iptables -A appfence -o wlan+ -m owner --uid-owner 10123 -j DROP",
                "iptables -A appfence -o rmnet+ -m owner --uid-owner 10123 -j DROP",
            ]
        );
    }

    #[test]
    fn test_block_wifi_only_scopes_ports() {
        let rules = rendered(&block_rules(
            &PrivilegedSettings::default(),
            10123,
            NetworkPolicy::new(true, false),
        ));

        assert!(rules.iter().skip(1).all(|r| r.contains("-o wlan+")));
        assert!(!rules.iter().any(|r| r.contains("rmnet")));
        assert_eq!(rules.len(), 1 + 6 + 1);
    }

    #[test]
    fn test_extra_ports_and_custom_chain() {
        let settings = PrivilegedSettings {
            chain_name: Some("fence".to_string()),
            extra_blocked_ports: vec![443, 1080],
            ..Default::default()
        };
        let rules = rendered(&block_rules(&settings, 7, NetworkPolicy::both()));

        assert!(rules.iter().all(|r| r.starts_with("iptables -A fence ")));
        assert_eq!(rules.iter().filter(|r| r.contains("--dport 443")).count(), 1);
        assert!(rules.iter().any(|r| r.contains("--dport 1080")));
    }

    #[test]
    fn test_every_rule_reverses() {
        for rule in block_rules(&PrivilegedSettings::default(), 1, NetworkPolicy::both()) {
            let delete = rule.to_delete().unwrap();
            assert_eq!(delete.args[0], "-D");
            assert_eq!(delete.args[1..], rule.args[1..]);
        }
    }

    #[test]
    fn test_shared_uid_holders() {
        let mut set = RuleSet::new();
        set.hold("pkg.a", 10050);
        set.hold("pkg.b", 10050);

        assert_eq!(set.release("pkg.a"), Some((10050, false)));
        assert_eq!(set.release("pkg.b"), Some((10050, true)));
        assert_eq!(set.release("pkg.b"), None);
    }

    #[test]
    fn test_replace_and_take() {
        let mut set = RuleSet::new();
        let rules = block_rules(&PrivilegedSettings::default(), 5, NetworkPolicy::both());
        assert!(set.replace(5, rules.clone()).is_empty());
        assert_eq!(set.get(5), rules.as_slice());
        assert_eq!(set.replace(5, Vec::new()), rules);
        assert!(set.take(5).is_empty());
        assert!(set.get(5).is_empty());
    }
}
