//! Root-only per-UID packet filtering.
//!
//! # Chain layout
//!
//! ```text
//! OUTPUT ──(-I 1)──▶ appfence ──▶ per-UID rules (RETURN lo, DROP ...)
//! ```
//!
//! All mutation happens under one lock over the [`RuleSet`], so two
//! packages can never interleave edits to the same UID's rules.

use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};

use super::error::FirewallError;
use super::rules::{RuleSet, block_rules};
use crate::config::PrivilegedSettings;
use crate::platform::PackageRegistry;
use crate::privileged::{PrivilegedCommand, PrivilegedExecutor};
use crate::proxy::NetworkPolicy;
use crate::telemetry::{self, AuditEvent};

struct FirewallState {
    rules: RuleSet,
    chain_ready: bool,
}

/// Installs and removes per-UID DROP rules.
pub struct SystemNetworkController {
    executor: Arc<dyn PrivilegedExecutor>,
    registry: Arc<dyn PackageRegistry>,
    settings: PrivilegedSettings,
    state: Mutex<FirewallState>,
}

/// What a block call installed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSummary {
    /// Resolved UID.
    pub uid: u32,
    /// Rules that applied.
    pub installed: usize,
    /// Rules that failed.
    pub failed: usize,
}

impl SystemNetworkController {
    /// Create a controller; nothing runs until the first block or
    /// [`initialize`](Self::initialize).
    pub fn new(
        executor: Arc<dyn PrivilegedExecutor>,
        registry: Arc<dyn PackageRegistry>,
        settings: PrivilegedSettings,
    ) -> Self {
        Self {
            executor,
            registry,
            settings,
            state: Mutex::new(FirewallState {
                rules: RuleSet::new(),
                chain_ready: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FirewallState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Name of the owned chain.
    pub fn chain(&self) -> &str {
        self.settings.chain_name()
    }

    /// Create the chain and link it from OUTPUT.
    pub fn initialize(&self) -> Result<(), FirewallError> {
        let mut state = self.lock();
        self.ensure_chain(&mut state)
    }

    fn ensure_chain(&self, state: &mut FirewallState) -> Result<(), FirewallError> {
        if state.chain_ready {
            return Ok(());
        }
        let chain = self.chain();

        if let Err(e) = self.executor.execute(&PrivilegedCommand::iptables(["-N", chain])) {
            debug!("Chain {} not created ({}), flushing existing", chain, e);
            self.executor
                .execute(&PrivilegedCommand::iptables(["-F", chain]))?;
        }
        // A jump left by an earlier run would make the new one a duplicate.
        let _ = self
            .executor
            .execute(&PrivilegedCommand::iptables(["-D", "OUTPUT", "-j", chain]));
        self.executor
            .execute(&PrivilegedCommand::iptables(["-I", "OUTPUT", "1", "-j", chain]))?;

        state.chain_ready = true;
        info!("Packet-filter chain {} linked from OUTPUT", chain);
        Ok(())
    }

    /// Resolve the UID for `package`.
    pub fn uid_for(&self, package: &str) -> Result<u32, FirewallError> {
        Ok(self.registry.uid_for_package(package)?)
    }

    /// Install DROP rules for `package`'s UID, replacing any it already has.
    pub fn block_package(
        &self,
        package: &str,
        policy: NetworkPolicy,
    ) -> Result<RuleSummary, FirewallError> {
        let uid = self.uid_for(package)?;
        let mut state = self.lock();
        self.ensure_chain(&mut state)?;

        // New rules go in before the old ones come out.
        let previous = state.rules.take(uid);
        let wanted = block_rules(&self.settings, uid, policy);
        let attempted = wanted.len();
        let mut applied = Vec::with_capacity(attempted);
        for rule in wanted {
            match self.executor.execute(&rule) {
                Ok(_) => applied.push(rule),
                Err(e) => warn!("Rule for uid {} did not apply: {}", uid, e),
            }
        }

        let installed = applied.len();
        if installed == 0 {
            if !previous.is_empty() {
                state.rules.replace(uid, previous);
            }
            return Err(FirewallError::NoRulesApplied { uid, attempted });
        }
        if !previous.is_empty() {
            let removed = self.delete_rules(&previous);
            debug!("Replaced {} existing rules for uid {}", removed, uid);
        }
        state.rules.replace(uid, applied);
        state.rules.hold(package, uid);
        drop(state);

        info!("Installed {}/{} rules for {} (uid {})", installed, attempted, package, uid);
        telemetry::record(AuditEvent::RulesInstalled {
            package: package.to_string(),
            uid,
            count: installed,
        });

        Ok(RuleSummary {
            uid,
            installed,
            failed: attempted - installed,
        })
    }

    /// Remove exactly the rules recorded for `package`'s UID.
    ///
    /// Rules stay in place while another package still holds the same UID.
    /// Returns the number of rules removed.
    pub fn unblock_package(&self, package: &str) -> Result<usize, FirewallError> {
        let mut state = self.lock();
        let Some((uid, last_holder)) = state.rules.release(package) else {
            debug!("No rules recorded for {}", package);
            return Ok(0);
        };
        if !last_holder {
            info!("uid {} still held by another package; rules kept", uid);
            return Ok(0);
        }

        let rules = state.rules.take(uid);
        drop(state);
        let removed = self.delete_rules(&rules);

        info!("Removed {} rules for {} (uid {})", removed, package, uid);
        telemetry::record(AuditEvent::RulesRemoved { uid, count: removed });
        Ok(removed)
    }

    fn delete_rules(&self, rules: &[PrivilegedCommand]) -> usize {
        rules
            .iter()
            .filter_map(PrivilegedCommand::to_delete)
            .filter(|delete| match self.executor.execute(delete) {
                Ok(_) => true,
                Err(e) => {
                    warn!("Failed to remove rule: {}", e);
                    false
                }
            })
            .count()
    }

    /// Rules currently recorded for `uid`.
    pub fn installed_rules(&self, uid: u32) -> Vec<PrivilegedCommand> {
        self.lock().rules.get(uid).to_vec()
    }

    /// Every recorded rule.
    pub fn all_rules(&self) -> Vec<PrivilegedCommand> {
        self.lock().rules.all()
    }

    /// UID recorded for a blocked package.
    pub fn blocked_uid(&self, package: &str) -> Option<u32> {
        self.lock().rules.uid_of(package)
    }

    /// Remove every rule and the chain itself. Safe to call repeatedly.
    pub fn cleanup(&self) -> Result<usize, FirewallError> {
        let mut state = self.lock();
        if !state.chain_ready && state.rules.is_empty() {
            return Ok(0);
        }

        let mut removed = 0;
        for uid in state.rules.uids() {
            let rules = state.rules.take(uid);
            let count = self.delete_rules(&rules);
            telemetry::record(AuditEvent::RulesRemoved { uid, count });
            removed += count;
        }
        state.rules.clear();

        let chain = self.chain();
        let teardown = [
            PrivilegedCommand::iptables(["-D", "OUTPUT", "-j", chain]),
            PrivilegedCommand::iptables(["-F", chain]),
            PrivilegedCommand::iptables(["-X", chain]),
        ];
        let mut first_error = None;
        for cmd in &teardown {
            if let Err(e) = self.executor.execute(cmd) {
                warn!("Chain teardown step failed: {}", e);
                first_error.get_or_insert(e);
            }
        }
        state.chain_ready = false;

        info!("Packet-filter cleanup removed {} rules", removed);
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(removed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::StaticPackageRegistry;
    use crate::privileged::{Program, RecordingExecutor};

    fn setup() -> (Arc<RecordingExecutor>, SystemNetworkController) {
        let exec = Arc::new(RecordingExecutor::new(true));
        let registry = StaticPackageRegistry::new()
            .with_package("pkg.a", 10100)
            .with_package("pkg.b", 10200)
            .with_package("pkg.shared", 10100);
        let controller = SystemNetworkController::new(
            exec.clone(),
            Arc::new(registry),
            PrivilegedSettings::default(),
        );
        (exec, controller)
    }

    fn rendered(cmds: &[PrivilegedCommand]) -> Vec<String> {
        cmds.iter().map(|c| c.render().unwrap()).collect()
    }

    #[test]
    fn test_initialize_links_chain() {
        let (exec, fw) = setup();
        fw.initialize().unwrap();

        assert_eq!(
            rendered(&exec.commands()),
            vec![
                "iptables -N appfence",
                "iptables -D OUTPUT -j appfence",
                "iptables -I OUTPUT 1 -j appfence",
            ]
        );

        fw.initialize().unwrap();
        assert_eq!(exec.commands().len(), 3);
    }

    #[test]
    fn test_existing_chain_is_flushed() {
        let (exec, fw) = setup();
        exec.fail_on(PrivilegedCommand::iptables(["-N", "appfence"]));
        fw.initialize().unwrap();

        assert!(rendered(&exec.commands()).contains(&"iptables -F appfence".to_string()));
    }

    #[test]
    fn test_unblock_removes_exactly_installed_rules() {
        let (exec, fw) = setup();
        let summary = fw.block_package("pkg.a", NetworkPolicy::both()).unwrap();
        fw.block_package("pkg.b", NetworkPolicy::both()).unwrap();
        assert_eq!(summary.uid, 10100);
        assert_eq!(summary.failed, 0);

        let installed = fw.installed_rules(10100);
        assert_eq!(installed.len(), summary.installed);

        exec.clear();
        assert_eq!(fw.unblock_package("pkg.a").unwrap(), installed.len());

        let expected: Vec<PrivilegedCommand> =
            installed.iter().filter_map(PrivilegedCommand::to_delete).collect();
        assert_eq!(exec.commands(), expected);
        assert!(fw.installed_rules(10100).is_empty());
        assert!(!fw.installed_rules(10200).is_empty());
    }

    #[test]
    fn test_failed_rule_not_recorded() {
        let (exec, fw) = setup();
        let rules = block_rules(&PrivilegedSettings::default(), 10100, NetworkPolicy::both());
        exec.fail_on(rules[3].clone());

        let summary = fw.block_package("pkg.a", NetworkPolicy::both()).unwrap();
        assert_eq!(summary.failed, 1);
        assert!(!fw.installed_rules(10100).contains(&rules[3]));

        exec.clear();
        fw.unblock_package("pkg.a").unwrap();
        let deletes = exec.commands();
        assert_eq!(deletes.len(), rules.len() - 1);
        assert!(!deletes.contains(&rules[3].to_delete().unwrap()));
    }

    #[test]
    fn test_reblock_replaces_rules() {
        let (exec, fw) = setup();
        fw.block_package("pkg.a", NetworkPolicy::both()).unwrap();
        let first = fw.installed_rules(10100);

        exec.clear();
        fw.block_package("pkg.a", NetworkPolicy::new(true, false)).unwrap();
        let second = fw.installed_rules(10100);

        let deletes: Vec<_> = exec
            .commands()
            .into_iter()
            .filter(|c| c.args[0] == "-D")
            .collect();
        assert_eq!(deletes.len(), first.len());
        assert_ne!(first, second);
        assert!(second.iter().all(|r| !r.render().unwrap().contains("rmnet")));
    }

    #[test]
    fn test_reblock_adds_before_deleting() {
        let (exec, fw) = setup();
        fw.block_package("pkg.a", NetworkPolicy::both()).unwrap();
        exec.clear();

        fw.block_package("pkg.a", NetworkPolicy::new(false, true)).unwrap();
        let flags: Vec<String> = exec
            .commands()
            .into_iter()
            .filter(|c| c.args.first().is_some_and(|a| a == "-A" || a == "-D"))
            .map(|c| c.args[0].clone())
            .collect();
        let last_add = flags.iter().rposition(|f| f == "-A").unwrap();
        let first_delete = flags.iter().position(|f| f == "-D").unwrap();
        assert!(last_add < first_delete);
    }

    #[test]
    fn test_failed_reblock_keeps_old_rules() {
        let (exec, fw) = setup();
        fw.block_package("pkg.a", NetworkPolicy::both()).unwrap();
        let first = fw.installed_rules(10100);
        for rule in block_rules(&PrivilegedSettings::default(), 10100, NetworkPolicy::new(true, false)) {
            exec.fail_on(rule);
        }
        exec.clear();

        let result = fw.block_package("pkg.a", NetworkPolicy::new(true, false));
        assert!(matches!(result, Err(FirewallError::NoRulesApplied { .. })));
        assert_eq!(fw.installed_rules(10100), first);
        assert!(exec.commands().iter().all(|c| c.args[0] != "-D"));
    }

    #[test]
    fn test_unknown_package_aborts_tier() {
        let (exec, fw) = setup();
        let result = fw.block_package("pkg.unknown", NetworkPolicy::both());
        assert!(matches!(result, Err(FirewallError::UidResolution(_))));
        assert!(exec.commands().is_empty());
    }

    #[test]
    fn test_all_rules_failing_is_error() {
        let (exec, fw) = setup();
        for rule in block_rules(&PrivilegedSettings::default(), 10200, NetworkPolicy::both()) {
            exec.fail_on(rule);
        }
        let result = fw.block_package("pkg.b", NetworkPolicy::both());
        assert!(matches!(result, Err(FirewallError::NoRulesApplied { uid: 10200, .. })));
        assert_eq!(fw.unblock_package("pkg.b").unwrap(), 0);
    }

    #[test]
    fn test_shared_uid_kept_until_last_holder() {
        let (_exec, fw) = setup();
        fw.block_package("pkg.a", NetworkPolicy::both()).unwrap();
        fw.block_package("pkg.shared", NetworkPolicy::both()).unwrap();

        assert_eq!(fw.unblock_package("pkg.a").unwrap(), 0);
        assert!(!fw.installed_rules(10100).is_empty());
        assert!(fw.unblock_package("pkg.shared").unwrap() > 0);
        assert!(fw.installed_rules(10100).is_empty());
    }

    #[test]
    fn test_cleanup_is_idempotent() {
        let (exec, fw) = setup();
        fw.block_package("pkg.a", NetworkPolicy::both()).unwrap();
        fw.block_package("pkg.b", NetworkPolicy::new(false, true)).unwrap();

        exec.clear();
        fw.cleanup().unwrap();
        let cmds = rendered(&exec.commands());
        assert!(cmds.iter().any(|c| c == "iptables -X appfence"));
        assert!(fw.all_rules().is_empty());

        exec.clear();
        assert_eq!(fw.cleanup().unwrap(), 0);
        assert!(exec.commands_for(Program::Iptables).is_empty());
    }
}
