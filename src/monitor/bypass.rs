//! Anti-bypass detection.
//!
//! Four watchers fingerprint the system settings an app could use to route
//! around enforcement. Each takes a baseline when started and compares on
//! every tick; a change while at least one package is monitored becomes a
//! [`BypassEvent`] on the detector's broadcast channel and an audit record.
//!
//! The routing table and firewall watchers also see appfence's own kernel
//! changes. Those happen inside [`AntiBypassDetector::expect_changes`], which
//! pauses the two watchers and re-baselines them afterwards.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::process::ProcessMonitor;
use super::watcher::{PollTask, RefCountedWatchers, Watcher};
use crate::firewall::SystemNetworkController;
use crate::privileged::{PrivilegedCommand, PrivilegedExecutor, Program};
use crate::telemetry::{self, AuditEvent};

const EVENT_CAPACITY: usize = 64;

/// A detected attempt to get around enforcement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BypassEvent {
    /// Watcher that noticed the change.
    pub watcher: &'static str,
    /// Packages monitored when it happened.
    pub packages: Vec<String>,
    /// What changed.
    pub detail: String,
}

/// A watcher scoped to a set of monitored packages.
pub trait BypassWatcher: Watcher {
    /// Include `package` in future events.
    fn monitor_app(&self, package: &str);

    /// Drop `package` from future events.
    fn stop_monitoring_app(&self, package: &str);

    /// Compare against the baseline now.
    fn check_now(&self) -> Option<BypassEvent>;

    /// Ignore changes made by appfence itself until [`resume`](Self::resume).
    fn suspend(&self) {}

    /// Undo one [`suspend`](Self::suspend); the last one takes a new baseline.
    fn resume(&self) {}
}

/// Where a [`FingerprintWatcher`] reads its state from.
#[derive(Clone)]
pub enum BypassProbe {
    /// Kernel routing table.
    NetworkConfig { route_table: PathBuf },
    /// Global HTTP proxy setting.
    ProxySettings { executor: Arc<dyn PrivilegedExecutor> },
    /// Resolver configuration.
    DnsSettings { resolv_conf: PathBuf },
    /// Rules recorded by the firewall tier, checked against the live chain.
    FirewallRules {
        executor: Arc<dyn PrivilegedExecutor>,
        firewall: Option<Arc<SystemNetworkController>>,
    },
}

impl BypassProbe {
    fn name(&self) -> &'static str {
        match self {
            BypassProbe::NetworkConfig { .. } => "network-config",
            BypassProbe::ProxySettings { .. } => "proxy-settings",
            BypassProbe::DnsSettings { .. } => "dns-settings",
            BypassProbe::FirewallRules { .. } => "firewall-rules",
        }
    }

    /// Current fingerprint, or `None` when the source cannot be read.
    fn fingerprint(&self) -> Option<String> {
        match self {
            BypassProbe::NetworkConfig { route_table } => read_file(route_table),
            BypassProbe::DnsSettings { resolv_conf } => read_file(resolv_conf),
            BypassProbe::ProxySettings { executor } => {
                let cmd = PrivilegedCommand::new(
                    Program::Settings,
                    ["get", "global", "http_proxy"],
                );
                let out = executor.execute(&cmd).ok()?;
                let value = out.trim();
                Some(if value == "null" { "" } else { value }.to_string())
            }
            BypassProbe::FirewallRules { executor, firewall } => {
                let Some(firewall) = firewall else {
                    return Some(String::new());
                };
                let recorded = firewall.all_rules();
                if recorded.is_empty() {
                    return Some(String::new());
                }
                let listing = executor
                    .execute(&PrivilegedCommand::iptables(["-S", firewall.chain()]))
                    .ok()?;
                let missing: Vec<String> = recorded
                    .iter()
                    .filter(|rule| !rule_listed(rule, &listing))
                    .map(|rule| rule.args.join(" "))
                    .collect();
                Some(missing.join("\n"))
            }
        }
    }

    /// Whether appfence's own enforcement changes what this probe reads.
    fn sees_enforcement(&self) -> bool {
        matches!(
            self,
            BypassProbe::NetworkConfig { .. } | BypassProbe::FirewallRules { .. }
        )
    }

    fn describe(&self, current: &str) -> String {
        match self {
            BypassProbe::NetworkConfig { .. } => "routing table changed".to_string(),
            BypassProbe::DnsSettings { resolv_conf } => {
                format!("{} changed", resolv_conf.display())
            }
            BypassProbe::ProxySettings { .. } if current.is_empty() => {
                "global http_proxy cleared".to_string()
            }
            BypassProbe::ProxySettings { .. } => format!("global http_proxy set to {current}"),
            BypassProbe::FirewallRules { .. } if current.is_empty() => {
                "firewall rules restored".to_string()
            }
            BypassProbe::FirewallRules { .. } => {
                format!("{} firewall rule(s) missing", current.lines().count())
            }
        }
    }
}

fn read_file(path: &Path) -> Option<String> {
    match fs::read_to_string(path) {
        Ok(content) => Some(content),
        Err(e) => {
            debug!("Cannot read {}: {}", path.display(), e);
            None
        }
    }
}

/// Whether `rule` appears in an `iptables -S` listing.
///
/// iptables normalises rules on output (adding `-m udp` and the like), so a
/// rule counts as listed when its arguments appear in order within one line.
fn rule_listed(rule: &PrivilegedCommand, listing: &str) -> bool {
    listing.lines().any(|line| {
        let mut tokens = line.split_whitespace();
        rule.args
            .iter()
            .all(|arg| tokens.by_ref().any(|token| token == arg))
    })
}

#[derive(Default)]
struct Baseline {
    value: Option<String>,
    suspended: usize,
}

struct FingerprintState {
    probe: BypassProbe,
    baseline: Mutex<Baseline>,
    packages: Mutex<BTreeSet<String>>,
    events: broadcast::Sender<BypassEvent>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl FingerprintState {
    fn rebaseline(&self) {
        lock(&self.baseline).value = self.probe.fingerprint();
    }

    fn suspend(&self) {
        lock(&self.baseline).suspended += 1;
    }

    fn resume(&self) {
        let mut baseline = lock(&self.baseline);
        baseline.suspended = baseline.suspended.saturating_sub(1);
        // A stopped watcher has no baseline to refresh.
        if baseline.suspended == 0 && baseline.value.is_some() {
            baseline.value = self.probe.fingerprint();
        }
    }

    fn check(&self) -> Option<BypassEvent> {
        let current = {
            // Held across the read so a suspend cannot land mid-comparison.
            let mut baseline = lock(&self.baseline);
            if baseline.suspended > 0 {
                return None;
            }
            let current = self.probe.fingerprint()?;
            let previous = baseline.value.replace(current.clone());
            if previous.is_none() || previous.as_deref() == Some(current.as_str()) {
                return None;
            }
            current
        };

        let packages: Vec<String> = lock(&self.packages).iter().cloned().collect();
        if packages.is_empty() {
            return None;
        }

        let event = BypassEvent {
            watcher: self.probe.name(),
            packages,
            detail: self.probe.describe(&current),
        };
        warn!(
            "Possible bypass ({}): {} [{}]",
            event.watcher,
            event.detail,
            event.packages.join(", ")
        );
        telemetry::record(AuditEvent::BypassDetected {
            watcher: event.watcher.to_string(),
            packages: event.packages.clone(),
            detail: event.detail.clone(),
        });
        // No subscribers is fine.
        let _ = self.events.send(event.clone());
        Some(event)
    }
}

/// Compares a [`BypassProbe`] fingerprint against its baseline.
pub struct FingerprintWatcher {
    state: Arc<FingerprintState>,
    interval: Duration,
    task: PollTask,
}

impl FingerprintWatcher {
    /// Create a watcher publishing to `events`.
    pub fn new(
        probe: BypassProbe,
        interval: Duration,
        events: broadcast::Sender<BypassEvent>,
    ) -> Self {
        Self {
            state: Arc::new(FingerprintState {
                probe,
                baseline: Mutex::new(Baseline::default()),
                packages: Mutex::new(BTreeSet::new()),
                events,
            }),
            interval,
            task: PollTask::default(),
        }
    }

    /// Whether the poll loop is running.
    pub fn is_polling(&self) -> bool {
        self.task.is_running()
    }
}

impl Watcher for FingerprintWatcher {
    fn name(&self) -> &'static str {
        self.state.probe.name()
    }

    fn start(&self) {
        self.state.rebaseline();
        let state = self.state.clone();
        if let Err(e) = self.task.start(self.name(), self.interval, move || {
            state.check();
        }) {
            warn!("{}", e);
        }
    }

    fn stop(&self) {
        self.task.stop();
        lock(&self.state.baseline).value = None;
    }
}

impl BypassWatcher for FingerprintWatcher {
    fn monitor_app(&self, package: &str) {
        lock(&self.state.packages).insert(package.to_string());
    }

    fn stop_monitoring_app(&self, package: &str) {
        lock(&self.state.packages).remove(package);
    }

    fn check_now(&self) -> Option<BypassEvent> {
        self.state.check()
    }

    fn suspend(&self) {
        if self.state.probe.sees_enforcement() {
            self.state.suspend();
        }
    }

    fn resume(&self) {
        if self.state.probe.sees_enforcement() {
            self.state.resume();
        }
    }
}

/// Watchers paused by [`AntiBypassDetector::expect_changes`]; resumes on drop.
pub struct ExpectedChanges<'a> {
    watchers: &'a [Arc<dyn BypassWatcher>],
}

impl Drop for ExpectedChanges<'_> {
    fn drop(&mut self) {
        for watcher in self.watchers {
            watcher.resume();
        }
    }
}

/// Runs the bypass watchers and the process monitor for blocked packages.
pub struct AntiBypassDetector {
    watchers: RefCountedWatchers<dyn BypassWatcher>,
    processes: Arc<ProcessMonitor>,
    events: broadcast::Sender<BypassEvent>,
}

impl AntiBypassDetector {
    /// Create a detector over custom watchers publishing to `events`.
    pub fn new(
        watchers: Vec<Arc<dyn BypassWatcher>>,
        processes: Arc<ProcessMonitor>,
        events: broadcast::Sender<BypassEvent>,
    ) -> Self {
        Self {
            watchers: RefCountedWatchers::new(watchers),
            processes,
            events,
        }
    }

    /// Create a detector with the four fingerprint watchers.
    pub fn standard(
        proc_root: PathBuf,
        resolv_conf: PathBuf,
        interval: Duration,
        executor: Arc<dyn PrivilegedExecutor>,
        firewall: Option<Arc<SystemNetworkController>>,
        processes: Arc<ProcessMonitor>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let probes = [
            BypassProbe::NetworkConfig {
                route_table: proc_root.join("net").join("route"),
            },
            BypassProbe::ProxySettings {
                executor: executor.clone(),
            },
            BypassProbe::DnsSettings { resolv_conf },
            BypassProbe::FirewallRules { executor, firewall },
        ];
        let watchers = probes
            .into_iter()
            .map(|probe| {
                Arc::new(FingerprintWatcher::new(probe, interval, events.clone()))
                    as Arc<dyn BypassWatcher>
            })
            .collect();
        Self::new(watchers, processes, events)
    }

    /// Watch `package`. The watchers start with the first package.
    pub fn start_monitoring(&self, package: &str) {
        for watcher in self.watchers.watchers() {
            watcher.monitor_app(package);
        }
        if self.watchers.register(package) {
            info!("Bypass detection enabled for {}", package);
        }
        self.processes.start_monitoring(package);
    }

    /// Stop watching `package`. The watchers stop with the last package.
    pub fn stop_monitoring(&self, package: &str) {
        for watcher in self.watchers.watchers() {
            watcher.stop_monitoring_app(package);
        }
        if self.watchers.unregister(package) {
            info!("Bypass detection disabled for {}", package);
        }
        self.processes.stop_monitoring(package);
    }

    /// Pause the watchers that would see appfence's own kernel changes.
    ///
    /// Hold the guard while adding or removing rules and interfaces; the
    /// watchers re-baseline once the last guard is dropped.
    pub fn expect_changes(&self) -> ExpectedChanges<'_> {
        let watchers = self.watchers.watchers();
        for watcher in watchers {
            watcher.suspend();
        }
        ExpectedChanges { watchers }
    }

    /// Receive future bypass events.
    pub fn subscribe(&self) -> broadcast::Receiver<BypassEvent> {
        self.events.subscribe()
    }

    /// Packages currently monitored, sorted.
    pub fn monitored_apps(&self) -> Vec<String> {
        self.watchers.registered()
    }

    /// Run every watcher's comparison once.
    pub fn check_all(&self) -> Vec<BypassEvent> {
        self.watchers
            .watchers()
            .iter()
            .filter_map(|w| w.check_now())
            .collect()
    }

    /// Watcher lifecycle bookkeeping.
    pub fn watchers(&self) -> &RefCountedWatchers<dyn BypassWatcher> {
        &self.watchers
    }

    /// The process monitor driven alongside the watchers.
    pub fn process_monitor(&self) -> &Arc<ProcessMonitor> {
        &self.processes
    }

    /// Stop everything.
    pub fn shutdown(&self) {
        for package in self.monitored_apps() {
            self.stop_monitoring(&package);
        }
    }
}
