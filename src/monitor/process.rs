//! Process monitor.
//!
//! When monitoring starts for a package the process table is queried once,
//! and every pid found is handed to each of the four watchers:
//!
//! | Watcher              | Reading                                    |
//! |----------------------|--------------------------------------------|
//! | `connections`        | established TCP sockets owned by the pid   |
//! | `file-descriptors`   | open socket descriptors                    |
//! | `syscalls`           | samples caught inside a socket syscall     |
//! | `memory`             | resident set size in KiB                   |
//!
//! The pid set is a snapshot; processes started later are not picked up
//! until monitoring is restarted.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::error::MonitorError;
use super::procfs;
use super::watcher::{PollTask, RefCountedWatchers, Watcher};
use crate::platform::ProcessTable;

/// A watcher that follows individual pids.
pub trait ProcessWatcher: Watcher {
    /// Follow `pid`, owned by `package`.
    fn watch_pid(&self, package: &str, pid: u32);

    /// Stop following `pid`.
    fn unwatch_pid(&self, pid: u32);

    /// Latest reading for `pid`.
    fn reading(&self, pid: u32) -> Option<u64>;
}

/// What a [`ProcfsWatcher`] measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    /// Established TCP connections.
    Connections,
    /// Socket file descriptors.
    FileDescriptors,
    /// Samples taken while the pid sat in a network syscall.
    Syscalls,
    /// Resident memory.
    Memory,
}

impl ProbeKind {
    /// All kinds, in reporting order.
    pub const ALL: [ProbeKind; 4] = [
        ProbeKind::Connections,
        ProbeKind::FileDescriptors,
        ProbeKind::Syscalls,
        ProbeKind::Memory,
    ];

    fn name(self) -> &'static str {
        match self {
            ProbeKind::Connections => "connections",
            ProbeKind::FileDescriptors => "file-descriptors",
            ProbeKind::Syscalls => "syscalls",
            ProbeKind::Memory => "memory",
        }
    }

    /// Take one sample and fold it into `previous`.
    fn sample(self, proc_root: &Path, pid: u32, previous: u64) -> Option<u64> {
        match self {
            ProbeKind::Connections => procfs::established_connections(proc_root, pid),
            ProbeKind::FileDescriptors => procfs::socket_fd_count(proc_root, pid),
            ProbeKind::Syscalls => {
                let hit = procfs::current_syscall(proc_root, pid)
                    .is_some_and(procfs::is_network_syscall);
                Some(previous + u64::from(hit))
            }
            ProbeKind::Memory => procfs::rss_kib(proc_root, pid),
        }
    }
}

#[derive(Debug, Clone)]
struct PidReading {
    package: String,
    value: u64,
}

type Readings = Arc<Mutex<HashMap<u32, PidReading>>>;

fn lock_readings(readings: &Readings) -> MutexGuard<'_, HashMap<u32, PidReading>> {
    match readings.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Polls one procfs probe for every followed pid.
pub struct ProcfsWatcher {
    kind: ProbeKind,
    proc_root: PathBuf,
    interval: Duration,
    readings: Readings,
    task: PollTask,
}

impl ProcfsWatcher {
    /// Create a watcher of `kind` reading under `proc_root`.
    pub fn new(kind: ProbeKind, proc_root: impl Into<PathBuf>, interval: Duration) -> Self {
        Self {
            kind,
            proc_root: proc_root.into(),
            interval,
            readings: Arc::new(Mutex::new(HashMap::new())),
            task: PollTask::default(),
        }
    }

    /// What this watcher measures.
    pub fn kind(&self) -> ProbeKind {
        self.kind
    }

    /// Whether the poll loop is running.
    pub fn is_polling(&self) -> bool {
        self.task.is_running()
    }

    /// Take one sample of every followed pid now.
    pub fn sample_now(&self) {
        sample_all(self.kind, &self.proc_root, &self.readings);
    }
}

fn sample_all(kind: ProbeKind, proc_root: &Path, readings: &Readings) {
    let pids: Vec<(u32, u64)> = lock_readings(readings)
        .iter()
        .map(|(pid, r)| (*pid, r.value))
        .collect();

    for (pid, previous) in pids {
        let Some(value) = kind.sample(proc_root, pid, previous) else {
            continue;
        };
        if let Some(reading) = lock_readings(readings).get_mut(&pid) {
            if reading.value != value {
                debug!(
                    "{} pid {} ({}) {} -> {}",
                    kind.name(),
                    pid,
                    reading.package,
                    reading.value,
                    value
                );
            }
            reading.value = value;
        }
    }
}

impl Watcher for ProcfsWatcher {
    fn name(&self) -> &'static str {
        self.kind.name()
    }

    fn start(&self) {
        let kind = self.kind;
        let proc_root = self.proc_root.clone();
        let readings = self.readings.clone();
        if let Err(e) = self
            .task
            .start(kind.name(), self.interval, move || sample_all(kind, &proc_root, &readings))
        {
            warn!("{}", e);
        }
    }

    fn stop(&self) {
        self.task.stop();
    }
}

impl ProcessWatcher for ProcfsWatcher {
    fn watch_pid(&self, package: &str, pid: u32) {
        lock_readings(&self.readings).insert(
            pid,
            PidReading {
                package: package.to_string(),
                value: 0,
            },
        );
    }

    fn unwatch_pid(&self, pid: u32) {
        lock_readings(&self.readings).remove(&pid);
    }

    fn reading(&self, pid: u32) -> Option<u64> {
        lock_readings(&self.readings).get(&pid).map(|r| r.value)
    }
}

/// Per-pid monitoring snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessMonitoringState {
    /// Owning package.
    pub package_id: String,
    /// OS process id.
    pub pid: u32,
    /// Whether the pid is still followed.
    pub is_monitored: bool,
    /// When monitoring began.
    pub start_time: DateTime<Utc>,
    /// Watcher name → latest reading.
    pub counters: Vec<(&'static str, u64)>,
}

#[derive(Debug, Clone)]
struct AppProcesses {
    pids: Vec<u32>,
    start_time: DateTime<Utc>,
}

/// Snapshots a package's pids and fans them out to the process watchers.
pub struct ProcessMonitor {
    table: Arc<dyn ProcessTable>,
    watchers: RefCountedWatchers<dyn ProcessWatcher>,
    apps: Mutex<HashMap<String, AppProcesses>>,
}

impl ProcessMonitor {
    /// Create a monitor over custom watchers.
    pub fn new(table: Arc<dyn ProcessTable>, watchers: Vec<Arc<dyn ProcessWatcher>>) -> Self {
        Self {
            table,
            watchers: RefCountedWatchers::new(watchers),
            apps: Mutex::new(HashMap::new()),
        }
    }

    /// Create a monitor with the four procfs watchers.
    pub fn with_procfs(
        table: Arc<dyn ProcessTable>,
        proc_root: impl Into<PathBuf>,
        interval: Duration,
    ) -> Self {
        let proc_root = proc_root.into();
        let watchers = ProbeKind::ALL
            .into_iter()
            .map(|kind| {
                Arc::new(ProcfsWatcher::new(kind, proc_root.clone(), interval))
                    as Arc<dyn ProcessWatcher>
            })
            .collect();
        Self::new(table, watchers)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, AppProcesses>> {
        match self.apps.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Pids currently running for `package`.
    pub fn lookup(&self, package: &str) -> Result<Vec<u32>, MonitorError> {
        Ok(self.table.pids_for_package(package)?)
    }

    /// Snapshot `package`'s pids and follow each one.
    ///
    /// A failed process lookup still registers the package, with no pids.
    /// Calling again replaces the snapshot.
    pub fn start_monitoring(&self, package: &str) -> Vec<u32> {
        let pids = match self.lookup(package) {
            Ok(pids) => pids,
            Err(e) => {
                warn!("Process lookup for {} failed: {}", package, e);
                Vec::new()
            }
        };

        self.watchers.register(package);
        let previous = self.lock().insert(
            package.to_string(),
            AppProcesses {
                pids: pids.clone(),
                start_time: Utc::now(),
            },
        );
        for watcher in self.watchers.watchers() {
            if let Some(old) = &previous {
                for pid in &old.pids {
                    watcher.unwatch_pid(*pid);
                }
            }
            for pid in &pids {
                watcher.watch_pid(package, *pid);
            }
        }

        info!("Monitoring {} process(es) of {}", pids.len(), package);
        pids
    }

    /// Stop following `package`. Returns whether it was monitored.
    pub fn stop_monitoring(&self, package: &str) -> bool {
        let Some(app) = self.lock().remove(package) else {
            return false;
        };
        for watcher in self.watchers.watchers() {
            for pid in &app.pids {
                watcher.unwatch_pid(*pid);
            }
        }
        self.watchers.unregister(package);
        debug!("Stopped process monitoring of {}", package);
        true
    }

    /// Pids captured when monitoring of `package` started.
    pub fn monitored_pids(&self, package: &str) -> Vec<u32> {
        self.lock()
            .get(package)
            .map(|app| app.pids.clone())
            .unwrap_or_default()
    }

    /// Whether `package` is monitored.
    pub fn is_monitoring(&self, package: &str) -> bool {
        self.lock().contains_key(package)
    }

    /// Per-pid state with every watcher's latest reading.
    pub fn process_states(&self, package: &str) -> Vec<ProcessMonitoringState> {
        let Some(app) = self.lock().get(package).cloned() else {
            return Vec::new();
        };
        app.pids
            .iter()
            .map(|&pid| ProcessMonitoringState {
                package_id: package.to_string(),
                pid,
                is_monitored: true,
                start_time: app.start_time,
                counters: self
                    .watchers
                    .watchers()
                    .iter()
                    .map(|w| (w.name(), w.reading(pid).unwrap_or(0)))
                    .collect(),
            })
            .collect()
    }

    /// Watcher lifecycle bookkeeping.
    pub fn watchers(&self) -> &RefCountedWatchers<dyn ProcessWatcher> {
        &self.watchers
    }
}
