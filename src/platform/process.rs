//! Package → running process ids.
//!
//! Android runs each package (and each of its `:subprocess` variants) as a
//! process whose command line is the package name. Two strategies are
//! provided: scanning procfs directly, and parsing a `ps` listing by header
//! name rather than by fixed column index, since the column layout differs
//! between toolbox, toybox and procps.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::trace;

use super::error::PlatformError;
use crate::privileged::{PrivilegedCommand, PrivilegedExecutor, Program};

/// Finds the OS process ids currently associated with a package.
pub trait ProcessTable: Send + Sync {
    /// Point-in-time snapshot of the package's pids, sorted ascending.
    fn pids_for_package(&self, package: &str) -> Result<Vec<u32>, PlatformError>;
}

/// Whether a process name belongs to `package`.
///
/// Matches the package itself and its named subprocesses (`pkg:remote`).
pub fn process_name_matches(name: &str, package: &str) -> bool {
    match name.strip_prefix(package) {
        Some("") => true,
        Some(rest) => rest.starts_with(':'),
        None => false,
    }
}

/// Scans `<proc_root>/<pid>/cmdline`.
pub struct ProcfsProcessTable {
    proc_root: PathBuf,
}

impl ProcfsProcessTable {
    /// Create a table reading the given procfs mount.
    pub fn new(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
        }
    }
}

impl ProcessTable for ProcfsProcessTable {
    fn pids_for_package(&self, package: &str) -> Result<Vec<u32>, PlatformError> {
        let entries = fs::read_dir(&self.proc_root).map_err(|e| PlatformError::Read {
            path: self.proc_root.clone(),
            source: e,
        })?;

        let mut pids: Vec<u32> = entries
            .flatten()
            .filter_map(|entry| {
                let pid = entry.file_name().to_string_lossy().parse::<u32>().ok()?;
                // Processes may exit between readdir and read; skip them.
                let cmdline = fs::read(entry.path().join("cmdline")).ok()?;
                let argv0 = cmdline.split(|b| *b == 0).next()?;
                let name = String::from_utf8_lossy(argv0);
                process_name_matches(&name, package).then_some(pid)
            })
            .collect();

        pids.sort_unstable();
        trace!("Package {} has pids {:?}", package, pids);
        Ok(pids)
    }
}

/// Runs `ps -A` through the privileged executor and parses it.
///
/// Useful where procfs entries of other apps are hidden (`hidepid=2`).
pub struct PsProcessTable {
    executor: Arc<dyn PrivilegedExecutor>,
}

impl PsProcessTable {
    /// Create a table that lists processes via `executor`.
    pub fn new(executor: Arc<dyn PrivilegedExecutor>) -> Self {
        Self { executor }
    }
}

impl ProcessTable for PsProcessTable {
    fn pids_for_package(&self, package: &str) -> Result<Vec<u32>, PlatformError> {
        let listing = self
            .executor
            .execute(&PrivilegedCommand::new(Program::Ps, ["-A"]))
            .map_err(|e| PlatformError::Parse {
                what: "ps listing",
                message: e.to_string(),
            })?;

        let mut pids: Vec<u32> = parse_ps_listing(&listing)?
            .into_iter()
            .filter(|(_, name)| process_name_matches(name, package))
            .map(|(pid, _)| pid)
            .collect();
        pids.sort_unstable();
        Ok(pids)
    }
}

/// Parse a `ps` listing into `(pid, name)` pairs.
///
/// The `PID` column is located from the header. The name is taken from the
/// `NAME`, `CMD` or `COMMAND` column when present, otherwise the last field.
pub fn parse_ps_listing(listing: &str) -> Result<Vec<(u32, String)>, PlatformError> {
    let mut lines = listing.lines().filter(|l| !l.trim().is_empty());
    let header: Vec<&str> = lines
        .next()
        .ok_or_else(|| PlatformError::Parse {
            what: "ps listing",
            message: "empty output".to_string(),
        })?
        .split_whitespace()
        .collect();

    let pid_col = header
        .iter()
        .position(|h| *h == "PID")
        .ok_or_else(|| PlatformError::Parse {
            what: "ps listing",
            message: "no PID column in header".to_string(),
        })?;
    let name_col = header
        .iter()
        .position(|h| matches!(*h, "NAME" | "CMD" | "COMMAND"));

    let mut rows = Vec::new();
    for line in lines {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let Some(pid) = fields.get(pid_col).and_then(|f| f.parse::<u32>().ok()) else {
            continue;
        };
        // Some ps variants emit an empty WCHAN/S column, shifting the row left;
        // the name is always the trailing field in those layouts.
        let name = match name_col {
            Some(col) if fields.len() == header.len() => fields.get(col),
            _ => fields.last(),
        };
        if let Some(name) = name {
            rows.push((pid, (*name).to_string()));
        }
    }
    Ok(rows)
}

/// In-memory process table.
#[derive(Debug, Default)]
pub struct StaticProcessTable {
    pids: std::sync::RwLock<HashMap<String, Vec<u32>>>,
}

impl StaticProcessTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the pids associated with `package`.
    pub fn set(&self, package: impl Into<String>, pids: Vec<u32>) {
        self.pids
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(package.into(), pids);
    }
}

impl ProcessTable for StaticProcessTable {
    fn pids_for_package(&self, package: &str) -> Result<Vec<u32>, PlatformError> {
        let mut pids = self
            .pids
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(package)
            .cloned()
            .unwrap_or_default();
        pids.sort_unstable();
        Ok(pids)
    }
}
