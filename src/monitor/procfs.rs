//! procfs probes used by the process watchers.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

/// TCP state code for ESTABLISHED in `/proc/net/tcp`.
const TCP_ESTABLISHED: &str = "01";

#[cfg(target_arch = "aarch64")]
pub(crate) const NETWORK_SYSCALLS: &[u64] = &[198, 200, 203, 206, 207, 211, 212];
#[cfg(not(target_arch = "aarch64"))]
pub(crate) const NETWORK_SYSCALLS: &[u64] = &[41, 42, 44, 45, 46, 47, 49];

/// Inodes of every socket open in `pid`.
pub fn socket_inodes(proc_root: &Path, pid: u32) -> Option<HashSet<u64>> {
    let entries = fs::read_dir(proc_root.join(pid.to_string()).join("fd")).ok()?;
    let inodes = entries
        .flatten()
        .filter_map(|entry| fs::read_link(entry.path()).ok())
        .filter_map(|target| {
            target
                .to_str()?
                .strip_prefix("socket:[")?
                .strip_suffix(']')?
                .parse()
                .ok()
        })
        .collect();
    Some(inodes)
}

/// Number of socket descriptors open in `pid`.
pub fn socket_fd_count(proc_root: &Path, pid: u32) -> Option<u64> {
    socket_inodes(proc_root, pid).map(|inodes| inodes.len() as u64)
}

/// Established TCP connections owned by `pid`.
pub fn established_connections(proc_root: &Path, pid: u32) -> Option<u64> {
    let inodes = socket_inodes(proc_root, pid)?;
    let net = proc_root.join(pid.to_string()).join("net");

    let mut count = 0;
    for table in ["tcp", "tcp6"] {
        let Ok(content) = fs::read_to_string(net.join(table)) else {
            continue;
        };
        count += content
            .lines()
            .skip(1)
            .filter(|line| {
                let fields: Vec<&str> = line.split_whitespace().collect();
                fields.len() > 9
                    && fields[3] == TCP_ESTABLISHED
                    && fields[9].parse::<u64>().is_ok_and(|i| inodes.contains(&i))
            })
            .count() as u64;
    }
    Some(count)
}

/// Syscall `pid` is blocked in, if any.
pub fn current_syscall(proc_root: &Path, pid: u32) -> Option<u64> {
    let content = fs::read_to_string(proc_root.join(pid.to_string()).join("syscall")).ok()?;
    content.split_whitespace().next()?.parse().ok()
}

/// Whether `nr` is a socket-family syscall on this architecture.
pub fn is_network_syscall(nr: u64) -> bool {
    NETWORK_SYSCALLS.contains(&nr)
}

/// Resident set size of `pid` in KiB.
pub fn rss_kib(proc_root: &Path, pid: u32) -> Option<u64> {
    let status = fs::read_to_string(proc_root.join(pid.to_string()).join("status")).ok()?;
    status
        .lines()
        .find_map(|line| line.strip_prefix("VmRSS:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse().ok())
}
