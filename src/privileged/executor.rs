//! Privileged command executors.
//!
//! Every privileged component goes through a [`PrivilegedExecutor`]. Each
//! call is one synchronous subprocess: no batching, no retries.

use std::collections::HashMap;
use std::process::Command;
use std::sync::Mutex;

use tracing::{debug, trace};

use super::command::{PrivilegedCommand, Program};
use super::error::CommandError;

/// Runs structured commands as the superuser.
pub trait PrivilegedExecutor: Send + Sync {
    /// Whether a superuser shell is reachable.
    ///
    /// This may spawn a probe process; callers decide how often to ask.
    fn is_available(&self) -> bool;

    /// Run a command, returning its standard output on success.
    fn execute(&self, cmd: &PrivilegedCommand) -> Result<String, CommandError>;

    /// Run a command and report only whether it succeeded.
    fn run(&self, cmd: &PrivilegedCommand) -> bool {
        match self.execute(cmd) {
            Ok(_) => true,
            Err(e) => {
                debug!("Privileged command failed: {}", e);
                false
            }
        }
    }
}

/// Executes commands through `su -c`.
pub struct SuExecutor {
    su_binary: String,
}

impl SuExecutor {
    /// Create an executor that invokes the given `su` binary.
    pub fn new(su_binary: impl Into<String>) -> Self {
        Self {
            su_binary: su_binary.into(),
        }
    }
}

impl PrivilegedExecutor for SuExecutor {
    fn is_available(&self) -> bool {
        let probe = PrivilegedCommand::new(Program::Id, ["-u"]);
        match self.execute(&probe) {
            Ok(out) => out.trim() == "0",
            Err(e) => {
                debug!("Superuser probe failed: {}", e);
                false
            }
        }
    }

    fn execute(&self, cmd: &PrivilegedCommand) -> Result<String, CommandError> {
        let rendered = cmd.render()?;
        let cmd_str = format!("{} -c {}", self.su_binary, rendered);
        trace!("Running: {}", cmd_str);

        let output = Command::new(&self.su_binary)
            .arg("-c")
            .arg(&rendered)
            .output()
            .map_err(|e| CommandError::Spawn {
                cmd: cmd_str.clone(),
                source: e,
            })?;

        finish(cmd_str, output)
    }
}

/// Executes commands directly, for hosts where appfence itself runs as root.
pub struct DirectExecutor;

impl PrivilegedExecutor for DirectExecutor {
    fn is_available(&self) -> bool {
        let probe = PrivilegedCommand::new(Program::Id, ["-u"]);
        self.execute(&probe)
            .map(|out| out.trim() == "0")
            .unwrap_or(false)
    }

    fn execute(&self, cmd: &PrivilegedCommand) -> Result<String, CommandError> {
        // Validate even though no shell is involved, so both executors accept
        // exactly the same commands.
        let cmd_str = cmd.render()?;
        trace!("Running: {}", cmd_str);

        let output = Command::new(cmd.program.binary())
            .args(&cmd.args)
            .output()
            .map_err(|e| CommandError::Spawn {
                cmd: cmd_str.clone(),
                source: e,
            })?;

        finish(cmd_str, output)
    }
}

fn finish(cmd_str: String, output: std::process::Output) -> Result<String, CommandError> {
    if !output.status.success() {
        return Err(CommandError::NonZeroExit {
            cmd: cmd_str,
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Executor used when no privilege is available at all.
pub struct UnprivilegedExecutor;

impl PrivilegedExecutor for UnprivilegedExecutor {
    fn is_available(&self) -> bool {
        false
    }

    fn execute(&self, _cmd: &PrivilegedCommand) -> Result<String, CommandError> {
        Err(CommandError::PrivilegeUnavailable)
    }
}

/// Executor that records commands instead of running them.
///
/// Backs `--dry-run` and lets tests assert on the exact command stream.
/// Commands can be made to fail, and per-program stdout can be scripted.
pub struct RecordingExecutor {
    available: bool,
    log: Mutex<Vec<PrivilegedCommand>>,
    failing: Mutex<Vec<PrivilegedCommand>>,
    outputs: Mutex<HashMap<Program, String>>,
}

impl RecordingExecutor {
    /// Create a recorder that reports the given availability.
    pub fn new(available: bool) -> Self {
        Self {
            available,
            log: Mutex::new(Vec::new()),
            failing: Mutex::new(Vec::new()),
            outputs: Mutex::new(HashMap::new()),
        }
    }

    /// Make every future execution of `cmd` fail.
    pub fn fail_on(&self, cmd: PrivilegedCommand) {
        lock(&self.failing).push(cmd);
    }

    /// Return `stdout` from every successful command of `program`.
    pub fn set_output(&self, program: Program, stdout: impl Into<String>) {
        lock(&self.outputs).insert(program, stdout.into());
    }

    /// All commands executed so far, in order.
    pub fn commands(&self) -> Vec<PrivilegedCommand> {
        lock(&self.log).clone()
    }

    /// Commands executed so far for one program.
    pub fn commands_for(&self, program: Program) -> Vec<PrivilegedCommand> {
        lock(&self.log)
            .iter()
            .filter(|c| c.program == program)
            .cloned()
            .collect()
    }

    /// Forget the recorded history.
    pub fn clear(&self) {
        lock(&self.log).clear();
    }
}

impl PrivilegedExecutor for RecordingExecutor {
    fn is_available(&self) -> bool {
        self.available
    }

    fn execute(&self, cmd: &PrivilegedCommand) -> Result<String, CommandError> {
        let rendered = cmd.render()?;
        lock(&self.log).push(cmd.clone());
        debug!("[dry-run] {}", rendered);

        if lock(&self.failing).contains(cmd) {
            return Err(CommandError::NonZeroExit {
                cmd: rendered,
                code: Some(1),
                stderr: "scripted failure".to_string(),
            });
        }
        Ok(lock(&self.outputs)
            .get(&cmd.program)
            .cloned()
            .unwrap_or_default())
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unprivileged_executor_always_fails() {
        let exec = UnprivilegedExecutor;
        assert!(!exec.is_available());
        let cmd = PrivilegedCommand::iptables(["-L"]);
        assert!(matches!(
            exec.execute(&cmd),
            Err(CommandError::PrivilegeUnavailable)
        ));
        assert!(!exec.run(&cmd));
    }

    #[test]
    fn test_recording_executor_records_in_order() {
        let exec = RecordingExecutor::new(true);
        exec.run(&PrivilegedCommand::ip(["link", "show"]));
        exec.run(&PrivilegedCommand::iptables(["-N", "appfence"]));

        let cmds = exec.commands();
        assert_eq!(cmds.len(), 2);
        assert_eq!(cmds[0].program, Program::Ip);
        assert_eq!(exec.commands_for(Program::Iptables).len(), 1);
    }

    #[test]
    fn test_recording_executor_scripted_failure() {
        let exec = RecordingExecutor::new(true);
        let bad = PrivilegedCommand::iptables(["-N", "appfence"]);
        exec.fail_on(bad.clone());

        assert!(!exec.run(&bad));
        assert!(exec.run(&PrivilegedCommand::iptables(["-F", "appfence"])));
    }

    #[test]
    fn test_recording_executor_scripted_output() {
        let exec = RecordingExecutor::new(true);
        exec.set_output(Program::Settings, ":0\n");
        let out = exec
            .execute(&PrivilegedCommand::new(
                Program::Settings,
                ["get", "global", "http_proxy"],
            ))
            .unwrap();
        assert_eq!(out, ":0\n");
    }

    #[test]
    fn test_unsafe_command_is_not_recorded() {
        let exec = RecordingExecutor::new(true);
        let result = exec.execute(&PrivilegedCommand::ip(["link;reboot"]));
        assert!(result.is_err());
        assert!(exec.commands().is_empty());
    }

    #[test]
    fn test_su_executor_with_missing_binary_is_unavailable() {
        let exec = SuExecutor::new("/nonexistent/appfence-su");
        assert!(!exec.is_available());
    }
}
