//! Thin wrapper around privileged packet-filter and routing commands.
//!
//! Everything that mutates kernel state (iptables, ip6tables, ip, tc,
//! sysctl) goes through the [`RuleExecutor`] trait so policy layers can be
//! tested against a scripted implementation. No policy lives here.

use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::{AppError, Result};

/// Captured result of one privileged command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    #[must_use]
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Whether a failed removal means the rule was already gone.
    ///
    /// iptables, tc and sysctl each phrase this differently; all are treated
    /// as success for idempotent teardown.
    #[must_use]
    pub fn indicates_absent(&self) -> bool {
        let stderr = self.stderr.to_ascii_lowercase();
        stderr.contains("no chain/target/match by that name")
            || stderr.contains("does a matching rule exist")
            || stderr.contains("no such file or directory")
            || stderr.contains("cannot delete qdisc with handle of zero")
            || stderr.contains("cannot find device")
    }
}

/// Outcome of a tolerant removal attempt.
#[derive(Debug)]
pub enum RemoveOutcome {
    Removed,
    AlreadyAbsent,
    Failed(String),
}

pub trait RuleExecutor: Send + Sync {
    /// Run one privileged command to completion and capture its output.
    fn execute(&self, args: &[&str]) -> Result<CommandOutput>;
}

/// Real executor: runs commands through sudo with a bounded timeout and a
/// hard kill when the timeout elapses.
pub struct SystemExecutor {
    timeout: Duration,
}

impl SystemExecutor {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

    #[must_use]
    pub fn new() -> Self {
        Self {
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for SystemExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleExecutor for SystemExecutor {
    fn execute(&self, args: &[&str]) -> Result<CommandOutput> {
        debug!(cmd = args.join(" "), "exec");
        let mut child = Command::new("sudo")
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| AppError::Other(format!("failed to run sudo {}: {}", args[0], e)))?;

        let deadline = Instant::now() + self.timeout;
        loop {
            match child.try_wait() {
                Ok(Some(_)) => break,
                Ok(None) => {
                    if Instant::now() >= deadline {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(AppError::Other(format!(
                            "command {} timed out after {}s",
                            args[0],
                            self.timeout.as_secs()
                        )));
                    }
                    std::thread::sleep(Duration::from_millis(25));
                }
                Err(e) => {
                    return Err(AppError::Other(format!(
                        "failed to wait on {}: {}",
                        args[0], e
                    )));
                }
            }
        }

        let output = child
            .wait_with_output()
            .map_err(|e| AppError::Other(format!("failed to collect {} output: {}", args[0], e)))?;
        Ok(CommandOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

/// Run a command, mapping any non-zero exit to `RuleApplyFailed`.
pub fn run(executor: &dyn RuleExecutor, args: &[&str]) -> Result<()> {
    let output = executor.execute(args)?;
    if !output.success() {
        return Err(AppError::RuleApplyFailed(format_failure(args, &output)));
    }
    Ok(())
}

/// Run a query command, returning captured stdout on success.
pub fn run_output(executor: &dyn RuleExecutor, args: &[&str]) -> Result<String> {
    let output = executor.execute(args)?;
    if !output.success() {
        return Err(AppError::RuleApplyFailed(format_failure(args, &output)));
    }
    Ok(output.stdout)
}

/// Attempt a removal, treating "already absent" responses as success.
pub fn remove(executor: &dyn RuleExecutor, args: &[&str]) -> RemoveOutcome {
    let output = match executor.execute(args) {
        Ok(output) => output,
        Err(e) => return RemoveOutcome::Failed(e.to_string()),
    };
    if output.success() {
        RemoveOutcome::Removed
    } else if output.indicates_absent() {
        RemoveOutcome::AlreadyAbsent
    } else {
        RemoveOutcome::Failed(format_failure(args, &output))
    }
}

fn format_failure(args: &[&str], output: &CommandOutput) -> String {
    let stderr = output.stderr.trim();
    if stderr.is_empty() {
        format!("{} exited {}", args.join(" "), output.status)
    } else {
        format!("{} exited {}: {}", args.join(" "), output.status, stderr)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::{Arc, Mutex};

    use super::{CommandOutput, RuleExecutor};
    use crate::error::Result;

    /// Scripted executor for tests: records every call in order and fails or
    /// reports "already absent" for commands matching configured substrings.
    pub struct ScriptedExecutor {
        pub calls: Arc<Mutex<Vec<String>>>,
        fail_contains: Mutex<Vec<String>>,
        absent_contains: Mutex<Vec<String>>,
    }

    impl ScriptedExecutor {
        pub fn new() -> Self {
            Self::with_log(Arc::new(Mutex::new(Vec::new())))
        }

        /// Share a call log with other mocks so cross-component ordering is
        /// observable from a single sequence.
        pub fn with_log(log: Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                calls: log,
                fail_contains: Mutex::new(Vec::new()),
                absent_contains: Mutex::new(Vec::new()),
            }
        }

        pub fn fail_when(&self, needle: &str) {
            self.fail_contains.lock().unwrap().push(needle.to_string());
        }

        pub fn absent_when(&self, needle: &str) {
            self.absent_contains
                .lock()
                .unwrap()
                .push(needle.to_string());
        }

        pub fn recorded(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl RuleExecutor for ScriptedExecutor {
        fn execute(&self, args: &[&str]) -> Result<CommandOutput> {
            let cmd = args.join(" ");
            self.calls.lock().unwrap().push(cmd.clone());

            let fail = self
                .fail_contains
                .lock()
                .unwrap()
                .iter()
                .any(|needle| cmd.contains(needle.as_str()));
            if fail {
                return Ok(CommandOutput {
                    status: 2,
                    stdout: String::new(),
                    stderr: format!("simulated failure: {}", cmd),
                });
            }

            let absent = self
                .absent_contains
                .lock()
                .unwrap()
                .iter()
                .any(|needle| cmd.contains(needle.as_str()));
            if absent {
                return Ok(CommandOutput {
                    status: 1,
                    stdout: String::new(),
                    stderr: "iptables: No chain/target/match by that name.".to_string(),
                });
            }

            Ok(CommandOutput {
                status: 0,
                stdout: String::new(),
                stderr: String::new(),
            })
        }
    }
}
