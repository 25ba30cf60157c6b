//! Transparent-proxy controller.
//!
//! Renders the redsocks configuration for the upstream HTTP proxy, runs the
//! daemon as a supervised child, and installs the NAT redirection chain.
//! Teardown removes the NAT rules before the daemon dies so redirected
//! connections reset instead of hanging against a dead local port.

use std::net::TcpStream;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::{info, warn};

use crate::error::{AppError, Result};
use crate::rules::{remove, run, RemoveOutcome, RuleExecutor};

/// Ranges never redirected, evaluated in order, first match wins. Keeps
/// loopback and LAN traffic local and prevents a loop through the phone's
/// own (private-range) proxy address.
pub const DEFAULT_EXCLUDED_RANGES: &[&str] = &[
    "127.0.0.0/8",
    "10.0.0.0/8",
    "172.16.0.0/12",
    "192.168.0.0/16",
    "169.254.0.0/16",
];

const REDIR_CHAIN: &str = "TETHERLINK_REDIR";

/// Immutable once the daemon is started; changing any field requires a full
/// stop/reconfigure/restart.
#[derive(Debug, Clone)]
pub struct ProxyBinding {
    pub local_port: u16,
    pub upstream_host: String,
    pub upstream_port: u16,
    pub excluded: Vec<String>,
}

/// Render the redsocks configuration for an HTTP-CONNECT upstream.
#[must_use]
pub fn render_config(binding: &ProxyBinding) -> String {
    format!(
        "base {{\n\
         \tlog_debug = off;\n\
         \tlog_info = on;\n\
         \tlog = stderr;\n\
         \tdaemon = off;\n\
         \tredirector = iptables;\n\
         }}\n\
         \n\
         redsocks {{\n\
         \tlocal_ip = 127.0.0.1;\n\
         \tlocal_port = {local_port};\n\
         \tip = {upstream_host};\n\
         \tport = {upstream_port};\n\
         \ttype = http-connect;\n\
         }}\n",
        local_port = binding.local_port,
        upstream_host = binding.upstream_host,
        upstream_port = binding.upstream_port,
    )
}

/// Daemon process lifecycle, split from the controller so tests can observe
/// spawn/terminate ordering against the rule executor's call log.
pub trait ProcessControl: Send + Sync {
    fn spawn(&self, config_path: &Path) -> Result<u32>;
    fn wait_for_bind(&self, port: u16, timeout: Duration) -> Result<()>;
    fn terminate(&self, pid: u32);
    fn alive(&self, pid: u32) -> bool;
}

/// Real redsocks lifecycle: spawn, poll the local port, SIGTERM with a
/// bounded wait and SIGKILL fallback.
pub struct RedsocksControl {
    child: Mutex<Option<std::process::Child>>,
}

impl RedsocksControl {
    #[must_use]
    pub fn new() -> Self {
        Self {
            child: Mutex::new(None),
        }
    }
}

impl Default for RedsocksControl {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessControl for RedsocksControl {
    fn spawn(&self, config_path: &Path) -> Result<u32> {
        let child = std::process::Command::new("redsocks")
            .arg("-c")
            .arg(config_path)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()
            .map_err(|e| AppError::Daemon(format!("failed to spawn redsocks: {}", e)))?;
        let pid = child.id();
        *self.child.lock().unwrap() = Some(child);
        info!("redsocks started (pid={})", pid);
        Ok(pid)
    }

    fn wait_for_bind(&self, port: u16, timeout: Duration) -> Result<()> {
        let addr = format!("127.0.0.1:{}", port);
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            let parsed = addr.parse().expect("loopback addr");
            if TcpStream::connect_timeout(&parsed, Duration::from_millis(100)).is_ok() {
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        Err(AppError::Daemon(format!(
            "redsocks did not bind port {} within {}s",
            port,
            timeout.as_secs()
        )))
    }

    fn terminate(&self, pid: u32) {
        let target = Pid::from_raw(pid as i32);
        let _ = kill(target, Signal::SIGTERM);
        for _ in 0..20 {
            std::thread::sleep(Duration::from_millis(100));
            if !self.alive(pid) {
                break;
            }
        }
        if self.alive(pid) {
            let _ = kill(target, Signal::SIGKILL);
        }
        // Reap our own child if this pid is it.
        let mut guard = self.child.lock().unwrap();
        if let Some(child) = guard.as_mut() {
            if child.id() == pid {
                let _ = child.wait();
                *guard = None;
            }
        }
    }

    fn alive(&self, pid: u32) -> bool {
        kill(Pid::from_raw(pid as i32), None).is_ok()
    }
}

struct ActiveRedirect {
    binding: ProxyBinding,
    interface: String,
    pid: u32,
    nat_undo: Vec<Vec<String>>,
}

pub struct ProxyController {
    executor: Arc<dyn RuleExecutor>,
    process: Arc<dyn ProcessControl>,
    config_path: PathBuf,
    bind_timeout: Duration,
    active: Option<ActiveRedirect>,
}

impl ProxyController {
    #[must_use]
    pub fn new(
        executor: Arc<dyn RuleExecutor>,
        process: Arc<dyn ProcessControl>,
        config_path: PathBuf,
        bind_timeout: Duration,
    ) -> Self {
        Self {
            executor,
            process,
            config_path,
            bind_timeout,
            active: None,
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|a| self.process.alive(a.pid))
    }

    #[must_use]
    pub fn daemon_pid(&self) -> Option<u32> {
        self.active.as_ref().map(|a| a.pid)
    }

    #[must_use]
    pub fn binding(&self) -> Option<&ProxyBinding> {
        self.active.as_ref().map(|a| &a.binding)
    }

    /// Start the daemon and install NAT redirection for `interface`.
    ///
    /// A no-op when the daemon is already running with a binding (the
    /// supervisor calls this on reconnect without re-checking).
    pub fn start(&mut self, binding: ProxyBinding, interface: &str) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }

        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.config_path, render_config(&binding))?;
        std::fs::set_permissions(
            &self.config_path,
            std::fs::Permissions::from_mode(0o600),
        )?;

        let pid = match self.process.spawn(&self.config_path) {
            Ok(pid) => pid,
            Err(e) => {
                let _ = std::fs::remove_file(&self.config_path);
                return Err(e);
            }
        };

        if let Err(e) = self.process.wait_for_bind(binding.local_port, self.bind_timeout) {
            self.process.terminate(pid);
            let _ = std::fs::remove_file(&self.config_path);
            return Err(e);
        }

        let (apply, undo) = nat_rule_plan(&binding, interface);
        for cmd in &apply {
            let args: Vec<&str> = cmd.iter().map(String::as_str).collect();
            if let Err(e) = run(self.executor.as_ref(), &args) {
                remove_all(self.executor.as_ref(), &undo);
                self.process.terminate(pid);
                let _ = std::fs::remove_file(&self.config_path);
                return Err(e);
            }
        }

        info!(
            "transparent redirect active on {} -> {}:{} (local port {})",
            interface, binding.upstream_host, binding.upstream_port, binding.local_port
        );
        self.active = Some(ActiveRedirect {
            binding,
            interface: interface.to_string(),
            pid,
            nat_undo: undo,
        });
        Ok(())
    }

    /// Tear down redirection: NAT rules first, then the daemon, then the
    /// rendered config. Best-effort throughout, always leaves a clean state.
    pub fn stop(&mut self) -> Result<()> {
        let Some(active) = self.active.take() else {
            return Ok(());
        };

        remove_all(self.executor.as_ref(), &active.nat_undo);
        self.process.terminate(active.pid);
        let _ = std::fs::remove_file(&self.config_path);
        info!("transparent redirect removed from {}", active.interface);
        Ok(())
    }
}

/// Cleanup for a session recorded by a previous process: synthesize the NAT
/// undo set for the interface and kill the recorded daemon pid.
pub fn stop_stale(
    executor: &dyn RuleExecutor,
    process: &dyn ProcessControl,
    interface: &str,
    daemon_pid: Option<u32>,
    config_path: &Path,
) {
    let undo = nat_undo_for(interface);
    remove_all(executor, &undo);
    if let Some(pid) = daemon_pid {
        if process.alive(pid) {
            process.terminate(pid);
        }
    }
    let _ = std::fs::remove_file(config_path);
}

fn remove_all(executor: &dyn RuleExecutor, undo: &[Vec<String>]) {
    for cmd in undo {
        let args: Vec<&str> = cmd.iter().map(String::as_str).collect();
        match remove(executor, &args) {
            RemoveOutcome::Removed | RemoveOutcome::AlreadyAbsent => {}
            RemoveOutcome::Failed(msg) => warn!("nat rule removal failed: {}", msg),
        }
    }
}

fn cmd(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| (*s).to_string()).collect()
}

/// NAT chain plan: exclusions as ordered RETURN entries ahead of the
/// REDIRECT so the first matching range short-circuits.
fn nat_rule_plan(binding: &ProxyBinding, interface: &str) -> (Vec<Vec<String>>, Vec<Vec<String>>) {
    let port = binding.local_port.to_string();
    let mut apply = vec![cmd(&["iptables", "-t", "nat", "-N", REDIR_CHAIN])];
    for range in &binding.excluded {
        apply.push(cmd(&[
            "iptables", "-t", "nat", "-A", REDIR_CHAIN, "-d", range, "-j", "RETURN",
        ]));
    }
    apply.push(cmd(&[
        "iptables", "-t", "nat", "-A", REDIR_CHAIN, "-p", "tcp",
        "-j", "REDIRECT", "--to-ports", &port,
    ]));
    apply.push(cmd(&[
        "iptables", "-t", "nat", "-A", "OUTPUT", "-o", interface, "-p", "tcp",
        "-j", REDIR_CHAIN,
    ]));

    (apply, nat_undo_for(interface))
}

fn nat_undo_for(interface: &str) -> Vec<Vec<String>> {
    vec![
        cmd(&[
            "iptables", "-t", "nat", "-D", "OUTPUT", "-o", interface, "-p", "tcp",
            "-j", REDIR_CHAIN,
        ]),
        cmd(&["iptables", "-t", "nat", "-F", REDIR_CHAIN]),
        cmd(&["iptables", "-t", "nat", "-X", REDIR_CHAIN]),
    ]
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashSet;
    use std::path::Path;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::ProcessControl;
    use crate::error::{AppError, Result};

    /// Fake daemon lifecycle that records spawn/terminate markers into a
    /// shared call log so ordering against executor calls is observable.
    pub struct FakeProcess {
        pub log: Arc<Mutex<Vec<String>>>,
        alive: Mutex<HashSet<u32>>,
        fail_bind: bool,
    }

    impl FakeProcess {
        pub fn new(log: Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                log,
                alive: Mutex::new(HashSet::new()),
                fail_bind: false,
            }
        }

        pub fn failing_bind(log: Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                log,
                alive: Mutex::new(HashSet::new()),
                fail_bind: true,
            }
        }

        pub fn spawn_count(&self) -> usize {
            self.log
                .lock()
                .unwrap()
                .iter()
                .filter(|c| c.as_str() == "daemon-spawn")
                .count()
        }
    }

    impl ProcessControl for FakeProcess {
        fn spawn(&self, _config_path: &Path) -> Result<u32> {
            self.log.lock().unwrap().push("daemon-spawn".to_string());
            self.alive.lock().unwrap().insert(4242);
            Ok(4242)
        }

        fn wait_for_bind(&self, port: u16, _timeout: Duration) -> Result<()> {
            if self.fail_bind {
                return Err(AppError::Daemon(format!("port {} never bound", port)));
            }
            Ok(())
        }

        fn terminate(&self, pid: u32) {
            self.log.lock().unwrap().push("daemon-terminate".to_string());
            self.alive.lock().unwrap().remove(&pid);
        }

        fn alive(&self, pid: u32) -> bool {
            self.alive.lock().unwrap().contains(&pid)
        }
    }
}
