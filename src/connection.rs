//! Connection manager: the session state machine and supervisor loop.
//!
//! The manager exclusively owns the connection state; every other component
//! receives it read-only. Transitions are linearized behind the session
//! mutex and callbacks fire synchronously after each transition completes.
//! Listeners must not block or re-enter the state machine.

use std::collections::VecDeque;
use std::net::{Ipv4Addr, TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::backoff::BackoffPolicy;
use crate::config::{self, AppConfig};
use crate::error::{AppError, Result};
use crate::evasion::{EffectivenessReport, EvasionEngine};
use crate::interface::{find_ready, InterfaceKind, InterfaceSource, NetInterface, SysfsInterfaceSource};
use crate::proxy::{ProxyBinding, ProxyController, RedsocksControl};
use crate::rules::{run, RuleExecutor, SystemExecutor};
use crate::state::ActiveState;

const FAILURE_HISTORY_LIMIT: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Error,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::Error => "error",
        };
        f.write_str(name)
    }
}

/// The allowed-transition graph. No other edge is ever taken.
#[must_use]
pub fn can_transition(from: ConnectionState, to: ConnectionState) -> bool {
    use ConnectionState::*;
    matches!(
        (from, to),
        (Disconnected, Connecting)
            | (Connecting, Connected)
            | (Connecting, Error)
            | (Connecting, Disconnecting)
            | (Connected, Disconnecting)
            | (Connected, Error)
            | (Connected, Disconnected)
            | (Disconnecting, Disconnected)
            | (Disconnecting, Error)
            | (Error, Disconnected)
            | (Error, Connecting)
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCategory {
    InterfaceLost,
    ProxyUnreachable,
    RuleApplyFailed,
    HealthCheckFailed,
}

impl std::fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FailureCategory::InterfaceLost => "interface-lost",
            FailureCategory::ProxyUnreachable => "proxy-unreachable",
            FailureCategory::RuleApplyFailed => "rule-apply-failed",
            FailureCategory::HealthCheckFailed => "health-check-failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct FailureEvent {
    pub at: SystemTime,
    pub category: FailureCategory,
    pub detail: String,
}

/// Active connection record, created on entering Connecting and destroyed on
/// reaching Disconnected.
#[derive(Debug, Clone)]
pub struct Session {
    pub interface: String,
    pub kind: InterfaceKind,
    pub gateway: Option<Ipv4Addr>,
    pub proxy_host: String,
    pub proxy_port: u16,
    pub evasion_level: u8,
    pub started_at: SystemTime,
    pub failures: u32,
}

#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub mode: InterfaceKind,
    pub ssid: Option<String>,
    pub password: Option<String>,
    pub evasion_level: u8,
    pub proxy: Option<(String, u16)>,
}

/// Upstream reachability probes. Blocking with bounded timeouts; the
/// manager runs them on the blocking pool.
pub trait ProxyProbe: Send + Sync {
    /// Can we reach the upstream proxy port at all?
    fn probe_proxy(&self, host: &str, port: u16, timeout: Duration) -> Result<()>;

    /// Can we reach a stable external endpoint through the proxy?
    fn probe_external(&self, proxy_host: &str, proxy_port: u16, timeout: Duration) -> Result<()>;
}

/// Real probe: TCP connect for the proxy port, then a proxied GET of a
/// generate-204 endpoint for end-to-end reachability.
pub struct HttpProbe {
    check_url: String,
}

impl Default for HttpProbe {
    fn default() -> Self {
        Self {
            check_url: "http://connectivitycheck.gstatic.com/generate_204".to_string(),
        }
    }
}

impl ProxyProbe for HttpProbe {
    fn probe_proxy(&self, host: &str, port: u16, timeout: Duration) -> Result<()> {
        let target = format!("{}:{}", host, port);
        let addr = target
            .to_socket_addrs()
            .map_err(|e| AppError::ProxyUnreachable(format!("{}: {}", target, e)))?
            .next()
            .ok_or_else(|| AppError::ProxyUnreachable(format!("{}: no address", target)))?;
        TcpStream::connect_timeout(&addr, timeout)
            .map_err(|e| AppError::ProxyUnreachable(format!("{}: {}", target, e)))?;
        Ok(())
    }

    fn probe_external(&self, proxy_host: &str, proxy_port: u16, timeout: Duration) -> Result<()> {
        let proxy_url = format!("http://{}:{}", proxy_host, proxy_port);
        let proxy = reqwest::Proxy::http(&proxy_url)
            .map_err(|e| AppError::HealthCheckFailed(format!("bad proxy url: {}", e)))?;
        let client = reqwest::blocking::Client::builder()
            .proxy(proxy)
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::HealthCheckFailed(e.to_string()))?;
        let response = client
            .get(&self.check_url)
            .send()
            .map_err(|e| AppError::HealthCheckFailed(e.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(AppError::HealthCheckFailed(format!(
                "probe returned {}",
                response.status()
            )))
        }
    }
}

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub locate_attempts: u32,
    pub locate_delay: Duration,
    pub probe_timeout: Duration,
    pub poll_interval: Duration,
    pub health_interval: Duration,
    pub auto_reconnect: bool,
    pub backoff: BackoffPolicy,
    pub upstream_port: u16,
    pub local_port: u16,
    pub excluded_ranges: Vec<String>,
    /// Write the active.json state file for cross-process status/disconnect.
    pub persist_state: bool,
}

impl ManagerSettings {
    #[must_use]
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            locate_attempts: config.connection.locate_attempts,
            locate_delay: config.connection.locate_delay(),
            probe_timeout: config.connection.probe_timeout(),
            poll_interval: config.connection.poll_interval(),
            health_interval: config.connection.health_interval(),
            auto_reconnect: config.general.auto_reconnect,
            backoff: BackoffPolicy {
                base: Duration::from_secs(config.connection.backoff_base_secs),
                multiplier: 2,
                cap: Duration::from_secs(config.connection.backoff_cap_secs),
                max_attempts: config.connection.backoff_max_attempts,
            },
            upstream_port: config.proxy.upstream_port,
            local_port: config.proxy.local_port,
            excluded_ranges: config.proxy.excluded_ranges.clone(),
            persist_state: true,
        }
    }
}

type StateCallback = Box<dyn Fn(ConnectionState) + Send + Sync>;
type FailureCallback = Box<dyn Fn(&FailureEvent) + Send + Sync>;
type EvasionCallback = Box<dyn Fn(&EffectivenessReport) + Send + Sync>;

#[derive(Default)]
struct CallbackSet {
    state: Vec<StateCallback>,
    failure: Vec<FailureCallback>,
    evasion: Vec<EvasionCallback>,
}

struct Machine {
    state: ConnectionState,
    session: Option<Session>,
    history: VecDeque<FailureEvent>,
}

struct ManagerInner {
    settings: ManagerSettings,
    executor: Arc<dyn RuleExecutor>,
    interfaces: Arc<dyn InterfaceSource>,
    probe: Arc<dyn ProxyProbe>,
    evasion: Arc<EvasionEngine>,
    // Rule mutation is serialized behind this mutex; concurrent partial
    // application of layered rules is the primary orphaned-rule source.
    proxy: Mutex<ProxyController>,
    machine: Mutex<Machine>,
    callbacks: Mutex<CallbackSet>,
    ops: tokio::sync::Mutex<()>,
    cancel: Mutex<Option<watch::Sender<bool>>>,
    supervisor: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    #[must_use]
    pub fn new(
        executor: Arc<dyn RuleExecutor>,
        interfaces: Arc<dyn InterfaceSource>,
        probe: Arc<dyn ProxyProbe>,
        evasion: Arc<EvasionEngine>,
        proxy: ProxyController,
        settings: ManagerSettings,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                settings,
                executor,
                interfaces,
                probe,
                evasion,
                proxy: Mutex::new(proxy),
                machine: Mutex::new(Machine {
                    state: ConnectionState::Disconnected,
                    session: None,
                    history: VecDeque::new(),
                }),
                callbacks: Mutex::new(CallbackSet::default()),
                ops: tokio::sync::Mutex::new(()),
                cancel: Mutex::new(None),
                supervisor: Mutex::new(None),
            }),
        }
    }

    /// Wire the real system implementations from loaded config.
    #[must_use]
    pub fn system(config: &AppConfig) -> Self {
        let executor: Arc<dyn RuleExecutor> =
            Arc::new(SystemExecutor::with_timeout(config.connection.rule_timeout()));
        let interfaces = Arc::new(SysfsInterfaceSource::new(executor.clone()));
        let probe = Arc::new(HttpProbe::default());
        let evasion = Arc::new(EvasionEngine::new(executor.clone(), config.evasion.clone()));
        let proxy = ProxyController::new(
            executor.clone(),
            Arc::new(RedsocksControl::new()),
            config::proxy_config_path(),
            Duration::from_secs(config.proxy.bind_timeout_secs),
        );
        Self::new(
            executor,
            interfaces,
            probe,
            evasion,
            proxy,
            ManagerSettings::from_config(config),
        )
    }

    #[must_use]
    pub fn current_state(&self) -> ConnectionState {
        self.inner.machine.lock().unwrap().state
    }

    #[must_use]
    pub fn active_session(&self) -> Option<Session> {
        self.inner.machine.lock().unwrap().session.clone()
    }

    #[must_use]
    pub fn last_failure(&self) -> Option<FailureEvent> {
        self.inner.machine.lock().unwrap().history.back().cloned()
    }

    #[must_use]
    pub fn evasion_layers(&self) -> Vec<String> {
        self.inner.evasion.status()
    }

    pub fn register_state_callback<F>(&self, callback: F)
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        self.inner.callbacks.lock().unwrap().state.push(Box::new(callback));
    }

    pub fn register_failure_callback<F>(&self, callback: F)
    where
        F: Fn(&FailureEvent) + Send + Sync + 'static,
    {
        self.inner.callbacks.lock().unwrap().failure.push(Box::new(callback));
    }

    pub fn register_evasion_callback<F>(&self, callback: F)
    where
        F: Fn(&EffectivenessReport) + Send + Sync + 'static,
    {
        self.inner.callbacks.lock().unwrap().evasion.push(Box::new(callback));
    }

    /// Establish a session: locate the uplink, validate the upstream proxy,
    /// apply evasion for wifi/iphone modes, start transparent redirection,
    /// then hand off to the supervisor loop.
    pub async fn connect(&self, opts: ConnectOptions) -> Result<()> {
        let inner = self.inner.clone();
        let _ops = inner.ops.lock().await;

        {
            // A live supervisor means a session is active or mid-recovery;
            // a finished one is just reaped here.
            let mut supervisor = inner.supervisor.lock().unwrap();
            match supervisor.as_ref() {
                Some(handle) if !handle.is_finished() => {
                    return Err(AppError::AlreadyConnected);
                }
                Some(_) => {
                    supervisor.take();
                }
                None => {}
            }
        }
        {
            let machine = inner.machine.lock().unwrap();
            match machine.state {
                ConnectionState::Disconnected | ConnectionState::Error => {}
                _ => return Err(AppError::AlreadyConnected),
            }
        }
        inner.try_transition(ConnectionState::Connecting);

        match inner.establish(&opts).await {
            Ok(()) => {
                inner.try_transition(ConnectionState::Connected);
                let (tx, rx) = watch::channel(false);
                *inner.cancel.lock().unwrap() = Some(tx);
                let handle = tokio::spawn(supervise(inner.clone(), rx));
                *inner.supervisor.lock().unwrap() = Some(handle);
                Ok(())
            }
            Err(e) => {
                inner.record_failure(failure_category(&e), e.to_string());
                inner.cleanup();
                inner.try_transition(ConnectionState::Error);
                Err(e)
            }
        }
    }

    /// Tear the session down. Safe from any state, cancels the supervisor
    /// and any in-flight probe, and always ends Disconnected; sub-step
    /// failures are recorded but never raised.
    pub async fn disconnect(&self) -> Result<()> {
        let inner = self.inner.clone();

        // Cancel before locking so a supervisor stuck in backoff or a probe
        // never delays an explicit disconnect.
        if let Some(tx) = inner.cancel.lock().unwrap().take() {
            let _ = tx.send(true);
        }
        let handle = inner.supervisor.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        let _ops = inner.ops.lock().await;
        let state = inner.machine.lock().unwrap().state;
        match state {
            ConnectionState::Disconnected | ConnectionState::Disconnecting => Ok(()),
            ConnectionState::Error => {
                inner.cleanup();
                inner.try_transition(ConnectionState::Disconnected);
                Ok(())
            }
            _ => {
                inner.try_transition(ConnectionState::Disconnecting);
                inner.cleanup();
                inner.try_transition(ConnectionState::Disconnected);
                Ok(())
            }
        }
    }

    /// Run the passive evasion checks for the active session and notify
    /// evasion callbacks. Diagnostics only.
    #[must_use]
    pub fn verify_evasion(&self) -> Option<EffectivenessReport> {
        let session = self.inner.machine.lock().unwrap().session.clone()?;
        let report = self.inner.evasion.verify(&session.interface, session.gateway);
        let callbacks = self.inner.callbacks.lock().unwrap();
        for cb in &callbacks.evasion {
            cb(&report);
        }
        Some(report)
    }
}

impl ManagerInner {
    fn try_transition(&self, to: ConnectionState) -> bool {
        let from = {
            let mut machine = self.machine.lock().unwrap();
            let from = machine.state;
            if !can_transition(from, to) {
                warn!("refusing invalid transition {} -> {}", from, to);
                return false;
            }
            machine.state = to;
            from
        };
        info!("state {} -> {}", from, to);
        let callbacks = self.callbacks.lock().unwrap();
        for cb in &callbacks.state {
            cb(to);
        }
        true
    }

    fn record_failure(&self, category: FailureCategory, detail: String) -> FailureEvent {
        let event = FailureEvent {
            at: SystemTime::now(),
            category,
            detail,
        };
        {
            let mut machine = self.machine.lock().unwrap();
            if machine.history.len() >= FAILURE_HISTORY_LIMIT {
                machine.history.pop_front();
            }
            machine.history.push_back(event.clone());
            if let Some(session) = machine.session.as_mut() {
                session.failures += 1;
            }
        }
        warn!("{}: {}", event.category, event.detail);
        let callbacks = self.callbacks.lock().unwrap();
        for cb in &callbacks.failure {
            cb(&event);
        }
        event
    }

    async fn establish(&self, opts: &ConnectOptions) -> Result<()> {
        let iface = self.locate_interface(opts).await?;

        let (host, port) = match &opts.proxy {
            Some((host, port)) => (host.clone(), *port),
            None => {
                let gw = iface.gateway.ok_or_else(|| {
                    AppError::ProxyUnreachable(format!(
                        "interface {} has no gateway to use as upstream proxy",
                        iface.name
                    ))
                })?;
                (gw.to_string(), self.settings.upstream_port)
            }
        };

        let probe = self.probe.clone();
        let probe_host = host.clone();
        let timeout = self.settings.probe_timeout;
        tokio::task::spawn_blocking(move || probe.probe_proxy(&probe_host, port, timeout))
            .await
            .map_err(|e| AppError::Other(format!("probe task failed: {}", e)))??;

        if iface.kind != InterfaceKind::Usb && opts.evasion_level > 0 {
            if let Err(e) = self.evasion.enable(opts.evasion_level, &iface.name, iface.gateway) {
                // No partial state: anything the engine applied is rolled
                // back by its own failure path; this covers the rest.
                let _ = self.evasion.disable();
                return Err(e);
            }
        }

        let binding = ProxyBinding {
            local_port: self.settings.local_port,
            upstream_host: host.clone(),
            upstream_port: port,
            excluded: self.settings.excluded_ranges.clone(),
        };
        {
            let mut proxy = self.proxy.lock().unwrap();
            if !proxy.is_running() {
                if let Err(e) = proxy.start(binding, &iface.name) {
                    drop(proxy);
                    let _ = self.evasion.disable();
                    return Err(e);
                }
            }
        }

        let session = Session {
            interface: iface.name.clone(),
            kind: iface.kind,
            gateway: iface.gateway,
            proxy_host: host,
            proxy_port: port,
            evasion_level: opts.evasion_level,
            started_at: SystemTime::now(),
            failures: 0,
        };
        self.persist_session(&session);
        self.machine.lock().unwrap().session = Some(session);
        Ok(())
    }

    async fn locate_interface(&self, opts: &ConnectOptions) -> Result<NetInterface> {
        for attempt in 0..self.settings.locate_attempts.max(1) {
            if attempt > 0 {
                tokio::time::sleep(self.settings.locate_delay).await;
            }
            let list = self.interfaces.list().unwrap_or_default();
            if let Some(found) = find_ready(&list, opts.mode) {
                return Ok(found.clone());
            }
            if attempt == 0 && opts.mode == InterfaceKind::Wifi {
                if let Some(ssid) = &opts.ssid {
                    self.join_wifi(ssid, opts.password.as_deref());
                }
            }
        }
        Err(AppError::InterfaceNotFound(opts.mode.to_string()))
    }

    fn join_wifi(&self, ssid: &str, password: Option<&str>) {
        let mut args = vec!["nmcli", "dev", "wifi", "connect", ssid];
        if let Some(pw) = password {
            args.push("password");
            args.push(pw);
        }
        if let Err(e) = run(self.executor.as_ref(), &args) {
            debug!("wifi join attempt failed: {}", e);
        }
    }

    fn persist_session(&self, session: &Session) {
        if !self.settings.persist_state {
            return;
        }
        let state = ActiveState {
            interface: session.interface.clone(),
            kind: session.kind,
            evasion_level: session.evasion_level,
            upstream_host: session.proxy_host.clone(),
            upstream_port: session.proxy_port,
            local_port: self.settings.local_port,
            daemon_pid: self.proxy.lock().unwrap().daemon_pid(),
            started_at_unix: session
                .started_at
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            applied_rules: self.evasion.status(),
        };
        if let Err(e) = state.save() {
            warn!("failed to persist session state: {}", e);
        }
    }

    /// Best-effort teardown: proxy first, then evasion, then the state
    /// file. Failures become events, never errors.
    fn cleanup(&self) {
        let stop_result = self.proxy.lock().unwrap().stop();
        if let Err(e) = stop_result {
            self.record_failure(FailureCategory::RuleApplyFailed, e.to_string());
        }
        if let Err(e) = self.evasion.disable() {
            self.record_failure(FailureCategory::RuleApplyFailed, e.to_string());
        }
        if self.settings.persist_state {
            if let Err(e) = ActiveState::remove() {
                warn!("failed to remove session state: {}", e);
            }
        }
        self.machine.lock().unwrap().session = None;
    }

    async fn health_check(
        &self,
        session: &Session,
        run_probe: bool,
    ) -> Option<(FailureCategory, String)> {
        let present = self
            .interfaces
            .list()
            .map(|list| {
                list.iter()
                    .any(|i| i.name == session.interface && i.is_up)
            })
            .unwrap_or(false);
        if !present {
            return Some((
                FailureCategory::InterfaceLost,
                format!("interface {} disappeared", session.interface),
            ));
        }

        if run_probe {
            let probe = self.probe.clone();
            let host = session.proxy_host.clone();
            let port = session.proxy_port;
            let timeout = self.settings.probe_timeout;
            let result =
                tokio::task::spawn_blocking(move || probe.probe_external(&host, port, timeout))
                    .await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    return Some((FailureCategory::HealthCheckFailed, e.to_string()));
                }
                Err(e) => {
                    return Some((
                        FailureCategory::HealthCheckFailed,
                        format!("probe task failed: {}", e),
                    ));
                }
            }
        }
        None
    }

    /// Re-establish a lost session without disturbing consistent pieces:
    /// evasion is re-applied only with an empty ruleset log, the proxy is
    /// restarted only when its daemon is gone.
    async fn reestablish(&self, session: &Session) -> Result<()> {
        let list = self.interfaces.list().unwrap_or_default();
        let iface = find_ready(&list, session.kind)
            .cloned()
            .ok_or_else(|| AppError::InterfaceNotFound(session.kind.to_string()))?;

        let probe = self.probe.clone();
        let host = session.proxy_host.clone();
        let port = session.proxy_port;
        let timeout = self.settings.probe_timeout;
        tokio::task::spawn_blocking(move || probe.probe_proxy(&host, port, timeout))
            .await
            .map_err(|e| AppError::Other(format!("probe task failed: {}", e)))??;

        if session.kind != InterfaceKind::Usb
            && session.evasion_level > 0
            && self.evasion.status().is_empty()
        {
            self.evasion
                .enable(session.evasion_level, &iface.name, iface.gateway)?;
        }

        {
            let mut proxy = self.proxy.lock().unwrap();
            if !proxy.is_running() {
                let binding = ProxyBinding {
                    local_port: self.settings.local_port,
                    upstream_host: session.proxy_host.clone(),
                    upstream_port: session.proxy_port,
                    excluded: self.settings.excluded_ranges.clone(),
                };
                proxy.start(binding, &iface.name)?;
            }
        }

        {
            let mut machine = self.machine.lock().unwrap();
            if let Some(active) = machine.session.as_mut() {
                // Counter tracks consecutive failures only.
                active.failures = 0;
                if iface.name != session.interface {
                    active.interface = iface.name.clone();
                    active.gateway = iface.gateway;
                }
            }
        }
        Ok(())
    }

    /// Connected -> Error -> Connecting recovery with exponential backoff.
    /// Returns true when the session is Connected again; false when the
    /// attempt budget is exhausted (state stays Error) or on cancellation.
    async fn recover(&self, cancel: &mut watch::Receiver<bool>, session: &Session) -> bool {
        self.try_transition(ConnectionState::Error);

        let mut attempt = 0;
        while !self.settings.backoff.exhausted(attempt) {
            let delay = self.settings.backoff.delay_for(attempt);
            info!(
                "reconnect attempt {}/{} in {}s",
                attempt + 1,
                self.settings.backoff.max_attempts,
                delay.as_secs()
            );
            tokio::select! {
                _ = cancel.changed() => return false,
                _ = tokio::time::sleep(delay) => {}
            }

            self.try_transition(ConnectionState::Connecting);
            let result = tokio::select! {
                _ = cancel.changed() => return false,
                result = self.reestablish(session) => result,
            };
            match result {
                Ok(()) => {
                    self.try_transition(ConnectionState::Connected);
                    info!("session re-established on attempt {}", attempt + 1);
                    return true;
                }
                Err(e) => {
                    self.record_failure(failure_category(&e), e.to_string());
                    self.try_transition(ConnectionState::Error);
                }
            }
            attempt += 1;
        }

        warn!("reconnect attempts exhausted, staying in error state");
        false
    }
}

async fn supervise(inner: Arc<ManagerInner>, mut cancel: watch::Receiver<bool>) {
    let poll = inner.settings.poll_interval;
    let health_every =
        (inner.settings.health_interval.as_secs() / poll.as_secs().max(1)).max(1);
    let mut ticks: u64 = 0;

    loop {
        tokio::select! {
            _ = cancel.changed() => return,
            _ = tokio::time::sleep(poll) => {}
        }
        ticks += 1;

        if inner.machine.lock().unwrap().state != ConnectionState::Connected {
            return;
        }
        let session = inner.machine.lock().unwrap().session.clone();
        let Some(session) = session else { return };

        // An explicit disconnect must never wait out an in-flight probe.
        let failure = tokio::select! {
            _ = cancel.changed() => return,
            failure = inner.health_check(&session, ticks % health_every == 0) => failure,
        };
        let Some((category, detail)) = failure else {
            continue;
        };

        inner.record_failure(category, detail);
        if !inner.settings.auto_reconnect {
            inner.try_transition(ConnectionState::Error);
            return;
        }
        if !inner.recover(&mut cancel, &session).await {
            return;
        }
    }
}

fn failure_category(error: &AppError) -> FailureCategory {
    match error {
        AppError::InterfaceNotFound(_) | AppError::InterfaceInvalid(_) => {
            FailureCategory::InterfaceLost
        }
        AppError::ProxyUnreachable(_) => FailureCategory::ProxyUnreachable,
        AppError::RuleApplyFailed(_) | AppError::RuleRemoveFailed(_) | AppError::Daemon(_) => {
            FailureCategory::RuleApplyFailed
        }
        _ => FailureCategory::HealthCheckFailed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use crate::config::EvasionConfig;
    use crate::proxy::testing::FakeProcess;
    use crate::rules::testing::ScriptedExecutor;

    struct MockInterfaces {
        interfaces: Mutex<Vec<NetInterface>>,
        list_calls: AtomicUsize,
    }

    impl MockInterfaces {
        fn new(interfaces: Vec<NetInterface>) -> Arc<Self> {
            Arc::new(Self {
                interfaces: Mutex::new(interfaces),
                list_calls: AtomicUsize::new(0),
            })
        }

        fn set(&self, interfaces: Vec<NetInterface>) {
            *self.interfaces.lock().unwrap() = interfaces;
        }
    }

    impl InterfaceSource for MockInterfaces {
        fn list(&self) -> Result<Vec<NetInterface>> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.interfaces.lock().unwrap().clone())
        }
    }

    struct MockProbe {
        proxy_ok: AtomicBool,
        external_ok: AtomicBool,
        proxy_calls: AtomicUsize,
        external_calls: AtomicUsize,
    }

    impl MockProbe {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                proxy_ok: AtomicBool::new(true),
                external_ok: AtomicBool::new(true),
                proxy_calls: AtomicUsize::new(0),
                external_calls: AtomicUsize::new(0),
            })
        }
    }

    impl ProxyProbe for MockProbe {
        fn probe_proxy(&self, host: &str, port: u16, _timeout: Duration) -> Result<()> {
            self.proxy_calls.fetch_add(1, Ordering::SeqCst);
            if self.proxy_ok.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(AppError::ProxyUnreachable(format!("{}:{}", host, port)))
            }
        }

        fn probe_external(&self, _host: &str, _port: u16, _timeout: Duration) -> Result<()> {
            self.external_calls.fetch_add(1, Ordering::SeqCst);
            if self.external_ok.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(AppError::HealthCheckFailed("generate_204 timed out".into()))
            }
        }
    }

    struct Harness {
        executor: Arc<ScriptedExecutor>,
        process: Arc<FakeProcess>,
        interfaces: Arc<MockInterfaces>,
        probe: Arc<MockProbe>,
        manager: ConnectionManager,
        states: Arc<Mutex<Vec<ConnectionState>>>,
        _dir: tempfile::TempDir,
    }

    fn usb0() -> NetInterface {
        NetInterface {
            name: "usb0".into(),
            kind: InterfaceKind::Usb,
            gateway: Some("192.168.49.1".parse().unwrap()),
            is_up: true,
        }
    }

    fn wlan0() -> NetInterface {
        NetInterface {
            name: "wlan0".into(),
            kind: InterfaceKind::Wifi,
            gateway: Some("192.168.1.1".parse().unwrap()),
            is_up: true,
        }
    }

    fn harness(interfaces: Vec<NetInterface>) -> Harness {
        harness_with(interfaces, |_| {})
    }

    fn harness_with<F>(interfaces: Vec<NetInterface>, tweak: F) -> Harness
    where
        F: FnOnce(&mut ManagerSettings),
    {
        let log = Arc::new(Mutex::new(Vec::new()));
        let executor = Arc::new(ScriptedExecutor::with_log(log.clone()));
        let process = Arc::new(FakeProcess::new(log));
        let interfaces = MockInterfaces::new(interfaces);
        let probe = MockProbe::new();
        let dir = tempfile::tempdir().unwrap();

        let evasion = Arc::new(EvasionEngine::new(
            executor.clone() as Arc<dyn RuleExecutor>,
            EvasionConfig::default(),
        ));
        let proxy = ProxyController::new(
            executor.clone(),
            process.clone(),
            dir.path().join("redsocks.conf"),
            Duration::from_secs(3),
        );
        let mut settings = ManagerSettings {
            locate_attempts: 3,
            locate_delay: Duration::from_secs(1),
            probe_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_secs(1),
            health_interval: Duration::from_secs(30),
            auto_reconnect: true,
            backoff: BackoffPolicy::default(),
            upstream_port: 8000,
            local_port: 12460,
            excluded_ranges: crate::proxy::DEFAULT_EXCLUDED_RANGES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            persist_state: false,
        };
        tweak(&mut settings);
        let manager = ConnectionManager::new(
            executor.clone(),
            interfaces.clone(),
            probe.clone(),
            evasion,
            proxy,
            settings,
        );

        let states = Arc::new(Mutex::new(Vec::new()));
        let recorder = states.clone();
        manager.register_state_callback(move |s| recorder.lock().unwrap().push(s));

        Harness {
            executor,
            process,
            interfaces,
            probe,
            manager,
            states,
            _dir: dir,
        }
    }

    fn opts(mode: InterfaceKind, level: u8) -> ConnectOptions {
        ConnectOptions {
            mode,
            ssid: None,
            password: None,
            evasion_level: level,
            proxy: None,
        }
    }

    fn recorded_states(h: &Harness) -> Vec<ConnectionState> {
        h.states.lock().unwrap().clone()
    }

    fn connecting_count(h: &Harness) -> usize {
        h.states
            .lock()
            .unwrap()
            .iter()
            .filter(|s| **s == ConnectionState::Connecting)
            .count()
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        panic!("condition not reached within virtual time budget");
    }

    #[test]
    fn transition_graph_matches_allowed_edges() {
        use ConnectionState::*;
        assert!(can_transition(Disconnected, Connecting));
        assert!(can_transition(Connecting, Connected));
        assert!(can_transition(Connecting, Error));
        assert!(can_transition(Connected, Disconnecting));
        assert!(can_transition(Connected, Error));
        assert!(can_transition(Disconnecting, Disconnected));
        assert!(can_transition(Error, Connecting));
        assert!(can_transition(Error, Disconnected));

        assert!(!can_transition(Disconnected, Connected));
        assert!(!can_transition(Error, Connected));
        assert!(!can_transition(Disconnected, Disconnecting));
        assert!(!can_transition(Connected, Connecting));
    }

    #[tokio::test(start_paused = true)]
    async fn usb_connect_reaches_connected_with_zero_evasion_rules() {
        let h = harness(vec![usb0()]);
        h.manager.connect(opts(InterfaceKind::Usb, 0)).await.unwrap();

        assert_eq!(
            recorded_states(&h),
            vec![ConnectionState::Connecting, ConnectionState::Connected]
        );
        assert!(h.manager.evasion_layers().is_empty());
        assert_eq!(h.process.spawn_count(), 1);
        // Upstream defaulted to the usb gateway.
        let session = h.manager.active_session().unwrap();
        assert_eq!(session.proxy_host, "192.168.49.1");
        assert_eq!(session.proxy_port, 8000);
        h.manager.disconnect().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn usb_mode_skips_evasion_even_at_high_level() {
        let h = harness(vec![usb0()]);
        h.manager.connect(opts(InterfaceKind::Usb, 3)).await.unwrap();
        assert!(h.manager.evasion_layers().is_empty());
        h.manager.disconnect().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn wifi_level_two_applies_three_layers_in_order() {
        let h = harness(vec![wlan0()]);
        h.manager.connect(opts(InterfaceKind::Wifi, 2)).await.unwrap();

        assert_eq!(h.manager.current_state(), ConnectionState::Connected);
        assert_eq!(
            h.manager.evasion_layers(),
            vec!["ttl-mangle-wlan0", "ipv6-block-wlan0", "dns-redirect-wlan0"]
        );
        h.manager.disconnect().await.unwrap();
        assert!(h.manager.evasion_layers().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn second_connect_is_rejected() {
        let h = harness(vec![usb0()]);
        h.manager.connect(opts(InterfaceKind::Usb, 0)).await.unwrap();
        let err = h.manager.connect(opts(InterfaceKind::Usb, 0)).await.unwrap_err();
        assert!(matches!(err, AppError::AlreadyConnected));
        assert_eq!(err.exit_code(), 5);
        h.manager.disconnect().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn missing_interface_retries_then_errors() {
        let h = harness(vec![]);
        let err = h.manager.connect(opts(InterfaceKind::Usb, 0)).await.unwrap_err();
        assert!(matches!(err, AppError::InterfaceNotFound(_)));
        assert_eq!(h.manager.current_state(), ConnectionState::Error);
        assert_eq!(h.interfaces.list_calls.load(Ordering::SeqCst), 3);
        assert_eq!(h.process.spawn_count(), 0);

        let failure = h.manager.last_failure().unwrap();
        assert_eq!(failure.category, FailureCategory::InterfaceLost);
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_proxy_aborts_before_any_rules() {
        let h = harness(vec![wlan0()]);
        h.probe.proxy_ok.store(false, Ordering::SeqCst);

        let err = h.manager.connect(opts(InterfaceKind::Wifi, 2)).await.unwrap_err();
        assert!(matches!(err, AppError::ProxyUnreachable(_)));
        assert_eq!(h.manager.current_state(), ConnectionState::Error);
        assert!(h.manager.evasion_layers().is_empty());
        assert_eq!(h.process.spawn_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn evasion_failure_aborts_connect_and_rolls_back() {
        let h = harness(vec![wlan0()]);
        h.executor.fail_when("-t nat -N TETHERLINK_DNS");

        let err = h.manager.connect(opts(InterfaceKind::Wifi, 2)).await.unwrap_err();
        assert!(matches!(err, AppError::RuleApplyFailed(_)));
        assert_eq!(h.manager.current_state(), ConnectionState::Error);
        assert!(h.manager.evasion_layers().is_empty());
        // Proxy is started after evasion, so it never came up.
        assert_eq!(h.process.spawn_count(), 0);

        // Re-connect works once the failure is gone (error -> connecting).
        let h2 = harness(vec![wlan0()]);
        h2.executor.fail_when("-t nat -N TETHERLINK_DNS");
        let _ = h2.manager.connect(opts(InterfaceKind::Wifi, 2)).await;
        h2.manager.connect(opts(InterfaceKind::Wifi, 1)).await.unwrap();
        assert_eq!(h2.manager.current_state(), ConnectionState::Connected);
        h2.manager.disconnect().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_is_safe_from_any_state() {
        let h = harness(vec![usb0()]);
        // Never connected: a no-op.
        h.manager.disconnect().await.unwrap();
        assert_eq!(h.manager.current_state(), ConnectionState::Disconnected);

        h.manager.connect(opts(InterfaceKind::Usb, 0)).await.unwrap();
        h.manager.disconnect().await.unwrap();
        assert_eq!(h.manager.current_state(), ConnectionState::Disconnected);
        assert!(h.manager.active_session().is_none());

        // Twice in a row.
        h.manager.disconnect().await.unwrap();
        assert_eq!(h.manager.current_state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_tolerates_teardown_failures() {
        let h = harness(vec![wlan0()]);
        h.manager.connect(opts(InterfaceKind::Wifi, 1)).await.unwrap();

        h.executor.fail_when("-t mangle -D POSTROUTING");
        h.manager.disconnect().await.unwrap();
        // Still lands in Disconnected with an empty ruleset log.
        assert_eq!(h.manager.current_state(), ConnectionState::Disconnected);
        assert!(h.manager.evasion_layers().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn interface_loss_recovers_within_two_attempts() {
        let h = harness(vec![wlan0()]);
        h.manager.connect(opts(InterfaceKind::Wifi, 0)).await.unwrap();
        assert_eq!(h.process.spawn_count(), 1);

        // Drop the uplink now; restore it 7s later (after the first 5s
        // backoff attempt fails, before the second at +10s).
        h.interfaces.set(vec![]);
        let interfaces = h.interfaces.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(7)).await;
            interfaces.set(vec![wlan0()]);
        });

        wait_for(|| {
            h.manager.current_state() == ConnectionState::Connected && connecting_count(&h) >= 2
        })
        .await;

        // Initial connect plus at most 2 reconnect attempts.
        assert!(connecting_count(&h) - 1 <= 2, "too many reconnect attempts");
        // The daemon stayed alive, so no duplicate proxy start.
        assert_eq!(h.process.spawn_count(), 1);

        let failure = h.manager.last_failure().unwrap();
        assert_eq!(failure.category, FailureCategory::InterfaceLost);
        h.manager.disconnect().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_attempts_are_bounded_then_terminal_error() {
        let h = harness(vec![usb0()]);
        h.manager.connect(opts(InterfaceKind::Usb, 0)).await.unwrap();

        h.interfaces.set(vec![]);
        wait_for(|| {
            h.manager.current_state() == ConnectionState::Error && connecting_count(&h) == 4
        })
        .await;

        // Exactly max_attempts (3) reconnects after the initial connect,
        // then the supervisor settles in Error.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(connecting_count(&h), 4);
        assert_eq!(h.manager.current_state(), ConnectionState::Error);

        // Explicit disconnect still drives to Disconnected.
        h.manager.disconnect().await.unwrap();
        assert_eq!(h.manager.current_state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn health_probe_failure_triggers_recovery() {
        let h = harness(vec![usb0()]);
        h.manager.connect(opts(InterfaceKind::Usb, 0)).await.unwrap();

        h.probe.external_ok.store(false, Ordering::SeqCst);
        wait_for(|| h.manager.last_failure().is_some()).await;
        let failure = h.manager.last_failure().unwrap();
        assert_eq!(failure.category, FailureCategory::HealthCheckFailed);

        // Interface and proxy are fine, so the first backoff attempt
        // re-establishes the session.
        wait_for(|| {
            h.manager.current_state() == ConnectionState::Connected && connecting_count(&h) >= 2
        })
        .await;
        assert_eq!(h.process.spawn_count(), 1);
        h.manager.disconnect().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn auto_reconnect_disabled_goes_straight_to_error() {
        let h = harness_with(vec![usb0()], |s| s.auto_reconnect = false);
        h.manager.connect(opts(InterfaceKind::Usb, 0)).await.unwrap();

        h.interfaces.set(vec![]);
        wait_for(|| h.manager.current_state() == ConnectionState::Error).await;

        // Supervisor made no reconnect attempt: only the initial Connecting.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(connecting_count(&h), 1);
        assert_eq!(h.manager.current_state(), ConnectionState::Error);
        h.manager.disconnect().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_cancels_pending_backoff_immediately() {
        let h = harness(vec![usb0()]);
        h.manager.connect(opts(InterfaceKind::Usb, 0)).await.unwrap();

        h.interfaces.set(vec![]);
        wait_for(|| h.manager.current_state() == ConnectionState::Error).await;

        // Supervisor is sleeping out a backoff delay; disconnect must not
        // wait for it.
        h.manager.disconnect().await.unwrap();
        assert_eq!(h.manager.current_state(), ConnectionState::Disconnected);

        // No resurrection afterwards.
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(h.manager.current_state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn random_call_sequences_never_leave_the_transition_graph() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let h = harness(vec![usb0()]);
        let mut rng = StdRng::seed_from_u64(0x7e7e);

        for _ in 0..40 {
            match rng.gen_range(0..4u8) {
                0 => {
                    let _ = h.manager.connect(opts(InterfaceKind::Usb, 0)).await;
                }
                1 => {
                    let _ = h.manager.disconnect().await;
                }
                2 => h.interfaces.set(vec![]),
                _ => h.interfaces.set(vec![usb0()]),
            }
            // Let supervisor ticks interleave.
            tokio::time::sleep(Duration::from_millis(1500)).await;
        }
        let _ = h.manager.disconnect().await;

        // Every observed transition is an allowed edge from the previous
        // observed state, starting at Disconnected.
        let states = recorded_states(&h);
        let mut previous = ConnectionState::Disconnected;
        for state in states {
            assert!(
                can_transition(previous, state),
                "invalid edge {} -> {}",
                previous,
                state
            );
            previous = state;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failure_history_is_bounded() {
        let h = harness(vec![]);
        for _ in 0..40 {
            let _ = h.manager.connect(opts(InterfaceKind::Usb, 0)).await;
        }
        let history_len = {
            let inner = h.manager.inner.machine.lock().unwrap();
            inner.history.len()
        };
        assert!(history_len <= FAILURE_HISTORY_LIMIT);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_callbacks_receive_events() {
        let h = harness(vec![]);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = seen.clone();
        h.manager
            .register_failure_callback(move |e| recorder.lock().unwrap().push(e.category));

        let _ = h.manager.connect(opts(InterfaceKind::Usb, 0)).await;
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            &[FailureCategory::InterfaceLost]
        );
    }
}
