use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::Parser;
use tracing::error;

use tetherlink::cli::{Cli, TopCommand};
use tetherlink::config::{self, AppConfig};
use tetherlink::connection::{ConnectOptions, ConnectionManager};
use tetherlink::error::{AppError, Result};
use tetherlink::evasion::EvasionEngine;
use tetherlink::interface::InterfaceKind;
use tetherlink::logging;
use tetherlink::proxy::{self, RedsocksControl};
use tetherlink::rules::{RuleExecutor, SystemExecutor};
use tetherlink::state::ActiveState;

fn main() {
    let cli = Cli::parse();
    match &cli.log_file {
        Some(path) => {
            if let Err(e) = logging::init_file(path, cli.verbose) {
                eprintln!("cannot open log file {}: {}", path, e);
                std::process::exit(1);
            }
        }
        None => logging::init_terminal(cli.verbose),
    }
    let config = config::load_config();

    let code = match cli.command {
        TopCommand::Connect {
            mode,
            ssid,
            password,
            evasion_level,
            proxy,
            watch,
            no_auto_reconnect,
        } => {
            let rt = tokio::runtime::Runtime::new().expect("failed to create tokio runtime");
            rt.block_on(cmd_connect(
                config,
                &mode,
                ssid,
                password,
                evasion_level,
                proxy,
                watch,
                no_auto_reconnect,
            ))
        }
        TopCommand::Disconnect => cmd_disconnect(&config),
        TopCommand::Status => cmd_status(),
        TopCommand::Verify => cmd_verify(&config),
    };
    std::process::exit(code);
}

#[allow(clippy::too_many_arguments)]
async fn cmd_connect(
    mut config: AppConfig,
    mode: &str,
    ssid: Option<String>,
    password: Option<String>,
    evasion_level: Option<u8>,
    proxy: Option<String>,
    watch: bool,
    no_auto_reconnect: bool,
) -> i32 {
    let mode: InterfaceKind = match mode.parse() {
        Ok(mode) => mode,
        Err(e) => {
            error!("{}", e);
            return 1;
        }
    };

    // USB tethers are not inspected for TTL anomalies the way wifi/iphone
    // uplinks are, so they default to no evasion.
    let level = evasion_level.unwrap_or(match mode {
        InterfaceKind::Usb => 0,
        _ => config.general.evasion_level,
    });
    if level > 3 {
        error!("evasion level must be 0-3, got {}", level);
        return 1;
    }

    let proxy_override = match proxy.as_deref().map(parse_proxy_arg).transpose() {
        Ok(value) => value,
        Err(e) => {
            error!("{}", e);
            return 1;
        }
    };
    // CLI wins, then a configured upstream host; otherwise the manager
    // falls back to the uplink gateway.
    let proxy_override = proxy_override.or_else(|| {
        config
            .proxy
            .upstream_host
            .clone()
            .map(|host| (host, config.proxy.upstream_port))
    });

    if no_auto_reconnect {
        config.general.auto_reconnect = false;
    }

    let manager = ConnectionManager::system(&config);
    manager.register_state_callback(|state| println!("state: {}", state));
    manager.register_failure_callback(|event| {
        eprintln!("failure [{}]: {}", event.category, event.detail)
    });
    manager.register_evasion_callback(|report| {
        for check in &report.checks {
            let verdict = if check.passed { "PASS" } else { "FAIL" };
            println!("evasion {} {}: {}", verdict, check.name, check.detail);
        }
    });

    let opts = ConnectOptions {
        mode,
        ssid,
        password,
        evasion_level: level,
        proxy: proxy_override,
    };
    match manager.connect(opts).await {
        Ok(()) => {
            let layers = manager.evasion_layers();
            if layers.is_empty() {
                println!("Connected.");
            } else {
                println!("Connected. Evasion layers: {}", layers.join(", "));
            }
            if watch {
                if !manager.evasion_layers().is_empty() {
                    let _ = manager.verify_evasion();
                }
                println!("Supervising session, Ctrl-C to disconnect...");
                let _ = tokio::signal::ctrl_c().await;
                let _ = manager.disconnect().await;
                println!("Disconnected.");
            }
            0
        }
        Err(e) => {
            error!("connect failed: {}", e);
            e.exit_code()
        }
    }
}

/// Always exits 0: teardown is best-effort and terminal-state-guaranteed.
fn cmd_disconnect(config: &AppConfig) -> i32 {
    match ActiveState::load() {
        Ok(Some(state)) => {
            let executor: Arc<dyn RuleExecutor> = Arc::new(SystemExecutor::new());
            let process = RedsocksControl::new();
            proxy::stop_stale(
                executor.as_ref(),
                &process,
                &state.interface,
                state.daemon_pid,
                &config::proxy_config_path(),
            );
            let engine = EvasionEngine::new(executor, config.evasion.clone());
            if let Err(e) = engine.disable_stale(state.evasion_level, &state.interface) {
                error!("evasion teardown: {}", e);
            }
            if let Err(e) = ActiveState::remove() {
                error!("state removal: {}", e);
            }
            println!("Disconnected.");
        }
        Ok(None) => println!("Not connected."),
        Err(e) => {
            error!("could not read session state: {}", e);
            println!("Not connected.");
        }
    }
    0
}

fn cmd_status() -> i32 {
    match ActiveState::load() {
        Ok(Some(state)) => {
            let uptime = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs().saturating_sub(state.started_at_unix))
                .unwrap_or(0);
            println!("state: connected");
            println!("interface: {} ({})", state.interface, state.kind);
            println!(
                "upstream proxy: {}:{}",
                state.upstream_host, state.upstream_port
            );
            println!("local redirect port: {}", state.local_port);
            if let Some(pid) = state.daemon_pid {
                println!("proxy daemon pid: {}", pid);
            }
            println!("evasion level: {}", state.evasion_level);
            if state.applied_rules.is_empty() {
                println!("evasion layers: none");
            } else {
                println!("evasion layers: {}", state.applied_rules.join(", "));
            }
            println!("uptime: {}s", uptime);
            0
        }
        Ok(None) => {
            println!("state: disconnected");
            0
        }
        Err(e) => {
            error!("could not read session state: {}", e);
            1
        }
    }
}

fn cmd_verify(config: &AppConfig) -> i32 {
    match ActiveState::load() {
        Ok(Some(state)) => {
            let executor: Arc<dyn RuleExecutor> = Arc::new(SystemExecutor::new());
            let engine = EvasionEngine::new(executor, config.evasion.clone());
            let gateway = state.upstream_host.parse().ok();
            let report = engine.verify(&state.interface, gateway);
            for check in &report.checks {
                let verdict = if check.passed { "PASS" } else { "FAIL" };
                println!("{} {}: {}", verdict, check.name, check.detail);
            }
            if report.all_passed() {
                0
            } else {
                1
            }
        }
        Ok(None) => {
            error!("{}", AppError::NotConnected);
            1
        }
        Err(e) => {
            error!("could not read session state: {}", e);
            1
        }
    }
}

fn parse_proxy_arg(value: &str) -> Result<(String, u16)> {
    let (host, port) = value
        .rsplit_once(':')
        .ok_or_else(|| AppError::Other(format!("invalid proxy {:?}, expected HOST:PORT", value)))?;
    let port: u16 = port
        .parse()
        .map_err(|_| AppError::Other(format!("invalid proxy port {:?}", port)))?;
    if host.is_empty() {
        return Err(AppError::Other(format!(
            "invalid proxy {:?}, expected HOST:PORT",
            value
        )));
    }
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_proxy_host_port() {
        assert_eq!(
            parse_proxy_arg("192.168.49.1:8000").unwrap(),
            ("192.168.49.1".to_string(), 8000)
        );
        assert!(parse_proxy_arg("192.168.49.1").is_err());
        assert!(parse_proxy_arg(":8000").is_err());
        assert!(parse_proxy_arg("host:notaport").is_err());
    }
}
