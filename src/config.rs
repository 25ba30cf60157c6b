use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::Result;

const APP_DIR: &str = "tetherlink";

/// Root config directory: ~/.config/tetherlink/
#[must_use]
pub fn config_dir() -> PathBuf {
    xdg_config_home().join(APP_DIR)
}

/// Active session state file: ~/.config/tetherlink/active.json
#[must_use]
pub fn state_path() -> PathBuf {
    config_dir().join("active.json")
}

/// Rendered proxy daemon config: ~/.config/tetherlink/redsocks.conf
#[must_use]
pub fn proxy_config_path() -> PathBuf {
    config_dir().join("redsocks.conf")
}

fn xdg_config_home() -> PathBuf {
    if let Some(config) = std::env::var_os("XDG_CONFIG_HOME") {
        PathBuf::from(config)
    } else if let Some(home) = std::env::var_os("HOME") {
        PathBuf::from(home).join(".config")
    } else {
        PathBuf::from("/tmp")
    }
}

pub fn ensure_config_dir() -> Result<()> {
    let dir = config_dir();
    if !dir.exists() {
        fs::create_dir_all(&dir)?;
        fs::set_permissions(&dir, fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

/// User settings loaded from ~/.config/tetherlink/config.toml.
///
/// Every field has a default so a missing or partial file works.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub general: GeneralConfig,
    pub proxy: ProxyConfig,
    pub connection: ConnectionConfig,
    pub evasion: EvasionConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Default evasion level for wifi/iphone modes when --evasion-level is absent.
    pub evasion_level: u8,
    pub auto_reconnect: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            evasion_level: 2,
            auto_reconnect: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Upstream HTTP proxy host. Defaults to the uplink gateway when unset.
    pub upstream_host: Option<String>,
    pub upstream_port: u16,
    /// Local port redsocks binds for NAT-redirected traffic.
    pub local_port: u16,
    /// CIDR ranges never redirected, evaluated in order.
    pub excluded_ranges: Vec<String>,
    pub bind_timeout_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            upstream_host: None,
            upstream_port: 8000,
            local_port: 12460,
            excluded_ranges: crate::proxy::DEFAULT_EXCLUDED_RANGES
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
            bind_timeout_secs: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub locate_attempts: u32,
    pub locate_delay_secs: u64,
    pub probe_timeout_secs: u64,
    pub poll_interval_secs: u64,
    pub health_interval_secs: u64,
    pub backoff_base_secs: u64,
    pub backoff_cap_secs: u64,
    pub backoff_max_attempts: u32,
    /// Per-call timeout for privileged rule commands before a hard kill.
    pub rule_timeout_secs: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            locate_attempts: 3,
            locate_delay_secs: 1,
            probe_timeout_secs: 5,
            poll_interval_secs: 1,
            health_interval_secs: 30,
            backoff_base_secs: 5,
            backoff_cap_secs: 60,
            backoff_max_attempts: 3,
            rule_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EvasionConfig {
    /// Outbound TTL / hop limit written by the mangle rules.
    pub ttl: u32,
    /// Apply the optional level-3 traffic shaping layer.
    pub shaping: bool,
    pub shaping_rate_mbit: u32,
}

impl Default for EvasionConfig {
    fn default() -> Self {
        Self {
            ttl: crate::evasion::DEFAULT_TTL,
            shaping: false,
            shaping_rate_mbit: 40,
        }
    }
}

impl ConnectionConfig {
    #[must_use]
    pub fn locate_delay(&self) -> Duration {
        Duration::from_secs(self.locate_delay_secs)
    }

    #[must_use]
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    #[must_use]
    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }

    #[must_use]
    pub fn rule_timeout(&self) -> Duration {
        Duration::from_secs(self.rule_timeout_secs)
    }
}

/// Load config.toml, falling back to defaults on absence or parse failure.
#[must_use]
pub fn load_config() -> AppConfig {
    let path = config_dir().join("config.toml");
    let Ok(raw) = fs::read_to_string(&path) else {
        return AppConfig::default();
    };
    match toml::from_str(&raw) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!("ignoring malformed {}: {}", path.display(), e);
            AppConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_complete() {
        let config = AppConfig::default();
        assert_eq!(config.general.evasion_level, 2);
        assert!(config.general.auto_reconnect);
        assert_eq!(config.proxy.upstream_port, 8000);
        assert_eq!(config.proxy.local_port, 12460);
        assert!(!config.proxy.excluded_ranges.is_empty());
        assert_eq!(config.connection.backoff_base_secs, 5);
        assert_eq!(config.connection.rule_timeout_secs, 5);
        assert_eq!(config.evasion.ttl, 65);
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [proxy]
            upstream_port = 8888

            [evasion]
            ttl = 64
            "#,
        )
        .unwrap();
        assert_eq!(config.proxy.upstream_port, 8888);
        assert_eq!(config.proxy.local_port, 12460);
        assert_eq!(config.evasion.ttl, 64);
        assert_eq!(config.general.evasion_level, 2);
    }

    #[test]
    fn empty_toml_parses() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.connection.locate_attempts, 3);
    }
}
