use std::fs;
use std::os::unix::fs::PermissionsExt;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config;
use crate::error::Result;
use crate::interface::InterfaceKind;

/// Active session record written to ~/.config/tetherlink/active.json so
/// `status` and `disconnect` work from a fresh process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveState {
    pub interface: String,
    pub kind: InterfaceKind,
    pub evasion_level: u8,
    pub upstream_host: String,
    pub upstream_port: u16,
    pub local_port: u16,
    pub daemon_pid: Option<u32>,
    pub started_at_unix: u64,
    pub applied_rules: Vec<String>,
}

impl ActiveState {
    pub fn save(&self) -> Result<()> {
        config::ensure_config_dir()?;
        let path = config::state_path();
        let json = serde_json::to_string_pretty(self)?;
        fs::write(&path, &json)?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;
        info!("session state saved to {}", path.display());
        Ok(())
    }

    pub fn load() -> Result<Option<Self>> {
        let path = config::state_path();
        if !path.exists() {
            return Ok(None);
        }
        let json = fs::read_to_string(&path)?;
        let state: Self = serde_json::from_str(&json)?;
        Ok(Some(state))
    }

    pub fn remove() -> Result<()> {
        let path = config::state_path();
        if path.exists() {
            fs::remove_file(&path)?;
            info!("session state removed");
        }
        Ok(())
    }
}
