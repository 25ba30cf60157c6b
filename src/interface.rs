//! Uplink interface discovery and classification.
//!
//! USB tethers show up with rndis/cdc naming, WiFi tethers are wireless
//! interfaces in client mode, and iPhone hotspots (USB or WiFi) are
//! recognized by the fixed 172.20.10.0/28 gateway range the phone hands out.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::rules::{run_output, RuleExecutor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceKind {
    Usb,
    Wifi,
    Iphone,
}

impl InterfaceKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            InterfaceKind::Usb => "usb",
            InterfaceKind::Wifi => "wifi",
            InterfaceKind::Iphone => "iphone",
        }
    }
}

impl std::str::FromStr for InterfaceKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "usb" => Ok(InterfaceKind::Usb),
            "wifi" => Ok(InterfaceKind::Wifi),
            "iphone" => Ok(InterfaceKind::Iphone),
            other => Err(AppError::Other(format!(
                "unknown mode {:?} (expected usb, wifi or iphone)",
                other
            ))),
        }
    }
}

impl std::fmt::Display for InterfaceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct NetInterface {
    pub name: String,
    pub kind: InterfaceKind,
    pub gateway: Option<Ipv4Addr>,
    pub is_up: bool,
}

pub trait InterfaceSource: Send + Sync {
    fn list(&self) -> Result<Vec<NetInterface>>;
}

/// iPhone personal hotspots always assign out of 172.20.10.0/28.
#[must_use]
pub fn in_iphone_gateway_range(ip: Ipv4Addr) -> bool {
    let octets = ip.octets();
    octets[0] == 172 && octets[1] == 20 && octets[2] == 10 && octets[3] < 16
}

/// Classify one interface from its name, wireless capability and gateway.
///
/// Gateway range wins over the name heuristics: an iPhone hotspot joined
/// over WiFi is still `Iphone`. Returns None for interfaces that are not a
/// plausible tethering uplink (loopback, ethernet with no phone gateway).
#[must_use]
pub fn classify(name: &str, wireless: bool, gateway: Option<Ipv4Addr>) -> Option<InterfaceKind> {
    if name == "lo" {
        return None;
    }
    if let Some(gw) = gateway {
        if in_iphone_gateway_range(gw) {
            return Some(InterfaceKind::Iphone);
        }
    }
    if wireless || name.starts_with("wlan") || name.starts_with("wlp") {
        return Some(InterfaceKind::Wifi);
    }
    if name.starts_with("usb") || name.starts_with("rndis") || name.starts_with("enx") {
        return Some(InterfaceKind::Usb);
    }
    None
}

/// Parse `ip route show default` output into a dev -> gateway map.
///
/// Lines look like: `default via 192.168.1.1 dev wlan0 proto dhcp metric 600`.
#[must_use]
pub fn parse_default_routes(output: &str) -> HashMap<String, Ipv4Addr> {
    let mut routes = HashMap::new();
    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let mut via = None;
        let mut dev = None;
        let mut iter = fields.iter();
        while let Some(field) = iter.next() {
            match *field {
                "via" => via = iter.next().and_then(|v| v.parse::<Ipv4Addr>().ok()),
                "dev" => dev = iter.next().map(|d| (*d).to_string()),
                _ => {}
            }
        }
        if let (Some(gw), Some(dev)) = (via, dev) {
            routes.entry(dev).or_insert(gw);
        }
    }
    routes
}

/// Real locator reading /sys/class/net plus the routing table.
pub struct SysfsInterfaceSource {
    executor: Arc<dyn RuleExecutor>,
    sys_root: &'static str,
}

impl SysfsInterfaceSource {
    #[must_use]
    pub fn new(executor: Arc<dyn RuleExecutor>) -> Self {
        Self {
            executor,
            sys_root: "/sys/class/net",
        }
    }

    fn gateways(&self) -> HashMap<String, Ipv4Addr> {
        match run_output(self.executor.as_ref(), &["ip", "route", "show", "default"]) {
            Ok(output) => parse_default_routes(&output),
            Err(e) => {
                tracing::debug!("default route query failed: {}", e);
                HashMap::new()
            }
        }
    }
}

impl InterfaceSource for SysfsInterfaceSource {
    fn list(&self) -> Result<Vec<NetInterface>> {
        let gateways = self.gateways();
        let mut interfaces = Vec::new();

        for entry in std::fs::read_dir(self.sys_root)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            let path = entry.path();

            let wireless = path.join("wireless").exists();
            let gateway = gateways.get(&name).copied();
            let Some(kind) = classify(&name, wireless, gateway) else {
                continue;
            };

            let is_up = operstate_is_up(&path);
            interfaces.push(NetInterface {
                name,
                kind,
                gateway,
                is_up,
            });
        }

        Ok(interfaces)
    }
}

fn operstate_is_up(path: &Path) -> bool {
    match std::fs::read_to_string(path.join("operstate")) {
        // USB gadget interfaces often report "unknown" while passing traffic.
        Ok(state) => matches!(state.trim(), "up" | "unknown"),
        Err(_) => false,
    }
}

/// First up interface of the requested kind, if any.
#[must_use]
pub fn find_ready(interfaces: &[NetInterface], kind: InterfaceKind) -> Option<&NetInterface> {
    interfaces.iter().find(|i| i.kind == kind && i.is_up)
}
