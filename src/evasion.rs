//! Carrier-evasion engine: the layered bypass ruleset.
//!
//! Each layer owns a dedicated chain (or single rule) so teardown is a
//! chain flush plus delete that needs no gateway or counter state. The
//! in-memory ruleset log is the only record of what was applied; disable
//! walks it in reverse and treats "already absent" as success so repeated
//! teardown is idempotent.

use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{info, warn};

use crate::config::EvasionConfig;
use crate::error::{AppError, Result};
use crate::rules::{remove, run, run_output, RemoveOutcome, RuleExecutor};

/// Outbound TTL matching native phone traffic (one above the common 64 so
/// the phone's own forwarding hop decrements it back).
pub const DEFAULT_TTL: u32 = 65;

/// Resolvers whose use is itself a tethering signal.
const PUBLIC_RESOLVERS: &[&str] = &["8.8.8.8", "8.8.4.4", "1.1.1.1", "1.0.0.1", "9.9.9.9"];

/// Desktop OS update hosts; update checks are absent from phone traffic.
const UPDATE_HOSTS: &[&str] = &[
    "windowsupdate.microsoft.com",
    "update.microsoft.com",
    "download.windowsupdate.com",
    "swscan.apple.com",
    "swcdn.apple.com",
    "mesu.apple.com",
];

const TTL_CHAIN: &str = "TETHERLINK_TTL";
const HL_CHAIN: &str = "TETHERLINK_HL";
const DNS_NAT_CHAIN: &str = "TETHERLINK_DNS";
const DNS_FILTER_CHAIN: &str = "TETHERLINK_DNSF";
const UPDATE_CHAIN: &str = "TETHERLINK_UPD";

/// One applied layer: its stable identifier plus the exact undo sequence.
#[derive(Debug, Clone)]
struct AppliedRule {
    id: String,
    undo: Vec<Vec<String>>,
}

struct LayerPlan {
    id: String,
    apply: Vec<Vec<String>>,
    undo: Vec<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct EvasionCheck {
    pub name: String,
    pub passed: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Default)]
pub struct EffectivenessReport {
    pub checks: Vec<EvasionCheck>,
}

impl EffectivenessReport {
    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }
}

pub struct EvasionEngine {
    executor: Arc<dyn RuleExecutor>,
    settings: EvasionConfig,
    log: Mutex<Vec<AppliedRule>>,
}

impl EvasionEngine {
    #[must_use]
    pub fn new(executor: Arc<dyn RuleExecutor>, settings: EvasionConfig) -> Self {
        Self {
            executor,
            settings,
            log: Mutex::new(Vec::new()),
        }
    }

    /// Apply every layer whose threshold is at or below `level`, in fixed
    /// order. Any failure rolls back everything applied so far through the
    /// disable path and returns the first error; no partial state survives.
    pub fn enable(
        &self,
        level: u8,
        interface: &str,
        gateway: Option<Ipv4Addr>,
    ) -> Result<Vec<String>> {
        if level == 0 {
            return Ok(Vec::new());
        }

        run(self.executor.as_ref(), &["ip", "link", "show", "dev", interface])
            .map_err(|_| AppError::InterfaceInvalid(interface.to_string()))?;

        if level >= 2 && gateway.is_none() {
            return Err(AppError::RuleApplyFailed(
                "dns redirection requires the uplink gateway address".to_string(),
            ));
        }

        let plans = layer_plans(
            level,
            interface,
            gateway.unwrap_or(Ipv4Addr::UNSPECIFIED),
            &self.settings,
        );

        let mut log = self.log.lock().unwrap();
        if !log.is_empty() {
            return Err(AppError::RuleApplyFailed(
                "evasion rules already applied".to_string(),
            ));
        }

        for plan in plans {
            let mut failed = None;
            for cmd in &plan.apply {
                let args: Vec<&str> = cmd.iter().map(String::as_str).collect();
                if let Err(e) = run(self.executor.as_ref(), &args) {
                    failed = Some(e);
                    break;
                }
            }

            match failed {
                None => {
                    info!("evasion layer applied: {}", plan.id);
                    log.push(AppliedRule {
                        id: plan.id,
                        undo: plan.undo,
                    });
                }
                Some(e) => {
                    // A half-applied layer still gets its (tolerant) undo
                    // entry so the rollback below covers it.
                    warn!("evasion layer {} failed, rolling back: {}", plan.id, e);
                    log.push(AppliedRule {
                        id: plan.id,
                        undo: plan.undo,
                    });
                    Self::teardown(self.executor.as_ref(), &mut log);
                    return Err(e);
                }
            }
        }

        Ok(log.iter().map(|r| r.id.clone()).collect())
    }

    /// Remove every logged rule in reverse order. Idempotent: succeeds with
    /// nothing applied, tolerates rules that are already gone, and logs (but
    /// never raises) removal failures. The log is cleared once every entry
    /// has been attempted.
    pub fn disable(&self) -> Result<()> {
        let mut log = self.log.lock().unwrap();
        Self::teardown(self.executor.as_ref(), &mut log);
        Ok(())
    }

    /// Cross-process cleanup: synthesize the full undo set for `level` from
    /// the layer table and attempt it all. Used when no in-memory log exists
    /// (a fresh `disconnect` invocation).
    pub fn disable_stale(&self, level: u8, interface: &str) -> Result<()> {
        if level == 0 {
            return Ok(());
        }
        // Shaping teardown is attempted regardless of current config; it is
        // tolerant when no qdisc is installed.
        let mut settings = self.settings.clone();
        settings.shaping = true;

        let plans = layer_plans(level, interface, Ipv4Addr::UNSPECIFIED, &settings);
        let mut entries: Vec<AppliedRule> = plans
            .into_iter()
            .map(|p| AppliedRule {
                id: p.id,
                undo: p.undo,
            })
            .collect();
        Self::teardown(self.executor.as_ref(), &mut entries);
        Ok(())
    }

    /// Identifiers of currently applied layers, oldest first.
    #[must_use]
    pub fn status(&self) -> Vec<String> {
        self.log.lock().unwrap().iter().map(|r| r.id.clone()).collect()
    }

    fn teardown(executor: &dyn RuleExecutor, log: &mut Vec<AppliedRule>) {
        for entry in log.iter().rev() {
            for cmd in &entry.undo {
                let args: Vec<&str> = cmd.iter().map(String::as_str).collect();
                match remove(executor, &args) {
                    RemoveOutcome::Removed | RemoveOutcome::AlreadyAbsent => {}
                    RemoveOutcome::Failed(msg) => {
                        // Possibly-orphaned rule; surfaced for the operator,
                        // a later disable will retry it.
                        warn!("rule removal failed ({}): {}", entry.id, msg);
                    }
                }
            }
            info!("evasion layer removed: {}", entry.id);
        }
        log.clear();
    }

    /// Passive effectiveness checks. Never blocks connection establishment;
    /// results are surfaced to callers for diagnostics only.
    pub fn verify(&self, interface: &str, gateway: Option<Ipv4Addr>) -> EffectivenessReport {
        let mut report = EffectivenessReport::default();

        let (passed, detail) = match run_output(
            self.executor.as_ref(),
            &["iptables", "-t", "mangle", "-L", TTL_CHAIN, "-v", "-x"],
        ) {
            Ok(output) => {
                let pkts = parse_chain_packet_count(&output);
                (pkts > 0, format!("{} packets rewritten on {}", pkts, interface))
            }
            Err(e) => (false, format!("counter query failed: {}", e)),
        };
        report.checks.push(EvasionCheck {
            name: "ttl-rewrite".to_string(),
            passed,
            detail,
        });

        let leak = ipv6_reachable(Duration::from_secs(2));
        report.checks.push(EvasionCheck {
            name: "ipv6-leak".to_string(),
            passed: !leak,
            detail: if leak {
                "external IPv6 endpoint is reachable".to_string()
            } else {
                "external IPv6 probe failed as expected".to_string()
            },
        });

        let (passed, detail) = match gateway {
            Some(gw) => match std::fs::read_to_string("/etc/resolv.conf") {
                Ok(text) => {
                    if resolver_matches_gateway(&text, gw) {
                        (true, format!("resolver is gateway {}", gw))
                    } else {
                        (false, "active resolver is not the gateway".to_string())
                    }
                }
                Err(e) => (false, format!("resolv.conf unreadable: {}", e)),
            },
            None => (false, "no gateway known".to_string()),
        };
        report.checks.push(EvasionCheck {
            name: "dns-gateway".to_string(),
            passed,
            detail,
        });

        report
    }
}

fn ipv6_reachable(timeout: Duration) -> bool {
    let addr: SocketAddr = "[2001:4860:4860::8888]:443".parse().expect("static addr");
    TcpStream::connect_timeout(&addr, timeout).is_ok()
}

/// First data line of `iptables -L <chain> -v -x` carries the packet count.
#[must_use]
pub fn parse_chain_packet_count(output: &str) -> u64 {
    output
        .lines()
        .filter_map(|line| {
            let first = line.split_whitespace().next()?;
            first.parse::<u64>().ok()
        })
        .sum()
}

#[must_use]
pub fn resolver_matches_gateway(resolv_conf: &str, gateway: Ipv4Addr) -> bool {
    resolv_conf
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let rest = line.strip_prefix("nameserver")?;
            rest.trim().parse::<Ipv4Addr>().ok()
        })
        .next()
        .is_some_and(|first| first == gateway)
}

fn cmd(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| (*s).to_string()).collect()
}

fn layer_plans(
    level: u8,
    interface: &str,
    gateway: Ipv4Addr,
    settings: &EvasionConfig,
) -> Vec<LayerPlan> {
    let mut plans = Vec::new();
    let ttl = settings.ttl.to_string();
    let gw_dnat = format!("{}:53", gateway);

    // TTL / hop-limit normalization.
    if level >= 1 {
        plans.push(LayerPlan {
            id: format!("ttl-mangle-{}", interface),
            apply: vec![
                cmd(&["iptables", "-t", "mangle", "-N", TTL_CHAIN]),
                cmd(&["iptables", "-t", "mangle", "-A", TTL_CHAIN, "-j", "TTL", "--ttl-set", &ttl]),
                cmd(&["iptables", "-t", "mangle", "-A", "POSTROUTING", "-o", interface, "-j", TTL_CHAIN]),
                cmd(&["ip6tables", "-t", "mangle", "-N", HL_CHAIN]),
                cmd(&["ip6tables", "-t", "mangle", "-A", HL_CHAIN, "-j", "HL", "--hl-set", &ttl]),
                cmd(&["ip6tables", "-t", "mangle", "-A", "POSTROUTING", "-o", interface, "-j", HL_CHAIN]),
            ],
            undo: vec![
                cmd(&["ip6tables", "-t", "mangle", "-D", "POSTROUTING", "-o", interface, "-j", HL_CHAIN]),
                cmd(&["ip6tables", "-t", "mangle", "-F", HL_CHAIN]),
                cmd(&["ip6tables", "-t", "mangle", "-X", HL_CHAIN]),
                cmd(&["iptables", "-t", "mangle", "-D", "POSTROUTING", "-o", interface, "-j", TTL_CHAIN]),
                cmd(&["iptables", "-t", "mangle", "-F", TTL_CHAIN]),
                cmd(&["iptables", "-t", "mangle", "-X", TTL_CHAIN]),
            ],
        });
    }

    // IPv6 suppression.
    if level >= 2 {
        let sysctl_off = format!("net.ipv6.conf.{}.disable_ipv6=1", interface);
        let sysctl_on = format!("net.ipv6.conf.{}.disable_ipv6=0", interface);
        plans.push(LayerPlan {
            id: format!("ipv6-block-{}", interface),
            apply: vec![
                cmd(&["sysctl", "-w", &sysctl_off]),
                cmd(&["ip6tables", "-A", "OUTPUT", "-o", interface, "-j", "DROP"]),
            ],
            undo: vec![
                cmd(&["ip6tables", "-D", "OUTPUT", "-o", interface, "-j", "DROP"]),
                cmd(&["sysctl", "-w", &sysctl_on]),
            ],
        });
    }

    // DNS redirection to the phone gateway plus public resolver blocking.
    if level >= 2 {
        let mut apply = vec![
            cmd(&["iptables", "-t", "nat", "-N", DNS_NAT_CHAIN]),
            cmd(&["iptables", "-t", "nat", "-A", DNS_NAT_CHAIN, "-p", "udp", "--dport", "53", "-j", "DNAT", "--to-destination", &gw_dnat]),
            cmd(&["iptables", "-t", "nat", "-A", DNS_NAT_CHAIN, "-p", "tcp", "--dport", "53", "-j", "DNAT", "--to-destination", &gw_dnat]),
            cmd(&["iptables", "-t", "nat", "-A", "OUTPUT", "-o", interface, "-j", DNS_NAT_CHAIN]),
            cmd(&["iptables", "-N", DNS_FILTER_CHAIN]),
        ];
        for resolver in PUBLIC_RESOLVERS {
            apply.push(cmd(&["iptables", "-A", DNS_FILTER_CHAIN, "-d", resolver, "-j", "REJECT"]));
        }
        apply.push(cmd(&["iptables", "-A", "OUTPUT", "-o", interface, "-j", DNS_FILTER_CHAIN]));

        plans.push(LayerPlan {
            id: format!("dns-redirect-{}", interface),
            apply,
            undo: vec![
                cmd(&["iptables", "-D", "OUTPUT", "-o", interface, "-j", DNS_FILTER_CHAIN]),
                cmd(&["iptables", "-F", DNS_FILTER_CHAIN]),
                cmd(&["iptables", "-X", DNS_FILTER_CHAIN]),
                cmd(&["iptables", "-t", "nat", "-D", "OUTPUT", "-o", interface, "-j", DNS_NAT_CHAIN]),
                cmd(&["iptables", "-t", "nat", "-F", DNS_NAT_CHAIN]),
                cmd(&["iptables", "-t", "nat", "-X", DNS_NAT_CHAIN]),
            ],
        });
    }

    // Desktop OS update blocking. Host-based only: payload string matching
    // on encrypted ports is ineffective and intentionally not used.
    if level >= 3 {
        let mut apply = vec![cmd(&["iptables", "-N", UPDATE_CHAIN])];
        for host in UPDATE_HOSTS {
            apply.push(cmd(&["iptables", "-A", UPDATE_CHAIN, "-d", host, "-p", "tcp", "-j", "REJECT"]));
        }
        apply.push(cmd(&["iptables", "-A", "OUTPUT", "-o", interface, "-j", UPDATE_CHAIN]));

        plans.push(LayerPlan {
            id: format!("update-block-{}", interface),
            apply,
            undo: vec![
                cmd(&["iptables", "-D", "OUTPUT", "-o", interface, "-j", UPDATE_CHAIN]),
                cmd(&["iptables", "-F", UPDATE_CHAIN]),
                cmd(&["iptables", "-X", UPDATE_CHAIN]),
            ],
        });
    }

    // MSS clamping to path MTU.
    if level >= 3 {
        let clamp = [
            "iptables", "-t", "mangle", "-A", "POSTROUTING", "-o", interface,
            "-p", "tcp", "--tcp-flags", "SYN,RST", "SYN",
            "-j", "TCPMSS", "--clamp-mss-to-pmtu",
        ];
        let mut unclamp: Vec<String> = cmd(&clamp);
        unclamp[3] = "-D".to_string();
        plans.push(LayerPlan {
            id: format!("mss-clamp-{}", interface),
            apply: vec![cmd(&clamp)],
            undo: vec![unclamp],
        });
    }

    // Optional bandwidth shaping toward typical phone throughput.
    if level >= 3 && settings.shaping {
        let rate = format!("{}mbit", settings.shaping_rate_mbit);
        plans.push(LayerPlan {
            id: format!("shape-{}", interface),
            apply: vec![cmd(&[
                "tc", "qdisc", "add", "dev", interface, "root", "tbf",
                "rate", &rate, "burst", "256kbit", "latency", "50ms",
            ])],
            undo: vec![cmd(&["tc", "qdisc", "del", "dev", interface, "root"])],
        });
    }

    plans
}
