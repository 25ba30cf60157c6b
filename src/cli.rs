use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "tetherlink",
    about = "Route desktop traffic through a tethered phone's HTTP proxy",
    version = env!("TETHERLINK_BUILD_VERSION")
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: TopCommand,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Append logs to this file instead of stderr
    #[arg(long, global = true)]
    pub log_file: Option<String>,
}

#[derive(Subcommand)]
pub enum TopCommand {
    /// Connect through a tethered uplink and start transparent redirection
    Connect {
        /// Uplink mode: usb, wifi or iphone
        #[arg(long)]
        mode: String,

        /// Hotspot SSID to join first (wifi mode only)
        #[arg(long)]
        ssid: Option<String>,

        /// Hotspot password (wifi mode only)
        #[arg(long)]
        password: Option<String>,

        /// Carrier evasion level 0-3 (default: 0 for usb, config value otherwise)
        #[arg(long)]
        evasion_level: Option<u8>,

        /// Upstream proxy as HOST:PORT (default: uplink gateway on the config port)
        #[arg(long)]
        proxy: Option<String>,

        /// Stay in the foreground supervising the session (Ctrl-C disconnects)
        #[arg(long)]
        watch: bool,

        /// Disable automatic reconnect on interface loss or failed health checks
        #[arg(long)]
        no_auto_reconnect: bool,
    },

    /// Tear down redirection, evasion rules and the proxy daemon
    Disconnect,

    /// Show connection state and active evasion layers
    Status,

    /// Run the passive evasion effectiveness checks
    Verify,
}
