use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::bootstrap::ApplyOptions;
use crate::config::Overrides;

/// Enable IPv4 forwarding and NAT masquerading for a TAP interface
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// TAP interface guest traffic arrives on [default: tap0]
    #[arg(long, env = "TAPNAT_TAP", global = true)]
    pub tap: Option<String>,

    /// Uplink interface traffic leaves through [default: enp1s0]
    #[arg(long, env = "TAPNAT_UPLINK", global = true)]
    pub uplink: Option<String>,

    /// Source subnet to masquerade, in CIDR notation [default: 192.0.2.0/24]
    #[arg(long, env = "TAPNAT_SUBNET", global = true)]
    pub subnet: Option<String>,

    /// JSON settings file [default: ~/.config/tapnat/config.json]
    #[arg(long, env = "TAPNAT_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// iptables binary to invoke [default: iptables]
    #[arg(long, env = "TAPNAT_IPTABLES", global = true)]
    pub iptables: Option<String>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG overrides
    #[arg(long, env = "TAPNAT_LOG", default_value = "info", global = true)]
    pub log_level: String,

    /// Print the mutations that would be made without touching the host
    #[arg(long, default_value_t = false, global = true)]
    pub dry_run: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Enable forwarding and install the forward and masquerade rules (default)
    Up(UpArgs),
    /// Remove the rules installed by `up`
    Down(DownArgs),
    /// Report whether the host is configured; exits 3 if not
    Status,
}

#[derive(Args, Debug, Clone, Default)]
pub struct UpArgs {
    /// Skip rules that are already installed instead of appending duplicates
    #[arg(long, default_value_t = false)]
    pub idempotent: bool,

    /// Install rules even if the named interfaces do not exist yet
    #[arg(long, default_value_t = false)]
    pub no_verify_interfaces: bool,
}

impl UpArgs {
    pub fn options(&self) -> ApplyOptions {
        ApplyOptions {
            idempotent: self.idempotent,
            verify_interfaces: !self.no_verify_interfaces,
        }
    }
}

#[derive(Args, Debug, Clone, Default)]
pub struct DownArgs {
    /// Also write 0 to the IPv4 forwarding knob
    #[arg(long, default_value_t = false)]
    pub disable_forwarding: bool,
}

impl Cli {
    pub fn overrides(&self) -> Overrides {
        Overrides {
            tap_interface: self.tap.clone(),
            uplink_interface: self.uplink.clone(),
            nat_subnet: self.subnet.clone(),
            iptables: self.iptables.clone(),
        }
    }

    pub fn action(&self) -> Command {
        self.command
            .clone()
            .unwrap_or_else(|| Command::Up(UpArgs::default()))
    }
}
