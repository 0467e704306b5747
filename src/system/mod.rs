//! Host interaction: the IPv4 forwarding knob, iptables rules, and interface lookup.

pub mod host;
pub mod iptables;
pub mod recording;
pub mod sysctl;

use std::fmt;

use async_trait::async_trait;
use ipnet::Ipv4Net;

use crate::error::SystemError;

pub use host::HostConfigurator;
pub use iptables::Iptables;
pub use recording::RecordingConfigurator;
pub use sysctl::IpForwarding;

pub type SystemResult<T> = std::result::Result<T, SystemError>;

/// Capability through which every host mutation flows.
///
/// The bootstrapper never touches the host directly, so a recording double can
/// stand in for the kernel and firewall.
#[async_trait]
pub trait SystemConfigurator: Send + Sync {
    /// Current IPv4 forwarding state.
    async fn ipv4_forwarding(&self) -> SystemResult<bool>;

    async fn set_ipv4_forwarding(&mut self, enabled: bool) -> SystemResult<()>;

    async fn interface_exists(&self, name: &str) -> SystemResult<bool>;

    async fn rule_exists(&self, rule: &FirewallRule) -> SystemResult<bool>;

    /// Append a rule to the end of its chain. Does not check for duplicates.
    async fn append_rule(&mut self, rule: &FirewallRule) -> SystemResult<()>;

    /// Delete one copy of a rule.
    async fn delete_rule(&mut self, rule: &FirewallRule) -> SystemResult<()>;
}

/// Whether the caller may mutate kernel and firewall state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    Elevated,
    Unprivileged,
}

impl Privilege {
    /// Detect from the effective uid.
    ///
    /// Only uid 0 counts as elevated. A non-root process holding
    /// `CAP_NET_ADMIN` is still treated as unprivileged and refused before
    /// iptables is invoked.
    pub fn detect() -> Self {
        if unsafe { libc::geteuid() } == 0 {
            Privilege::Elevated
        } else {
            Privilege::Unprivileged
        }
    }

    pub fn is_elevated(self) -> bool {
        self == Privilege::Elevated
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Filter,
    Nat,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Filter => "filter",
            Table::Nat => "nat",
        }
    }
}

/// A single iptables rule: table, chain, and match/target arguments.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FirewallRule {
    pub table: Table,
    pub chain: &'static str,
    pub args: Vec<String>,
}

impl FirewallRule {
    /// Accept forwarded packets leaving through `tap`.
    pub fn accept_to(tap: &str) -> Self {
        Self {
            table: Table::Filter,
            chain: "FORWARD",
            args: vec!["-o".into(), tap.into(), "-j".into(), "ACCEPT".into()],
        }
    }

    /// Accept forwarded packets arriving on `tap`.
    pub fn accept_from(tap: &str) -> Self {
        Self {
            table: Table::Filter,
            chain: "FORWARD",
            args: vec!["-i".into(), tap.into(), "-j".into(), "ACCEPT".into()],
        }
    }

    /// Masquerade `subnet` as it egresses through `uplink`.
    pub fn masquerade(subnet: &Ipv4Net, uplink: &str) -> Self {
        Self {
            table: Table::Nat,
            chain: "POSTROUTING",
            args: vec![
                "-s".into(),
                subnet.to_string(),
                "-o".into(),
                uplink.into(),
                "-j".into(),
                "MASQUERADE".into(),
            ],
        }
    }

    /// Full argument list for an iptables invocation with the given action
    /// flag (`-A`, `-C`, `-D`).
    pub fn command_args(&self, action: &str) -> Vec<String> {
        let mut args = vec![
            "-t".to_string(),
            self.table.as_str().to_string(),
            action.to_string(),
            self.chain.to_string(),
        ];
        args.extend(self.args.iter().cloned());
        args
    }
}

impl fmt::Display for FirewallRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "-t {} {} {}",
            self.table.as_str(),
            self.chain,
            self.args.join(" ")
        )
    }
}
