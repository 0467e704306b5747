//! Configurator that mutates the real host.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::system::{FirewallRule, IpForwarding, Iptables, SystemConfigurator, SystemResult};

const SYS_CLASS_NET: &str = "/sys/class/net";

/// Drives `/proc/sys` and the iptables binary.
#[derive(Debug, Clone)]
pub struct HostConfigurator {
    forwarding: IpForwarding,
    iptables: Iptables,
    sys_class_net: PathBuf,
}

impl HostConfigurator {
    pub fn new(iptables_binary: impl Into<String>) -> Self {
        Self {
            forwarding: IpForwarding::new(),
            iptables: Iptables::new(iptables_binary),
            sys_class_net: PathBuf::from(SYS_CLASS_NET),
        }
    }

    /// Override the forwarding knob and interface directory.
    #[cfg(test)]
    pub fn with_paths(
        mut self,
        ip_forward: impl Into<PathBuf>,
        sys_class_net: impl Into<PathBuf>,
    ) -> Self {
        self.forwarding = IpForwarding::with_path(ip_forward);
        self.sys_class_net = sys_class_net.into();
        self
    }
}

impl Default for HostConfigurator {
    fn default() -> Self {
        Self::new("iptables")
    }
}

#[async_trait]
impl SystemConfigurator for HostConfigurator {
    async fn ipv4_forwarding(&self) -> SystemResult<bool> {
        self.forwarding.get_state().await
    }

    async fn set_ipv4_forwarding(&mut self, enabled: bool) -> SystemResult<()> {
        self.forwarding.set_state(enabled).await
    }

    async fn interface_exists(&self, name: &str) -> SystemResult<bool> {
        Ok(tokio::fs::try_exists(self.sys_class_net.join(name)).await?)
    }

    async fn rule_exists(&self, rule: &FirewallRule) -> SystemResult<bool> {
        self.iptables.exists(rule).await
    }

    async fn append_rule(&mut self, rule: &FirewallRule) -> SystemResult<()> {
        self.iptables.append(rule).await
    }

    async fn delete_rule(&mut self, rule: &FirewallRule) -> SystemResult<()> {
        self.iptables.delete(rule).await
    }
}
