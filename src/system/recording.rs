//! In-memory configurator that records intended mutations.
//!
//! Backs `--dry-run` and the bootstrapper tests. It models just enough host
//! state (forwarding flag, rule list, known interfaces) for existence checks
//! to answer consistently with earlier mutations.

use std::collections::BTreeSet;
use std::fmt;

use async_trait::async_trait;

use crate::error::SystemError;
use crate::status::StatusReport;
use crate::system::{FirewallRule, SystemConfigurator, SystemResult};

/// A host mutation that was (or would have been) performed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    SetForwarding(bool),
    AppendRule(FirewallRule),
    DeleteRule(FirewallRule),
}

impl fmt::Display for Mutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mutation::SetForwarding(enabled) => write!(
                f,
                "write {} to /proc/sys/net/ipv4/ip_forward",
                u8::from(*enabled)
            ),
            Mutation::AppendRule(rule) => write!(f, "iptables {}", join(rule, "-A")),
            Mutation::DeleteRule(rule) => write!(f, "iptables {}", join(rule, "-D")),
        }
    }
}

fn join(rule: &FirewallRule, action: &str) -> String {
    rule.command_args(action).join(" ")
}

#[derive(Debug, Clone, Default)]
pub struct RecordingConfigurator {
    forwarding: bool,
    rules: Vec<FirewallRule>,
    /// `None` means every interface exists.
    interfaces: Option<BTreeSet<String>>,
    mutations: Vec<Mutation>,
    /// Mutations allowed before every further one is denied.
    deny_after: Option<usize>,
    /// Rule appends that fail with a rejection.
    rejected: Vec<FirewallRule>,
}

impl RecordingConfigurator {
    /// Empty host where every interface exists.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mirror a probed host so a dry run plans against what is really there.
    ///
    /// Interfaces whose probe failed are assumed to exist; rules whose probe
    /// failed are assumed absent. Presence is all a probe reports, so a rule
    /// installed several times is seeded once.
    pub fn from_status(report: &StatusReport) -> Self {
        let interfaces = report
            .interfaces
            .iter()
            .filter(|(_, exists)| *exists != Some(false))
            .map(|(name, _)| name.clone());

        let mut seeded = Self::new()
            .with_interfaces(interfaces)
            .with_forwarding(report.forwarding == Some(true));
        for status in &report.rules {
            if status.present == Some(true) {
                seeded = seeded.with_rule(status.rule.clone());
            }
        }
        seeded
    }

    /// Restrict the set of existing interfaces.
    pub fn with_interfaces<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.interfaces = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_forwarding(mut self, enabled: bool) -> Self {
        self.forwarding = enabled;
        self
    }

    /// Seed a rule as already present, without recording a mutation.
    pub fn with_rule(mut self, rule: FirewallRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Simulate privilege being revoked after `n` successful mutations.
    #[cfg(test)]
    pub fn deny_after(mut self, n: usize) -> Self {
        self.deny_after = Some(n);
        self
    }

    /// Make appending `rule` fail as if iptables rejected it.
    #[cfg(test)]
    pub fn reject(mut self, rule: FirewallRule) -> Self {
        self.rejected.push(rule);
        self
    }

    #[cfg(test)]
    pub fn forwarding(&self) -> bool {
        self.forwarding
    }

    #[cfg(test)]
    pub fn rules(&self) -> &[FirewallRule] {
        &self.rules
    }

    #[cfg(test)]
    pub fn count(&self, rule: &FirewallRule) -> usize {
        self.rules.iter().filter(|r| *r == rule).count()
    }

    pub fn mutations(&self) -> &[Mutation] {
        &self.mutations
    }

    fn check_allowed(&self) -> SystemResult<()> {
        match self.deny_after {
            Some(limit) if self.mutations.len() >= limit => Err(SystemError::PermissionDenied),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl SystemConfigurator for RecordingConfigurator {
    async fn ipv4_forwarding(&self) -> SystemResult<bool> {
        Ok(self.forwarding)
    }

    async fn set_ipv4_forwarding(&mut self, enabled: bool) -> SystemResult<()> {
        self.check_allowed()?;
        self.forwarding = enabled;
        self.mutations.push(Mutation::SetForwarding(enabled));
        Ok(())
    }

    async fn interface_exists(&self, name: &str) -> SystemResult<bool> {
        Ok(self
            .interfaces
            .as_ref()
            .map_or(true, |known| known.contains(name)))
    }

    async fn rule_exists(&self, rule: &FirewallRule) -> SystemResult<bool> {
        Ok(self.rules.contains(rule))
    }

    async fn append_rule(&mut self, rule: &FirewallRule) -> SystemResult<()> {
        self.check_allowed()?;
        if self.rejected.contains(rule) {
            return Err(SystemError::RuleRejected {
                command: format!("iptables {}", join(rule, "-A")),
                message: "rejected by test configurator".into(),
            });
        }
        self.rules.push(rule.clone());
        self.mutations.push(Mutation::AppendRule(rule.clone()));
        Ok(())
    }

    async fn delete_rule(&mut self, rule: &FirewallRule) -> SystemResult<()> {
        self.check_allowed()?;
        let Some(pos) = self.rules.iter().position(|r| r == rule) else {
            return Err(SystemError::RuleRejected {
                command: format!("iptables {}", join(rule, "-D")),
                message: "Bad rule (does a matching rule exist in that chain?)".into(),
            });
        };
        self.rules.remove(pos);
        self.mutations.push(Mutation::DeleteRule(rule.clone()));
        Ok(())
    }
}
