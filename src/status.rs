//! Read-only inspection of the forwarding/NAT setup.
//!
//! Probes never mutate anything and never abort: a probe that errors (no
//! privilege, iptables missing) is recorded as unknown and counts as absent.

use std::fmt;

use tracing::debug;

use crate::bootstrap::Step;
use crate::config::NetConfig;
use crate::system::{FirewallRule, SystemConfigurator};

/// Overall state of the host relative to the configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum HealthStatus {
    /// Forwarding on, every rule present, every interface exists.
    Configured,
    /// Some of the configuration is in place, or an interface is missing.
    Partial(String),
    /// Nothing from the configuration is present.
    #[default]
    Unconfigured,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Configured => write!(f, "configured"),
            HealthStatus::Partial(reason) => write!(f, "partially configured: {}", reason),
            HealthStatus::Unconfigured => write!(f, "not configured"),
        }
    }
}

/// Result of a single probe: `None` when the probe itself failed.
pub type Probe = Option<bool>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleStatus {
    pub step: Step,
    pub rule: FirewallRule,
    pub present: Probe,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub forwarding: Probe,
    pub interfaces: Vec<(String, Probe)>,
    pub rules: Vec<RuleStatus>,
}

impl StatusReport {
    pub fn health(&self) -> HealthStatus {
        let forwarding_on = self.forwarding == Some(true);
        let rules_present = self
            .rules
            .iter()
            .filter(|r| r.present == Some(true))
            .count();

        if !forwarding_on && rules_present == 0 {
            return HealthStatus::Unconfigured;
        }

        if !forwarding_on {
            let reason = match self.forwarding {
                None => "could not read the IPv4 forwarding state",
                _ => "IPv4 forwarding is disabled",
            };
            return HealthStatus::Partial(reason.to_string());
        }

        if let Some(missing) = self.rules.iter().find(|r| r.present != Some(true)) {
            let verb = if missing.present.is_none() {
                "could not be checked"
            } else {
                "is missing"
            };
            return HealthStatus::Partial(format!("rule {} {}", missing.rule, verb));
        }

        if let Some((name, _)) = self.interfaces.iter().find(|(_, p)| *p != Some(true)) {
            return HealthStatus::Partial(format!("interface {} does not exist", name));
        }

        HealthStatus::Configured
    }
}

/// Probe forwarding, interfaces, and rules for `config`.
pub async fn probe<C: SystemConfigurator>(configurator: &C, config: &NetConfig) -> StatusReport {
    let forwarding = log_probe("ip_forward", configurator.ipv4_forwarding().await);

    let mut interfaces = Vec::new();
    for name in [&config.tap_interface, &config.uplink_interface] {
        let exists = log_probe(name, configurator.interface_exists(name).await);
        interfaces.push((name.clone(), exists));
    }

    let mut rules = Vec::new();
    for step in Step::APPLY {
        let Some(rule) = step.rule(config) else {
            continue;
        };
        let present = log_probe(&rule.to_string(), configurator.rule_exists(&rule).await);
        rules.push(RuleStatus {
            step,
            rule,
            present,
        });
    }

    StatusReport {
        forwarding,
        interfaces,
        rules,
    }
}

fn log_probe<E: fmt::Display>(what: &str, result: Result<bool, E>) -> Probe {
    match result {
        Ok(value) => {
            debug!(what, value, "probe");
            Some(value)
        }
        Err(e) => {
            debug!(what, error = %e, "probe failed");
            None
        }
    }
}
