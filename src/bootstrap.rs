//! The bootstrap action: enable forwarding, then install the forward and NAT rules.
//!
//! Steps run strictly in order and stop at the first failure. Nothing already
//! applied is rolled back, so a failure part-way leaves the earlier steps in place.

use std::fmt;

use tracing::{debug, info, warn};

use crate::config::NetConfig;
use crate::error::{Result, SystemError, TapnatError};
use crate::status::{self, StatusReport};
use crate::system::{FirewallRule, Privilege, SystemConfigurator};

/// Upper bound on copies of one rule removed during teardown.
const MAX_DUPLICATE_REMOVALS: usize = 64;

/// One step of `apply` or `teardown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    EnableForwarding,
    AcceptToTap,
    AcceptFromTap,
    Masquerade,
    RemoveMasquerade,
    RemoveAcceptFromTap,
    RemoveAcceptToTap,
    DisableForwarding,
}

impl Step {
    pub const APPLY: [Step; 4] = [
        Step::EnableForwarding,
        Step::AcceptToTap,
        Step::AcceptFromTap,
        Step::Masquerade,
    ];

    pub const TEARDOWN: [Step; 4] = [
        Step::RemoveMasquerade,
        Step::RemoveAcceptFromTap,
        Step::RemoveAcceptToTap,
        Step::DisableForwarding,
    ];

    /// 1-based position within its sequence.
    pub fn number(&self) -> usize {
        match self {
            Step::EnableForwarding | Step::RemoveMasquerade => 1,
            Step::AcceptToTap | Step::RemoveAcceptFromTap => 2,
            Step::AcceptFromTap | Step::RemoveAcceptToTap => 3,
            Step::Masquerade | Step::DisableForwarding => 4,
        }
    }

    pub fn is_teardown(&self) -> bool {
        Step::TEARDOWN.contains(self)
    }

    pub fn touches_forwarding(&self) -> bool {
        matches!(self, Step::EnableForwarding | Step::DisableForwarding)
    }

    pub fn description(&self) -> &'static str {
        match self {
            Step::EnableForwarding => "enable IPv4 forwarding",
            Step::AcceptToTap => "accept forwarded traffic out to the TAP interface",
            Step::AcceptFromTap => "accept forwarded traffic in from the TAP interface",
            Step::Masquerade => "masquerade the NAT subnet via the uplink",
            Step::RemoveMasquerade => "remove the NAT masquerade rule",
            Step::RemoveAcceptFromTap => "remove the inbound TAP forward rule",
            Step::RemoveAcceptToTap => "remove the outbound TAP forward rule",
            Step::DisableForwarding => "disable IPv4 forwarding",
        }
    }

    /// The firewall rule this step installs or removes, if any.
    pub fn rule(&self, config: &NetConfig) -> Option<FirewallRule> {
        match self {
            Step::AcceptToTap | Step::RemoveAcceptToTap => {
                Some(FirewallRule::accept_to(&config.tap_interface))
            }
            Step::AcceptFromTap | Step::RemoveAcceptFromTap => {
                Some(FirewallRule::accept_from(&config.tap_interface))
            }
            Step::Masquerade | Step::RemoveMasquerade => Some(FirewallRule::masquerade(
                &config.nat_subnet,
                &config.uplink_interface,
            )),
            Step::EnableForwarding | Step::DisableForwarding => None,
        }
    }

    /// Interfaces the step's rule names.
    pub fn interfaces<'a>(&self, config: &'a NetConfig) -> Vec<&'a str> {
        match self {
            Step::AcceptToTap | Step::AcceptFromTap => vec![config.tap_interface.as_str()],
            Step::Masquerade => vec![config.uplink_interface.as_str()],
            _ => Vec::new(),
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = if self.is_teardown() { "teardown step" } else { "step" };
        write!(f, "{} {}/4 ({})", prefix, self.number(), self.description())
    }
}

/// What a step ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Applied,
    /// Idempotent mode found the rule already installed.
    AlreadyPresent,
    /// Teardown removed this many copies of the rule.
    Removed(usize),
    NotPresent,
    Skipped,
}

impl fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepOutcome::Applied => write!(f, "applied"),
            StepOutcome::AlreadyPresent => write!(f, "already present"),
            StepOutcome::Removed(1) => write!(f, "removed"),
            StepOutcome::Removed(n) => write!(f, "removed {} copies", n),
            StepOutcome::NotPresent => write!(f, "not present"),
            StepOutcome::Skipped => write!(f, "skipped"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Report {
    pub steps: Vec<(Step, StepOutcome)>,
}

impl Report {
    fn record(&mut self, step: Step, outcome: StepOutcome) {
        info!(%step, %outcome, "step finished");
        self.steps.push((step, outcome));
    }

    #[cfg(test)]
    pub fn outcome(&self, step: Step) -> Option<StepOutcome> {
        self.steps
            .iter()
            .find(|(s, _)| *s == step)
            .map(|(_, outcome)| *outcome)
    }
}

/// Knobs for `apply` beyond the literal four-step sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyOptions {
    /// Skip rules that already exist instead of appending duplicates.
    pub idempotent: bool,
    /// Fail a rule step when an interface it names does not exist.
    pub verify_interfaces: bool,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            idempotent: false,
            verify_interfaces: true,
        }
    }
}

/// Applies and removes the forwarding/NAT configuration through a
/// [`SystemConfigurator`].
pub struct NetworkBootstrapper<C> {
    configurator: C,
    privilege: Privilege,
}

impl<C: SystemConfigurator> NetworkBootstrapper<C> {
    pub fn new(configurator: C, privilege: Privilege) -> Self {
        Self {
            configurator,
            privilege,
        }
    }

    pub fn configurator(&self) -> &C {
        &self.configurator
    }

    /// Enable forwarding and install the three rules, in order.
    pub async fn apply(&mut self, config: &NetConfig, options: ApplyOptions) -> Result<Report> {
        config.validate()?;
        info!(
            tap = %config.tap_interface,
            uplink = %config.uplink_interface,
            subnet = %config.nat_subnet,
            idempotent = options.idempotent,
            "applying NAT configuration"
        );

        let mut report = Report::default();

        for step in Step::APPLY {
            self.require_privilege(step)?;

            let Some(rule) = step.rule(config) else {
                self.configurator
                    .set_ipv4_forwarding(true)
                    .await
                    .map_err(|source| fail(step, source))?;
                report.record(step, StepOutcome::Applied);
                continue;
            };

            if options.verify_interfaces {
                for name in step.interfaces(config) {
                    self.require_interface(step, name).await?;
                }
            }

            if options.idempotent {
                let present = self
                    .configurator
                    .rule_exists(&rule)
                    .await
                    .map_err(|source| fail(step, source))?;
                if present {
                    debug!(%rule, "rule already installed");
                    report.record(step, StepOutcome::AlreadyPresent);
                    continue;
                }
            }

            self.configurator
                .append_rule(&rule)
                .await
                .map_err(|source| fail(step, source))?;
            report.record(step, StepOutcome::Applied);
        }

        Ok(report)
    }

    /// Remove every copy of the three rules, newest step first. Forwarding is
    /// only switched off when `disable_forwarding` is set since other services
    /// may depend on it.
    pub async fn teardown(&mut self, config: &NetConfig, disable_forwarding: bool) -> Result<Report> {
        config.validate()?;
        info!(
            tap = %config.tap_interface,
            uplink = %config.uplink_interface,
            subnet = %config.nat_subnet,
            "removing NAT configuration"
        );

        let mut report = Report::default();

        for step in Step::TEARDOWN {
            self.require_privilege(step)?;

            let Some(rule) = step.rule(config) else {
                if disable_forwarding {
                    self.configurator
                        .set_ipv4_forwarding(false)
                        .await
                        .map_err(|source| fail(step, source))?;
                    report.record(step, StepOutcome::Applied);
                } else {
                    report.record(step, StepOutcome::Skipped);
                }
                continue;
            };

            let mut removed = 0;
            while self
                .configurator
                .rule_exists(&rule)
                .await
                .map_err(|source| fail(step, source))?
            {
                if removed == MAX_DUPLICATE_REMOVALS {
                    warn!(%rule, "rule still present after {} removals, giving up", removed);
                    break;
                }
                self.configurator
                    .delete_rule(&rule)
                    .await
                    .map_err(|source| fail(step, source))?;
                removed += 1;
            }

            let outcome = if removed == 0 {
                StepOutcome::NotPresent
            } else {
                StepOutcome::Removed(removed)
            };
            report.record(step, outcome);
        }

        Ok(report)
    }

    /// Read-only probe of the current host state.
    pub async fn status(&self, config: &NetConfig) -> StatusReport {
        status::probe(&self.configurator, config).await
    }

    fn require_privilege(&self, step: Step) -> Result<()> {
        if self.privilege.is_elevated() {
            return Ok(());
        }
        warn!(%step, "refusing to run without elevated privilege");
        Err(fail(step, SystemError::PermissionDenied))
    }

    async fn require_interface(&self, step: Step, name: &str) -> Result<()> {
        let exists = self
            .configurator
            .interface_exists(name)
            .await
            .map_err(|source| fail(step, source))?;
        if !exists {
            warn!(%step, interface = name, "interface does not exist");
            return Err(fail(step, SystemError::InterfaceNotFound(name.to_string())));
        }
        Ok(())
    }
}

fn fail(step: Step, source: SystemError) -> TapnatError {
    TapnatError::StepFailed { step, source }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::system::recording::Mutation;
    use crate::system::RecordingConfigurator;

    fn config() -> NetConfig {
        NetConfig::default()
    }

    fn host() -> RecordingConfigurator {
        RecordingConfigurator::new().with_interfaces(["tap0", "enp1s0", "lo"])
    }

    fn all_rules(config: &NetConfig) -> [FirewallRule; 3] {
        [
            FirewallRule::accept_to(&config.tap_interface),
            FirewallRule::accept_from(&config.tap_interface),
            FirewallRule::masquerade(&config.nat_subnet, &config.uplink_interface),
        ]
    }

    #[tokio::test]
    async fn test_apply_default_config() {
        let config = config();
        let mut boot = NetworkBootstrapper::new(host(), Privilege::Elevated);

        let report = boot.apply(&config, ApplyOptions::default()).await.unwrap();
        assert_eq!(report.steps.len(), 4);
        assert!(report
            .steps
            .iter()
            .all(|(_, outcome)| *outcome == StepOutcome::Applied));

        let host = boot.configurator();
        assert!(host.forwarding());
        for rule in all_rules(&config) {
            assert_eq!(host.count(&rule), 1, "{rule}");
        }
        let forward = host.rules().iter().filter(|r| r.chain == "FORWARD").count();
        let nat = host.rules().iter().filter(|r| r.chain == "POSTROUTING").count();
        assert_eq!((forward, nat), (2, 1));
    }

    #[tokio::test]
    async fn test_apply_runs_steps_in_order() {
        let config = config();
        let mut boot = NetworkBootstrapper::new(host(), Privilege::Elevated);
        boot.apply(&config, ApplyOptions::default()).await.unwrap();

        let [to, from, masq] = all_rules(&config);
        assert_eq!(
            boot.configurator().mutations(),
            &[
                Mutation::SetForwarding(true),
                Mutation::AppendRule(to),
                Mutation::AppendRule(from),
                Mutation::AppendRule(masq),
            ]
        );
    }

    #[tokio::test]
    async fn test_unprivileged_fails_at_forwarding_with_no_rules() {
        let config = config();
        let mut boot = NetworkBootstrapper::new(host(), Privilege::Unprivileged);

        let err = boot
            .apply(&config, ApplyOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
        assert_eq!(err.step(), Some(Step::EnableForwarding));
        assert!(err.to_string().contains("forwarding"));

        let host = boot.configurator();
        assert!(host.mutations().is_empty());
        assert!(host.rules().is_empty());
        assert!(!host.forwarding());
    }

    #[tokio::test]
    async fn test_privilege_revoked_midway_keeps_earlier_steps() {
        let config = config();
        let mut boot = NetworkBootstrapper::new(host().deny_after(2), Privilege::Elevated);

        let err = boot
            .apply(&config, ApplyOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
        assert_eq!(err.step(), Some(Step::AcceptFromTap));

        let host = boot.configurator();
        assert!(host.forwarding());
        assert_eq!(host.rules(), &[FirewallRule::accept_to("tap0")]);
    }

    #[tokio::test]
    async fn test_rejected_rule_is_rule_insertion_error() {
        let config = config();
        let masq = FirewallRule::masquerade(&config.nat_subnet, &config.uplink_interface);
        let mut boot = NetworkBootstrapper::new(host().reject(masq), Privilege::Elevated);

        let err = boot
            .apply(&config, ApplyOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RuleInsertion);
        assert_eq!(err.step(), Some(Step::Masquerade));
        assert!(err.to_string().starts_with("step 4/4"));
        assert_eq!(boot.configurator().rules().len(), 2);
    }

    #[tokio::test]
    async fn test_literal_rerun_duplicates_rules() {
        let config = config();
        let mut boot = NetworkBootstrapper::new(host(), Privilege::Elevated);
        boot.apply(&config, ApplyOptions::default()).await.unwrap();
        boot.apply(&config, ApplyOptions::default()).await.unwrap();

        for rule in all_rules(&config) {
            assert_eq!(boot.configurator().count(&rule), 2);
        }
    }

    #[tokio::test]
    async fn test_idempotent_rerun_adds_nothing() {
        let config = config();
        let options = ApplyOptions {
            idempotent: true,
            ..Default::default()
        };
        let mut boot = NetworkBootstrapper::new(host(), Privilege::Elevated);
        boot.apply(&config, options).await.unwrap();
        let report = boot.apply(&config, options).await.unwrap();

        assert_eq!(report.outcome(Step::EnableForwarding), Some(StepOutcome::Applied));
        assert_eq!(report.outcome(Step::AcceptToTap), Some(StepOutcome::AlreadyPresent));
        assert_eq!(report.outcome(Step::AcceptFromTap), Some(StepOutcome::AlreadyPresent));
        assert_eq!(report.outcome(Step::Masquerade), Some(StepOutcome::AlreadyPresent));
        for rule in all_rules(&config) {
            assert_eq!(boot.configurator().count(&rule), 1);
        }
    }

    #[tokio::test]
    async fn test_missing_interface_is_reported_by_name() {
        let config = NetConfig::new("tap0", "eth9", "192.0.2.0/24".parse().unwrap()).unwrap();
        let mut boot = NetworkBootstrapper::new(host(), Privilege::Elevated);

        let err = boot
            .apply(&config, ApplyOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InterfaceNotFound);
        assert_eq!(err.step(), Some(Step::Masquerade));
        assert!(err.to_string().contains("eth9"));
    }

    #[tokio::test]
    async fn test_missing_tap_can_be_preinstalled_without_verification() {
        let config = config();
        let options = ApplyOptions {
            verify_interfaces: false,
            ..Default::default()
        };
        let rec = RecordingConfigurator::new().with_interfaces(["enp1s0"]);
        let mut boot = NetworkBootstrapper::new(rec, Privilege::Elevated);

        boot.apply(&config, options).await.unwrap();
        assert_eq!(boot.configurator().rules().len(), 3);

        let rec = RecordingConfigurator::new().with_interfaces(["enp1s0"]);
        let mut boot = NetworkBootstrapper::new(rec, Privilege::Elevated);
        let err = boot.apply(&config, ApplyOptions::default()).await.unwrap_err();
        assert_eq!(err.step(), Some(Step::AcceptToTap));
        assert!(err.to_string().contains("tap0"));
    }

    #[tokio::test]
    async fn test_teardown_removes_duplicates_and_keeps_forwarding() {
        let config = config();
        let mut boot = NetworkBootstrapper::new(host(), Privilege::Elevated);
        boot.apply(&config, ApplyOptions::default()).await.unwrap();
        boot.apply(&config, ApplyOptions::default()).await.unwrap();

        let report = boot.teardown(&config, false).await.unwrap();
        assert_eq!(report.outcome(Step::RemoveMasquerade), Some(StepOutcome::Removed(2)));
        assert_eq!(report.outcome(Step::DisableForwarding), Some(StepOutcome::Skipped));
        assert!(boot.configurator().rules().is_empty());
        assert!(boot.configurator().forwarding());
    }

    #[tokio::test]
    async fn test_teardown_leaves_foreign_rules_alone() {
        let config = config();
        let foreign = FirewallRule::accept_from("tap1");
        let rec = host().with_rule(foreign.clone()).with_forwarding(true);
        let mut boot = NetworkBootstrapper::new(rec, Privilege::Elevated);

        let report = boot.teardown(&config, true).await.unwrap();
        assert_eq!(report.outcome(Step::RemoveAcceptToTap), Some(StepOutcome::NotPresent));
        assert_eq!(report.outcome(Step::DisableForwarding), Some(StepOutcome::Applied));
        assert_eq!(boot.configurator().rules(), &[foreign]);
        assert!(!boot.configurator().forwarding());
    }

    #[tokio::test]
    async fn test_teardown_unprivileged() {
        let mut boot = NetworkBootstrapper::new(host(), Privilege::Unprivileged);
        let err = boot.teardown(&config(), true).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
        assert_eq!(err.step(), Some(Step::RemoveMasquerade));
        assert!(err.to_string().starts_with("teardown step 1/4"));
    }

    #[test]
    fn test_step_display() {
        assert_eq!(
            Step::EnableForwarding.to_string(),
            "step 1/4 (enable IPv4 forwarding)"
        );
        assert_eq!(Step::Masquerade.number(), 4);
        assert!(Step::DisableForwarding.touches_forwarding());
    }
}
