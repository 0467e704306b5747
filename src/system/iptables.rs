//! iptables invocation and error classification.

use std::io;
use std::process::Output;

use tokio::process::Command;
use tracing::debug;

use crate::error::SystemError;
use crate::system::{FirewallRule, SystemResult};

/// iptables exits with 1 when `-C` finds no matching rule.
const CHECK_NOT_FOUND_EXIT: i32 = 1;

/// Runs the iptables binary.
#[derive(Debug, Clone)]
pub struct Iptables {
    binary: String,
}

impl Iptables {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Append a rule to its chain.
    pub async fn append(&self, rule: &FirewallRule) -> SystemResult<()> {
        self.run_checked(rule, "-A").await
    }

    /// Delete the first matching rule.
    pub async fn delete(&self, rule: &FirewallRule) -> SystemResult<()> {
        self.run_checked(rule, "-D").await
    }

    /// Check whether a matching rule is present.
    pub async fn exists(&self, rule: &FirewallRule) -> SystemResult<bool> {
        let args = rule.command_args("-C");
        let output = self.run(&args).await?;

        if output.status.success() {
            return Ok(true);
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_permission_error(&stderr) {
            return Err(SystemError::PermissionDenied);
        }
        // Exit 1 also covers a missing chain, target or match module; only
        // the "Bad rule" message means the chain was searched and came up empty.
        if output.status.code() == Some(CHECK_NOT_FOUND_EXIT) && is_no_match(&stderr) {
            return Ok(false);
        }

        Err(classify_failure(self.describe(&args), &stderr))
    }

    async fn run_checked(&self, rule: &FirewallRule, action: &str) -> SystemResult<()> {
        let args = rule.command_args(action);
        let output = self.run(&args).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_failure(self.describe(&args), &stderr));
        }

        Ok(())
    }

    async fn run(&self, args: &[String]) -> SystemResult<Output> {
        debug!(command = %self.describe(args), "running iptables");

        // -w waits for the xtables lock instead of failing when another
        // process holds it.
        Command::new(&self.binary)
            .arg("-w")
            .args(args)
            .output()
            .await
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => SystemError::UnsupportedPlatform(format!(
                    "{} not found; is iptables installed?",
                    self.binary
                )),
                io::ErrorKind::PermissionDenied => SystemError::PermissionDenied,
                _ => SystemError::CommandFailed {
                    command: self.describe(args),
                    message: e.to_string(),
                },
            })
    }

    fn describe(&self, args: &[String]) -> String {
        format!("{} {}", self.binary, args.join(" "))
    }
}

fn is_permission_error(stderr: &str) -> bool {
    stderr.contains("Permission denied")
        || stderr.contains("must be root")
        || stderr.contains("Operation not permitted")
}

/// `-C` searched the chain and found no matching rule.
fn is_no_match(stderr: &str) -> bool {
    stderr.contains("Bad rule") || stderr.contains("does a matching rule exist")
}

/// Map a failed iptables invocation onto a [`SystemError`].
pub fn classify_failure(command: String, stderr: &str) -> SystemError {
    if is_permission_error(stderr) {
        return SystemError::PermissionDenied;
    }

    if stderr.contains("No such device") || stderr.contains("Cannot find device") {
        return SystemError::InterfaceNotFound(interface_from_command(&command, stderr));
    }

    SystemError::RuleRejected {
        command,
        message: stderr.trim().to_string(),
    }
}

/// Best effort: pick the interface argument (`-i`/`-o`) out of the command.
fn interface_from_command(command: &str, stderr: &str) -> String {
    let parts: Vec<&str> = command.split_whitespace().collect();
    for window in parts.windows(2) {
        if (window[0] == "-i" || window[0] == "-o") && stderr.contains(window[1]) {
            return window[1].to_string();
        }
    }
    parts
        .windows(2)
        .find(|w| w[0] == "-i" || w[0] == "-o")
        .map(|w| w[1].to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_permission_errors() {
        let legacy = "iptables v1.8.7 (legacy): can't initialize iptables table `filter': \
                      Permission denied (you must be root)";
        assert!(matches!(
            classify_failure("iptables -A FORWARD".into(), legacy),
            SystemError::PermissionDenied
        ));

        let nft = "iptables v1.8.9 (nf_tables): Could not fetch rule set generation id: \
                   Permission denied (you must be root)";
        assert!(matches!(
            classify_failure("iptables -A FORWARD".into(), nft),
            SystemError::PermissionDenied
        ));
    }

    #[test]
    fn test_classify_missing_device() {
        let err = classify_failure(
            "iptables -t nat -A POSTROUTING -s 192.0.2.0/24 -o eth9 -j MASQUERADE".into(),
            "Cannot find device \"eth9\"",
        );
        match err {
            SystemError::InterfaceNotFound(name) => assert_eq!(name, "eth9"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_classify_everything_else_as_rejected() {
        let err = classify_failure(
            "iptables -t nat -A POSTROUTING -j MASQUERADE".into(),
            "iptables: No chain/target/match by that name.\n",
        );
        match err {
            SystemError::RuleRejected { command, message } => {
                assert!(command.contains("POSTROUTING"));
                assert_eq!(message, "iptables: No chain/target/match by that name.");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_binary_is_unsupported_platform() {
        let ipt = Iptables::new("/nonexistent/tapnat-iptables");
        let err = ipt
            .append(&FirewallRule::accept_to("tap0"))
            .await
            .unwrap_err();
        assert!(matches!(err, SystemError::UnsupportedPlatform(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_check_exit_codes() {
        use std::os::unix::fs::PermissionsExt;

        // Stand-in iptables that reports a missing rule.
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("iptables");
        std::fs::write(
            &script,
            "#!/bin/sh\necho 'iptables: Bad rule (does a matching rule exist in that chain?).' >&2\nexit 1\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let ipt = Iptables::new(script.to_string_lossy());
        assert!(!ipt.exists(&FirewallRule::accept_to("tap0")).await.unwrap());

        let ok = dir.path().join("iptables-ok");
        std::fs::write(&ok, "#!/bin/sh\nexit 0\n").unwrap();
        std::fs::set_permissions(&ok, std::fs::Permissions::from_mode(0o755)).unwrap();

        let ipt = Iptables::new(ok.to_string_lossy());
        assert!(ipt.exists(&FirewallRule::accept_to("tap0")).await.unwrap());
        ipt.append(&FirewallRule::accept_to("tap0")).await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_check_with_missing_chain_is_an_error() {
        use std::os::unix::fs::PermissionsExt;

        // Same exit code as a missing rule, but the chain or target is gone.
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("iptables");
        std::fs::write(
            &script,
            "#!/bin/sh
echo 'iptables: No chain/target/match by that name.' >&2
exit 1
",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let ipt = Iptables::new(script.to_string_lossy());
        let err = ipt
            .exists(&FirewallRule::masquerade(
                &"192.0.2.0/24".parse().unwrap(),
                "enp1s0",
            ))
            .await
            .unwrap_err();
        match err {
            SystemError::RuleRejected { command, message } => {
                assert!(command.contains("-C POSTROUTING"));
                assert!(message.contains("No chain/target/match"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
