//! tapnat - host NAT setup for TAP-attached guests
//!
//! Turns on IPv4 forwarding and installs the iptables forward and masquerade
//! rules that let traffic from a TAP interface reach the network through an
//! uplink interface.

mod bootstrap;
mod cli;
mod config;
mod error;
mod status;
mod system;

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

use bootstrap::{NetworkBootstrapper, Report};
use cli::{Cli, Command};
use config::{FileConfig, NetConfig, Settings};
use error::{ErrorKind, TapnatError};
use status::{HealthStatus, StatusReport};
use system::{HostConfigurator, Privilege, RecordingConfigurator, SystemConfigurator};

const EXIT_SUCCESS: u8 = 0;
const EXIT_STEP_FAILED: u8 = 1;
const EXIT_USAGE: u8 = 2;
const EXIT_NOT_CONFIGURED: u8 = 3;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            if let Some(step) = err.downcast_ref::<TapnatError>().and_then(TapnatError::step) {
                error!(%step, "stopped; earlier steps were left in place");
            }
            eprintln!("Error: {:#}", err);
            ExitCode::from(exit_code_for(&err))
        }
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn exit_code_for(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<TapnatError>().map(TapnatError::kind) {
        Some(ErrorKind::Config) => EXIT_USAGE,
        _ => EXIT_STEP_FAILED,
    }
}

async fn run(cli: Cli) -> Result<u8> {
    let file = match &cli.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::load_default()?,
    };
    let settings = Settings::resolve(cli.overrides(), file)?;
    let command = cli.action();

    let privilege = Privilege::detect();
    let host = HostConfigurator::new(&settings.iptables);

    // status never mutates, so a dry run of it is just the real thing.
    if cli.dry_run && !matches!(command, Command::Status) {
        if !privilege.is_elevated() {
            warn!("not running as root; rules that cannot be checked are planned as absent");
        }
        let seeded = seed_from_host(&host, &settings.net).await;
        let boot = NetworkBootstrapper::new(seeded, Privilege::Elevated);
        let (code, boot) = execute(boot, &command, &settings).await?;
        println!("Dry run; would perform:");
        for mutation in boot.configurator().mutations() {
            println!("  {}", mutation);
        }
        return Ok(code);
    }

    if !privilege.is_elevated() {
        warn!("not running as root; host changes will be refused");
    }

    let boot = NetworkBootstrapper::new(host, privilege);
    let (code, _) = execute(boot, &command, &settings).await?;
    Ok(code)
}

/// Copy the live forwarding, interface and rule state into a recording
/// configurator, reading only.
async fn seed_from_host<C: SystemConfigurator>(host: &C, net: &NetConfig) -> RecordingConfigurator {
    RecordingConfigurator::from_status(&status::probe(host, net).await)
}

async fn execute<C: SystemConfigurator>(
    mut boot: NetworkBootstrapper<C>,
    command: &Command,
    settings: &Settings,
) -> Result<(u8, NetworkBootstrapper<C>)> {
    let net = &settings.net;

    let code = match command {
        Command::Up(args) => {
            let report = boot
                .apply(net, args.options())
                .await
                .context("failed to apply NAT configuration")?;
            print_report(&report);
            println!(
                "NAT active: {} -> {} for {}",
                net.tap_interface, net.uplink_interface, net.nat_subnet
            );
            EXIT_SUCCESS
        }
        Command::Down(args) => {
            let report = boot
                .teardown(net, args.disable_forwarding)
                .await
                .context("failed to remove NAT configuration")?;
            print_report(&report);
            EXIT_SUCCESS
        }
        Command::Status => {
            let report = boot.status(net).await;
            print_status(&report);
            if report.health() == HealthStatus::Configured {
                EXIT_SUCCESS
            } else {
                EXIT_NOT_CONFIGURED
            }
        }
    };

    Ok((code, boot))
}

fn print_report(report: &Report) {
    for (step, outcome) in &report.steps {
        println!("{}: {}", step, outcome);
    }
}

fn print_status(report: &StatusReport) {
    println!("ip_forward: {}", probe_text(report.forwarding, "on", "off"));
    for (name, exists) in &report.interfaces {
        println!("interface {}: {}", name, probe_text(*exists, "present", "missing"));
    }
    for rule in &report.rules {
        println!(
            "rule {}: {}",
            rule.rule,
            probe_text(rule.present, "present", "missing")
        );
    }
    println!("status: {}", report.health());
}

fn probe_text(probe: Option<bool>, yes: &'static str, no: &'static str) -> &'static str {
    match probe {
        Some(true) => yes,
        Some(false) => no,
        None => "unknown",
    }
}
