//! storechain command-line interface for provisioning and inspecting the
//! image-backed data volume.

use anyhow::{bail, ensure, Context, Result};
use clap::{Parser, Subcommand};
use log::warn;
use schemars::schema_for;
use serde_json::to_string_pretty;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use storechain_core::{
    config::{bootstrap_template, StorechainConfig},
    logging,
    units::render_units,
    workflow::{self, WorkflowLevel, WorkflowReport},
};
use storechain_system::SystemHost;

fn load_cli_config(path: &Path) -> Result<StorechainConfig> {
    let existed = path.exists();
    let config = StorechainConfig::load_or_bootstrap(path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))?;

    if !existed {
        println!(
            "Wrote bootstrap configuration to {}; review it before provisioning.",
            config.path.display()
        );
    }

    Ok(config)
}

/// Inspection commands never bootstrap a config file.
fn load_read_only_config(path: &Path) -> Result<StorechainConfig> {
    StorechainConfig::load_or_default(path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))
}

/// Top-level command-line options shared by every subcommand.
#[derive(Parser, Debug)]
#[command(
    name = "storechain",
    version,
    about = "Provision a qcow2-backed LVM data volume and make it persistent across reboots."
)]
struct Cli {
    /// Path to the storechain configuration file (default: $STORECHAIN_CONFIG or /etc/storechain.toml).
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the image, boot units, volumes, filesystem, fstab entry and mount.
    Provision {
        /// Skip the interactive confirmation.
        #[arg(short, long)]
        yes: bool,
    },

    /// Inspect every managed resource without changing anything.
    Status,

    /// Print the generated systemd units.
    RenderUnits,

    /// Validate a configuration file or print its JSON schema.
    Validate {
        /// Configuration file to check; defaults to the active configuration path.
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Print the configuration JSON schema instead.
        #[arg(long)]
        schema: bool,
    },

    /// Print the bootstrap configuration template.
    Template,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

/// Dispatch to the requested subcommand and map results into rich output.
fn run() -> Result<()> {
    logging::init("info");
    let cli = Cli::parse();
    let config_path = StorechainConfig::resolve_path(cli.config.as_deref());

    match cli.command {
        Commands::Provision { yes } => {
            let config = load_cli_config(&config_path)?;
            if !yes && !confirm_provisioning(&config)? {
                println!("Provisioning aborted.");
                return Ok(());
            }

            let host = SystemHost::from_config(&config);
            let report = workflow::provision(&config, &host).context("provisioning failed")?;
            print_report(report);
        }
        Commands::Status => {
            let config = load_read_only_config(&config_path)?;
            let host = SystemHost::from_config(&config);
            let report = workflow::status(&config, &host)?;
            let errors = report
                .events
                .iter()
                .filter(|event| event.level == WorkflowLevel::Error)
                .count();
            print_report(report);
            ensure!(errors == 0, "status found {errors} problem(s)");
        }
        Commands::RenderUnits => {
            let config = load_read_only_config(&config_path)?;
            for unit in render_units(&config) {
                println!("# {}", config.units_dir().join(&unit.name).display());
                println!("{}", unit.render());
            }
        }
        Commands::Validate { file, schema } => {
            if schema {
                let schema = schema_for!(StorechainConfig);
                println!("{}", to_string_pretty(&schema)?);
                return Ok(());
            }

            let file = file.unwrap_or(config_path);
            let cfg = StorechainConfig::load(&file)
                .with_context(|| format!("failed to load configuration from {}", file.display()))?;

            let issues = cfg.validate();
            if issues.is_empty() {
                println!(
                    "Configuration valid ({} -> {} -> {}/{} -> {}).",
                    cfg.image.path,
                    cfg.device.path,
                    cfg.volume.vg_name,
                    cfg.volume.lv_name,
                    cfg.mount.mountpoint
                );
            } else {
                for issue in &issues {
                    warn!("{issue}");
                    println!("  - {issue}");
                }
                bail!("configuration has {} issue(s)", issues.len());
            }
        }
        Commands::Template => {
            print!("{}", bootstrap_template());
        }
    }

    Ok(())
}

/// Show the plan and ask for an explicit `yes`.
fn confirm_provisioning(config: &StorechainConfig) -> Result<bool> {
    println!("storechain will provision:");
    println!(
        "  image      {} ({}, {})",
        config.image.path, config.image.format, config.image.size
    );
    println!("  device     {}", config.device.path);
    println!(
        "  volume     {}/{} (formatted as {} when new)",
        config.volume.vg_name, config.volume.lv_name, config.mount.fs_type
    );
    println!(
        "  mount      {} (owner {}:{})",
        config.mount.mountpoint, config.mount.owner, config.mount.group
    );
    println!("  fstab      {}", config.mount.fstab_path);
    println!(
        "  units      {}, {} in {}",
        config.units.connect_unit, config.units.activate_unit, config.units.directory
    );
    println!("Existing resources are kept; nothing is reformatted or recreated.");
    println!("Type yes to continue:");
    print!("> ");
    io::stdout().flush().ok();

    let mut answer = String::new();
    io::stdin().read_line(&mut answer)?;
    Ok(answer.trim().eq_ignore_ascii_case("yes"))
}

fn print_report(report: WorkflowReport) {
    println!("{}", report.title);
    for event in &report.events {
        println!("  [{}] {}", level_tag(event.level), event.message);
    }
    if !report.steps.is_empty() {
        println!("Steps:");
        for step in &report.steps {
            println!("  {:<14} {}", step.name, step.outcome);
        }
    }
}

/// Short tag used when printing workflow severity levels.
fn level_tag(level: WorkflowLevel) -> &'static str {
    match level {
        WorkflowLevel::Info => "INFO",
        WorkflowLevel::Success => "OK",
        WorkflowLevel::Warn => "WARN",
        WorkflowLevel::Error => "ERR",
    }
}
