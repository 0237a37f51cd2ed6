//! # Containerflow Configuration Validator
//!
//! Loads the layered engine configuration for an environment, validates it and
//! prints the sanitized result. Exits with status 1 when loading or validation
//! fails, so it can gate deployments.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use containerflow::config::ConfigManager;
use containerflow::orchestration::{RetryPolicyTable, StepSequence};
use std::path::PathBuf;
use std::process;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "config-validator")]
#[command(about = "Validate containerflow engine configuration")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Environment to validate (development, test, production, ...)
    #[arg(short, long, default_value = "development")]
    environment: String,

    /// Configuration directory path (default: config)
    #[arg(short, long)]
    config_dir: Option<PathBuf>,

    /// Verbose output level (use multiple times for more verbosity)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate and print the sanitized configuration as JSON
    Validate,

    /// List environments with an override file in the configuration directory
    Environments,

    /// Print the effective retry policy of every pipeline step
    Policies,
}

fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let _subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();

    let result = match cli.command {
        Some(Commands::Environments) => list_environments(&cli),
        Some(Commands::Policies) => show_policies(&cli),
        Some(Commands::Validate) | None => validate(&cli),
    };

    match result {
        Ok(()) => {
            info!("Configuration validation completed successfully");
            process::exit(0);
        }
        Err(e) => {
            error!("Configuration validation failed: {e:#}");
            eprintln!("❌ {e:#}");
            process::exit(1);
        }
    }
}

fn load(cli: &Cli) -> Result<std::sync::Arc<ConfigManager>> {
    ConfigManager::load_from_directory_with_env(cli.config_dir.clone(), &cli.environment)
        .with_context(|| format!("loading configuration for environment '{}'", cli.environment))
}

fn validate(cli: &Cli) -> Result<()> {
    let manager = load(cli)?;
    let rendered = serde_json::to_string_pretty(&manager.sanitized())
        .context("rendering sanitized configuration")?;
    println!("{rendered}");
    Ok(())
}

fn list_environments(cli: &Cli) -> Result<()> {
    let directory = cli
        .config_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from("config"));
    let entries = std::fs::read_dir(&directory)
        .with_context(|| format!("reading {}", directory.display()))?;

    let mut environments: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            name.strip_prefix("containerflow.")
                .and_then(|rest| rest.strip_suffix(".yaml"))
                .map(str::to_string)
        })
        .collect();
    environments.sort();

    println!("📋 Environments in {}:", directory.display());
    for environment in environments {
        println!("  - {environment}");
    }
    Ok(())
}

fn show_policies(cli: &Cli) -> Result<()> {
    let manager = load(cli)?;
    let table = RetryPolicyTable::from_config(&manager.config().retry);
    let sequence = StepSequence::canonical();

    let policies: serde_json::Map<String, serde_json::Value> = sequence
        .names()
        .map(|step| {
            let policy = table.policy_for(step);
            let value = serde_json::json!({
                "max_retries": policy.max_retries,
                "backoff_base_ms": u64::try_from(policy.backoff_base.as_millis()).unwrap_or(u64::MAX),
                "backoff_max_ms": u64::try_from(policy.backoff_max.as_millis()).unwrap_or(u64::MAX),
                "retryable_error_patterns": policy.retryable_error_patterns,
            });
            (step.to_string(), value)
        })
        .collect();

    println!(
        "{}",
        serde_json::to_string_pretty(&policies).context("rendering retry policies")?
    );
    Ok(())
}
