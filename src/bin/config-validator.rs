//! # Pipeline Configuration Validator
//!
//! Loads the layered pipeline configuration the same way the orchestrator
//! does and reports problems before anything is started.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use dataflow_core::config::{BackoffConfig, BackoffStrategy, ConfigManager, PipelineConfig};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "config-validator")]
#[command(about = "Validate pipeline configuration files")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Environment overlay to apply (pipeline.<environment>.toml)
    #[arg(short, long, default_value = "development")]
    environment: String,

    /// Configuration directory (default: $PIPELINE_CONFIG_DIR or ./config)
    #[arg(short, long)]
    config_dir: Option<PathBuf>,

    /// Verbose output level (use multiple times for more verbosity)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
    format: OutputFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Table,
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Load and validate the full configuration
    Validate,

    /// Show the effective per-stage settings
    Stages,

    /// Print the merged configuration, database url masked
    Show,
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
        .try_init();

    let result = match &cli.command {
        Some(Commands::Validate) | None => validate(&cli),
        Some(Commands::Stages) => show_stages(&cli),
        Some(Commands::Show) => show_config(&cli),
    };

    match result {
        Ok(()) => {
            info!("Configuration check completed successfully");
            process::exit(0);
        }
        Err(e) => {
            error!("Configuration check failed: {e:#}");
            println!("❌ {e:#}");
            process::exit(1);
        }
    }
}

fn load(cli: &Cli) -> Result<Arc<ConfigManager>> {
    ConfigManager::load_from_directory_with_env(cli.config_dir.clone(), &cli.environment)
        .with_context(|| format!("loading configuration for '{}'", cli.environment))
}

fn validate(cli: &Cli) -> Result<()> {
    println!("🔧 Validating Pipeline Configuration");
    println!("Environment: {}", cli.environment);

    let manager = load(cli)?;
    println!(
        "Config Directory: {}",
        manager.config_directory().display()
    );
    println!();
    println!("✅ Configuration loaded and validated");

    let config = manager.config();
    report_stages(config);
    report_queue(config);
    report_store(config);
    report_database(config);

    println!("\n🎉 All configuration validation checks passed!");
    Ok(())
}

fn report_stages(config: &PipelineConfig) {
    println!("🧭 Stages");
    for (stage, stage_config) in config.stages.iter() {
        println!(
            "   ✅ {stage}: queue '{}', timeout {}s, {} attempt(s)",
            stage_config.queue_name, stage_config.timeout_seconds, stage_config.max_attempts
        );
    }
    println!(
        "   ✅ Partial failure policy: {}",
        config.policy.partial_failure
    );
}

fn report_queue(config: &PipelineConfig) {
    println!("📬 Queues");
    println!(
        "   ✅ Results queue: {}",
        config.queue.results_queue_name
    );
    println!(
        "   ✅ Visibility timeout: {}s, poll interval: {}ms",
        config.queue.visibility_timeout_seconds, config.queue.poll_interval_ms
    );
    for (_, stage_config) in config.stages.iter() {
        let timeout = stage_config.timeout_seconds;
        if config.queue.visibility_timeout_seconds < timeout {
            println!(
                "   ⚠️  '{}' tasks may outlive the visibility timeout ({}s < {}s) and be redelivered",
                stage_config.queue_name, config.queue.visibility_timeout_seconds, timeout
            );
        }
    }
}

fn report_store(config: &PipelineConfig) {
    println!("🗄️  Run State Store");
    println!(
        "   ✅ Lease duration: {}s, snapshot every {} events",
        config.store.lease_duration_seconds, config.store.snapshot_interval_events
    );
}

fn report_database(config: &PipelineConfig) {
    match &config.database.url {
        Some(url) if !url.is_empty() => println!(
            "   ✅ Database URL configured (max connections: {})",
            config.database.max_connections
        ),
        _ => println!("   ℹ️  Database URL not configured (in-memory backends only)"),
    }
}

fn show_stages(cli: &Cli) -> Result<()> {
    let manager = load(cli)?;
    let config = manager.config();

    if cli.format == OutputFormat::Json {
        let rows: Vec<serde_json::Value> = config
            .stages
            .iter()
            .map(|(stage, stage_config)| {
                serde_json::json!({
                    "stage": stage,
                    "queue_name": stage_config.queue_name,
                    "timeout_seconds": stage_config.timeout_seconds,
                    "max_attempts": stage_config.max_attempts,
                    "backoff": config.backoff_for(stage),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    println!(
        "{:<16} {:<16} {:>8} {:>9}  backoff",
        "stage", "queue", "timeout", "attempts"
    );
    for (stage, stage_config) in config.stages.iter() {
        println!(
            "{:<16} {:<16} {:>7}s {:>9}  {}",
            stage.as_str(),
            stage_config.queue_name,
            stage_config.timeout_seconds,
            stage_config.max_attempts,
            describe_backoff(config.backoff_for(stage))
        );
    }
    Ok(())
}

fn describe_backoff(backoff: &BackoffConfig) -> String {
    match backoff.strategy {
        BackoffStrategy::Fixed => format!("fixed {}ms", backoff.initial_delay_ms),
        BackoffStrategy::Exponential => format!(
            "exponential {}ms x{} (max {}ms, jitter {})",
            backoff.initial_delay_ms, backoff.multiplier, backoff.max_delay_ms, backoff.jitter_fraction
        ),
    }
}

fn show_config(cli: &Cli) -> Result<()> {
    let manager = load(cli)?;
    let rendered = serde_json::to_string_pretty(&manager.debug_config())?;
    match cli.format {
        OutputFormat::Json => println!("{rendered}"),
        OutputFormat::Table => {
            println!("📁 Environment: {}", manager.environment());
            println!("📁 Directory: {}", manager.config_directory().display());
            println!("{rendered}");
        }
    }
    Ok(())
}
