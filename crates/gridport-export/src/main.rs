//! gridport-export - export engine runtime
//!
//! Thin process shell around [`gridport_export::ExportCoordinator`]:
//! parses the CLI, initializes logging, wires the store and bus, and runs
//! the coordinator until SIGINT.
//!
//! ```bash
//! # Run the export engine
//! gridport-export -c export.yaml
//!
//! # Validate configuration and exit
//! gridport-export -c export.yaml validate
//!
//! # Probe every configured target's transport
//! gridport-export -c export.yaml check
//!
//! # List available handler types
//! gridport-export handlers
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gridport_export::{
    ExportCoordinator, HandlerRegistry, MemoryStore, MessageBus, ServiceConfig, TargetRegistry,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "gridport-export")]
#[command(version, about = "Export coordination engine for the Gridport gateway")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "export.yaml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the export engine (default)
    Run,
    /// Validate the configuration file and exit
    Validate,
    /// Probe connectivity for every configured target
    Check,
    /// List available handler types
    Handlers,
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_config(path: &PathBuf) -> Result<ServiceConfig> {
    ServiceConfig::from_file(path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))
}

fn build_bus(config: &ServiceConfig) -> Result<Arc<dyn MessageBus>> {
    #[cfg(feature = "redis-bus")]
    {
        let bus = gridport_export::RedisBus::new(&config.bus.url)
            .with_context(|| format!("invalid bus url '{}'", config.bus.url))?;
        Ok(Arc::new(bus))
    }
    #[cfg(not(feature = "redis-bus"))]
    {
        tracing::warn!(
            "Built without the redis-bus feature; using an in-process bus \
             (url '{}' ignored)",
            config.bus.url
        );
        Ok(Arc::new(gridport_export::MemoryBus::default()))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(&cli.config).await,
        Commands::Validate => validate(&cli.config),
        Commands::Check => check(&cli.config).await,
        Commands::Handlers => {
            let registry = HandlerRegistry::with_builtin_handlers();
            let mut names = registry.type_names();
            names.sort_unstable();
            for name in names {
                println!("{}", name);
            }
            Ok(())
        }
    }
}

async fn run(config_path: &PathBuf) -> Result<()> {
    let config = load_config(config_path)?;
    info!(
        "Starting gridport-export (client_id '{}')",
        config.client_id
    );

    let bus = build_bus(&config)?;
    // The relational store plugs in behind ConfigStore; the embedded
    // in-memory store keeps the engine runnable without one.
    let store = Arc::new(MemoryStore::new());

    let coordinator = ExportCoordinator::new(config, store, bus);
    coordinator
        .start()
        .await
        .context("coordinator failed to start")?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    coordinator.stop().await;
    Ok(())
}

fn validate(config_path: &PathBuf) -> Result<()> {
    let config = load_config(config_path)?;
    println!("Configuration OK");
    println!("  bus url:     {}", config.bus.url);
    println!("  channels:    {:?}", config.bus.channels);
    println!("  scheduler:   {}", if config.scheduler.enabled { "enabled" } else { "disabled" });
    println!(
        "  log queue:   {} entries, batches of {}",
        config.export_log.queue_capacity, config.export_log.batch_size
    );
    Ok(())
}

async fn check(config_path: &PathBuf) -> Result<()> {
    let _config = load_config(config_path)?;
    let store = Arc::new(MemoryStore::new());
    let registry = TargetRegistry::new(store, HandlerRegistry::with_builtin_handlers());
    let report = registry.load().await?;

    println!(
        "Loaded {} targets ({} skipped, {} handler failures)",
        report.targets_loaded, report.targets_skipped, report.handlers_failed
    );

    let snapshot = registry.snapshot().await;
    let mut failures = 0usize;
    for target in snapshot.targets() {
        match &target.handler {
            Some(handler) => match handler.check().await {
                Ok(()) => println!("  {} ({}): ok", target.name, target.target_type),
                Err(e) => {
                    failures += 1;
                    println!("  {} ({}): FAILED - {}", target.name, target.target_type, e);
                }
            },
            None => {
                failures += 1;
                println!("  {} ({}): no handler", target.name, target.target_type);
            }
        }
    }

    if failures > 0 {
        anyhow::bail!("{} target(s) failed the connectivity check", failures);
    }
    Ok(())
}
