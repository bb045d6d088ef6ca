// Factory Simulator - command line driver
// Run with: cargo run --bin simulator -- run --duration-secs 30

//! # Factory Simulator Binary
//!
//! Builds a production line, wires the configured telemetry sinks and runs
//! the simulation until Ctrl-C (or for a fixed duration).
//!
//! ```text
//! main()
//!   ↓ loads
//! SimulationConfig (file + FACTORY_* environment)
//!   ↓ builds
//! Factory (built-in layout or JSON definition) + SinkRegistry
//!   ↓ runs
//! Simulation ──► SimulationReport (printed as JSON)
//! ```
//!
//! ## Commands
//!
//! - `run`: run the simulation
//! - `graph`: print the node snapshot of a layout as JSON
//! - `sources`: list telemetry sources and the sink each one writes to
//! - `purge`: empty every telemetry table

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use dotenv::dotenv;
use factory_sim::engine::sink::ids;
use factory_sim::{
    DelimitedFileSink, Factory, InMemorySink, LineLayout, NatsSink, NatsSinkConfig, PostgresSink,
    Recorder, Simulation, SimulationConfig, SinkRegistry, SinkSettings,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "factory-simulator")]
#[command(about = "Factory Simulator - concurrent production line with pluggable telemetry")]
#[command(version = "0.1")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML, JSON or YAML)
    #[arg(long, global = true, env = "FACTORY_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the simulation until Ctrl-C
    Run {
        /// Stop automatically after this many seconds
        #[arg(long)]
        duration_secs: Option<u64>,

        /// Built-in layout, overrides the configuration
        #[arg(long, value_enum)]
        layout: Option<LayoutArg>,

        /// JSON factory definition, overrides the layout
        #[arg(long)]
        definition: Option<PathBuf>,

        /// Seed for reproducible runs
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Print the node graph as JSON
    Graph {
        #[arg(long, value_enum)]
        layout: Option<LayoutArg>,

        #[arg(long)]
        definition: Option<PathBuf>,
    },

    /// List telemetry sources
    Sources,

    /// Empty every telemetry table
    Purge {
        /// Confirm the purge operation
        #[arg(long)]
        confirm: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum LayoutArg {
    Standard,
    Extended,
}

impl From<LayoutArg> for LineLayout {
    fn from(arg: LayoutArg) -> Self {
        match arg {
            LayoutArg::Standard => LineLayout::Standard,
            LayoutArg::Extended => LineLayout::Extended,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional
    dotenv().ok();

    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = SimulationConfig::load(cli.config.as_deref())
        .context("Failed to load simulation configuration")?;

    match cli.command {
        Commands::Run {
            duration_secs,
            layout,
            definition,
            seed,
        } => {
            if let Some(layout) = layout {
                config.layout = layout.into();
            }
            if seed.is_some() {
                config.seed = seed;
            }
            run(config, definition.as_deref(), duration_secs).await?;
        }

        Commands::Graph { layout, definition } => {
            if let Some(layout) = layout {
                config.layout = layout.into();
            }
            let factory = build_factory(&config, definition.as_deref()).await?;
            println!("{}", serde_json::to_string_pretty(&factory.all_nodes().await)?);
        }

        Commands::Sources => {
            let sinks = connect_sinks(&config.sinks).await;
            let recorder = Recorder::with_default_sources(sinks, config.sinks.schema.clone());
            println!("{}", serde_json::to_string_pretty(&recorder.reports())?);
        }

        Commands::Purge { confirm } => {
            if !confirm {
                error!("Purge requires --confirm");
                return Ok(());
            }
            let sinks = connect_sinks(&config.sinks).await;
            let recorder = Recorder::with_default_sources(sinks, config.sinks.schema.clone());
            recorder.purge_all().await?;
            recorder.close().await;
            info!("All telemetry tables purged");
        }
    }

    Ok(())
}

async fn run(config: SimulationConfig, definition: Option<&Path>, duration_secs: Option<u64>) -> Result<()> {
    info!("Starting factory simulator");
    info!(layout = ?config.layout, rate = config.arrival_rate, seed = ?config.seed, "Configuration loaded");

    let factory = Arc::new(build_factory(&config, definition).await?);
    let sinks = connect_sinks(&config.sinks).await;
    info!(sinks = ?sinks.ids(), "Telemetry sinks registered");

    let recorder = Arc::new(
        Recorder::with_default_sources(sinks, config.sinks.schema.clone())
            .purge_on_prepare(config.sinks.purge_on_start),
    );
    let simulation = Simulation::new(factory, recorder, config)?;

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Ctrl-C received, shutting down gracefully"),
            Err(e) => error!(error = %e, "Cannot listen for Ctrl-C"),
        }
        on_signal.cancel();
    });
    if let Some(secs) = duration_secs {
        let on_timer = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            info!(secs, "Run duration elapsed");
            on_timer.cancel();
        });
    }

    let report = simulation.run(shutdown).await?;
    if !report.is_conserved() {
        warn!(
            generated = report.generated,
            accounted = report.accounted(),
            aborted = report.aborted_tasks,
            "Some parts are unaccounted for"
        );
    }
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn build_factory(config: &SimulationConfig, definition: Option<&Path>) -> Result<Factory> {
    match definition {
        Some(path) => {
            let json = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Cannot read factory definition {}", path.display()))?;
            Ok(Factory::from_json(&json)?)
        }
        None => Ok(Factory::for_layout(config.layout, config.queue_capacity)?),
    }
}

/// Register every configured backend; unreachable ones are skipped
async fn connect_sinks(settings: &SinkSettings) -> Arc<SinkRegistry> {
    let registry = Arc::new(SinkRegistry::new());
    registry.register(ids::MEMORY, Arc::new(InMemorySink::new()));

    if let Some(dir) = &settings.csv_dir {
        registry.register(
            ids::CSV,
            Arc::new(DelimitedFileSink::new(dir.clone(), settings.csv_delimiter)),
        );
    }

    if let Some(url) = &settings.postgres_url {
        match PostgresSink::connect(url).await {
            Ok(sink) => registry.register(ids::POSTGRES, Arc::new(sink)),
            Err(e) => warn!(error = %e, "PostgreSQL unavailable, its sources fall back"),
        }
    }

    if let Some(url) = &settings.nats_url {
        match NatsSink::connect(NatsSinkConfig::with_url(url.clone())).await {
            Ok(sink) => registry.register(ids::NATS, Arc::new(sink)),
            Err(e) => warn!(error = %e, "NATS unavailable, its sources fall back"),
        }
    }

    registry
}
