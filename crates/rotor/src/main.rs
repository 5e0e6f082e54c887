//! Rotor: VPN tunnel rotator
//!
//! Main entry point. Initializes the global allocator, sets up logging,
//! loads the configuration and dispatches the operator command.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rotor_vpn::{
    expand_home, CandidateRegistry, ConfigSource, HealthProber, JsonStatsStore, ListFileSource,
    RotationOutcome, RotorConfig, Scheduler, StatsSink, SystemLauncher, TunnelSupervisor,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Configuration file looked up when `--config` is not given
const DEFAULT_CONFIG: &str = "~/vpn-advanced/rotor.toml";

/// Keep a host connected through the best available VPN tunnel.
#[derive(Debug, Parser)]
#[command(name = "rotor", version, about)]
struct Cli {
    /// Configuration file (TOML or JSON)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Log level when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Rotate once to the best candidate and leave it running
    Rotate,
    /// Rotate periodically and on health failures until interrupted
    Run {
        /// Seconds between scheduled rotations
        #[arg(long)]
        interval: Option<u64>,
    },
    /// Probe every candidate and print latencies
    TestAll,
    /// Print usage statistics
    Stats,
    /// Show which candidate would be chosen next, without connecting
    Select,
    /// Print the effective configuration
    Config,
}

fn load_config(path: Option<&PathBuf>) -> Result<RotorConfig> {
    match path {
        Some(path) => RotorConfig::load(path)
            .with_context(|| format!("Failed to load {}", path.display())),
        None => {
            let default = expand_home(Path::new(DEFAULT_CONFIG));
            if default.exists() {
                RotorConfig::load(&default)
                    .with_context(|| format!("Failed to load {}", default.display()))
            } else {
                Ok(RotorConfig::default())
            }
        }
    }
}

fn build_supervisor(config: &RotorConfig) -> Result<TunnelSupervisor> {
    let source = ListFileSource::new(config.base_dir(), config.list_path());
    let specs = source.load().context("Failed to load candidate list")?;
    let registry = CandidateRegistry::from_specs(specs);

    let prober = HealthProber::from_config(&config.probe, config.policy.usable_latency_ms)
        .context("Invalid probe configuration")?;
    let stats = JsonStatsStore::open(config.stats_path()).context("Failed to open stats")?;

    Ok(TunnelSupervisor::new(
        registry,
        config.policy.clone(),
        prober,
        Arc::new(SystemLauncher::new()),
        Arc::new(stats),
    ))
}

/// Cancel the token on Ctrl-C or SIGTERM
fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = term.recv() => {}
                    }
                }
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {}", e);
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }

        info!("Interrupt received, shutting down");
        shutdown.cancel();
    });
}

async fn rotate(config: &RotorConfig) -> Result<()> {
    let mut supervisor = build_supervisor(config)?;
    supervisor.test_all().await;

    match supervisor.rotate().await? {
        RotationOutcome::Committed(candidate) => {
            println!("Connected: {} ({})", candidate.path.display(), candidate.latency);
        }
        RotationOutcome::NoCandidates => println!("No candidates configured"),
    }
    Ok(())
}

async fn run(config: &RotorConfig) -> Result<()> {
    let supervisor = build_supervisor(config)?;
    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let scheduler = Scheduler::new(
        supervisor,
        config.rotation_interval(),
        config.health_interval(),
        shutdown,
    );
    let supervisor = scheduler.run().await;

    for line in supervisor.stats().report().iter().take(3) {
        info!("{}: {} uses, avg {:.2}ms", line.path, line.uses, line.average_latency_ms);
    }
    Ok(())
}

async fn test_all(config: &RotorConfig) -> Result<()> {
    let mut supervisor = build_supervisor(config)?;
    let reports = supervisor.test_all().await;

    println!("{:<40} {:>12}  usable", "configuration", "latency");
    for report in &reports {
        println!(
            "{:<40} {:>12}  {}",
            report.name,
            report.latency.to_string(),
            if report.usable { "yes" } else { "no" }
        );
    }
    let usable = reports.iter().filter(|r| r.usable).count();
    println!("{} of {} usable", usable, reports.len());
    Ok(())
}

fn stats(config: &RotorConfig) -> Result<()> {
    let store = JsonStatsStore::open(config.stats_path()).context("Failed to open stats")?;
    let report = store.report();

    if report.is_empty() {
        println!("No usage recorded yet ({})", store.path().display());
        return Ok(());
    }

    for line in report {
        let last_used = line
            .last_used
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{}: {} uses, avg {:.2}ms, last used {}",
            line.path, line.uses, line.average_latency_ms, last_used
        );
    }
    Ok(())
}

async fn select(config: &RotorConfig) -> Result<()> {
    let mut supervisor = build_supervisor(config)?;
    supervisor.test_all().await;

    match supervisor.select_next() {
        Some(candidate) => println!(
            "Next: {} (priority {}, {} tier, {})",
            candidate.path.display(),
            candidate.priority,
            candidate.tier,
            candidate.latency
        ),
        None => println!("No candidates configured"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let mut config = load_config(cli.config.as_ref())?;

    info!("Rotor starting...");
    info!("Candidate list: {}", config.list_path().display());

    match cli.command {
        Command::Rotate => rotate(&config).await?,
        Command::Run { interval } => {
            if let Some(secs) = interval {
                config.rotation_interval_secs = secs;
                config.validate()?;
            }
            info!(
                "Rotating every {:?}",
                Duration::from_secs(config.rotation_interval_secs)
            );
            run(&config).await?;
        }
        Command::TestAll => test_all(&config).await?,
        Command::Stats => stats(&config)?,
        Command::Select => select(&config).await?,
        Command::Config => print!("{}", config.to_toml()),
    }

    info!("Rotor shutting down");
    Ok(())
}
