//! BenchLink CLI entry point

use anyhow::{Context, Result};
use benchlink::config::cli::{Cli, ExecutionMode};
use benchlink::config::{self, validator, Config};
use benchlink::distributed::{self, MasterCoordinator, MasterSettings, RunSummary, WorkerService};
use benchlink::util::time::format_duration;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let cli = Cli::parse_args();
    cli.validate()?;

    init_logging(cli.debug);

    let config = config::load_config(&cli)?;
    validator::validate_for_mode(&config, cli.mode).context("Configuration validation failed")?;

    if cli.dry_run {
        println!("BenchLink v{} ({:?} mode)", env!("CARGO_PKG_VERSION"), cli.mode);
        print!("{}", config);
        println!("Configuration is valid.");
        return Ok(());
    }

    let runtime = tokio::runtime::Runtime::new().context("Failed to create tokio runtime")?;

    match cli.mode {
        ExecutionMode::Local => runtime.block_on(run_local(config)),
        ExecutionMode::Master => runtime.block_on(run_master(config)),
        ExecutionMode::Worker => runtime.block_on(run_worker(config)),
    }
}

/// `RUST_LOG` wins; otherwise `info`, or `debug` with `--debug`
fn init_logging(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}

/// Run master and workers in this process
async fn run_local(config: Config) -> Result<()> {
    let summary = distributed::run_local(&config).await?;
    print_summary(&summary);
    Ok(())
}

/// Run the master against remote workers
async fn run_master(config: Config) -> Result<()> {
    let settings = MasterSettings::from_config(&config.master)?;
    let coordinator = MasterCoordinator::new(config.messenger_config(), settings)
        .context("Failed to create master coordinator")?;

    let summary = coordinator.run().await?;
    print_summary(&summary);
    Ok(())
}

/// Serve one master until it sends exit
async fn run_worker(config: Config) -> Result<()> {
    let handle = WorkerService::new(config.messenger_config(), config.worker.clone())
        .start()
        .await?;

    let report = handle.run().await?;
    println!(
        "Worker {} finished: {} handled, {} failed, {} unknown",
        report.worker_id, report.handled, report.failed, report.unknown
    );
    Ok(())
}

/// Print the run summary
fn print_summary(summary: &RunSummary) {
    println!("═══════════════════════════════════════════════════════════");
    println!("                    RUN SUMMARY");
    println!("═══════════════════════════════════════════════════════════");
    println!();
    println!("Workers: {}", summary.workers.len());
    for worker in &summary.workers {
        println!(
            "  {} on {} (sut: {})",
            worker.worker_id,
            worker.node,
            worker.sut.as_deref().unwrap_or("-")
        );
    }
    println!();
    println!("Setup: {}", format_duration(summary.setup_duration));

    for round in &summary.rounds {
        println!();
        println!(
            "Round {} ({}): prepare {}, test {}",
            round.round,
            round.label,
            format_duration(round.prepare_duration),
            format_duration(round.test_duration)
        );
        for (worker_id, result) in &round.results {
            println!("  {}: {}", worker_id, result);
        }
    }

    println!();
    println!("Total: {}", format_duration(summary.total_duration));
}
