use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "velar-cli")]
#[command(about = "Velar command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one scheduler pass over the due processes.
    Run,
    /// Run the cron-driven daemon (requires VELAR_SCHEDULER_ENABLED=1).
    Watch,
    /// Only seed control rows for actively tracked processes.
    Bootstrap,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let summary = velar_sync::run_scheduler_once_from_env().await?;
            println!(
                "sync complete: invocation={} due={} ok={} failed={} inserted={} notified={} dry_run={}",
                summary.invocation_id,
                summary.due,
                summary.succeeded,
                summary.failed,
                summary.rows_inserted,
                summary.notified,
                summary.dry_run,
            );
        }
        Commands::Watch => {
            let scheduler = Arc::new(velar_sync::scheduler_from_env().await?);
            let Some(sched) = velar_sync::maybe_build_scheduler(scheduler).await? else {
                eprintln!("daemon disabled; set VELAR_SCHEDULER_ENABLED=1 to run watch");
                return Ok(());
            };
            let mut sched = sched;
            sched.start().await.context("starting cron scheduler")?;
            info!("watch daemon running; Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping cron scheduler")?;
        }
        Commands::Bootstrap => {
            let scheduler = velar_sync::scheduler_from_env().await?;
            let seeded = scheduler.bootstrap().await?;
            println!("bootstrap complete: {seeded} active processes have control rows");
        }
    }

    Ok(())
}
