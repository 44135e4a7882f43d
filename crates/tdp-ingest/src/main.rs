//! TDP Ingest - pipeline runner

use anyhow::Result;
use clap::Parser;
use std::time::Duration;
use tdp_common::logging::{init_logging, LogConfig, LogLevel};
use tdp_ingest::config::{DatabaseConfig, IngestConfig};
use tdp_ingest::pipeline::ForwardPipeline;
use tdp_ingest::repository::PgRepository;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "tdp-ingest")]
#[command(author, version, about = "TDP data ingestion tool")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Parser, Debug)]
enum Command {
    /// Run ingestion cycles
    Run {
        /// Only ingest records observed at or after this instant (RFC 3339)
        #[arg(long)]
        since: Option<chrono::DateTime<chrono::Utc>>,

        /// Repeat every N seconds instead of exiting after one cycle
        #[arg(long)]
        interval: Option<u64>,
    },

    /// Apply database migrations
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut log_config = LogConfig::from_env().unwrap_or_default().with_file_prefix("tdp-ingest");
    if cli.verbose {
        log_config = log_config.with_level(LogLevel::Debug);
    }
    init_logging(&log_config)?;

    match cli.command {
        Command::Run { since, interval } => {
            let config = IngestConfig::load()?;
            let pipeline = ForwardPipeline::connect(&config).await?;

            // Ctrl-C stops new per-source work; in-flight staging and
            // merges finish before exit.
            let cancel = pipeline.cancellation_token();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("shutdown requested, letting in-flight work finish");
                    cancel.cancel();
                }
            });

            match interval {
                None => {
                    let report = pipeline.run_once(since).await;
                    if !report.all_succeeded() {
                        anyhow::bail!(
                            "cycle {} completed with failed sources: {:?}",
                            report.batch,
                            report.failed_sources()
                        );
                    }
                },
                Some(secs) => {
                    run_interval(&pipeline, since, secs).await;
                },
            }
        },
        Command::Migrate => {
            let database = DatabaseConfig::from_env();
            let pool = database.connect().await?;
            PgRepository::new(pool).run_migrations().await?;
            info!("migrations applied");
        },
    }

    Ok(())
}

/// Cron-less operation: one cycle every `secs` seconds until cancelled
async fn run_interval(pipeline: &ForwardPipeline, since: Option<chrono::DateTime<chrono::Utc>>, secs: u64) {
    let cancel = pipeline.cancellation_token();
    let mut ticker = tokio::time::interval(Duration::from_secs(secs.max(1)));

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let report = pipeline.run_once(since).await;
                if !report.all_succeeded() {
                    error!(
                        batch = %report.batch,
                        failed = ?report.failed_sources(),
                        "cycle completed with failures"
                    );
                }
            },
            _ = cancel.cancelled() => {
                info!("stopping interval loop");
                break;
            },
        }
    }
}
