//! farescan-worker CLI
//!
//! Runs the job execution engine over the local file store, and offers a few
//! client commands against the same store.

use anyhow::Context;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use farescan_store::{DateWindow, JobId, SearchConstraints, SearchParameters};
use farescan_worker::{
    cancel_job, init_tracing, load_config, open_store, CancelOutcome, SimulatedBackend, StatusService,
    Worker,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "farescan-worker")]
#[command(about = "Background execution engine for resumable fare search jobs", long_about = None)]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Config file to use instead of ./.farescan/farescan.toml
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute queued jobs until interrupted
    Run {
        /// Latency of the simulated search backend, in milliseconds
        #[arg(long, default_value_t = 250)]
        latency_ms: u64,
        /// Share of simulated searches that fail transiently
        #[arg(long, default_value_t = 0.0)]
        failure_rate: f64,
    },

    /// Queue a job over a travel window
    Submit {
        /// Departure airports, comma separated
        #[arg(long, value_delimiter = ',', required = true)]
        from: Vec<String>,
        /// Destination airports, comma separated
        #[arg(long, value_delimiter = ',', required = true)]
        to: Vec<String>,
        /// First outbound date (YYYY-MM-DD)
        #[arg(long)]
        start: NaiveDate,
        /// Last return date (YYYY-MM-DD)
        #[arg(long)]
        end: NaiveDate,
        #[arg(long, default_value_t = 14)]
        min_days: u32,
        #[arg(long, default_value_t = 21)]
        max_days: u32,
        #[arg(long, default_value_t = 700.0)]
        max_price: f64,
        #[arg(long, default_value_t = 2)]
        max_stops: u32,
        /// Searches of this job allowed to run at once
        #[arg(long, default_value_t = farescan_store::DEFAULT_MAX_CONCURRENT_SEARCHES)]
        max_concurrent: usize,
    },

    /// Show a job's progress
    Status {
        job_id: JobId,
        /// Output format: text (default), json
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Cancel a pending or running job
    Cancel { job_id: JobId },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config).await?;
    init_tracing(&config.logging)?;

    match cli.command {
        Commands::Run {
            latency_ms,
            failure_rate,
        } => {
            let backend = SimulatedBackend::new(Duration::from_millis(latency_ms))
                .with_transient_failure_rate(failure_rate);
            let worker = Worker::from_config(&config, Arc::new(backend)).await?;
            let _signals = worker.shutdown().install_signal_handlers();
            worker.run().await?;
            Ok(())
        }
        Commands::Submit {
            from,
            to,
            start,
            end,
            min_days,
            max_days,
            max_price,
            max_stops,
            max_concurrent,
        } => {
            let window = DateWindow {
                start_date: start,
                end_date: end,
                min_duration_days: min_days,
                max_duration_days: max_days,
            };
            let params = SearchParameters::from_window(from, to, &window)
                .with_constraints(SearchConstraints {
                    max_price,
                    max_stops,
                })
                .with_max_concurrent_searches(max_concurrent);

            let store = open_store(&config.store).await?;
            let job = store.create_job(params).await.context("Failed to create job")?;
            println!("✓ Job {} queued", job.job_id);
            println!("  Combinations: {}", job.total_combinations);
            Ok(())
        }
        Commands::Status { job_id, format } => {
            let store = open_store(&config.store).await?;
            let report = StatusService::new(store).get_status(job_id).await?;

            if format == "json" {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("Job {}", report.job_id);
                println!("  Status:       {}", report.status);
                println!(
                    "  Progress:     {}/{} ({:.1}%)",
                    report.processed_combinations,
                    report.total_combinations,
                    report.progress * 100.0
                );
                println!("  Flights:      {}", report.found_flights);
                println!("  Failed:       {}", report.failed_combinations);
                match report.best_price {
                    Some(price) => println!("  Best price:   {:.2}", price),
                    None => println!("  Best price:   -"),
                }
                if let Some(reason) = &report.failure_reason {
                    println!("  Reason:       {}", reason);
                }
                println!("  Checkpoint:   {}", report.last_checkpoint_at.to_rfc3339());
            }
            Ok(())
        }
        Commands::Cancel { job_id } => {
            let store = open_store(&config.store).await?;
            match cancel_job(store.as_ref(), None, job_id).await? {
                CancelOutcome::Cancelled { .. } => println!("✓ Job {} cancelled", job_id),
                CancelOutcome::AlreadyFinished(status) => {
                    println!("Job {} already {}", job_id, status)
                }
            }
            Ok(())
        }
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}
