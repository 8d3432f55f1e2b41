//! filings-fetch - financial filing ingestion pipeline

use anyhow::Result;
use chrono::NaiveDateTime;
use clap::Parser;
use filings_common::logging::{init_logging, LogConfig, LogLevel};
use filings_fetch::config::FetchConfig;
use filings_fetch::pipeline;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "filings-fetch")]
#[command(author, version, about = "Financial filing ingestion pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Parser, Debug)]
enum Command {
    /// Fetch filings from the disclosure index into the database
    Fetch {
        /// Lower publication-timestamp bound: YYYY-mm-dd[THH:MM:SS]
        #[arg(short, long, value_parser = parse_date)]
        from_date: NaiveDateTime,

        /// Number of parallel workers (overrides FILINGS_WORKERS)
        #[arg(short, long)]
        workers: Option<usize>,

        /// Queue log path (overrides FILINGS_QUEUE_PATH)
        #[arg(long)]
        queue_path: Option<String>,

        /// Reopen the queue log of an interrupted run instead of starting
        /// fresh
        #[arg(long)]
        resume: bool,
    },
}

fn parse_date(raw: &str) -> Result<NaiveDateTime, String> {
    if let Ok(datetime) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S") {
        return Ok(datetime);
    }
    chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .ok_or_else(|| format!("invalid date '{}', expected YYYY-mm-dd[THH:MM:SS]", raw))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("filings-fetch".to_string())
        .build();

    // Environment variables take precedence over the CLI-derived values;
    // anything unset keeps them.
    let log_config = log_config.with_env_overrides()?;

    init_logging(&log_config)?;

    match cli.command {
        Command::Fetch {
            from_date,
            workers,
            queue_path,
            resume,
        } => {
            let mut config = FetchConfig::load()?;
            if let Some(workers) = workers {
                config.pipeline.workers = workers.max(1);
            }
            if let Some(queue_path) = queue_path {
                config.pipeline.queue_path = queue_path;
            }

            info!(
                from_date = %from_date,
                workers = config.pipeline.workers,
                resume,
                "Starting fetch"
            );
            let summary = pipeline::run(&config, from_date, resume).await?;
            info!(
                enqueued = summary.enqueued,
                inserted = summary.inserted,
                skipped = summary.skipped,
                failed = summary.failed,
                "Fetch complete"
            );
        },
    }

    Ok(())
}
