//! Pipeline assembly
//!
//! Connects the pool, prepares the queue and error log, spawns the workers
//! and the progress reporter, runs the producer, and joins everything. The
//! producer is the only component whose failure aborts the run.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use tracing::{error, info};

use crate::config::FetchConfig;
use crate::error_log::ErrorLog;
use crate::index::IndexClient;
use crate::producer::run_producer;
use crate::progress::spawn_reporter;
use crate::queue::{IoQueue, SharedQueue};
use crate::sink::{connect_pool, run_migrations, PgSink};
use crate::transform::XbrlTransformer;
use crate::worker::{Worker, WorkerStats};

/// Final tallies of one run.
#[derive(Debug, Default, Clone, Copy)]
pub struct RunSummary {
    pub enqueued: u64,
    pub inserted: u64,
    pub skipped: u64,
    pub failed: u64,
}

/// Run the whole pipeline to completion.
///
/// With `resume`, the queue log of an interrupted run is reopened and
/// undelivered items are re-enqueued ahead of the new enumeration.
pub async fn run(config: &FetchConfig, from_date: NaiveDateTime, resume: bool) -> Result<RunSummary> {
    let pool = connect_pool(&config.database)
        .await
        .context("Could not connect to the database")?;
    run_migrations(&pool)
        .await
        .context("Could not apply migrations")?;

    // The push buffer must be able to hold one end-of-stream marker per
    // worker without filling a batch, or markers would spill into the log.
    let batch_size = config
        .pipeline
        .queue_batch_size
        .max(config.pipeline.workers + 1);
    let queue = if resume {
        IoQueue::resume(&config.pipeline.queue_path, batch_size)
            .context("Could not resume queue log")?
    } else {
        IoQueue::create(&config.pipeline.queue_path, batch_size)
            .context("Could not create queue log")?
    };
    let queue = SharedQueue::new(queue);

    let error_log = Arc::new(
        ErrorLog::open(&config.pipeline.error_log_path).context("Could not open error log")?,
    );
    let sink = Arc::new(PgSink::new(pool.clone()));
    let transformer = Arc::new(XbrlTransformer::new());

    let (reporter, stop_reporter) = spawn_reporter(queue.clone());

    let backoff = Duration::from_millis(config.pipeline.backoff_millis);
    let mut workers = Vec::with_capacity(config.pipeline.workers);
    for id in 0..config.pipeline.workers {
        let worker = Worker::new(
            id,
            queue.clone(),
            sink.clone(),
            transformer.clone(),
            error_log.clone(),
            backoff,
        );
        workers.push(tokio::spawn(worker.run()));
    }

    let client = IndexClient::new(&config.index);
    let enqueued = match run_producer(&client, &queue, from_date, config.pipeline.workers).await {
        Ok(enqueued) => enqueued,
        Err(e) => {
            // No markers were enqueued; the workers would wait forever.
            error!(error = %e, "Enumeration failed, aborting run");
            for handle in &workers {
                handle.abort();
            }
            let _ = stop_reporter.send(true);
            let _ = reporter.await;
            return Err(e.context("Producer enumeration failed"));
        },
    };

    let mut summary = RunSummary {
        enqueued,
        ..Default::default()
    };
    for handle in workers {
        let stats: WorkerStats = handle
            .await
            .context("Worker task panicked")?
            .context("Worker stopped on a queue failure")?;
        summary.inserted += stats.inserted;
        summary.skipped += stats.skipped;
        summary.failed += stats.failed;
    }

    let _ = stop_reporter.send(true);
    let _ = reporter.await;

    info!(
        enqueued = summary.enqueued,
        inserted = summary.inserted,
        skipped = summary.skipped,
        failed = summary.failed,
        "Pipeline run complete"
    );
    Ok(summary)
}
