//! Producer: index enumeration into the queue
//!
//! Scans the disclosure index in publication order and enqueues one work
//! item per retained filing, then exactly one end-of-stream marker per
//! worker. FIFO order of the queue guarantees every marker is observed
//! after every real item. Markers are enqueued only after the durable
//! flush and never reach the log, so a resumed log re-delivers real items
//! exclusively. Enumeration errors are fatal: there is no checkpoint
//! beyond the caller-supplied `from_date`.

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use tracing::{debug, info};

use filings_common::types::QueueMessage;

use crate::index::IndexClient;
use crate::queue::SharedQueue;

/// Enumerate and enqueue; returns the number of real items enqueued.
pub async fn run_producer(
    client: &IndexClient,
    queue: &SharedQueue,
    from_date: NaiveDateTime,
    workers: usize,
) -> Result<u64> {
    info!(from_date = %from_date, workers, "Producer starting enumeration");

    let mut scan = client
        .scan(from_date)
        .await
        .context("Index enumeration could not start")?;

    let mut enqueued: u64 = 0;
    while let Some(item) = scan
        .next_item()
        .await
        .context("Index enumeration failed mid-scan")?
    {
        debug!(erst_id = %item.erst_id, published_at = %item.published_at, "Enqueuing filing");
        queue
            .put(QueueMessage::Item(item))
            .await
            .context("Could not enqueue work item")?;
        enqueued += 1;
        if enqueued % 10_000 == 0 {
            info!(enqueued, "Enumeration progress");
        }
    }

    // Make the enumerated tail durable before the markers go in. Markers are
    // run-local control messages and stay memory-only: one that survived
    // into a resumed log would terminate workers ahead of the re-delivered
    // items. FIFO is unaffected, disk-pending batches are always served
    // before the push buffer.
    queue.flush().await.context("Could not flush queue tail")?;

    for _ in 0..workers {
        queue
            .put(QueueMessage::EndOfStream)
            .await
            .context("Could not enqueue end-of-stream marker")?;
    }

    info!(enqueued, "Enumeration complete, markers enqueued");
    Ok(enqueued)
}
