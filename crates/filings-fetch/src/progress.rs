//! Progress reporting
//!
//! A background task samples the queue's `(popped, pushed)` counters once a
//! second, drives a progress bar, and emits a periodic structured log line.
//! Purely observational: it takes the queue lock only for the counter read.

use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::queue::SharedQueue;

const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);
const LOG_EVERY_SAMPLES: u64 = 30;

/// Spawn the reporter; flip the returned sender to `true` to stop it.
pub fn spawn_reporter(queue: SharedQueue) -> (JoinHandle<()>, watch::Sender<bool>) {
    let (tx, mut rx) = watch::channel(false);
    let handle = tokio::spawn(async move {
        let bar = ProgressBar::new(0);
        if let Ok(style) =
            ProgressStyle::default_bar().template("{msg} [{wide_bar}] {pos}/{len} ({per_sec})")
        {
            bar.set_style(style.progress_chars("#>-"));
        }
        bar.set_message("Processing filings");

        let mut samples: u64 = 0;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(SAMPLE_INTERVAL) => {},
                _ = rx.changed() => {
                    if *rx.borrow() {
                        break;
                    }
                },
            }

            let (popped, pushed) = queue.statistics().await;
            bar.set_length(pushed);
            bar.set_position(popped);

            samples += 1;
            if samples % LOG_EVERY_SAMPLES == 0 {
                info!(popped, pushed, pending = pushed - popped, "Pipeline progress");
            }
        }

        let (popped, pushed) = queue.statistics().await;
        bar.finish_with_message(format!("Processed {}/{} queue messages", popped, pushed));
    });
    (handle, tx)
}
