//! Filings Fetch Library
//!
//! Ingestion pipeline for company financial filings: enumerates the
//! registry's disclosure index, coordinates one producer and N workers
//! through a disk-backed FIFO queue, and persists each filing exactly once.
//!
//! # Architecture
//!
//! - **queue**: bounded-memory, crash-tolerant work queue plus its lock
//! - **index**: scroll client for the disclosure index
//! - **producer**: enumeration into the queue, end-of-stream markers last
//! - **worker**: fetch → transform → idempotency-gated insert, per item
//! - **sink**: transactional relational store behind the `StatementSink` seam
//!
//! # Example
//!
//! ```no_run
//! use filings_fetch::config::FetchConfig;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = FetchConfig::load()?;
//!     let from = chrono::NaiveDate::from_ymd_opt(2011, 1, 1)
//!         .unwrap()
//!         .and_hms_opt(0, 0, 0)
//!         .unwrap();
//!     let summary = filings_fetch::pipeline::run(&config, from, false).await?;
//!     println!("inserted {}", summary.inserted);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod download;
pub mod error;
pub mod error_log;
pub mod index;
pub mod pipeline;
pub mod producer;
pub mod progress;
pub mod queue;
pub mod sink;
pub mod transform;
pub mod worker;
