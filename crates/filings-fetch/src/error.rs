//! Pipeline error taxonomy
//!
//! Two tiers: [`IndexError`] is fatal and aborts the run (only the producer
//! raises it); [`ItemError`] is per-filing, absorbed by the worker loop,
//! logged, and never stops processing.

use thiserror::Error;

/// Enumeration failure against the external index. Fatal to the producer.
#[derive(Error, Debug)]
pub enum IndexError {
    #[error("index request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("index returned status {status} for {url}")]
    Status {
        status: reqwest::StatusCode,
        url: String,
    },

    #[error("could not decode index response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("invalid index payload: {0}")]
    Payload(String),
}

/// Per-filing failure inside a worker.
#[derive(Error, Debug)]
pub enum ItemError {
    /// Download failed or the payload was undecodable.
    #[error("input data error: {0}")]
    InputData(String),

    /// The fetched document could not be turned into a statement record.
    #[error("transform error: {0}")]
    Transform(String),

    /// The sink rejected the insert; the transaction was rolled back.
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// Another worker persisted this external record id first. Resolves to
    /// Skipped, not Failed.
    #[error("record already persisted")]
    Duplicate,
}
