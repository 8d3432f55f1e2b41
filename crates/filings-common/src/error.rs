//! Error types shared across the filings workspace

use thiserror::Error;

/// Result type alias for filings operations
pub type Result<T> = std::result::Result<T, FilingsError>;

/// Workspace-level error type
#[derive(Error, Debug)]
pub enum FilingsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}
