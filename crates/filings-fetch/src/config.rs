//! Configuration management

use serde::{Deserialize, Serialize};

// ============================================================================
// Defaults
// ============================================================================

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/filings";

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 10;

/// Default minimum database connections in the pool.
pub const DEFAULT_DATABASE_MIN_CONNECTIONS: u32 = 2;

/// Default database connection timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default disclosure index endpoint.
pub const DEFAULT_INDEX_URL: &str = "http://distribution.virk.dk:80";

/// Default disclosure index name.
pub const DEFAULT_INDEX_NAME: &str = "offentliggoerelser";

/// Default scroll page size.
pub const DEFAULT_INDEX_PAGE_SIZE: usize = 500;

/// Default number of worker tasks.
pub const DEFAULT_WORKERS: usize = 1;

/// Default on-disk queue log location.
pub const DEFAULT_QUEUE_PATH: &str = "./filings-queue.log";

/// Default error log location.
pub const DEFAULT_ERROR_LOG_PATH: &str = "./filings-errors.log";

/// Default worker backoff when the queue is observed empty, in milliseconds.
pub const DEFAULT_BACKOFF_MILLIS: u64 = 500;

/// Pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    pub database: DatabaseConfig,
    pub index: IndexConfig,
    pub pipeline: PipelineConfig,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
}

/// Disclosure index configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    pub base_url: String,
    pub index: String,
    pub page_size: usize,
}

/// Worker/queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub workers: usize,
    pub queue_path: String,
    pub error_log_path: String,
    pub queue_batch_size: usize,
    pub backoff_millis: u64,
}

impl FetchConfig {
    /// Load configuration from environment and defaults
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = FetchConfig {
            database: DatabaseConfig {
                url: std::env::var("FILINGS_DATABASE_URL")
                    .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string()),
                max_connections: env_parse(
                    "FILINGS_DATABASE_MAX_CONNECTIONS",
                    DEFAULT_DATABASE_MAX_CONNECTIONS,
                ),
                min_connections: env_parse(
                    "FILINGS_DATABASE_MIN_CONNECTIONS",
                    DEFAULT_DATABASE_MIN_CONNECTIONS,
                ),
                connect_timeout_secs: env_parse(
                    "FILINGS_DATABASE_CONNECT_TIMEOUT_SECS",
                    DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                ),
            },
            index: IndexConfig {
                base_url: std::env::var("FILINGS_INDEX_URL")
                    .unwrap_or_else(|_| DEFAULT_INDEX_URL.to_string()),
                index: std::env::var("FILINGS_INDEX_NAME")
                    .unwrap_or_else(|_| DEFAULT_INDEX_NAME.to_string()),
                page_size: env_parse("FILINGS_INDEX_PAGE_SIZE", DEFAULT_INDEX_PAGE_SIZE),
            },
            pipeline: PipelineConfig {
                workers: env_parse("FILINGS_WORKERS", DEFAULT_WORKERS),
                queue_path: std::env::var("FILINGS_QUEUE_PATH")
                    .unwrap_or_else(|_| DEFAULT_QUEUE_PATH.to_string()),
                error_log_path: std::env::var("FILINGS_ERROR_LOG_PATH")
                    .unwrap_or_else(|_| DEFAULT_ERROR_LOG_PATH.to_string()),
                queue_batch_size: env_parse(
                    "FILINGS_QUEUE_BATCH_SIZE",
                    crate::queue::DEFAULT_BATCH_SIZE,
                ),
                backoff_millis: env_parse("FILINGS_BACKOFF_MILLIS", DEFAULT_BACKOFF_MILLIS),
            },
        };

        Ok(config)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}
