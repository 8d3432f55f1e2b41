//! Relational sink
//!
//! [`StatementSink`] is the seam the worker writes through; [`PgSink`] is
//! the Postgres implementation. A statement is persisted atomically: the
//! header row and every fact entry go through one transaction, so a failure
//! rolls the whole filing back and nothing partial ever becomes visible.
//! `erst_id` carries a UNIQUE constraint, which both backs the idempotency
//! gate and arbitrates the race where two workers pass the gate for the same
//! id.

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::debug;

use filings_common::types::FinancialStatementRecord;

use crate::config::DatabaseConfig;
use crate::error::ItemError;

/// Seam between the worker and durable storage.
#[async_trait]
pub trait StatementSink: Send + Sync {
    /// Idempotency gate: is this external record id already persisted?
    async fn contains(&self, erst_id: &str) -> Result<bool, ItemError>;

    /// Persist header plus all entries as one atomic unit.
    async fn insert(&self, record: &FinancialStatementRecord) -> Result<(), ItemError>;
}

/// Postgres-backed sink.
#[derive(Clone)]
pub struct PgSink {
    pool: PgPool,
}

impl PgSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StatementSink for PgSink {
    async fn contains(&self, erst_id: &str) -> Result<bool, ItemError> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM financial_statement WHERE erst_id = $1)",
        )
        .bind(erst_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn insert(&self, record: &FinancialStatementRecord) -> Result<(), ItemError> {
        let mut tx = self.pool.begin().await?;

        let statement_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO financial_statement (cvr, published_at, loaded_at, erst_id, form_kind)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(record.cvr)
        .bind(record.published_at)
        .bind(record.loaded_at)
        .bind(&record.erst_id)
        .bind(&record.form_kind)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_insert_error)?;

        for entry in &record.entries {
            sqlx::query(
                r#"
                INSERT INTO financial_statement_entry (
                    statement_id, field_name, field_value, decimals, precision,
                    start_date, end_date, unit_id, consolidated, other_dimensions
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                "#,
            )
            .bind(statement_id)
            .bind(&entry.field_name)
            .bind(&entry.field_value)
            .bind(&entry.decimals)
            .bind(&entry.precision)
            .bind(entry.start_date)
            .bind(entry.end_date)
            .bind(&entry.unit_id)
            .bind(entry.consolidated)
            .bind(entry.other_dimensions.join(", "))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        debug!(
            erst_id = %record.erst_id,
            entries = record.entries.len(),
            "Statement persisted"
        );
        Ok(())
    }
}

/// A unique violation on `erst_id` means another worker won the race; the
/// caller treats it as Skipped rather than Failed.
fn map_insert_error(e: sqlx::Error) -> ItemError {
    let is_unique = e
        .as_database_error()
        .map(|db| db.is_unique_violation())
        .unwrap_or(false);
    if is_unique {
        ItemError::Duplicate
    } else {
        ItemError::Storage(e)
    }
}

/// Build the shared connection pool.
///
/// Constructed once at startup and handed to workers as explicit clones; no
/// process-wide connection singletons.
pub async fn connect_pool(config: &DatabaseConfig) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
        .connect(&config.url)
        .await?;
    Ok(pool)
}

/// Apply schema migrations.
pub async fn run_migrations(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
