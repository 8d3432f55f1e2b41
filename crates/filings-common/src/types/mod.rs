//! Shared domain types for the filings pipeline
//!
//! Everything that crosses a crate or process boundary lives here: the queued
//! work item, the queue's control messages, and the structured statement
//! record handed to the sink.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::error::{FilingsError, Result};

/// One enumerated filing, queued for processing.
///
/// Created once by the producer and read-only afterwards; crosses the queue
/// as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Company registration number; nullable at the source (e.g. Greenland
    /// companies have none).
    pub cvr: Option<i64>,
    /// When the filing was published by the registry.
    pub published_at: NaiveDateTime,
    /// URL of the primary XBRL instance document.
    pub document_url: String,
    /// URL of the taxonomy-extension zip archive, when the filing has one.
    pub extension_url: Option<String>,
    /// Stable identifier assigned by the index source; the idempotency key.
    pub erst_id: String,
    /// When the registry loaded the filing into its index.
    pub loaded_at: NaiveDateTime,
}

/// Messages carried by the work queue.
///
/// `EndOfStream` is enqueued once per worker after enumeration completes;
/// global FIFO order guarantees a worker only sees it after every real item
/// enqueued before it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueueMessage {
    Item(WorkItem),
    EndOfStream,
}

/// A fully transformed filing: header attributes plus ordered fact entries.
///
/// Persisted atomically by the sink (header and all entries, or nothing) and
/// never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinancialStatementRecord {
    pub cvr: Option<i64>,
    pub published_at: NaiveDateTime,
    pub loaded_at: NaiveDateTime,
    pub erst_id: String,
    /// File name of the governing taxonomy schema, when it could be
    /// determined.
    pub form_kind: Option<String>,
    pub entries: Vec<FactEntry>,
}

/// One reported fact within a filing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactEntry {
    pub field_name: String,
    pub field_value: String,
    pub decimals: Option<String>,
    pub precision: Option<String>,
    pub start_date: NaiveDateTime,
    pub end_date: NaiveDateTime,
    /// XBRL unit identifier, e.g. "DKK" or "pure".
    pub unit_id: Option<String>,
    /// Group-level (true) vs standalone (false) figure.
    pub consolidated: bool,
    /// Remaining dimension members after the consolidated/solo markers are
    /// stripped.
    pub other_dimensions: Vec<String>,
}

/// Parse a registry timestamp into a naive datetime.
///
/// The index reports RFC 3339 timestamps with a zone offset
/// (`2016-01-05T12:34:56.789+01:00`); the stored form discards the offset and
/// sub-second part, keeping the local wall-clock value.
pub fn parse_index_timestamp(raw: &str) -> Result<NaiveDateTime> {
    let head = raw
        .get(..19)
        .ok_or_else(|| FilingsError::InvalidTimestamp(raw.to_string()))?;
    NaiveDateTime::parse_from_str(head, "%Y-%m-%dT%H:%M:%S")
        .map_err(|_| FilingsError::InvalidTimestamp(raw.to_string()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn sample_item() -> WorkItem {
        WorkItem {
            cvr: Some(33070691),
            published_at: parse_index_timestamp("2016-01-05T12:34:56.789+01:00").unwrap(),
            document_url: "http://regnskaber.example/doc.xml".to_string(),
            extension_url: None,
            erst_id: "urn:ofk:oid:5d1b1e2a".to_string(),
            loaded_at: parse_index_timestamp("2016-01-05T13:00:00.000+01:00").unwrap(),
        }
    }

    #[test]
    fn timestamp_drops_offset_and_millis() {
        let ts = parse_index_timestamp("2016-01-05T12:34:56.789+01:00").unwrap();
        assert_eq!(ts.format("%Y-%m-%d %H:%M:%S").to_string(), "2016-01-05 12:34:56");
    }

    #[test]
    fn timestamp_rejects_short_input() {
        assert!(parse_index_timestamp("2016-01-05").is_err());
    }

    #[test]
    fn queue_message_round_trips_as_json() {
        let msg = QueueMessage::Item(sample_item());
        let encoded = serde_json::to_string(&msg).unwrap();
        assert!(!encoded.contains('\n'));
        let decoded: QueueMessage = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, msg);

        let marker = serde_json::to_string(&QueueMessage::EndOfStream).unwrap();
        let decoded: QueueMessage = serde_json::from_str(&marker).unwrap();
        assert_eq!(decoded, QueueMessage::EndOfStream);
    }
}
