//! Append-only error log
//!
//! One line per failed item, tab-separated: external record id, cvr,
//! publication timestamp, human-readable reason. A non-empty error log does
//! not fail a run; it is the re-run worklist.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use filings_common::types::WorkItem;

use crate::error::ItemError;

pub struct ErrorLog {
    file: Mutex<File>,
}

impl ErrorLog {
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    /// Record one failed item. Never panics into the worker loop; an
    /// unwritable error log degrades to a tracing error.
    pub fn record(&self, item: &WorkItem, error: &ItemError) {
        let cvr = item
            .cvr
            .map(|c| c.to_string())
            .unwrap_or_else(|| "-".to_string());
        let line = format!(
            "{}\t{}\t{}\t{}\n",
            item.erst_id,
            cvr,
            item.published_at.format("%Y-%m-%d %H:%M:%S"),
            error
        );
        let result = match self.file.lock() {
            Ok(mut file) => file.write_all(line.as_bytes()),
            Err(poisoned) => poisoned.into_inner().write_all(line.as_bytes()),
        };
        if let Err(e) = result {
            tracing::error!(erst_id = %item.erst_id, error = %e, "Could not append to error log");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tempfile::tempdir;

    #[test]
    fn records_one_line_per_failure() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("errors.log");
        let log = ErrorLog::open(&path).unwrap();

        let ts = NaiveDate::from_ymd_opt(2016, 3, 1)
            .unwrap()
            .and_hms_opt(8, 0, 0)
            .unwrap();
        let item = WorkItem {
            cvr: None,
            published_at: ts,
            document_url: "http://docs.example/doc.xml".to_string(),
            extension_url: None,
            erst_id: "erst-err".to_string(),
            loaded_at: ts,
        };
        log.record(&item, &ItemError::InputData("status 404".to_string()));
        log.record(&item, &ItemError::Transform("bad xml".to_string()));

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("erst-err\t-\t2016-03-01 08:00:00\t"));
        assert!(lines[0].contains("status 404"));
        assert!(lines[1].contains("bad xml"));
    }
}
