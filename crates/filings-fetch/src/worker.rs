//! Worker loop and per-item state machine
//!
//! Each worker owns a fresh HTTP client and an explicit sink handle, takes
//! items from the shared queue one lock acquisition at a time, and runs each
//! through fetch → transform → insert. Every per-item failure is absorbed:
//! it lands in the error log and the loop moves on. A worker exits only when
//! it dequeues its end-of-stream marker.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use filings_common::types::{QueueMessage, WorkItem};

use crate::download::Downloader;
use crate::error::ItemError;
use crate::error_log::ErrorLog;
use crate::queue::{QueueError, SharedQueue};
use crate::sink::StatementSink;
use crate::transform::FilingTransformer;

/// Terminal state of one processed item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    Inserted,
    /// Already persisted; the idempotency gate (or the unique constraint)
    /// short-circuited the write.
    Skipped,
    Failed,
}

/// Per-worker tallies, summed by the pipeline at the end of the run.
#[derive(Debug, Default, Clone, Copy)]
pub struct WorkerStats {
    pub inserted: u64,
    pub skipped: u64,
    pub failed: u64,
}

impl WorkerStats {
    fn tally(&mut self, outcome: ItemOutcome) {
        match outcome {
            ItemOutcome::Inserted => self.inserted += 1,
            ItemOutcome::Skipped => self.skipped += 1,
            ItemOutcome::Failed => self.failed += 1,
        }
    }
}

pub struct Worker<S, T> {
    id: usize,
    queue: SharedQueue,
    sink: Arc<S>,
    transformer: Arc<T>,
    downloader: Downloader,
    error_log: Arc<ErrorLog>,
    backoff: Duration,
}

impl<S, T> Worker<S, T>
where
    S: StatementSink,
    T: FilingTransformer,
{
    pub fn new(
        id: usize,
        queue: SharedQueue,
        sink: Arc<S>,
        transformer: Arc<T>,
        error_log: Arc<ErrorLog>,
        backoff: Duration,
    ) -> Self {
        Self {
            id,
            queue,
            sink,
            transformer,
            // Each worker gets its own client; connections are never shared
            // across workers.
            downloader: Downloader::new(),
            error_log,
            backoff,
        }
    }

    /// Run until the end-of-stream marker arrives.
    pub async fn run(self) -> Result<WorkerStats, QueueError> {
        let mut stats = WorkerStats::default();
        loop {
            // Lock is held for the size-check + dequeue only; everything
            // else below runs with the queue released.
            let message = match self.queue.try_get().await? {
                Some(message) => message,
                None => {
                    tokio::time::sleep(self.backoff).await;
                    continue;
                },
            };

            match message {
                QueueMessage::EndOfStream => {
                    info!(worker = self.id, "End-of-stream marker received");
                    break;
                },
                QueueMessage::Item(item) => {
                    let outcome = self.process(&item).await;
                    stats.tally(outcome);
                    debug!(
                        worker = self.id,
                        erst_id = %item.erst_id,
                        outcome = ?outcome,
                        "Item finished"
                    );
                },
            }
        }
        info!(
            worker = self.id,
            inserted = stats.inserted,
            skipped = stats.skipped,
            failed = stats.failed,
            "Worker terminated"
        );
        Ok(stats)
    }

    /// Queued → Fetching → Transforming → {Inserted | Skipped | Failed}.
    async fn process(&self, item: &WorkItem) -> ItemOutcome {
        if item.cvr.is_none() {
            // Known at the source (e.g. Greenland companies); observability
            // only, the item is still processed.
            warn!(erst_id = %item.erst_id, "Filing has no cvr number");
        }

        // Gate before fetch: a membership probe is far cheaper than a
        // download.
        match self.sink.contains(&item.erst_id).await {
            Ok(true) => {
                debug!(erst_id = %item.erst_id, "Already persisted, skipping");
                return ItemOutcome::Skipped;
            },
            Ok(false) => {},
            Err(e) => return self.fail(item, e),
        }

        let fetched = match self.downloader.fetch(item).await {
            Ok(fetched) => fetched,
            Err(e) => return self.fail(item, e),
        };

        let record = match self.transformer.transform(&fetched).await {
            Ok(record) => record,
            Err(e) => return self.fail(item, e),
        };

        match self.sink.insert(&record).await {
            Ok(()) => ItemOutcome::Inserted,
            Err(ItemError::Duplicate) => {
                debug!(erst_id = %item.erst_id, "Lost insert race, skipping");
                ItemOutcome::Skipped
            },
            Err(e) => self.fail(item, e),
        }
    }

    fn fail(&self, item: &WorkItem, error: ItemError) -> ItemOutcome {
        error!(
            worker = self.id,
            erst_id = %item.erst_id,
            cvr = ?item.cvr,
            error = %error,
            "Item failed"
        );
        self.error_log.record(item, &error);
        ItemOutcome::Failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::IoQueue;
    use crate::transform::XbrlTransformer;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use filings_common::types::FinancialStatementRecord;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::tempdir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const MINIMAL_XBRL: &str = r#"<xbrli:xbrl xmlns:xbrli="http://www.xbrl.org/2003/instance" xmlns:fsa="http://xbrl.dcca.dk/fsa">
  <xbrli:context id="c"><xbrli:period><xbrli:instant>2015-12-31</xbrli:instant></xbrli:period></xbrli:context>
  <fsa:Equity contextRef="c">42</fsa:Equity>
</xbrli:xbrl>"#;

    /// In-memory sink: a map keyed by erst_id behind a mutex.
    #[derive(Default)]
    struct MemorySink {
        records: Mutex<HashMap<String, FinancialStatementRecord>>,
    }

    impl MemorySink {
        fn ids(&self) -> Vec<String> {
            let mut ids: Vec<String> = self.records.lock().unwrap().keys().cloned().collect();
            ids.sort();
            ids
        }
    }

    #[async_trait]
    impl StatementSink for MemorySink {
        async fn contains(&self, erst_id: &str) -> Result<bool, ItemError> {
            Ok(self.records.lock().unwrap().contains_key(erst_id))
        }

        async fn insert(&self, record: &FinancialStatementRecord) -> Result<(), ItemError> {
            let mut records = self.records.lock().unwrap();
            if records.contains_key(&record.erst_id) {
                return Err(ItemError::Duplicate);
            }
            records.insert(record.erst_id.clone(), record.clone());
            Ok(())
        }
    }

    fn item(erst_id: &str, document_url: String) -> WorkItem {
        let ts = NaiveDate::from_ymd_opt(2016, 3, 1)
            .unwrap()
            .and_hms_opt(8, 0, 0)
            .unwrap();
        WorkItem {
            cvr: Some(10403782),
            published_at: ts,
            document_url,
            extension_url: None,
            erst_id: erst_id.to_string(),
            loaded_at: ts,
        }
    }

    struct Fixture {
        queue: SharedQueue,
        sink: Arc<MemorySink>,
        error_log: Arc<ErrorLog>,
        error_log_path: std::path::PathBuf,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let queue = SharedQueue::new(IoQueue::create(dir.path().join("queue.log"), 4).unwrap());
        let error_log_path = dir.path().join("errors.log");
        let error_log = Arc::new(ErrorLog::open(&error_log_path).unwrap());
        Fixture {
            queue,
            sink: Arc::new(MemorySink::default()),
            error_log,
            error_log_path,
            _dir: dir,
        }
    }

    fn worker(fx: &Fixture, id: usize) -> Worker<MemorySink, XbrlTransformer> {
        Worker::new(
            id,
            fx.queue.clone(),
            fx.sink.clone(),
            Arc::new(XbrlTransformer::new()),
            fx.error_log.clone(),
            Duration::from_millis(10),
        )
    }

    async fn mount_document(server: &MockServer, doc_path: &str) {
        Mock::given(method("GET"))
            .and(path(doc_path.to_string()))
            .respond_with(ResponseTemplate::new(200).set_body_string(MINIMAL_XBRL))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn termination_distributes_items_without_loss_or_duplication() {
        let server = MockServer::start().await;
        for name in ["a", "b", "c"] {
            mount_document(&server, &format!("/{}.xml", name)).await;
        }

        let fx = fixture();
        for name in ["a", "b", "c"] {
            fx.queue
                .put(QueueMessage::Item(item(
                    &format!("erst-{}", name),
                    format!("{}/{}.xml", server.uri(), name),
                )))
                .await
                .unwrap();
        }
        // One marker per worker, strictly after every real item.
        fx.queue.put(QueueMessage::EndOfStream).await.unwrap();
        fx.queue.put(QueueMessage::EndOfStream).await.unwrap();

        let first = tokio::spawn(worker(&fx, 0).run());
        let second = tokio::spawn(worker(&fx, 1).run());
        let first = first.await.unwrap().unwrap();
        let second = second.await.unwrap().unwrap();

        assert_eq!(first.inserted + second.inserted, 3);
        assert_eq!(first.failed + second.failed, 0);
        assert_eq!(fx.sink.ids(), vec!["erst-a", "erst-b", "erst-c"]);
        assert_eq!(fx.queue.size().await, 0);
    }

    #[tokio::test]
    async fn duplicate_erst_id_is_skipped_not_reinserted() {
        let server = MockServer::start().await;
        mount_document(&server, "/dup.xml").await;

        let fx = fixture();
        let url = format!("{}/dup.xml", server.uri());
        fx.queue
            .put(QueueMessage::Item(item("erst-dup", url.clone())))
            .await
            .unwrap();
        fx.queue
            .put(QueueMessage::Item(item("erst-dup", url)))
            .await
            .unwrap();
        fx.queue.put(QueueMessage::EndOfStream).await.unwrap();

        let stats = worker(&fx, 0).run().await.unwrap();
        assert_eq!(stats.inserted, 1);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.failed, 0);
        assert_eq!(fx.sink.ids(), vec!["erst-dup"]);
    }

    #[tokio::test]
    async fn failed_fetch_does_not_block_the_next_item() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/bad.xml"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        mount_document(&server, "/good.xml").await;

        let fx = fixture();
        fx.queue
            .put(QueueMessage::Item(item(
                "erst-bad",
                format!("{}/bad.xml", server.uri()),
            )))
            .await
            .unwrap();
        fx.queue
            .put(QueueMessage::Item(item(
                "erst-good",
                format!("{}/good.xml", server.uri()),
            )))
            .await
            .unwrap();
        fx.queue.put(QueueMessage::EndOfStream).await.unwrap();

        let stats = worker(&fx, 0).run().await.unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.inserted, 1);
        assert_eq!(fx.sink.ids(), vec!["erst-good"]);

        let errors = std::fs::read_to_string(&fx.error_log_path).unwrap();
        assert!(errors.contains("erst-bad"));
        assert!(!errors.contains("erst-good"));
    }

    #[tokio::test]
    async fn undecodable_document_fails_item_and_continues() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/garbage.xml"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<xbrl><unclosed>"))
            .mount(&server)
            .await;

        let fx = fixture();
        fx.queue
            .put(QueueMessage::Item(item(
                "erst-garbage",
                format!("{}/garbage.xml", server.uri()),
            )))
            .await
            .unwrap();
        fx.queue.put(QueueMessage::EndOfStream).await.unwrap();

        let stats = worker(&fx, 0).run().await.unwrap();
        assert_eq!(stats.failed, 1);
        assert!(fx.sink.ids().is_empty());
    }
}
