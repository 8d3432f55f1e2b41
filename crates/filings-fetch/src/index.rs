//! Index source client
//!
//! Scrolls the registry's disclosure index (an Elasticsearch-style feed),
//! filtered by publication timestamp and sorted ascending on it, and maps
//! each hit to a [`WorkItem`]. Hits without a primary annual-report XML
//! attachment are dropped silently; any transport or decode failure is fatal
//! to the enumeration.

use std::collections::VecDeque;

use chrono::NaiveDateTime;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use filings_common::types::{parse_index_timestamp, WorkItem};

use crate::config::IndexConfig;
use crate::error::IndexError;

const SCROLL_TTL: &str = "5m";

/// Classification of one index attachment.
///
/// The source tags attachments with free-form MIME and document-type
/// strings; everything this pipeline cares about is this closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentKind {
    /// `application/xml` tagged as an annual report: the primary filing.
    AnnualReportXml,
    /// `application/zip`: the optional taxonomy-extension archive.
    TaxonomyExtensionZip,
    Other,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Attachment {
    #[serde(rename = "dokumentUrl")]
    pub url: String,
    #[serde(rename = "dokumentMimeType")]
    pub mime_type: String,
    #[serde(rename = "dokumentType")]
    pub document_type: String,
}

impl Attachment {
    pub fn kind(&self) -> AttachmentKind {
        let mime = self.mime_type.to_lowercase();
        match mime.as_str() {
            "application/xml" if self.document_type.to_lowercase() == "aarsrapport" => {
                AttachmentKind::AnnualReportXml
            },
            "application/zip" => AttachmentKind::TaxonomyExtensionZip,
            _ => AttachmentKind::Other,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Disclosure {
    #[serde(rename = "cvrNummer")]
    cvr: Option<i64>,
    #[serde(rename = "offentliggoerelsesTidspunkt")]
    published_at: String,
    #[serde(rename = "indlaesningsTidspunkt")]
    loaded_at: String,
    #[serde(rename = "dokumenter", default)]
    documents: Vec<Attachment>,
}

#[derive(Debug, Deserialize)]
struct Hit {
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "_source")]
    source: Disclosure,
}

#[derive(Debug, Deserialize)]
struct HitsEnvelope {
    hits: Vec<Hit>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(rename = "_scroll_id")]
    scroll_id: Option<String>,
    hits: HitsEnvelope,
}

/// Client for the disclosure index.
pub struct IndexClient {
    http: reqwest::Client,
    base_url: String,
    index: String,
    page_size: usize,
}

impl IndexClient {
    pub fn new(config: &IndexConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            index: config.index.clone(),
            page_size: config.page_size,
        }
    }

    /// Start a scan of all disclosures published at or after `from_date`,
    /// ascending by publication timestamp.
    pub async fn scan(&self, from_date: NaiveDateTime) -> Result<IndexScan<'_>, IndexError> {
        let url = format!(
            "{}/{}/_search?scroll={}",
            self.base_url, self.index, SCROLL_TTL
        );
        let body = json!({
            "size": self.page_size,
            "sort": ["offentliggoerelsesTidspunkt"],
            "query": {
                "range": {
                    "offentliggoerelsesTidspunkt": {
                        "gte": from_date.format("%Y-%m-%dT%H:%M:%S").to_string()
                    }
                }
            }
        });
        let response = self.search(&url, &body).await?;
        Ok(IndexScan {
            client: self,
            scroll_id: response.scroll_id,
            pending: response.hits.hits.into(),
            exhausted: false,
        })
    }

    async fn next_page(&self, scroll_id: &str) -> Result<SearchResponse, IndexError> {
        let url = format!("{}/_search/scroll", self.base_url);
        let body = json!({ "scroll": SCROLL_TTL, "scroll_id": scroll_id });
        self.search(&url, &body).await
    }

    async fn search(
        &self,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<SearchResponse, IndexError> {
        let response = self.http.post(url).json(body).send().await?;
        if !response.status().is_success() {
            return Err(IndexError::Status {
                status: response.status(),
                url: url.to_string(),
            });
        }
        let bytes = response.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// An in-progress scroll over the index.
pub struct IndexScan<'a> {
    client: &'a IndexClient,
    scroll_id: Option<String>,
    pending: VecDeque<Hit>,
    exhausted: bool,
}

impl IndexScan<'_> {
    /// Next enumerated filing, or `None` when the index is exhausted.
    ///
    /// Hits without a primary annual-report document are skipped here, not
    /// surfaced as errors.
    pub async fn next_item(&mut self) -> Result<Option<WorkItem>, IndexError> {
        loop {
            if let Some(hit) = self.pending.pop_front() {
                match map_hit(hit)? {
                    Some(item) => return Ok(Some(item)),
                    None => continue,
                }
            }
            if self.exhausted {
                return Ok(None);
            }
            let Some(scroll_id) = self.scroll_id.clone() else {
                self.exhausted = true;
                return Ok(None);
            };
            let page = self.client.next_page(&scroll_id).await?;
            if page.hits.hits.is_empty() {
                self.exhausted = true;
                return Ok(None);
            }
            debug!(hits = page.hits.hits.len(), "Fetched index page");
            self.scroll_id = page.scroll_id.or(Some(scroll_id));
            self.pending = page.hits.hits.into();
        }
    }
}

/// Select the primary document and optional extension; `None` when the hit
/// carries no primary filing at all.
fn map_hit(hit: Hit) -> Result<Option<WorkItem>, IndexError> {
    let mut document_url = None;
    let mut extension_url = None;
    for attachment in &hit.source.documents {
        match attachment.kind() {
            AttachmentKind::AnnualReportXml => document_url = Some(attachment.url.clone()),
            AttachmentKind::TaxonomyExtensionZip => extension_url = Some(attachment.url.clone()),
            AttachmentKind::Other => {},
        }
    }
    let Some(document_url) = document_url else {
        return Ok(None);
    };

    let published_at = parse_index_timestamp(&hit.source.published_at)
        .map_err(|e| IndexError::Payload(format!("hit {}: {}", hit.id, e)))?;
    let loaded_at = parse_index_timestamp(&hit.source.loaded_at)
        .map_err(|e| IndexError::Payload(format!("hit {}: {}", hit.id, e)))?;

    Ok(Some(WorkItem {
        cvr: hit.source.cvr,
        published_at,
        document_url,
        extension_url,
        erst_id: hit.id,
        loaded_at,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn hit(id: &str, docs: serde_json::Value) -> serde_json::Value {
        json!({
            "_id": id,
            "_source": {
                "cvrNummer": 10403782,
                "offentliggoerelsesTidspunkt": "2016-03-01T08:00:00.000+01:00",
                "indlaesningsTidspunkt": "2016-03-01T08:30:00.000+01:00",
                "dokumenter": docs,
            }
        })
    }

    fn xml_doc(url: &str) -> serde_json::Value {
        json!({
            "dokumentUrl": url,
            "dokumentMimeType": "application/xml",
            "dokumentType": "AARSRAPPORT",
        })
    }

    #[test]
    fn attachment_classification_is_case_insensitive() {
        let primary = Attachment {
            url: "u".into(),
            mime_type: "Application/XML".into(),
            document_type: "AarsRapport".into(),
        };
        assert_eq!(primary.kind(), AttachmentKind::AnnualReportXml);

        let extension = Attachment {
            url: "u".into(),
            mime_type: "application/zip".into(),
            document_type: "whatever".into(),
        };
        assert_eq!(extension.kind(), AttachmentKind::TaxonomyExtensionZip);

        let pdf = Attachment {
            url: "u".into(),
            mime_type: "application/pdf".into(),
            document_type: "AARSRAPPORT".into(),
        };
        assert_eq!(pdf.kind(), AttachmentKind::Other);
    }

    #[tokio::test]
    async fn scan_maps_hits_and_follows_scroll() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/offentliggoerelser/_search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "_scroll_id": "scroll-1",
                "hits": { "hits": [
                    hit("erst-1", json!([xml_doc("http://docs.example/1.xml")])),
                    // No primary document: dropped silently.
                    hit("erst-2", json!([{
                        "dokumentUrl": "http://docs.example/2.pdf",
                        "dokumentMimeType": "application/pdf",
                        "dokumentType": "aarsrapport",
                    }])),
                ] }
            })))
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/_search/scroll"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "_scroll_id": "scroll-1",
                "hits": { "hits": [] }
            })))
            .mount(&server)
            .await;

        let config = IndexConfig {
            base_url: server.uri(),
            index: "offentliggoerelser".to_string(),
            page_size: 100,
        };
        let client = IndexClient::new(&config);
        let from = parse_index_timestamp("2011-01-01T00:00:00.000+01:00").unwrap();
        let mut scan = client.scan(from).await.unwrap();

        let first = scan.next_item().await.unwrap().unwrap();
        assert_eq!(first.erst_id, "erst-1");
        assert_eq!(first.cvr, Some(10403782));
        assert_eq!(first.document_url, "http://docs.example/1.xml");
        assert_eq!(first.extension_url, None);

        assert!(scan.next_item().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn scan_surfaces_http_failure_as_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/offentliggoerelser/_search"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let config = IndexConfig {
            base_url: server.uri(),
            index: "offentliggoerelser".to_string(),
            page_size: 100,
        };
        let client = IndexClient::new(&config);
        let from = parse_index_timestamp("2011-01-01T00:00:00.000+01:00").unwrap();
        match client.scan(from).await {
            Err(IndexError::Status { status, .. }) => assert_eq!(status.as_u16(), 503),
            other => panic!("expected status error, got {:?}", other.err()),
        }
    }

    #[tokio::test]
    async fn hit_with_extension_keeps_both_urls() {
        let raw = hit(
            "erst-3",
            json!([
                xml_doc("http://docs.example/3.xml"),
                {
                    "dokumentUrl": "http://docs.example/3.zip",
                    "dokumentMimeType": "application/zip",
                    "dokumentType": "andet",
                }
            ]),
        );
        let parsed: Hit = serde_json::from_value(raw).unwrap();
        let item = map_hit(parsed).unwrap().unwrap();
        assert_eq!(item.extension_url.as_deref(), Some("http://docs.example/3.zip"));
    }
}
