//! Filing downloads
//!
//! Fetches the primary XBRL instance document and, when the filing has one,
//! the taxonomy-extension archive. Every failure here is an
//! [`ItemError::InputData`]: the item fails, the pipeline continues.

use tracing::debug;

use filings_common::types::WorkItem;

use crate::error::ItemError;

/// A work item together with its downloaded payloads.
pub struct FetchedFiling {
    pub item: WorkItem,
    /// The XBRL instance document.
    pub document: String,
    /// Raw bytes of the taxonomy-extension zip, when present.
    pub extension: Option<Vec<u8>>,
}

/// Downloader with its own HTTP client.
///
/// Each worker constructs its own; clients are never shared between workers.
pub struct Downloader {
    http: reqwest::Client,
}

impl Downloader {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }

    /// Download everything the item references.
    pub async fn fetch(&self, item: &WorkItem) -> Result<FetchedFiling, ItemError> {
        let document = self.fetch_document(&item.document_url).await?;
        let extension = match &item.extension_url {
            Some(url) => Some(self.fetch_extension(url).await?),
            None => None,
        };
        debug!(
            erst_id = %item.erst_id,
            document_bytes = document.len(),
            has_extension = extension.is_some(),
            "Filing downloaded"
        );
        Ok(FetchedFiling {
            item: item.clone(),
            document,
            extension,
        })
    }

    async fn fetch_document(&self, url: &str) -> Result<String, ItemError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| ItemError::InputData(format!("request to {} failed: {}", url, e)))?;
        if !response.status().is_success() {
            return Err(ItemError::InputData(format!(
                "{} returned status {}",
                url,
                response.status()
            )));
        }
        response
            .text()
            .await
            .map_err(|e| ItemError::InputData(format!("undecodable body from {}: {}", url, e)))
    }

    async fn fetch_extension(&self, url: &str) -> Result<Vec<u8>, ItemError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| ItemError::InputData(format!("request to {} failed: {}", url, e)))?;
        if !response.status().is_success() {
            return Err(ItemError::InputData(format!(
                "{} returned status {}",
                url,
                response.status()
            )));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ItemError::InputData(format!("undecodable body from {}: {}", url, e)))?;
        Ok(bytes.to_vec())
    }
}

impl Default for Downloader {
    fn default() -> Self {
        Self::new()
    }
}
