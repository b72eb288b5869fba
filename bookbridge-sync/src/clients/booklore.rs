//! Booklore client
//!
//! Token-authenticated REST API with a bulk book listing. Also serves as
//! the fallback source of epub files: books not present under the books
//! folder are downloaded into the epub cache.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bookbridge_common::db::models::{ClientStateRow, Mapping};
use serde_json::{json, Value};
use tracing::{debug, info};

use super::{
    classify_status, BulkStates, ClientError, ClientName, ClientState, ErrorKind, Position,
    SyncClient, SyncOutcome, UpdateRequest,
};
use crate::ebook::EbookCache;

pub struct BookloreSyncClient {
    base_url: String,
    token: String,
    http: reqwest::Client,
    ebooks: Arc<EbookCache>,
}

impl BookloreSyncClient {
    pub fn new(
        base_url: String,
        token: String,
        timeout: Duration,
        ebooks: Arc<EbookCache>,
    ) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ClientError::new(ErrorKind::Fatal, e.to_string()))?;
        Ok(BookloreSyncClient {
            base_url,
            token,
            http,
            ebooks,
        })
    }

    async fn list_books(&self) -> Result<Vec<Value>, ClientError> {
        let url = format!("{}/api/v1/books", self.base_url);
        let response = self.http.get(&url).bearer_auth(&self.token).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::new(
                classify_status(status),
                format!("book list returned {status}"),
            ));
        }
        Ok(response.json().await?)
    }

    pub async fn search_books(&self, title: &str) -> Result<Vec<Value>, ClientError> {
        let books = self.list_books().await?;
        let needle = title.to_lowercase();
        Ok(books
            .into_iter()
            .filter(|b| {
                b.get("title")
                    .and_then(|t| t.as_str())
                    .map(|t| t.to_lowercase().contains(&needle))
                    .unwrap_or(false)
            })
            .collect())
    }

    /// Download an epub into the cache for parsing
    pub async fn download_book(&self, booklore_id: i64) -> Result<Vec<u8>, ClientError> {
        let url = format!("{}/api/v1/books/{}/download", self.base_url, booklore_id);
        let response = self.http.get(&url).bearer_auth(&self.token).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::new(
                classify_status(status),
                format!("book download returned {status}"),
            ));
        }
        Ok(response.bytes().await?.to_vec())
    }

    fn state_from_book(book: &Value) -> Option<ClientState> {
        let progress = book.get("epubProgress")?;
        let percentage = progress.get("percentage")?.as_f64()?;
        let cfi = progress.get("cfi").and_then(|v| v.as_str()).map(String::from);
        // Booklore reports millisecond epoch timestamps
        let last_updated = progress
            .get("lastReadTime")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0)
            / 1000.0;

        Some(ClientState {
            last_updated,
            position: Position::Text {
                percentage: percentage / 100.0,
                xpath: None,
                css_selector: None,
                fragment: None,
                cfi,
            },
        })
    }
}

#[async_trait]
impl SyncClient for BookloreSyncClient {
    fn name(&self) -> ClientName {
        ClientName::Booklore
    }

    fn is_configured(&self) -> bool {
        !self.base_url.is_empty() && !self.token.is_empty()
    }

    async fn fetch_state(
        &self,
        mapping: &Mapping,
        _prev: Option<&ClientStateRow>,
        bulk: Option<&BulkStates>,
    ) -> Result<Option<ClientState>, ClientError> {
        let Some(booklore_id) = mapping.booklore_id else {
            return Ok(None);
        };

        if let Some(bulk) = bulk {
            let Some(filename) = &mapping.ebook_filename else {
                return Ok(None);
            };
            return Ok(bulk.get(filename).and_then(Self::state_from_book));
        }

        let url = format!("{}/api/v1/books/{}", self.base_url, booklore_id);
        let response = self.http.get(&url).bearer_auth(&self.token).send().await?;
        match response.status() {
            s if s.is_success() => {
                let book: Value = response.json().await?;
                Ok(Self::state_from_book(&book))
            }
            reqwest::StatusCode::NOT_FOUND => Ok(None),
            s => Err(ClientError::new(
                classify_status(s),
                format!("book fetch returned {s}"),
            )),
        }
    }

    async fn fetch_bulk(&self) -> Result<Option<BulkStates>, ClientError> {
        // Keyed by filename; mappings look their entry up via ebook_filename
        let books = self.list_books().await?;
        let mut bulk = BulkStates::new();
        for book in books {
            if let Some(filename) = book.get("fileName").and_then(|v| v.as_str()) {
                bulk.insert(filename.to_string(), book.clone());
            }
        }
        debug!(books = bulk.len(), "Fetched Booklore book listing");
        Ok(Some(bulk))
    }

    async fn update(
        &self,
        mapping: &Mapping,
        request: &UpdateRequest,
    ) -> Result<SyncOutcome, ClientError> {
        let Some(booklore_id) = mapping.booklore_id else {
            return Err(ClientError::new(
                ErrorKind::NotConfigured,
                "mapping has no booklore id",
            ));
        };

        let url = format!("{}/api/v1/books/{}/progress", self.base_url, booklore_id);
        let body = json!({
            "percentage": request.locator.percentage * 100.0,
            "cfi": request.locator.cfi,
        });

        let response = self
            .http
            .put(&url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() && status != reqwest::StatusCode::CONFLICT {
            return Err(ClientError::new(
                classify_status(status),
                format!("progress update returned {status}"),
            ));
        }

        info!(
            book_id = %mapping.book_id,
            pct = request.locator.percentage,
            "Updated Booklore position"
        );

        Ok(SyncOutcome {
            percentage: Some(request.locator.percentage),
            timestamp: None,
            locator_json: serde_json::to_string(&body).ok(),
        })
    }

    async fn text_at(
        &self,
        mapping: &Mapping,
        state: &ClientState,
    ) -> Result<Option<String>, ClientError> {
        let Some(filename) = &mapping.ebook_filename else {
            return Ok(None);
        };
        let Position::Text { percentage, .. } = &state.position else {
            return Ok(None);
        };
        let parsed = self
            .ebooks
            .get(filename)
            .map_err(|e| ClientError::new(ErrorKind::NotFound, e.to_string()))?;
        Ok(parsed.text_at_percentage(*percentage))
    }

    async fn check_connection(&self) -> Result<(), ClientError> {
        self.list_books().await.map(|_| ())
    }
}
