//! Hardcover tracker client
//!
//! Write-only: Hardcover never contributes a position, it just mirrors
//! reading progress and shelf status. Writes are delta-gated against the
//! value we last sent (recorded in the progress store) since the tracker
//! is never read back.

use std::time::Duration;

use async_trait::async_trait;
use bookbridge_common::db::models::{ClientStateRow, Mapping};
use serde_json::{json, Value};
use tracing::{debug, info};

use super::{
    classify_status, BulkStates, ClientError, ClientName, ClientState, ErrorKind, SyncClient,
    SyncOutcome, UpdateRequest,
};

const HARDCOVER_API: &str = "https://api.hardcover.app/v1/graphql";

/// Minimum percentage change before a write goes out
const WRITE_DELTA_MIN: f64 = 0.01;

/// Hardcover shelf statuses
const STATUS_WANT_TO_READ: i64 = 1;
const STATUS_READING: i64 = 2;
const STATUS_READ: i64 = 3;

pub struct HardcoverSyncClient {
    token: String,
    http: reqwest::Client,
}

impl HardcoverSyncClient {
    pub fn new(token: String, timeout: Duration) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ClientError::new(ErrorKind::Fatal, e.to_string()))?;
        Ok(HardcoverSyncClient { token, http })
    }

    async fn graphql(&self, query: &str, variables: Value) -> Result<Value, ClientError> {
        let response = self
            .http
            .post(HARDCOVER_API)
            .bearer_auth(&self.token)
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::new(
                classify_status(status),
                format!("hardcover returned {status}"),
            ));
        }

        let body: Value = response.json().await?;
        if let Some(errors) = body.get("errors") {
            return Err(ClientError::new(
                ErrorKind::InvalidData,
                format!("hardcover errors: {errors}"),
            ));
        }
        Ok(body)
    }

    async fn user_book(&self, book_id: i64) -> Result<Option<Value>, ClientError> {
        let body = self
            .graphql(
                "query ($bookId: Int!) { user_books(where: {book_id: {_eq: $bookId}}) { id status_id } }",
                json!({ "bookId": book_id }),
            )
            .await?;
        Ok(body
            .pointer("/data/user_books/0")
            .cloned())
    }

    async fn set_status(&self, book_id: i64, status: i64, edition_id: Option<i64>) -> Result<(), ClientError> {
        self.graphql(
            "mutation ($bookId: Int!, $status: Int!, $editionId: Int) { \
             insert_user_book(object: {book_id: $bookId, status_id: $status, edition_id: $editionId}) { id } }",
            json!({ "bookId": book_id, "status": status, "editionId": edition_id }),
        )
        .await
        .map(|_| ())
    }

    async fn set_progress(
        &self,
        user_book_id: i64,
        pages: i64,
        edition_id: Option<i64>,
        finished: bool,
    ) -> Result<(), ClientError> {
        self.graphql(
            "mutation ($id: Int!, $pages: Int!, $editionId: Int, $finished: Boolean) { \
             update_user_book_read(id: $id, object: {progress_pages: $pages, edition_id: $editionId, finished: $finished}) { id } }",
            json!({ "id": user_book_id, "pages": pages, "editionId": edition_id, "finished": finished }),
        )
        .await
        .map(|_| ())
    }
}

#[async_trait]
impl SyncClient for HardcoverSyncClient {
    fn name(&self) -> ClientName {
        ClientName::Hardcover
    }

    fn is_configured(&self) -> bool {
        !self.token.is_empty()
    }

    fn can_lead(&self) -> bool {
        // No readable position and no text content to anchor on
        false
    }

    async fn fetch_state(
        &self,
        _mapping: &Mapping,
        _prev: Option<&ClientStateRow>,
        _bulk: Option<&BulkStates>,
    ) -> Result<Option<ClientState>, ClientError> {
        Ok(None)
    }

    async fn update(
        &self,
        mapping: &Mapping,
        request: &UpdateRequest,
    ) -> Result<SyncOutcome, ClientError> {
        let Some(book_id) = mapping.hardcover_book_id else {
            return Err(ClientError::new(
                ErrorKind::NotConfigured,
                "mapping has no hardcover book id",
            ));
        };
        let Some(total_pages) = mapping.hardcover_pages.filter(|p| *p > 0) else {
            debug!(book_id = %mapping.book_id, "Hardcover edition has no page count, skipping");
            return Err(ClientError::new(
                ErrorKind::InvalidData,
                "hardcover edition has no page count",
            ));
        };

        let percentage = request.locator.percentage;

        // Delta-gate against the value we last sent; Hardcover is never
        // read back, so the cached write-time value is the reference.
        if let Some(previous) = request.previous {
            if (percentage - previous).abs() < WRITE_DELTA_MIN {
                debug!(
                    book_id = %mapping.book_id,
                    pct = percentage,
                    previous,
                    "Hardcover delta below 1%, skipping write"
                );
                return Ok(SyncOutcome {
                    percentage: Some(previous),
                    timestamp: None,
                    locator_json: None,
                });
            }
        }

        let user_book = self.user_book(book_id).await?;
        let Some(user_book) = user_book else {
            return Err(ClientError::new(
                ErrorKind::NotFound,
                "book not on any hardcover shelf",
            ));
        };
        let user_book_id = user_book
            .get("id")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| ClientError::new(ErrorKind::InvalidData, "user_book without id"))?;
        let current_status = user_book.get("status_id").and_then(|v| v.as_i64());

        let finished = percentage > 0.99;
        let pages = ((total_pages as f64) * percentage) as i64;

        if finished && current_status != Some(STATUS_READ) {
            self.set_status(book_id, STATUS_READ, mapping.hardcover_edition_id)
                .await?;
            info!(book_id = %mapping.book_id, "Hardcover status promoted to Read");
        } else if percentage > 0.02 && current_status == Some(STATUS_WANT_TO_READ) {
            self.set_status(book_id, STATUS_READING, mapping.hardcover_edition_id)
                .await?;
            info!(book_id = %mapping.book_id, "Hardcover status promoted to Currently Reading");
        }

        self.set_progress(user_book_id, pages, mapping.hardcover_edition_id, finished)
            .await?;

        let actual_pct = (pages as f64 / total_pages as f64).min(1.0);
        info!(
            book_id = %mapping.book_id,
            pages,
            pct = actual_pct,
            "Updated Hardcover progress"
        );

        Ok(SyncOutcome {
            percentage: Some(actual_pct),
            timestamp: None,
            locator_json: None,
        })
    }
}
