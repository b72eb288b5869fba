//! Storyteller client
//!
//! Token-authenticated REST API. Position writes are idempotent: 2xx,
//! 204 and 409 all count as success, so replays during reconnects never
//! surface as errors.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bookbridge_common::db::models::{ClientStateRow, Mapping};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use super::{
    classify_status, BulkStates, ClientError, ClientName, ClientState, ErrorKind, Position,
    SyncClient, SyncOutcome, UpdateRequest,
};
use crate::ebook::EbookCache;

pub struct StorytellerSyncClient {
    base_url: String,
    username: String,
    password: String,
    http: reqwest::Client,
    token: Mutex<Option<String>>,
    ebooks: Arc<EbookCache>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct PositionResponse {
    #[serde(default)]
    locator: Option<StorytellerLocator>,
    /// Milliseconds since epoch
    #[serde(default)]
    timestamp: f64,
}

#[derive(Debug, Deserialize)]
struct StorytellerLocator {
    #[serde(default)]
    locations: Locations,
    #[serde(default)]
    fragments: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Locations {
    #[serde(default)]
    progression: Option<f64>,
    #[serde(rename = "totalProgression", default)]
    total_progression: Option<f64>,
}

impl StorytellerSyncClient {
    pub fn new(
        base_url: String,
        username: String,
        password: String,
        timeout: Duration,
        ebooks: Arc<EbookCache>,
    ) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ClientError::new(ErrorKind::Fatal, e.to_string()))?;
        Ok(StorytellerSyncClient {
            base_url,
            username,
            password,
            http,
            token: Mutex::new(None),
            ebooks,
        })
    }

    async fn ensure_token(&self) -> Result<String, ClientError> {
        if let Some(token) = self.token.lock().clone() {
            return Ok(token);
        }

        let url = format!("{}/api/token", self.base_url);
        let response = self
            .http
            .post(&url)
            .form(&[("username", &self.username), ("password", &self.password)])
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::new(
                classify_status(status),
                format!("token request returned {status}"),
            ));
        }

        let token: TokenResponse = response.json().await?;
        *self.token.lock() = Some(token.access_token.clone());
        debug!("Storyteller token acquired");
        Ok(token.access_token)
    }

    /// Drop the cached token so the next call re-authenticates
    fn clear_token(&self) {
        *self.token.lock() = None;
    }

    async fn get_position(&self, uuid: &str) -> Result<Option<PositionResponse>, ClientError> {
        let token = self.ensure_token().await?;
        let url = format!("{}/api/v2/books/{}/positions", self.base_url, uuid);
        let response = self.http.get(&url).bearer_auth(&token).send().await?;

        match response.status() {
            s if s.is_success() => Ok(Some(response.json().await?)),
            reqwest::StatusCode::NOT_FOUND => Ok(None),
            reqwest::StatusCode::UNAUTHORIZED | reqwest::StatusCode::FORBIDDEN => {
                self.clear_token();
                Err(ClientError::new(ErrorKind::Unauthorized, "token rejected"))
            }
            s => Err(ClientError::new(
                classify_status(s),
                format!("position fetch returned {s}"),
            )),
        }
    }
}

#[async_trait]
impl SyncClient for StorytellerSyncClient {
    fn name(&self) -> ClientName {
        ClientName::Storyteller
    }

    fn is_configured(&self) -> bool {
        !self.base_url.is_empty() && !self.username.is_empty()
    }

    async fn fetch_state(
        &self,
        mapping: &Mapping,
        _prev: Option<&ClientStateRow>,
        _bulk: Option<&BulkStates>,
    ) -> Result<Option<ClientState>, ClientError> {
        let Some(uuid) = &mapping.storyteller_uuid else {
            return Ok(None);
        };

        let Some(position) = self.get_position(uuid).await? else {
            return Ok(None);
        };

        let Some(locator) = position.locator else {
            return Ok(None);
        };
        let pct = locator
            .locations
            .total_progression
            .or(locator.locations.progression)
            .unwrap_or(0.0);

        Ok(Some(ClientState {
            last_updated: position.timestamp / 1000.0,
            position: Position::Text {
                percentage: pct,
                xpath: None,
                css_selector: None,
                fragment: locator.fragments.first().cloned(),
                cfi: None,
            },
        }))
    }

    async fn update(
        &self,
        mapping: &Mapping,
        request: &UpdateRequest,
    ) -> Result<SyncOutcome, ClientError> {
        let Some(uuid) = &mapping.storyteller_uuid else {
            return Err(ClientError::new(
                ErrorKind::NotConfigured,
                "mapping has no storyteller uuid",
            ));
        };

        let token = self.ensure_token().await?;
        let url = format!("{}/api/v2/books/{}/positions", self.base_url, uuid);

        let fragments: Vec<String> = request.locator.fragment.iter().cloned().collect();
        let body = json!({
            "uuid": uuid,
            "progression": request.locator.percentage,
            "fragments": fragments,
        });

        let response = self
            .http
            .put(&url)
            .bearer_auth(&token)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let ok = status.is_success()
            || status == reqwest::StatusCode::NO_CONTENT
            || status == reqwest::StatusCode::CONFLICT;
        if !ok {
            if status == reqwest::StatusCode::UNAUTHORIZED {
                self.clear_token();
            }
            return Err(ClientError::new(
                classify_status(status),
                format!("position update returned {status}"),
            ));
        }

        info!(
            book_id = %mapping.book_id,
            pct = request.locator.percentage,
            "Updated Storyteller position"
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
        self.ensure_token().await.map(|_| ())
    }
}
