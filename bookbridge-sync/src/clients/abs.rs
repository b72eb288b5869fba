//! Audiobookshelf client
//!
//! The audiobook source of truth. Progress is read and written in seconds
//! of audio; bulk state comes from the authenticated `/api/me` snapshot so
//! a full cycle costs one request instead of one per book.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bookbridge_common::db::models::{ClientStateRow, Mapping, SyncMode};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::{
    classify_status, BulkStates, ClientError, ClientName, ClientState, ErrorKind, Position,
    SyncClient, SyncOutcome, UpdateRequest,
};
use crate::transcript::TranscriptStore;

/// Raw REST client for the Audiobookshelf API
pub struct AbsClient {
    base_url: String,
    token: String,
    http: reqwest::Client,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AbsProgress {
    #[serde(rename = "currentTime", default)]
    pub current_time: f64,
    #[serde(default)]
    pub duration: f64,
    /// Milliseconds since epoch
    #[serde(rename = "lastUpdate", default)]
    pub last_update: f64,
    #[serde(rename = "isFinished", default)]
    pub is_finished: bool,
}

#[derive(Debug, Deserialize)]
struct AbsMe {
    #[serde(rename = "mediaProgress", default)]
    media_progress: Vec<Value>,
}

impl AbsClient {
    pub fn new(base_url: String, token: String, timeout: Duration) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ClientError::new(ErrorKind::Fatal, e.to_string()))?;
        Ok(AbsClient {
            base_url,
            token,
            http,
        })
    }

    pub fn is_configured(&self) -> bool {
        !self.base_url.is_empty() && !self.token.is_empty()
    }

    fn auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.bearer_auth(&self.token)
    }

    pub async fn get_progress(&self, item_id: &str) -> Result<Option<AbsProgress>, ClientError> {
        let url = format!("{}/api/me/progress/{}", self.base_url, item_id);
        let response = self.auth(self.http.get(&url)).send().await?;

        match response.status() {
            s if s.is_success() => Ok(Some(response.json().await?)),
            reqwest::StatusCode::NOT_FOUND => Ok(None),
            s => Err(ClientError::new(
                classify_status(s),
                format!("progress fetch returned {s}"),
            )),
        }
    }

    /// All media progress for the authenticated user, keyed by item id
    pub async fn fetch_all_progress(&self) -> Result<BulkStates, ClientError> {
        let url = format!("{}/api/me", self.base_url);
        let response = self.auth(self.http.get(&url)).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::new(
                classify_status(status),
                format!("/api/me returned {status}"),
            ));
        }

        let me: AbsMe = response.json().await?;
        let mut bulk = BulkStates::new();
        for entry in me.media_progress {
            if let Some(item_id) = entry.get("libraryItemId").and_then(|v| v.as_str()) {
                bulk.insert(item_id.to_string(), entry.clone());
            }
        }
        debug!(items = bulk.len(), "Fetched bulk progress snapshot");
        Ok(bulk)
    }

    pub async fn get_item_details(&self, item_id: &str) -> Result<Option<Value>, ClientError> {
        let url = format!("{}/api/items/{}", self.base_url, item_id);
        let response = self.auth(self.http.get(&url)).send().await?;
        match response.status() {
            s if s.is_success() => Ok(Some(response.json().await?)),
            reqwest::StatusCode::NOT_FOUND => Ok(None),
            s => Err(ClientError::new(
                classify_status(s),
                format!("item fetch returned {s}"),
            )),
        }
    }

    pub async fn update_progress(
        &self,
        item_id: &str,
        current_time: f64,
        time_listened: f64,
    ) -> Result<(), ClientError> {
        let url = format!("{}/api/me/progress/{}", self.base_url, item_id);
        let body = serde_json::json!({
            "currentTime": current_time,
            "timeListened": time_listened,
        });
        let response = self.auth(self.http.patch(&url)).json(&body).send().await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(ClientError::new(
                classify_status(status),
                format!("progress update returned {status}"),
            ))
        }
    }

    /// Download urls for an item's audio files, in track order
    pub async fn audio_files(&self, item_id: &str) -> Result<Vec<AudioFileRef>, ClientError> {
        let Some(item) = self.get_item_details(item_id).await? else {
            return Err(ClientError::new(
                ErrorKind::NotFound,
                format!("item {item_id} not found"),
            ));
        };

        let files = item
            .pointer("/media/audioFiles")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        let mut refs = Vec::with_capacity(files.len());
        for file in files {
            let Some(ino) = file.get("ino").and_then(|v| v.as_str()) else {
                continue;
            };
            let ext = file
                .pointer("/metadata/ext")
                .and_then(|v| v.as_str())
                .unwrap_or(".mp3")
                .to_string();
            let duration = file.get("duration").and_then(|v| v.as_f64()).unwrap_or(0.0);
            refs.push(AudioFileRef {
                url: format!(
                    "{}/api/items/{}/file/{}/download",
                    self.base_url, item_id, ino
                ),
                ext,
                duration,
            });
        }
        Ok(refs)
    }

    /// Stream an audio file to disk for transcription
    pub async fn download_audio(&self, file: &AudioFileRef, dest: &PathBuf) -> Result<(), ClientError> {
        let response = self.auth(self.http.get(&file.url)).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::new(
                classify_status(status),
                format!("audio download returned {status}"),
            ));
        }
        let bytes = response.bytes().await?;
        tokio::fs::write(dest, &bytes)
            .await
            .map_err(|e| ClientError::new(ErrorKind::Fatal, e.to_string()))?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct AudioFileRef {
    pub url: String,
    pub ext: String,
    pub duration: f64,
}

/// Sync adapter over [`AbsClient`]
pub struct AbsSyncClient {
    client: Arc<AbsClient>,
    transcripts: Arc<TranscriptStore>,
    /// Constant correction applied to outgoing timestamps
    progress_offset: f64,
}

impl AbsSyncClient {
    pub fn new(client: Arc<AbsClient>, transcripts: Arc<TranscriptStore>, progress_offset: f64) -> Self {
        AbsSyncClient {
            client,
            transcripts,
            progress_offset,
        }
    }

    fn state_from_progress(
        progress: &AbsProgress,
        mapping: &Mapping,
    ) -> Option<ClientState> {
        if progress.current_time <= 0.0 && !progress.is_finished {
            return None;
        }
        let duration = if progress.duration > 0.0 {
            Some(progress.duration)
        } else {
            mapping.duration_seconds
        };
        Some(ClientState {
            last_updated: progress.last_update / 1000.0,
            position: Position::Audio {
                seconds: progress.current_time,
                duration,
            },
        })
    }
}

#[async_trait]
impl SyncClient for AbsSyncClient {
    fn name(&self) -> ClientName {
        ClientName::Abs
    }

    fn is_configured(&self) -> bool {
        self.client.is_configured()
    }

    fn supports_mode(&self, mode: SyncMode) -> bool {
        mode == SyncMode::Audiobook
    }

    async fn fetch_state(
        &self,
        mapping: &Mapping,
        _prev: Option<&ClientStateRow>,
        bulk: Option<&BulkStates>,
    ) -> Result<Option<ClientState>, ClientError> {
        if let Some(bulk) = bulk {
            let Some(raw) = bulk.get(&mapping.book_id) else {
                return Ok(None);
            };
            let progress: AbsProgress = serde_json::from_value(raw.clone())
                .map_err(|e| ClientError::new(ErrorKind::InvalidData, e.to_string()))?;
            return Ok(Self::state_from_progress(&progress, mapping));
        }

        match self.client.get_progress(&mapping.book_id).await? {
            Some(progress) => Ok(Self::state_from_progress(&progress, mapping)),
            None => Ok(None),
        }
    }

    async fn fetch_bulk(&self) -> Result<Option<BulkStates>, ClientError> {
        Ok(Some(self.client.fetch_all_progress().await?))
    }

    async fn update(
        &self,
        mapping: &Mapping,
        request: &UpdateRequest,
    ) -> Result<SyncOutcome, ClientError> {
        let Some(ts) = request.locator.timestamp else {
            return Err(ClientError::new(
                ErrorKind::InvalidData,
                "no audio timestamp resolved for ABS update",
            ));
        };

        let adjusted = (ts + self.progress_offset).max(0.0);
        if self.progress_offset != 0.0 {
            debug!(ts, adjusted, "Applied progress offset");
        }

        // Previous normalized position gives us the listened span
        let prev_ts = request
            .previous
            .and_then(|pct| mapping.duration_seconds.map(|d| pct * d))
            .unwrap_or(adjusted);
        let time_listened = (adjusted - prev_ts).max(0.0);

        self.client
            .update_progress(&mapping.book_id, adjusted, time_listened)
            .await?;

        info!(book_id = %mapping.book_id, ts = adjusted, "Updated ABS position");

        let pct = mapping
            .duration_seconds
            .filter(|d| *d > 0.0)
            .map(|d| (adjusted / d).clamp(0.0, 1.0));

        Ok(SyncOutcome {
            percentage: pct,
            timestamp: Some(adjusted),
            locator_json: None,
        })
    }

    async fn text_at(
        &self,
        mapping: &Mapping,
        state: &ClientState,
    ) -> Result<Option<String>, ClientError> {
        let Some(ts) = state.audio_seconds() else {
            return Ok(None);
        };
        match self.transcripts.text_at_time(&mapping.book_id, ts) {
            Ok(text) => Ok(text),
            Err(err) => {
                warn!(book_id = %mapping.book_id, %err, "Transcript unavailable for text extraction");
                Ok(None)
            }
        }
    }

    async fn check_connection(&self) -> Result<(), ClientError> {
        let url = format!("{}/api/me", self.client.base_url);
        let response = self
            .client
            .auth(self.client.http.get(&url))
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(ClientError::new(
                classify_status(status),
                format!("/api/me returned {status}"),
            ))
        }
    }
}
