//! Client adapter contract
//!
//! Every external service the bridge talks to is a [`SyncClient`]. The
//! engine only sees this trait; wire formats stay inside the adapters.

use std::collections::HashMap;

use async_trait::async_trait;
use bookbridge_common::db::models::{Mapping, SyncMode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod abs;
pub mod booklore;
pub mod hardcover;
pub mod kosync;
pub mod storyteller;

/// The closed set of supported clients
///
/// Declaration order is the deterministic tie-break order for leader
/// election.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientName {
    Abs,
    KoReaderSync,
    Storyteller,
    Booklore,
    Hardcover,
}

impl ClientName {
    pub const ALL: [ClientName; 5] = [
        ClientName::Abs,
        ClientName::KoReaderSync,
        ClientName::Storyteller,
        ClientName::Booklore,
        ClientName::Hardcover,
    ];

    /// Stable lowercase key used in client-state rows and suppression stamps
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientName::Abs => "abs",
            ClientName::KoReaderSync => "kosync",
            ClientName::Storyteller => "storyteller",
            ClientName::Booklore => "booklore",
            ClientName::Hardcover => "hardcover",
        }
    }
}

impl std::fmt::Display for ClientName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ClientName::Abs => "ABS",
            ClientName::KoReaderSync => "KoSync",
            ClientName::Storyteller => "Storyteller",
            ClientName::Booklore => "Booklore",
            ClientName::Hardcover => "Hardcover",
        };
        f.write_str(label)
    }
}

/// A position in a client's native coordinate system
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Position {
    /// Audio-time coordinates (audiobook clients)
    Audio {
        seconds: f64,
        duration: Option<f64>,
    },
    /// Text-position coordinates (ebook clients)
    Text {
        percentage: f64,
        xpath: Option<String>,
        css_selector: Option<String>,
        fragment: Option<String>,
        cfi: Option<String>,
    },
}

/// Fresh progress reported by a client during a cycle
#[derive(Debug, Clone)]
pub struct ClientState {
    /// Wall clock of the client's last change, seconds since epoch
    pub last_updated: f64,
    pub position: Position,
}

impl ClientState {
    /// Normalize to a 0.0–1.0 fraction of the book
    ///
    /// Audio positions need a known duration to contribute; callers must
    /// treat `None` as "cannot participate in comparison".
    pub fn normalized_pct(&self, book_duration: Option<f64>) -> Option<f64> {
        match &self.position {
            Position::Audio { seconds, duration } => {
                let dur = duration.or(book_duration)?;
                if dur <= 0.0 {
                    return None;
                }
                Some((seconds / dur).clamp(0.0, 1.0))
            }
            Position::Text { percentage, .. } => Some(percentage.clamp(0.0, 1.0)),
        }
    }

    pub fn audio_seconds(&self) -> Option<f64> {
        match &self.position {
            Position::Audio { seconds, .. } => Some(*seconds),
            Position::Text { .. } => None,
        }
    }
}

/// A resolved position inside an ebook, rich enough for every client
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Locator {
    pub percentage: f64,
    pub char_offset: Option<usize>,
    /// Audio-time equivalent, present when translating toward audio
    pub timestamp: Option<f64>,
    pub xpath: Option<String>,
    pub css_selector: Option<String>,
    pub fragment: Option<String>,
    pub cfi: Option<String>,
}

impl Locator {
    pub fn from_percentage(percentage: f64) -> Self {
        Locator {
            percentage,
            ..Default::default()
        }
    }
}

/// A write request in follower-native terms
#[derive(Debug, Clone)]
pub struct UpdateRequest {
    pub locator: Locator,
    /// The leader's text snippet, for adapters that re-anchor themselves
    pub snippet: Option<String>,
    /// The follower's previous normalized position, when known
    pub previous: Option<f64>,
}

/// What an adapter actually wrote, for persisting to the progress store
#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub percentage: Option<f64>,
    pub timestamp: Option<f64>,
    pub locator_json: Option<String>,
}

/// Raw bulk snapshot: book_id → client-specific payload
pub type BulkStates = HashMap<String, serde_json::Value>;

/// Error taxonomy shared by all adapters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Client credentials absent; silently skipped
    NotConfigured,
    /// Network timeout, 5xx, socket reset; retryable
    Transient,
    /// 401/403; disable push listeners, keep polling
    Unauthorized,
    /// Resource missing on the client
    NotFound,
    /// 409 on write; treated as success by idempotent writers
    Conflict,
    /// Schema or hash mismatch; flag the mapping, do not propagate
    InvalidData,
    /// Store unreachable, corrupted artifact; abort the cycle
    Fatal,
}

#[derive(Debug, Error)]
#[error("{kind:?}: {message}")]
pub struct ClientError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ClientError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        ClientError {
            kind,
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() || err.is_connect() {
            ErrorKind::Transient
        } else if let Some(status) = err.status() {
            classify_status(status)
        } else {
            ErrorKind::Transient
        };
        ClientError::new(kind, err.to_string())
    }
}

impl From<bookbridge_common::Error> for ClientError {
    fn from(err: bookbridge_common::Error) -> Self {
        ClientError::new(ErrorKind::Fatal, err.to_string())
    }
}

/// Map an HTTP status onto the shared taxonomy
pub fn classify_status(status: reqwest::StatusCode) -> ErrorKind {
    match status.as_u16() {
        401 | 403 => ErrorKind::Unauthorized,
        404 => ErrorKind::NotFound,
        409 => ErrorKind::Conflict,
        400 | 422 => ErrorKind::InvalidData,
        s if s >= 500 => ErrorKind::Transient,
        _ => ErrorKind::Transient,
    }
}

/// Uniform interface over all external services
#[async_trait]
pub trait SyncClient: Send + Sync {
    fn name(&self) -> ClientName;

    /// False ⇒ the client is silently skipped in every cycle
    fn is_configured(&self) -> bool;

    /// Whether this client's reported position may be elected leader
    fn can_lead(&self) -> bool {
        true
    }

    /// Whether this client participates under the given sync mode
    fn supports_mode(&self, mode: SyncMode) -> bool {
        let _ = mode;
        true
    }

    /// Current progress, or `Ok(None)` when the client knows nothing
    /// about this book. Absence is a valid state, never an error.
    async fn fetch_state(
        &self,
        mapping: &Mapping,
        prev: Option<&bookbridge_common::db::models::ClientStateRow>,
        bulk: Option<&BulkStates>,
    ) -> Result<Option<ClientState>, ClientError>;

    /// One-shot snapshot amortizing per-book lookups across a full cycle
    async fn fetch_bulk(&self) -> Result<Option<BulkStates>, ClientError> {
        Ok(None)
    }

    /// Write a position in the client's own coordinate system
    async fn update(
        &self,
        mapping: &Mapping,
        request: &UpdateRequest,
    ) -> Result<SyncOutcome, ClientError>;

    /// Extract the text the user is currently at, for translation
    async fn text_at(
        &self,
        mapping: &Mapping,
        state: &ClientState,
    ) -> Result<Option<String>, ClientError> {
        let _ = (mapping, state);
        Ok(None)
    }

    /// Verify connectivity at startup; failures are logged, not fatal
    async fn check_connection(&self) -> Result<(), ClientError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalized_pct_requires_duration_for_audio() {
        let state = ClientState {
            last_updated: 0.0,
            position: Position::Audio {
                seconds: 90.0,
                duration: None,
            },
        };
        assert_eq!(state.normalized_pct(None), None);
        assert_eq!(state.normalized_pct(Some(900.0)), Some(0.1));
    }

    #[test]
    fn normalized_pct_clamps() {
        let state = ClientState {
            last_updated: 0.0,
            position: Position::Audio {
                seconds: 1200.0,
                duration: Some(900.0),
            },
        };
        assert_eq!(state.normalized_pct(None), Some(1.0));
    }

    #[test]
    fn status_classification() {
        use reqwest::StatusCode;
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED), ErrorKind::Unauthorized);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), ErrorKind::NotFound);
        assert_eq!(classify_status(StatusCode::CONFLICT), ErrorKind::Conflict);
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), ErrorKind::Transient);
    }
}
