//! Database models

use serde::{Deserialize, Serialize};

/// Lifecycle status of a book mapping
///
/// Only `active` mappings are syncable. Transitions are owned by the sync
/// engine and the job manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BookStatus {
    Pending,
    Processing,
    Active,
    FailedRetryLater,
    Disabled,
}

impl BookStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookStatus::Pending => "pending",
            BookStatus::Processing => "processing",
            BookStatus::Active => "active",
            BookStatus::FailedRetryLater => "failed_retry_later",
            BookStatus::Disabled => "disabled",
        }
    }
}

impl std::fmt::Display for BookStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which clients participate in a mapping's sync
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    Audiobook,
    EbookOnly,
}

/// Where a book's alignment artifact came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AlignmentSource {
    None,
    Whisper,
    Storyteller,
}

/// A book mapping, the unit of synchronization
///
/// Links the audiobook server's item id to each client's external
/// identifier plus the metadata governing sync.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Mapping {
    /// Stable book id (the audiobook server's library item id)
    pub book_id: String,
    pub title: String,
    pub author: Option<String>,
    /// Ebook filename used by Booklore / the local books folder
    pub ebook_filename: Option<String>,
    /// KOReader partial-MD5 document hash
    pub kosync_doc_id: Option<String>,
    pub storyteller_uuid: Option<String>,
    pub booklore_id: Option<i64>,
    pub hardcover_book_id: Option<i64>,
    pub hardcover_edition_id: Option<i64>,
    pub hardcover_pages: Option<i64>,
    pub sync_mode: SyncMode,
    pub status: BookStatus,
    pub alignment_source: AlignmentSource,
    /// Audiobook duration in seconds, known once transcription completes
    pub duration_seconds: Option<f64>,
    pub created_at: f64,
}

impl Mapping {
    pub fn new(book_id: String, title: String) -> Self {
        Mapping {
            book_id,
            title,
            author: None,
            ebook_filename: None,
            kosync_doc_id: None,
            storyteller_uuid: None,
            booklore_id: None,
            hardcover_book_id: None,
            hardcover_edition_id: None,
            hardcover_pages: None,
            sync_mode: SyncMode::Audiobook,
            status: BookStatus::Pending,
            alignment_source: AlignmentSource::None,
            duration_seconds: None,
            created_at: crate::time::unix_now(),
        }
    }
}

/// Last-known position for one `(book, client)` pair
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ClientStateRow {
    pub book_id: String,
    pub client_name: String,
    /// Wall clock of the last accepted update, seconds since epoch
    pub last_updated: f64,
    pub percentage: Option<f64>,
    /// Seconds into the audio, for audiobook clients
    pub timestamp: Option<f64>,
    /// Opaque rich locator payload (xpath, css, fragment, cfi) as JSON
    pub locator_json: Option<String>,
}

/// Transcription job state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Done,
    FailedRetryLater,
}

/// A transcription job row, one per book
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TranscriptionJob {
    pub book_id: String,
    pub state: JobState,
    pub retry_count: i64,
    pub last_error: Option<String>,
    /// Wall clock of the last attempt, seconds since epoch
    pub last_attempt: f64,
    /// 0.0–1.0 overall progress for the admin UI
    pub progress: f64,
    /// Chunks already transcribed and persisted (resume marker)
    pub chunks_done: i64,
}

impl TranscriptionJob {
    pub fn queued(book_id: String) -> Self {
        TranscriptionJob {
            book_id,
            state: JobState::Queued,
            retry_count: 0,
            last_error: None,
            last_attempt: 0.0,
            progress: 0.0,
            chunks_done: 0,
        }
    }
}

/// A mapping suggestion for a book with progress but no mapping
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Suggestion {
    /// The unmapped book's id on its source client
    pub book_id: String,
    pub source_client: String,
    pub title: String,
    pub author: Option<String>,
    /// Candidate matches as JSON: `[{source, filename, id, confidence}]`
    pub matches_json: String,
    /// pending | dismissed | accepted
    pub state: String,
    pub created_at: f64,
}

/// Progress record stored by the embedded KoSync server
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct KosyncDocument {
    /// KOReader partial-MD5 document hash
    pub document: String,
    pub username: String,
    /// KOReader progress locator (xpath string)
    pub progress: String,
    pub percentage: f64,
    pub device: String,
    pub device_id: String,
    /// Client-reported update time, seconds since epoch
    pub timestamp: f64,
}

/// A KoSync account served by the embedded server
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct KosyncUser {
    pub username: String,
    /// MD5 of the password, as sent by KOReader
    pub key_hash: String,
}
