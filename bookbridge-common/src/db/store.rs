//! Progress store: durable per-(book, client) positions and mapping rows
//!
//! Last-writer-wins within the process. Multi-row operations for a single
//! book (reset, delete) run inside a transaction so a crash never leaves
//! partial per-client rows behind.

use crate::db::models::*;
use crate::{Error, Result};
use sqlx::SqlitePool;

/// Query layer over the embedded store
///
/// Cheap to clone; wraps the shared connection pool.
#[derive(Clone)]
pub struct ProgressStore {
    pool: SqlitePool,
}

impl ProgressStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ------------------------------------------------------------------
    // Mappings
    // ------------------------------------------------------------------

    pub async fn load_mapping(&self, book_id: &str) -> Result<Option<Mapping>> {
        let mapping = sqlx::query_as::<_, Mapping>("SELECT * FROM mappings WHERE book_id = ?")
            .bind(book_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(mapping)
    }

    pub async fn list_active_mappings(&self) -> Result<Vec<Mapping>> {
        self.list_mappings_by_status(BookStatus::Active).await
    }

    pub async fn list_mappings_by_status(&self, status: BookStatus) -> Result<Vec<Mapping>> {
        let mappings = sqlx::query_as::<_, Mapping>(
            "SELECT * FROM mappings WHERE status = ? ORDER BY created_at",
        )
        .bind(status)
        .fetch_all(&self.pool)
        .await?;
        Ok(mappings)
    }

    /// Mapping owning a KoSync document hash, if any
    pub async fn mapping_by_kosync_doc(&self, document: &str) -> Result<Option<Mapping>> {
        let mapping =
            sqlx::query_as::<_, Mapping>("SELECT * FROM mappings WHERE kosync_doc_id = ?")
                .bind(document)
                .fetch_optional(&self.pool)
                .await?;
        Ok(mapping)
    }

    pub async fn list_all_mappings(&self) -> Result<Vec<Mapping>> {
        let mappings = sqlx::query_as::<_, Mapping>("SELECT * FROM mappings ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;
        Ok(mappings)
    }

    /// Insert or replace a mapping row
    pub async fn save_mapping(&self, mapping: &Mapping) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO mappings (
                book_id, title, author, ebook_filename, kosync_doc_id,
                storyteller_uuid, booklore_id, hardcover_book_id,
                hardcover_edition_id, hardcover_pages, sync_mode, status,
                alignment_source, duration_seconds, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(book_id) DO UPDATE SET
                title = excluded.title,
                author = excluded.author,
                ebook_filename = excluded.ebook_filename,
                kosync_doc_id = excluded.kosync_doc_id,
                storyteller_uuid = excluded.storyteller_uuid,
                booklore_id = excluded.booklore_id,
                hardcover_book_id = excluded.hardcover_book_id,
                hardcover_edition_id = excluded.hardcover_edition_id,
                hardcover_pages = excluded.hardcover_pages,
                sync_mode = excluded.sync_mode,
                status = excluded.status,
                alignment_source = excluded.alignment_source,
                duration_seconds = excluded.duration_seconds
            "#,
        )
        .bind(&mapping.book_id)
        .bind(&mapping.title)
        .bind(&mapping.author)
        .bind(&mapping.ebook_filename)
        .bind(&mapping.kosync_doc_id)
        .bind(&mapping.storyteller_uuid)
        .bind(mapping.booklore_id)
        .bind(mapping.hardcover_book_id)
        .bind(mapping.hardcover_edition_id)
        .bind(mapping.hardcover_pages)
        .bind(mapping.sync_mode)
        .bind(mapping.status)
        .bind(mapping.alignment_source)
        .bind(mapping.duration_seconds)
        .bind(mapping.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_status(&self, book_id: &str, status: BookStatus) -> Result<()> {
        let result = sqlx::query("UPDATE mappings SET status = ? WHERE book_id = ?")
            .bind(status)
            .bind(book_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("mapping {book_id}")));
        }
        Ok(())
    }

    /// Delete a mapping and everything attached to it
    ///
    /// Purges client states, the job row, the suggestion row and the
    /// KoSync document in one transaction. Transcript and alignment files
    /// on disk are the caller's responsibility.
    pub async fn delete_mapping(&self, book_id: &str) -> Result<()> {
        let kosync_doc: Option<String> =
            sqlx::query_scalar("SELECT kosync_doc_id FROM mappings WHERE book_id = ?")
                .bind(book_id)
                .fetch_optional(&self.pool)
                .await?
                .flatten();

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM client_states WHERE book_id = ?")
            .bind(book_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM jobs WHERE book_id = ?")
            .bind(book_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM suggestions WHERE book_id = ?")
            .bind(book_id)
            .execute(&mut *tx)
            .await?;
        if let Some(doc) = kosync_doc {
            sqlx::query("DELETE FROM kosync_documents WHERE document = ?")
                .bind(doc)
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query("DELETE FROM mappings WHERE book_id = ?")
            .bind(book_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Client states
    // ------------------------------------------------------------------

    pub async fn read_state(&self, book_id: &str, client: &str) -> Result<Option<ClientStateRow>> {
        let row = sqlx::query_as::<_, ClientStateRow>(
            "SELECT * FROM client_states WHERE book_id = ? AND client_name = ?",
        )
        .bind(book_id)
        .bind(client)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// All per-client rows for a book
    pub async fn read_states(&self, book_id: &str) -> Result<Vec<ClientStateRow>> {
        let rows =
            sqlx::query_as::<_, ClientStateRow>("SELECT * FROM client_states WHERE book_id = ?")
                .bind(book_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows)
    }

    pub async fn write_state(&self, row: &ClientStateRow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO client_states (
                book_id, client_name, last_updated, percentage, timestamp, locator_json
            ) VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(book_id, client_name) DO UPDATE SET
                last_updated = excluded.last_updated,
                percentage = excluded.percentage,
                timestamp = excluded.timestamp,
                locator_json = excluded.locator_json
            "#,
        )
        .bind(&row.book_id)
        .bind(&row.client_name)
        .bind(row.last_updated)
        .bind(row.percentage)
        .bind(row.timestamp)
        .bind(&row.locator_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Atomic purge of every client-state row for a book
    pub async fn reset_state(&self, book_id: &str) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query("DELETE FROM client_states WHERE book_id = ?")
            .bind(book_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }

    // ------------------------------------------------------------------
    // Jobs
    // ------------------------------------------------------------------

    pub async fn load_job(&self, book_id: &str) -> Result<Option<TranscriptionJob>> {
        let job = sqlx::query_as::<_, TranscriptionJob>("SELECT * FROM jobs WHERE book_id = ?")
            .bind(book_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    pub async fn save_job(&self, job: &TranscriptionJob) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO jobs (
                book_id, state, retry_count, last_error, last_attempt, progress, chunks_done
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(book_id) DO UPDATE SET
                state = excluded.state,
                retry_count = excluded.retry_count,
                last_error = excluded.last_error,
                last_attempt = excluded.last_attempt,
                progress = excluded.progress,
                chunks_done = excluded.chunks_done
            "#,
        )
        .bind(&job.book_id)
        .bind(job.state)
        .bind(job.retry_count)
        .bind(&job.last_error)
        .bind(job.last_attempt)
        .bind(job.progress)
        .bind(job.chunks_done)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_job_progress(&self, book_id: &str, progress: f64) -> Result<()> {
        sqlx::query("UPDATE jobs SET progress = ? WHERE book_id = ?")
            .bind(progress)
            .bind(book_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Suggestions
    // ------------------------------------------------------------------

    pub async fn suggestion_exists(&self, book_id: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM suggestions WHERE book_id = ?")
            .bind(book_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count > 0)
    }

    pub async fn save_suggestion(&self, suggestion: &Suggestion) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO suggestions (
                book_id, source_client, title, author, matches_json, state, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&suggestion.book_id)
        .bind(&suggestion.source_client)
        .bind(&suggestion.title)
        .bind(&suggestion.author)
        .bind(&suggestion.matches_json)
        .bind(&suggestion.state)
        .bind(suggestion.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_pending_suggestions(&self) -> Result<Vec<Suggestion>> {
        let rows = sqlx::query_as::<_, Suggestion>(
            "SELECT * FROM suggestions WHERE state = 'pending' ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn set_suggestion_state(&self, book_id: &str, state: &str) -> Result<()> {
        sqlx::query("UPDATE suggestions SET state = ? WHERE book_id = ?")
            .bind(state)
            .bind(book_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // KoSync documents and users
    // ------------------------------------------------------------------

    pub async fn kosync_document(&self, document: &str) -> Result<Option<KosyncDocument>> {
        let row =
            sqlx::query_as::<_, KosyncDocument>("SELECT * FROM kosync_documents WHERE document = ?")
                .bind(document)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row)
    }

    pub async fn save_kosync_document(&self, doc: &KosyncDocument) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO kosync_documents (
                document, username, progress, percentage, device, device_id, timestamp
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(document) DO UPDATE SET
                username = excluded.username,
                progress = excluded.progress,
                percentage = excluded.percentage,
                device = excluded.device,
                device_id = excluded.device_id,
                timestamp = excluded.timestamp
            "#,
        )
        .bind(&doc.document)
        .bind(&doc.username)
        .bind(&doc.progress)
        .bind(doc.percentage)
        .bind(&doc.device)
        .bind(&doc.device_id)
        .bind(doc.timestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Remove a document record, e.g. when clearing progress so the
    /// furthest-wins guard doesn't resurrect the old position
    pub async fn delete_kosync_document(&self, document: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM kosync_documents WHERE document = ?")
            .bind(document)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn kosync_user(&self, username: &str) -> Result<Option<KosyncUser>> {
        let row = sqlx::query_as::<_, KosyncUser>("SELECT * FROM kosync_users WHERE username = ?")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn create_kosync_user(&self, username: &str, key_hash: &str) -> Result<bool> {
        let result = sqlx::query("INSERT OR IGNORE INTO kosync_users (username, key_hash) VALUES (?, ?)")
            .bind(username)
            .bind(key_hash)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // ------------------------------------------------------------------
    // Settings
    // ------------------------------------------------------------------

    pub async fn setting(&self, key: &str) -> Result<Option<String>> {
        let value = sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO settings (key, value) VALUES (?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
