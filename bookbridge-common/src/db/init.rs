//! Database initialization
//!
//! Creates the database on first run and applies the idempotent schema.
//! WAL journaling keeps client-state writes crash-safe; multi-row updates
//! for a single book go through transactions in the store layer.

use crate::Result;
use sqlx::SqlitePool;
use std::path::Path;
use tracing::info;

/// Initialize database connection and create tables if needed
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    let pool = SqlitePool::connect(&db_url).await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;
    sqlx::query("PRAGMA synchronous = NORMAL").execute(&pool).await?;
    sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await?;
    sqlx::query("PRAGMA busy_timeout = 5000").execute(&pool).await?;

    create_schema_version_table(&pool).await?;
    create_mappings_table(&pool).await?;
    create_client_states_table(&pool).await?;
    create_jobs_table(&pool).await?;
    create_suggestions_table(&pool).await?;
    create_kosync_tables(&pool).await?;
    create_settings_table(&pool).await?;

    Ok(pool)
}

async fn create_schema_version_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_mappings_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS mappings (
            book_id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            author TEXT,
            ebook_filename TEXT UNIQUE,
            kosync_doc_id TEXT UNIQUE,
            storyteller_uuid TEXT UNIQUE,
            booklore_id INTEGER UNIQUE,
            hardcover_book_id INTEGER,
            hardcover_edition_id INTEGER,
            hardcover_pages INTEGER,
            sync_mode TEXT NOT NULL DEFAULT 'audiobook',
            status TEXT NOT NULL DEFAULT 'pending',
            alignment_source TEXT NOT NULL DEFAULT 'none',
            duration_seconds REAL,
            created_at REAL NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_client_states_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS client_states (
            book_id TEXT NOT NULL,
            client_name TEXT NOT NULL,
            last_updated REAL NOT NULL,
            percentage REAL,
            timestamp REAL,
            locator_json TEXT,
            PRIMARY KEY (book_id, client_name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_jobs_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            book_id TEXT PRIMARY KEY,
            state TEXT NOT NULL DEFAULT 'queued',
            retry_count INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            last_attempt REAL NOT NULL DEFAULT 0,
            progress REAL NOT NULL DEFAULT 0,
            chunks_done INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_suggestions_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS suggestions (
            book_id TEXT PRIMARY KEY,
            source_client TEXT NOT NULL,
            title TEXT NOT NULL,
            author TEXT,
            matches_json TEXT NOT NULL DEFAULT '[]',
            state TEXT NOT NULL DEFAULT 'pending',
            created_at REAL NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_kosync_tables(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS kosync_documents (
            document TEXT PRIMARY KEY,
            username TEXT NOT NULL,
            progress TEXT NOT NULL DEFAULT '',
            percentage REAL NOT NULL DEFAULT 0,
            device TEXT NOT NULL DEFAULT '',
            device_id TEXT NOT NULL DEFAULT '',
            timestamp REAL NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS kosync_users (
            username TEXT PRIMARY KEY,
            key_hash TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_settings_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
