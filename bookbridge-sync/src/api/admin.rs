//! Admin API
//!
//! Mapping lifecycle, manual sync controls, suggestions and settings.
//! Bound to the primary port, which stays on the private network.

use axum::extract::{Path, State};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use bookbridge_common::db::models::{BookStatus, Mapping, SyncMode};
use bookbridge_common::time;

use super::kosync::document_id;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/api/mappings", get(list_mappings).post(create_mapping))
        .route("/api/mappings/:book_id", delete(delete_mapping))
        .route("/api/mappings/:book_id/sync", post(force_sync))
        .route("/api/mappings/:book_id/clear", post(clear_progress))
        .route("/api/mappings/:book_id/job", get(job_status))
        .route("/api/suggestions", get(list_suggestions))
        .route("/api/suggestions/:book_id/accept", post(accept_suggestion))
        .route("/api/suggestions/:book_id/dismiss", post(dismiss_suggestion))
        .route("/api/settings/:key", put(put_setting))
}

async fn health(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let active = state.store.list_active_mappings().await?.len();
    Ok(Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "active_mappings": active,
    })))
}

async fn list_mappings(State(state): State<AppState>) -> ApiResult<Json<Vec<Mapping>>> {
    Ok(Json(state.store.list_all_mappings().await?))
}

#[derive(Debug, Deserialize)]
struct CreateMappingRequest {
    book_id: String,
    title: String,
    #[serde(default)]
    author: Option<String>,
    #[serde(default)]
    ebook_filename: Option<String>,
    #[serde(default)]
    storyteller_uuid: Option<String>,
    #[serde(default)]
    booklore_id: Option<i64>,
    #[serde(default)]
    hardcover_book_id: Option<i64>,
    #[serde(default)]
    hardcover_edition_id: Option<i64>,
    #[serde(default)]
    hardcover_pages: Option<i64>,
    #[serde(default)]
    ebook_only: bool,
}

async fn create_mapping(
    State(state): State<AppState>,
    Json(request): Json<CreateMappingRequest>,
) -> ApiResult<Json<Mapping>> {
    if state.store.load_mapping(&request.book_id).await?.is_some() {
        return Err(ApiError::Conflict(format!(
            "mapping {} already exists",
            request.book_id
        )));
    }

    let mut mapping = Mapping::new(request.book_id.clone(), request.title);
    mapping.author = request.author;
    mapping.storyteller_uuid = request.storyteller_uuid;
    mapping.booklore_id = request.booklore_id;
    mapping.hardcover_book_id = request.hardcover_book_id;
    mapping.hardcover_edition_id = request.hardcover_edition_id;
    mapping.hardcover_pages = request.hardcover_pages;
    if request.ebook_only {
        mapping.sync_mode = SyncMode::EbookOnly;
        // No transcription needed; ebook clients share coordinates.
        mapping.status = BookStatus::Active;
    }

    if let Some(filename) = request.ebook_filename {
        let path = state
            .ebooks
            .resolve_book_path(&filename)
            .map_err(|_| ApiError::NotFound(format!("ebook file {filename}")))?;
        let doc_id = document_id(&path, &state.settings.kosync_hash_method)
            .map_err(|e| ApiError::Internal(format!("hashing {filename}: {e}")))?;
        mapping.kosync_doc_id = Some(doc_id);
        mapping.ebook_filename = Some(filename);
    }

    state.store.save_mapping(&mapping).await?;
    info!(book_id = %mapping.book_id, title = %mapping.title, "Mapping created");
    Ok(Json(mapping))
}

async fn delete_mapping(
    State(state): State<AppState>,
    Path(book_id): Path<String>,
) -> ApiResult<Json<Value>> {
    if state.store.load_mapping(&book_id).await?.is_none() {
        return Err(ApiError::NotFound(format!("mapping {book_id}")));
    }
    state.store.delete_mapping(&book_id).await?;
    info!(book_id, "Mapping deleted");
    Ok(Json(json!({ "deleted": book_id })))
}

async fn force_sync(
    State(state): State<AppState>,
    Path(book_id): Path<String>,
) -> ApiResult<Json<Value>> {
    if state.store.load_mapping(&book_id).await?.is_none() {
        return Err(ApiError::NotFound(format!("mapping {book_id}")));
    }
    state.dispatcher.enqueue_forced(&book_id);
    Ok(Json(json!({ "queued": book_id, "forced": true })))
}

async fn clear_progress(
    State(state): State<AppState>,
    Path(book_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let summary = state.engine.clear_progress(&book_id).await?;
    Ok(Json(summary))
}

async fn job_status(
    State(state): State<AppState>,
    Path(book_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let job = state
        .store
        .load_job(&book_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("job for {book_id}")))?;
    Ok(Json(serde_json::to_value(job).map_err(|e| ApiError::Internal(e.to_string()))?))
}

async fn list_suggestions(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let suggestions = state.store.list_pending_suggestions().await?;
    let rendered: Vec<Value> = suggestions
        .into_iter()
        .map(|s| {
            let matches: Value =
                serde_json::from_str(&s.matches_json).unwrap_or_else(|_| json!([]));
            json!({
                "book_id": s.book_id,
                "title": s.title,
                "author": s.author,
                "matches": matches,
                "created_at": s.created_at,
            })
        })
        .collect();
    Ok(Json(json!(rendered)))
}

#[derive(Debug, Deserialize)]
struct AcceptSuggestionRequest {
    #[serde(default)]
    ebook_filename: Option<String>,
    #[serde(default)]
    booklore_id: Option<i64>,
}

async fn accept_suggestion(
    State(state): State<AppState>,
    Path(book_id): Path<String>,
    Json(request): Json<AcceptSuggestionRequest>,
) -> ApiResult<Json<Mapping>> {
    let suggestions = state.store.list_pending_suggestions().await?;
    let Some(suggestion) = suggestions.into_iter().find(|s| s.book_id == book_id) else {
        return Err(ApiError::NotFound(format!("suggestion {book_id}")));
    };

    let mut mapping = Mapping::new(book_id.clone(), suggestion.title.clone());
    mapping.author = suggestion.author.clone();
    mapping.booklore_id = request.booklore_id;
    mapping.created_at = time::unix_now();

    if let Some(filename) = request.ebook_filename {
        if let Ok(path) = state.ebooks.resolve_book_path(&filename) {
            mapping.kosync_doc_id = document_id(&path, &state.settings.kosync_hash_method).ok();
        }
        mapping.ebook_filename = Some(filename);
    }

    state.store.save_mapping(&mapping).await?;
    state.store.set_suggestion_state(&book_id, "accepted").await?;
    info!(book_id, "Suggestion accepted, mapping created");
    Ok(Json(mapping))
}

async fn dismiss_suggestion(
    State(state): State<AppState>,
    Path(book_id): Path<String>,
) -> ApiResult<Json<Value>> {
    state.store.set_suggestion_state(&book_id, "dismissed").await?;
    Ok(Json(json!({ "dismissed": book_id })))
}

#[derive(Debug, Deserialize)]
struct PutSettingRequest {
    value: String,
}

async fn put_setting(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(request): Json<PutSettingRequest>,
) -> ApiResult<Json<Value>> {
    state.store.set_setting(&key, &request.value).await?;
    info!(key, value = %request.value, "Setting updated (applies on restart)");
    Ok(Json(json!({ "key": key, "value": request.value })))
}
