//! Embedded KoSync-protocol server
//!
//! Implements the endpoints KOReader's progress-sync plugin expects:
//! user registration/auth with MD5 password keys and progress push/pull
//! keyed by partial-MD5 document hashes. An accepted push from a real
//! device queues an instant sync for the owning mapping.

use std::path::Path;

use axum::extract::{Path as UrlPath, State};
use axum::http::HeaderMap;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use md5::{Digest, Md5};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use bookbridge_common::db::models::{BookStatus, KosyncDocument};
use bookbridge_common::time;

use crate::clients::ClientName;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/healthcheck", get(healthcheck))
        .route("/users/create", post(create_user))
        .route("/users/auth", get(auth_user))
        .route("/syncs/progress", put(put_progress))
        .route("/syncs/progress/:document", get(get_progress))
}

async fn healthcheck() -> Json<Value> {
    Json(json!({ "state": "OK" }))
}

#[derive(Debug, Deserialize)]
struct CreateUserRequest {
    username: String,
    /// KOReader sends the MD5 of the password
    password: String,
}

async fn create_user(
    State(state): State<AppState>,
    Json(request): Json<CreateUserRequest>,
) -> ApiResult<Json<Value>> {
    if request.username.is_empty() || request.password.is_empty() {
        return Err(ApiError::BadRequest("username and password required".into()));
    }
    let created = state
        .store
        .create_kosync_user(&request.username, &request.password)
        .await?;
    if !created {
        return Err(ApiError::Conflict("username already exists".into()));
    }
    info!(username = %request.username, "KoSync user created");
    Ok(Json(json!({ "username": request.username })))
}

async fn auth_user(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<Json<Value>> {
    authorize(&state, &headers).await?;
    Ok(Json(json!({ "authorized": "OK" })))
}

async fn authorize(state: &AppState, headers: &HeaderMap) -> ApiResult<String> {
    let username = headers
        .get("x-auth-user")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::Unauthorized("missing x-auth-user".into()))?;
    let key = headers
        .get("x-auth-key")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::Unauthorized("missing x-auth-key".into()))?;

    let Some(user) = state.store.kosync_user(username).await? else {
        return Err(ApiError::Unauthorized("unknown user".into()));
    };
    if user.key_hash != key {
        return Err(ApiError::Unauthorized("bad credentials".into()));
    }
    Ok(username.to_string())
}

#[derive(Debug, Deserialize)]
struct ProgressPush {
    document: String,
    progress: String,
    percentage: f64,
    #[serde(default)]
    device: String,
    #[serde(default)]
    device_id: String,
}

async fn put_progress(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(push): Json<ProgressPush>,
) -> ApiResult<Json<Value>> {
    let username = authorize(&state, &headers).await?;

    let existing = state.store.kosync_document(&push.document).await?;

    // Furthest-wins: a backwards push is stale state from before the
    // device's last pull, not real regression. Clearing progress deletes
    // the document record, which is how a genuine reset gets through.
    if state.settings.kosync_furthest_wins {
        if let Some(existing) = &existing {
            if push.percentage < existing.percentage - 0.001 {
                debug!(
                    document = %push.document,
                    from = existing.percentage,
                    to = push.percentage,
                    "Rejecting backwards push (furthest wins)"
                );
                return Ok(Json(json!({
                    "document": push.document,
                    "timestamp": existing.timestamp,
                })));
            }
        }
    }

    let now = time::unix_now();
    let doc = KosyncDocument {
        document: push.document.clone(),
        username,
        progress: push.progress.clone(),
        percentage: push.percentage,
        device: push.device.clone(),
        device_id: push.device_id.clone(),
        timestamp: now,
    };
    state.store.save_kosync_document(&doc).await?;

    // A push from a real reader is a sync trigger for the owning book.
    if let Some(mapping) = state.store.mapping_by_kosync_doc(&push.document).await? {
        if mapping.status == BookStatus::Active {
            if state
                .suppressor
                .is_own_write(ClientName::KoReaderSync, &mapping.book_id)
            {
                debug!(book_id = %mapping.book_id, "KoSync push is our own echo, not triggering");
            } else {
                info!(
                    book_id = %mapping.book_id,
                    pct = push.percentage,
                    device = %push.device,
                    "KOReader pushed progress, triggering sync"
                );
                state.dispatcher.enqueue(&mapping.book_id);
            }
        }
    }

    Ok(Json(json!({ "document": push.document, "timestamp": now })))
}

async fn get_progress(
    State(state): State<AppState>,
    headers: HeaderMap,
    UrlPath(document): UrlPath<String>,
) -> ApiResult<Json<Value>> {
    authorize(&state, &headers).await?;

    let Some(doc) = state.store.kosync_document(&document).await? else {
        warn!(document = %document, "Progress requested for unknown document");
        return Err(ApiError::NotFound("document".into()));
    };

    Ok(Json(json!({
        "document": doc.document,
        "percentage": doc.percentage,
        "progress": doc.progress,
        "device": doc.device,
        "device_id": doc.device_id,
        "timestamp": doc.timestamp,
    })))
}

// ----------------------------------------------------------------------
// Document hashing
// ----------------------------------------------------------------------

/// KOReader partial-MD5 document id: 1 KiB samples at exponentially
/// spaced offsets
pub fn partial_md5(path: &Path) -> std::io::Result<String> {
    use std::io::{Read, Seek, SeekFrom};

    let mut file = std::fs::File::open(path)?;
    let file_size = file.metadata()?.len();
    let mut hasher = Md5::new();
    let mut buf = [0u8; 1024];

    for i in -1i32..11 {
        let offset = if i == -1 { 0 } else { 1024u64 * 4u64.pow(i as u32) };
        if offset >= file_size {
            break;
        }
        file.seek(SeekFrom::Start(offset))?;
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Filename-based document id, for devices configured that way
pub fn filename_md5(filename: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(filename.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Compute a document id per the configured hash method
pub fn document_id(path: &Path, method: &str) -> std::io::Result<String> {
    if method == "filename" {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        Ok(filename_md5(name))
    } else {
        partial_md5(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_hash_is_stable() {
        assert_eq!(filename_md5("book.epub"), filename_md5("book.epub"));
        assert_ne!(filename_md5("book.epub"), filename_md5("other.epub"));
        assert_eq!(filename_md5("book.epub").len(), 32);
    }

    #[test]
    fn partial_hash_samples_exponential_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.epub");
        std::fs::write(&path, vec![0xAB; 16 * 1024]).unwrap();

        let hash = partial_md5(&path).unwrap();
        assert_eq!(hash.len(), 32);

        // Changing bytes beyond the sampled prefix but within a sampled
        // window changes the hash.
        let mut content = vec![0xAB; 16 * 1024];
        content[4096] = 0x01;
        std::fs::write(&path, content).unwrap();
        assert_ne!(partial_md5(&path).unwrap(), hash);
    }
}
