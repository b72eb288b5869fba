//! Mapping suggestions
//!
//! Books with listening progress upstream but no mapping get a suggestion
//! row with candidate ebook matches, surfaced through the admin API.
//! Nearly-finished books are not suggested; neither are books the user
//! already dismissed.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info, warn};

use bookbridge_common::db::models::Suggestion;
use bookbridge_common::db::ProgressStore;
use bookbridge_common::events::{BridgeEvent, EventBus};
use bookbridge_common::time;

use crate::clients::abs::AbsClient;
use crate::clients::booklore::BookloreSyncClient;
use crate::clients::ClientName;
use crate::engine::BulkSnapshot;

/// Progress range worth suggesting: past a taste, not nearly done
const MIN_PROGRESS: f64 = 0.01;
const MAX_PROGRESS: f64 = 0.70;

pub struct SuggestionScanner {
    store: ProgressStore,
    abs: Arc<AbsClient>,
    booklore: Option<Arc<BookloreSyncClient>>,
    books_dir: PathBuf,
    events: EventBus,
}

impl SuggestionScanner {
    pub fn new(
        store: ProgressStore,
        abs: Arc<AbsClient>,
        booklore: Option<Arc<BookloreSyncClient>>,
        books_dir: PathBuf,
        events: EventBus,
    ) -> Self {
        SuggestionScanner {
            store,
            abs,
            booklore,
            books_dir,
            events,
        }
    }

    /// Scan the bulk progress snapshot for unmapped books worth suggesting
    pub async fn scan(&self, bulk: &BulkSnapshot) {
        let Some(abs_progress) = bulk.get(&ClientName::Abs) else {
            return;
        };

        let mapped: HashSet<String> = match self.store.list_all_mappings().await {
            Ok(mappings) => mappings.into_iter().map(|m| m.book_id).collect(),
            Err(err) => {
                warn!(%err, "Could not list mappings for suggestion scan");
                return;
            }
        };

        for (book_id, raw) in abs_progress {
            if mapped.contains(book_id) {
                continue;
            }

            let current_time = raw.get("currentTime").and_then(|v| v.as_f64()).unwrap_or(0.0);
            let duration = raw.get("duration").and_then(|v| v.as_f64()).unwrap_or(0.0);
            if duration <= 0.0 {
                continue;
            }
            let pct = current_time / duration;
            if !(MIN_PROGRESS..=MAX_PROGRESS).contains(&pct) {
                debug!(book_id, pct, "Progress outside suggestion range");
                continue;
            }

            match self.store.suggestion_exists(book_id).await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(err) => {
                    warn!(book_id, %err, "Suggestion lookup failed");
                    continue;
                }
            }

            if let Err(err) = self.create_suggestion(book_id).await {
                warn!(book_id, %err, "Could not create suggestion");
            }
        }
    }

    pub async fn create_suggestion(&self, book_id: &str) -> bookbridge_common::Result<()> {
        let Ok(Some(item)) = self.abs.get_item_details(book_id).await else {
            debug!(book_id, "No item details, skipping suggestion");
            return Ok(());
        };

        let title = item
            .pointer("/media/metadata/title")
            .and_then(|v| v.as_str())
            .unwrap_or("Unknown")
            .to_string();
        let author = item
            .pointer("/media/metadata/authorName")
            .and_then(|v| v.as_str())
            .map(String::from);

        let mut matches = Vec::new();
        let mut seen_files = HashSet::new();

        if let Some(booklore) = &self.booklore {
            match booklore.search_books(&title).await {
                Ok(results) => {
                    for book in results {
                        let Some(filename) = book.get("fileName").and_then(|v| v.as_str()) else {
                            continue;
                        };
                        if !filename.to_lowercase().ends_with(".epub") {
                            continue;
                        }
                        seen_files.insert(filename.to_string());
                        let candidate_title =
                            book.get("title").and_then(|v| v.as_str()).unwrap_or("");
                        matches.push(json!({
                            "source": "booklore",
                            "title": candidate_title,
                            "filename": filename,
                            "id": book.get("id"),
                            "confidence": if candidate_title.to_lowercase().contains(&title.to_lowercase()) {
                                "high"
                            } else {
                                "medium"
                            },
                        }));
                    }
                }
                Err(err) => debug!(book_id, %err, "Booklore search failed during suggestion"),
            }
        }

        // Local filesystem candidates by title substring
        let needle = title.to_lowercase();
        if self.books_dir.is_dir() {
            let mut stack = vec![self.books_dir.clone()];
            while let Some(dir) = stack.pop() {
                let Ok(entries) = std::fs::read_dir(&dir) else { continue };
                for entry in entries.flatten() {
                    let path = entry.path();
                    if path.is_dir() {
                        stack.push(path);
                        continue;
                    }
                    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                        continue;
                    };
                    if !name.to_lowercase().ends_with(".epub")
                        || seen_files.contains(name)
                        || !name.to_lowercase().contains(&needle)
                    {
                        continue;
                    }
                    matches.push(json!({
                        "source": "filesystem",
                        "filename": name,
                        "confidence": "high",
                    }));
                }
            }
        }

        if matches.is_empty() {
            debug!(book_id, title = %title, "No candidate ebooks found");
            return Ok(());
        }

        let suggestion = Suggestion {
            book_id: book_id.to_string(),
            source_client: ClientName::Abs.as_str().to_string(),
            title: title.clone(),
            author,
            matches_json: serde_json::to_string(&matches)?,
            state: "pending".into(),
            created_at: time::unix_now(),
        };
        self.store.save_suggestion(&suggestion).await?;

        info!(book_id, title = %title, matches = matches.len(), "Suggestion created");
        self.events.emit_lossy(BridgeEvent::SuggestionCreated {
            book_id: book_id.to_string(),
            title,
            matches: matches.len(),
            timestamp: time::now(),
        });
        Ok(())
    }
}
