//! KOReader sync adapter
//!
//! The bridge runs its own KoSync-protocol server (see `api::kosync`);
//! devices push and pull against that surface, so this adapter reads and
//! writes the embedded document store rather than a remote service.

use std::sync::Arc;

use async_trait::async_trait;
use bookbridge_common::db::models::{ClientStateRow, KosyncDocument, Mapping};
use bookbridge_common::db::ProgressStore;
use tracing::{debug, info};

use super::{
    BulkStates, ClientError, ClientName, ClientState, ErrorKind, Position, SyncClient,
    SyncOutcome, UpdateRequest,
};
use crate::ebook::EbookCache;

/// Device name reported for positions the bridge writes itself
pub const BRIDGE_DEVICE: &str = "bookbridge";

pub struct KosyncSyncClient {
    store: ProgressStore,
    ebooks: Arc<EbookCache>,
}

impl KosyncSyncClient {
    pub fn new(store: ProgressStore, ebooks: Arc<EbookCache>) -> Self {
        KosyncSyncClient { store, ebooks }
    }
}

#[async_trait]
impl SyncClient for KosyncSyncClient {
    fn name(&self) -> ClientName {
        ClientName::KoReaderSync
    }

    fn is_configured(&self) -> bool {
        // The embedded server is always available; a mapping participates
        // once it has a document hash.
        true
    }

    async fn fetch_state(
        &self,
        mapping: &Mapping,
        _prev: Option<&ClientStateRow>,
        _bulk: Option<&BulkStates>,
    ) -> Result<Option<ClientState>, ClientError> {
        let Some(doc_id) = &mapping.kosync_doc_id else {
            return Ok(None);
        };

        let Some(doc) = self.store.kosync_document(doc_id).await? else {
            return Ok(None);
        };

        // Positions the bridge wrote itself carry our device name; they
        // are still valid state but their timestamp must not win leader
        // election over a real reader push, so they pass through as-is
        // and the echo window in the engine handles the rest.
        debug!(
            book_id = %mapping.book_id,
            pct = doc.percentage,
            device = %doc.device,
            "KoSync document state"
        );

        Ok(Some(ClientState {
            last_updated: doc.timestamp,
            position: Position::Text {
                percentage: doc.percentage,
                xpath: Some(doc.progress.clone()).filter(|p| !p.is_empty()),
                css_selector: None,
                fragment: None,
                cfi: None,
            },
        }))
    }

    async fn update(
        &self,
        mapping: &Mapping,
        request: &UpdateRequest,
    ) -> Result<SyncOutcome, ClientError> {
        let Some(doc_id) = &mapping.kosync_doc_id else {
            return Err(ClientError::new(
                ErrorKind::NotConfigured,
                "mapping has no kosync document hash",
            ));
        };

        let existing = self.store.kosync_document(doc_id).await?;
        let username = existing
            .as_ref()
            .map(|d| d.username.clone())
            .unwrap_or_else(|| BRIDGE_DEVICE.to_string());

        let xpath = request
            .locator
            .xpath
            .clone()
            .unwrap_or_default();

        let doc = KosyncDocument {
            document: doc_id.clone(),
            username,
            progress: xpath.clone(),
            percentage: request.locator.percentage,
            device: BRIDGE_DEVICE.to_string(),
            device_id: BRIDGE_DEVICE.to_string(),
            timestamp: bookbridge_common::time::unix_now(),
        };
        self.store.save_kosync_document(&doc).await?;

        info!(
            book_id = %mapping.book_id,
            pct = request.locator.percentage,
            "Updated KoSync document"
        );

        Ok(SyncOutcome {
            percentage: Some(request.locator.percentage),
            timestamp: None,
            locator_json: serde_json::to_string(&serde_json::json!({ "xpath": xpath })).ok(),
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
}
