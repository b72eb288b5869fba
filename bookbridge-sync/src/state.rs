//! Shared application state for HTTP handlers

use std::sync::Arc;

use bookbridge_common::config::Settings;
use bookbridge_common::db::ProgressStore;
use bookbridge_common::events::EventBus;

use crate::ebook::EbookCache;
use crate::engine::SyncEngine;
use crate::suppress::WriteTracker;
use crate::triggers::SyncDispatcher;

/// State shared across both HTTP surfaces
#[derive(Clone)]
pub struct AppState {
    pub store: ProgressStore,
    pub engine: Arc<SyncEngine>,
    pub dispatcher: SyncDispatcher,
    pub events: EventBus,
    pub ebooks: Arc<EbookCache>,
    pub suppressor: Arc<WriteTracker>,
    pub settings: Arc<Settings>,
}
