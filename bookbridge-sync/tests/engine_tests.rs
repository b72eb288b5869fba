//! Sync cycle engine integration tests
//!
//! Drive full cycles against mock clients: propagation across coordinate
//! systems, echo suppression, delta gating, anti-regression, partial
//! failure isolation, and the failure-driven status lifecycle.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use bookbridge_common::db::models::*;
use bookbridge_common::db::{self, ProgressStore};
use bookbridge_common::events::EventBus;

use bookbridge_sync::align::{alignment_store, Anchor, AlignmentMap};
use bookbridge_sync::clients::*;
use bookbridge_sync::ebook::{EbookCache, EbookNode, EbookParser, ParsedEbook};
use bookbridge_sync::engine::election::DeltaPolicy;
use bookbridge_sync::engine::SyncEngine;
use bookbridge_sync::suppress::WriteTracker;
use bookbridge_sync::transcript::TranscriptStore;
use bookbridge_sync::translate::Translator;

// ----------------------------------------------------------------------
// Fixtures
// ----------------------------------------------------------------------

/// Serves a fixed parsed book for any path
struct FixtureParser {
    text: String,
}

impl EbookParser for FixtureParser {
    fn parse(&self, _path: &std::path::Path) -> bookbridge_common::Result<ParsedEbook> {
        let body = EbookNode::new("body").child(EbookNode::new("p").text(self.text.clone()));
        Ok(ParsedEbook::from_spine(vec![("ch1.xhtml".into(), body)]))
    }
}

#[derive(Default)]
struct MockBehavior {
    state: Option<ClientState>,
    text: Option<String>,
    fail_update_kind: Option<ErrorKind>,
    can_lead: bool,
}

struct MockClient {
    name: ClientName,
    behavior: Mutex<MockBehavior>,
    writes: Mutex<Vec<UpdateRequest>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockClient {
    fn new(name: ClientName) -> Arc<Self> {
        Arc::new(MockClient {
            name,
            behavior: Mutex::new(MockBehavior {
                can_lead: true,
                ..Default::default()
            }),
            writes: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }

    fn set_audio(&self, seconds: f64, duration: Option<f64>, last_updated: f64) {
        self.behavior.lock().state = Some(ClientState {
            last_updated,
            position: Position::Audio { seconds, duration },
        });
    }

    fn set_text(&self, percentage: f64, last_updated: f64) {
        self.behavior.lock().state = Some(ClientState {
            last_updated,
            position: Position::Text {
                percentage,
                xpath: None,
                css_selector: None,
                fragment: None,
                cfi: None,
            },
        });
    }

    fn set_snippet(&self, text: &str) {
        self.behavior.lock().text = Some(text.to_string());
    }

    fn fail_updates(&self, kind: ErrorKind) {
        self.behavior.lock().fail_update_kind = Some(kind);
    }

    fn writes(&self) -> Vec<UpdateRequest> {
        self.writes.lock().clone()
    }
}

#[async_trait]
impl SyncClient for MockClient {
    fn name(&self) -> ClientName {
        self.name
    }

    fn is_configured(&self) -> bool {
        true
    }

    fn can_lead(&self) -> bool {
        self.behavior.lock().can_lead
    }

    async fn fetch_state(
        &self,
        _mapping: &Mapping,
        _prev: Option<&ClientStateRow>,
        _bulk: Option<&BulkStates>,
    ) -> Result<Option<ClientState>, ClientError> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;
        let state = self.behavior.lock().state.clone();
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(state)
    }

    async fn update(
        &self,
        _mapping: &Mapping,
        request: &UpdateRequest,
    ) -> Result<SyncOutcome, ClientError> {
        if let Some(kind) = self.behavior.lock().fail_update_kind {
            return Err(ClientError::new(kind, "mock failure"));
        }
        self.writes.lock().push(request.clone());
        Ok(SyncOutcome {
            percentage: Some(request.locator.percentage),
            timestamp: request.locator.timestamp,
            locator_json: None,
        })
    }

    async fn text_at(
        &self,
        _mapping: &Mapping,
        _state: &ClientState,
    ) -> Result<Option<String>, ClientError> {
        Ok(self.behavior.lock().text.clone())
    }
}

struct TestEnv {
    _tmp: tempfile::TempDir,
    store: ProgressStore,
    engine: Arc<SyncEngine>,
    suppressor: Arc<WriteTracker>,
}

/// ~30k chars of distinct narrative so fuzzy matches are unambiguous and
/// character-delta gates have room to trip
fn fixture_text() -> String {
    (0..600)
        .map(|i| format!("passage{i} narrates event{i} beside landmark{i} quietly"))
        .collect::<Vec<_>>()
        .join(" ")
}

async fn build_env(clients: Vec<Arc<MockClient>>, with_alignment: bool) -> TestEnv {
    let tmp = tempfile::tempdir().unwrap();
    let data_dir = tmp.path().to_path_buf();
    let books_dir = data_dir.join("books");
    std::fs::create_dir_all(&books_dir).unwrap();
    // The cache resolves paths before parsing; the fixture parser ignores
    // the content.
    std::fs::write(books_dir.join("book.epub"), b"fixture").unwrap();

    let pool = db::init_database(&data_dir.join("test.db")).await.unwrap();
    let store = ProgressStore::new(pool);

    let ebooks = Arc::new(EbookCache::new(
        Arc::new(FixtureParser {
            text: fixture_text(),
        }),
        books_dir,
        data_dir.join("epub_cache"),
        3,
    ));
    let transcripts = Arc::new(TranscriptStore::new(data_dir.join("transcripts")));
    let alignments = alignment_store(&data_dir);

    if with_alignment {
        let map = AlignmentMap::from_anchors(vec![
            Anchor { ch: 0, ts: 0.0 },
            Anchor { ch: 500, ts: 50.0 },
            Anchor { ch: 1000, ts: 110.0 },
            Anchor { ch: 2500, ts: 300.0 },
        ])
        .unwrap();
        alignments.save("book-1", &map).unwrap();
    }

    let translator = Translator::new(
        alignments,
        transcripts,
        ebooks.clone(),
        80,
    );
    let suppressor = Arc::new(WriteTracker::new(Duration::from_secs(60)));
    let clients: Vec<Arc<dyn SyncClient>> = clients
        .into_iter()
        .map(|c| c as Arc<dyn SyncClient>)
        .collect();
    let engine = Arc::new(SyncEngine::new(
        store.clone(),
        clients,
        translator,
        suppressor.clone(),
        EventBus::new(64),
        ebooks,
        DeltaPolicy::default(),
        Duration::from_secs(30),
    ));

    TestEnv {
        _tmp: tmp,
        store,
        engine,
        suppressor,
    }
}

async fn active_mapping(store: &ProgressStore, duration: Option<f64>) -> Mapping {
    let mut mapping = Mapping::new("book-1".into(), "Fixture Book".into());
    mapping.status = BookStatus::Active;
    mapping.ebook_filename = Some("book.epub".into());
    mapping.kosync_doc_id = Some("doc-hash".into());
    mapping.duration_seconds = duration;
    store.save_mapping(&mapping).await.unwrap();
    mapping
}

// ----------------------------------------------------------------------
// Scenarios
// ----------------------------------------------------------------------

#[tokio::test]
async fn audio_position_propagates_to_ebook_follower() {
    let abs = MockClient::new(ClientName::Abs);
    let kosync = MockClient::new(ClientName::KoReaderSync);
    let env = build_env(vec![abs.clone(), kosync.clone()], true).await;
    active_mapping(&env.store, Some(36_000.0)).await;

    abs.set_audio(100.0, Some(36_000.0), 100.0);
    // ABS leads without transcript text; the interpolated offset drives
    // the follower locator.

    env.engine.sync_cycle("book-1", false, None).await.unwrap();

    let writes = kosync.writes();
    assert_eq!(writes.len(), 1, "follower should receive exactly one write");
    let locator = &writes[0].locator;

    // ts=100 interpolates between (500, 50) and (1000, 110): ch ≈ 916
    let ch = locator.char_offset.expect("char offset resolved");
    assert!((850..=1000).contains(&ch), "ch = {ch}");
    let expected_pct = ch as f64 / fixture_text().chars().count() as f64;
    assert!((locator.percentage - expected_pct).abs() < 0.01);
    assert!(locator.xpath.as_deref().unwrap_or("").contains("DocFragment[1]"));

    // Both rows land in the store: leader refreshed, follower written.
    let abs_row = env.store.read_state("book-1", "abs").await.unwrap().unwrap();
    assert!((abs_row.timestamp.unwrap() - 100.0).abs() < 1e-9);
    let ko_row = env
        .store
        .read_state("book-1", "kosync")
        .await
        .unwrap()
        .unwrap();
    assert!((ko_row.percentage.unwrap() - expected_pct).abs() < 0.01);
}

#[tokio::test]
async fn own_write_echo_is_suppressed() {
    let abs = MockClient::new(ClientName::Abs);
    let kosync = MockClient::new(ClientName::KoReaderSync);
    let env = build_env(vec![abs.clone(), kosync.clone()], true).await;
    active_mapping(&env.store, Some(36_000.0)).await;

    abs.set_audio(200.0, Some(36_000.0), 20.0);
    env.suppressor.record(ClientName::Abs, "book-1");

    env.engine.sync_cycle("book-1", false, None).await.unwrap();

    // The echo was treated as absent, so nothing contributed and nothing
    // was written anywhere.
    assert!(kosync.writes().is_empty());
    assert!(env.store.read_states("book-1").await.unwrap().is_empty());
}

#[tokio::test]
async fn sub_threshold_deltas_produce_zero_writes() {
    let abs = MockClient::new(ClientName::Abs);
    let kosync = MockClient::new(ClientName::KoReaderSync);
    let env = build_env(vec![abs.clone(), kosync.clone()], true).await;
    active_mapping(&env.store, Some(36_000.0)).await;

    // Cached: ABS at 1000s. New report moves 30s < 60s gate.
    env.store
        .write_state(&ClientStateRow {
            book_id: "book-1".into(),
            client_name: "abs".into(),
            last_updated: 50.0,
            percentage: Some(1000.0 / 36_000.0),
            timestamp: Some(1000.0),
            locator_json: None,
        })
        .await
        .unwrap();
    abs.set_audio(1030.0, Some(36_000.0), 100.0);

    env.engine.sync_cycle("book-1", false, None).await.unwrap();

    assert!(kosync.writes().is_empty());
    assert!(abs.writes().is_empty());
}

#[tokio::test]
async fn regression_from_new_source_is_refused_unless_forced() {
    let kosync = MockClient::new(ClientName::KoReaderSync);
    let storyteller = MockClient::new(ClientName::Storyteller);
    let env = build_env(vec![kosync.clone(), storyteller.clone()], false).await;
    active_mapping(&env.store, None).await;

    for client in ["kosync", "storyteller"] {
        env.store
            .write_state(&ClientStateRow {
                book_id: "book-1".into(),
                client_name: client.into(),
                last_updated: 100.0,
                percentage: Some(0.9),
                timestamp: None,
                locator_json: None,
            })
            .await
            .unwrap();
    }

    // A fresh device reports position zero.
    kosync.set_text(0.0, 500.0);
    env.engine.sync_cycle("book-1", false, None).await.unwrap();
    assert!(
        storyteller.writes().is_empty(),
        "backwards move must not propagate"
    );

    // The user can force it through.
    env.engine.sync_cycle("book-1", true, None).await.unwrap();
    assert_eq!(storyteller.writes().len(), 1);
    assert!(storyteller.writes()[0].locator.percentage < 0.01);
}

#[tokio::test]
async fn unresolvable_follower_is_skipped_others_continue() {
    let kosync = MockClient::new(ClientName::KoReaderSync);
    let storyteller = MockClient::new(ClientName::Storyteller);
    let hardcover = MockClient::new(ClientName::Hardcover);
    hardcover.behavior.lock().can_lead = false;
    let env = build_env(
        vec![kosync.clone(), storyteller.clone(), hardcover.clone()],
        false,
    )
    .await;
    active_mapping(&env.store, None).await;

    // The leader's snippet matches nothing in the follower's ebook, so
    // text-to-text translation fails; the percentage-only tracker still
    // gets its update.
    kosync.set_text(0.5, 100.0);
    kosync.set_snippet("entirely unrelated words about submarine maintenance manuals");

    env.engine.sync_cycle("book-1", false, None).await.unwrap();

    assert!(
        storyteller.writes().is_empty(),
        "unmatchable follower must be skipped"
    );
    assert_eq!(hardcover.writes().len(), 1);
    assert!((hardcover.writes()[0].locator.percentage - 0.5).abs() < 1e-9);

    // Mapping stays active: partial success is success.
    let mapping = env.store.load_mapping("book-1").await.unwrap().unwrap();
    assert_eq!(mapping.status, BookStatus::Active);
}

#[tokio::test]
async fn concurrent_cycles_for_one_book_are_serialized() {
    let abs = MockClient::new(ClientName::Abs);
    let kosync = MockClient::new(ClientName::KoReaderSync);
    let env = build_env(vec![abs.clone(), kosync.clone()], true).await;
    active_mapping(&env.store, Some(36_000.0)).await;

    abs.set_audio(300.0, Some(36_000.0), 100.0);

    let cycles = (0..5).map(|_| env.engine.sync_cycle("book-1", false, None));
    futures::future::join_all(cycles).await;

    // The per-book lock kept fetches single-file.
    assert_eq!(abs.max_in_flight.load(Ordering::SeqCst), 1);
    // Writes never exceed enqueued cycles; after the first one syncs the
    // store, later cycles fail the delta gate.
    assert!(kosync.writes().len() <= 5);
    assert_eq!(kosync.writes().len(), 1);
}

#[tokio::test]
async fn three_full_failures_park_the_mapping() {
    let kosync = MockClient::new(ClientName::KoReaderSync);
    let storyteller = MockClient::new(ClientName::Storyteller);
    storyteller.fail_updates(ErrorKind::Transient);
    let env = build_env(vec![kosync.clone(), storyteller.clone()], false).await;
    active_mapping(&env.store, None).await;

    for round in 0..3 {
        // Fresh movement each round so the delta gate passes.
        kosync.set_text(0.1 + round as f64 * 0.1, 100.0 + round as f64);
        kosync.set_snippet(&fixture_text()[200..600]);
        env.engine.sync_cycle("book-1", false, None).await.unwrap();
    }

    let mapping = env.store.load_mapping("book-1").await.unwrap().unwrap();
    assert_eq!(mapping.status, BookStatus::FailedRetryLater);
}

#[tokio::test]
async fn clear_progress_purges_rows_and_resets_clients() {
    let kosync = MockClient::new(ClientName::KoReaderSync);
    let storyteller = MockClient::new(ClientName::Storyteller);
    let env = build_env(vec![kosync.clone(), storyteller.clone()], false).await;
    active_mapping(&env.store, None).await;

    env.store
        .write_state(&ClientStateRow {
            book_id: "book-1".into(),
            client_name: "kosync".into(),
            last_updated: 100.0,
            percentage: Some(0.4),
            timestamp: None,
            locator_json: None,
        })
        .await
        .unwrap();
    env.store
        .save_kosync_document(&KosyncDocument {
            document: "doc-hash".into(),
            username: "reader".into(),
            progress: String::new(),
            percentage: 0.4,
            device: "boox".into(),
            device_id: "d1".into(),
            timestamp: 100.0,
        })
        .await
        .unwrap();

    let summary = env.engine.clear_progress("book-1").await.unwrap();
    assert_eq!(summary["states_cleared"], 1);

    // Every client got reset to zero.
    assert_eq!(kosync.writes().len(), 1);
    assert!((kosync.writes()[0].locator.percentage).abs() < 1e-9);
    assert_eq!(storyteller.writes().len(), 1);

    // Rows purged, KoSync document dropped, status untouched.
    assert!(env.store.read_states("book-1").await.unwrap().is_empty());
    assert!(env
        .store
        .kosync_document("doc-hash")
        .await
        .unwrap()
        .is_none());
    let mapping = env.store.load_mapping("book-1").await.unwrap().unwrap();
    assert_eq!(mapping.status, BookStatus::Active);
}

#[tokio::test]
async fn inactive_mappings_never_sync() {
    let kosync = MockClient::new(ClientName::KoReaderSync);
    let storyteller = MockClient::new(ClientName::Storyteller);
    let env = build_env(vec![kosync.clone(), storyteller.clone()], false).await;

    let mut mapping = active_mapping(&env.store, None).await;
    mapping.status = BookStatus::Pending;
    env.store.save_mapping(&mapping).await.unwrap();

    kosync.set_text(0.5, 100.0);
    env.engine.sync_cycle("book-1", false, None).await.unwrap();
    assert!(storyteller.writes().is_empty());
}
