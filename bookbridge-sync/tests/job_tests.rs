//! Transcription job lifecycle tests
//!
//! Startup recovery and resume bookkeeping; the transcriber itself is an
//! external collaborator and never runs here.

use std::sync::Arc;
use std::time::Duration;

use bookbridge_common::db::models::*;
use bookbridge_common::db::{self, ProgressStore};
use bookbridge_common::events::EventBus;

use bookbridge_sync::align::{alignment_store, Anchor, AlignmentMap, AlignmentStore};
use bookbridge_sync::clients::abs::AbsClient;
use bookbridge_sync::ebook::{EbookCache, EbookNode, EbookParser, ParsedEbook};
use bookbridge_sync::jobs::{JobConfig, JobManager};
use bookbridge_sync::transcript::{RemoteTranscriber, TranscriptStore, WordToken};

struct FixtureParser;

impl EbookParser for FixtureParser {
    fn parse(&self, _path: &std::path::Path) -> bookbridge_common::Result<ParsedEbook> {
        let body = EbookNode::new("body").child(EbookNode::new("p").text("fixture text"));
        Ok(ParsedEbook::from_spine(vec![("ch1.xhtml".into(), body)]))
    }
}

struct JobEnv {
    _tmp: tempfile::TempDir,
    store: ProgressStore,
    alignments: AlignmentStore,
    transcripts: Arc<TranscriptStore>,
    manager: JobManager,
}

async fn build_env() -> JobEnv {
    let tmp = tempfile::tempdir().unwrap();
    let data_dir = tmp.path().to_path_buf();

    let pool = db::init_database(&data_dir.join("test.db")).await.unwrap();
    let store = ProgressStore::new(pool);

    let transcripts = Arc::new(TranscriptStore::new(data_dir.join("transcripts")));
    let alignments = alignment_store(&data_dir);
    let ebooks = Arc::new(EbookCache::new(
        Arc::new(FixtureParser),
        data_dir.join("books"),
        data_dir.join("epub_cache"),
        3,
    ));

    let manager = JobManager::new(
        store.clone(),
        Arc::new(AbsClient::new(String::new(), String::new(), Duration::from_secs(5)).unwrap()),
        Arc::new(RemoteTranscriber::new(String::new()).unwrap()),
        transcripts.clone(),
        alignments.clone(),
        ebooks,
        None,
        EventBus::new(16),
        JobConfig {
            max_retries: 5,
            retry_delay: Duration::from_secs(900),
            model: "base".into(),
            audio_cache_dir: data_dir.join("audio_cache"),
            epub_cache_dir: data_dir.join("epub_cache"),
        },
    );

    JobEnv {
        _tmp: tmp,
        store,
        alignments,
        transcripts,
        manager,
    }
}

fn sample_alignment() -> AlignmentMap {
    AlignmentMap::from_anchors(vec![
        Anchor { ch: 0, ts: 0.0 },
        Anchor { ch: 500, ts: 50.0 },
        Anchor { ch: 1000, ts: 110.0 },
    ])
    .unwrap()
}

async fn mapping_with_status(store: &ProgressStore, book_id: &str, status: BookStatus) -> Mapping {
    let mut mapping = Mapping::new(book_id.into(), format!("Book {book_id}"));
    mapping.status = status;
    mapping.ebook_filename = Some("book.epub".into());
    store.save_mapping(&mapping).await.unwrap();
    mapping
}

#[tokio::test]
async fn interrupted_processing_job_is_parked_for_retry() {
    let env = build_env().await;
    mapping_with_status(&env.store, "b1", BookStatus::Processing).await;

    env.manager.recover_stale_jobs().await.unwrap();

    let mapping = env.store.load_mapping("b1").await.unwrap().unwrap();
    assert_eq!(mapping.status, BookStatus::FailedRetryLater);

    let job = env.store.load_job("b1").await.unwrap().unwrap();
    assert_eq!(job.state, JobState::FailedRetryLater);
    assert_eq!(job.last_error.as_deref(), Some("Interrupted by restart"));
}

#[tokio::test]
async fn finished_job_with_lost_status_update_becomes_active() {
    let env = build_env().await;
    mapping_with_status(&env.store, "b1", BookStatus::Processing).await;
    env.alignments.save("b1", &sample_alignment()).unwrap();

    env.manager.recover_stale_jobs().await.unwrap();

    let mapping = env.store.load_mapping("b1").await.unwrap().unwrap();
    assert_eq!(mapping.status, BookStatus::Active);
}

#[tokio::test]
async fn failed_mapping_with_orphan_alignment_recovers() {
    let env = build_env().await;
    mapping_with_status(&env.store, "b1", BookStatus::FailedRetryLater).await;
    env.alignments.save("b1", &sample_alignment()).unwrap();

    env.manager.recover_stale_jobs().await.unwrap();

    let mapping = env.store.load_mapping("b1").await.unwrap().unwrap();
    assert_eq!(mapping.status, BookStatus::Active);
}

#[tokio::test]
async fn active_mappings_are_left_alone() {
    let env = build_env().await;
    mapping_with_status(&env.store, "b1", BookStatus::Active).await;

    env.manager.recover_stale_jobs().await.unwrap();

    let mapping = env.store.load_mapping("b1").await.unwrap().unwrap();
    assert_eq!(mapping.status, BookStatus::Active);
    assert!(env.store.load_job("b1").await.unwrap().is_none());
}

#[tokio::test]
async fn persisted_chunks_survive_for_resume() {
    let env = build_env().await;

    // Three chunks done before the interruption.
    for index in 0..3usize {
        let words: Vec<WordToken> = (0..10)
            .map(|i| WordToken {
                text: format!("word{index}_{i}"),
                start: index as f64 * 100.0 + i as f64,
                end: index as f64 * 100.0 + i as f64 + 0.9,
            })
            .collect();
        env.transcripts.save_chunk("b1", index, &words).unwrap();
    }

    // The worker's resume check: completed chunks are present, the next
    // one is not.
    for index in 0..3usize {
        assert!(env.transcripts.chunk_exists("b1", index));
    }
    assert!(!env.transcripts.chunk_exists("b1", 3));

    // Accumulated words keep chunk order and absolute timestamps.
    let words = env.transcripts.load_words("b1").unwrap();
    assert_eq!(words.len(), 30);
    assert!(words.windows(2).all(|pair| pair[0].start <= pair[1].start));
}
