//! Progress store integration tests against a throwaway database

use bookbridge_common::db::{self, models::*, ProgressStore};

async fn test_store() -> ProgressStore {
    let tmp = tempfile::tempdir().unwrap();
    let pool = db::init_database(&tmp.path().join("test.db")).await.unwrap();
    // Keep the backing file alive for the duration of the test process.
    std::mem::forget(tmp);
    ProgressStore::new(pool)
}

#[tokio::test]
async fn mapping_round_trip() {
    let store = test_store().await;

    let mut mapping = Mapping::new("lib-item-1".into(), "The Stand".into());
    mapping.author = Some("Stephen King".into());
    mapping.ebook_filename = Some("the-stand.epub".into());
    store.save_mapping(&mapping).await.unwrap();

    let loaded = store.load_mapping("lib-item-1").await.unwrap().unwrap();
    assert_eq!(loaded.title, "The Stand");
    assert_eq!(loaded.status, BookStatus::Pending);
    assert_eq!(loaded.sync_mode, SyncMode::Audiobook);

    assert!(store.load_mapping("missing").await.unwrap().is_none());
}

#[tokio::test]
async fn only_active_mappings_are_listed_as_active() {
    let store = test_store().await;

    let mut a = Mapping::new("a".into(), "A".into());
    a.status = BookStatus::Active;
    let b = Mapping::new("b".into(), "B".into());
    store.save_mapping(&a).await.unwrap();
    store.save_mapping(&b).await.unwrap();

    let active = store.list_active_mappings().await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].book_id, "a");
}

#[tokio::test]
async fn client_state_upsert_and_reset() {
    let store = test_store().await;

    let row = ClientStateRow {
        book_id: "a".into(),
        client_name: "abs".into(),
        last_updated: 100.0,
        percentage: Some(0.25),
        timestamp: Some(900.0),
        locator_json: None,
    };
    store.write_state(&row).await.unwrap();

    let mut updated = row.clone();
    updated.last_updated = 200.0;
    updated.percentage = Some(0.5);
    store.write_state(&updated).await.unwrap();

    let loaded = store.read_state("a", "abs").await.unwrap().unwrap();
    assert_eq!(loaded.percentage, Some(0.5));
    assert_eq!(loaded.last_updated, 200.0);

    let other = ClientStateRow {
        client_name: "kosync".into(),
        ..row.clone()
    };
    store.write_state(&other).await.unwrap();
    assert_eq!(store.read_states("a").await.unwrap().len(), 2);

    let cleared = store.reset_state("a").await.unwrap();
    assert_eq!(cleared, 2);
    assert!(store.read_states("a").await.unwrap().is_empty());
}

#[tokio::test]
async fn delete_mapping_purges_attached_rows() {
    let store = test_store().await;

    let mut mapping = Mapping::new("a".into(), "A".into());
    mapping.kosync_doc_id = Some("deadbeef".into());
    store.save_mapping(&mapping).await.unwrap();

    store
        .write_state(&ClientStateRow {
            book_id: "a".into(),
            client_name: "abs".into(),
            last_updated: 1.0,
            percentage: Some(0.1),
            timestamp: None,
            locator_json: None,
        })
        .await
        .unwrap();
    store
        .save_job(&TranscriptionJob::queued("a".into()))
        .await
        .unwrap();
    store
        .save_kosync_document(&KosyncDocument {
            document: "deadbeef".into(),
            username: "reader".into(),
            progress: "/body/DocFragment[3]/body/p[1]/text().0".into(),
            percentage: 0.1,
            device: "boox".into(),
            device_id: "d1".into(),
            timestamp: 1.0,
        })
        .await
        .unwrap();

    store.delete_mapping("a").await.unwrap();

    assert!(store.load_mapping("a").await.unwrap().is_none());
    assert!(store.read_states("a").await.unwrap().is_empty());
    assert!(store.load_job("a").await.unwrap().is_none());
    assert!(store.kosync_document("deadbeef").await.unwrap().is_none());
}

#[tokio::test]
async fn job_state_round_trip() {
    let store = test_store().await;
    store
        .save_mapping(&Mapping::new("a".into(), "A".into()))
        .await
        .unwrap();

    let mut job = TranscriptionJob::queued("a".into());
    store.save_job(&job).await.unwrap();

    job.state = JobState::Running;
    job.chunks_done = 3;
    job.last_attempt = 1000.0;
    store.save_job(&job).await.unwrap();

    let loaded = store.load_job("a").await.unwrap().unwrap();
    assert_eq!(loaded.state, JobState::Running);
    assert_eq!(loaded.chunks_done, 3);
}

#[tokio::test]
async fn settings_round_trip() {
    let store = test_store().await;
    assert!(store.setting("sync_period_mins").await.unwrap().is_none());
    store.set_setting("sync_period_mins", "10").await.unwrap();
    store.set_setting("sync_period_mins", "15").await.unwrap();
    assert_eq!(
        store.setting("sync_period_mins").await.unwrap().as_deref(),
        Some("15")
    );
}
