//! Translator integration tests across coordinate systems

use std::sync::Arc;

use bookbridge_common::db::models::{AlignmentSource, Mapping, SyncMode};

use bookbridge_sync::align::{alignment_store, Anchor, AlignmentMap};
use bookbridge_sync::clients::{ClientName, ClientState, Position};
use bookbridge_sync::ebook::{EbookCache, EbookNode, EbookParser, ParsedEbook};
use bookbridge_sync::transcript::TranscriptStore;
use bookbridge_sync::translate::{LeaderPosition, Translator};

struct FixtureParser {
    text: String,
}

impl EbookParser for FixtureParser {
    fn parse(&self, _path: &std::path::Path) -> bookbridge_common::Result<ParsedEbook> {
        let body = EbookNode::new("body").child(EbookNode::new("p").text(self.text.clone()));
        Ok(ParsedEbook::from_spine(vec![("ch1.xhtml".into(), body)]))
    }
}

fn fixture_text() -> String {
    (0..600)
        .map(|i| format!("passage{i} narrates event{i} beside landmark{i} quietly"))
        .collect::<Vec<_>>()
        .join(" ")
}

struct TranslateEnv {
    _tmp: tempfile::TempDir,
    translator: Translator,
    mapping: Mapping,
    text: String,
}

fn build_env(alignment_source: AlignmentSource) -> TranslateEnv {
    let tmp = tempfile::tempdir().unwrap();
    let data_dir = tmp.path().to_path_buf();
    let books_dir = data_dir.join("books");
    std::fs::create_dir_all(&books_dir).unwrap();
    std::fs::write(books_dir.join("book.epub"), b"fixture").unwrap();

    let text = fixture_text();
    let text_len = text.chars().count();

    let ebooks = Arc::new(EbookCache::new(
        Arc::new(FixtureParser { text: text.clone() }),
        books_dir,
        data_dir.join("epub_cache"),
        3,
    ));
    let transcripts = Arc::new(TranscriptStore::new(data_dir.join("transcripts")));
    let alignments = alignment_store(&data_dir);

    // Linear narration: half the text at half the audio.
    let map = AlignmentMap::from_anchors(vec![
        Anchor { ch: 0, ts: 0.0 },
        Anchor {
            ch: text_len / 2,
            ts: 1800.0,
        },
        Anchor {
            ch: text_len,
            ts: 3600.0,
        },
    ])
    .unwrap();
    alignments.save("book-1", &map).unwrap();

    let translator = Translator::new(alignments, transcripts, ebooks, 80);

    let mut mapping = Mapping::new("book-1".into(), "Fixture".into());
    mapping.ebook_filename = Some("book.epub".into());
    mapping.sync_mode = SyncMode::Audiobook;
    mapping.alignment_source = alignment_source;
    mapping.duration_seconds = Some(3600.0);

    TranslateEnv {
        _tmp: tmp,
        translator,
        mapping,
        text,
    }
}

fn text_leader(pct: f64, snippet: Option<String>) -> LeaderPosition {
    LeaderPosition {
        client: ClientName::KoReaderSync,
        state: ClientState {
            last_updated: 100.0,
            position: Position::Text {
                percentage: pct,
                xpath: None,
                css_selector: None,
                fragment: None,
                cfi: None,
            },
        },
        percentage: pct,
        snippet,
    }
}

fn audio_leader(seconds: f64) -> LeaderPosition {
    LeaderPosition {
        client: ClientName::Abs,
        state: ClientState {
            last_updated: 100.0,
            position: Position::Audio {
                seconds,
                duration: Some(3600.0),
            },
        },
        percentage: seconds / 3600.0,
        snippet: None,
    }
}

#[test]
fn reader_position_translates_to_audio_seconds() {
    let env = build_env(AlignmentSource::Whisper);
    let text_len = env.text.chars().count();

    // Snippet lifted from the middle of the book.
    let mid = text_len / 2;
    let snippet: String = env.text.chars().skip(mid).take(400).collect();
    let leader = text_leader(0.5, Some(snippet));

    let locator = env
        .translator
        .translate(&env.mapping, &leader, ClientName::Abs)
        .unwrap()
        .expect("translation should resolve");

    let ts = locator.timestamp.expect("audio timestamp produced");
    assert!((1700.0..=1950.0).contains(&ts), "ts = {ts}");
    assert!((locator.percentage - ts / 3600.0).abs() < 1e-6);
}

#[test]
fn audio_position_translates_to_text_locator() {
    let env = build_env(AlignmentSource::Whisper);
    let leader = audio_leader(1800.0);

    let locator = env
        .translator
        .translate(&env.mapping, &leader, ClientName::KoReaderSync)
        .unwrap()
        .expect("translation should resolve");

    // Halfway through the audio lands halfway through the text.
    assert!((locator.percentage - 0.5).abs() < 0.02, "pct = {}", locator.percentage);
    assert!(locator.xpath.as_deref().unwrap_or("").ends_with("/text().0"));
}

#[test]
fn forced_alignment_fast_path_skips_fuzzy_matching() {
    let env = build_env(AlignmentSource::Storyteller);
    let leader = audio_leader(900.0);

    // No snippet is available, and none is needed.
    let locator = env
        .translator
        .translate(&env.mapping, &leader, ClientName::Storyteller)
        .unwrap()
        .expect("fast path should resolve");

    assert!((locator.percentage - 0.25).abs() < 0.02, "pct = {}", locator.percentage);
    assert!(locator.cfi.is_some());
}

#[test]
fn audio_to_text_without_alignment_is_unresolvable() {
    let env = build_env(AlignmentSource::Whisper);
    let mut mapping = env.mapping.clone();
    mapping.book_id = "book-without-alignment".into();

    let result = env
        .translator
        .translate(&mapping, &audio_leader(900.0), ClientName::KoReaderSync)
        .unwrap();
    assert!(result.is_none());
}

#[test]
fn audio_passthrough_keeps_timestamp() {
    let env = build_env(AlignmentSource::Whisper);
    let leader = audio_leader(1234.0);

    let locator = env
        .translator
        .translate(&env.mapping, &leader, ClientName::Abs)
        .unwrap()
        .unwrap();
    assert_eq!(locator.timestamp, Some(1234.0));
}
