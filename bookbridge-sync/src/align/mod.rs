//! Audio⇄text alignment
//!
//! Builds a monotonic map between transcript timestamps and ebook char
//! offsets by n-gram anchoring, then answers interpolated lookups in both
//! directions. The transcript and the ebook are the same narrative but not
//! identical text; anchoring on unique word n-grams tolerates narration
//! deviations, and piecewise-linear interpolation gives O(log n) lookups.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use bookbridge_common::{Error, Result};

use crate::ebook::locate::normalize;
use crate::transcript::WordToken;

/// Primary anchoring n-gram size
const NGRAM_PRIMARY: usize = 12;
/// Reduced n-gram size for the start backfill pass
const NGRAM_BACKFILL: usize = 6;
/// Backfill runs when the first anchor is this late into the audio
const BACKFILL_MIN_TS: f64 = 30.0;
/// ... and this far into the text
const BACKFILL_MIN_CH: usize = 1000;
/// Minimum surviving anchors for a usable map
const MIN_ANCHORS: usize = 3;

/// One correlation point between text and audio
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Anchor {
    /// Char offset into the ebook's extracted text
    pub ch: usize,
    /// Seconds into the audio
    pub ts: f64,
}

/// Monotonic piecewise-linear map between char offsets and timestamps
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlignmentMap {
    anchors: Vec<Anchor>,
}

impl AlignmentMap {
    /// Build from an already-monotonic anchor list (tests, artifacts)
    pub fn from_anchors(anchors: Vec<Anchor>) -> Result<Self> {
        if anchors.len() < 2 {
            return Err(Error::InvalidInput(
                "alignment map needs at least two anchors".into(),
            ));
        }
        for pair in anchors.windows(2) {
            if pair[1].ch <= pair[0].ch || pair[1].ts <= pair[0].ts {
                return Err(Error::InvalidInput(format!(
                    "non-monotonic anchors: ({}, {:.2}) then ({}, {:.2})",
                    pair[0].ch, pair[0].ts, pair[1].ch, pair[1].ts
                )));
            }
        }
        Ok(AlignmentMap { anchors })
    }

    pub fn anchors(&self) -> &[Anchor] {
        &self.anchors
    }

    /// Total audio duration implied by the map
    pub fn duration(&self) -> f64 {
        self.anchors.last().map(|a| a.ts).unwrap_or(0.0)
    }

    /// Interpolate a char offset for a timestamp, clamped at the extremes
    pub fn time_to_char(&self, ts: f64) -> usize {
        let first = self.anchors[0];
        let last = *self.anchors.last().expect("non-empty by construction");
        if ts <= first.ts {
            return first.ch;
        }
        if ts >= last.ts {
            return last.ch;
        }

        let idx = self
            .anchors
            .partition_point(|a| a.ts <= ts)
            .saturating_sub(1);
        let p1 = self.anchors[idx];
        let p2 = self.anchors[idx + 1];

        let time_span = p2.ts - p1.ts;
        if time_span <= 0.0 {
            return p1.ch;
        }
        let ratio = (ts - p1.ts) / time_span;
        p1.ch + ((p2.ch - p1.ch) as f64 * ratio) as usize
    }

    /// Interpolate a timestamp for a char offset, clamped at the extremes
    pub fn char_to_time(&self, ch: usize) -> f64 {
        let first = self.anchors[0];
        let last = *self.anchors.last().expect("non-empty by construction");
        if ch <= first.ch {
            return first.ts;
        }
        if ch >= last.ch {
            return last.ts;
        }

        let idx = self
            .anchors
            .partition_point(|a| a.ch <= ch)
            .saturating_sub(1);
        let p1 = self.anchors[idx];
        let p2 = self.anchors[idx + 1];

        let char_span = (p2.ch - p1.ch) as f64;
        if char_span <= 0.0 {
            return p1.ts;
        }
        let ratio = (ch - p1.ch) as f64 / char_span;
        p1.ts + (p2.ts - p1.ts) * ratio
    }
}

/// Build an alignment map from transcript word tokens and the ebook text.
///
/// Pass 1 anchors unique 12-gram windows globally; pass 2 densifies the
/// opening with 6-grams when the first anchor lands late. Non-monotonic
/// anchors are dropped; fewer than three survivors rejects the map.
pub fn build_alignment(words: &[WordToken], ebook_text: &str) -> Result<AlignmentMap> {
    let t_tokens = tokenize_transcript(words);
    let b_tokens = tokenize_book(ebook_text);

    if t_tokens.is_empty() || b_tokens.is_empty() {
        return Err(Error::InvalidInput("empty transcript or ebook text".into()));
    }

    let mut anchors = find_anchors(&t_tokens, &b_tokens, NGRAM_PRIMARY);
    anchors.sort_by_key(|a| a.anchor.ch);
    let mut valid = monotonic_filter(anchors);

    // Start backfill: recover the intro with a smaller n-gram, safe inside
    // the constrained window before the first global anchor.
    if let Some(first) = valid.first().copied() {
        if first.anchor.ts > BACKFILL_MIN_TS && first.anchor.ch > BACKFILL_MIN_CH {
            info!(
                first_ch = first.anchor.ch,
                first_ts = first.anchor.ts,
                "Late first anchor, backfilling start"
            );
            let t_slice = &t_tokens[..first.t_idx.min(t_tokens.len())];
            let b_slice = &b_tokens[..first.b_idx.min(b_tokens.len())];
            let mut early = find_anchors(t_slice, b_slice, NGRAM_BACKFILL);
            early.sort_by_key(|a| a.anchor.ch);
            let early = monotonic_filter(early);
            if !early.is_empty() {
                debug!(count = early.len(), "Backfill recovered early anchors");
                let mut merged = early;
                for a in valid {
                    let tail = merged.last().expect("non-empty");
                    if a.anchor.ch > tail.anchor.ch && a.anchor.ts > tail.anchor.ts {
                        merged.push(a);
                    }
                }
                valid = merged;
            }
        }
    }

    if valid.len() < MIN_ANCHORS {
        warn!(anchors = valid.len(), "Too few anchors for a usable map");
        return Err(Error::InvalidInput(format!(
            "only {} alignment anchors found",
            valid.len()
        )));
    }

    let mut map: Vec<Anchor> = Vec::with_capacity(valid.len() + 2);

    // Force the origin so positions before the first anchor interpolate
    // instead of clamping deep into the book.
    if valid[0].anchor.ch > 0 && valid[0].anchor.ts > 0.0 {
        map.push(Anchor { ch: 0, ts: 0.0 });
    }
    map.extend(valid.iter().map(|a| a.anchor));

    let text_len = ebook_text.chars().count();
    let end_ts = words.last().map(|w| w.end).unwrap_or(0.0);
    let tail = *map.last().expect("non-empty");
    if tail.ch < text_len && end_ts > tail.ts {
        map.push(Anchor {
            ch: text_len,
            ts: end_ts,
        });
    }

    info!(anchors = map.len(), "Alignment map built");
    AlignmentMap::from_anchors(map)
}

#[derive(Debug, Clone, Copy)]
struct RawAnchor {
    anchor: Anchor,
    t_idx: usize,
    b_idx: usize,
}

struct TranscriptToken {
    norm: String,
    /// End timestamp of the source word
    ts_end: f64,
}

struct BookToken {
    norm: String,
    /// Char offset of the word in the extracted text
    ch: usize,
}

fn tokenize_transcript(words: &[WordToken]) -> Vec<TranscriptToken> {
    words
        .iter()
        .filter_map(|w| {
            let norm = normalize(&w.text);
            if norm.is_empty() {
                None
            } else {
                Some(TranscriptToken {
                    norm,
                    ts_end: w.end,
                })
            }
        })
        .collect()
}

fn tokenize_book(text: &str) -> Vec<BookToken> {
    let mut tokens = Vec::new();
    let mut char_offset = 0usize;
    let mut word_start: Option<(usize, usize)> = None;

    for (byte_idx, ch) in text.char_indices() {
        if ch.is_whitespace() {
            if let Some((start_byte, start_char)) = word_start.take() {
                let norm = normalize(&text[start_byte..byte_idx]);
                if !norm.is_empty() {
                    tokens.push(BookToken {
                        norm,
                        ch: start_char,
                    });
                }
            }
        } else if word_start.is_none() {
            word_start = Some((byte_idx, char_offset));
        }
        char_offset += 1;
    }
    if let Some((start_byte, start_char)) = word_start {
        let norm = normalize(&text[start_byte..]);
        if !norm.is_empty() {
            tokens.push(BookToken {
                norm,
                ch: start_char,
            });
        }
    }
    tokens
}

/// Anchors from n-grams unique in both the transcript and the book
fn find_anchors(t_tokens: &[TranscriptToken], b_tokens: &[BookToken], n: usize) -> Vec<RawAnchor> {
    use std::collections::HashMap;

    if t_tokens.len() < n || b_tokens.len() < n {
        return Vec::new();
    }

    let mut book_grams: HashMap<String, Vec<usize>> = HashMap::new();
    for j in 0..=(b_tokens.len() - n) {
        let key = gram_key(b_tokens[j..j + n].iter().map(|t| t.norm.as_str()));
        book_grams.entry(key).or_default().push(j);
    }

    let mut transcript_grams: HashMap<String, Vec<usize>> = HashMap::new();
    let mut i = 0;
    while i + n <= t_tokens.len() {
        let key = gram_key(t_tokens[i..i + n].iter().map(|t| t.norm.as_str()));
        transcript_grams.entry(key).or_default().push(i);
        i += n;
    }

    let mut found = Vec::new();
    for (key, t_positions) in transcript_grams {
        if t_positions.len() != 1 {
            continue;
        }
        let Some(b_positions) = book_grams.get(&key) else {
            continue;
        };
        if b_positions.len() != 1 {
            continue;
        }

        let t_idx = t_positions[0];
        let b_idx = b_positions[0];
        found.push(RawAnchor {
            anchor: Anchor {
                ch: b_tokens[b_idx + n - 1].ch,
                ts: t_tokens[t_idx + n - 1].ts_end,
            },
            t_idx,
            b_idx,
        });
    }
    found
}

fn gram_key<'a>(words: impl Iterator<Item = &'a str>) -> String {
    words.collect::<Vec<_>>().join("_")
}

/// Keep only anchors strictly increasing in both dimensions
fn monotonic_filter(sorted: Vec<RawAnchor>) -> Vec<RawAnchor> {
    let mut valid: Vec<RawAnchor> = Vec::with_capacity(sorted.len());
    for a in sorted {
        match valid.last() {
            None => valid.push(a),
            Some(prev) if a.anchor.ts > prev.anchor.ts && a.anchor.ch > prev.anchor.ch => {
                valid.push(a)
            }
            Some(_) => {}
        }
    }
    valid
}

// ----------------------------------------------------------------------
// Artifact persistence: alignments/<book_id>.json
// ----------------------------------------------------------------------

/// Filesystem home of alignment artifacts
#[derive(Clone)]
pub struct AlignmentStore {
    dir: PathBuf,
}

impl AlignmentStore {
    pub fn new(dir: PathBuf) -> Self {
        AlignmentStore { dir }
    }

    fn path_for(&self, book_id: &str) -> PathBuf {
        self.dir.join(format!("{book_id}.json"))
    }

    pub fn save(&self, book_id: &str, map: &AlignmentMap) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(book_id);
        let json = serde_json::to_string(map.anchors())?;
        std::fs::write(&path, json)?;
        Ok(path)
    }

    pub fn load(&self, book_id: &str) -> Result<Option<AlignmentMap>> {
        let path = self.path_for(book_id);
        if !path.exists() {
            return Ok(None);
        }
        let json = std::fs::read_to_string(&path)?;
        let anchors: Vec<Anchor> = serde_json::from_str(&json)?;
        Ok(Some(AlignmentMap::from_anchors(anchors)?))
    }

    pub fn exists(&self, book_id: &str) -> bool {
        self.path_for(book_id).exists()
    }

    pub fn delete(&self, book_id: &str) -> Result<()> {
        let path = self.path_for(book_id);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }
}

/// Convenience for callers that only have a data dir
pub fn alignment_store(data_dir: &Path) -> AlignmentStore {
    AlignmentStore::new(data_dir.join("alignments"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map() -> AlignmentMap {
        AlignmentMap::from_anchors(vec![
            Anchor { ch: 0, ts: 0.0 },
            Anchor { ch: 500, ts: 50.0 },
            Anchor { ch: 1000, ts: 110.0 },
        ])
        .unwrap()
    }

    #[test]
    fn interpolates_between_anchors() {
        let m = map();
        assert_eq!(m.time_to_char(25.0), 250);
        assert_eq!(m.time_to_char(55.0), 541); // 500 + 500 * 5/60
        assert!((m.char_to_time(250) - 25.0).abs() < 1e-9);
    }

    #[test]
    fn clamps_at_extremes() {
        let m = map();
        assert_eq!(m.time_to_char(-5.0), 0);
        assert_eq!(m.time_to_char(1e6), 1000);
        assert_eq!(m.char_to_time(0), 0.0);
        assert_eq!(m.char_to_time(99999), 110.0);
    }

    #[test]
    fn round_trip_at_anchors() {
        let m = map();
        for anchor in m.anchors() {
            assert_eq!(m.time_to_char(anchor.ts), anchor.ch);
            assert!((m.char_to_time(anchor.ch) - anchor.ts).abs() < 1e-9);
        }
    }

    #[test]
    fn rejects_non_monotonic_anchor_lists() {
        let result = AlignmentMap::from_anchors(vec![
            Anchor { ch: 0, ts: 0.0 },
            Anchor { ch: 500, ts: 50.0 },
            Anchor { ch: 400, ts: 60.0 },
        ]);
        assert!(result.is_err());
    }

    fn words_for(text: &str, start: f64) -> Vec<WordToken> {
        text.split_whitespace()
            .enumerate()
            .map(|(i, w)| WordToken {
                text: w.to_string(),
                start: start + i as f64 * 0.4,
                end: start + (i as f64 + 1.0) * 0.4,
            })
            .collect()
    }

    fn distinct_narrative(sentences: usize) -> String {
        // Pseudo-random-free distinct word stream so every 12-gram is unique
        (0..sentences)
            .map(|i| format!("chapter{i} begins while narrator{i} describes scene{i} slowly"))
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[test]
    fn builds_monotonic_map_from_matching_text() {
        let text = distinct_narrative(40);
        let words = words_for(&text, 0.0);

        let map = build_alignment(&words, &text).unwrap();
        let anchors = map.anchors();
        assert!(anchors.len() >= MIN_ANCHORS);
        for pair in anchors.windows(2) {
            assert!(pair[1].ch > pair[0].ch);
            assert!(pair[1].ts > pair[0].ts);
        }
        // Ends clamp to the full text span.
        assert_eq!(anchors.last().unwrap().ch, text.chars().count());
    }

    #[test]
    fn rejects_unrelated_text() {
        let text = distinct_narrative(30);
        let words = words_for("totally different words that never appear in the book at all", 0.0);
        assert!(build_alignment(&words, &text).is_err());
    }

    #[test]
    fn artifact_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = AlignmentStore::new(dir.path().join("alignments"));
        let m = map();

        store.save("book-1", &m).unwrap();
        assert!(store.exists("book-1"));
        let loaded = store.load("book-1").unwrap().unwrap();
        assert_eq!(loaded.anchors(), m.anchors());

        store.delete("book-1").unwrap();
        assert!(store.load("book-1").unwrap().is_none());
    }
}
