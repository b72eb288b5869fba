//! Transcript storage and the pluggable transcriber
//!
//! Transcripts are stored chunk-by-chunk under
//! `transcripts/<book_id>/chunk-<n>.json` so an interrupted job resumes
//! where it stopped. Lookup helpers answer "what text is spoken around
//! this timestamp" and "when is this text spoken" for the translator.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use bookbridge_common::{Error, Result};

use crate::ebook::locate::{normalize, token_set_ratio};

/// One transcribed word with absolute timestamps in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WordToken {
    pub text: String,
    pub start: f64,
    pub end: f64,
}

/// Words produced from one audio chunk
pub type TranscriptChunk = Vec<WordToken>;

/// Pluggable transcription engine (external collaborator)
///
/// Implementations may shell out locally, call a remote inference server,
/// or talk to a cloud API; the job manager only sees word tokens with
/// chunk-relative timestamps.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio_path: &Path, model_hint: &str)
        -> Result<Vec<TranscriptChunk>>;
}

/// Remote HTTP transcriber (whisper-server style)
pub struct RemoteTranscriber {
    base_url: String,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct RemoteTranscription {
    words: Vec<WordToken>,
}

impl RemoteTranscriber {
    pub fn new(base_url: String) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(3600))
            .build()
            .map_err(|e| Error::Internal(format!("http client: {e}")))?;
        Ok(RemoteTranscriber { base_url, http })
    }
}

#[async_trait]
impl Transcriber for RemoteTranscriber {
    async fn transcribe(
        &self,
        audio_path: &Path,
        model_hint: &str,
    ) -> Result<Vec<TranscriptChunk>> {
        let bytes = tokio::fs::read(audio_path).await?;
        let url = format!("{}/inference?model={}", self.base_url, model_hint);

        debug!(path = %audio_path.display(), url = %url, "Sending audio chunk for transcription");

        let response = self
            .http
            .post(&url)
            .header("content-type", "application/octet-stream")
            .body(bytes)
            .send()
            .await
            .map_err(|e| Error::Internal(format!("transcriber request: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::Internal(format!(
                "transcriber returned {}",
                response.status()
            )));
        }

        let parsed: RemoteTranscription = response
            .json()
            .await
            .map_err(|e| Error::Internal(format!("transcriber response: {e}")))?;

        Ok(vec![parsed.words])
    }
}

/// Filesystem + cache layer over per-chunk transcript JSON
pub struct TranscriptStore {
    dir: PathBuf,
    cache: Mutex<Vec<(String, Arc<Vec<WordToken>>)>>,
    cache_capacity: usize,
}

impl TranscriptStore {
    pub fn new(dir: PathBuf) -> Self {
        TranscriptStore {
            dir,
            cache: Mutex::new(Vec::new()),
            cache_capacity: 3,
        }
    }

    fn book_dir(&self, book_id: &str) -> PathBuf {
        self.dir.join(book_id)
    }

    fn chunk_path(&self, book_id: &str, index: usize) -> PathBuf {
        self.book_dir(book_id).join(format!("chunk-{index}.json"))
    }

    pub fn chunk_exists(&self, book_id: &str, index: usize) -> bool {
        self.chunk_path(book_id, index).exists()
    }

    pub fn save_chunk(&self, book_id: &str, index: usize, words: &[WordToken]) -> Result<()> {
        std::fs::create_dir_all(self.book_dir(book_id))?;
        let json = serde_json::to_string(words)?;
        std::fs::write(self.chunk_path(book_id, index), json)?;
        self.invalidate(book_id);
        Ok(())
    }

    pub fn load_chunk(&self, book_id: &str, index: usize) -> Result<Vec<WordToken>> {
        let json = std::fs::read_to_string(self.chunk_path(book_id, index))?;
        Ok(serde_json::from_str(&json)?)
    }

    /// All persisted words for a book, in chunk order, cached
    pub fn load_words(&self, book_id: &str) -> Result<Arc<Vec<WordToken>>> {
        {
            let mut cache = self.cache.lock();
            if let Some(pos) = cache.iter().position(|(id, _)| id == book_id) {
                let entry = cache.remove(pos);
                let words = entry.1.clone();
                cache.push(entry);
                return Ok(words);
            }
        }

        let mut words = Vec::new();
        let mut index = 0;
        loop {
            let path = self.chunk_path(book_id, index);
            if !path.exists() {
                break;
            }
            let chunk: Vec<WordToken> = serde_json::from_str(&std::fs::read_to_string(path)?)?;
            words.extend(chunk);
            index += 1;
        }
        if words.is_empty() {
            return Err(Error::NotFound(format!("transcript for {book_id}")));
        }

        let words = Arc::new(words);
        let mut cache = self.cache.lock();
        cache.push((book_id.to_string(), words.clone()));
        while cache.len() > self.cache_capacity {
            cache.remove(0);
        }
        Ok(words)
    }

    pub fn delete_book(&self, book_id: &str) -> Result<()> {
        let dir = self.book_dir(book_id);
        if dir.exists() {
            std::fs::remove_dir_all(dir)?;
        }
        self.invalidate(book_id);
        Ok(())
    }

    fn invalidate(&self, book_id: &str) {
        let mut cache = self.cache.lock();
        cache.retain(|(id, _)| id != book_id);
    }

    /// ~800 characters of transcript text around a timestamp
    pub fn text_at_time(&self, book_id: &str, ts: f64) -> Result<Option<String>> {
        let words = self.load_words(book_id)?;
        Ok(text_around(&words, ts))
    }

    /// Windowed fuzzy search for a snippet's timestamp
    pub fn find_time_for_text(
        &self,
        book_id: &str,
        snippet: &str,
        hint_pct: Option<f64>,
        threshold: u32,
    ) -> Result<Option<f64>> {
        let words = self.load_words(book_id)?;
        Ok(find_time(&words, snippet, hint_pct, threshold))
    }
}

const CONTEXT_CHARS: usize = 800;
/// Transcript search window in words, sized to match the snippet scale
const SEARCH_WINDOW_WORDS: usize = 150;

/// Gather surrounding words until ~800 chars of context
pub fn text_around(words: &[WordToken], ts: f64) -> Option<String> {
    if words.is_empty() {
        return None;
    }

    let center = match words.iter().position(|w| w.start <= ts && ts <= w.end) {
        Some(idx) => idx,
        None => {
            // Closest word when the timestamp falls in a gap
            let mut best = 0;
            let mut best_dist = f64::INFINITY;
            for (i, w) in words.iter().enumerate() {
                let dist = (ts - w.start).abs().min((ts - w.end).abs());
                if dist < best_dist {
                    best_dist = dist;
                    best = i;
                }
            }
            best
        }
    };

    let mut lo = center;
    let mut hi = center + 1;
    let mut len = words[center].text.len();
    while len < CONTEXT_CHARS {
        let mut grew = false;
        if lo > 0 {
            lo -= 1;
            len += words[lo].text.len() + 1;
            grew = true;
        }
        if len < CONTEXT_CHARS && hi < words.len() {
            len += words[hi].text.len() + 1;
            hi += 1;
            grew = true;
        }
        if !grew {
            break;
        }
    }

    let text: Vec<&str> = words[lo..hi].iter().map(|w| w.text.as_str()).collect();
    Some(text.join(" "))
}

/// Best-scoring window's start timestamp, hint region first
pub fn find_time(
    words: &[WordToken],
    snippet: &str,
    hint_pct: Option<f64>,
    threshold: u32,
) -> Option<f64> {
    if words.is_empty() {
        return None;
    }
    let needle = normalize(snippet);
    if needle.is_empty() {
        return None;
    }

    let total_duration = words.last().map(|w| w.end).unwrap_or(0.0);
    let step = SEARCH_WINDOW_WORDS / 2;

    let score_window = |start: usize| -> (u32, f64) {
        let end = (start + SEARCH_WINDOW_WORDS).min(words.len());
        let text: Vec<&str> = words[start..end].iter().map(|w| w.text.as_str()).collect();
        let score = token_set_ratio(&needle, &normalize(&text.join(" ")));
        (score, words[start].start)
    };

    // Pass 1: windows near the hint
    if let Some(hint) = hint_pct {
        let lo_ts = (hint - 0.15).max(0.0) * total_duration;
        let hi_ts = (hint + 0.15).min(1.0) * total_duration;

        let mut best: Option<(u32, f64)> = None;
        let mut i = 0;
        while i < words.len() {
            if words[i].start >= lo_ts && words[i].start <= hi_ts {
                let candidate = score_window(i);
                if best.map_or(true, |(s, _)| candidate.0 > s) {
                    best = Some(candidate);
                }
            }
            i += step.max(1);
        }
        if let Some((score, ts)) = best {
            if score >= threshold {
                debug!(score, ts, "Transcript match near hint");
                return Some(ts);
            }
        }
    }

    // Pass 2: all windows
    let mut best: Option<(u32, f64)> = None;
    let mut i = 0;
    while i < words.len() {
        let candidate = score_window(i);
        if best.map_or(true, |(s, _)| candidate.0 > s) {
            best = Some(candidate);
        }
        i += step.max(1);
    }

    match best {
        Some((score, ts)) if score >= threshold => {
            debug!(score, ts, "Transcript match");
            Some(ts)
        }
        Some((score, _)) => {
            warn!(score, threshold, "No transcript window met the threshold");
            None
        }
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn narration(words_text: &str) -> Vec<WordToken> {
        words_text
            .split_whitespace()
            .enumerate()
            .map(|(i, w)| WordToken {
                text: w.to_string(),
                start: i as f64 * 0.5,
                end: (i as f64 + 1.0) * 0.5,
            })
            .collect()
    }

    #[test]
    fn text_around_centers_on_timestamp() {
        let words = narration(&"alpha ".repeat(50));
        let text = text_around(&words, 10.0).unwrap();
        assert!(text.contains("alpha"));
    }

    #[test]
    fn find_time_locates_distinct_phrase() {
        let mut text = String::new();
        for i in 0..200 {
            text.push_str(&format!("filler{i} word{i} "));
        }
        text.push_str("the unmistakable phrase about lighthouse keepers appears here ");
        for i in 200..400 {
            text.push_str(&format!("filler{i} word{i} "));
        }
        let words = narration(&text);

        let ts = find_time(
            &words,
            "the unmistakable phrase about lighthouse keepers appears here",
            None,
            60,
        )
        .unwrap();
        // Phrase begins at word ~400 of ~808, i.e. near the middle
        let total = words.last().unwrap().end;
        assert!(ts > total * 0.3 && ts < total * 0.7, "ts = {ts}");
    }

    #[test]
    fn find_time_rejects_unrelated_text() {
        let words = narration(&"steady stream of identical narration ".repeat(40));
        assert!(find_time(&words, "xylophone quantum bureaucracy", None, 80).is_none());
    }

    #[test]
    fn chunk_store_round_trip_and_resume_flags() {
        let dir = tempfile::tempdir().unwrap();
        let store = TranscriptStore::new(dir.path().join("transcripts"));

        let chunk0 = narration("one two three");
        let chunk1 = narration("four five six");
        store.save_chunk("b1", 0, &chunk0).unwrap();
        assert!(store.chunk_exists("b1", 0));
        assert!(!store.chunk_exists("b1", 1));

        store.save_chunk("b1", 1, &chunk1).unwrap();
        let words = store.load_words("b1").unwrap();
        assert_eq!(words.len(), 6);

        store.delete_book("b1").unwrap();
        assert!(store.load_words("b1").is_err());
    }
}
