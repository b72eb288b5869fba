//! Position translation between coordinate systems
//!
//! Converts the elected leader's position into each follower's native
//! locator: audio seconds for the audiobook server, rich text locators for
//! ebook clients. Alignment lookups give the hint, the text locator does
//! the precise anchoring.

use std::sync::Arc;

use tracing::{debug, warn};

use bookbridge_common::db::models::{AlignmentSource, Mapping};
use bookbridge_common::Result;

use crate::align::AlignmentStore;
use crate::clients::{ClientName, ClientState, Locator, Position};
use crate::ebook::locate::TextLocator;
use crate::ebook::EbookCache;
use crate::transcript::TranscriptStore;

/// The leader's position as seen by the engine, plus its extracted text
#[derive(Debug, Clone)]
pub struct LeaderPosition {
    pub client: ClientName,
    pub state: ClientState,
    /// Normalized 0.0–1.0 fraction of the book
    pub percentage: f64,
    /// Text at the leader's position (transcript slice or reader page)
    pub snippet: Option<String>,
}

impl LeaderPosition {
    fn is_audio(&self) -> bool {
        matches!(self.state.position, Position::Audio { .. })
    }
}

pub struct Translator {
    alignments: AlignmentStore,
    transcripts: Arc<TranscriptStore>,
    ebooks: Arc<EbookCache>,
    locator: TextLocator,
    fuzzy_threshold: u32,
}

impl Translator {
    pub fn new(
        alignments: AlignmentStore,
        transcripts: Arc<TranscriptStore>,
        ebooks: Arc<EbookCache>,
        fuzzy_threshold: u32,
    ) -> Self {
        Translator {
            alignments,
            transcripts,
            ebooks,
            locator: TextLocator::new(fuzzy_threshold),
            fuzzy_threshold,
        }
    }

    /// Produce the follower's native locator for the leader position.
    ///
    /// `Ok(None)` means the position could not be resolved confidently;
    /// the engine skips that follower and carries on.
    pub fn translate(
        &self,
        mapping: &Mapping,
        leader: &LeaderPosition,
        follower: ClientName,
    ) -> Result<Option<Locator>> {
        match follower {
            ClientName::Abs => self.to_audio(mapping, leader),
            ClientName::Hardcover => {
                // Percentage-only tracker
                Ok(Some(Locator::from_percentage(leader.percentage)))
            }
            _ => self.to_text(mapping, leader, follower),
        }
    }

    /// Leader position → audio seconds
    fn to_audio(&self, mapping: &Mapping, leader: &LeaderPosition) -> Result<Option<Locator>> {
        // Same coordinate system: pass the timestamp through.
        if let Position::Audio { seconds, duration } = &leader.state.position {
            let mut locator = Locator::from_percentage(leader.percentage);
            locator.timestamp = Some(*seconds);
            if duration.is_none() && mapping.duration_seconds.is_none() {
                warn!(book_id = %mapping.book_id, "Audio passthrough without known duration");
            }
            return Ok(Some(locator));
        }

        let Some(alignment) = self.alignments.load(&mapping.book_id)? else {
            debug!(book_id = %mapping.book_id, "No alignment, cannot translate text to audio");
            return Ok(None);
        };

        // Confirm or refine the char offset before mapping into time.
        let char_offset = self.resolve_char_offset(mapping, leader)?;

        let ts = match char_offset {
            Some(ch) => alignment.char_to_time(ch),
            None => {
                // Last resort: fuzzy-search the snippet in the transcript
                let Some(snippet) = &leader.snippet else {
                    return Ok(None);
                };
                match self.transcripts.find_time_for_text(
                    &mapping.book_id,
                    snippet,
                    Some(leader.percentage),
                    self.fuzzy_threshold,
                )? {
                    Some(ts) => ts,
                    None => return Ok(None),
                }
            }
        };

        let duration = mapping
            .duration_seconds
            .filter(|d| *d > 0.0)
            .unwrap_or_else(|| alignment.duration());
        let pct = if duration > 0.0 {
            (ts / duration).clamp(0.0, 1.0)
        } else {
            leader.percentage
        };

        let mut locator = Locator::from_percentage(pct);
        locator.timestamp = Some(ts);
        Ok(Some(locator))
    }

    /// Leader position → rich text locator
    fn to_text(
        &self,
        mapping: &Mapping,
        leader: &LeaderPosition,
        follower: ClientName,
    ) -> Result<Option<Locator>> {
        let Some(filename) = &mapping.ebook_filename else {
            // No ebook representation: fall back to bare percentage.
            return Ok(Some(Locator::from_percentage(leader.percentage)));
        };
        let parsed = self.ebooks.get(filename)?;

        if leader.is_audio() {
            let Some(ts) = leader.state.audio_seconds() else {
                return Ok(None);
            };
            let Some(alignment) = self.alignments.load(&mapping.book_id)? else {
                debug!(book_id = %mapping.book_id, "No alignment, cannot translate audio to text");
                return Ok(None);
            };
            let hint_ch = alignment.time_to_char(ts);

            // Forced-alignment fast path: the map was built from the
            // follower's own word timeline, so the interpolated offset is
            // already exact and fuzzy anchoring would only add noise.
            if mapping.alignment_source == AlignmentSource::Storyteller
                && follower == ClientName::Storyteller
            {
                return Ok(Some(self.locator.locator_at(&parsed, hint_ch)));
            }

            let hint_pct = hint_ch as f64 / parsed.text_len().max(1) as f64;
            let Some(snippet) = &leader.snippet else {
                // No transcript text to anchor; use the interpolated offset.
                return Ok(Some(self.locator.locator_at(&parsed, hint_ch)));
            };

            return Ok(self.locator.locate(&parsed, snippet, Some(hint_pct)));
        }

        // Text → text: re-anchor the leader's page text in the ebook.
        if let Some(snippet) = &leader.snippet {
            if let Some(locator) = self
                .locator
                .locate(&parsed, snippet, Some(leader.percentage))
            {
                return Ok(Some(locator));
            }
            debug!(
                book_id = %mapping.book_id,
                follower = %follower,
                "Snippet not found in follower ebook"
            );
            return Ok(None);
        }

        // Percentage-only leader state still produces a structural locator.
        let offset = (leader.percentage * parsed.text_len() as f64) as usize;
        Ok(Some(self.locator.locator_at(&parsed, offset)))
    }

    /// Leader char offset, refined via text search when possible
    fn resolve_char_offset(
        &self,
        mapping: &Mapping,
        leader: &LeaderPosition,
    ) -> Result<Option<usize>> {
        let Some(filename) = &mapping.ebook_filename else {
            return Ok(None);
        };
        let parsed = match self.ebooks.get(filename) {
            Ok(parsed) => parsed,
            Err(_) => return Ok(None),
        };

        if let Some(snippet) = &leader.snippet {
            if let Some(locator) =
                self.locator
                    .locate(&parsed, snippet, Some(leader.percentage))
            {
                return Ok(locator.char_offset);
            }
        }

        // Reader percentage maps straight into extracted-text coordinates.
        Ok(Some(
            (leader.percentage * parsed.text_len() as f64) as usize,
        ))
    }
}
