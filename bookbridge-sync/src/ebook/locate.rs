//! Fuzzy text location inside a parsed ebook
//!
//! Given a snippet of narration or reader text, find where it sits in the
//! book and produce a rich locator (char offset, percentage, xpath, css
//! selector, fragment, cfi). Matching runs over normalized tokens; a hint
//! percentage narrows the search window before falling back to the whole
//! text. Generated KOReader xpaths are sentence-level: they anchor at the
//! nearest block element and address the node start, never a character
//! offset inside formatting spans.

use std::collections::HashMap;

use tracing::debug;

use super::{EbookNode, NodeContent, ParsedEbook, SpineItem};
use crate::clients::Locator;

/// Inline tags crengine renumbers freely; never anchor a path inside one
const FRAGILE_INLINE_TAGS: [&str; 12] = [
    "span", "em", "strong", "b", "i", "u", "a", "font", "small", "big", "sub", "sup",
];

/// Block-level tags safe to anchor a KOReader xpath at
const STRUCTURAL_TAGS: [&str; 21] = [
    "p", "div", "section", "article", "blockquote", "h1", "h2", "h3", "h4", "h5", "h6", "li",
    "header", "footer", "aside", "td", "th", "dt", "dd", "figcaption", "pre",
];

/// Window half-width as a fraction of the text when a hint is present
const DEFAULT_WINDOW_FRACTION: f64 = 0.15;

/// Word count for the unique-anchor uniqueness probe
const ANCHOR_WORDS: usize = 10;

/// Fuzzy locator over parsed ebooks
pub struct TextLocator {
    /// Minimum token-set score (0–100) to accept a window
    pub fuzzy_threshold: u32,
    pub window_fraction: f64,
}

impl TextLocator {
    pub fn new(fuzzy_threshold: u32) -> Self {
        TextLocator {
            fuzzy_threshold,
            window_fraction: DEFAULT_WINDOW_FRACTION,
        }
    }

    /// Find the best match for `snippet` and return a rich locator.
    ///
    /// Returns `None` when no window reaches the threshold; the caller
    /// skips that follower rather than propagate a bad position.
    pub fn locate(
        &self,
        book: &ParsedEbook,
        snippet: &str,
        hint_pct: Option<f64>,
    ) -> Option<Locator> {
        let total = book.text_len();
        if total == 0 || snippet.trim().is_empty() {
            return None;
        }

        let offset = self
            .unique_anchor_offset(book, snippet)
            .or_else(|| exact_offset(book, snippet))
            .or_else(|| self.fuzzy_offset(book, snippet, hint_pct))?;

        Some(self.locator_at(book, offset))
    }

    /// Build the rich locator for a known char offset
    pub fn locator_at(&self, book: &ParsedEbook, offset: usize) -> Locator {
        let total = book.text_len().max(1);
        let offset = offset.min(total - 1);
        let percentage = offset as f64 / total as f64;

        let mut locator = Locator {
            percentage,
            char_offset: Some(offset),
            ..Default::default()
        };

        if let Some(item) = book.item_at(offset) {
            let local = offset.saturating_sub(item.start);
            if let Some(path) = locate_node_path(&item.root, local) {
                locator.xpath = Some(koreader_xpath(item, &path));
                locator.css_selector = Some(css_selector(&path));
                locator.cfi = Some(cfi(item, &path));
                locator.fragment = nearest_fragment(&path);
            } else {
                locator.xpath = Some(chapter_fallback_xpath(item));
            }
        }

        locator
    }

    /// Probe for a 10-word run of the snippet that occurs exactly once in
    /// the book. Prevents jumping to duplicated phrases (a chapter heading
    /// in the table of contents vs the chapter itself).
    fn unique_anchor_offset(&self, book: &ParsedEbook, snippet: &str) -> Option<usize> {
        let words: Vec<&str> = snippet.split_whitespace().collect();
        if words.len() < ANCHOR_WORDS {
            return None;
        }

        for start in 0..=(words.len() - ANCHOR_WORDS) {
            let candidate = words[start..start + ANCHOR_WORDS].join(" ");
            let mut matches = book.full_text.match_indices(&candidate);
            if let (Some((byte_idx, _)), None) = (matches.next(), matches.next()) {
                let offset = book.full_text[..byte_idx].chars().count();
                debug!(offset, "Unique text anchor found");
                return Some(offset);
            }
        }
        None
    }

    /// Sliding-window token-set scoring over the (hinted) search region
    fn fuzzy_offset(&self, book: &ParsedEbook, snippet: &str, hint_pct: Option<f64>) -> Option<usize> {
        let needle = normalize(snippet);
        let needle_words = needle.split_whitespace().count();
        if needle_words == 0 {
            return None;
        }

        let words = tokenize(&book.full_text);
        if words.is_empty() {
            return None;
        }

        let total = book.text_len();
        let (lo, hi) = match hint_pct {
            Some(hint) => {
                let center = (hint.clamp(0.0, 1.0) * total as f64) as usize;
                let half = (self.window_fraction * total as f64) as usize;
                (center.saturating_sub(half), (center + half).min(total))
            }
            None => (0, total),
        };

        let window = needle_words.max(4);
        let step = (window / 2).max(1);
        let mut best: Option<(u32, usize)> = None;

        let mut i = 0;
        while i < words.len() {
            let first = &words[i];
            if first.offset < lo {
                i += step;
                continue;
            }
            if first.offset > hi {
                break;
            }

            let end = (i + window).min(words.len());
            let haystack = join_normalized(&words[i..end]);
            let score = token_set_ratio(&needle, &haystack);
            if best.map_or(true, |(b, _)| score > b) {
                best = Some((score, first.offset));
            }
            i += step;
        }

        match best {
            Some((score, offset)) if score >= self.fuzzy_threshold => {
                debug!(score, offset, "Fuzzy match accepted");
                Some(offset)
            }
            Some((score, _)) => {
                debug!(score, threshold = self.fuzzy_threshold, "Best fuzzy score below threshold");
                None
            }
            None => None,
        }
    }
}

fn exact_offset(book: &ParsedEbook, snippet: &str) -> Option<usize> {
    let cleaned = snippet.split_whitespace().collect::<Vec<_>>().join(" ");
    if cleaned.len() < 20 {
        return None;
    }
    book.full_text
        .find(&cleaned)
        .map(|byte_idx| book.full_text[..byte_idx].chars().count())
}

/// A word with its char offset into the full text
struct Word<'a> {
    offset: usize,
    raw: &'a str,
}

fn tokenize(text: &str) -> Vec<Word<'_>> {
    let mut words = Vec::new();
    let mut char_offset = 0usize;
    let mut word_start: Option<(usize, usize)> = None; // (byte, char)

    for (byte_idx, ch) in text.char_indices() {
        if ch.is_whitespace() {
            if let Some((start_byte, start_char)) = word_start.take() {
                words.push(Word {
                    offset: start_char,
                    raw: &text[start_byte..byte_idx],
                });
            }
        } else if word_start.is_none() {
            word_start = Some((byte_idx, char_offset));
        }
        char_offset += 1;
    }
    if let Some((start_byte, start_char)) = word_start {
        words.push(Word {
            offset: start_char,
            raw: &text[start_byte..],
        });
    }
    words
}

/// Lowercase, strip non-alphanumeric characters, collapse whitespace
pub fn normalize(text: &str) -> String {
    text.split_whitespace()
        .filter_map(|word| {
            let cleaned: String = word
                .chars()
                .filter(|c| c.is_alphanumeric())
                .flat_map(|c| c.to_lowercase())
                .collect();
            if cleaned.is_empty() {
                None
            } else {
                Some(cleaned)
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn join_normalized(words: &[Word<'_>]) -> String {
    normalize(
        &words
            .iter()
            .map(|w| w.raw)
            .collect::<Vec<_>>()
            .join(" "),
    )
}

/// Token-set similarity on a 0–100 scale
///
/// Order-insensitive: scores the shared token set against each side's
/// full token set and keeps the best, so a snippet matches a window that
/// contains it plus surrounding words.
pub fn token_set_ratio(a: &str, b: &str) -> u32 {
    let set_a: std::collections::BTreeSet<&str> = a.split_whitespace().collect();
    let set_b: std::collections::BTreeSet<&str> = b.split_whitespace().collect();
    if set_a.is_empty() || set_b.is_empty() {
        return 0;
    }

    let common: Vec<&str> = set_a.intersection(&set_b).copied().collect();
    let joined_common = common.join(" ");
    let joined_a = set_a.iter().copied().collect::<Vec<_>>().join(" ");
    let joined_b = set_b.iter().copied().collect::<Vec<_>>().join(" ");

    let score_ab = strsim::normalized_levenshtein(&joined_a, &joined_b);
    let score_ca = if joined_common.is_empty() {
        0.0
    } else {
        strsim::normalized_levenshtein(&joined_common, &joined_a)
    };
    let score_cb = if joined_common.is_empty() {
        0.0
    } else {
        strsim::normalized_levenshtein(&joined_common, &joined_b)
    };

    (score_ab.max(score_ca).max(score_cb) * 100.0).round() as u32
}

/// One step in an element path, with 1-based sibling indices
struct PathSeg<'a> {
    node: &'a EbookNode,
    /// Index among same-tag element siblings (xpath style)
    index_same_tag: usize,
    /// Index among all element siblings (css/cfi style)
    index_any: usize,
}

/// Walk the tree counting extracted-text chars until `target`, returning
/// the element path down to the text node containing it
fn locate_node_path<'a>(root: &'a EbookNode, target: usize) -> Option<Vec<PathSeg<'a>>> {
    let mut count = 0usize;
    let mut path = Vec::new();
    if walk(root, target, &mut count, &mut path) {
        Some(path)
    } else {
        None
    }
}

fn walk<'a>(
    node: &'a EbookNode,
    target: usize,
    count: &mut usize,
    path: &mut Vec<PathSeg<'a>>,
) -> bool {
    let mut same_tag: HashMap<&str, usize> = HashMap::new();
    let mut any_idx = 0usize;

    for child in &node.children {
        match child {
            NodeContent::Element(el) => {
                any_idx += 1;
                let tag_idx = same_tag
                    .entry(el.tag.as_str())
                    .and_modify(|c| *c += 1)
                    .or_insert(1);
                path.push(PathSeg {
                    node: el,
                    index_same_tag: *tag_idx,
                    index_any: any_idx,
                });
                if walk(el, target, count, path) {
                    return true;
                }
                path.pop();
            }
            NodeContent::Text(t) => {
                let trimmed = t.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let len = trimmed.chars().count();
                if *count + len > target {
                    return true;
                }
                *count += len;
                // Single-space separator added by extraction
                if *count <= target {
                    *count += 1;
                }
            }
        }
    }
    false
}

fn is_fragile(tag: &str) -> bool {
    FRAGILE_INLINE_TAGS.contains(&tag)
}

fn is_structural(tag: &str) -> bool {
    STRUCTURAL_TAGS.contains(&tag)
}

/// Index of the nearest block-level anchor in the path
fn anchor_index(path: &[PathSeg<'_>]) -> usize {
    for i in (0..path.len()).rev() {
        let tag = path[i].node.tag.as_str();
        if is_structural(tag) {
            return i;
        }
        if !is_fragile(tag) {
            // Unknown tag: treat as anchorable rather than climb to body
            return i;
        }
    }
    0
}

/// KOReader xpath: `/body/DocFragment[n]/<block path>/text().0`
///
/// The item's root element is the chapter `body`; path segments start at
/// its children so the DocFragment prefix never doubles a body segment.
fn koreader_xpath(item: &SpineItem, path: &[PathSeg<'_>]) -> String {
    let anchor = anchor_index(path);
    let mut segments = vec![format!("/body/DocFragment[{}]/body", item.spine_index)];
    for seg in &path[..=anchor] {
        segments.push(format!("{}[{}]", seg.node.tag, seg.index_same_tag));
    }
    format!("{}/text().0", segments.join("/"))
}

fn chapter_fallback_xpath(item: &SpineItem) -> String {
    format!("/body/DocFragment[{}]/body/p[1]/text().0", item.spine_index)
}

/// Readium-style css selector chain
fn css_selector(path: &[PathSeg<'_>]) -> String {
    let mut parts = vec!["body".to_string()];
    for seg in path {
        parts.push(format!("{}:nth-child({})", seg.node.tag, seg.index_any));
    }
    parts.join(" > ")
}

/// EPUB CFI for Readium-based readers
fn cfi(item: &SpineItem, path: &[PathSeg<'_>]) -> String {
    let spine_step = item.spine_index * 2;
    let element_path: Vec<String> = path.iter().map(|seg| (seg.index_any * 2).to_string()).collect();
    if element_path.is_empty() {
        format!("epubcfi(/6/{spine_step}!/4:0)")
    } else {
        format!("epubcfi(/6/{spine_step}!/4/{}:0)", element_path.join("/"))
    }
}

/// Nearest ancestor element id, for fragment-based readers
fn nearest_fragment(path: &[PathSeg<'_>]) -> Option<String> {
    path.iter().rev().find_map(|seg| seg.node.id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ebook::EbookNode;

    fn sample_book() -> ParsedEbook {
        let ch1 = EbookNode::new("body")
            .child(EbookNode::new("h1").text("Chapter One"))
            .child(
                EbookNode::new("p")
                    .text("It was a bright cold day in April and the clocks were striking thirteen."),
            );
        let ch2 = EbookNode::new("body").child(
            EbookNode::with_id("div", "s2").child(
                EbookNode::new("p").child(
                    EbookNode::new("em").text("Winston Smith slipped quickly through the glass doors of Victory Mansions."),
                ),
            ),
        );
        ParsedEbook::from_spine(vec![("ch1.xhtml".into(), ch1), ("ch2.xhtml".into(), ch2)])
    }

    #[test]
    fn normalize_strips_punctuation_and_case() {
        assert_eq!(normalize("Hello,  World! 42"), "hello world 42");
        assert_eq!(normalize("--- ***"), "");
    }

    #[test]
    fn token_set_ratio_is_order_insensitive() {
        let a = "the clocks were striking thirteen";
        let b = "striking thirteen the clocks were";
        assert!(token_set_ratio(a, b) >= 95);
    }

    #[test]
    fn token_set_ratio_scores_containment_high() {
        let snippet = "clocks were striking thirteen";
        let window = "bright cold day in april and the clocks were striking thirteen winston smith";
        assert!(token_set_ratio(&normalize(snippet), &normalize(window)) >= 80);
    }

    #[test]
    fn exact_snippet_is_located() {
        let book = sample_book();
        let locator = TextLocator::new(80)
            .locate(&book, "bright cold day in April and the clocks", None)
            .unwrap();
        assert!(locator.percentage < 0.5);
        let xpath = locator.xpath.unwrap();
        assert!(xpath.starts_with("/body/DocFragment[1]/body/"), "{xpath}");
        assert!(xpath.ends_with("/text().0"), "{xpath}");
    }

    #[test]
    fn fragile_inline_anchors_to_block_ancestor() {
        let book = sample_book();
        let locator = TextLocator::new(80).locator_at(&book, book.spine[1].start + 5);
        let xpath = locator.xpath.unwrap();
        // The em element must not appear; the p block is the anchor.
        assert!(!xpath.contains("em"), "{xpath}");
        assert!(xpath.contains("/p[1]/"), "{xpath}");
        assert_eq!(locator.fragment.as_deref(), Some("s2"));
        // No doubled body segment.
        assert_eq!(xpath.matches("body").count(), 2, "{xpath}");
    }

    #[test]
    fn below_threshold_returns_none() {
        let book = sample_book();
        let result = TextLocator::new(80).locate(
            &book,
            "completely unrelated sentences about gardening and soup recipes",
            Some(0.5),
        );
        assert!(result.is_none());
    }

    #[test]
    fn hint_restricts_search_window() {
        let book = sample_book();
        let locator = TextLocator::new(70).locate(
            &book,
            "Winston Smith slipped quickly through the glass doors",
            Some(0.9),
        );
        let locator = locator.unwrap();
        assert!(locator.percentage > 0.4);
    }

    #[test]
    fn cfi_addresses_spine_and_elements() {
        let book = sample_book();
        let locator = TextLocator::new(80).locator_at(&book, 2);
        let cfi = locator.cfi.unwrap();
        assert!(cfi.starts_with("epubcfi(/6/2!/4/"), "{cfi}");
    }
}
