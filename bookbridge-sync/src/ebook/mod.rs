//! Parsed-ebook model and cache
//!
//! File-format parsing is an external collaborator: a pluggable
//! [`EbookParser`] turns an epub on disk into the [`ParsedEbook`] model the
//! locator works over: spine items carrying an element tree plus the text
//! extracted from it. Extraction joins trimmed text nodes with single
//! spaces; every char-offset computation in this module counts the same
//! way, so offsets never drift between extraction and tree walks.

pub mod epub;
pub mod locate;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bookbridge_common::{Error, Result};
use parking_lot::Mutex;

/// A child of an element: nested element or raw text
#[derive(Debug, Clone)]
pub enum NodeContent {
    Element(EbookNode),
    Text(String),
}

/// One element in a chapter's parse tree
#[derive(Debug, Clone)]
pub struct EbookNode {
    /// Lowercase local tag name ("p", "div", "em", ...)
    pub tag: String,
    pub id: Option<String>,
    pub children: Vec<NodeContent>,
}

impl EbookNode {
    pub fn new(tag: impl Into<String>) -> Self {
        EbookNode {
            tag: tag.into(),
            id: None,
            children: Vec::new(),
        }
    }

    pub fn with_id(tag: impl Into<String>, id: impl Into<String>) -> Self {
        EbookNode {
            tag: tag.into(),
            id: Some(id.into()),
            children: Vec::new(),
        }
    }

    pub fn child(mut self, node: EbookNode) -> Self {
        self.children.push(NodeContent::Element(node));
        self
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.children.push(NodeContent::Text(text.into()));
        self
    }

    /// Extract readable text: trimmed text nodes joined by single spaces
    pub fn extract_text(&self) -> String {
        let mut parts = Vec::new();
        self.collect_text(&mut parts);
        parts.join(" ")
    }

    fn collect_text<'a>(&'a self, out: &mut Vec<&'a str>) {
        for child in &self.children {
            match child {
                NodeContent::Element(el) => el.collect_text(out),
                NodeContent::Text(t) => {
                    let trimmed = t.trim();
                    if !trimmed.is_empty() {
                        out.push(trimmed);
                    }
                }
            }
        }
    }
}

/// One spine document with its offsets into the whole-book text
#[derive(Debug, Clone)]
pub struct SpineItem {
    pub href: String,
    /// 1-based position in the reading order
    pub spine_index: usize,
    pub root: EbookNode,
    /// Start offset of this item's text in [`ParsedEbook::full_text`]
    pub start: usize,
    /// End offset (exclusive)
    pub end: usize,
}

/// A fully parsed ebook: reading-order text plus per-chapter trees
#[derive(Debug)]
pub struct ParsedEbook {
    pub spine: Vec<SpineItem>,
    pub full_text: String,
}

impl ParsedEbook {
    /// Assemble from parsed spine documents
    pub fn from_spine(items: Vec<(String, EbookNode)>) -> Self {
        let mut spine = Vec::with_capacity(items.len());
        let mut full_text_parts = Vec::with_capacity(items.len());
        let mut offset = 0usize;

        for (i, (href, root)) in items.into_iter().enumerate() {
            let text = root.extract_text();
            let len = text.chars().count();
            spine.push(SpineItem {
                href,
                spine_index: i + 1,
                root,
                start: offset,
                end: offset + len,
            });
            full_text_parts.push(text);
            offset += len + 1;
        }

        ParsedEbook {
            spine,
            full_text: full_text_parts.join(" "),
        }
    }

    pub fn text_len(&self) -> usize {
        self.full_text.chars().count()
    }

    /// Spine item containing the given char offset
    pub fn item_at(&self, offset: usize) -> Option<&SpineItem> {
        self.spine
            .iter()
            .find(|item| item.start <= offset && offset < item.end)
            .or(self.spine.last())
    }

    /// ~800-char window of text around a fractional position
    pub fn text_at_percentage(&self, percentage: f64) -> Option<String> {
        let total = self.text_len();
        if total == 0 {
            return None;
        }
        let target = ((total as f64) * percentage.clamp(0.0, 1.0)) as usize;
        let start = target.saturating_sub(400);
        let end = (target + 400).min(total);
        let snippet: String = self
            .full_text
            .chars()
            .skip(start)
            .take(end - start)
            .collect();
        Some(snippet)
    }
}

/// File-format parser contract (external collaborator)
pub trait EbookParser: Send + Sync {
    fn parse(&self, path: &Path) -> Result<ParsedEbook>;
}

/// Bounded LRU of parsed ebooks keyed by resolved path
///
/// Parsed trees are read-only after construction and shared by `Arc`.
/// Recency update and eviction run under one mutex.
pub struct EbookCache {
    parser: Arc<dyn EbookParser>,
    books_dir: PathBuf,
    epub_cache_dir: PathBuf,
    capacity: usize,
    entries: Mutex<Vec<(PathBuf, Arc<ParsedEbook>)>>,
}

impl EbookCache {
    pub fn new(
        parser: Arc<dyn EbookParser>,
        books_dir: PathBuf,
        epub_cache_dir: PathBuf,
        capacity: usize,
    ) -> Self {
        EbookCache {
            parser,
            books_dir,
            epub_cache_dir,
            capacity: capacity.max(1),
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Locate an ebook file under the books folder, falling back to the
    /// download cache
    pub fn resolve_book_path(&self, filename: &str) -> Result<PathBuf> {
        if self.books_dir.is_dir() {
            let mut stack = vec![self.books_dir.clone()];
            while let Some(dir) = stack.pop() {
                let entries = match std::fs::read_dir(&dir) {
                    Ok(entries) => entries,
                    Err(_) => continue,
                };
                for entry in entries.flatten() {
                    let path = entry.path();
                    if path.is_dir() {
                        stack.push(path);
                    } else if path.file_name().and_then(|n| n.to_str()) == Some(filename) {
                        return Ok(path);
                    }
                }
            }
        }

        let cached = self.epub_cache_dir.join(filename);
        if cached.exists() {
            return Ok(cached);
        }

        Err(Error::NotFound(format!("ebook file {filename}")))
    }

    /// Fetch a parsed ebook, parsing and caching on miss
    pub fn get(&self, filename: &str) -> Result<Arc<ParsedEbook>> {
        let path = self.resolve_book_path(filename)?;

        {
            let mut entries = self.entries.lock();
            if let Some(pos) = entries.iter().position(|(p, _)| *p == path) {
                let entry = entries.remove(pos);
                let parsed = entry.1.clone();
                entries.push(entry);
                return Ok(parsed);
            }
        }

        let parsed = Arc::new(self.parser.parse(&path)?);

        let mut entries = self.entries.lock();
        entries.push((path, parsed.clone()));
        while entries.len() > self.capacity {
            entries.remove(0);
        }
        Ok(parsed)
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    fn chapter(text: &str) -> EbookNode {
        EbookNode::new("body").child(EbookNode::new("p").text(text))
    }

    #[test]
    fn spine_offsets_are_contiguous() {
        let parsed = ParsedEbook::from_spine(vec![
            ("ch1.xhtml".into(), chapter("one two three")),
            ("ch2.xhtml".into(), chapter("four five")),
        ]);

        assert_eq!(parsed.full_text, "one two three four five");
        assert_eq!(parsed.spine[0].start, 0);
        assert_eq!(parsed.spine[0].end, 13);
        assert_eq!(parsed.spine[1].start, 14);
        assert_eq!(parsed.spine[1].end, 23);
        assert_eq!(parsed.item_at(15).unwrap().spine_index, 2);
    }

    #[test]
    fn extraction_collapses_whitespace() {
        let node = EbookNode::new("body")
            .child(EbookNode::new("p").text("  hello \n"))
            .child(EbookNode::new("p").text("world  "));
        assert_eq!(node.extract_text(), "hello world");
    }

    #[test]
    fn text_at_percentage_windows() {
        let long = "word ".repeat(500);
        let parsed = ParsedEbook::from_spine(vec![("c.xhtml".into(), chapter(long.trim()))]);
        let snippet = parsed.text_at_percentage(0.5).unwrap();
        assert!(snippet.chars().count() <= 800);
        assert!(snippet.contains("word"));
    }
}
