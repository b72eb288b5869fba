//! Epub file parser
//!
//! Reads the zip container, resolves the OPF package, and builds the
//! parsed-ebook model from the spine's XHTML documents. Epub content
//! documents are well-formed XML, which keeps the element reader small;
//! anything malformed fails the parse rather than guessing.

use std::io::Read;
use std::path::Path;

use bookbridge_common::{Error, Result};

use super::{EbookNode, EbookParser, NodeContent, ParsedEbook};

pub struct ZipEpubParser;

impl EbookParser for ZipEpubParser {
    fn parse(&self, path: &Path) -> Result<ParsedEbook> {
        let file = std::fs::File::open(path)?;
        let mut archive = zip::ZipArchive::new(file)
            .map_err(|e| Error::InvalidInput(format!("not an epub archive: {e}")))?;

        let container = read_entry(&mut archive, "META-INF/container.xml")?;
        let opf_path = attr_of_first_tag(&container, "rootfile", "full-path")
            .ok_or_else(|| Error::InvalidInput("container.xml without rootfile".into()))?;

        let opf = read_entry(&mut archive, &opf_path)?;
        let opf_dir = match opf_path.rfind('/') {
            Some(idx) => &opf_path[..idx + 1],
            None => "",
        };

        // Manifest id → href, then spine order by idref
        let mut manifest = std::collections::HashMap::new();
        for tag in tags_named(&opf, "item") {
            if let (Some(id), Some(href)) = (attr(&tag, "id"), attr(&tag, "href")) {
                manifest.insert(id, href);
            }
        }

        let mut spine_docs = Vec::new();
        for tag in tags_named(&opf, "itemref") {
            let Some(idref) = attr(&tag, "idref") else { continue };
            let Some(href) = manifest.get(&idref) else { continue };
            let full = format!("{opf_dir}{href}");
            let content = match read_entry(&mut archive, &full) {
                Ok(content) => content,
                Err(_) => continue,
            };
            let body = parse_document_body(&content)?;
            spine_docs.push((href.clone(), body));
        }

        if spine_docs.is_empty() {
            return Err(Error::InvalidInput("epub has no readable spine items".into()));
        }

        Ok(ParsedEbook::from_spine(spine_docs))
    }
}

fn read_entry<R: Read + std::io::Seek>(
    archive: &mut zip::ZipArchive<R>,
    name: &str,
) -> Result<String> {
    let mut entry = archive
        .by_name(name)
        .map_err(|e| Error::NotFound(format!("epub entry {name}: {e}")))?;
    let mut content = String::new();
    entry.read_to_string(&mut content)?;
    Ok(content)
}

// ----------------------------------------------------------------------
// Minimal well-formed XML reading
// ----------------------------------------------------------------------

/// All opening tags with the given local name, as raw tag strings
fn tags_named(xml: &str, name: &str) -> Vec<String> {
    let mut found = Vec::new();
    let mut rest = xml;
    while let Some(idx) = rest.find('<') {
        rest = &rest[idx + 1..];
        let Some(end) = rest.find('>') else { break };
        let tag = &rest[..end];
        let local = tag
            .split([' ', '\t', '\n', '/'])
            .next()
            .unwrap_or_default()
            .rsplit(':')
            .next()
            .unwrap_or_default();
        if local == name {
            found.push(tag.to_string());
        }
        rest = &rest[end + 1..];
    }
    found
}

fn attr_of_first_tag(xml: &str, tag_name: &str, attr_name: &str) -> Option<String> {
    tags_named(xml, tag_name)
        .into_iter()
        .find_map(|tag| attr(&tag, attr_name))
}

/// Attribute value from a raw tag string
fn attr(tag: &str, name: &str) -> Option<String> {
    let mut rest = tag;
    while let Some(idx) = rest.find(name) {
        let after = &rest[idx + name.len()..];
        // Must be a whole attribute name followed by =
        let preceded_ok = idx == 0
            || rest[..idx]
                .chars()
                .last()
                .is_some_and(|c| c.is_whitespace());
        if preceded_ok {
            let trimmed = after.trim_start();
            if let Some(value_part) = trimmed.strip_prefix('=') {
                let value_part = value_part.trim_start();
                let quote = value_part.chars().next()?;
                if quote == '"' || quote == '\'' {
                    let inner = &value_part[1..];
                    if let Some(end) = inner.find(quote) {
                        return Some(inner[..end].to_string());
                    }
                }
            }
        }
        rest = &rest[idx + name.len()..];
    }
    None
}

/// Parse an XHTML document into an element tree rooted at `body`
pub fn parse_document_body(xml: &str) -> Result<EbookNode> {
    let body_start = find_tag_start(xml, "body")
        .ok_or_else(|| Error::InvalidInput("document without body".into()))?;

    let mut root = EbookNode::new("body");
    let mut stack: Vec<EbookNode> = Vec::new();
    let mut rest = &xml[body_start..];

    // Consume the body opening tag itself.
    if let Some(end) = rest.find('>') {
        rest = &rest[end + 1..];
    }

    loop {
        let Some(lt) = rest.find('<') else { break };

        // Text run before the next tag
        let text = &rest[..lt];
        if !text.trim().is_empty() {
            let decoded = decode_entities(text);
            let target = stack.last_mut().unwrap_or(&mut root);
            if !matches!(target.tag.as_str(), "script" | "style") {
                target.children.push(NodeContent::Text(decoded));
            }
        }
        rest = &rest[lt + 1..];

        if let Some(after) = rest.strip_prefix("!--") {
            // Comment
            let Some(end) = after.find("-->") else { break };
            rest = &after[end + 3..];
            continue;
        }
        if rest.starts_with('!') || rest.starts_with('?') {
            let Some(end) = rest.find('>') else { break };
            rest = &rest[end + 1..];
            continue;
        }

        let Some(end) = rest.find('>') else { break };
        let tag = &rest[..end];
        rest = &rest[end + 1..];

        if let Some(closing) = tag.strip_prefix('/') {
            let closing = local_name(closing.trim());
            if closing == "body" {
                break;
            }
            if let Some(node) = stack.pop() {
                let target = stack.last_mut().unwrap_or(&mut root);
                target.children.push(NodeContent::Element(node));
            }
            continue;
        }

        let self_closing = tag.trim_end().ends_with('/');
        let name = local_name(tag);
        if name.is_empty() {
            continue;
        }

        let mut node = EbookNode::new(name);
        node.id = attr(tag, "id");

        if self_closing {
            let target = stack.last_mut().unwrap_or(&mut root);
            target.children.push(NodeContent::Element(node));
        } else {
            stack.push(node);
        }
    }

    // Unclosed elements fold back into the tree rather than vanish.
    while let Some(node) = stack.pop() {
        let target = stack.last_mut().unwrap_or(&mut root);
        target.children.push(NodeContent::Element(node));
    }

    Ok(root)
}

fn local_name(tag: &str) -> String {
    tag.split([' ', '\t', '\n', '\r', '/'])
        .next()
        .unwrap_or_default()
        .rsplit(':')
        .next()
        .unwrap_or_default()
        .to_lowercase()
}

fn find_tag_start(xml: &str, name: &str) -> Option<usize> {
    let mut offset = 0;
    let bytes = xml.as_bytes();
    while let Some(idx) = xml[offset..].find('<') {
        let start = offset + idx;
        let after = &xml[start + 1..];
        if after.starts_with(name) {
            let boundary = after.as_bytes().get(name.len());
            if matches!(boundary, Some(b' ') | Some(b'>') | Some(b'\t') | Some(b'\n')) {
                return Some(start);
            }
        }
        offset = start + 1;
        if offset >= bytes.len() {
            break;
        }
    }
    None
}

fn decode_entities(text: &str) -> String {
    text.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&nbsp;", " ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested_document_body() {
        let xml = r#"<?xml version="1.0"?>
            <html xmlns="http://www.w3.org/1999/xhtml">
            <head><title>ignored</title></head>
            <body>
              <div id="c1">
                <h1>Chapter One</h1>
                <p>It was a <em>bright</em> cold day.</p>
              </body>
            </html>"#;

        let body = parse_document_body(xml).unwrap();
        let text = body.extract_text();
        assert_eq!(text, "Chapter One It was a bright cold day.");
    }

    #[test]
    fn entities_are_decoded() {
        let xml = "<body><p>Fish &amp; Chips &lt;now&gt;</p></body>";
        let body = parse_document_body(xml).unwrap();
        assert_eq!(body.extract_text(), "Fish & Chips <now>");
    }

    #[test]
    fn ids_survive_parsing() {
        let xml = r#"<body><div id="s2"><p>text</p></div></body>"#;
        let body = parse_document_body(xml).unwrap();
        let NodeContent::Element(div) = &body.children[0] else {
            panic!("expected element");
        };
        assert_eq!(div.id.as_deref(), Some("s2"));
    }

    #[test]
    fn attr_extraction_handles_quoting() {
        assert_eq!(
            attr(r#"item id="a" href='x/y.xhtml'"#, "href").as_deref(),
            Some("x/y.xhtml")
        );
        assert_eq!(attr(r#"item idref="a""#, "id"), None);
    }
}
