//! Paragraph extraction from regulation markup.

use chrono::NaiveDate;
use quick_xml::events::Event;
use quick_xml::Reader;
use regvol_core::{CfrReference, RegulationSnapshot};
use scraper::{Html, Selector};
use thiserror::Error;

use crate::RawContent;

/// Element names treated as paragraphs in eCFR XML (matched case-insensitively).
const XML_PARAGRAPH_TAGS: [&[u8]; 2] = [b"P", b"FP"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkupKind {
    Xml,
    Html,
}

impl MarkupKind {
    pub fn from_content_type(content_type: Option<&str>) -> Self {
        match content_type {
            Some(ct) if ct.to_ascii_lowercase().contains("html") => MarkupKind::Html,
            _ => MarkupKind::Xml,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            MarkupKind::Xml => "xml",
            MarkupKind::Html => "html",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MarkupError {
    #[error("document is empty")]
    Empty,
    #[error("document has no root element")]
    NoRoot,
    #[error("malformed xml at byte {position}: {message}")]
    Xml { position: u64, message: String },
    #[error("document ended with {0} unclosed element(s)")]
    Unclosed(usize),
    #[error("invalid selector: {0}")]
    Selector(String),
}

/// Markup for one reference/date that could not be turned into paragraphs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("could not extract paragraphs for {reference} on {date}: {source}")]
pub struct ContentParseError {
    pub reference: CfrReference,
    pub date: NaiveDate,
    #[source]
    pub source: MarkupError,
}

/// Collapse every whitespace run (newlines and tabs included) to one space and trim.
pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Ordered, normalized, non-empty paragraphs of `markup`.
pub fn extract_paragraphs(markup: &str, kind: MarkupKind) -> Result<Vec<String>, MarkupError> {
    if markup.trim().is_empty() {
        return Err(MarkupError::Empty);
    }
    match kind {
        MarkupKind::Xml => xml_paragraphs(markup),
        MarkupKind::Html => html_paragraphs(markup),
    }
}

pub fn snapshot_from_content(
    reference: &CfrReference,
    date: NaiveDate,
    content: &RawContent,
) -> Result<RegulationSnapshot, ContentParseError> {
    let paragraphs =
        extract_paragraphs(&content.markup, content.kind).map_err(|source| ContentParseError {
            reference: reference.clone(),
            date,
            source,
        })?;
    Ok(RegulationSnapshot {
        reference: reference.clone(),
        date,
        paragraphs,
    })
}

fn is_paragraph(name: &[u8]) -> bool {
    XML_PARAGRAPH_TAGS
        .iter()
        .any(|tag| name.eq_ignore_ascii_case(tag))
}

fn push_paragraph(out: &mut Vec<String>, raw: &str) {
    let paragraph = normalize_whitespace(raw);
    if !paragraph.is_empty() {
        out.push(paragraph);
    }
}

fn xml_paragraphs(markup: &str) -> Result<Vec<String>, MarkupError> {
    let mut reader = Reader::from_str(markup);
    let mut out = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    // Nesting level inside the outermost open paragraph; 0 means outside.
    let mut paragraph_depth = 0usize;
    let mut seen_root = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                depth += 1;
                seen_root = true;
                if paragraph_depth > 0 || is_paragraph(e.name().as_ref()) {
                    paragraph_depth += 1;
                }
            }
            Ok(Event::End(_)) => {
                depth = depth.saturating_sub(1);
                if paragraph_depth > 0 {
                    paragraph_depth -= 1;
                    if paragraph_depth == 0 {
                        push_paragraph(&mut out, &current);
                        current.clear();
                    }
                }
            }
            Ok(Event::Empty(_)) => {
                seen_root = true;
                if paragraph_depth > 0 {
                    current.push(' ');
                }
            }
            Ok(Event::Text(e)) if paragraph_depth > 0 => {
                let text = e.unescape().map_err(|err| MarkupError::Xml {
                    position: reader.buffer_position() as u64,
                    message: err.to_string(),
                })?;
                current.push_str(&text);
            }
            Ok(Event::CData(e)) if paragraph_depth > 0 => {
                current.push_str(&String::from_utf8_lossy(&e));
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(err) => {
                return Err(MarkupError::Xml {
                    position: reader.error_position() as u64,
                    message: err.to_string(),
                })
            }
        }
    }

    if depth > 0 {
        return Err(MarkupError::Unclosed(depth));
    }
    if !seen_root {
        return Err(MarkupError::NoRoot);
    }
    Ok(out)
}

fn html_paragraphs(markup: &str) -> Result<Vec<String>, MarkupError> {
    let document = Html::parse_document(markup);
    let selector = Selector::parse("p").map_err(|e| MarkupError::Selector(e.to_string()))?;
    let mut out = Vec::new();
    for node in document.select(&selector) {
        push_paragraph(&mut out, &node.text().collect::<String>());
    }
    Ok(out)
}
