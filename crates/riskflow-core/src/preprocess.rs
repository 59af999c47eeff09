//! Document preprocessing: raw bytes in, bounded text segments out.
//!
//! Segments never split a paragraph unless that paragraph alone exceeds the byte
//! budget. Every segment's `text` is exactly `prepared_text[byte_range]`, so offsets
//! reported against a segment map back to the prepared document by addition.

use std::{
    fmt::Display,
    io::{Cursor, Read},
    ops::Range,
    path::Path,
};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const MAX_REPLACEMENT_RATIO: f32 = 0.05;
const DOCX_BODY: &str = "word/document.xml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentFormat {
    PlainText,
    Markdown,
    Html,
    Docx,
}

impl DocumentFormat {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.trim_start_matches('.').to_ascii_lowercase().as_str() {
            "txt" | "text" => Some(Self::PlainText),
            "md" | "markdown" => Some(Self::Markdown),
            "html" | "htm" => Some(Self::Html),
            "docx" => Some(Self::Docx),
            _ => None,
        }
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(Self::from_extension)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("document unreadable: {reason}")]
pub struct DocumentUnreadable {
    pub reason: String,
}

impl DocumentUnreadable {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Contiguous slice of the prepared document handed to providers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextSegment {
    pub index: usize,
    pub text: String,
    pub byte_range: Range<usize>,
}

/// Segment size budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmenterConfig {
    #[serde(default = "default_max_segment_bytes")]
    pub max_segment_bytes: usize,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            max_segment_bytes: default_max_segment_bytes(),
        }
    }
}

fn default_max_segment_bytes() -> usize {
    6_000
}

/// Prepare a document with the default segment budget.
pub fn prepare(raw: &[u8], format: DocumentFormat) -> Result<Vec<TextSegment>, DocumentUnreadable> {
    prepare_with(raw, format, &SegmenterConfig::default())
}

pub fn prepare_with(
    raw: &[u8],
    format: DocumentFormat,
    config: &SegmenterConfig,
) -> Result<Vec<TextSegment>, DocumentUnreadable> {
    let text = extract_text(raw, format)?;
    if text.trim().is_empty() {
        return Err(DocumentUnreadable::new("document contains no text"));
    }
    Ok(segment_text(&text, config.max_segment_bytes))
}

/// Decode `raw` into the prepared text that segment offsets refer to.
pub fn extract_text(raw: &[u8], format: DocumentFormat) -> Result<String, DocumentUnreadable> {
    match format {
        DocumentFormat::PlainText | DocumentFormat::Markdown => decode_text(raw),
        DocumentFormat::Html => decode_text(raw).map(|html| html_to_text(&html)),
        DocumentFormat::Docx => docx_to_text(raw),
    }
}

fn decode_text(raw: &[u8]) -> Result<String, DocumentUnreadable> {
    let raw = raw.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(raw);
    if raw.is_empty() {
        return Err(DocumentUnreadable::new("document is empty"));
    }
    match std::str::from_utf8(raw) {
        Ok(text) => Ok(text.to_string()),
        Err(_) => {
            let lossy = String::from_utf8_lossy(raw);
            let total = lossy.chars().count().max(1);
            let replaced = lossy
                .chars()
                .filter(|&c| c == char::REPLACEMENT_CHARACTER)
                .count();
            if replaced as f32 / total as f32 > MAX_REPLACEMENT_RATIO {
                return Err(DocumentUnreadable::new(format!(
                    "document is not UTF-8 text ({replaced} of {total} characters undecodable)"
                )));
            }
            Ok(lossy.into_owned())
        }
    }
}

static HTML_NOISE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"(?is)<!--.*?-->|<script\b.*?</script\s*>",
        r"|<style\b.*?</style\s*>|<head\b.*?</head\s*>",
    ))
    .expect("static regex")
});
static HTML_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"(?i)</?(p|div|br|li|ul|ol|h[1-6]|tr|table",
        r"|section|article|blockquote|pre)\b[^>]*>",
    ))
    .expect("static regex")
});
static HTML_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]*>").expect("static regex"));
static INLINE_SPACE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[ \t\x0B\x0C]+").expect("static regex"));
static EXCESS_BREAKS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\n\s*\n(\s*\n)+").expect("static regex"));

fn html_to_text(html: &str) -> String {
    let without_noise = HTML_NOISE.replace_all(html, " ");
    let with_breaks = HTML_BLOCK.replace_all(&without_noise, "\n\n");
    let stripped = HTML_TAG.replace_all(&with_breaks, "");
    let decoded = decode_entities(&stripped);
    let lines: Vec<_> = decoded
        .lines()
        .map(|line| INLINE_SPACE.replace_all(line.trim(), " "))
        .collect();
    let joined = lines.join("\n");
    let collapsed = EXCESS_BREAKS.replace_all(joined.trim(), "\n\n");
    collapsed.into_owned()
}

static DOCX_PARAGRAPH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<w:p[ >].*?</w:p>").expect("static regex"));
static DOCX_RUN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)<w:t(?:\s[^>]*)?>(.*?)</w:t>|<w:tab\s*/>|<w:br\s*/>").expect("static regex")
});

fn docx_to_text(raw: &[u8]) -> Result<String, DocumentUnreadable> {
    let mut archive = zip::ZipArchive::new(Cursor::new(raw))
        .map_err(|err| docx_error("not a DOCX container", err))?;
    let mut xml = String::new();
    archive
        .by_name(DOCX_BODY)
        .map_err(|err| docx_error("DOCX is missing its body", err))?
        .read_to_string(&mut xml)
        .map_err(|err| docx_error("failed to read the DOCX body", err))?;

    let mut paragraphs = Vec::new();
    for paragraph in DOCX_PARAGRAPH.find_iter(&xml) {
        let mut line = String::new();
        for run in DOCX_RUN.captures_iter(paragraph.as_str()) {
            match run.get(1) {
                Some(text) => line.push_str(&decode_entities(text.as_str())),
                None if run[0].starts_with("<w:tab") => line.push('\t'),
                None => line.push('\n'),
            }
        }
        let trimmed = line.trim();
        if !trimmed.is_empty() {
            paragraphs.push(trimmed.to_string());
        }
    }
    Ok(paragraphs.join("\n\n"))
}

fn docx_error(context: &str, err: impl Display) -> DocumentUnreadable {
    DocumentUnreadable::new(format!("{context}: {err}"))
}

fn decode_entities(input: &str) -> String {
    if !input.contains('&') {
        return input.to_string();
    }
    input
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

static PARAGRAPH_BREAK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\r?\n[ \t\r]*\n").expect("static regex"));

/// Split `text` into segments of at most `max_bytes` bytes, packing whole paragraphs.
pub fn segment_text(text: &str, max_bytes: usize) -> Vec<TextSegment> {
    let max_bytes = max_bytes.max(4);
    let mut pieces: Vec<Range<usize>> = Vec::new();
    for paragraph in paragraphs(text) {
        if paragraph.len() <= max_bytes {
            pieces.push(paragraph);
        } else {
            split_long(text, paragraph, max_bytes, &mut pieces);
        }
    }

    let mut segments = Vec::new();
    let mut current: Option<Range<usize>> = None;
    for piece in pieces {
        current = match current {
            Some(range) if piece.end - range.start <= max_bytes => Some(range.start..piece.end),
            Some(range) => {
                push_segment(text, range, &mut segments);
                Some(piece)
            }
            None => Some(piece),
        };
    }
    if let Some(range) = current {
        push_segment(text, range, &mut segments);
    }
    segments
}

fn push_segment(text: &str, range: Range<usize>, segments: &mut Vec<TextSegment>) {
    segments.push(TextSegment {
        index: segments.len(),
        text: text[range.clone()].to_string(),
        byte_range: range,
    });
}

/// Trimmed, non-empty paragraph ranges.
fn paragraphs(text: &str) -> Vec<Range<usize>> {
    let mut ranges = Vec::new();
    let mut start = 0;
    for boundary in PARAGRAPH_BREAK.find_iter(text) {
        if let Some(range) = trimmed_range(text, start..boundary.start()) {
            ranges.push(range);
        }
        start = boundary.end();
    }
    if let Some(range) = trimmed_range(text, start..text.len()) {
        ranges.push(range);
    }
    ranges
}

fn trimmed_range(text: &str, range: Range<usize>) -> Option<Range<usize>> {
    let slice = &text[range.clone()];
    let leading = slice.len() - slice.trim_start().len();
    let trailing = slice.len() - slice.trim_end().len();
    if leading == slice.len() {
        return None;
    }
    Some(range.start + leading..range.end - trailing)
}

/// Break an oversized paragraph at sentence ends, then whitespace, then any char boundary.
fn split_long(
    text: &str,
    paragraph: Range<usize>,
    max_bytes: usize,
    out: &mut Vec<Range<usize>>,
) {
    let mut cursor = paragraph.start;
    while cursor < paragraph.end {
        if paragraph.end - cursor <= max_bytes {
            out.push(cursor..paragraph.end);
            break;
        }
        let limit = saturating_char_boundary(text, cursor + max_bytes);
        let window = &text[cursor..limit];
        let cut = sentence_cut(window, max_bytes / 2)
            .or_else(|| whitespace_cut(window, max_bytes / 4))
            .map(|offset| cursor + offset)
            .unwrap_or_else(|| {
                if limit > cursor {
                    limit
                } else {
                    saturating_char_boundary_forward(text, cursor + 1)
                }
            });
        if let Some(range) = trimmed_range(text, cursor..cut) {
            out.push(range);
        }
        cursor = cut;
        while cursor < paragraph.end && text[cursor..].starts_with(char::is_whitespace) {
            cursor += text[cursor..].chars().next().map_or(1, char::len_utf8);
        }
    }
}

fn sentence_cut(window: &str, min_offset: usize) -> Option<usize> {
    window
        .match_indices(|c| matches!(c, '.' | '?' | '!' | ';'))
        .map(|(idx, mark)| idx + mark.len())
        .filter(|&end| end >= min_offset)
        .filter(|&end| {
            window[end..]
                .chars()
                .next()
                .map_or(true, char::is_whitespace)
        })
        .last()
}

fn whitespace_cut(window: &str, min_offset: usize) -> Option<usize> {
    window
        .char_indices()
        .filter(|(idx, c)| c.is_whitespace() && *idx >= min_offset)
        .map(|(idx, _)| idx)
        .last()
}

fn saturating_char_boundary(text: &str, idx: usize) -> usize {
    if idx >= text.len() {
        return text.len();
    }
    let mut cursor = idx;
    while cursor > 0 && !text.is_char_boundary(cursor) {
        cursor -= 1;
    }
    cursor
}

fn saturating_char_boundary_forward(text: &str, idx: usize) -> usize {
    if idx >= text.len() {
        return text.len();
    }
    let mut cursor = idx;
    while cursor < text.len() && !text.is_char_boundary(cursor) {
        cursor += 1;
    }
    cursor
}
