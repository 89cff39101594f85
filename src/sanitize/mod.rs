//! Turns decrypted message bodies into the normalized text that gets indexed.
use crate::errors::{EngineError, EngineResult};
use mailparse::ParsedMail;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use tracing::warn;

/// Quote containers of known mail clients, highest priority first.
const QUOTE_SELECTORS: &[&str] = &[
    ".protonmail_quote",
    ".gmail_quote",
    ".yahoo_quoted",
    ".gmail_extra",
    ".moz-cite-prefix",
    "#isForwardContent",
    "#isReplyContent",
    "#mailcontent:not(table)",
    "#origbody",
    "#reply139content",
    "#oriMsgHtmlSeperator",
    "blockquote[type=\"cite\"]",
    "[name=\"quote\"]",
    ".zmail_extra",
];

/// Tried only when no quote container qualified.
const QUOTE_TEXT_MARKERS: &[&str] = &["-----Original Message-----"];

const BLOCK_ELEMENTS: &[&str] = &[
    "address", "article", "aside", "blockquote", "br", "dd", "div", "dl", "dt", "fieldset",
    "figcaption", "figure", "footer", "form", "h1", "h2", "h3", "h4", "h5", "h6", "header",
    "hr", "li", "main", "nav", "ol", "p", "pre", "section", "table", "td", "th", "tr", "ul",
];

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid regex"));

static QUOTE_SELECTOR_LIST: Lazy<Vec<Selector>> = Lazy::new(|| {
    QUOTE_SELECTORS
        .iter()
        .filter_map(|s| Selector::parse(s).ok())
        .collect()
});

static BODY: Lazy<Option<Selector>> = Lazy::new(|| Selector::parse("body").ok());
static STRIPPED: Lazy<Option<Selector>> = Lazy::new(|| Selector::parse("style, script").ok());

/// Extracts searchable text from an HTML (or HTML-ish) body.
pub fn extract(raw_body: &str, remove_quotes: bool) -> EngineResult<String> {
    let mut doc = Html::parse_document(raw_body);
    strip_non_content(&mut doc);

    let root = doc.root_element();
    let document = BODY
        .as_ref()
        .and_then(|sel| root.select(sel).next())
        .unwrap_or(root);
    let full_text = normalize_whitespace(&element_text(document));

    if !remove_quotes {
        return Ok(full_text);
    }

    Ok(strip_quoted_html(document, &full_text).unwrap_or(full_text))
}

/// Dispatches on the body's MIME type.
pub fn extract_body(raw_body: &str, mime_type: &str, remove_quotes: bool) -> EngineResult<String> {
    let mime = mime_type.trim().to_ascii_lowercase();
    if mime.starts_with("multipart/") {
        return extract_multipart(raw_body, remove_quotes);
    }
    if mime == "text/plain" {
        return Ok(extract_plain(raw_body, remove_quotes));
    }
    extract(raw_body, remove_quotes)
}

/// Like [`extract_body`] but degrades to `None` on a parse error so the
/// caller can index the message by metadata only.
pub fn extract_or_none(
    message_id: &str,
    raw_body: &str,
    mime_type: &str,
    remove_quotes: bool,
) -> Option<String> {
    match extract_body(raw_body, mime_type, remove_quotes) {
        Ok(text) => Some(text),
        Err(e) => {
            warn!(message_id = %message_id, error = %e, "Content extraction failed; indexing metadata only");
            None
        }
    }
}

pub fn extract_plain(text: &str, remove_quotes: bool) -> String {
    if !remove_quotes {
        return normalize_whitespace(text);
    }

    let mut kept = Vec::new();
    for line in text.lines() {
        let trimmed = line.trim();
        if QUOTE_TEXT_MARKERS.iter().any(|m| trimmed.starts_with(m)) {
            break;
        }
        if trimmed.starts_with('>') {
            continue;
        }
        kept.push(line);
    }
    normalize_whitespace(&kept.join("\n"))
}

pub fn normalize_whitespace(text: &str) -> String {
    WHITESPACE.replace_all(text, " ").trim().to_string()
}

fn extract_multipart(raw_body: &str, remove_quotes: bool) -> EngineResult<String> {
    let parsed = mailparse::parse_mail(raw_body.as_bytes())
        .map_err(|e| EngineError::ContentParse(format!("parsing MIME body: {e}")))?;

    if let Some(html) = find_part(&parsed, "text/html") {
        let body = html
            .get_body()
            .map_err(|e| EngineError::ContentParse(format!("decoding html part: {e}")))?;
        return extract(&body, remove_quotes);
    }
    if let Some(plain) = find_part(&parsed, "text/plain") {
        let body = plain
            .get_body()
            .map_err(|e| EngineError::ContentParse(format!("decoding text part: {e}")))?;
        return Ok(extract_plain(&body, remove_quotes));
    }
    Ok(String::new())
}

fn find_part<'a>(parsed: &'a ParsedMail<'a>, mimetype: &str) -> Option<&'a ParsedMail<'a>> {
    if parsed.subparts.is_empty() {
        let is_attachment = parsed.get_content_disposition().disposition
            == mailparse::DispositionType::Attachment;
        if parsed.ctype.mimetype.eq_ignore_ascii_case(mimetype) && !is_attachment {
            return Some(parsed);
        }
        return None;
    }
    parsed.subparts.iter().find_map(|part| find_part(part, mimetype))
}

fn strip_non_content(doc: &mut Html) {
    let Some(selector) = STRIPPED.as_ref() else {
        return;
    };
    let ids: Vec<_> = doc.select(selector).map(|el| el.id()).collect();
    for id in ids {
        if let Some(mut node) = doc.tree.get_mut(id) {
            node.detach();
        }
    }
}

/// Finds the first quote container (by selector priority, then textual
/// marker) that sits at the very end of the document and returns the text
/// in front of it.
fn strip_quoted_html(document: ElementRef<'_>, full_text: &str) -> Option<String> {
    for selector in QUOTE_SELECTOR_LIST.iter() {
        for candidate in document.select(selector) {
            let quote_text = normalize_whitespace(&element_text(candidate));
            if quote_text.is_empty() {
                continue;
            }
            let (before, after) = split_once(full_text, &quote_text);
            if !before.trim().is_empty() && after.trim().is_empty() {
                return Some(before.trim().to_string());
            }
        }
    }

    for marker in QUOTE_TEXT_MARKERS {
        if let Some(idx) = full_text.find(marker) {
            let before = full_text[..idx].trim();
            if !before.is_empty() {
                return Some(before.to_string());
            }
        }
    }

    None
}

fn split_once<'a>(source: &'a str, needle: &str) -> (&'a str, &'a str) {
    match source.find(needle) {
        Some(idx) => (&source[..idx], &source[idx + needle.len()..]),
        None => (source, ""),
    }
}

/// Text of an element; block-level elements act as word boundaries.
fn element_text(element: ElementRef<'_>) -> String {
    let mut out = String::new();
    push_text(element, &mut out);
    out
}

fn push_text(element: ElementRef<'_>, out: &mut String) {
    let is_block = BLOCK_ELEMENTS.contains(&element.value().name());
    if is_block {
        out.push(' ');
    }
    for child in element.children() {
        if let Some(child_element) = ElementRef::wrap(child) {
            push_text(child_element, out);
        } else if let Some(text) = child.value().as_text() {
            out.push_str(text);
        }
    }
    if is_block {
        out.push(' ');
    }
}
