//! Text extraction dispatch by MIME type.
//!
//! The crawler and the document-provider webhooks both hand the worker raw
//! bytes plus a MIME type; everything downstream (chunking, embedding,
//! persistence) works on plain text.

use scraper::Html;
use tracing::debug;

use crate::{Error, Result};

/// MIME types the extractor understands.
const PLAIN_TEXT_TYPES: [&str; 4] = ["text/plain", "text/markdown", "text/csv", "application/json"];
const HTML_TYPES: [&str; 2] = ["text/html", "application/xhtml+xml"];

/// Stateless text extractor keyed on MIME type.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextExtractor;

impl TextExtractor {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Whether a MIME type is extractable at all.
    #[must_use]
    pub fn supports(&self, mime: &str) -> bool {
        let essence = mime_essence(mime);
        PLAIN_TEXT_TYPES.contains(&essence) || HTML_TYPES.contains(&essence)
    }

    /// Extract plain text from `data` according to its MIME type.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for unknown MIME types. Per the error
    /// taxonomy this is a validation failure: reject immediately, no retry.
    pub fn extract(&self, mime: &str, data: &[u8]) -> Result<String> {
        let essence = mime_essence(mime);

        if PLAIN_TEXT_TYPES.contains(&essence) {
            return Ok(String::from_utf8_lossy(data).into_owned());
        }
        if HTML_TYPES.contains(&essence) {
            let html = String::from_utf8_lossy(data);
            let text = html_to_text(&html);
            debug!(bytes_in = data.len(), chars_out = text.len(), "extracted html text");
            return Ok(text);
        }

        Err(Error::InvalidInput(format!("unsupported mime type: {mime}")))
    }
}

/// Strip parameters such as `; charset=utf-8` and normalize case.
fn mime_essence(mime: &str) -> &str {
    mime.split(';').next().unwrap_or(mime).trim()
}

/// Extract visible text from an HTML document, skipping script and style
/// content, with whitespace collapsed.
fn html_to_text(html: &str) -> String {
    let document = Html::parse_document(html);

    let mut parts: Vec<&str> = Vec::new();
    for node in document.tree.nodes() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node.ancestors().any(|ancestor| {
            ancestor
                .value()
                .as_element()
                .is_some_and(|el| matches!(el.name(), "script" | "style" | "noscript" | "head"))
        });
        if !hidden {
            parts.push(text);
        }
    }

    let mut out = String::new();
    for part in parts {
        let trimmed = part.trim();
        if trimmed.is_empty() {
            continue;
        }
        if !out.is_empty() {
            out.push(' ');
        }
        out.extend(collapse_whitespace(trimmed));
    }
    out
}

fn collapse_whitespace(text: &str) -> impl Iterator<Item = char> + '_ {
    let mut last_was_space = false;
    text.chars().filter_map(move |c| {
        if c.is_whitespace() {
            if last_was_space {
                None
            } else {
                last_was_space = true;
                Some(' ')
            }
        } else {
            last_was_space = false;
            Some(c)
        }
    })
}
