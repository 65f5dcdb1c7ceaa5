//! Structured annotations embedded in the remote's free-text note field.
//!
//! The note carries user text plus `[key:value]` tokens in any order:
//! `"User note [paired:12345] [suspect_reason:date-delay-3d]"`. Parsing
//! tolerates interleaving; re-serializing preserves the user text and emits
//! tokens in stable order (`paired`, then `suspect_reason`, then remaining
//! keys sorted).

use std::collections::BTreeMap;

use regex::Regex;
use std::sync::OnceLock;

fn token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[([A-Za-z0-9_-]+):([^\]]*)\]").unwrap())
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedNote {
    pub text: String,
    pub annotations: BTreeMap<String, String>,
}

/// Split a remote note into user text and annotations. Annotation tokens are
/// removed from the text; surrounding whitespace collapses.
pub fn parse(note: &str) -> ParsedNote {
    let mut annotations = BTreeMap::new();
    for caps in token_re().captures_iter(note) {
        annotations.insert(caps[1].to_string(), caps[2].trim().to_string());
    }
    let stripped = token_re().replace_all(note, "");
    let text = stripped.split_whitespace().collect::<Vec<_>>().join(" ");
    ParsedNote { text, annotations }
}

/// Render user text plus annotations back into a note string.
pub fn serialize(text: &str, annotations: &BTreeMap<String, String>) -> String {
    let mut parts: Vec<String> = Vec::new();
    let trimmed = text.trim();
    if !trimmed.is_empty() {
        parts.push(trimmed.to_string());
    }

    // Stable order: paired first, suspect_reason second, the rest sorted.
    for key in ["paired", "suspect_reason"] {
        if let Some(value) = annotations.get(key) {
            parts.push(format!("[{key}:{value}]"));
        }
    }
    for (key, value) in annotations {
        if key != "paired" && key != "suspect_reason" {
            parts.push(format!("[{key}:{value}]"));
        }
    }

    parts.join(" ")
}
