//! Conversation fingerprinting
//!
//! Derives the stable session key that maps a caller's running conversation
//! onto one persistent agent subprocess. An explicit caller-supplied key
//! wins; otherwise the key is a truncated SHA-256 over the conversation
//! anchor (first system message plus first user message) with the two
//! re-stamped noise fields removed so the same logical conversation hashes
//! identically across turns.

use std::sync::LazyLock;

use regex::Regex;
use sha2::{Digest, Sha256};

use crate::openai::ChatMessage;

/// Characters of anchor content that participate in the hash
const ANCHOR_CONTENT_CAP: usize = 512;

/// Embedded `"message_id":"..."` fields chat adapters re-stamp per request
static MESSAGE_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""message_id"\s*:\s*"[^"]*"\s*,?"#).expect("message_id regex")
});

/// Bracketed human-readable timestamps of the shape
/// `[<prefix> <Weekday> YYYY-MM-DD HH:MM <TZ>]`
static TIMESTAMP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\[(?:[^\[\]]*\s)?(?:Mon|Tue|Wed|Thu|Fri|Sat|Sun)[A-Za-z]*,?\s+\d{4}-\d{2}-\d{2}\s+\d{1,2}:\d{2}(?:\s+[^\[\]]*)?\]",
    )
    .expect("timestamp regex")
});

/// Resolve the session key for a conversation.
///
/// A non-blank explicit key is returned verbatim after whitespace trim;
/// otherwise the anchor fingerprint is computed.
#[must_use]
pub fn resolve_key(messages: &[ChatMessage], explicit: Option<&str>) -> String {
    if let Some(key) = explicit {
        let trimmed = key.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }
    fingerprint(messages)
}

/// The low 128 bits of SHA-256 over the conversation anchor, hex-encoded
#[must_use]
pub fn fingerprint(messages: &[ChatMessage]) -> String {
    let anchor = anchor_text(messages);
    let digest = Sha256::digest(anchor.as_bytes());
    hex::encode(&digest[..16])
}

/// Anchor: first system message plus first user message, each prefixed
/// with its role, noise-stripped, and capped.
fn anchor_text(messages: &[ChatMessage]) -> String {
    let mut parts = Vec::with_capacity(2);
    if let Some(system) = messages.iter().find(|m| m.role == "system") {
        parts.push(format!("system:{}", normalize_content(&system.text())));
    }
    if let Some(user) = messages.iter().find(|m| m.role == "user") {
        parts.push(format!("user:{}", normalize_content(&user.text())));
    }
    parts.join("\n")
}

/// Strip the re-stamped noise fields, then cap to the hash window.
///
/// The strips run before the cap so two anchors that agree after
/// noise-stripping hash identically regardless of how long the stamps were.
fn normalize_content(content: &str) -> String {
    let stripped = MESSAGE_ID_RE.replace_all(content, "");
    let stripped = TIMESTAMP_RE.replace_all(&stripped, "");
    stripped.chars().take(ANCHOR_CONTENT_CAP).collect()
}
