//! Session pool
//!
//! Maps conversation keys to managed agent sessions, computes the text
//! delta each turn forwards, and keeps the pool healthy: per-key prompt
//! serialization, idle GC, context-critical resets, and a periodic
//! heartbeat of diagnostics.

mod managed;
#[allow(clippy::module_inception)]
mod pool;

pub use managed::{ManagedSession, SessionDiagnostics};
pub use pool::{SessionPool, Turn};

use crate::openai::ChatMessage;

/// Render prompt text from a message window.
///
/// Only user messages contribute, joined by a blank line. System messages
/// are dropped: the agent has its own workspace-rooted context, and
/// platform-level system prompts would cross-contaminate channels sharing
/// a workspace.
#[must_use]
pub fn render_prompt(messages: &[ChatMessage]) -> String {
    let joined = messages
        .iter()
        .filter(|m| m.role == "user")
        .map(ChatMessage::text)
        .collect::<Vec<_>>()
        .join("\n\n");
    joined.trim().to_string()
}

/// Text of the most recent user message, used by the recovery retry
#[must_use]
pub fn latest_user_text(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .rev()
        .find(|m| m.role == "user")
        .map(|m| m.text().trim().to_string())
        .unwrap_or_default()
}

/// Short key form for logs and diagnostics
#[must_use]
pub(crate) fn key_prefix(key: &str) -> &str {
    key.get(..8).unwrap_or(key)
}
