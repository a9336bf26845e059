//! OpenAI chat-completions wire subset
//!
//! Request parsing and response/chunk construction for the compatibility
//! surface. Only the fields the gateway acts on are modeled; `temperature`
//! and `max_tokens` are accepted and ignored.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

/// Request body for `POST /v1/chat/completions`
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionRequest {
    /// Requested model; ignored, the synthetic id is always returned
    #[serde(default)]
    pub model: Option<String>,
    /// Full running conversation, oldest first
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    /// Server-sent events when true; defaults to true when absent
    #[serde(default)]
    pub stream: Option<bool>,
    /// Optional explicit session key
    #[serde(default)]
    pub user: Option<String>,
    /// Accepted and ignored
    #[serde(default)]
    pub temperature: Option<f64>,
    /// Accepted and ignored
    #[serde(default)]
    pub max_tokens: Option<u64>,
}

/// One conversation message
///
/// The role is kept as a plain string: unknown roles stay in the
/// fingerprint window but are never forwarded to the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Message role (`system`, `user`, `assistant`, or anything else)
    pub role: String,
    /// String content or an ordered list of typed parts
    pub content: MessageContent,
}

impl ChatMessage {
    /// Convenience constructor used throughout the tests
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: MessageContent::Text(content.into()),
        }
    }

    /// Textual content of this message
    #[must_use]
    pub fn text(&self) -> String {
        self.content.text()
    }
}

/// Message content: a bare string or typed content parts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    /// Plain string content
    Text(String),
    /// Ordered content parts; only `text` parts contribute
    Parts(Vec<ContentPart>),
}

/// One typed content part
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentPart {
    /// Part discriminator (`text`, `image_url`, ...)
    #[serde(rename = "type")]
    pub kind: String,
    /// Text payload for `text` parts
    #[serde(default)]
    pub text: Option<String>,
}

impl MessageContent {
    /// Concatenated text of the content; non-text parts are dropped
    #[must_use]
    pub fn text(&self) -> String {
        match self {
            Self::Text(s) => s.clone(),
            Self::Parts(parts) => parts
                .iter()
                .filter(|p| p.kind == "text")
                .filter_map(|p| p.text.as_deref())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// Fresh `chatcmpl-` id shared by all frames of one turn
#[must_use]
pub fn completion_id() -> String {
    format!("chatcmpl-{}", Uuid::new_v4())
}

/// Current unix timestamp for the `created` field
#[must_use]
pub fn created_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// One streaming chunk frame
#[must_use]
pub fn chunk(id: &str, model: &str, created: i64, delta: Value, finish: Option<&str>) -> Value {
    json!({
        "id": id,
        "object": "chat.completion.chunk",
        "created": created,
        "model": model,
        "choices": [{
            "index": 0,
            "delta": delta,
            "finish_reason": finish,
        }],
    })
}

/// The opening chunk announcing the assistant role
#[must_use]
pub fn role_chunk(id: &str, model: &str, created: i64) -> Value {
    chunk(id, model, created, json!({"role": "assistant"}), None)
}

/// A content delta chunk
#[must_use]
pub fn content_chunk(id: &str, model: &str, created: i64, text: &str) -> Value {
    chunk(id, model, created, json!({"content": text}), None)
}

/// The finalizer chunk closing the stream
#[must_use]
pub fn finish_chunk(id: &str, model: &str, created: i64) -> Value {
    chunk(id, model, created, json!({}), Some("stop"))
}

/// A blocking completion object
#[must_use]
pub fn completion(id: &str, model: &str, created: i64, content: &str) -> Value {
    json!({
        "id": id,
        "object": "chat.completion",
        "created": created,
        "model": model,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop",
        }],
        "usage": {"prompt_tokens": 0, "completion_tokens": 0, "total_tokens": 0},
    })
}

/// The `GET /v1/models` listing with the single synthetic model
#[must_use]
pub fn models_list(model: &str) -> Value {
    json!({
        "object": "list",
        "data": [{
            "id": model,
            "object": "model",
            "created": created_now(),
            "owned_by": "kiro-gateway",
        }],
    })
}

/// OpenAI-shaped error body
#[must_use]
pub fn error_body(message: &str, kind: &str) -> Value {
    json!({"error": {"message": message, "type": kind}})
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_accepts_string_and_parts() {
        let req: ChatCompletionRequest = serde_json::from_str(
            r#"{"model":"x","messages":[
                {"role":"user","content":"plain"},
                {"role":"user","content":[
                    {"type":"text","text":"first"},
                    {"type":"image_url","image_url":{"url":"ignored"}},
                    {"type":"text","text":"second"}
                ]}
            ]}"#,
        )
        .expect("parse");

        assert_eq!(req.messages[0].text(), "plain");
        assert_eq!(req.messages[1].text(), "first\nsecond");
    }

    #[test]
    fn stream_defaults_to_absent() {
        let req: ChatCompletionRequest =
            serde_json::from_str(r#"{"model":"x","messages":[{"role":"user","content":"hi"}]}"#)
                .expect("parse");
        assert!(req.stream.is_none());
    }

    #[test]
    fn chunk_shape_matches_openai() {
        let frame = content_chunk("chatcmpl-1", "kiro-agent", 123, "hello");
        assert_eq!(frame["object"], "chat.completion.chunk");
        assert_eq!(frame["choices"][0]["delta"]["content"], "hello");
        assert!(frame["choices"][0]["finish_reason"].is_null());

        let fin = finish_chunk("chatcmpl-1", "kiro-agent", 123);
        assert_eq!(fin["choices"][0]["finish_reason"], "stop");
    }

    #[test]
    fn completion_reports_zero_usage() {
        let body = completion("chatcmpl-1", "kiro-agent", 123, "done");
        assert_eq!(body["choices"][0]["message"]["content"], "done");
        assert_eq!(body["usage"]["total_tokens"], 0);
    }
}
