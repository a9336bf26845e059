//! JSON-RPC 2.0 line-protocol frames
//!
//! Every line on the agent's stdin/stdout is one JSON-RPC request,
//! response, or notification. The gateway issues `initialize` and
//! `newSession` during the handshake and one `prompt` per turn; it services
//! `sessionUpdate` notifications, `requestPermission` calls, and the
//! vendor extension notification carrying context usage.

use std::path::Path;

use serde_json::{json, Value};

/// Handshake request establishing protocol version and capabilities
pub const METHOD_INITIALIZE: &str = "initialize";
/// Handshake request creating the agent-side session
pub const METHOD_NEW_SESSION: &str = "newSession";
/// Per-turn request carrying the prompt text
pub const METHOD_PROMPT: &str = "prompt";
/// Server notification with typed session events
pub const METHOD_SESSION_UPDATE: &str = "sessionUpdate";
/// Server request asking to approve a tool invocation
pub const METHOD_REQUEST_PERMISSION: &str = "requestPermission";
/// Vendor extension notification with out-of-band metadata
pub const METHOD_EXTENSION_NOTIFICATION: &str = "_kiro/notification";

/// Line-protocol version this client speaks
pub const PROTOCOL_VERSION: u64 = 1;

/// Error object from a JSON-RPC response
#[derive(Debug, Clone)]
pub struct RpcError {
    /// JSON-RPC error code
    pub code: i64,
    /// Human-readable message
    pub message: String,
}

/// One incoming line, classified
#[derive(Debug)]
pub enum Incoming {
    /// Response to one of our requests
    Response {
        /// Request id this response answers
        id: u64,
        /// Result payload or error
        outcome: Result<Value, RpcError>,
    },
    /// Server-initiated request expecting a response
    Request {
        /// Server-chosen request id, echoed back verbatim
        id: Value,
        /// Method name
        method: String,
        /// Request parameters
        params: Value,
    },
    /// Server-initiated notification
    Notification {
        /// Method name
        method: String,
        /// Notification parameters
        params: Value,
    },
}

/// Classify one parsed line. Returns `None` for frames that are neither a
/// response, a request, nor a notification.
#[must_use]
pub fn classify(value: Value) -> Option<Incoming> {
    let obj = value.as_object()?;

    if let Some(method) = obj.get("method").and_then(Value::as_str) {
        let method = method.to_string();
        let params = obj.get("params").cloned().unwrap_or(Value::Null);
        if let Some(id) = obj.get("id") {
            return Some(Incoming::Request {
                id: id.clone(),
                method,
                params,
            });
        }
        return Some(Incoming::Notification { method, params });
    }

    let id = obj.get("id").and_then(Value::as_u64)?;
    if let Some(error) = obj.get("error") {
        let code = error.get("code").and_then(Value::as_i64).unwrap_or(0);
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        return Some(Incoming::Response {
            id,
            outcome: Err(RpcError { code, message }),
        });
    }
    let result = obj.get("result").cloned().unwrap_or(Value::Null);
    Some(Incoming::Response {
        id,
        outcome: Ok(result),
    })
}

/// Serialize an outgoing request, newline-terminated
#[must_use]
pub fn request_line(id: u64, method: &str, params: Value) -> String {
    let frame = json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params});
    format!("{frame}\n")
}

/// Serialize a response to a server-initiated request
#[must_use]
pub fn response_line(id: &Value, result: Value) -> String {
    let frame = json!({"jsonrpc": "2.0", "id": id, "result": result});
    format!("{frame}\n")
}

/// Serialize an error response to a server-initiated request
#[must_use]
pub fn error_response_line(id: &Value, code: i64, message: &str) -> String {
    let frame = json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}});
    format!("{frame}\n")
}

/// Parameters for the `initialize` handshake request
#[must_use]
pub fn initialize_params() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "clientCapabilities": {
            "fs": {"readTextFile": false, "writeTextFile": false},
        },
        "clientInfo": {
            "name": "kiro-gateway",
            "version": env!("CARGO_PKG_VERSION"),
        },
    })
}

/// Parameters for the `newSession` handshake request
#[must_use]
pub fn new_session_params(cwd: &Path) -> Value {
    json!({"cwd": cwd.to_string_lossy(), "mcpServers": []})
}

/// Parameters for one `prompt` request
#[must_use]
pub fn prompt_params(session_id: &str, text: &str) -> Value {
    json!({
        "sessionId": session_id,
        "prompt": [{"type": "text", "text": text}],
    })
}

/// A typed `sessionUpdate` event
#[derive(Debug, PartialEq)]
pub enum SessionUpdate {
    /// Text delta of the assistant reply
    MessageChunk(String),
    /// Tool invocation beacon
    ToolCall {
        /// Human-readable tool title
        title: String,
        /// Tool status (`pending`, `in_progress`, `completed`, ...)
        status: String,
    },
    /// Any other update kind, ignored beyond the activity bump
    Other(String),
}

/// Parse the `update` payload of a `sessionUpdate` notification
#[must_use]
pub fn parse_session_update(params: &Value) -> SessionUpdate {
    let update = &params["update"];
    let kind = update["sessionUpdate"].as_str().unwrap_or("");
    match kind {
        "agent_message_chunk" => {
            let text = update["content"]["text"]
                .as_str()
                .or_else(|| update["content"].as_str())
                .unwrap_or("")
                .to_string();
            SessionUpdate::MessageChunk(text)
        }
        "tool_call" => SessionUpdate::ToolCall {
            title: update["title"].as_str().unwrap_or("").to_string(),
            status: update["status"].as_str().unwrap_or("").to_string(),
        },
        other => SessionUpdate::Other(other.to_string()),
    }
}

/// Context usage percentage from an extension notification, if present
#[must_use]
pub fn context_usage_pct(params: &Value) -> Option<f64> {
    params["metadata"]["contextUsagePercentage"].as_f64()
}

/// Build the `requestPermission` outcome: the first option whose kind is
/// `allow_once` or `allow_always` is selected, otherwise the request is
/// cancelled. No interactive prompt is ever issued.
#[must_use]
pub fn select_permission_outcome(params: &Value) -> Value {
    let selected = params["options"].as_array().and_then(|options| {
        options.iter().find_map(|opt| {
            let kind = opt["kind"].as_str().unwrap_or("");
            if kind == "allow_once" || kind == "allow_always" {
                opt["optionId"].as_str().map(str::to_string)
            } else {
                None
            }
        })
    });

    match selected {
        Some(option_id) => json!({"outcome": {"outcome": "selected", "optionId": option_id}}),
        None => json!({"outcome": {"outcome": "cancelled"}}),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_response_request_and_notification() {
        let resp = classify(json!({"jsonrpc": "2.0", "id": 3, "result": {"ok": true}}));
        assert!(matches!(
            resp,
            Some(Incoming::Response { id: 3, outcome: Ok(_) })
        ));

        let err = classify(json!({"jsonrpc": "2.0", "id": 4, "error": {"code": -32000, "message": "boom"}}));
        match err {
            Some(Incoming::Response {
                id: 4,
                outcome: Err(e),
            }) => assert_eq!(e.message, "boom"),
            other => panic!("unexpected: {other:?}"),
        }

        let req = classify(json!({"jsonrpc": "2.0", "id": "srv-1", "method": "requestPermission", "params": {}}));
        assert!(matches!(req, Some(Incoming::Request { .. })));

        let notif = classify(json!({"jsonrpc": "2.0", "method": "sessionUpdate", "params": {}}));
        assert!(matches!(notif, Some(Incoming::Notification { .. })));

        assert!(classify(json!("not an object")).is_none());
    }

    #[test]
    fn parses_message_chunks_and_tool_calls() {
        let chunk = parse_session_update(&json!({
            "update": {
                "sessionUpdate": "agent_message_chunk",
                "content": {"type": "text", "text": "hello"},
            }
        }));
        assert_eq!(chunk, SessionUpdate::MessageChunk("hello".to_string()));

        let tool = parse_session_update(&json!({
            "update": {"sessionUpdate": "tool_call", "title": "cargo test", "status": "in_progress"}
        }));
        assert_eq!(
            tool,
            SessionUpdate::ToolCall {
                title: "cargo test".to_string(),
                status: "in_progress".to_string(),
            }
        );

        let other = parse_session_update(&json!({"update": {"sessionUpdate": "plan"}}));
        assert_eq!(other, SessionUpdate::Other("plan".to_string()));
    }

    #[test]
    fn permission_policy_selects_first_allow() {
        let outcome = select_permission_outcome(&json!({
            "options": [
                {"optionId": "reject", "kind": "reject_once"},
                {"optionId": "yes-once", "kind": "allow_once"},
                {"optionId": "yes-always", "kind": "allow_always"},
            ]
        }));
        assert_eq!(outcome["outcome"]["outcome"], "selected");
        assert_eq!(outcome["outcome"]["optionId"], "yes-once");

        let cancelled = select_permission_outcome(&json!({
            "options": [{"optionId": "reject", "kind": "reject_once"}]
        }));
        assert_eq!(cancelled["outcome"]["outcome"], "cancelled");
    }

    #[test]
    fn extension_metadata_carries_context_usage() {
        let params = json!({"metadata": {"contextUsagePercentage": 87.5}});
        assert_eq!(context_usage_pct(&params), Some(87.5));
        assert_eq!(context_usage_pct(&json!({})), None);
    }
}
