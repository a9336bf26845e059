//! Stdout reader task for one agent subprocess
//!
//! Single consumer of the line protocol: parses one JSON frame per line,
//! demuxes responses to their waiters, dispatches notifications, and
//! answers `requestPermission` inline. Every line, whatever its kind,
//! counts as activity for the silence watchdog.

use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::ChildStdout;

use super::rpc::{self, Incoming, SessionUpdate};
use super::session::Shared;

pub(super) async fn read_loop(mut stdout: BufReader<ChildStdout>, shared: Arc<Shared>) {
    let mut line = String::new();
    loop {
        line.clear();
        match stdout.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                shared.bump_activity();
                match serde_json::from_str::<Value>(trimmed) {
                    Ok(value) => handle_message(&shared, value).await,
                    Err(e) => log::warn!("agent emitted unparsable line: {e}"),
                }
            }
            Err(e) => {
                log::debug!("agent stdout read failed: {e}");
                break;
            }
        }
    }
    // EOF: drop pending senders so waiters observe the exit
    shared.fail_pending();
    log::debug!("agent stdout closed");
}

async fn handle_message(shared: &Shared, value: Value) {
    let Some(incoming) = rpc::classify(value) else {
        log::warn!("unclassifiable agent frame");
        return;
    };

    match incoming {
        Incoming::Response { id, outcome } => shared.complete(id, outcome),
        Incoming::Request { id, method, params } => match method.as_str() {
            rpc::METHOD_REQUEST_PERMISSION => {
                let outcome = rpc::select_permission_outcome(&params);
                log::debug!(
                    "permission request answered: {}",
                    outcome["outcome"]["outcome"]
                );
                let _ = shared.write_line(&rpc::response_line(&id, outcome)).await;
            }
            other => {
                log::warn!("unsupported agent request: {other}");
                let _ = shared
                    .write_line(&rpc::error_response_line(&id, -32601, "method not found"))
                    .await;
            }
        },
        Incoming::Notification { method, params } => match method.as_str() {
            rpc::METHOD_SESSION_UPDATE => match rpc::parse_session_update(&params) {
                SessionUpdate::MessageChunk(text) => shared.send_chunk(text),
                SessionUpdate::ToolCall { title, status } => {
                    log::debug!("tool call: {title} [{status}]");
                }
                SessionUpdate::Other(kind) => log::debug!("unhandled session update: {kind}"),
            },
            rpc::METHOD_EXTENSION_NOTIFICATION => {
                if let Some(pct) = rpc::context_usage_pct(&params) {
                    shared.record_context(pct);
                }
            }
            other => log::debug!("extension notification: {other}"),
        },
    }
}
