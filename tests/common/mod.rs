//! Shared test harness: a scripted stub agent speaking just enough of the
//! line protocol for each scenario, plus helpers to spin the gateway up
//! against it.
#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use kiro_gateway::{build_router, AppState, GatewayConfig, RouteTable, SessionPool};

const SCRIPT_TEMPLATE: &str = r#"#!/bin/sh
LOG="__LOG__"
STATE="__STATE__"
reply() { printf '%s\n' "$1"; }
PROMPT_N=0
while IFS= read -r line; do
  printf '%s\n' "$line" >> "$LOG"
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
  case "$line" in
    *'"method":"initialize"'*)
      reply "{\"jsonrpc\":\"2.0\",\"id\":$id,\"result\":{\"protocolVersion\":1}}"
      ;;
    *'"method":"newSession"'*)
      reply "{\"jsonrpc\":\"2.0\",\"id\":$id,\"result\":{\"sessionId\":\"stub-$$\"}}"
      ;;
    *'"method":"prompt"'*)
      PROMPT_N=$((PROMPT_N+1))
__PROMPT_BODY__
      ;;
  esac
done
"#;

/// Shell line answering the current prompt request successfully
pub const RESULT_LINE: &str =
    r#"      reply "{\"jsonrpc\":\"2.0\",\"id\":$id,\"result\":{\"stopReason\":\"end_turn\"}}""#;

/// Shell line answering the current prompt request with the history error
pub const INVALID_HISTORY_LINE: &str = r#"      reply "{\"jsonrpc\":\"2.0\",\"id\":$id,\"error\":{\"code\":-32000,\"message\":\"invalid conversation history received\"}}""#;

/// Shell line answering the current prompt request with a generic error
pub const GENERIC_ERROR_LINE: &str = r#"      reply "{\"jsonrpc\":\"2.0\",\"id\":$id,\"error\":{\"code\":-32001,\"message\":\"agent exploded\"}}""#;

/// `sessionUpdate` notification carrying one text chunk
pub fn chunk_notification(text: &str) -> String {
    serde_json::json!({
        "jsonrpc": "2.0",
        "method": "sessionUpdate",
        "params": {
            "sessionId": "stub",
            "update": {
                "sessionUpdate": "agent_message_chunk",
                "content": {"type": "text", "text": text},
            },
        },
    })
    .to_string()
}

/// Extension notification reporting context usage
pub fn context_notification(pct: f64) -> String {
    serde_json::json!({
        "jsonrpc": "2.0",
        "method": "_kiro/notification",
        "params": {"metadata": {"contextUsagePercentage": pct}},
    })
    .to_string()
}

/// Prompt body: stream one chunk, then succeed
pub fn scripted_reply(text: &str) -> String {
    format!("      reply '{}'\n{}", chunk_notification(text), RESULT_LINE)
}

/// Prompt body: fail with invalid history on the first spawned process,
/// reply normally on any replacement
pub fn invalid_history_then(text: &str) -> String {
    format!(
        "      if [ ! -f \"$STATE\" ]; then\n        touch \"$STATE\"\n{INVALID_HISTORY_LINE}\n      else\n{}\n      fi",
        scripted_reply(text)
    )
}

/// Prompt body: report critical context usage mid-reply, then succeed
pub fn context_critical_reply(text: &str) -> String {
    format!(
        "      reply '{}'\n{}",
        context_notification(96.0),
        scripted_reply(text)
    )
}

/// Prompt body: stay silent past the activity window, then succeed
pub fn silent_reply(secs: u64) -> String {
    format!("      sleep {secs}\n{RESULT_LINE}")
}

/// A generated stub agent script plus its request log
pub struct StubAgent {
    pub dir: TempDir,
    pub script: PathBuf,
    pub log: PathBuf,
    pub state: PathBuf,
}

impl StubAgent {
    pub fn new(prompt_body: &str) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = dir.path().join("requests.log");
        let state = dir.path().join("state");
        let script = dir.path().join("stub-agent.sh");

        let body = SCRIPT_TEMPLATE
            .replace("__LOG__", &log.display().to_string())
            .replace("__STATE__", &state.display().to_string())
            .replace("__PROMPT_BODY__", prompt_body);
        std::fs::write(&script, body).expect("write stub script");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))
                .expect("chmod stub script");
        }

        Self {
            dir,
            script,
            log,
            state,
        }
    }

    /// Prompt texts the stub received, in order, across all spawns
    pub fn prompt_texts(&self) -> Vec<String> {
        self.request_lines()
            .into_iter()
            .filter(|v| v["method"] == "prompt")
            .filter_map(|v| v["params"]["prompt"][0]["text"].as_str().map(str::to_string))
            .collect()
    }

    /// Number of subprocesses spawned so far (one initialize each)
    pub fn spawn_count(&self) -> usize {
        self.request_lines()
            .into_iter()
            .filter(|v| v["method"] == "initialize")
            .count()
    }

    fn request_lines(&self) -> Vec<serde_json::Value> {
        let Ok(raw) = std::fs::read_to_string(&self.log) else {
            return Vec::new();
        };
        raw.lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }
}

/// Config pointing the gateway at the stub, with test-friendly timers
pub fn test_config(stub: &StubAgent) -> GatewayConfig {
    GatewayConfig {
        kiro_bin: stub.script.clone(),
        cwd: stub.dir.path().to_path_buf(),
        prompt_timeout: Duration::from_secs(2),
        idle_timeout: Duration::from_secs(600),
        ..Default::default()
    }
}

/// Serve the gateway on an ephemeral port; returns its base URL and pool
pub async fn spawn_app(config: GatewayConfig) -> (String, SessionPool) {
    let config = Arc::new(config);
    let pool = SessionPool::new(Arc::clone(&config), RouteTable::empty());
    let state = AppState {
        pool: pool.clone(),
        config,
    };
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, build_router(state)).await.expect("serve");
    });
    (format!("http://{addr}"), pool)
}
