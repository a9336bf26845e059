//! Completions bridge
//!
//! Wires a parsed chat-completions request through the pool to an agent
//! session and translates the chunk stream back into SSE frames (or one
//! buffered completion). Locally recoverable failures never surface as an
//! HTTP error in the streaming path: the stream ends with an in-band
//! message and a well-formed terminal frame.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::agent::AgentSession;
use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::fingerprint::resolve_key;
use crate::openai::{self, ChatCompletionRequest, ChatMessage};
use crate::pool::{key_prefix, latest_user_text, Turn};

use super::AppState;

/// Explicit caller-chosen session key, highest precedence
const EXPLICIT_SESSION_HEADER: &str = "x-kiro-session-id";
/// Opaque identifier from the outer chat-platform adapter
const PLATFORM_SESSION_HEADER: &str = "x-openclaw-session-key";

const SIZE_WARN_CHARS: usize = 500_000;
const SIZE_INFO_CHARS: usize = 200_000;

const TIMEOUT_MESSAGE: &str = "⚠️ The session went silent for too long (no tool activity). It has been reset — please resend your message.";
const MULTI_ERROR_MESSAGE: &str = "⚠️ Multiple consecutive errors detected. The session has been reset — please resend your message.";
const CORRUPTION_MESSAGE: &str = "⚠️ Session history became corrupted and auto-recovery failed. Please send /new to reset this conversation.";

struct TurnContext {
    state: AppState,
    key: String,
    messages: Vec<ChatMessage>,
    platform_key: Option<String>,
}

pub(super) async fn completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request: ChatCompletionRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => return invalid_request(&format!("Invalid JSON body: {e}")),
    };
    if request.messages.is_empty() {
        return invalid_request("messages must be a non-empty array");
    }

    let platform_key = header_value(&headers, PLATFORM_SESSION_HEADER);
    let explicit = header_value(&headers, EXPLICIT_SESSION_HEADER)
        .or_else(|| platform_key.clone())
        .or_else(|| request.user.clone());
    let key = resolve_key(&request.messages, explicit.as_deref());

    let total_chars: usize = request
        .messages
        .iter()
        .map(|m| m.text().chars().count())
        .sum();
    if total_chars > SIZE_WARN_CHARS {
        log::warn!(
            "very large payload for {}: {total_chars} chars",
            key_prefix(&key)
        );
    } else if total_chars > SIZE_INFO_CHARS {
        log::info!("large payload for {}: {total_chars} chars", key_prefix(&key));
    }

    let stream = request.stream.unwrap_or(true);
    let turn = match state
        .pool
        .get_or_create(&key, &request.messages, platform_key.as_deref())
        .await
    {
        Ok(turn) => turn,
        Err(e) => {
            log::error!("session unavailable for {}: {e}", key_prefix(&key));
            return error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                &e.to_string(),
                "service_unavailable",
            );
        }
    };

    if turn.delta_text.is_empty() {
        // the new tail held no user text (assistant echoes only)
        return empty_completion(&state.config.model_id, stream);
    }

    let ctx = TurnContext {
        state: state.clone(),
        key,
        messages: request.messages,
        platform_key,
    };
    if stream {
        stream_turn(ctx, turn)
    } else {
        blocking_turn(ctx, turn).await
    }
}

// ============================================================================
// Streaming path
// ============================================================================

fn stream_turn(ctx: TurnContext, turn: Turn) -> Response {
    let (tx, rx) = mpsc::unbounded_channel();
    let emitter = ChunkEmitter::new(tx, ctx.state.config.model_id.clone());
    tokio::spawn(drive_stream(ctx, turn, emitter));
    sse_response(rx)
}

async fn drive_stream(ctx: TurnContext, turn: Turn, emitter: ChunkEmitter) {
    emitter.role();

    let failed = Arc::clone(&turn.managed.session);
    let result = prompt_into(turn.session(), &turn.delta_text, &emitter).await;
    let completed = match result {
        Ok(()) => Some(Arc::clone(&turn.managed.session)),
        Err(e) => recover_stream(&ctx, &emitter, e, &failed).await,
    };

    if let Some(session) = completed {
        session.clear_errors();
        if let Some(warning) = context_warning(&ctx.state.config, session.last_context_pct()) {
            emitter.content(&warning);
        }
    }
    emitter.finish();
    drop(turn);
}

/// Streaming recovery: reset on timeout/invalid-history/error-threshold,
/// retry the latest user turn once on invalid history, and end the stream
/// with the matching in-band message. Returns the session that produced a
/// complete reply, if any.
async fn recover_stream(
    ctx: &TurnContext,
    emitter: &ChunkEmitter,
    error: GatewayError,
    failed: &Arc<AgentSession>,
) -> Option<Arc<AgentSession>> {
    let pool = &ctx.state.pool;
    let prefix = key_prefix(&ctx.key);

    if matches!(error, GatewayError::PromptTimeout(_)) {
        log::warn!("prompt idle timeout for {prefix}");
        pool.reset_session(&ctx.key, "prompt-idle-timeout").await;
        emitter.content(TIMEOUT_MESSAGE);
        return None;
    }

    if error.is_invalid_history() {
        log::warn!("invalid conversation history for {prefix}, attempting recovery");
        pool.reset_session(&ctx.key, "invalid-conversation-history")
            .await;
        let recovery_text = latest_user_text(&ctx.messages);
        if !recovery_text.is_empty() {
            match pool
                .get_or_create(&ctx.key, &ctx.messages, ctx.platform_key.as_deref())
                .await
            {
                Ok(retry) => match prompt_into(retry.session(), &retry.delta_text, emitter).await {
                    Ok(()) => {
                        log::info!("history recovery succeeded for {prefix}");
                        return Some(Arc::clone(&retry.managed.session));
                    }
                    Err(e) => log::error!("history recovery prompt failed for {prefix}: {e}"),
                },
                Err(e) => log::error!("history recovery respawn failed for {prefix}: {e}"),
            }
        }
        emitter.content(CORRUPTION_MESSAGE);
        return None;
    }

    let errors = failed.record_error();
    if errors >= ctx.state.config.consecutive_error_limit {
        pool.reset_session(&ctx.key, &format!("consecutive-errors-{errors}"))
            .await;
        emitter.content(MULTI_ERROR_MESSAGE);
    } else {
        log::error!("prompt failed for {prefix} ({errors} consecutive): {error}");
    }
    None
}

/// Run one prompt, forwarding chunk callbacks to the emitter as they arrive
async fn prompt_into(
    session: &Arc<AgentSession>,
    text: &str,
    emitter: &ChunkEmitter,
) -> crate::error::Result<()> {
    let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel::<String>();
    let forwarder = {
        let emitter = emitter.clone();
        tokio::spawn(async move {
            while let Some(chunk) = chunk_rx.recv().await {
                emitter.content(&chunk);
            }
        })
    };
    let result = session.prompt(text, chunk_tx).await;
    let _ = forwarder.await;
    result.map(|_stop_reason| ())
}

#[derive(Clone)]
struct ChunkEmitter {
    tx: mpsc::UnboundedSender<Result<Event, Infallible>>,
    id: String,
    model: String,
    created: i64,
}

impl ChunkEmitter {
    fn new(tx: mpsc::UnboundedSender<Result<Event, Infallible>>, model: String) -> Self {
        Self {
            tx,
            id: openai::completion_id(),
            model,
            created: openai::created_now(),
        }
    }

    fn send(&self, frame: &Value) {
        // a failed send means the client disconnected; drop silently
        let _ = self.tx.send(Ok(Event::default().data(frame.to_string())));
    }

    fn role(&self) {
        self.send(&openai::role_chunk(&self.id, &self.model, self.created));
    }

    fn content(&self, text: &str) {
        if !text.is_empty() {
            self.send(&openai::content_chunk(
                &self.id,
                &self.model,
                self.created,
                text,
            ));
        }
    }

    fn finish(&self) {
        self.send(&openai::finish_chunk(&self.id, &self.model, self.created));
        let _ = self.tx.send(Ok(Event::default().data("[DONE]")));
    }
}

// ============================================================================
// Blocking path
// ============================================================================

async fn blocking_turn(ctx: TurnContext, turn: Turn) -> Response {
    let (result, buffered) = prompt_buffered(turn.session(), &turn.delta_text).await;
    let outcome = match result {
        Ok(()) => Ok((Arc::clone(&turn.managed.session), buffered)),
        Err(e) => recover_blocking(&ctx, e, turn.session()).await,
    };

    let response = match outcome {
        Ok((session, mut content)) => {
            session.clear_errors();
            if let Some(warning) = context_warning(&ctx.state.config, session.last_context_pct())
            {
                content.push_str(&warning);
            }
            let body = openai::completion(
                &openai::completion_id(),
                &ctx.state.config.model_id,
                openai::created_now(),
                &content,
            );
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(response) => response,
    };
    drop(turn);
    response
}

async fn recover_blocking(
    ctx: &TurnContext,
    error: GatewayError,
    failed: &Arc<AgentSession>,
) -> Result<(Arc<AgentSession>, String), Response> {
    let pool = &ctx.state.pool;
    let prefix = key_prefix(&ctx.key);

    if matches!(error, GatewayError::PromptTimeout(_)) {
        log::warn!("prompt idle timeout for {prefix}");
        pool.reset_session(&ctx.key, "prompt-idle-timeout").await;
        return Err(error_response(
            StatusCode::GATEWAY_TIMEOUT,
            TIMEOUT_MESSAGE,
            "timeout",
        ));
    }

    if error.is_invalid_history() {
        log::warn!("invalid conversation history for {prefix}, attempting recovery");
        pool.reset_session(&ctx.key, "invalid-conversation-history")
            .await;
        let recovery_text = latest_user_text(&ctx.messages);
        if !recovery_text.is_empty() {
            match pool
                .get_or_create(&ctx.key, &ctx.messages, ctx.platform_key.as_deref())
                .await
            {
                Ok(retry) => {
                    let (result, buffered) =
                        prompt_buffered(retry.session(), &retry.delta_text).await;
                    match result {
                        Ok(()) => {
                            log::info!("history recovery succeeded for {prefix}");
                            return Ok((Arc::clone(&retry.managed.session), buffered));
                        }
                        Err(e) => log::error!("history recovery prompt failed for {prefix}: {e}"),
                    }
                }
                Err(e) => log::error!("history recovery respawn failed for {prefix}: {e}"),
            }
        }
        return Err(error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            CORRUPTION_MESSAGE,
            "server_error",
        ));
    }

    let errors = failed.record_error();
    if errors >= ctx.state.config.consecutive_error_limit {
        pool.reset_session(&ctx.key, &format!("consecutive-errors-{errors}"))
            .await;
        return Err(error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            MULTI_ERROR_MESSAGE,
            "server_error",
        ));
    }
    log::error!("prompt failed for {prefix} ({errors} consecutive): {error}");
    Err(error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        &error.to_string(),
        "server_error",
    ))
}

/// Run one prompt, buffering chunk callbacks into a single string
async fn prompt_buffered(
    session: &Arc<AgentSession>,
    text: &str,
) -> (crate::error::Result<()>, String) {
    let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel::<String>();
    let collector = tokio::spawn(async move {
        let mut buffer = String::new();
        while let Some(chunk) = chunk_rx.recv().await {
            buffer.push_str(&chunk);
        }
        buffer
    });
    let result = session.prompt(text, chunk_tx).await.map(|_stop_reason| ());
    let buffered = collector.await.unwrap_or_default();
    (result, buffered)
}

// ============================================================================
// Shared pieces
// ============================================================================

fn context_warning(config: &GatewayConfig, pct: Option<f64>) -> Option<String> {
    let pct = pct?;
    if pct >= config.context_critical_pct {
        Some(format!(
            "\n\n🚨 Context window at {pct:.0}% — approaching auto-reset threshold (95%). Send /new now to avoid losing your session mid-task."
        ))
    } else if pct >= config.context_warn_pct {
        Some(format!(
            "\n\n⚠️ Context window at {pct:.0}%. Send /new soon to reset before it fills up."
        ))
    } else {
        None
    }
}

fn empty_completion(model: &str, stream: bool) -> Response {
    if stream {
        let (tx, rx) = mpsc::unbounded_channel();
        let emitter = ChunkEmitter::new(tx, model.to_string());
        emitter.role();
        emitter.finish();
        sse_response(rx)
    } else {
        let body = openai::completion(
            &openai::completion_id(),
            model,
            openai::created_now(),
            "",
        );
        (StatusCode::OK, Json(body)).into_response()
    }
}

fn sse_response(rx: mpsc::UnboundedReceiver<Result<Event, Infallible>>) -> Response {
    let mut response = Sse::new(UnboundedReceiverStream::new(rx)).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert(
        HeaderName::from_static("x-accel-buffering"),
        HeaderValue::from_static("no"),
    );
    response
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

fn invalid_request(message: &str) -> Response {
    error_response(StatusCode::BAD_REQUEST, message, "invalid_request_error")
}

fn error_response(status: StatusCode, message: &str, kind: &str) -> Response {
    (status, Json(openai::error_body(message, kind))).into_response()
}
