//! End-to-end scenarios over the HTTP surface, with the subprocess stubbed
//! by a scripted replier.

mod common;

use std::time::Duration;

use serde_json::{json, Value};

use common::{
    context_critical_reply, invalid_history_then, scripted_reply, silent_reply, spawn_app,
    test_config, StubAgent, GENERIC_ERROR_LINE,
};

fn user(text: &str) -> Value {
    json!({"role": "user", "content": text})
}

fn assistant(text: &str) -> Value {
    json!({"role": "assistant", "content": text})
}

fn completion_body(stream: bool, messages: Vec<Value>) -> Value {
    json!({"model": "x", "stream": stream, "messages": messages})
}

async fn post_completion(base: &str, body: &Value) -> reqwest::Response {
    reqwest::Client::new()
        .post(format!("{base}/v1/chat/completions"))
        .json(body)
        .send()
        .await
        .expect("request")
}

/// Assert `needles` appear in `haystack` in the given order
fn assert_in_order(haystack: &str, needles: &[&str]) {
    let mut from = 0;
    for needle in needles {
        match haystack[from..].find(needle) {
            Some(at) => from += at + needle.len(),
            None => panic!("missing {needle:?} (in order) in:\n{haystack}"),
        }
    }
}

#[tokio::test]
async fn first_turn_streams_role_content_stop_done() {
    let stub = StubAgent::new(&scripted_reply("Hello!"));
    let (base, pool) = spawn_app(test_config(&stub)).await;

    let response = post_completion(
        &base,
        &completion_body(true, vec![user("Hi")]),
    )
    .await;
    assert_eq!(response.status(), 200);
    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    assert!(content_type.starts_with("text/event-stream"), "{content_type}");

    let body = response.text().await.expect("body");
    assert_in_order(
        &body,
        &[
            r#""role":"assistant""#,
            r#""content":"Hello!""#,
            r#""finish_reason":"stop""#,
            "data: [DONE]",
        ],
    );
    assert_eq!(pool.len(), 1);

    pool.shutdown().await;
}

#[tokio::test]
async fn same_conversation_forwards_only_the_delta() {
    let stub = StubAgent::new(&scripted_reply("Hello!"));
    let (base, pool) = spawn_app(test_config(&stub)).await;

    post_completion(&base, &completion_body(true, vec![user("Hi")]))
        .await
        .text()
        .await
        .expect("first body");

    let second = completion_body(
        true,
        vec![user("Hi"), assistant("Hello!"), user("More?")],
    );
    post_completion(&base, &second).await.text().await.expect("second body");

    assert_eq!(
        stub.prompt_texts(),
        vec!["Hi".to_string(), "More?".to_string()],
        "the subprocess sees the delta, not the transcript"
    );
    assert_eq!(pool.len(), 1);

    let sessions: Vec<Value> = reqwest::get(format!("{base}/sessions"))
        .await
        .expect("sessions")
        .json()
        .await
        .expect("sessions json");
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0]["send_count"], 3);

    pool.shutdown().await;
}

#[tokio::test]
async fn missing_messages_is_a_400() {
    let stub = StubAgent::new(&scripted_reply("unused"));
    let (base, pool) = spawn_app(test_config(&stub)).await;

    let response = post_completion(&base, &json!({"model": "x", "stream": false})).await;
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.expect("error body");
    assert_eq!(body["error"]["type"], "invalid_request_error");

    let response = reqwest::Client::new()
        .post(format!("{base}/v1/chat/completions"))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), 400);

    pool.shutdown().await;
}

#[tokio::test]
async fn blocking_mode_returns_one_completion() {
    let stub = StubAgent::new(&scripted_reply("Hello!"));
    let (base, pool) = spawn_app(test_config(&stub)).await;

    let response = post_completion(&base, &completion_body(false, vec![user("Hi")])).await;
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.expect("completion");
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["choices"][0]["message"]["content"], "Hello!");
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
    assert_eq!(body["usage"]["total_tokens"], 0);

    pool.shutdown().await;
}

#[tokio::test]
async fn invalid_history_recovers_on_a_fresh_subprocess() {
    let stub = StubAgent::new(&invalid_history_then("recovered"));
    let (base, pool) = spawn_app(test_config(&stub)).await;

    let body = post_completion(
        &base,
        &completion_body(true, vec![user("first"), user("fix it")]),
    )
    .await
    .text()
    .await
    .expect("body");
    assert_in_order(&body, &[r#""content":"recovered""#, "data: [DONE]"]);

    // full window to the first agent, latest user turn to the replacement
    assert_eq!(
        stub.prompt_texts(),
        vec!["first\n\nfix it".to_string(), "fix it".to_string()]
    );
    assert_eq!(stub.spawn_count(), 2);

    let sessions: Vec<Value> = reqwest::get(format!("{base}/sessions"))
        .await
        .expect("sessions")
        .json()
        .await
        .expect("sessions json");
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0]["send_count"], 2);

    pool.shutdown().await;
}

#[tokio::test]
async fn context_critical_resets_after_the_reply() {
    let stub = StubAgent::new(&context_critical_reply("ok"));
    let (base, pool) = spawn_app(test_config(&stub)).await;

    let body = post_completion(&base, &completion_body(true, vec![user("Hi")]))
        .await
        .text()
        .await
        .expect("body");
    // the in-flight completion finishes normally, annotated
    assert_in_order(&body, &[r#""content":"ok""#, "data: [DONE]"]);
    assert!(body.contains("Context window at 96%"), "{body}");
    assert_eq!(stub.spawn_count(), 1);

    // the deferred reset kills the agent once the turn is over
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(pool.is_empty(), "context-critical entry evicted");

    let second = completion_body(
        true,
        vec![user("Hi"), assistant("ok"), user("again")],
    );
    let body = post_completion(&base, &second).await.text().await.expect("body");
    assert_in_order(&body, &[r#""content":"ok""#, "data: [DONE]"]);
    assert_eq!(stub.spawn_count(), 2, "next turn runs on a fresh subprocess");
    // after a forced reset only the latest user turn is forwarded
    assert_eq!(stub.prompt_texts().last().map(String::as_str), Some("again"));

    pool.shutdown().await;
}

#[tokio::test]
async fn silent_prompt_times_out_with_inband_message() {
    let stub = StubAgent::new(&silent_reply(10));
    let mut config = test_config(&stub);
    config.prompt_timeout = Duration::from_secs(1);
    let (base, pool) = spawn_app(config).await;

    let body = post_completion(&base, &completion_body(true, vec![user("Hi")]))
        .await
        .text()
        .await
        .expect("body");
    assert!(
        body.contains("The session went silent for too long"),
        "{body}"
    );
    assert_in_order(&body, &[r#""finish_reason":"stop""#, "data: [DONE]"]);
    assert!(pool.is_empty(), "timed-out session reset");

    pool.shutdown().await;
}

#[tokio::test]
async fn third_consecutive_error_resets_with_inband_message() {
    let stub = StubAgent::new(GENERIC_ERROR_LINE);
    let (base, pool) = spawn_app(test_config(&stub)).await;

    // two failures accumulate on the same session without a user-visible
    // message; the third crosses the threshold
    let windows = [
        vec![user("a")],
        vec![user("a"), user("b")],
        vec![user("a"), user("b"), user("c")],
    ];
    let mut bodies = Vec::new();
    for window in windows {
        let body = post_completion(&base, &completion_body(true, window))
            .await
            .text()
            .await
            .expect("body");
        bodies.push(body);
    }

    assert!(!bodies[0].contains("Multiple consecutive errors"), "{}", bodies[0]);
    assert!(!bodies[1].contains("Multiple consecutive errors"), "{}", bodies[1]);
    assert!(
        bodies[2].contains("Multiple consecutive errors detected"),
        "{}",
        bodies[2]
    );
    // every response is still a well-formed stream
    for body in &bodies {
        assert_in_order(body, &[r#""finish_reason":"stop""#, "data: [DONE]"]);
    }
    assert!(pool.is_empty(), "session reset after the error threshold");

    pool.shutdown().await;
}

#[tokio::test]
async fn idle_eviction_over_http() {
    let stub = StubAgent::new(&scripted_reply("ok"));
    let mut config = test_config(&stub);
    config.idle_timeout = Duration::from_secs(1);
    config.gc_interval = Some(Duration::from_millis(200));
    let (base, pool) = spawn_app(config).await;

    post_completion(&base, &completion_body(true, vec![user("Hi")]))
        .await
        .text()
        .await
        .expect("body");
    assert_eq!(pool.len(), 1);

    tokio::time::sleep(Duration::from_secs(2)).await;
    let sessions: Vec<Value> = reqwest::get(format!("{base}/sessions"))
        .await
        .expect("sessions")
        .json()
        .await
        .expect("sessions json");
    assert!(sessions.is_empty(), "{sessions:?}");

    post_completion(&base, &completion_body(true, vec![user("Hi")]))
        .await
        .text()
        .await
        .expect("body");
    assert_eq!(stub.spawn_count(), 2);

    pool.shutdown().await;
}

#[tokio::test]
async fn explicit_session_header_overrides_the_fingerprint() {
    let stub = StubAgent::new(&scripted_reply("ok"));
    let (base, pool) = spawn_app(test_config(&stub)).await;

    let client = reqwest::Client::new();
    for text in ["first conversation", "totally different anchor"] {
        client
            .post(format!("{base}/v1/chat/completions"))
            .header("X-Kiro-Session-Id", "pinned-key")
            .json(&completion_body(true, vec![user(text)]))
            .send()
            .await
            .expect("request")
            .text()
            .await
            .expect("body");
    }
    // both anchors landed on the pinned session
    assert_eq!(pool.len(), 1);
    assert_eq!(stub.spawn_count(), 1);

    pool.shutdown().await;
}

#[tokio::test]
async fn plain_routes_and_cors() {
    let stub = StubAgent::new(&scripted_reply("unused"));
    let (base, pool) = spawn_app(test_config(&stub)).await;
    let client = reqwest::Client::new();

    let health: Value = reqwest::get(format!("{base}/health"))
        .await
        .expect("health")
        .json()
        .await
        .expect("health json");
    assert_eq!(health["status"], "ok");

    let models: Value = reqwest::get(format!("{base}/v1/models"))
        .await
        .expect("models")
        .json()
        .await
        .expect("models json");
    assert_eq!(models["data"][0]["id"], "kiro-agent");

    let missing = reqwest::get(format!("{base}/no/such/route"))
        .await
        .expect("404");
    assert_eq!(missing.status(), 404);
    let body: Value = missing.json().await.expect("404 json");
    assert_eq!(body["error"]["message"], "Not found");

    let preflight = client
        .request(
            reqwest::Method::OPTIONS,
            format!("{base}/v1/chat/completions"),
        )
        .send()
        .await
        .expect("preflight");
    assert_eq!(preflight.status(), 204);
    let allow_headers = preflight
        .headers()
        .get("access-control-allow-headers")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    assert!(allow_headers.contains("X-Kiro-Session-Id"), "{allow_headers}");
    assert_eq!(
        preflight
            .headers()
            .get("access-control-allow-origin")
            .and_then(|v| v.to_str().ok()),
        Some("*")
    );

    pool.shutdown().await;
}

#[tokio::test]
async fn assistant_only_tail_yields_an_empty_completion() {
    let stub = StubAgent::new(&scripted_reply("Hello!"));
    let (base, pool) = spawn_app(test_config(&stub)).await;

    post_completion(&base, &completion_body(true, vec![user("Hi")]))
        .await
        .text()
        .await
        .expect("first body");

    // the new tail carries only an assistant echo: nothing to forward
    let echo_only = completion_body(true, vec![user("Hi"), assistant("Hello!")]);
    let body = post_completion(&base, &echo_only).await.text().await.expect("body");
    assert_in_order(&body, &[r#""finish_reason":"stop""#, "data: [DONE]"]);

    assert_eq!(
        stub.prompt_texts(),
        vec!["Hi".to_string()],
        "no prompt issued for an empty delta"
    );

    pool.shutdown().await;
}
