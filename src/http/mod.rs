//! HTTP facade
//!
//! OpenAI-compatible routes in front of the session pool. CORS is
//! wide-open: the trust boundary is loopback.

mod bridge;
mod handlers;

use std::sync::Arc;

use axum::extract::Request;
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;

use crate::config::GatewayConfig;
use crate::pool::SessionPool;

/// Shared state for all handlers
#[derive(Clone)]
pub struct AppState {
    /// The session pool
    pub pool: SessionPool,
    /// Gateway configuration
    pub config: Arc<GatewayConfig>,
}

/// Build the gateway router
#[must_use]
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::health))
        .route("/health", get(handlers::health))
        .route("/v1/models", get(handlers::models))
        .route("/sessions", get(handlers::sessions))
        .route("/v1/chat/completions", post(bridge::completions))
        .fallback(handlers::not_found)
        .layer(middleware::from_fn(cors))
        .with_state(state)
}

async fn cors(request: Request, next: Next) -> Response {
    if request.method() == Method::OPTIONS {
        let mut response = StatusCode::NO_CONTENT.into_response();
        apply_cors_headers(&mut response);
        return response;
    }
    let mut response = next.run(request).await;
    apply_cors_headers(&mut response);
    response
}

fn apply_cors_headers(response: &mut Response) {
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type, Authorization, X-Kiro-Session-Id"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
}
