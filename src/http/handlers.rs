//! Plain routes: health, model listing, pool diagnostics, 404

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use crate::openai;

use super::AppState;

pub(super) async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok", "service": "kiro-gateway"}))
}

pub(super) async fn models(State(state): State<AppState>) -> impl IntoResponse {
    Json(openai::models_list(&state.config.model_id))
}

pub(super) async fn sessions(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.pool.diagnostics())
}

pub(super) async fn not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": {"message": "Not found"}})),
    )
}
