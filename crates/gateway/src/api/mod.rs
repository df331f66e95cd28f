//! API router and the typed error envelope.

pub mod conversations;
pub mod definitions;
pub mod runs;
pub mod sse;
pub mod stream;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        // ── Definitions ──────────────────────────────────────────────
        .route("/v1/definitions", post(definitions::create).get(definitions::list))
        .route("/v1/definitions/:id", get(definitions::get))
        // ── Workflow runs ────────────────────────────────────────────
        .route("/v1/workflows/:id/runs", post(runs::start))
        .route("/v1/runs", get(runs::list))
        .route("/v1/runs/:id", get(runs::get))
        .route("/v1/runs/:id/cancel", post(runs::cancel))
        // ── Conversations ────────────────────────────────────────────
        .route("/v1/conversations", post(conversations::create))
        .route(
            "/v1/conversations/:id/messages",
            post(conversations::post_message).get(conversations::list_messages),
        )
        .route("/v1/conversations/:id/turns", get(conversations::list_turns))
        .route("/v1/conversations/:id/cancel", post(conversations::cancel))
        .route("/v1/turns/:id", get(conversations::get_turn))
        .route("/v1/turns/:id/cancel", post(conversations::cancel_turn))
        // ── Live streams ─────────────────────────────────────────────
        .route("/v1/stream/ws", get(stream::stream_ws))
        .route("/sse", get(sse::stream_sse))
        .with_state(state)
}

/// Typed error envelope: `{error: {kind, message, field?, constraint?}}`.
pub struct ApiError(pub weft_domain::Error);

impl From<weft_domain::Error> for ApiError {
    fn from(e: weft_domain::Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status = match kind {
            "validation" | "expression" => StatusCode::UNPROCESSABLE_ENTITY,
            "not_found" => StatusCode::NOT_FOUND,
            "conflict" => StatusCode::CONFLICT,
            "storage_unavailable" => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let mut body = serde_json::json!({
            "error": { "kind": kind, "message": self.0.to_string() }
        });
        if let weft_domain::Error::Validation { field, constraint } = &self.0 {
            body["error"]["field"] = serde_json::json!(field);
            body["error"]["constraint"] = serde_json::json!(constraint);
        }
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;
