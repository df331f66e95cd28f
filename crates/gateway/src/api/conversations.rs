//! Conversation endpoints.
//!
//! - `POST /v1/conversations`               — create (spawns the runner)
//! - `POST /v1/conversations/:id/messages`  — post a user message
//! - `GET  /v1/conversations/:id/messages`
//! - `GET  /v1/conversations/:id/turns`
//! - `POST /v1/conversations/:id/cancel`
//! - `GET  /v1/turns/:id` / `POST /v1/turns/:id/cancel`

use axum::extract::{Path, State};
use axum::response::Json;
use serde::Deserialize;
use uuid::Uuid;

use weft_domain::conversation::Participant;
use weft_domain::definition::Owner;
use weft_domain::Error;
use weft_store::Store;

use super::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateConversationBody {
    pub participants: Vec<Participant>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub library_id: Option<String>,
}

pub async fn create(
    State(state): State<AppState>,
    Json(body): Json<CreateConversationBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let owner = match (body.project_id, body.library_id) {
        (Some(p), _) => Owner::Project(p),
        (None, Some(l)) => Owner::Library(l),
        (None, None) => {
            return Err(ApiError(Error::validation(
                "project_id/library_id",
                "an owner is required to resolve the agent persona",
            )))
        }
    };
    let conversation_id = state
        .runtime
        .create_conversation(body.participants, owner)
        .await?;
    Ok(Json(serde_json::json!({ "conversation_id": conversation_id })))
}

#[derive(Debug, Deserialize)]
pub struct PostMessageBody {
    pub content: String,
    #[serde(default)]
    pub delay_ms: Option<u64>,
}

pub async fn post_message(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Json(body): Json<PostMessageBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let turn_id = state
        .runtime
        .post_user_message(conversation_id, body.content, body.delay_ms)
        .await?;
    Ok(Json(serde_json::json!({ "turn_id": turn_id })))
}

pub async fn list_messages(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let messages = state
        .runtime
        .store
        .list_messages(conversation_id)
        .await
        .map_err(ApiError)?;
    Ok(Json(serde_json::json!({ "messages": messages })))
}

pub async fn list_turns(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let turns = state
        .runtime
        .store
        .list_turns(conversation_id)
        .await
        .map_err(ApiError)?;
    Ok(Json(serde_json::json!({ "turns": turns })))
}

pub async fn cancel(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    state.runtime.cancel_conversation(conversation_id).await?;
    Ok(Json(serde_json::json!({ "cancelled": true })))
}

pub async fn get_turn(
    State(state): State<AppState>,
    Path(turn_id): Path<Uuid>,
) -> ApiResult<Json<weft_domain::conversation::Turn>> {
    let turn = state
        .runtime
        .store
        .get_turn(turn_id)
        .await
        .map_err(ApiError)?
        .ok_or_else(|| ApiError(Error::NotFound(format!("turn {turn_id}"))))?;
    Ok(Json(turn))
}

pub async fn cancel_turn(
    State(state): State<AppState>,
    Path(turn_id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    state.runtime.cancel_turn(turn_id).await?;
    Ok(Json(serde_json::json!({ "cancelled": true })))
}
