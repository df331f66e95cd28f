//! Definition endpoints.
//!
//! - `POST /v1/definitions`      — create (autoversion-aware)
//! - `GET  /v1/definitions/:id`  — get by id, optional `?version=`
//! - `GET  /v1/definitions`      — list latest-per-reference by kind/owner

use axum::extract::{Path, Query, State};
use axum::response::Json;
use serde::Deserialize;

use weft_definitions::CreateDefinition;
use weft_domain::definition::DefinitionKind;

use super::{ApiError, ApiResult};
use crate::state::AppState;

pub async fn create(
    State(state): State<AppState>,
    Json(input): Json<CreateDefinition>,
) -> ApiResult<Json<serde_json::Value>> {
    let outcome = state.runtime.definitions.create(input).await?;
    Ok(Json(serde_json::json!({
        "id": outcome.definition.id,
        "version": outcome.version,
        "latest_version": outcome.latest_version,
        "reused": outcome.reused,
        "content_hash": outcome.definition.content_hash,
    })))
}

#[derive(Debug, Deserialize)]
pub struct GetQuery {
    pub version: Option<u32>,
}

pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<GetQuery>,
) -> ApiResult<Json<weft_domain::definition::Definition>> {
    let def = state.runtime.definitions.get(&id, q.version).await?;
    Ok(Json(def))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub kind: DefinitionKind,
    pub project_id: Option<String>,
    pub library_id: Option<String>,
}

pub async fn list(
    State(state): State<AppState>,
    Query(q): Query<ListQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let defs = state
        .runtime
        .definitions
        .list(q.kind, q.project_id.as_deref(), q.library_id.as_deref())
        .await
        .map_err(ApiError)?;
    let count = defs.len();
    Ok(Json(serde_json::json!({
        "definitions": defs,
        "count": count,
    })))
}
