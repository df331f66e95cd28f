//! Workflow run endpoints.
//!
//! - `POST /v1/workflows/:id/runs` — start a run
//! - `GET  /v1/runs`               — list with filters
//! - `GET  /v1/runs/:id`           — snapshot
//! - `POST /v1/runs/:id/cancel`

use axum::extract::{Path, Query, State};
use axum::response::Json;
use serde::Deserialize;
use uuid::Uuid;

use weft_domain::run::RunStatus;
use weft_store::{RunFilter, Store};

use super::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct StartRunBody {
    #[serde(default)]
    pub version: Option<u32>,
    #[serde(default)]
    pub input: serde_json::Value,
}

pub async fn start(
    State(state): State<AppState>,
    Path(def_id): Path<String>,
    Json(body): Json<StartRunBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let run_id = state
        .runtime
        .start_run(&def_id, body.version, body.input)
        .await?;
    Ok(Json(serde_json::json!({ "run_id": run_id })))
}

#[derive(Debug, Deserialize)]
pub struct ListRunsQuery {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub workflow_def_id: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

fn default_limit() -> usize {
    50
}

pub async fn list(
    State(state): State<AppState>,
    Query(q): Query<ListRunsQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let filter = RunFilter {
        status: q.status.as_deref().and_then(parse_status),
        workflow_def_id: q.workflow_def_id,
        limit: q.limit.min(200),
        offset: q.offset,
    };
    let (runs, total) = state.runtime.store.list_runs(&filter).await.map_err(ApiError)?;

    // Lightweight list view: token maps omitted.
    let items: Vec<serde_json::Value> = runs
        .iter()
        .map(|r| {
            serde_json::json!({
                "id": r.id,
                "workflow_def_id": r.workflow_def_id,
                "workflow_def_version": r.workflow_def_version,
                "status": r.status,
                "parent_run_id": r.parent_run_id,
                "error": r.error,
                "token_count": r.tokens.len(),
                "created_at": r.created_at,
                "ended_at": r.ended_at,
            })
        })
        .collect();

    Ok(Json(serde_json::json!({
        "runs": items,
        "total": total,
        "limit": filter.limit,
        "offset": filter.offset,
    })))
}

pub async fn get(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> ApiResult<Json<weft_domain::run::WorkflowRun>> {
    let run = state.runtime.get_run(run_id).await?;
    Ok(Json(run))
}

pub async fn cancel(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    state.runtime.cancel_run(run_id).await?;
    Ok(Json(serde_json::json!({ "cancelled": true })))
}

fn parse_status(s: &str) -> Option<RunStatus> {
    match s {
        "running" => Some(RunStatus::Running),
        "waiting" => Some(RunStatus::Waiting),
        "completed" => Some(RunStatus::Completed),
        "failed" => Some(RunStatus::Failed),
        _ => None,
    }
}
