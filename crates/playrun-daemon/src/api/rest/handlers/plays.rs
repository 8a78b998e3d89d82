//! Run query and kill handlers

use crate::api::rest::state::AppState;
use crate::error::ApiResult;
use axum::{
    extract::{Path, Query, State},
    http::header,
    response::IntoResponse,
    Json,
};
use playrun_core::{EventRecord, KillOutcome, Run, RunFilter, RunId};
use serde::Deserialize;

/// List runs query params
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListPlaysQuery {
    /// Maximum number of runs returned
    pub max_number: Option<usize>,

    /// Exclude runs that ended more than this many seconds ago
    pub max_age: Option<u64>,

    /// Only runs that are still active
    #[serde(default)]
    pub live: bool,

    /// Only runs of this job
    pub playbook: Option<String>,
}

impl From<ListPlaysQuery> for RunFilter {
    fn from(query: ListPlaysQuery) -> Self {
        RunFilter {
            max_count: query.max_number,
            max_age: query.max_age,
            live_only: query.live,
            job_name: query.playbook,
        }
    }
}

/// List runs, newest first
pub async fn list_plays(
    State(state): State<AppState>,
    Query(query): Query<ListPlaysQuery>,
) -> ApiResult<Json<Vec<Run>>> {
    Ok(Json(state.runner.list(&query.into()).await?))
}

/// Get the latest record of a run
pub async fn get_play(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Run>> {
    Ok(Json(state.runner.get(&RunId::new(id)).await?))
}

/// Kill a running run
pub async fn kill_play(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<KillOutcome>> {
    let outcome = state.runner.kill(&RunId::new(id)).await?;
    if !outcome.terminated {
        tracing::warn!(run_id = %outcome.run_id, "Run survived kill");
    }
    Ok(Json(outcome))
}

/// Full log of a run as plain text
pub async fn get_log(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let log = state.runner.get_log(&RunId::new(id)).await?;
    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], log))
}

/// Every event recorded for a run
pub async fn get_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<EventRecord>>> {
    Ok(Json(state.runner.get_events(&RunId::new(id)).await?))
}
