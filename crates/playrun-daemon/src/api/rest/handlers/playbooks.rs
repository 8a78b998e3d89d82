//! Job launch handlers

use crate::api::rest::state::AppState;
use crate::error::{ApiError, ApiResult};
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use playrun_core::{LaunchTicket, RunId, Workflow};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Launch query params
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchQuery {
    /// Run the job as the next step of an existing run id
    pub correlation_id: Option<String>,
}

/// Accepted launch response
#[derive(Debug, Serialize)]
pub struct LaunchResponse {
    pub id: RunId,
}

/// List runnable jobs
pub async fn list_playbooks(State(state): State<AppState>) -> ApiResult<Json<Vec<String>>> {
    Ok(Json(state.runner.list_jobs().await?))
}

/// Launch a job; the body holds its options
pub async fn run_playbook(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<LaunchQuery>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let options = parse_body(&body)?;
    let ticket = state
        .runner
        .launch(&name, options, query.correlation_id.map(RunId::new))
        .await?;

    tracing::info!(run_id = %ticket.id, job = %name, "Accepted launch");
    Ok(accepted(ticket))
}

/// Launch a workflow of several jobs under one run id
pub async fn run_workflow(
    State(state): State<AppState>,
    Json(workflow): Json<Workflow>,
) -> ApiResult<impl IntoResponse> {
    let (ticket, _) = state.runner.run_workflow(workflow).await?;

    tracing::info!(run_id = %ticket.id, "Accepted workflow");
    Ok(accepted(ticket))
}

fn accepted(ticket: LaunchTicket) -> impl IntoResponse {
    (
        StatusCode::ACCEPTED,
        [(header::LOCATION, ticket.location)],
        Json(LaunchResponse { id: ticket.id }),
    )
}

/// An empty body means no options
fn parse_body(body: &[u8]) -> ApiResult<Value> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(format!("Invalid JSON body: {}", e)))
}
