//! Event listener for the running tool

use crate::api::rest::state::AppState;
use crate::error::{ApiError, ApiResult};
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use playrun_core::RunId;
use serde::Deserialize;
use serde_json::Value;

/// Prefix of every event name reported through the listener
pub const LISTENER_EVENT_PREFIX: &str = "playbook-";

/// Milestone reported by a running job
#[derive(Debug, Deserialize)]
pub struct ListenerEvent {
    /// Run id, as a string or a number
    pub play_id: Option<Value>,
    pub event: Option<String>,
    pub playbook: Option<String>,
}

/// Record a reported event and forward it to the run's subscribers.
///
/// Reports without a run id are accepted and ignored.
pub async fn playbook_event(
    State(state): State<AppState>,
    Json(report): Json<ListenerEvent>,
) -> ApiResult<impl IntoResponse> {
    let id = match report.play_id {
        None | Some(Value::Null) => return Ok(StatusCode::CREATED.into_response()),
        Some(Value::String(id)) => RunId::new(id),
        Some(other) => RunId::new(other.to_string()),
    };
    let event = report
        .event
        .ok_or_else(|| ApiError::BadRequest("event is required".to_string()))?;
    let job_name = report.playbook.unwrap_or_default();

    state
        .runner
        .record_event(&id, &format!("{}{}", LISTENER_EVENT_PREFIX, event), &job_name)
        .await?;
    Ok(Json(id).into_response())
}
