//! Live run streaming via SSE

use crate::api::rest::state::AppState;
use crate::error::ApiResult;
use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
};
use futures_util::stream::{self, Stream, StreamExt};
use playrun_core::{RunId, StreamMessage};
use std::convert::Infallible;

/// Join a run: replay its log and events, then follow it until it ends
pub async fn stream_play(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let join = state.runner.join(&RunId::new(id)).await?;
    tracing::debug!(run_id = %join.id, live = join.is_live(), "Client joined run");

    let replay = stream::iter(join.replay_messages());
    let live = stream::unfold(join, |mut join| async move {
        join.next().await.map(|message| (message, join))
    });
    let stream = replay.chain(live).map(|message| Ok(to_event(&message)));

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(state.keep_alive)
            .text("ping"),
    ))
}

fn to_event(message: &StreamMessage) -> Event {
    let name = match message {
        StreamMessage::Log { .. } => "log",
        StreamMessage::Event(_) => "event",
        StreamMessage::Lagged { .. } => "lagged",
        StreamMessage::End => "end",
    };
    let json = serde_json::to_string(message).unwrap_or_default();
    Event::default().event(name).data(json)
}

