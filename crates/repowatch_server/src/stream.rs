//! The change stream endpoint.
//!
//! `GET /events` is a server-sent event stream. Each accepted transition is
//! one `state_change` event whose `id` is the event log sequence, so a
//! reconnecting client that sends `Last-Event-ID` resumes after the last
//! event it saw (as far as the log still reaches back).

use crate::error::{ServerError, ServerResult};
use crate::handler::AppState;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::{Stream, StreamExt};
use repowatch_core::{PluginState, StateChange};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use tracing::{debug, warn};

/// Name of the SSE event carrying a transition.
pub const STATE_CHANGE_EVENT: &str = "state_change";

/// JSON payload of a `state_change` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamPayload {
    /// Entity key.
    pub repository: String,
    /// Previous state.
    pub from: PluginState,
    /// New state.
    pub to: PluginState,
    /// When the state was written (unix millis).
    pub timestamp: u64,
    /// Event log sequence.
    pub sequence: u64,
}

impl From<&StateChange> for StreamPayload {
    fn from(change: &StateChange) -> Self {
        Self {
            repository: change.entity.to_string(),
            from: change.from,
            to: change.to,
            timestamp: change.timestamp,
            sequence: change.sequence,
        }
    }
}

/// Builds the SSE event for a change.
pub fn change_event(change: &StateChange) -> Result<Event, axum::Error> {
    Event::default()
        .event(STATE_CHANGE_EVENT)
        .id(change.sequence.to_string())
        .json_data(StreamPayload::from(change))
}

fn last_event_id(headers: &HeaderMap) -> ServerResult<Option<u64>> {
    let Some(value) = headers.get("last-event-id") else {
        return Ok(None);
    };
    let text = value
        .to_str()
        .map_err(|_| ServerError::InvalidRequest("Last-Event-ID is not ASCII".into()))?;
    if text.trim().is_empty() {
        return Ok(None);
    }
    text.trim()
        .parse()
        .map(Some)
        .map_err(|_| ServerError::InvalidRequest(format!("invalid Last-Event-ID: {text}")))
}

/// `GET /events`
pub(crate) async fn events(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ServerResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    if !state.config.stream_enabled {
        return Err(ServerError::StreamDisabled);
    }

    let resume = last_event_id(&headers)?;
    let subscription = match resume {
        Some(after) => state.coordinator.subscribe(Some(after)),
        None if state.config.replay_on_connect => state.coordinator.subscribe(None),
        None => state.coordinator.subscribe_live(),
    };
    debug!(
        resume = ?resume,
        replay = subscription.pending_replay(),
        subscribers = state.coordinator.subscriber_count(),
        "stream subscriber connected"
    );

    let stream = subscription.into_stream().filter_map(|change| {
        let event = match change_event(&change) {
            Ok(event) => Some(Ok(event)),
            Err(err) => {
                warn!(sequence = change.sequence, error = %err, "dropping unencodable event");
                None
            }
        };
        futures::future::ready(event)
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(state.config.keep_alive)))
}
