//! REST handlers over the shared coordinator.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::render::RowRenderer;
use axum::extract::{Path, Query, State};
use axum::Json;
use repowatch_core::{
    Coordinator, EntityKey, EntitySnapshot, ErrorContext, OperationReport, OperationRunner,
    PluginState, StateMetadata, TransitionOutcome, TransitionRecord, TransitionSource,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    /// The coordinator.
    pub coordinator: Arc<Coordinator>,
    /// Runs executor-backed operations.
    pub runner: Arc<OperationRunner>,
    /// Renders refresh fragments.
    pub renderer: Arc<dyn RowRenderer>,
    /// Server configuration.
    pub config: Arc<ServerConfig>,
}

fn entity_key(owner: &str, name: &str) -> ServerResult<EntityKey> {
    Ok(EntityKey::new(owner, name)?)
}

/// Body of `GET /health`.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthStatus {
    /// Always true while the server answers.
    pub healthy: bool,
    /// Tracked entities.
    pub entities: usize,
    /// Open change stream connections.
    pub subscribers: usize,
    /// Newest event log sequence.
    pub latest_sequence: u64,
    /// Whether `GET /events` is served.
    pub stream_enabled: bool,
}

/// `GET /health`
pub(crate) async fn health(State(state): State<AppState>) -> Json<HealthStatus> {
    Json(HealthStatus {
        healthy: true,
        entities: state.coordinator.snapshot().len(),
        subscribers: state.coordinator.subscriber_count(),
        latest_sequence: state.coordinator.latest_sequence(),
        stream_enabled: state.config.stream_enabled,
    })
}

/// `GET /entities`
pub(crate) async fn list_entities(State(state): State<AppState>) -> Json<Vec<EntitySnapshot>> {
    Json(state.coordinator.snapshot())
}

/// `GET /entities/:owner/:name`
pub(crate) async fn get_entity(
    State(state): State<AppState>,
    Path((owner, name)): Path<(String, String)>,
) -> ServerResult<Json<EntitySnapshot>> {
    let entity = entity_key(&owner, &name)?;
    Ok(Json(state.coordinator.describe(&entity)))
}

/// Body of `POST /entities/:owner/:name/transition`.
#[derive(Debug, Deserialize)]
pub struct TransitionBody {
    /// Target state name.
    pub to: String,
    /// Payload recorded with the attempt.
    #[serde(default)]
    pub context: Option<Value>,
}

/// `POST /entities/:owner/:name/transition`
///
/// Forced transitions are not reachable over HTTP.
pub(crate) async fn transition(
    State(state): State<AppState>,
    Path((owner, name)): Path<(String, String)>,
    Json(body): Json<TransitionBody>,
) -> ServerResult<Json<TransitionOutcome>> {
    let entity = entity_key(&owner, &name)?;
    let to: PluginState = body.to.parse()?;
    let outcome = state
        .coordinator
        .request_transition(&entity, to, body.context, false)?;
    Ok(Json(outcome))
}

/// `POST /entities/:owner/:name/install`
pub(crate) async fn install(
    State(state): State<AppState>,
    Path((owner, name)): Path<(String, String)>,
) -> ServerResult<Json<OperationReport>> {
    let entity = entity_key(&owner, &name)?;
    info!(entity = %entity, "install requested");
    Ok(Json(state.runner.install(&entity).await?))
}

/// `POST /entities/:owner/:name/activate`
pub(crate) async fn activate(
    State(state): State<AppState>,
    Path((owner, name)): Path<(String, String)>,
) -> ServerResult<Json<OperationReport>> {
    let entity = entity_key(&owner, &name)?;
    info!(entity = %entity, "activation requested");
    Ok(Json(state.runner.activate(&entity).await?))
}

/// `POST /entities/:owner/:name/deactivate`
pub(crate) async fn deactivate(
    State(state): State<AppState>,
    Path((owner, name)): Path<(String, String)>,
) -> ServerResult<Json<OperationReport>> {
    let entity = entity_key(&owner, &name)?;
    info!(entity = %entity, "deactivation requested");
    Ok(Json(state.runner.deactivate(&entity).await?))
}

/// `POST /entities/:owner/:name/recheck`
pub(crate) async fn recheck(
    State(state): State<AppState>,
    Path((owner, name)): Path<(String, String)>,
) -> ServerResult<Json<OperationReport>> {
    let entity = entity_key(&owner, &name)?;
    Ok(Json(
        state
            .runner
            .recheck(&entity, TransitionSource::User)
            .await?,
    ))
}

/// Body of `GET /entities/:owner/:name/refresh`.
#[derive(Debug, Serialize, Deserialize)]
pub struct RefreshResponse {
    /// Entity key.
    pub repository: String,
    /// Current state.
    pub state: PluginState,
    /// Metadata bag.
    pub metadata: StateMetadata,
    /// Error details while in the error state.
    pub error: Option<ErrorContext>,
    /// Rendered row fragment.
    pub html: String,
}

/// `GET /entities/:owner/:name/refresh`
pub(crate) async fn refresh(
    State(state): State<AppState>,
    Path((owner, name)): Path<(String, String)>,
) -> ServerResult<Json<RefreshResponse>> {
    let entity = entity_key(&owner, &name)?;
    let snapshot = state.coordinator.describe(&entity);
    let html = state.renderer.render(&snapshot);

    Ok(Json(RefreshResponse {
        repository: snapshot.entity.to_string(),
        state: snapshot.state,
        metadata: snapshot.metadata,
        error: snapshot.error,
        html,
    }))
}

/// Body of the metadata endpoints.
#[derive(Debug, Serialize, Deserialize)]
pub struct MetadataResponse {
    /// Metadata key.
    pub key: String,
    /// Value before the call.
    pub previous: Option<Value>,
}

/// `PUT /entities/:owner/:name/metadata/:key`
pub(crate) async fn put_metadata(
    State(state): State<AppState>,
    Path((owner, name, key)): Path<(String, String, String)>,
    Json(value): Json<Value>,
) -> ServerResult<Json<MetadataResponse>> {
    let entity = entity_key(&owner, &name)?;
    let previous = state.coordinator.set_metadata(&entity, &key, value)?;
    Ok(Json(MetadataResponse { key, previous }))
}

/// `DELETE /entities/:owner/:name/metadata/:key`
pub(crate) async fn delete_metadata(
    State(state): State<AppState>,
    Path((owner, name, key)): Path<(String, String, String)>,
) -> ServerResult<Json<MetadataResponse>> {
    let entity = entity_key(&owner, &name)?;
    let previous = state.coordinator.remove_metadata(&entity, &key);
    Ok(Json(MetadataResponse { key, previous }))
}

/// Query of `GET /events/log`.
#[derive(Debug, Deserialize)]
pub struct LogQuery {
    /// Number of newest records to return.
    pub limit: Option<usize>,
}

/// `GET /events/log`
pub(crate) async fn event_log(
    State(state): State<AppState>,
    Query(query): Query<LogQuery>,
) -> ServerResult<Json<Vec<TransitionRecord>>> {
    let limit = query.limit.unwrap_or(50);
    if limit > state.config.max_log_page {
        return Err(ServerError::InvalidRequest(format!(
            "limit {limit} exceeds {}",
            state.config.max_log_page
        )));
    }
    Ok(Json(state.coordinator.recent_events(limit)))
}
