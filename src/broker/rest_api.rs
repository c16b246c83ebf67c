//! REST surface of the broker
//!
//! Maps the HTTP/JSON wire contract onto the state engine. Every response is
//! either `{ "ok": true, ... }` or `{ "error": "..." }`; raw wire strings are
//! parsed into domain types at this boundary and the engine's error taxonomy
//! maps onto 400/404/413/429.

use crate::broker::state::{
    Agent, BrokerState, ContextEntry, ContextSummary, ReadBatch, Sender, StatusReport,
};
use crate::domain_types::{AgentId, AgentName, ContextKey, MessageId, MessageType};
use crate::error::BrokerError;
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Default page size for message reads when the caller gives no limit.
pub const DEFAULT_READ_LIMIT: usize = 50;

/// Error envelope returned by every failing route
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

/// Wrapper mapping engine errors onto HTTP status codes
#[derive(Debug)]
pub struct ApiError(pub BrokerError);

impl From<BrokerError> for ApiError {
    fn from(err: BrokerError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            BrokerError::InvalidArgument { .. } => StatusCode::BAD_REQUEST,
            BrokerError::NotFound { .. } => StatusCode::NOT_FOUND,
            BrokerError::ResourceExhausted { .. } => StatusCode::TOO_MANY_REQUESTS,
            BrokerError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        };
        (
            status,
            Json(ErrorBody {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    pub ok: bool,
    pub agent_id: AgentId,
    pub total_agents: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OkResponse {
    pub ok: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AgentsResponse {
    pub agents: Vec<Agent>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendResponse {
    pub ok: bool,
    pub message_id: MessageId,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastRequest {
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastResponse {
    pub ok: bool,
    pub sent_to: usize,
}

#[derive(Debug, Deserialize)]
pub struct ReadQuery {
    #[serde(default)]
    pub unread: Option<bool>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct AckRequest {
    #[serde(default)]
    pub ids: Vec<MessageId>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AckResponse {
    pub ok: bool,
    pub acked: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ClearResponse {
    pub ok: bool,
    pub cleared: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetContextRequest {
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub value: Option<serde_json::Value>,
    #[serde(default)]
    pub set_by: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ContextWriteResponse {
    pub ok: bool,
    pub key: ContextKey,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ContextListResponse {
    pub contexts: Vec<ContextSummary>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextValueResponse {
    pub value: serde_json::Value,
    pub set_by: String,
    pub set_by_name: String,
    pub timestamp: DateTime<Utc>,
}

impl From<ContextEntry> for ContextValueResponse {
    fn from(entry: ContextEntry) -> Self {
        Self {
            value: entry.value,
            set_by: entry.set_by,
            set_by_name: entry.set_by_name,
            timestamp: entry.timestamp,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub broker: String,
    #[serde(flatten)]
    pub report: StatusReport,
}

/// Builds the broker router over shared state.
pub fn create_app(state: Arc<BrokerState>) -> Router {
    Router::new()
        .route("/agents/register", post(register))
        .route("/agents", get(list_agents))
        .route("/agents/{id}/heartbeat", post(heartbeat))
        .route("/agents/{id}", delete(deregister))
        .route("/messages/send", post(send))
        .route("/messages/broadcast", post(broadcast))
        .route("/messages/{id}", get(read_messages).delete(clear_messages))
        .route("/messages/{id}/ack", post(ack))
        .route("/context", post(set_context).get(list_contexts))
        .route("/context/{key}", get(get_context).delete(delete_context))
        .route("/status", get(status))
        .fallback(unknown_route)
        .with_state(state)
}

/// Serves `app` until `shutdown` is cancelled.
pub async fn serve(
    listener: TcpListener,
    app: Router,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

fn parse_agent_id(raw: &str) -> Result<AgentId, ApiError> {
    AgentId::try_new(raw.to_string())
        .map_err(|_| BrokerError::invalid_argument("agentId must not be empty").into())
}

async fn register(
    State(state): State<Arc<BrokerState>>,
    Json(body): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>, ApiError> {
    let id = parse_agent_id(&body.agent_id.unwrap_or_default())?;
    let name = AgentName::try_new(body.name.unwrap_or_default())
        .map_err(|_| BrokerError::invalid_argument("name must not be empty"))?;
    let project = body.project.unwrap_or_else(|| "unknown".to_string());
    let path = body.path.unwrap_or_default();

    let total_agents = state.register(id.clone(), name, project, path)?;
    Ok(Json(RegisterResponse {
        ok: true,
        agent_id: id,
        total_agents,
    }))
}

async fn list_agents(State(state): State<Arc<BrokerState>>) -> Json<AgentsResponse> {
    Json(AgentsResponse {
        agents: state.agents_snapshot(),
    })
}

async fn heartbeat(
    State(state): State<Arc<BrokerState>>,
    Path(id): Path<String>,
) -> Result<Json<OkResponse>, ApiError> {
    let id = parse_agent_id(&id)?;
    state.heartbeat(&id)?;
    Ok(Json(OkResponse { ok: true }))
}

async fn deregister(
    State(state): State<Arc<BrokerState>>,
    Path(id): Path<String>,
) -> Result<Json<OkResponse>, ApiError> {
    let id = parse_agent_id(&id)?;
    state.deregister(&id);
    Ok(Json(OkResponse { ok: true }))
}

async fn send(
    State(state): State<Arc<BrokerState>>,
    Json(body): Json<SendRequest>,
) -> Result<Json<SendResponse>, ApiError> {
    let from = Sender::parse(&body.from.unwrap_or_default())?;
    let to = AgentId::try_new(body.to.unwrap_or_default())
        .map_err(|_| BrokerError::invalid_argument("recipient id must not be empty"))?;
    let kind = MessageType::from_wire(body.kind.as_deref());

    let message_id = state.send(&from, &to, body.content.unwrap_or_default(), kind)?;
    Ok(Json(SendResponse {
        ok: true,
        message_id,
    }))
}

async fn broadcast(
    State(state): State<Arc<BrokerState>>,
    Json(body): Json<BroadcastRequest>,
) -> Result<Json<BroadcastResponse>, ApiError> {
    let from = Sender::parse(&body.from.unwrap_or_default())?;
    let kind = MessageType::from_wire(body.kind.as_deref());

    let sent_to = state.broadcast(&from, body.content.unwrap_or_default(), kind)?;
    Ok(Json(BroadcastResponse { ok: true, sent_to }))
}

async fn read_messages(
    State(state): State<Arc<BrokerState>>,
    Path(id): Path<String>,
    Query(query): Query<ReadQuery>,
) -> Result<Json<ReadBatch>, ApiError> {
    let id = parse_agent_id(&id)?;
    let unread_only = query.unread.unwrap_or(false);
    let limit = query.limit.unwrap_or(DEFAULT_READ_LIMIT);

    Ok(Json(state.read(&id, unread_only, limit)?))
}

async fn ack(
    State(state): State<Arc<BrokerState>>,
    Path(id): Path<String>,
    Json(body): Json<AckRequest>,
) -> Result<Json<AckResponse>, ApiError> {
    let id = parse_agent_id(&id)?;
    let acked = state.ack(&id, &body.ids)?;
    Ok(Json(AckResponse { ok: true, acked }))
}

async fn clear_messages(
    State(state): State<Arc<BrokerState>>,
    Path(id): Path<String>,
) -> Result<Json<ClearResponse>, ApiError> {
    let id = parse_agent_id(&id)?;
    let cleared = state.clear_messages(&id)?;
    Ok(Json(ClearResponse { ok: true, cleared }))
}

async fn set_context(
    State(state): State<Arc<BrokerState>>,
    Json(body): Json<SetContextRequest>,
) -> Result<Json<ContextWriteResponse>, ApiError> {
    let key = ContextKey::try_new(body.key.unwrap_or_default())
        .map_err(|_| BrokerError::invalid_argument("key must not be empty"))?;
    let value = body.value.unwrap_or(serde_json::Value::Null);
    let set_by = body.set_by.unwrap_or_default();

    state.set_context(key.clone(), value, &set_by)?;
    Ok(Json(ContextWriteResponse { ok: true, key }))
}

async fn list_contexts(State(state): State<Arc<BrokerState>>) -> Json<ContextListResponse> {
    Json(ContextListResponse {
        contexts: state.list_contexts(),
    })
}

async fn get_context(
    State(state): State<Arc<BrokerState>>,
    Path(key): Path<String>,
) -> Result<Json<ContextValueResponse>, ApiError> {
    let key = ContextKey::try_new(key)
        .map_err(|_| BrokerError::invalid_argument("key must not be empty"))?;
    let entry = state.get_context(&key)?;
    Ok(Json(entry.into()))
}

async fn delete_context(
    State(state): State<Arc<BrokerState>>,
    Path(key): Path<String>,
) -> Result<Json<OkResponse>, ApiError> {
    let key = ContextKey::try_new(key)
        .map_err(|_| BrokerError::invalid_argument("key must not be empty"))?;
    state.delete_context(&key);
    Ok(Json(OkResponse { ok: true }))
}

async fn status(State(state): State<Arc<BrokerState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        broker: env!("CARGO_PKG_NAME").to_string(),
        report: state.status(),
    })
}

async fn unknown_route() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorBody {
            error: "unknown route".to_string(),
        }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_error_maps_taxonomy_to_status_codes() {
        let cases = [
            (BrokerError::invalid_argument("x"), StatusCode::BAD_REQUEST),
            (BrokerError::not_found("x"), StatusCode::NOT_FOUND),
            (
                BrokerError::resource_exhausted("x"),
                StatusCode::TOO_MANY_REQUESTS,
            ),
            (
                BrokerError::PayloadTooLarge { size: 2, max: 1 },
                StatusCode::PAYLOAD_TOO_LARGE,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(ApiError(err).into_response().status(), expected);
        }
    }
}
