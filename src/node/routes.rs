//! HTTP surface of the node service. Session creation, teardown, and drain
//! are intra-cluster mutations behind the secret; in-session command
//! forwarding carries client traffic and stays open, as do status, health,
//! and readiness.

use super::{CommandRequest, Node};
use crate::error::GridError;
use crate::ids::SessionId;
use crate::secret::{self, RegistrationSecret};
use crate::session::CreateSessionRequest;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, delete, get, post};
use axum::{middleware, Json, Router};
use serde_json::Value;
use std::sync::Arc;

pub fn router(node: Arc<dyn Node>, secret: RegistrationSecret) -> Router {
    let secured = Router::new()
        .route("/session", post(new_session))
        .route(
            "/se/grid/node/session/{sessionId}",
            delete(stop_session),
        )
        .route("/se/grid/node/drain", post(drain))
        .route_layer(middleware::from_fn_with_state(
            secret,
            secret::require_secret,
        ));

    Router::new()
        .route("/session/{sessionId}", any(forward_root))
        .route("/session/{sessionId}/{*rest}", any(forward))
        .route("/se/grid/node/status", get(node_status))
        .route("/se/grid/node/health", get(node_health))
        .merge(secured)
        .with_state(node)
}

async fn new_session(
    State(node): State<Arc<dyn Node>>,
    Json(request): Json<CreateSessionRequest>,
) -> Result<Json<Value>, GridError> {
    let response = node.new_session(request).await?;
    Ok(Json(serde_json::to_value(response).map_err(|e| {
        GridError::SessionNotCreated(format!("response encoding failed: {e}"))
    })?))
}

async fn forward_root(
    State(node): State<Arc<dyn Node>>,
    method: Method,
    Path(session_id): Path<String>,
    body: Bytes,
) -> Response {
    dispatch(node, method, session_id, String::new(), body).await
}

async fn forward(
    State(node): State<Arc<dyn Node>>,
    method: Method,
    Path((session_id, rest)): Path<(String, String)>,
    body: Bytes,
) -> Response {
    dispatch(node, method, session_id, format!("/{rest}"), body).await
}

async fn dispatch(
    node: Arc<dyn Node>,
    method: Method,
    session_id: String,
    path: String,
    body: Bytes,
) -> Response {
    let Ok(id) = session_id.parse::<SessionId>() else {
        return GridError::SessionNotCreated(format!("malformed session id: {session_id}"))
            .into_response();
    };
    let body = if body.is_empty() {
        None
    } else {
        serde_json::from_slice(&body).ok()
    };
    let command = CommandRequest {
        method: method.to_string(),
        path,
        body,
    };
    match node.execute_webdriver_command(id, command).await {
        Ok(answer) => {
            let status =
                StatusCode::from_u16(answer.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, Json(answer.body)).into_response()
        }
        Err(err) => err.into_response(),
    }
}

async fn stop_session(
    State(node): State<Arc<dyn Node>>,
    Path(session_id): Path<String>,
) -> Result<StatusCode, GridError> {
    let id: SessionId = session_id
        .parse()
        .map_err(|_| GridError::SessionNotCreated(format!("malformed session id: {session_id}")))?;
    node.stop_session(id).await?;
    Ok(StatusCode::OK)
}

async fn node_status(State(node): State<Arc<dyn Node>>) -> Result<Json<Value>, GridError> {
    let status = node.status().await?;
    Ok(Json(serde_json::to_value(status).map_err(|e| {
        GridError::SessionNotCreated(format!("status encoding failed: {e}"))
    })?))
}

async fn node_health(State(node): State<Arc<dyn Node>>) -> Json<super::HealthReport> {
    Json(node.health_check().await)
}

async fn drain(State(node): State<Arc<dyn Node>>) -> StatusCode {
    node.drain().await;
    StatusCode::OK
}
