//! HTTP surface of the queue service.
//!
//! Public: enqueue (raw payload or preformed request) and the UI-facing
//! queue listing. Secret-protected: retry, dequeue-by-id, head peek, clear.

use super::{SessionQueue, SessionRequest};
use crate::error::GridError;
use crate::ids::RequestId;
use crate::secret::{self, RegistrationSecret};
use crate::session::parse_new_session_payload;
use axum::extract::{Path, State};
use axum::routing::{delete, get, post};
use axum::{middleware, Json, Router};
use serde_json::Value;
use std::sync::Arc;

pub fn router(queue: Arc<SessionQueue>, secret: RegistrationSecret) -> Router {
    let secured = Router::new()
        .route(
            "/se/grid/newsessionqueuer/session/retry/{requestId}",
            post(retry_request),
        )
        .route(
            "/se/grid/newsessionqueuer/session/next",
            get(next_request),
        )
        .route(
            "/se/grid/newsessionqueuer/session/{requestId}",
            get(remove_request),
        )
        .route("/se/grid/newsessionqueuer/queue", delete(clear_queue))
        .route_layer(middleware::from_fn_with_state(
            secret,
            secret::require_secret,
        ));

    Router::new()
        .route("/session", post(add_raw))
        .route("/se/grid/newsessionqueuer/session", post(add_request))
        .route("/se/grid/newsessionqueuer/queue", get(queue_contents))
        .merge(secured)
        .with_state(queue)
}

/// Raw WebDriver new-session payload; blocks until matched or timed out.
async fn add_raw(
    State(queue): State<Arc<SessionQueue>>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, GridError> {
    let payload = parse_new_session_payload(&body)?;
    let result = queue.add(SessionRequest::new(payload)).await?;
    Ok(Json(result))
}

/// Already-formed SessionRequest; same blocking contract as `/session`.
async fn add_request(
    State(queue): State<Arc<SessionQueue>>,
    Json(request): Json<SessionRequest>,
) -> Result<Json<Value>, GridError> {
    let result = queue.add(request).await?;
    Ok(Json(result))
}

async fn retry_request(
    State(queue): State<Arc<SessionQueue>>,
    Path(request_id): Path<String>,
    Json(request): Json<SessionRequest>,
) -> Result<Json<bool>, GridError> {
    let id: RequestId = request_id
        .parse()
        .map_err(|_| GridError::SessionNotCreated(format!("malformed request id: {request_id}")))?;
    if request.request_id != id {
        return Err(GridError::SessionNotCreated(
            "request id in path and body disagree".to_string(),
        ));
    }
    Ok(Json(queue.retry_add(request).await))
}

async fn remove_request(
    State(queue): State<Arc<SessionQueue>>,
    Path(request_id): Path<String>,
) -> Result<Json<Option<SessionRequest>>, GridError> {
    let id: RequestId = request_id
        .parse()
        .map_err(|_| GridError::SessionNotCreated(format!("malformed request id: {request_id}")))?;
    Ok(Json(queue.remove(id).await))
}

async fn next_request(State(queue): State<Arc<SessionQueue>>) -> Json<Option<RequestId>> {
    Json(queue.next().await)
}

async fn queue_contents(State(queue): State<Arc<SessionQueue>>) -> Json<Value> {
    Json(serde_json::json!({ "value": queue.contents().await }))
}

async fn clear_queue(State(queue): State<Arc<SessionQueue>>) -> Json<Value> {
    Json(serde_json::json!({ "value": queue.clear().await }))
}
