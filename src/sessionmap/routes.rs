//! HTTP surface of the session-map service under `/se/grid/sessions`.
//! Mutations require the registration secret; lookups are open so the router
//! can resolve sessions without cluster identity.

use super::SessionMap;
use crate::error::GridError;
use crate::ids::SessionId;
use crate::secret::{self, RegistrationSecret};
use crate::session::ActiveSession;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{middleware, Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;

pub fn router(map: Arc<dyn SessionMap>, secret: RegistrationSecret) -> Router {
    let secured = Router::new()
        .route("/se/grid/sessions", post(add_session))
        .route("/se/grid/sessions/{sessionId}", delete(remove_session))
        .route_layer(middleware::from_fn_with_state(
            secret,
            secret::require_secret,
        ));

    Router::new()
        .route("/se/grid/sessions/{sessionId}", get(get_session_uri))
        .merge(secured)
        .with_state(map)
}

async fn add_session(
    State(map): State<Arc<dyn SessionMap>>,
    Json(session): Json<ActiveSession>,
) -> Result<StatusCode, GridError> {
    map.add(session).await?;
    Ok(StatusCode::OK)
}

async fn get_session_uri(
    State(map): State<Arc<dyn SessionMap>>,
    Path(session_id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    // A malformed id names no session; the router expects a plain 404.
    let id: SessionId = session_id.parse().map_err(|_| {
        (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": { "code": "no-such-session", "message": session_id } })),
        )
    })?;
    let uri = map
        .uri_for(id)
        .await
        .map_err(|e| (e.status(), Json(e.to_wire())))?;
    Ok(Json(json!({ "value": uri })))
}

async fn remove_session(
    State(map): State<Arc<dyn SessionMap>>,
    Path(session_id): Path<String>,
) -> Result<StatusCode, GridError> {
    if let Ok(id) = session_id.parse::<SessionId>() {
        map.remove(id).await?;
    }
    Ok(StatusCode::OK)
}

