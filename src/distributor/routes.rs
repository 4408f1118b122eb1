//! HTTP surface of the distributor service. Node registration and drain are
//! intra-cluster mutations behind the secret; synchronous session creation
//! and the status snapshot are open.

use super::{Distributor, DistributorStatus};
use crate::error::GridError;
use crate::ids::NodeId;
use crate::node::status::NodeStatus;
use crate::secret::{self, RegistrationSecret};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;

pub fn router(distributor: Arc<Distributor>, secret: RegistrationSecret) -> Router {
    let secured = Router::new()
        .route("/se/grid/distributor/node", post(register_node))
        .route(
            "/se/grid/distributor/node/{nodeId}/drain",
            post(drain_node),
        )
        .route_layer(middleware::from_fn_with_state(
            secret,
            secret::require_secret,
        ));

    Router::new()
        .route("/se/grid/distributor/session", post(create_session))
        .route("/se/grid/distributor/status", get(distributor_status))
        .route("/readyz", get(readyz))
        .merge(secured)
        .with_state(distributor)
}

/// Register a node from its status snapshot. Also the heartbeat path for
/// split-role nodes: re-registration refreshes the model.
async fn register_node(
    State(distributor): State<Arc<Distributor>>,
    Json(status): Json<NodeStatus>,
) -> StatusCode {
    distributor.register_from_status(status, Utc::now()).await;
    StatusCode::OK
}

async fn create_session(
    State(distributor): State<Arc<Distributor>>,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, GridError> {
    let response = distributor.create_session(&payload).await?;
    Ok(Json(response))
}

async fn drain_node(
    State(distributor): State<Arc<Distributor>>,
    Path(node_id): Path<String>,
) -> Result<StatusCode, GridError> {
    let id: NodeId = node_id
        .parse()
        .map_err(|_| GridError::SessionNotCreated(format!("malformed node id: {node_id}")))?;
    distributor.drain_node(id).await?;
    Ok(StatusCode::OK)
}

async fn distributor_status(
    State(distributor): State<Arc<Distributor>>,
) -> Json<DistributorStatus> {
    Json(distributor.status().await)
}

async fn readyz(State(distributor): State<Arc<Distributor>>) -> StatusCode {
    if distributor.ready().await {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
