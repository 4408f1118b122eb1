//! Session wire model: dialects, new-session payload parsing, and the
//! created-session types shared by queue, node, distributor, and session map.

use crate::capabilities::Capabilities;
use crate::error::GridError;
use crate::ids::{RequestId, SessionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Wire-protocol variant the client speaks; propagated so the response
/// encoding can match the request encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Dialect {
    #[serde(rename = "W3C")]
    W3c,
    #[serde(rename = "OSS")]
    Oss,
}

impl Dialect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::W3c => "W3C",
            Dialect::Oss => "OSS",
        }
    }
}

/// A raw client payload decomposed into the dialects it speaks and the
/// capability alternatives it enumerates, in the client's order.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSessionPayload {
    pub dialects: Vec<Dialect>,
    pub choices: Vec<Capabilities>,
}

/// Decompose a new-session body.
///
/// A W3C payload carries `capabilities.alwaysMatch` / `capabilities.firstMatch`;
/// each choice is `alwaysMatch` merged (right-biased) with one `firstMatch`
/// entry. An OSS payload carries `desiredCapabilities` as a single choice. A
/// body may speak both dialects; the dialect list keeps the order W3C, OSS.
pub fn parse_new_session_payload(body: &Value) -> Result<NewSessionPayload, GridError> {
    let mut dialects = Vec::new();
    let mut choices = Vec::new();

    if let Some(caps) = body.get("capabilities") {
        let always = caps
            .get("alwaysMatch")
            .and_then(Capabilities::from_value)
            .unwrap_or_default();
        let first_match: Vec<Capabilities> = caps
            .get("firstMatch")
            .and_then(Value::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(Capabilities::from_value)
                    .collect()
            })
            .unwrap_or_default();

        dialects.push(Dialect::W3c);
        if first_match.is_empty() {
            choices.push(always.clone());
        } else {
            for fm in &first_match {
                choices.push(always.merge(fm));
            }
        }
    }

    if let Some(desired) = body.get("desiredCapabilities") {
        if let Some(caps) = Capabilities::from_value(desired) {
            dialects.push(Dialect::Oss);
            choices.push(caps);
        }
    }

    if choices.is_empty() {
        return Err(GridError::SessionNotCreated(
            "request carries no capabilities".to_string(),
        ));
    }
    Ok(NewSessionPayload { dialects, choices })
}

/// The unit of work handed to a node: one request id, one capability choice.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub request_id: RequestId,
    pub dialects: Vec<Dialect>,
    pub capabilities: Capabilities,
}

/// A session running on a slot somewhere in the grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveSession {
    pub id: SessionId,
    /// URI of the node hosting the session; what the session map serves.
    pub node_uri: String,
    pub stereotype: Capabilities,
    pub capabilities: Capabilities,
    pub dialect: Dialect,
    pub started_at: DateTime<Utc>,
    /// Driver endpoint in-session commands are forwarded to, when the
    /// factory runs one. Sessions without an upstream answer locally.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream: Option<String>,
}

/// What a node returns for a successful `newSession`: the session plus the
/// response body already encoded for the client's dialect.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionResponse {
    pub session: ActiveSession,
    pub payload: Value,
}

impl CreateSessionResponse {
    pub fn encode(session: ActiveSession) -> Self {
        let payload = match session.dialect {
            Dialect::W3c => json!({
                "value": {
                    "sessionId": session.id,
                    "capabilities": session.capabilities.as_value(),
                }
            }),
            Dialect::Oss => json!({
                "status": 0,
                "sessionId": session.id,
                "value": session.capabilities.as_value(),
            }),
        };
        Self { session, payload }
    }
}
