//! Node status snapshots — the wire shape published on registration and
//! heartbeats and materialized into the distributor's grid model.

use crate::capabilities::Capabilities;
use crate::ids::{NodeId, SlotId};
use crate::session::ActiveSession;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Availability {
    #[serde(rename = "UP")]
    Up,
    #[serde(rename = "DRAINING")]
    Draining,
    #[serde(rename = "DOWN")]
    Down,
}

impl std::fmt::Display for Availability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Availability::Up => "UP",
            Availability::Draining => "DRAINING",
            Availability::Down => "DOWN",
        };
        write!(f, "{s}")
    }
}

/// Host platform description, sampled once at node start-up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OsInfo {
    pub name: String,
    pub arch: String,
    pub version: String,
}

impl OsInfo {
    pub fn sample() -> Self {
        Self {
            name: sysinfo::System::name().unwrap_or_else(|| std::env::consts::OS.to_string()),
            arch: std::env::consts::ARCH.to_string(),
            version: sysinfo::System::os_version().unwrap_or_else(|| "unknown".to_string()),
        }
    }
}

/// One slot as reported by its node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotSnapshot {
    pub id: SlotId,
    pub stereotype: Capabilities,
    /// Set while the distributor holds the slot for an in-flight creation.
    #[serde(default)]
    pub reserved: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<ActiveSession>,
    /// When a session last started here; drives the scheduler's
    /// least-recently-used tie-break.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_started_at: Option<DateTime<Utc>>,
}

impl SlotSnapshot {
    pub fn is_free(&self) -> bool {
        !self.reserved && self.session.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    pub node_id: NodeId,
    pub uri: String,
    pub availability: Availability,
    pub max_concurrent_sessions: usize,
    pub slots: Vec<SlotSnapshot>,
    pub version: String,
    pub os_info: OsInfo,
}

impl NodeStatus {
    pub fn free_slot_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_free()).count()
    }

    pub fn session_count(&self) -> usize {
        self.slots.iter().filter(|s| s.session.is_some()).count()
    }

    /// At least one free slot satisfying `requested`.
    pub fn can_host(&self, requested: &Capabilities) -> bool {
        self.slots
            .iter()
            .any(|s| s.is_free() && requested.satisfied_by(&s.stereotype))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_status() -> NodeStatus {
        let node_id = NodeId::new();
        NodeStatus {
            node_id,
            uri: "http://127.0.0.1:5555".into(),
            availability: Availability::Up,
            max_concurrent_sessions: 2,
            slots: vec![
                SlotSnapshot {
                    id: SlotId::new(node_id, 0),
                    stereotype: Capabilities::new().with("browserName", "cheese"),
                    reserved: false,
                    session: None,
                    last_started_at: None,
                },
                SlotSnapshot {
                    id: SlotId::new(node_id, 1),
                    stereotype: Capabilities::new().with("browserName", "peas"),
                    reserved: true,
                    session: None,
                    last_started_at: Some(Utc::now()),
                },
            ],
            version: env!("CARGO_PKG_VERSION").into(),
            os_info: OsInfo::sample(),
        }
    }

    #[test]
    fn test_json_round_trip_is_lossless() {
        let status = sample_status();
        let encoded = serde_json::to_string(&status).unwrap();
        let decoded: NodeStatus = serde_json::from_str(&encoded).unwrap();
        assert_eq!(status, decoded);
    }

    #[test]
    fn test_availability_wire_names() {
        assert_eq!(serde_json::to_value(Availability::Up).unwrap(), json!("UP"));
        assert_eq!(
            serde_json::to_value(Availability::Draining).unwrap(),
            json!("DRAINING")
        );
    }

    #[test]
    fn test_reserved_slot_is_not_free() {
        let status = sample_status();
        assert_eq!(status.free_slot_count(), 1);
        assert!(status.can_host(&Capabilities::new().with("browserName", "cheese")));
        assert!(!status.can_host(&Capabilities::new().with("browserName", "peas")));
    }
}
