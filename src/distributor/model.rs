//! The grid model: the distributor's materialized view of every node and its
//! slots, augmented with heartbeat bookkeeping. Mutations happen only under
//! the distributor's write lock; this type itself is plain data.

use crate::ids::{NodeId, SessionId, SlotId};
use crate::node::status::{Availability, NodeStatus};
use crate::session::ActiveSession;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tracing::debug;

pub struct NodeEntry {
    pub status: NodeStatus,
    pub last_heartbeat: DateTime<Utc>,
    /// When this node last started a session; `None` sorts as oldest.
    pub last_session_at: Option<DateTime<Utc>>,
}

/// Ordered collection of node entries keyed by NodeId.
#[derive(Default)]
pub struct GridModel {
    nodes: BTreeMap<NodeId, NodeEntry>,
}

impl GridModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, node_id: NodeId) -> bool {
        self.nodes.contains_key(&node_id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &NodeEntry> {
        self.nodes.values()
    }

    /// Insert or refresh a node from a status snapshot. Snapshots older than
    /// the entry's heartbeat are ignored; heartbeats arrive in wall-clock
    /// order or not at all.
    pub fn upsert(&mut self, status: NodeStatus, at: DateTime<Utc>) -> bool {
        match self.nodes.get_mut(&status.node_id) {
            Some(entry) => {
                if at < entry.last_heartbeat {
                    debug!(node = %status.node_id, "ignoring out-of-order heartbeat");
                    return false;
                }
                entry.status = status;
                entry.last_heartbeat = at;
                true
            }
            None => {
                self.nodes.insert(
                    status.node_id,
                    NodeEntry {
                        status,
                        last_heartbeat: at,
                        last_session_at: None,
                    },
                );
                true
            }
        }
    }

    pub fn remove(&mut self, node_id: NodeId) -> Option<NodeEntry> {
        self.nodes.remove(&node_id)
    }

    pub fn set_availability(&mut self, node_id: NodeId, availability: Availability) {
        if let Some(entry) = self.nodes.get_mut(&node_id) {
            if entry.status.availability != availability {
                debug!(node = %node_id, %availability, "availability changed");
                entry.status.availability = availability;
            }
        }
    }

    /// Mark a free slot on an UP node as held for an in-flight creation.
    pub fn reserve(&mut self, slot_id: &SlotId) -> bool {
        let Some(entry) = self.nodes.get_mut(&slot_id.node_id) else {
            return false;
        };
        if entry.status.availability != Availability::Up {
            return false;
        }
        match entry.status.slots.iter_mut().find(|s| s.id == *slot_id) {
            Some(slot) if slot.is_free() => {
                slot.reserved = true;
                true
            }
            _ => false,
        }
    }

    pub fn release(&mut self, slot_id: &SlotId) {
        if let Some(entry) = self.nodes.get_mut(&slot_id.node_id) {
            if let Some(slot) = entry.status.slots.iter_mut().find(|s| s.id == *slot_id) {
                slot.reserved = false;
            }
        }
    }

    /// Record (or clear) the session on a slot; recording also stamps the
    /// node's last-session time for the scheduler's tie-break.
    pub fn set_session(&mut self, slot_id: &SlotId, session: Option<ActiveSession>) {
        if let Some(entry) = self.nodes.get_mut(&slot_id.node_id) {
            if let Some(slot) = entry.status.slots.iter_mut().find(|s| s.id == *slot_id) {
                slot.reserved = false;
                match session {
                    Some(session) => {
                        let started = session.started_at;
                        slot.last_started_at = Some(started);
                        slot.session = Some(session);
                        entry.last_session_at = Some(started);
                    }
                    None => slot.session = None,
                }
            }
        }
    }

    /// Sessions currently recorded on a node's slots.
    pub fn sessions_on(&self, node_id: NodeId) -> Vec<ActiveSession> {
        self.nodes
            .get(&node_id)
            .map(|entry| {
                entry
                    .status
                    .slots
                    .iter()
                    .filter_map(|s| s.session.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn node_for_session(&self, session_id: SessionId) -> Option<NodeId> {
        self.nodes.values().find_map(|entry| {
            entry
                .status
                .slots
                .iter()
                .any(|s| s.session.as_ref().map(|x| x.id) == Some(session_id))
                .then_some(entry.status.node_id)
        })
    }

    /// Any UP node with at least one free slot.
    pub fn has_capacity(&self) -> bool {
        self.nodes.values().any(|entry| {
            entry.status.availability == Availability::Up && entry.status.free_slot_count() > 0
        })
    }

    pub fn snapshot(&self) -> Vec<NodeStatus> {
        self.nodes.values().map(|e| e.status.clone()).collect()
    }

    /// Nodes whose last heartbeat predates `cutoff`.
    pub fn stale(&self, cutoff: DateTime<Utc>) -> Vec<NodeId> {
        self.nodes
            .values()
            .filter(|e| e.last_heartbeat < cutoff)
            .map(|e| e.status.node_id)
            .collect()
    }

    pub fn session_count(&self) -> usize {
        self.nodes
            .values()
            .map(|e| e.status.session_count())
            .sum()
    }

    pub fn total_capacity(&self) -> usize {
        self.nodes
            .values()
            .map(|e| e.status.max_concurrent_sessions)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::Capabilities;
    use crate::node::status::{OsInfo, SlotSnapshot};
    use crate::session::Dialect;

    fn status_with_slots(node_id: NodeId, free: usize) -> NodeStatus {
        let slots = (0..free)
            .map(|i| SlotSnapshot {
                id: SlotId::new(node_id, i as u32),
                stereotype: Capabilities::new().with("browserName", "cheese"),
                reserved: false,
                session: None,
                last_started_at: None,
            })
            .collect();
        NodeStatus {
            node_id,
            uri: "http://127.0.0.1:5555".into(),
            availability: Availability::Up,
            max_concurrent_sessions: free,
            slots,
            version: env!("CARGO_PKG_VERSION").into(),
            os_info: OsInfo::sample(),
        }
    }

    fn cheese_session(node_uri: &str) -> ActiveSession {
        ActiveSession {
            id: SessionId::new(),
            node_uri: node_uri.into(),
            stereotype: Capabilities::new().with("browserName", "cheese"),
            capabilities: Capabilities::new().with("browserName", "cheese"),
            dialect: Dialect::W3c,
            started_at: Utc::now(),
            upstream: None,
        }
    }

    #[test]
    fn test_upsert_is_idempotent_for_size() {
        let mut model = GridModel::new();
        let node_id = NodeId::new();
        model.upsert(status_with_slots(node_id, 1), Utc::now());
        model.upsert(status_with_slots(node_id, 1), Utc::now());
        assert_eq!(model.len(), 1);
    }

    #[test]
    fn test_out_of_order_heartbeat_is_ignored() {
        let mut model = GridModel::new();
        let node_id = NodeId::new();
        let now = Utc::now();
        model.upsert(status_with_slots(node_id, 1), now);
        let mut older = status_with_slots(node_id, 1);
        older.availability = Availability::Down;
        assert!(!model.upsert(older, now - chrono::Duration::seconds(5)));
        let snapshot = model.snapshot();
        assert_eq!(snapshot[0].availability, Availability::Up);
    }

    #[test]
    fn test_reserve_requires_free_slot_on_up_node() {
        let mut model = GridModel::new();
        let node_id = NodeId::new();
        model.upsert(status_with_slots(node_id, 1), Utc::now());
        let slot = SlotId::new(node_id, 0);
        assert!(model.reserve(&slot));
        // Second reservation of the same slot fails.
        assert!(!model.reserve(&slot));
        model.release(&slot);
        assert!(model.reserve(&slot));
    }

    #[test]
    fn test_no_reservation_on_draining_node() {
        let mut model = GridModel::new();
        let node_id = NodeId::new();
        model.upsert(status_with_slots(node_id, 1), Utc::now());
        model.set_availability(node_id, Availability::Draining);
        assert!(!model.reserve(&SlotId::new(node_id, 0)));
    }

    #[test]
    fn test_set_session_clears_reservation_and_stamps_time() {
        let mut model = GridModel::new();
        let node_id = NodeId::new();
        model.upsert(status_with_slots(node_id, 1), Utc::now());
        let slot = SlotId::new(node_id, 0);
        assert!(model.reserve(&slot));
        let session = cheese_session("http://127.0.0.1:5555");
        let session_id = session.id;
        model.set_session(&slot, Some(session));
        assert_eq!(model.session_count(), 1);
        assert_eq!(model.node_for_session(session_id), Some(node_id));
        assert!(!model.has_capacity());

        model.set_session(&slot, None);
        assert_eq!(model.session_count(), 0);
        assert!(model.has_capacity());
    }

    #[test]
    fn test_stale_finds_old_heartbeats() {
        let mut model = GridModel::new();
        let fresh = NodeId::new();
        let old = NodeId::new();
        let now = Utc::now();
        model.upsert(status_with_slots(fresh, 1), now);
        model.upsert(status_with_slots(old, 1), now - chrono::Duration::seconds(300));
        let stale = model.stale(now - chrono::Duration::seconds(120));
        assert_eq!(stale, vec![old]);
    }

    #[test]
    fn test_session_count_stays_within_capacity() {
        let mut model = GridModel::new();
        let node_id = NodeId::new();
        model.upsert(status_with_slots(node_id, 3), Utc::now());
        for i in 0..3 {
            let slot = SlotId::new(node_id, i);
            assert!(model.reserve(&slot));
            model.set_session(&slot, Some(cheese_session("http://127.0.0.1:5555")));
        }
        assert!(model.session_count() <= model.total_capacity());
        assert_eq!(model.session_count(), 3);
    }
}
