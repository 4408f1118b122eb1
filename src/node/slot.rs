//! A slot: one concurrency unit on a node, described by a stereotype,
//! hosting at most one session. State moves free → reserved → busy and back.

use super::status::SlotSnapshot;
use crate::capabilities::Capabilities;
use crate::ids::SlotId;
use crate::session::ActiveSession;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, PartialEq)]
pub enum SlotState {
    Free,
    Reserved,
    Busy(ActiveSession),
}

#[derive(Debug, Clone)]
pub struct Slot {
    pub id: SlotId,
    pub stereotype: Capabilities,
    pub state: SlotState,
    pub last_started_at: Option<DateTime<Utc>>,
}

impl Slot {
    pub fn new(id: SlotId, stereotype: Capabilities) -> Self {
        Self {
            id,
            stereotype,
            state: SlotState::Free,
            last_started_at: None,
        }
    }

    pub fn is_free(&self) -> bool {
        matches!(self.state, SlotState::Free)
    }

    pub fn session(&self) -> Option<&ActiveSession> {
        match &self.state {
            SlotState::Busy(session) => Some(session),
            _ => None,
        }
    }

    /// Whether a free slot could host the requested capabilities.
    pub fn can_host(&self, requested: &Capabilities) -> bool {
        self.is_free() && requested.satisfied_by(&self.stereotype)
    }

    /// Whether the stereotype is compatible at all, regardless of occupancy.
    /// Distinguishes "come back later" from "never here".
    pub fn is_compatible(&self, requested: &Capabilities) -> bool {
        requested.satisfied_by(&self.stereotype)
    }

    pub fn reserve(&mut self) {
        debug_assert!(self.is_free(), "reserving a non-free slot");
        self.state = SlotState::Reserved;
    }

    pub fn release(&mut self) {
        self.state = SlotState::Free;
    }

    pub fn start(&mut self, session: ActiveSession) {
        self.last_started_at = Some(session.started_at);
        self.state = SlotState::Busy(session);
    }

    pub fn snapshot(&self) -> SlotSnapshot {
        SlotSnapshot {
            id: self.id,
            stereotype: self.stereotype.clone(),
            reserved: matches!(self.state, SlotState::Reserved),
            session: self.session().cloned(),
            last_started_at: self.last_started_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{NodeId, SessionId};
    use crate::session::Dialect;

    fn cheese_slot() -> Slot {
        Slot::new(
            SlotId::new(NodeId::new(), 0),
            Capabilities::new().with("browserName", "cheese"),
        )
    }

    fn cheese_session(node_uri: &str) -> ActiveSession {
        ActiveSession {
            id: SessionId::new(),
            node_uri: node_uri.to_string(),
            stereotype: Capabilities::new().with("browserName", "cheese"),
            capabilities: Capabilities::new().with("browserName", "cheese"),
            dialect: Dialect::W3c,
            started_at: Utc::now(),
            upstream: None,
        }
    }

    #[test]
    fn test_state_transitions() {
        let mut slot = cheese_slot();
        assert!(slot.is_free());
        slot.reserve();
        assert!(!slot.is_free());
        slot.start(cheese_session("http://node:5555"));
        assert!(slot.session().is_some());
        slot.release();
        assert!(slot.is_free());
        assert!(slot.last_started_at.is_some());
    }

    #[test]
    fn test_busy_slot_cannot_host() {
        let mut slot = cheese_slot();
        let request = Capabilities::new().with("browserName", "cheese");
        assert!(slot.can_host(&request));
        slot.reserve();
        assert!(!slot.can_host(&request));
        assert!(slot.is_compatible(&request));
    }

    #[test]
    fn test_snapshot_reflects_reservation() {
        let mut slot = cheese_slot();
        slot.reserve();
        let snap = slot.snapshot();
        assert!(snap.reserved);
        assert!(snap.session.is_none());
        assert!(!snap.is_free());
    }
}
