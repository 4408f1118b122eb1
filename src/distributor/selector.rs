//! Slot selection policy. The scheduler asks the selector for a ranked list
//! of candidate slots for one capability choice; the policy is pluggable so
//! deployments can bias placement however they like.

use super::model::{GridModel, NodeEntry};
use crate::capabilities::Capabilities;
use crate::ids::SlotId;
use crate::node::status::Availability;

pub trait SlotSelector: Send + Sync {
    /// Candidate slots for `requested`, best first. Only free slots on UP
    /// nodes are candidates.
    fn select(&self, requested: &Capabilities, model: &GridModel) -> Vec<SlotId>;
}

/// Default policy: hosts with more free slots first (spread the load), then
/// the host that started a session longest ago, then NodeId so the order is
/// deterministic.
#[derive(Default)]
pub struct DefaultSlotSelector;

impl SlotSelector for DefaultSlotSelector {
    fn select(&self, requested: &Capabilities, model: &GridModel) -> Vec<SlotId> {
        let mut hosts: Vec<&NodeEntry> = model
            .entries()
            .filter(|entry| {
                entry.status.availability == Availability::Up && entry.status.can_host(requested)
            })
            .collect();
        hosts.sort_by(|a, b| {
            b.status
                .free_slot_count()
                .cmp(&a.status.free_slot_count())
                // None (never used) sorts before any timestamp: oldest first.
                .then(a.last_session_at.cmp(&b.last_session_at))
                .then(a.status.node_id.cmp(&b.status.node_id))
        });
        hosts
            .into_iter()
            .flat_map(|entry| {
                entry
                    .status
                    .slots
                    .iter()
                    .filter(|slot| slot.is_free() && requested.satisfied_by(&slot.stereotype))
                    .map(|slot| slot.id)
            })
            .collect()
    }
}
