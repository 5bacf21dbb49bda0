//! Mutation observation for [`super::Document`].

use super::{NodeId, Page};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::mpsc;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    ChildList,
    Attributes,
}

/// One recorded change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationRecord {
    pub kind: MutationKind,
    /// Parent for child list changes, the changed node otherwise
    pub target: NodeId,
    pub added: Vec<NodeId>,
    pub removed: Vec<NodeId>,
    pub attribute: Option<String>,
}

impl MutationRecord {
    pub(super) fn child_list(target: NodeId, added: Vec<NodeId>, removed: Vec<NodeId>) -> Self {
        Self {
            kind: MutationKind::ChildList,
            target,
            added,
            removed,
            attribute: None,
        }
    }

    pub(super) fn attribute(target: NodeId, name: String) -> Self {
        Self {
            kind: MutationKind::Attributes,
            target,
            added: Vec::new(),
            removed: Vec::new(),
            attribute: Some(name),
        }
    }

}

/// Which changes an observer wants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ObserveInit {
    pub child_list: bool,
    pub subtree: bool,
    pub attributes: bool,
}

impl ObserveInit {
    /// Child list changes anywhere below the target
    pub fn subtree_child_list() -> Self {
        Self {
            child_list: true,
            subtree: true,
            ..Self::default()
        }
    }

    fn wants(&self, kind: MutationKind) -> bool {
        match kind {
            MutationKind::ChildList => self.child_list,
            MutationKind::Attributes => self.attributes,
        }
    }
}

struct Slot {
    id: u64,
    target: NodeId,
    init: ObserveInit,
    tx: mpsc::UnboundedSender<Vec<MutationRecord>>,
}

#[derive(Default)]
struct Slots {
    next_id: u64,
    entries: Vec<Slot>,
}

#[derive(Default)]
pub(super) struct ObserverRegistry {
    slots: Arc<Mutex<Slots>>,
}

fn lock(slots: &Mutex<Slots>) -> MutexGuard<'_, Slots> {
    slots.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ObserverRegistry {
    pub(super) fn register(
        &self,
        target: NodeId,
        init: ObserveInit,
    ) -> (MutationObserver, mpsc::UnboundedReceiver<Vec<MutationRecord>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut slots = lock(&self.slots);
        slots.next_id += 1;
        let id = slots.next_id;
        slots.entries.push(Slot {
            id,
            target,
            init,
            tx,
        });
        trace!(observer = id, target = ?target, "observer registered");

        let observer = MutationObserver {
            id,
            slots: Arc::downgrade(&self.slots),
        };
        (observer, rx)
    }

    pub(super) fn len(&self) -> usize {
        lock(&self.slots).entries.len()
    }

    /// Deliver one batch to every observer whose target covers a record
    pub(super) fn dispatch(&self, page: &Page, records: Vec<MutationRecord>) {
        let mut slots = lock(&self.slots);
        slots.entries.retain(|slot| {
            let batch: Vec<MutationRecord> = records
                .iter()
                .filter(|r| slot.init.wants(r.kind))
                .filter(|r| {
                    r.target == slot.target
                        || (slot.init.subtree && page.contains(slot.target, r.target))
                })
                .cloned()
                .collect();
            if batch.is_empty() {
                return true;
            }
            // A closed receiver means the observer task is gone
            slot.tx.send(batch).is_ok()
        });
    }

    /// Follow a rebuilt arena. Observers of detached targets stop receiving.
    pub(super) fn remap(&self, ids: &HashMap<NodeId, NodeId>) {
        let mut slots = lock(&self.slots);
        slots.entries.retain_mut(|slot| match ids.get(&slot.target) {
            Some(new) => {
                slot.target = *new;
                true
            }
            None => {
                trace!(observer = slot.id, "observer target detached");
                false
            }
        });
    }
}

/// Registration handle. Dropping it stops delivery and closes the channel.
pub struct MutationObserver {
    id: u64,
    slots: Weak<Mutex<Slots>>,
}

impl MutationObserver {
    /// Current target, `None` once delivery has stopped
    pub fn target(&self) -> Option<NodeId> {
        let slots = self.slots.upgrade()?;
        let entries = lock(&slots);
        let target = entries
            .entries
            .iter()
            .find(|slot| slot.id == self.id)
            .map(|slot| slot.target);
        target
    }

    pub fn disconnect(self) {}
}

impl Drop for MutationObserver {
    fn drop(&mut self) {
        if let Some(slots) = self.slots.upgrade() {
            lock(&slots).entries.retain(|slot| slot.id != self.id);
            trace!(observer = self.id, "observer disconnected");
        }
    }
}

impl std::fmt::Debug for MutationObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationObserver")
            .field("id", &self.id)
            .field("target", &self.target())
            .finish()
    }
}
