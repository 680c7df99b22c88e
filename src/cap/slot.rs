//! Capability Slots
//!
//! One slot holds exactly one capability plus its derivation-list links
//! and two flags. Slots live in a single global arena; CNodes and thread
//! control blocks own contiguous runs of it.
//!
//! Invariant: an empty slot has a null capability and null links; a
//! non-empty slot's `prev`/`next` always point at live list neighbours.

use super::capability::Capability;
use crate::types::SlotIx;

/// A capability storage location plus derivation-list metadata.
#[derive(Clone, Copy, Debug, Default)]
pub struct Slot {
    /// The stored capability; `Null` when the slot is empty.
    pub cap: Capability,
    /// Previous entry in the derivation list.
    pub prev: Option<SlotIx>,
    /// Next entry in the derivation list.
    pub next: Option<SlotIx>,
    /// Whether deleting this capability may revoke list successors.
    pub revocable: bool,
    /// Whether this slot introduced its badge into the list; used to tell
    /// sibling badged copies from true children.
    pub first_badged: bool,
}

impl Slot {
    /// An empty slot.
    pub const fn empty() -> Self {
        Self {
            cap: Capability::Null,
            prev: None,
            next: None,
            revocable: false,
            first_badged: false,
        }
    }

    /// Whether the slot holds no capability.
    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.cap.is_null()
    }

    /// Reset to the empty state.
    pub fn clear(&mut self) {
        *self = Self::empty();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_slot_has_null_links() {
        let slot = Slot::empty();
        assert!(slot.is_empty());
        assert!(slot.prev.is_none());
        assert!(slot.next.is_none());
        assert!(!slot.revocable);
        assert!(!slot.first_badged);
    }
}
