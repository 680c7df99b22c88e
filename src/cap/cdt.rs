//! Capability Derivation List
//!
//! Every occupied slot is linked into one global doubly-linked list
//! ordered so that a capability's derived children sit immediately after
//! it. Parentage is recomputed from capability contents plus the
//! `revocable`/`first_badged` flags, so the list needs no per-node child
//! pointers and insert/move/swap stay O(1).

use crate::cap::capability::{Capability, ZombieKind};
use crate::config::TCB_CNODE_SLOTS;
use crate::error::{DecodeResult, SyscallError};
use crate::hal::Hal;
use crate::kernel::Kernel;
use crate::types::{Region, SlotIx};

impl<H: Hal> Kernel<H> {
    /// The physical span backing a capability's object, if it has one.
    pub(crate) fn cap_region(&self, cap: &Capability) -> Option<Region> {
        match *cap {
            Capability::Untyped { region, .. }
            | Capability::Frame { region, .. }
            | Capability::VSpace { region } => Some(region),
            Capability::Endpoint { ep, .. } => Some(self.ep(ep).region),
            Capability::Notification { ntfn, .. } => Some(self.ntfn(ntfn).region),
            Capability::Reply { reply, .. } => Some(self.reply(reply).region),
            Capability::CNode { cnode, .. } => Some(self.cnodes[cnode.index()].region),
            Capability::Thread { tcb } => Some(self.tcb(tcb).region),
            Capability::SchedContext { sc } => Some(self.sc(sc).region),
            _ => None,
        }
    }

    /// Whether `a` covers the kernel object (or span) `b` refers to.
    pub(crate) fn same_region_as(&self, a: &Capability, b: &Capability) -> bool {
        match (a, b) {
            (Capability::Untyped { region, .. }, _) => match self.cap_region(b) {
                Some(other) => region.contains(other),
                None => false,
            },
            (Capability::Endpoint { ep: a, .. }, Capability::Endpoint { ep: b, .. }) => a == b,
            (Capability::Notification { ntfn: a, .. }, Capability::Notification { ntfn: b, .. }) => {
                a == b
            }
            (Capability::Reply { reply: a, .. }, Capability::Reply { reply: b, .. }) => a == b,
            (
                Capability::CNode { cnode: a, radix: ra, .. },
                Capability::CNode { cnode: b, radix: rb, .. },
            ) => a == b && ra == rb,
            (Capability::Thread { tcb: a }, Capability::Thread { tcb: b }) => a == b,
            (Capability::SchedContext { sc: a }, Capability::SchedContext { sc: b }) => a == b,
            (Capability::SchedControl { core: a }, Capability::SchedControl { core: b }) => a == b,
            (Capability::Frame { region: a, .. }, Capability::Frame { region: b, .. }) => {
                a.contains(*b)
            }
            (Capability::VSpace { region: a }, Capability::VSpace { region: b }) => a == b,
            (Capability::IrqControl, Capability::IrqControl)
            | (Capability::IrqControl, Capability::IrqHandler { .. }) => true,
            (Capability::IrqHandler { irq: a }, Capability::IrqHandler { irq: b }) => a == b,
            _ => false,
        }
    }

    /// Whether `a` and `b` name the very same object (not merely nested
    /// spans); the finality test for deletion.
    pub(crate) fn same_object_as(&self, a: &Capability, b: &Capability) -> bool {
        match (a, b) {
            (Capability::Untyped { .. }, _) => false,
            (Capability::IrqControl, Capability::IrqHandler { .. }) => false,
            (
                Capability::Frame { region: ra, .. },
                Capability::Frame { region: rb, .. },
            ) => ra == rb,
            _ => self.same_region_as(a, b),
        }
    }

    /// Whether the capability in `a` is the derivation parent of `b`'s.
    pub(crate) fn is_mdb_parent_of(&self, a: SlotIx, b: SlotIx) -> bool {
        let sa = self.slot(a);
        let sb = self.slot(b);
        if !sa.revocable {
            return false;
        }
        if !self.same_region_as(&sa.cap, &sb.cap) {
            return false;
        }
        match sa.cap {
            Capability::Endpoint { badge, .. } => {
                badge == 0 || (badge == sb.cap.badge() && !sb.first_badged)
            }
            Capability::Notification { badge, .. } => {
                badge == 0 || (badge == sb.cap.badge() && !sb.first_badged)
            }
            _ => true,
        }
    }

    /// Whether no child of the capability in `slot` exists anywhere.
    pub(crate) fn ensure_no_children(&self, slot: SlotIx) -> DecodeResult<()> {
        if let Some(next) = self.slot(slot).next {
            if self.is_mdb_parent_of(slot, next) {
                return Err(SyscallError::RevokeFirst);
            }
        }
        Ok(())
    }

    /// Whether `slot` is free to receive a capability.
    pub(crate) fn ensure_empty_slot(&self, slot: SlotIx) -> DecodeResult<()> {
        if self.slot(slot).is_empty() {
            Ok(())
        } else {
            Err(SyscallError::DeleteFirst)
        }
    }

    /// Compute the capability a Copy/Mint/transfer actually installs, or
    /// refuse the derivation.
    pub(crate) fn derive_cap(&self, slot: SlotIx, cap: Capability) -> DecodeResult<Capability> {
        match cap {
            Capability::Zombie { .. } | Capability::IrqControl | Capability::Reply { .. } => {
                Ok(Capability::Null)
            }
            Capability::Untyped { .. } => {
                self.ensure_no_children(slot)?;
                Ok(cap)
            }
            other => Ok(other),
        }
    }

    /// An Untyped that hands out a same-region child can never reuse its
    /// space while the child lives; mark it fully consumed.
    fn set_untyped_cap_as_full(&mut self, src: SlotIx, new_cap: &Capability) {
        let src_cap = self.slot(src).cap;
        if let (
            Capability::Untyped { region: sr, .. },
            Capability::Untyped { region: nr, .. },
        ) = (&src_cap, new_cap)
        {
            if sr == nr {
                if let Capability::Untyped { region, device, .. } = src_cap {
                    self.slot_mut(src).cap = Capability::Untyped {
                        region,
                        free_offset: 1u64 << region.size_bits,
                        device,
                    };
                }
            }
        }
    }

    /// Install a derived capability immediately after its source in the
    /// derivation list. The destination must be empty.
    pub(crate) fn cte_insert(&mut self, new_cap: Capability, src: SlotIx, dest: SlotIx) {
        debug_assert!(self.slot(dest).is_empty());
        let revocable = new_cap.is_revocable(&self.slot(src).cap);
        let src_next = self.slot(src).next;

        self.set_untyped_cap_as_full(src, &new_cap);

        {
            let d = self.slot_mut(dest);
            d.cap = new_cap;
            d.prev = Some(src);
            d.next = src_next;
            d.revocable = revocable;
            d.first_badged = revocable;
        }
        if let Some(n) = src_next {
            self.slot_mut(n).prev = Some(dest);
        }
        self.slot_mut(src).next = Some(dest);
    }

    /// Install a freshly created capability as a child of `parent`
    /// (an Untyped or the interrupt-control authority).
    pub(crate) fn insert_new_cap(&mut self, parent: SlotIx, dest: SlotIx, cap: Capability) {
        debug_assert!(self.slot(dest).is_empty());
        let next = self.slot(parent).next;
        {
            let d = self.slot_mut(dest);
            d.cap = cap;
            d.prev = Some(parent);
            d.next = next;
            d.revocable = true;
            d.first_badged = true;
        }
        if let Some(n) = next {
            self.slot_mut(n).prev = Some(dest);
        }
        self.slot_mut(parent).next = Some(dest);
    }

    /// Move a capability between slots, keeping its place in the
    /// derivation list. The destination must be empty.
    pub(crate) fn cte_move(&mut self, new_cap: Capability, src: SlotIx, dest: SlotIx) {
        debug_assert!(self.slot(dest).is_empty());
        let s = *self.slot(src);

        {
            let d = self.slot_mut(dest);
            d.cap = new_cap;
            d.prev = s.prev;
            d.next = s.next;
            d.revocable = s.revocable;
            d.first_badged = s.first_badged;
        }
        if let Some(p) = s.prev {
            self.slot_mut(p).next = Some(dest);
        }
        if let Some(n) = s.next {
            self.slot_mut(n).prev = Some(dest);
        }
        self.slot_mut(src).clear();
    }

    /// Swap two capabilities together with their list positions.
    pub(crate) fn cte_swap(
        &mut self,
        cap1: Capability,
        slot1: SlotIx,
        cap2: Capability,
        slot2: SlotIx,
    ) {
        let s1 = *self.slot(slot1);
        let s2 = *self.slot(slot2);

        // Write capabilities first; link fixup below handles adjacency.
        self.slot_mut(slot1).cap = cap2;
        self.slot_mut(slot2).cap = cap1;

        let fix = |ix: Option<SlotIx>| -> Option<SlotIx> {
            match ix {
                Some(i) if i == slot1 => Some(slot2),
                Some(i) if i == slot2 => Some(slot1),
                other => other,
            }
        };

        {
            let s = self.slot_mut(slot1);
            s.prev = fix(s2.prev);
            s.next = fix(s2.next);
            s.revocable = s2.revocable;
            s.first_badged = s2.first_badged;
        }
        {
            let s = self.slot_mut(slot2);
            s.prev = fix(s1.prev);
            s.next = fix(s1.next);
            s.revocable = s1.revocable;
            s.first_badged = s1.first_badged;
        }
        // Repoint all four external neighbours.
        let (p1, n1) = (self.slot(slot1).prev, self.slot(slot1).next);
        if let Some(p) = p1 {
            if p != slot2 && p != slot1 {
                self.slot_mut(p).next = Some(slot1);
            }
        }
        if let Some(n) = n1 {
            if n != slot2 && n != slot1 {
                self.slot_mut(n).prev = Some(slot1);
            }
        }
        let (p2, n2) = (self.slot(slot2).prev, self.slot(slot2).next);
        if let Some(p) = p2 {
            if p != slot1 && p != slot2 {
                self.slot_mut(p).next = Some(slot2);
            }
        }
        if let Some(n) = n2 {
            if n != slot1 && n != slot2 {
                self.slot_mut(n).prev = Some(slot2);
            }
        }
    }

    /// Swap used during Zombie deletion, preserving both capabilities.
    pub(crate) fn cap_swap_for_delete(&mut self, slot1: SlotIx, slot2: SlotIx) {
        if slot1 == slot2 {
            return;
        }
        let cap1 = self.slot(slot1).cap;
        let cap2 = self.slot(slot2).cap;
        self.cte_swap(cap1, slot1, cap2, slot2);
    }

    /// Splice a slot out of the derivation list and clear it. The deleted
    /// slot's `first_badged` flag flows to its successor so sibling badge
    /// tracking survives the removal.
    pub(crate) fn empty_slot(&mut self, slot: SlotIx) {
        if self.slot(slot).is_empty() {
            return;
        }
        let s = *self.slot(slot);
        if let Some(p) = s.prev {
            self.slot_mut(p).next = s.next;
        }
        if let Some(n) = s.next {
            let ns = self.slot_mut(n);
            ns.prev = s.prev;
            ns.first_badged |= s.first_badged;
        }
        self.slot_mut(slot).clear();
    }

    /// Whether this is the last capability to its object anywhere.
    pub(crate) fn is_final_capability(&self, slot: SlotIx) -> bool {
        let s = self.slot(slot);
        if let Some(p) = s.prev {
            if self.same_object_as(&self.slot(p).cap, &s.cap) {
                return false;
            }
        }
        match s.next {
            Some(n) => !self.same_object_as(&s.cap, &self.slot(n).cap),
            None => true,
        }
    }

    /// The slot run belonging to a Zombie: a dead CNode's slots or a dead
    /// thread's built-in slots.
    pub(crate) fn zombie_slot_count(kind: ZombieKind) -> usize {
        match kind {
            ZombieKind::CNode { radix, .. } => 1 << radix,
            ZombieKind::Thread { .. } => TCB_CNODE_SLOTS,
        }
    }
}
