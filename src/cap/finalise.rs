//! Capability Deletion and Revocation
//!
//! Deleting the last capability to an object tears the object down; a
//! composite object (CNode, thread) cannot be torn down atomically, so
//! its capability first decays to a Zombie that records how many of its
//! sub-slots still hold capabilities. Zombie reduction deletes those one
//! at a time, polling the preemption point between steps so a long
//! revocation never blocks interrupt delivery.
//!
//! # Design
//! `cte_delete` mirrors the split between an exposed delete (the slot
//! must end up empty before the call returns to user level) and the
//! interior deletes issued while reducing a Zombie, which may park the
//! Zombie mid-way and resume after a restart.

use crate::cap::capability::{Capability, ZombieKind};
use crate::config::WORK_UNITS_LIMIT;
use crate::error::{InvokeResult, Preempted};
use crate::hal::Hal;
use crate::kernel::Kernel;
use crate::types::{Irq, SlotIx};

impl<H: Hal> Kernel<H> {
    /// Burn one unit of the kernel work quota, reporting preemption when
    /// the quota is spent and an interrupt is waiting.
    pub(crate) fn preemption_point(&mut self) -> Result<(), Preempted> {
        self.work_units += 1;
        if self.work_units >= WORK_UNITS_LIMIT {
            self.work_units = 0;
            if self.hal.interrupt_pending() {
                return Err(Preempted);
            }
        }
        Ok(())
    }

    /// Tear down the object behind `cap` as far as this capability's
    /// finality requires. Returns the capability the slot decays to and,
    /// for interrupt handlers, the line to mask once the slot is empty.
    fn finalise_cap(&mut self, cap: Capability, is_final: bool) -> (Capability, Option<Irq>) {
        match cap {
            Capability::Endpoint { ep, .. } => {
                if is_final {
                    self.cancel_all_ipc(ep);
                    self.ep_mut(ep).live = false;
                }
                (Capability::Null, None)
            }
            Capability::Notification { ntfn, .. } => {
                if is_final {
                    self.unbind_maybe_notification(ntfn);
                    self.cancel_all_signals(ntfn);
                    self.ntfn_mut(ntfn).live = false;
                }
                (Capability::Null, None)
            }
            Capability::Reply { reply, .. } => {
                if is_final {
                    self.reply_remove(reply);
                    self.reply_mut(reply).live = false;
                }
                (Capability::Null, None)
            }
            Capability::CNode { cnode, radix, .. } => {
                if is_final {
                    let base = self.cnodes[cnode.index()].base;
                    self.cnodes[cnode.index()].live = false;
                    let kind = ZombieKind::CNode { cnode, radix };
                    let remaining = Self::zombie_slot_count(kind);
                    (Capability::Zombie { base, kind, remaining }, None)
                } else {
                    (Capability::Null, None)
                }
            }
            Capability::Thread { tcb } => {
                if is_final {
                    self.unbind_notification(tcb);
                    if let Some(sc) = self.tcb(tcb).sched_context {
                        self.sched_context_unbind_tcb(sc);
                    }
                    self.suspend(tcb);
                    self.tcb_mut(tcb).live = false;
                    let base = self.tcb(tcb).cnode_base;
                    let kind = ZombieKind::Thread { tcb };
                    let remaining = Self::zombie_slot_count(kind);
                    (Capability::Zombie { base, kind, remaining }, None)
                } else {
                    (Capability::Null, None)
                }
            }
            Capability::SchedContext { sc } => {
                if is_final {
                    self.sched_context_unbind_tcb(sc);
                    self.sched_context_unbind_ntfn(sc);
                    self.sched_context_unbind_reply(sc);
                    self.sc_mut(sc).live = false;
                }
                (Capability::Null, None)
            }
            Capability::IrqHandler { irq } => {
                if is_final {
                    // The delivery notification goes first; the line is
                    // masked once the handler slot itself is empty.
                    let slot = self.irq_slot(irq);
                    self.cte_delete_one(slot);
                    (Capability::Null, Some(irq))
                } else {
                    (Capability::Null, None)
                }
            }
            Capability::Zombie { .. } => (cap, None),
            _ => (Capability::Null, None),
        }
    }

    /// Mask and retire an interrupt line whose handler capability is gone.
    fn deleted_irq_handler(&mut self, irq: Irq) {
        self.hal.mask_interrupt(true, irq);
        self.irq_active[irq] = false;
    }

    /// Whether a finalised capability can simply be dropped from its slot.
    fn cap_removable(&self, cap: &Capability, slot: SlotIx) -> bool {
        match *cap {
            Capability::Null => true,
            Capability::Zombie { base, remaining, .. } => {
                remaining == 0 || (remaining == 1 && base == slot)
            }
            _ => false,
        }
    }

    /// A Zombie stored inside its own slot run; reducing it from outside
    /// would loop forever.
    fn cap_cyclic_zombie(cap: &Capability, slot: SlotIx) -> bool {
        matches!(*cap, Capability::Zombie { base, .. } if base == slot)
    }

    /// Delete one sub-slot of a Zombie.
    fn reduce_zombie(&mut self, slot: SlotIx, immediate: bool) -> InvokeResult {
        let Capability::Zombie { base, kind, remaining } = self.slot(slot).cap else {
            return Ok(());
        };
        debug_assert!(remaining > 0);
        let end = base.add(remaining - 1);
        if immediate {
            self.cte_delete(end, false)?;
            // The interior delete may have moved the Zombie; only shrink
            // it if it is still the one we started with.
            if let Capability::Zombie { base: b, kind: k, remaining: r } = self.slot(slot).cap {
                if b == base && k == kind && r == remaining {
                    self.slot_mut(slot).cap =
                        Capability::Zombie { base, kind, remaining: remaining - 1 };
                }
            }
        } else {
            // Park the Zombie in its own last sub-slot; a restarted
            // delete then resumes from a stable position.
            self.cap_swap_for_delete(end, slot);
        }
        Ok(())
    }

    /// Finalise whatever occupies `slot` until it is removable. Returns
    /// whether the slot may be emptied and any post-removal cleanup.
    fn finalise_slot(&mut self, slot: SlotIx, immediate: bool) -> Result<(bool, Option<Irq>), Preempted> {
        loop {
            if self.slot(slot).is_empty() {
                return Ok((true, None));
            }
            let cap = self.slot(slot).cap;
            let is_final = self.is_final_capability(slot);
            let (remainder, cleanup) = self.finalise_cap(cap, is_final);
            if self.cap_removable(&remainder, slot) {
                return Ok((true, cleanup));
            }
            self.slot_mut(slot).cap = remainder;
            if !immediate && Self::cap_cyclic_zombie(&remainder, slot) {
                return Ok((false, None));
            }
            self.reduce_zombie(slot, immediate)?;
            self.preemption_point()?;
        }
    }

    /// Delete the capability in `slot`. An exposed delete must leave the
    /// slot empty; an interior one may leave a parked Zombie behind.
    pub(crate) fn cte_delete(&mut self, slot: SlotIx, exposed: bool) -> InvokeResult {
        let (success, cleanup) = self.finalise_slot(slot, exposed)?;
        if exposed || success {
            self.empty_slot(slot);
            if let Some(irq) = cleanup {
                self.deleted_irq_handler(irq);
            }
        }
        Ok(())
    }

    /// Delete a capability whose finalisation is known to finish in one
    /// step (no composite objects, no interrupt lines).
    pub(crate) fn cte_delete_one(&mut self, slot: SlotIx) {
        if self.slot(slot).is_empty() {
            return;
        }
        let cap = self.slot(slot).cap;
        let is_final = self.is_final_capability(slot);
        let (remainder, cleanup) = self.finalise_cap(cap, is_final);
        debug_assert!(self.cap_removable(&remainder, slot));
        debug_assert!(cleanup.is_none());
        let _ = remainder;
        self.empty_slot(slot);
    }

    /// Delete every derived child of the capability in `slot`, oldest
    /// first, polling the preemption point between children.
    pub(crate) fn cte_revoke(&mut self, slot: SlotIx) -> InvokeResult {
        while let Some(next) = self.slot(slot).next {
            if self.slot(slot).is_empty() || !self.is_mdb_parent_of(slot, next) {
                break;
            }
            self.cte_delete(next, true)?;
            self.preemption_point()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cap::CapRights;
    use crate::config::{MAX_REFILLS, SC_BITS, TCB_BITS};
    use crate::hal::mock::MockHal;
    use crate::ipc::EpState;
    use crate::sched::ThreadState;
    use crate::types::{Prio, Region, TcbIx};

    fn kernel() -> (Kernel<MockHal>, SlotIx) {
        let mut k = Kernel::new(MockHal::new());
        let boot = k.bootstrap(8, Region::new(0x10_0000, 20), 10_000, 0);
        (k, boot.cnode_base)
    }

    fn spawn(k: &mut Kernel<MockHal>, prio: Prio) -> TcbIx {
        let tcb = k.create_tcb(Region::new(0, TCB_BITS));
        let sc = k.create_sc(Region::new(0, SC_BITS));
        let now = k.cur_time;
        k.sc_mut(sc).refill_new(MAX_REFILLS, 10_000, 100_000, now);
        k.sc_mut(sc).tcb = Some(tcb);
        k.tcb_mut(tcb).sched_context = Some(sc);
        k.tcb_mut(tcb).prio = prio;
        k.tcb_mut(tcb).state = ThreadState::Running;
        tcb
    }

    fn seed(k: &mut Kernel<MockHal>, slot: SlotIx, cap: Capability) {
        let s = k.slot_mut(slot);
        s.cap = cap;
        s.revocable = true;
        s.first_badged = matches!(
            cap,
            Capability::Endpoint { .. } | Capability::Notification { .. }
        );
    }

    #[test]
    fn test_deleting_last_endpoint_cap_cancels_waiters() {
        let (mut k, base) = kernel();
        let sender = spawn(&mut k, 5);
        let ep = k.create_endpoint(Region::new(0x800, 4));
        k.send_ipc(true, false, 1, true, true, false, sender, ep);
        assert_eq!(k.ep(ep).state, EpState::Send);

        let slot = base.add(20);
        seed(&mut k, slot, Capability::Endpoint { ep, badge: 0, rights: CapRights::all() });
        k.cte_delete(slot, true).unwrap();

        assert!(k.slot(slot).is_empty());
        assert_eq!(k.ep(ep).state, EpState::Idle);
        assert_eq!(k.tcb(sender).state, ThreadState::Restart);
        assert!(!k.ep(ep).live);
    }

    #[test]
    fn test_deleting_a_copy_leaves_the_object_alone() {
        let (mut k, base) = kernel();
        let sender = spawn(&mut k, 5);
        let ep = k.create_endpoint(Region::new(0x800, 4));
        k.send_ipc(true, false, 1, true, true, false, sender, ep);

        let cap = Capability::Endpoint { ep, badge: 0, rights: CapRights::all() };
        let a = base.add(20);
        let b = base.add(21);
        seed(&mut k, a, cap);
        k.cte_insert(cap, a, b);

        k.cte_delete(b, true).unwrap();
        assert!(k.slot(b).is_empty());
        // The waiter is untouched while a capability survives.
        assert_eq!(k.ep(ep).state, EpState::Send);
        assert!(k.ep(ep).live);
    }

    #[test]
    fn test_revoke_deletes_children_but_not_the_parent() {
        let (mut k, base) = kernel();
        let ep = k.create_endpoint(Region::new(0x800, 4));
        let cap = Capability::Endpoint { ep, badge: 0, rights: CapRights::all() };
        let parent = base.add(20);
        let child_a = base.add(21);
        let child_b = base.add(22);
        seed(&mut k, parent, cap);
        k.cte_insert(cap.update_data(false, 1), parent, child_a);
        k.cte_insert(cap.update_data(false, 2), parent, child_b);

        k.cte_revoke(parent).unwrap();
        assert!(k.slot(child_a).is_empty());
        assert!(k.slot(child_b).is_empty());
        assert!(!k.slot(parent).is_empty());
        assert!(k.ep(ep).live);
    }

    #[test]
    fn test_cnode_delete_clears_its_slots() {
        let (mut k, base) = kernel();
        let cnode = k.create_cnode(2, Region::new(0x20_0000, 7));
        let inner_base = k.cnodes[cnode.index()].base;
        let ep = k.create_endpoint(Region::new(0x800, 4));
        let ep_cap = Capability::Endpoint { ep, badge: 0, rights: CapRights::all() };
        seed(&mut k, inner_base.add(1), ep_cap);
        seed(&mut k, inner_base.add(3), ep_cap);

        let slot = base.add(20);
        seed(&mut k, slot, Capability::CNode { cnode, radix: 2, guard: 0, guard_bits: 0 });
        k.cte_delete(slot, true).unwrap();

        assert!(k.slot(slot).is_empty());
        for i in 0..4 {
            assert!(k.slot(inner_base.add(i)).is_empty());
        }
        assert!(!k.cnodes[cnode.index()].live);
        assert!(!k.ep(ep).live);
    }

    #[test]
    fn test_thread_delete_suspends_and_clears_built_in_slots() {
        let (mut k, base) = kernel();
        let tcb = spawn(&mut k, 5);
        let ntfn = k.create_notification(Region::new(0x900, 5));
        k.bind_notification(tcb, ntfn);
        let sc = k.tcb(tcb).sched_context.unwrap();

        let slot = base.add(20);
        seed(&mut k, slot, Capability::Thread { tcb });
        k.cte_delete(slot, true).unwrap();

        assert!(k.slot(slot).is_empty());
        assert_eq!(k.tcb(tcb).state, ThreadState::Inactive);
        assert!(k.tcb(tcb).sched_context.is_none());
        assert!(k.sc(sc).tcb.is_none());
        assert!(k.ntfn(ntfn).bound_tcb.is_none());
        assert!(!k.tcb(tcb).live);
    }

    #[test]
    fn test_irq_handler_delete_masks_the_line() {
        let (mut k, base) = kernel();
        k.irq_active[7] = true;
        let slot = base.add(20);
        seed(&mut k, slot, Capability::IrqHandler { irq: 7 });

        k.cte_delete(slot, true).unwrap();
        assert!(k.slot(slot).is_empty());
        assert!(!k.irq_active[7]);
        assert_eq!(k.hal.masked_irqs.last(), Some(&(true, 7)));
    }

    #[test]
    fn test_long_delete_preempts_and_resumes() {
        let (mut k, base) = kernel();
        // A 256-slot CNode full of endpoint capabilities outlasts the
        // work quota when an interrupt is pending.
        let cnode = k.create_cnode(8, Region::new(0x20_0000, 13));
        let inner_base = k.cnodes[cnode.index()].base;
        for i in 0..256 {
            let ep = k.create_endpoint(Region::new(0x1000 + i as u64 * 16, 4));
            seed(
                &mut k,
                inner_base.add(i),
                Capability::Endpoint { ep, badge: 0, rights: CapRights::all() },
            );
        }
        let slot = base.add(20);
        seed(&mut k, slot, Capability::CNode { cnode, radix: 8, guard: 0, guard_bits: 0 });

        k.hal.irq_pending = true;
        assert_eq!(k.cte_delete(slot, true), Err(Preempted));
        // Progress was made and recorded in the parked Zombie.
        match k.slot(slot).cap {
            Capability::Zombie { remaining, .. } => assert!(remaining < 256),
            other => panic!("expected a zombie, found {:?}", other),
        }

        k.hal.irq_pending = false;
        k.cte_delete(slot, true).unwrap();
        assert!(k.slot(slot).is_empty());
        for i in 0..256 {
            assert!(k.slot(inner_base.add(i)).is_empty());
        }
    }
}
