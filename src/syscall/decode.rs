//! Invocation Decoding
//!
//! Splits per invoked capability type. Each decoder validates every
//! argument and capability before its first mutation, marks the caller
//! `Restart`, then commits. Endpoint, notification and reply
//! capabilities are not decoded at all: invoking them *is* the IPC.

use crate::cap::{CapRights, Capability};
use crate::config::{
    MAX_EXTRA_CAPS, MIN_BUDGET, MIN_REFILLS, MAX_REFILLS, MSG_MAX_LENGTH, MSG_REGISTERS,
    NUM_CORES, NUM_DOMAINS, NUM_IRQS, TCB_BUFFER_SLOT, TCB_CSPACE_SLOT,
    TCB_FAULT_HANDLER_SLOT, TCB_TIMEOUT_HANDLER_SLOT, TCB_VSPACE_SLOT,
};
use crate::error::SyscallError;
use crate::hal::{Hal, Register};
use crate::kernel::Kernel;
use crate::sched::ThreadState;
use crate::syscall::{InvocationFailure, InvocationResult};
use crate::types::{CoreId, Irq, ScIx, SlotIx, TcbIx, Word};

/// CNode operation labels.
pub mod cnode_ops {
    pub const REVOKE: u64 = 1;
    pub const DELETE: u64 = 2;
    pub const CANCEL_BADGED_SENDS: u64 = 3;
    pub const COPY: u64 = 4;
    pub const MINT: u64 = 5;
    pub const MOVE: u64 = 6;
    pub const MUTATE: u64 = 7;
    pub const ROTATE: u64 = 8;
}

/// Thread operation labels.
pub mod tcb_ops {
    pub const READ_REGISTERS: u64 = 1;
    pub const WRITE_REGISTERS: u64 = 2;
    pub const SUSPEND: u64 = 3;
    pub const RESUME: u64 = 4;
    pub const CONFIGURE: u64 = 5;
    pub const SET_PRIORITY: u64 = 6;
    pub const SET_MC_PRIORITY: u64 = 7;
    pub const SET_SCHED_PARAMS: u64 = 8;
    pub const SET_AFFINITY: u64 = 9;
    pub const SET_TIMEOUT_ENDPOINT: u64 = 10;
    pub const BIND_NOTIFICATION: u64 = 11;
    pub const UNBIND_NOTIFICATION: u64 = 12;
    pub const SET_DOMAIN: u64 = 13;
}

/// Untyped operation labels.
pub mod untyped_ops {
    pub const RETYPE: u64 = 1;
}

/// Scheduling-context operation labels.
pub mod sched_context_ops {
    pub const BIND: u64 = 1;
    pub const UNBIND: u64 = 2;
    pub const UNBIND_OBJECT: u64 = 3;
    pub const CONSUMED: u64 = 4;
}

/// Scheduling-control operation labels.
pub mod sched_control_ops {
    pub const CONFIGURE: u64 = 1;
}

/// Interrupt operation labels.
pub mod irq_ops {
    pub const CONTROL_GET: u64 = 1;
    pub const HANDLER_ACK: u64 = 1;
    pub const HANDLER_SET_NOTIFICATION: u64 = 2;
    pub const HANDLER_CLEAR: u64 = 3;
}

#[inline]
fn arg(args: &[Word], i: usize) -> Result<Word, SyscallError> {
    args.get(i).copied().ok_or(SyscallError::TruncatedMessage)
}

impl<H: Hal> Kernel<H> {
    /// Dispatch one invocation of the capability in `slot`.
    pub(crate) fn decode_invocation(
        &mut self,
        label: Word,
        args: &[Word],
        extra: &[Option<SlotIx>; MAX_EXTRA_CAPS],
        slot: SlotIx,
        is_blocking: bool,
        is_call: bool,
        can_donate: bool,
    ) -> InvocationResult {
        let thread = self.cur_thread();
        match self.slot(slot).cap {
            Capability::Endpoint { ep, badge, rights } => {
                if !rights.contains(CapRights::WRITE) {
                    return Err(SyscallError::InvalidCapability { index: 0 }.into());
                }
                self.send_ipc(
                    is_blocking,
                    is_call,
                    badge,
                    rights.contains(CapRights::GRANT),
                    rights.contains(CapRights::GRANT_REPLY),
                    can_donate,
                    thread,
                    ep,
                );
                Ok(0)
            }
            Capability::Notification { ntfn, badge, rights } => {
                if !rights.contains(CapRights::WRITE) {
                    return Err(SyscallError::InvalidCapability { index: 0 }.into());
                }
                self.send_signal(ntfn, badge);
                Ok(0)
            }
            Capability::Reply { reply, can_grant } => {
                self.do_reply_transfer(thread, reply, can_grant);
                Ok(0)
            }
            Capability::CNode { .. } => self.decode_cnode_invocation(label, args, extra, slot),
            Capability::Thread { tcb } => self.decode_tcb_invocation(label, args, extra, tcb),
            Capability::Untyped { .. } => self.decode_untyped_invocation(label, args, extra, slot),
            Capability::SchedContext { sc } => {
                self.decode_sched_context_invocation(label, args, extra, sc)
            }
            Capability::SchedControl { core } => {
                self.decode_sched_control_invocation(label, args, extra, core)
            }
            Capability::IrqControl => self.decode_irq_control_invocation(label, args, extra, slot),
            Capability::IrqHandler { irq } => {
                self.decode_irq_handler_invocation(label, extra, irq)
            }
            _ => Err(SyscallError::InvalidCapability { index: 0 }.into()),
        }
    }

    fn restart_caller(&mut self) {
        let cur = self.cur_thread();
        self.set_thread_state(cur, ThreadState::Restart);
    }

    fn extra_cap(
        &self,
        extra: &[Option<SlotIx>; MAX_EXTRA_CAPS],
        i: usize,
    ) -> Result<(SlotIx, Capability), SyscallError> {
        match extra.get(i).copied().flatten() {
            Some(slot) => Ok((slot, self.slot(slot).cap)),
            None => Err(SyscallError::TruncatedMessage),
        }
    }

    // ---- CNode --------------------------------------------------------

    fn decode_cnode_invocation(
        &mut self,
        label: Word,
        args: &[Word],
        extra: &[Option<SlotIx>; MAX_EXTRA_CAPS],
        slot: SlotIx,
    ) -> InvocationResult {
        let root = self.slot(slot).cap;
        let target = self.lookup_target_slot(root, arg(args, 0)?, arg(args, 1)? as usize)?;

        match label {
            cnode_ops::REVOKE => {
                self.restart_caller();
                self.cte_revoke(target)?;
                Ok(0)
            }
            cnode_ops::DELETE => {
                self.restart_caller();
                self.cte_delete(target, true)?;
                Ok(0)
            }
            cnode_ops::CANCEL_BADGED_SENDS => {
                let Capability::Endpoint { ep, badge, .. } = self.slot(target).cap else {
                    return Err(SyscallError::IllegalOperation.into());
                };
                if badge == 0 {
                    return Err(SyscallError::IllegalOperation.into());
                }
                self.restart_caller();
                self.cancel_badged_sends(ep, badge);
                Ok(0)
            }
            cnode_ops::COPY | cnode_ops::MINT | cnode_ops::MOVE | cnode_ops::MUTATE => {
                self.ensure_empty_slot(target)?;
                let (_, src_root) = self.extra_cap(extra, 0)?;
                let src =
                    self.lookup_source_slot(src_root, arg(args, 2)?, arg(args, 3)? as usize)?;
                let src_cap = self.slot(src).cap;

                match label {
                    cnode_ops::COPY => {
                        let rights = CapRights::from_bits_truncate(arg(args, 4)? as u8);
                        let derived = self.derive_cap(src, src_cap.mask_rights(rights))?;
                        if derived.is_null() {
                            return Err(SyscallError::IllegalOperation.into());
                        }
                        self.restart_caller();
                        self.cte_insert(derived, src, target);
                    }
                    cnode_ops::MINT => {
                        let rights = CapRights::from_bits_truncate(arg(args, 4)? as u8);
                        let data = arg(args, 5)?;
                        let minted = src_cap.mask_rights(rights).update_data(false, data);
                        if minted.is_null() {
                            return Err(SyscallError::IllegalOperation.into());
                        }
                        let derived = self.derive_cap(src, minted)?;
                        if derived.is_null() {
                            return Err(SyscallError::IllegalOperation.into());
                        }
                        self.restart_caller();
                        self.cte_insert(derived, src, target);
                    }
                    cnode_ops::MOVE => {
                        self.restart_caller();
                        self.cte_move(src_cap, src, target);
                    }
                    _ => {
                        let data = arg(args, 4)?;
                        let mutated = src_cap.update_data(false, data);
                        if mutated.is_null() {
                            return Err(SyscallError::IllegalOperation.into());
                        }
                        self.restart_caller();
                        self.cte_move(mutated, src, target);
                    }
                }
                Ok(0)
            }
            cnode_ops::ROTATE => {
                let pivot_data = arg(args, 2)?;
                let src_data = arg(args, 5)?;
                let (_, pivot_root) = self.extra_cap(extra, 0)?;
                let (_, src_root) = self.extra_cap(extra, 1)?;
                let pivot =
                    self.lookup_pivot_slot(pivot_root, arg(args, 3)?, arg(args, 4)? as usize)?;
                let src =
                    self.lookup_source_slot(src_root, arg(args, 6)?, arg(args, 7)? as usize)?;
                if pivot == src || pivot == target {
                    return Err(SyscallError::IllegalOperation.into());
                }
                if target != src {
                    self.ensure_empty_slot(target)?;
                }
                if self.slot(pivot).is_empty() {
                    return Err(SyscallError::FailedLookup {
                        source: true,
                        fault: crate::error::LookupFault::MissingCapability { bits_left: 0 },
                    }
                    .into());
                }
                let new_src = self.slot(src).cap.update_data(true, src_data);
                let new_pivot = self.slot(pivot).cap.update_data(true, pivot_data);
                if new_src.is_null() || new_pivot.is_null() {
                    return Err(SyscallError::IllegalOperation.into());
                }
                self.restart_caller();
                if target == src {
                    self.cte_swap(new_src, src, new_pivot, pivot);
                } else {
                    self.cte_move(new_pivot, pivot, target);
                    self.cte_move(new_src, src, pivot);
                }
                Ok(0)
            }
            _ => Err(SyscallError::IllegalOperation.into()),
        }
    }

    // ---- TCB ----------------------------------------------------------

    fn decode_tcb_invocation(
        &mut self,
        label: Word,
        args: &[Word],
        extra: &[Option<SlotIx>; MAX_EXTRA_CAPS],
        tcb: TcbIx,
    ) -> InvocationResult {
        let caller = self.cur_thread();
        match label {
            tcb_ops::READ_REGISTERS => {
                if tcb == caller {
                    return Err(SyscallError::IllegalOperation.into());
                }
                let count = arg(args, 0)? as usize;
                if count < 1 || count > MSG_MAX_LENGTH {
                    return Err(SyscallError::RangeError {
                        min: 1,
                        max: MSG_MAX_LENGTH as Word,
                    }
                    .into());
                }
                self.restart_caller();
                for i in 0..count {
                    let value = self.hal.read_gp_register(tcb, i);
                    if i < MSG_REGISTERS {
                        self.hal.set_register(caller, Register::Msg(i), value);
                    } else if !self.hal.set_ipc_buffer_word(caller, i, value) {
                        return Ok(i);
                    }
                }
                Ok(count)
            }
            tcb_ops::WRITE_REGISTERS => {
                if tcb == caller {
                    return Err(SyscallError::IllegalOperation.into());
                }
                let count = arg(args, 0)? as usize;
                if args.len() < 1 + count {
                    return Err(SyscallError::TruncatedMessage.into());
                }
                self.restart_caller();
                for i in 0..count {
                    self.hal.write_gp_register(tcb, i, args[1 + i]);
                }
                Ok(0)
            }
            tcb_ops::SUSPEND => {
                self.restart_caller();
                self.suspend(tcb);
                Ok(0)
            }
            tcb_ops::RESUME => {
                self.restart_caller();
                self.restart_thread(tcb);
                Ok(0)
            }
            tcb_ops::CONFIGURE => {
                let croot_data = arg(args, 0)?;
                let (croot_slot, croot_cap) = self.extra_cap(extra, 0)?;
                let croot = if croot_data != 0 {
                    croot_cap.update_data(false, croot_data)
                } else {
                    croot_cap
                };
                if !matches!(croot, Capability::CNode { .. }) {
                    return Err(SyscallError::InvalidCapability { index: 1 }.into());
                }
                let (vroot_slot, vroot_cap) = self.extra_cap(extra, 1)?;
                if !matches!(vroot_cap, Capability::VSpace { .. }) {
                    return Err(SyscallError::InvalidCapability { index: 2 }.into());
                }
                let buffer = match self.extra_cap(extra, 2) {
                    Ok((slot, cap @ Capability::Frame { .. })) => Some((slot, cap)),
                    Ok(_) => return Err(SyscallError::InvalidCapability { index: 3 }.into()),
                    Err(_) => None,
                };
                self.restart_caller();
                self.install_tcb_cap(tcb, TCB_CSPACE_SLOT, croot_slot, croot)?;
                self.install_tcb_cap(tcb, TCB_VSPACE_SLOT, vroot_slot, vroot_cap)?;
                if let Some((slot, cap)) = buffer {
                    self.install_tcb_cap(tcb, TCB_BUFFER_SLOT, slot, cap)?;
                }
                Ok(0)
            }
            tcb_ops::SET_PRIORITY => {
                let prio = arg(args, 0)? as usize;
                let ceiling = self.tcb(caller).mcp;
                if prio > ceiling {
                    return Err(SyscallError::RangeError { min: 0, max: ceiling as Word }.into());
                }
                self.restart_caller();
                self.set_priority(tcb, prio);
                Ok(0)
            }
            tcb_ops::SET_MC_PRIORITY => {
                let mcp = arg(args, 0)? as usize;
                let ceiling = self.tcb(caller).mcp;
                if mcp > ceiling {
                    return Err(SyscallError::RangeError { min: 0, max: ceiling as Word }.into());
                }
                self.restart_caller();
                self.tcb_mut(tcb).mcp = mcp;
                Ok(0)
            }
            tcb_ops::SET_SCHED_PARAMS => {
                let mcp = arg(args, 0)? as usize;
                let prio = arg(args, 1)? as usize;
                let ceiling = self.tcb(caller).mcp;
                if mcp > ceiling || prio > ceiling {
                    return Err(SyscallError::RangeError { min: 0, max: ceiling as Word }.into());
                }
                let sc = match self.extra_cap(extra, 0) {
                    Ok((_, Capability::SchedContext { sc })) => {
                        if self.sc(sc).tcb.is_some() || self.tcb(tcb).sched_context.is_some() {
                            return Err(SyscallError::IllegalOperation.into());
                        }
                        Some(sc)
                    }
                    Ok(_) => return Err(SyscallError::InvalidCapability { index: 1 }.into()),
                    Err(_) => None,
                };
                let fault_handler = match self.extra_cap(extra, 1) {
                    Ok((slot, cap @ Capability::Endpoint { rights, .. })) => {
                        if !rights.contains(CapRights::WRITE) {
                            return Err(SyscallError::InvalidCapability { index: 2 }.into());
                        }
                        Some((slot, cap))
                    }
                    Ok(_) => return Err(SyscallError::InvalidCapability { index: 2 }.into()),
                    Err(_) => None,
                };
                self.restart_caller();
                self.tcb_mut(tcb).mcp = mcp;
                self.set_priority(tcb, prio);
                if let Some(sc) = sc {
                    self.sched_context_bind_tcb(sc, tcb);
                }
                if let Some((slot, cap)) = fault_handler {
                    self.install_tcb_cap(tcb, TCB_FAULT_HANDLER_SLOT, slot, cap)?;
                }
                Ok(0)
            }
            tcb_ops::SET_AFFINITY => {
                let core = arg(args, 0)? as usize;
                if core >= NUM_CORES {
                    return Err(SyscallError::RangeError { min: 0, max: NUM_CORES as Word - 1 }
                        .into());
                }
                self.restart_caller();
                if let Some(sc) = self.tcb(tcb).sched_context {
                    self.sc_mut(sc).core = core;
                }
                self.migrate_thread(tcb, core);
                Ok(0)
            }
            tcb_ops::SET_TIMEOUT_ENDPOINT => {
                // Absent capability clears the handler.
                let handler = match self.extra_cap(extra, 0) {
                    Ok((slot, cap @ Capability::Endpoint { rights, .. })) => {
                        if !rights.contains(CapRights::WRITE) {
                            return Err(SyscallError::InvalidCapability { index: 1 }.into());
                        }
                        Some((slot, cap))
                    }
                    Ok(_) => return Err(SyscallError::InvalidCapability { index: 1 }.into()),
                    Err(_) => None,
                };
                self.restart_caller();
                match handler {
                    Some((slot, cap)) => {
                        self.install_tcb_cap(tcb, TCB_TIMEOUT_HANDLER_SLOT, slot, cap)?;
                    }
                    None => {
                        let dest = self.tcb(tcb).cnode_base.add(TCB_TIMEOUT_HANDLER_SLOT);
                        self.cte_delete(dest, true)?;
                    }
                }
                Ok(0)
            }
            tcb_ops::BIND_NOTIFICATION => {
                let (_, cap) = self.extra_cap(extra, 0)?;
                let Capability::Notification { ntfn, rights, .. } = cap else {
                    return Err(SyscallError::InvalidCapability { index: 1 }.into());
                };
                if !rights.contains(CapRights::READ) {
                    return Err(SyscallError::InvalidCapability { index: 1 }.into());
                }
                if self.tcb(tcb).bound_notification.is_some()
                    || self.ntfn(ntfn).bound_tcb.is_some()
                    || self.ntfn(ntfn).state == crate::ipc::NtfnState::Waiting
                {
                    return Err(SyscallError::IllegalOperation.into());
                }
                self.restart_caller();
                self.bind_notification(tcb, ntfn);
                Ok(0)
            }
            tcb_ops::UNBIND_NOTIFICATION => {
                if self.tcb(tcb).bound_notification.is_none() {
                    return Err(SyscallError::IllegalOperation.into());
                }
                self.restart_caller();
                self.unbind_notification(tcb);
                Ok(0)
            }
            tcb_ops::SET_DOMAIN => {
                let domain = arg(args, 0)? as usize;
                if domain >= NUM_DOMAINS {
                    return Err(SyscallError::RangeError {
                        min: 0,
                        max: NUM_DOMAINS as Word - 1,
                    }
                    .into());
                }
                self.restart_caller();
                self.set_domain(tcb, domain);
                Ok(0)
            }
            _ => Err(SyscallError::IllegalOperation.into()),
        }
    }

    /// Replace one of a thread's built-in capability slots with a child
    /// of `src`.
    fn install_tcb_cap(
        &mut self,
        tcb: TcbIx,
        offset: usize,
        src: SlotIx,
        cap: Capability,
    ) -> Result<(), InvocationFailure> {
        let dest = self.tcb(tcb).cnode_base.add(offset);
        self.cte_delete(dest, true)?;
        let derived = self.derive_cap(src, cap)?;
        if !derived.is_null() {
            self.cte_insert(derived, src, dest);
        }
        Ok(())
    }

    // ---- Untyped ------------------------------------------------------

    fn decode_untyped_invocation(
        &mut self,
        label: Word,
        args: &[Word],
        extra: &[Option<SlotIx>; MAX_EXTRA_CAPS],
        slot: SlotIx,
    ) -> InvocationResult {
        if label != untyped_ops::RETYPE {
            return Err(SyscallError::IllegalOperation.into());
        }
        let (_, dest_root) = self.extra_cap(extra, 0)?;
        let call = self.decode_retype(slot, args, dest_root)?;
        self.restart_caller();
        self.invoke_retype(call)?;
        Ok(0)
    }

    // ---- Scheduling contexts ------------------------------------------

    fn decode_sched_context_invocation(
        &mut self,
        label: Word,
        _args: &[Word],
        extra: &[Option<SlotIx>; MAX_EXTRA_CAPS],
        sc: ScIx,
    ) -> InvocationResult {
        match label {
            sched_context_ops::BIND => match self.extra_cap(extra, 0)? {
                (_, Capability::Thread { tcb }) => {
                    if self.sc(sc).tcb.is_some() || self.tcb(tcb).sched_context.is_some() {
                        return Err(SyscallError::IllegalOperation.into());
                    }
                    self.restart_caller();
                    self.sched_context_bind_tcb(sc, tcb);
                    Ok(0)
                }
                (_, Capability::Notification { ntfn, .. }) => {
                    if self.sc(sc).ntfn.is_some() || self.ntfn(ntfn).sc.is_some() {
                        return Err(SyscallError::IllegalOperation.into());
                    }
                    self.restart_caller();
                    self.sc_mut(sc).ntfn = Some(ntfn);
                    self.ntfn_mut(ntfn).sc = Some(sc);
                    Ok(0)
                }
                _ => Err(SyscallError::InvalidCapability { index: 1 }.into()),
            },
            sched_context_ops::UNBIND => {
                if self.sc(sc).tcb == Some(self.cur_thread()) {
                    return Err(SyscallError::IllegalOperation.into());
                }
                self.restart_caller();
                self.sched_context_unbind_tcb(sc);
                self.sched_context_unbind_ntfn(sc);
                self.sched_context_unbind_reply(sc);
                Ok(0)
            }
            sched_context_ops::UNBIND_OBJECT => match self.extra_cap(extra, 0)? {
                (_, Capability::Thread { tcb }) => {
                    if self.sc(sc).tcb != Some(tcb) {
                        return Err(SyscallError::IllegalOperation.into());
                    }
                    if tcb == self.cur_thread() {
                        return Err(SyscallError::IllegalOperation.into());
                    }
                    self.restart_caller();
                    self.sched_context_unbind_tcb(sc);
                    Ok(0)
                }
                (_, Capability::Notification { ntfn, .. }) => {
                    if self.sc(sc).ntfn != Some(ntfn) {
                        return Err(SyscallError::IllegalOperation.into());
                    }
                    self.restart_caller();
                    self.sched_context_unbind_ntfn(sc);
                    Ok(0)
                }
                _ => Err(SyscallError::InvalidCapability { index: 1 }.into()),
            },
            sched_context_ops::CONSUMED => {
                let caller = self.cur_thread();
                self.restart_caller();
                let consumed = self.sc(sc).consumed;
                self.sc_mut(sc).consumed = 0;
                self.hal.set_register(caller, Register::Msg(0), consumed);
                Ok(1)
            }
            _ => Err(SyscallError::IllegalOperation.into()),
        }
    }

    fn decode_sched_control_invocation(
        &mut self,
        label: Word,
        args: &[Word],
        extra: &[Option<SlotIx>; MAX_EXTRA_CAPS],
        core: CoreId,
    ) -> InvocationResult {
        if label != sched_control_ops::CONFIGURE {
            return Err(SyscallError::IllegalOperation.into());
        }
        let budget = arg(args, 0)?;
        let mut period = arg(args, 1)?;
        let max_refills = arg(args, 2)? as usize;
        let badge = arg(args, 3)?;

        if budget < MIN_BUDGET {
            return Err(SyscallError::RangeError { min: MIN_BUDGET, max: Word::MAX }.into());
        }
        if period != 0 && period < budget {
            return Err(SyscallError::RangeError { min: budget, max: Word::MAX }.into());
        }
        if max_refills < MIN_REFILLS || max_refills > MAX_REFILLS {
            return Err(SyscallError::RangeError {
                min: MIN_REFILLS as Word,
                max: MAX_REFILLS as Word,
            }
            .into());
        }
        let (_, cap) = self.extra_cap(extra, 0)?;
        let Capability::SchedContext { sc } = cap else {
            return Err(SyscallError::InvalidCapability { index: 1 }.into());
        };
        // Budget equal to period means no idle window: plain round robin.
        if period == budget {
            period = 0;
        }

        self.restart_caller();
        let bound = self.sc(sc).tcb;
        if let Some(t) = bound {
            self.release_remove(t);
            self.sched_dequeue(t);
        }
        let now = self.cur_time;
        if self.sc(sc).active() {
            self.sc_mut(sc).refill_update(period, budget, max_refills, now);
        } else {
            self.sc_mut(sc).refill_new(max_refills, budget, period, now);
        }
        self.sc_mut(sc).core = core;
        self.sc_mut(sc).badge = badge;
        if let Some(t) = bound {
            self.tcb_mut(t).affinity = core;
            self.sched_context_resume(sc);
            if self.is_schedulable(t) {
                self.sched_enqueue(t);
                self.reschedule_required();
            }
        }
        Ok(0)
    }

    // ---- Interrupts ---------------------------------------------------

    fn decode_irq_control_invocation(
        &mut self,
        label: Word,
        args: &[Word],
        extra: &[Option<SlotIx>; MAX_EXTRA_CAPS],
        slot: SlotIx,
    ) -> InvocationResult {
        if label != irq_ops::CONTROL_GET {
            return Err(SyscallError::IllegalOperation.into());
        }
        let irq = arg(args, 0)? as usize;
        if irq >= NUM_IRQS {
            return Err(SyscallError::RangeError { min: 0, max: NUM_IRQS as Word - 1 }.into());
        }
        if self.irq_active[irq] {
            return Err(SyscallError::RevokeFirst.into());
        }
        let (_, dest_root) = self.extra_cap(extra, 0)?;
        let dest = self.lookup_target_slot(dest_root, arg(args, 1)?, arg(args, 2)? as usize)?;
        self.ensure_empty_slot(dest)?;

        self.restart_caller();
        self.irq_active[irq] = true;
        self.insert_new_cap(slot, dest, Capability::IrqHandler { irq });
        Ok(0)
    }

    fn decode_irq_handler_invocation(
        &mut self,
        label: Word,
        extra: &[Option<SlotIx>; MAX_EXTRA_CAPS],
        irq: Irq,
    ) -> InvocationResult {
        match label {
            irq_ops::HANDLER_ACK => {
                self.restart_caller();
                self.hal.mask_interrupt(false, irq);
                Ok(0)
            }
            irq_ops::HANDLER_SET_NOTIFICATION => {
                let (src, cap) = self.extra_cap(extra, 0)?;
                let Capability::Notification { rights, .. } = cap else {
                    return Err(SyscallError::InvalidCapability { index: 1 }.into());
                };
                if !rights.contains(CapRights::WRITE) {
                    return Err(SyscallError::InvalidCapability { index: 1 }.into());
                }
                self.restart_caller();
                let dest = self.irq_slot(irq);
                self.cte_delete_one(dest);
                self.cte_insert(cap, src, dest);
                Ok(0)
            }
            irq_ops::HANDLER_CLEAR => {
                self.restart_caller();
                let dest = self.irq_slot(irq);
                self.cte_delete_one(dest);
                Ok(0)
            }
            _ => Err(SyscallError::IllegalOperation.into()),
        }
    }
}
