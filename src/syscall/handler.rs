//! Syscall and Interrupt Entry
//!
//! Mirrors the hardware trap vector: one function per way into the
//! kernel. Every entry follows the same spine: sample the clock, settle
//! the budget, do the work, run the scheduler, activate whatever thread
//! comes out. The caller's saved context is only touched through the
//! virtual registers of [`crate::hal::Register`].

use crate::cap::{CapRights, Capability};
use crate::config::{MSG_MAX_LENGTH, MSG_REGISTERS};
use crate::error::{LookupFault, SyscallError};
use crate::hal::{Hal, Register};
use crate::ipc::Fault;
use crate::kernel::Kernel;
use crate::sched::ThreadState;
use crate::syscall::InvocationFailure;
use crate::types::{Irq, MessageInfo, ReplyIx, TcbIx, Word};

use alloc::vec::Vec;

/// The invocation-style system calls.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Syscall {
    /// Invoke a capability and block for the answer.
    Call,
    /// Invoke a capability; block until delivery, expect no answer.
    Send,
    /// Invoke a capability; vanish silently if nobody is ready.
    NBSend,
    /// Receive on an endpoint or notification, offering a reply object.
    Recv,
    /// Receive without blocking.
    NBRecv,
    /// Receive without offering a reply object.
    Wait,
    /// Poll without blocking or offering a reply object.
    NBWait,
    /// Answer the held reply, then receive again.
    ReplyRecv,
    /// Surrender the rest of the current budget chunk.
    Yield,
}

impl<H: Hal> Kernel<H> {
    /// Main syscall entry.
    pub fn handle_syscall(&mut self, syscall: Syscall) {
        self.update_timestamp();
        if self.check_budget_restart() {
            match syscall {
                Syscall::Call => self.handle_invocation(true, true, true),
                Syscall::Send => self.handle_invocation(false, true, false),
                Syscall::NBSend => self.handle_invocation(false, false, false),
                Syscall::Recv => self.handle_recv(true, true),
                Syscall::NBRecv => self.handle_recv(false, true),
                Syscall::Wait => self.handle_recv(true, false),
                Syscall::NBWait => self.handle_recv(false, false),
                Syscall::ReplyRecv => {
                    self.handle_reply();
                    self.handle_recv(true, true);
                }
                Syscall::Yield => self.handle_yield(),
            }
        }
        self.schedule();
        self.activate_thread();
    }

    /// Deadline-timer entry: charge the elapsed budget and let the
    /// scheduler wake whatever became due.
    pub fn timer_irq(&mut self) {
        self.update_timestamp();
        self.check_budget();
        self.core_mut().reprogram = true;
        self.schedule();
        self.activate_thread();
    }

    /// Device-interrupt entry: signal the line's registered notification.
    pub fn handle_interrupt(&mut self, irq: Irq) {
        self.update_timestamp();
        self.check_budget();
        if self.irq_active[irq] {
            match self.slot(self.irq_slot(irq)).cap {
                Capability::Notification { ntfn, badge, rights }
                    if rights.contains(CapRights::WRITE) =>
                {
                    self.send_signal(ntfn, badge);
                }
                _ => log::warn!("interrupt {} has no notification registered", irq),
            }
            // The line stays masked until its handler acknowledges it.
            self.hal.mask_interrupt(true, irq);
        } else {
            log::warn!("spurious interrupt {}", irq);
            self.hal.mask_interrupt(true, irq);
        }
        self.hal.ack_interrupt(irq);
        self.schedule();
        self.activate_thread();
    }

    /// Remote-wakeup entry: another core marked new work for this one.
    pub fn reschedule_ipi(&mut self) {
        self.update_timestamp();
        self.check_budget();
        self.reschedule_required();
        self.schedule();
        self.activate_thread();
    }

    // ---- invocation path ----------------------------------------------

    fn handle_invocation(&mut self, is_call: bool, is_blocking: bool, can_donate: bool) {
        let thread = self.cur_thread();
        let cptr = self.hal.get_register(thread, Register::CapPtr);
        let info = MessageInfo::from_word(self.hal.get_register(thread, Register::MsgInfo));

        let slot = match self.lookup_slot(thread, cptr) {
            Ok(slot) if !self.slot(slot).is_empty() => slot,
            Ok(_) => {
                let fault = LookupFault::MissingCapability { bits_left: 0 };
                return self.invocation_lookup_failed(thread, cptr, fault, is_blocking);
            }
            Err(fault) => {
                return self.invocation_lookup_failed(thread, cptr, fault, is_blocking);
            }
        };

        let args = self.collect_args(thread, info.length);
        let extra = self.lookup_extra_caps(thread, info.extra_caps);

        match self.decode_invocation(
            info.label,
            &args,
            &extra,
            slot,
            is_blocking,
            is_call,
            can_donate,
        ) {
            Ok(reply_len) => {
                // Commit handlers leave the caller in Restart; turn that
                // into a completed syscall. IPC sends manage the caller's
                // state themselves and skip this.
                if self.tcb(thread).state == ThreadState::Restart {
                    if is_call {
                        self.reply_from_kernel_success(thread, reply_len);
                    }
                    self.set_thread_state(thread, ThreadState::Running);
                }
            }
            Err(InvocationFailure::Error(err)) => {
                log::debug!("invocation failed: {}", err);
                if is_call {
                    self.reply_from_kernel_error(thread, err);
                }
            }
            // Still Restart: the syscall re-executes once rescheduled.
            Err(InvocationFailure::Preempted) => {}
        }
    }

    fn invocation_lookup_failed(
        &mut self,
        thread: TcbIx,
        cptr: Word,
        fault: LookupFault,
        is_blocking: bool,
    ) {
        log::debug!("invoked capability lookup failed: {:?}", fault);
        if is_blocking {
            self.handle_fault(thread, Fault::CapFault { addr: cptr, in_receive: false, fault });
        }
    }

    /// Argument words for a decode: inline registers first, buffer words
    /// after, truncated at whatever the thread actually has mapped.
    fn collect_args(&self, thread: TcbIx, length: usize) -> Vec<Word> {
        let mut args = Vec::with_capacity(length.min(MSG_MAX_LENGTH));
        for i in 0..length.min(MSG_MAX_LENGTH) {
            if i < MSG_REGISTERS {
                args.push(self.hal.get_register(thread, Register::Msg(i)));
            } else {
                match self.hal.ipc_buffer_word(thread, i) {
                    Some(w) => args.push(w),
                    None => break,
                }
            }
        }
        args
    }

    // ---- receive path -------------------------------------------------

    fn handle_recv(&mut self, is_blocking: bool, can_reply: bool) {
        let thread = self.cur_thread();
        let cptr = self.hal.get_register(thread, Register::CapPtr);
        let cap = match self.lookup_cap(thread, cptr) {
            Ok(cap) => cap,
            Err(fault) => {
                return self.handle_fault(
                    thread,
                    Fault::CapFault { addr: cptr, in_receive: true, fault },
                );
            }
        };
        match cap {
            Capability::Endpoint { ep, rights, .. } if rights.contains(CapRights::READ) => {
                let reply = if can_reply {
                    match self.lookup_reply(thread) {
                        Ok(reply) => reply,
                        Err(()) => return,
                    }
                } else {
                    None
                };
                self.receive_ipc(thread, ep, is_blocking, reply);
            }
            Capability::Notification { ntfn, rights, .. } if rights.contains(CapRights::READ) => {
                let bound = self.ntfn(ntfn).bound_tcb;
                if bound.is_none() || bound == Some(thread) {
                    self.receive_signal(thread, ntfn, is_blocking);
                } else {
                    // Bound to someone else; receiving would steal their
                    // signals.
                    let fault = LookupFault::MissingCapability { bits_left: 0 };
                    self.handle_fault(
                        thread,
                        Fault::CapFault { addr: cptr, in_receive: true, fault },
                    );
                }
            }
            _ => {
                let fault = LookupFault::MissingCapability { bits_left: 0 };
                self.handle_fault(
                    thread,
                    Fault::CapFault { addr: cptr, in_receive: true, fault },
                );
            }
        }
    }

    /// Resolve the offered reply object. A zero pointer offers none;
    /// anything else must name a Reply capability.
    fn lookup_reply(&mut self, thread: TcbIx) -> Result<Option<ReplyIx>, ()> {
        let cptr = self.hal.get_register(thread, Register::ReplyCPtr);
        if cptr == 0 {
            return Ok(None);
        }
        match self.lookup_cap(thread, cptr) {
            Ok(Capability::Reply { reply, .. }) => Ok(Some(reply)),
            Ok(_) => {
                let fault = LookupFault::MissingCapability { bits_left: 0 };
                self.handle_fault(
                    thread,
                    Fault::CapFault { addr: cptr, in_receive: true, fault },
                );
                Err(())
            }
            Err(fault) => {
                self.handle_fault(
                    thread,
                    Fault::CapFault { addr: cptr, in_receive: true, fault },
                );
                Err(())
            }
        }
    }

    /// The reply half of `ReplyRecv`: answer through the offered reply
    /// object before turning around to receive.
    fn handle_reply(&mut self) {
        let thread = self.cur_thread();
        let cptr = self.hal.get_register(thread, Register::ReplyCPtr);
        if cptr == 0 {
            return;
        }
        if let Ok(Capability::Reply { reply, can_grant }) = self.lookup_cap(thread, cptr) {
            self.do_reply_transfer(thread, reply, can_grant);
        }
    }

    /// Give up the rest of the current budget chunk.
    fn handle_yield(&mut self) {
        let sc = self.core().cur_sc;
        let remaining = self.sc(sc).head().amount;
        self.charge_budget(0, remaining, false);
    }

    // ---- kernel replies -----------------------------------------------

    /// Report a completed invocation to a calling invoker. Any reply
    /// words were placed by the commit handler; this stamps the header.
    pub(crate) fn reply_from_kernel_success(&mut self, thread: TcbIx, length: usize) {
        self.hal.set_register(thread, Register::Badge, 0);
        let info = MessageInfo::new(0, 0, 0, length);
        self.hal.set_register(thread, Register::MsgInfo, info.to_word());
    }

    /// Report a failed invocation to a calling invoker: the error label
    /// in the header, its details in the first message words.
    pub(crate) fn reply_from_kernel_error(&mut self, thread: TcbIx, err: SyscallError) {
        let mut words = [0u64; 4];
        let len = match err {
            SyscallError::InvalidCapability { index } | SyscallError::InvalidArgument { index } => {
                words[0] = index as Word;
                1
            }
            SyscallError::RangeError { min, max } => {
                words[0] = min;
                words[1] = max;
                2
            }
            SyscallError::FailedLookup { source, fault } => {
                words[0] = source as Word;
                let (kind, a, b) = crate::ipc::fault::lookup_fault_words(fault);
                words[1] = kind;
                words[2] = a;
                words[3] = b;
                4
            }
            SyscallError::NotEnoughMemory { bytes_available } => {
                words[0] = bytes_available;
                1
            }
            _ => 0,
        };
        for (i, w) in words.iter().enumerate().take(len) {
            self.hal.set_register(thread, Register::Msg(i), *w);
        }
        self.hal.set_register(thread, Register::Badge, 0);
        let info = MessageInfo::new(err.label(), 0, 0, len);
        self.hal.set_register(thread, Register::MsgInfo, info.to_word());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::mock::MockHal;
    use crate::kernel::BootCaps;
    use crate::syscall::decode::cnode_ops;
    use crate::types::{CPtr, Region};

    fn kernel() -> (Kernel<MockHal>, BootCaps) {
        let mut k = Kernel::new(MockHal::new());
        let boot = k.bootstrap(8, Region::new(0x10_0000, 20), 10_000, 0);
        k.schedule();
        k.activate_thread();
        (k, boot)
    }

    /// Stage an invocation in the boot thread's registers and IPC buffer.
    fn prime(
        k: &mut Kernel<MockHal>,
        thread: TcbIx,
        cptr: CPtr,
        label: Word,
        args: &[Word],
        extra: &[CPtr],
    ) {
        k.hal.map_buffer(thread);
        for (i, a) in args.iter().enumerate() {
            if i < MSG_REGISTERS {
                k.hal.set_register(thread, Register::Msg(i), *a);
            } else {
                k.hal.set_ipc_buffer_word(thread, i, *a);
            }
        }
        for (i, c) in extra.iter().enumerate() {
            k.hal.set_ipc_buffer_word(thread, MSG_MAX_LENGTH + i, *c);
        }
        k.hal.set_register(thread, Register::CapPtr, cptr);
        let info = MessageInfo::new(label, 0, extra.len(), args.len());
        k.hal.set_register(thread, Register::MsgInfo, info.to_word());
    }

    #[test]
    fn test_call_copies_capability_between_slots() {
        let (mut k, boot) = kernel();
        let args = [60, 64, 0, 64, CapRights::all().bits() as Word];
        prime(&mut k, boot.tcb, 1, cnode_ops::COPY, &args, &[1]);

        k.handle_syscall(Syscall::Call);

        let dest = boot.cnode_base.add(60);
        assert!(matches!(k.slot(dest).cap, Capability::Thread { .. }));
        let info =
            MessageInfo::from_word(k.hal.get_register(boot.tcb, Register::MsgInfo));
        assert_eq!(info.label, 0);
        assert_eq!(k.tcb(boot.tcb).state, ThreadState::Running);
        assert_eq!(k.cur_thread(), boot.tcb);
    }

    #[test]
    fn test_call_reports_decode_error_to_caller() {
        let (mut k, boot) = kernel();
        // Destination slot 2 already holds the IrqControl capability.
        let args = [2, 64, 0, 64, CapRights::all().bits() as Word];
        prime(&mut k, boot.tcb, 1, cnode_ops::COPY, &args, &[1]);

        k.handle_syscall(Syscall::Call);

        let info =
            MessageInfo::from_word(k.hal.get_register(boot.tcb, Register::MsgInfo));
        assert_eq!(info.label, SyscallError::DeleteFirst.label());
        assert!(matches!(
            k.slot(boot.cnode_base.add(2)).cap,
            Capability::IrqControl
        ));
    }

    #[test]
    fn test_send_swallows_decode_error() {
        let (mut k, boot) = kernel();
        let args = [2, 64, 0, 64, CapRights::all().bits() as Word];
        prime(&mut k, boot.tcb, 1, cnode_ops::COPY, &args, &[1]);
        let request = k.hal.get_register(boot.tcb, Register::MsgInfo);

        k.handle_syscall(Syscall::Send);

        // No reply for a plain send: the request word is untouched.
        assert_eq!(k.hal.get_register(boot.tcb, Register::MsgInfo), request);
        assert_eq!(k.tcb(boot.tcb).state, ThreadState::Running);
    }

    #[test]
    fn test_invoking_empty_slot_faults_the_caller() {
        let (mut k, boot) = kernel();
        prime(&mut k, boot.tcb, 200, 1, &[], &[]);

        k.handle_syscall(Syscall::Call);

        // No fault handler is registered, so the thread is stopped and
        // the idle thread takes over.
        assert_eq!(k.tcb(boot.tcb).state, ThreadState::Inactive);
        assert_eq!(k.cur_thread(), k.core().idle_thread);
    }

    #[test]
    fn test_recv_blocks_caller_on_endpoint() {
        let (mut k, boot) = kernel();
        let ep = k.create_endpoint(Region::new(0x800, 4));
        let slot = boot.cnode_base.add(70);
        k.slot_mut(slot).cap =
            Capability::Endpoint { ep, badge: 0, rights: CapRights::all() };
        k.hal.set_register(boot.tcb, Register::CapPtr, 70);
        k.hal.set_register(boot.tcb, Register::ReplyCPtr, 0);

        k.handle_syscall(Syscall::Recv);

        assert!(matches!(
            k.tcb(boot.tcb).state,
            ThreadState::BlockedOnReceive { ep: blocked, .. } if blocked == ep
        ));
        assert_eq!(k.ep(ep).state, crate::ipc::EpState::Recv);
        assert_eq!(k.cur_thread(), k.core().idle_thread);
    }

    #[test]
    fn test_yield_charges_the_full_head_refill() {
        let (mut k, boot) = kernel();
        assert_eq!(k.sc(boot.sc).consumed, 0);

        k.handle_syscall(Syscall::Yield);

        assert_eq!(k.sc(boot.sc).consumed, 10_000);
        assert_eq!(k.tcb(boot.tcb).state, ThreadState::Running);
        assert_eq!(k.cur_thread(), boot.tcb);
    }

    #[test]
    fn test_timer_irq_reprograms_the_deadline() {
        let (mut k, boot) = kernel();
        k.hal.tick(500);

        k.timer_irq();

        assert!(!k.hal.deadlines.is_empty());
        assert_eq!(k.cur_thread(), boot.tcb);
    }

    #[test]
    fn test_spurious_interrupt_is_masked_and_acked() {
        let (mut k, _) = kernel();
        k.handle_interrupt(17);
        assert_eq!(k.hal.masked_irqs.last(), Some(&(true, 17)));
        assert_eq!(k.hal.acked_irqs.last(), Some(&17));
    }

    #[test]
    fn test_preempted_invocation_stays_restarted() {
        let (mut k, boot) = kernel();
        // A CNode big enough that deleting it exceeds the work quota.
        let victim = k.create_cnode(8, Region::new(0x2000, 13));
        let slot = boot.cnode_base.add(71);
        k.slot_mut(slot).cap =
            Capability::CNode { cnode: victim, radix: 8, guard: 0, guard_bits: 0 };
        k.slot_mut(slot).revocable = true;
        let base = k.cnodes[victim.index()].base;
        for i in 0..256 {
            k.slot_mut(base.add(i)).cap = Capability::IrqHandler { irq: 1 };
        }
        k.hal.irq_pending = true;

        prime(&mut k, boot.tcb, 1, cnode_ops::DELETE, &[71, 64], &[]);
        k.handle_syscall(Syscall::Call);

        // The deletion was cut short: a Zombie marks the remaining work
        // and the thread's program counter was rolled back to re-enter.
        assert!(matches!(k.slot(slot).cap, Capability::Zombie { .. }));
        assert_eq!(k.hal.next_pcs.last().map(|(t, _)| *t), Some(boot.tcb));

        k.hal.irq_pending = false;
        k.handle_syscall(Syscall::Call);
        assert!(k.slot(slot).is_empty());
        assert_eq!(k.tcb(boot.tcb).state, ThreadState::Running);
    }

    #[test]
    fn test_error_reply_carries_detail_words() {
        let (mut k, boot) = kernel();
        k.reply_from_kernel_error(
            boot.tcb,
            SyscallError::RangeError { min: 3, max: 9 },
        );
        let info =
            MessageInfo::from_word(k.hal.get_register(boot.tcb, Register::MsgInfo));
        assert_eq!(info.label, SyscallError::RangeError { min: 3, max: 9 }.label());
        assert_eq!(info.length, 2);
        assert_eq!(k.hal.get_register(boot.tcb, Register::Msg(0)), 3);
        assert_eq!(k.hal.get_register(boot.tcb, Register::Msg(1)), 9);
    }
}
