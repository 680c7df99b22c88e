//! Asynchronous Notifications
//!
//! A notification is a word of badge bits. Signals OR their badge into it
//! and never block; waiting threads drain the accumulated word in one go.
//! A notification can be bound to a thread, letting signals interrupt that
//! thread's endpoint receive, and can carry a scheduling context that is
//! lent to whichever passive thread a signal wakes.

use crate::hal::{Hal, Register};
use crate::kernel::Kernel;
use crate::sched::ThreadState;
use crate::types::{Badge, NtfnIx, Region, ScIx, TcbIx};

/// Notification object state.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum NtfnState {
    #[default]
    Idle,
    /// Threads are queued waiting for a signal.
    Waiting,
    /// Signals have arrived and nobody has collected them yet.
    Active,
}

/// An asynchronous signalling object.
#[derive(Clone, Copy, Debug)]
pub struct Notification {
    pub state: NtfnState,
    /// Accumulated badge bits while `Active`.
    pub badge: Badge,
    pub head: Option<TcbIx>,
    pub tail: Option<TcbIx>,
    /// Thread whose endpoint receives this notification may interrupt.
    pub bound_tcb: Option<TcbIx>,
    /// Scheduling context lent to woken passive threads.
    pub sc: Option<ScIx>,
    pub region: Region,
    pub live: bool,
}

impl Notification {
    pub fn new(region: Region) -> Self {
        Self {
            state: NtfnState::Idle,
            badge: 0,
            head: None,
            tail: None,
            bound_tcb: None,
            sc: None,
            region,
            live: true,
        }
    }
}

impl<H: Hal> Kernel<H> {
    fn ntfn_set_queue(&mut self, ntfn: NtfnIx, queue: (Option<TcbIx>, Option<TcbIx>)) {
        let n = self.ntfn_mut(ntfn);
        n.head = queue.0;
        n.tail = queue.1;
    }

    /// Lend the notification's scheduling context to a woken thread that
    /// has none.
    fn maybe_donate_sched_context(&mut self, thread: TcbIx, ntfn: NtfnIx) {
        if self.tcb(thread).sched_context.is_some() {
            return;
        }
        let Some(sc) = self.ntfn(ntfn).sc else {
            return;
        };
        if self.sc(sc).tcb.is_none() {
            self.sched_context_donate(sc, thread);
            let now = self.cur_time;
            self.sc_mut(sc).unblock_check(now);
            self.sched_context_resume(sc);
        }
    }

    /// Take back a lent scheduling context when its borrower goes to wait
    /// again.
    fn maybe_return_sched_context(&mut self, ntfn: NtfnIx, thread: TcbIx) {
        let Some(sc) = self.ntfn(ntfn).sc else {
            return;
        };
        if self.tcb(thread).sched_context == Some(sc) {
            self.tcb_mut(thread).sched_context = None;
            self.sc_mut(sc).tcb = None;
        }
    }

    /// Deliver a signal: wake a waiter, interrupt the bound thread's
    /// receive, or accumulate the badge for later.
    pub(crate) fn send_signal(&mut self, ntfn: NtfnIx, badge: Badge) {
        match self.ntfn(ntfn).state {
            NtfnState::Idle => {
                let bound = self.ntfn(ntfn).bound_tcb;
                match bound {
                    Some(tcb)
                        if matches!(self.tcb(tcb).state, ThreadState::BlockedOnReceive { .. }) =>
                    {
                        self.cancel_ipc(tcb);
                        self.set_thread_state(tcb, ThreadState::Running);
                        self.hal.set_register(tcb, Register::Badge, badge);
                        self.maybe_donate_sched_context(tcb, ntfn);
                        if self.is_schedulable(tcb) {
                            self.possible_switch_to(tcb);
                        }
                    }
                    _ => {
                        let n = self.ntfn_mut(ntfn);
                        n.state = NtfnState::Active;
                        n.badge = badge;
                    }
                }
            }
            NtfnState::Waiting => {
                let Some(dest) = self.ntfn(ntfn).head else {
                    return;
                };
                let queue = (self.ntfn(ntfn).head, self.ntfn(ntfn).tail);
                let queue = self.wait_queue_remove(queue, dest);
                self.ntfn_set_queue(ntfn, queue);
                if queue.0.is_none() {
                    self.ntfn_mut(ntfn).state = NtfnState::Idle;
                }
                self.set_thread_state(dest, ThreadState::Running);
                self.hal.set_register(dest, Register::Badge, badge);
                self.maybe_donate_sched_context(dest, ntfn);
                if self.is_schedulable(dest) {
                    self.possible_switch_to(dest);
                }
            }
            NtfnState::Active => {
                self.ntfn_mut(ntfn).badge |= badge;
            }
        }
    }

    /// Wait for a signal on behalf of `thread`.
    pub(crate) fn receive_signal(&mut self, thread: TcbIx, ntfn: NtfnIx, is_blocking: bool) {
        match self.ntfn(ntfn).state {
            NtfnState::Idle | NtfnState::Waiting => {
                if is_blocking {
                    self.set_thread_state(thread, ThreadState::BlockedOnNotification { ntfn });
                    self.maybe_return_sched_context(ntfn, thread);
                    let queue = (self.ntfn(ntfn).head, self.ntfn(ntfn).tail);
                    let queue = self.wait_queue_insert(queue, thread);
                    self.ntfn_mut(ntfn).state = NtfnState::Waiting;
                    self.ntfn_set_queue(ntfn, queue);
                } else {
                    self.hal.set_register(thread, Register::Badge, 0);
                }
            }
            NtfnState::Active => {
                let badge = self.ntfn(ntfn).badge;
                self.hal.set_register(thread, Register::Badge, badge);
                self.ntfn_mut(ntfn).state = NtfnState::Idle;
                self.maybe_donate_sched_context(thread, ntfn);
            }
        }
    }

    /// Hand an already-arrived signal to the bound thread.
    pub(crate) fn complete_signal(&mut self, ntfn: NtfnIx, thread: TcbIx) {
        debug_assert_eq!(self.ntfn(ntfn).state, NtfnState::Active);
        let badge = self.ntfn(ntfn).badge;
        self.hal.set_register(thread, Register::Badge, badge);
        self.ntfn_mut(ntfn).state = NtfnState::Idle;
        self.maybe_donate_sched_context(thread, ntfn);
    }

    /// Withdraw a thread from a notification's wait queue.
    pub(crate) fn cancel_signal(&mut self, thread: TcbIx, ntfn: NtfnIx) {
        let queue = (self.ntfn(ntfn).head, self.ntfn(ntfn).tail);
        let queue = self.wait_queue_remove(queue, thread);
        self.ntfn_set_queue(ntfn, queue);
        if queue.0.is_none() {
            self.ntfn_mut(ntfn).state = NtfnState::Idle;
        }
        self.set_thread_state(thread, ThreadState::Inactive);
    }

    /// Restart every waiter; used when the notification is destroyed.
    pub(crate) fn cancel_all_signals(&mut self, ntfn: NtfnIx) {
        if self.ntfn(ntfn).state != NtfnState::Waiting {
            return;
        }
        let mut cursor = self.ntfn(ntfn).head;
        {
            let n = self.ntfn_mut(ntfn);
            n.state = NtfnState::Idle;
            n.head = None;
            n.tail = None;
        }
        while let Some(thread) = cursor {
            cursor = self.tcb(thread).ep_next;
            self.tcb_mut(thread).ep_prev = None;
            self.tcb_mut(thread).ep_next = None;
            self.set_thread_state(thread, ThreadState::Restart);
            self.possible_switch_to(thread);
        }
        self.reschedule_required();
    }

    /// Bind a notification to a thread one-to-one.
    pub(crate) fn bind_notification(&mut self, thread: TcbIx, ntfn: NtfnIx) {
        self.ntfn_mut(ntfn).bound_tcb = Some(thread);
        self.tcb_mut(thread).bound_notification = Some(ntfn);
    }

    /// Drop the binding from the thread side.
    pub(crate) fn unbind_notification(&mut self, thread: TcbIx) {
        if let Some(ntfn) = self.tcb(thread).bound_notification {
            self.ntfn_mut(ntfn).bound_tcb = None;
            self.tcb_mut(thread).bound_notification = None;
        }
    }

    /// Drop the binding from the notification side.
    pub(crate) fn unbind_maybe_notification(&mut self, ntfn: NtfnIx) {
        if let Some(tcb) = self.ntfn(ntfn).bound_tcb {
            self.ntfn_mut(ntfn).bound_tcb = None;
            self.tcb_mut(tcb).bound_notification = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MAX_REFILLS, SC_BITS, TCB_BITS};
    use crate::hal::mock::MockHal;
    use crate::types::Prio;

    fn kernel() -> Kernel<MockHal> {
        Kernel::new(MockHal::new())
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

    #[test]
    fn test_signal_with_no_waiter_accumulates_badges() {
        let mut k = kernel();
        let ntfn = k.create_notification(Region::new(0, 5));
        k.send_signal(ntfn, 0b0001);
        k.send_signal(ntfn, 0b0100);
        assert_eq!(k.ntfn(ntfn).state, NtfnState::Active);
        assert_eq!(k.ntfn(ntfn).badge, 0b0101);

        // The next wait drains everything at once.
        let t = spawn(&mut k, 5);
        k.receive_signal(t, ntfn, true);
        assert_eq!(k.hal.get_register(t, Register::Badge), 0b0101);
        assert_eq!(k.ntfn(ntfn).state, NtfnState::Idle);
    }

    #[test]
    fn test_signal_wakes_queued_waiter() {
        let mut k = kernel();
        let ntfn = k.create_notification(Region::new(0, 5));
        let t = spawn(&mut k, 5);
        k.receive_signal(t, ntfn, true);
        assert_eq!(k.ntfn(ntfn).state, NtfnState::Waiting);
        assert!(matches!(k.tcb(t).state, ThreadState::BlockedOnNotification { .. }));

        k.send_signal(ntfn, 9);
        assert_eq!(k.tcb(t).state, ThreadState::Running);
        assert_eq!(k.hal.get_register(t, Register::Badge), 9);
        assert_eq!(k.ntfn(ntfn).state, NtfnState::Idle);
    }

    #[test]
    fn test_nonblocking_wait_returns_zero_badge() {
        let mut k = kernel();
        let ntfn = k.create_notification(Region::new(0, 5));
        let t = spawn(&mut k, 5);
        k.hal.set_register(t, Register::Badge, 0xff);
        k.receive_signal(t, ntfn, false);
        assert_eq!(k.tcb(t).state, ThreadState::Running);
        assert_eq!(k.hal.get_register(t, Register::Badge), 0);
    }

    #[test]
    fn test_signal_interrupts_bound_receive() {
        let mut k = kernel();
        let ntfn = k.create_notification(Region::new(0, 5));
        let t = spawn(&mut k, 5);
        let ep = k.create_endpoint(Region::new(0, 4));
        k.bind_notification(t, ntfn);
        k.receive_ipc(t, ep, true, None);
        assert!(matches!(k.tcb(t).state, ThreadState::BlockedOnReceive { .. }));

        k.send_signal(ntfn, 3);
        assert_eq!(k.tcb(t).state, ThreadState::Running);
        assert_eq!(k.hal.get_register(t, Register::Badge), 3);
        // The endpoint queue was cleaned up on the way out.
        assert_eq!(k.ep(ep).state, crate::ipc::EpState::Idle);
    }

    #[test]
    fn test_bound_thread_in_call_does_not_wake() {
        let mut k = kernel();
        let ntfn = k.create_notification(Region::new(0, 5));
        let t = spawn(&mut k, 5);
        k.bind_notification(t, ntfn);
        let reply = k.create_reply(Region::new(0, 5));
        k.tcb_mut(t).state = ThreadState::BlockedOnReply { reply };

        k.send_signal(ntfn, 3);
        // Signal is stored, the mid-call thread stays blocked.
        assert!(matches!(k.tcb(t).state, ThreadState::BlockedOnReply { .. }));
        assert_eq!(k.ntfn(ntfn).state, NtfnState::Active);
    }

    #[test]
    fn test_sched_context_donation_to_passive_waiter() {
        let mut k = kernel();
        let ntfn = k.create_notification(Region::new(0, 5));
        let sc = k.create_sc(Region::new(0, SC_BITS));
        let now = k.cur_time;
        k.sc_mut(sc).refill_new(MAX_REFILLS, 10_000, 100_000, now);
        k.ntfn_mut(ntfn).sc = Some(sc);

        // A passive thread: runnable state but no context of its own.
        let t = k.create_tcb(Region::new(0, TCB_BITS));
        k.tcb_mut(t).state = ThreadState::Running;
        k.receive_signal(t, ntfn, true);

        k.send_signal(ntfn, 1);
        assert_eq!(k.tcb(t).sched_context, Some(sc));
        assert_eq!(k.sc(sc).tcb, Some(t));

        // Waiting again returns the lent context.
        k.receive_signal(t, ntfn, true);
        assert_eq!(k.tcb(t).sched_context, None);
        assert_eq!(k.sc(sc).tcb, None);
    }
}
