//! Synchronous Endpoints
//!
//! An endpoint is a rendezvous point in one of three states: idle, a
//! queue of blocked senders, or a queue of blocked receivers. Its queue
//! is intrusive through the thread control blocks and kept in descending
//! priority order, FIFO among equals.

use crate::hal::{Hal, Register};
use crate::kernel::Kernel;
use crate::sched::ThreadState;
use crate::types::{Badge, EpIx, NtfnIx, Region, ReplyIx, TcbIx};

/// Endpoint queue state. The queue only ever holds one kind of thread.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum EpState {
    #[default]
    Idle,
    /// Queue holds blocked senders.
    Send,
    /// Queue holds blocked receivers.
    Recv,
}

/// A synchronous IPC endpoint.
#[derive(Clone, Copy, Debug)]
pub struct Endpoint {
    pub state: EpState,
    pub head: Option<TcbIx>,
    pub tail: Option<TcbIx>,
    pub region: Region,
    pub live: bool,
}

impl Endpoint {
    pub fn new(region: Region) -> Self {
        Self {
            state: EpState::Idle,
            head: None,
            tail: None,
            region,
            live: true,
        }
    }
}

/// An intrusive wait queue snapshot (endpoint or notification).
pub(crate) type WaitQueue = (Option<TcbIx>, Option<TcbIx>);

impl<H: Hal> Kernel<H> {
    /// Insert a thread into a wait queue: after every thread of equal or
    /// higher priority, before any of lower priority.
    pub(crate) fn wait_queue_insert(&mut self, queue: WaitQueue, thread: TcbIx) -> WaitQueue {
        let prio = self.tcb(thread).prio;
        let (mut head, mut tail) = queue;

        let mut after = tail;
        while let Some(a) = after {
            if self.tcb(a).prio >= prio {
                break;
            }
            after = self.tcb(a).ep_prev;
        }

        match after {
            None => {
                self.tcb_mut(thread).ep_prev = None;
                self.tcb_mut(thread).ep_next = head;
                match head {
                    Some(h) => self.tcb_mut(h).ep_prev = Some(thread),
                    None => tail = Some(thread),
                }
                head = Some(thread);
            }
            Some(a) => {
                let next = self.tcb(a).ep_next;
                self.tcb_mut(thread).ep_prev = Some(a);
                self.tcb_mut(thread).ep_next = next;
                self.tcb_mut(a).ep_next = Some(thread);
                match next {
                    Some(n) => self.tcb_mut(n).ep_prev = Some(thread),
                    None => tail = Some(thread),
                }
            }
        }
        (head, tail)
    }

    /// Unlink a thread from a wait queue.
    pub(crate) fn wait_queue_remove(&mut self, queue: WaitQueue, thread: TcbIx) -> WaitQueue {
        let (mut head, mut tail) = queue;
        let (prev, next) = (self.tcb(thread).ep_prev, self.tcb(thread).ep_next);
        match prev {
            Some(p) => self.tcb_mut(p).ep_next = next,
            None => head = next,
        }
        match next {
            Some(n) => self.tcb_mut(n).ep_prev = prev,
            None => tail = prev,
        }
        self.tcb_mut(thread).ep_prev = None;
        self.tcb_mut(thread).ep_next = None;
        (head, tail)
    }

    fn ep_set_queue(&mut self, ep: EpIx, queue: WaitQueue) {
        let e = self.ep_mut(ep);
        e.head = queue.0;
        e.tail = queue.1;
    }

    /// Send a message through an endpoint on behalf of `thread`.
    ///
    /// With no receiver waiting, a blocking send parks the sender on the
    /// endpoint; a non-blocking send vanishes without a trace. With a
    /// receiver present the transfer happens immediately and the reply
    /// path or scheduling-context donation is set up as requested.
    pub(crate) fn send_ipc(
        &mut self,
        blocking: bool,
        do_call: bool,
        badge: Badge,
        can_grant: bool,
        can_grant_reply: bool,
        can_donate: bool,
        thread: TcbIx,
        ep: EpIx,
    ) {
        match self.ep(ep).state {
            EpState::Idle | EpState::Send => {
                if blocking {
                    self.set_thread_state(
                        thread,
                        ThreadState::BlockedOnSend {
                            ep,
                            badge,
                            can_grant,
                            can_grant_reply,
                            is_call: do_call,
                        },
                    );
                    let queue = (self.ep(ep).head, self.ep(ep).tail);
                    let queue = self.wait_queue_insert(queue, thread);
                    self.ep_mut(ep).state = EpState::Send;
                    self.ep_set_queue(ep, queue);
                }
            }
            EpState::Recv => {
                let Some(dest) = self.ep(ep).head else {
                    return;
                };
                let queue = (self.ep(ep).head, self.ep(ep).tail);
                let queue = self.wait_queue_remove(queue, dest);
                self.ep_set_queue(ep, queue);
                if queue.0.is_none() {
                    self.ep_mut(ep).state = EpState::Idle;
                }

                self.do_ipc_transfer(thread, Some(ep), badge, can_grant, dest);

                let reply = match self.tcb(dest).state {
                    ThreadState::BlockedOnReceive { reply, .. } => reply,
                    _ => None,
                };
                if let Some(r) = reply {
                    self.reply_unlink(r);
                }

                if do_call || self.tcb(thread).fault.is_some() {
                    match reply {
                        Some(r) if can_grant || can_grant_reply => {
                            self.reply_push(thread, dest, r, can_donate);
                        }
                        _ => self.set_thread_state(thread, ThreadState::Inactive),
                    }
                } else if can_donate && self.tcb(dest).sched_context.is_none() {
                    if let Some(sc) = self.tcb(thread).sched_context {
                        self.sched_context_donate(sc, dest);
                    }
                }

                self.set_thread_state(dest, ThreadState::Running);
                self.possible_switch_to(dest);
            }
        }
    }

    /// Receive a message through an endpoint on behalf of `thread`,
    /// optionally offering `reply` for the sender's reply path.
    ///
    /// An active bound notification takes precedence over the endpoint.
    pub(crate) fn receive_ipc(
        &mut self,
        thread: TcbIx,
        ep: EpIx,
        is_blocking: bool,
        reply: Option<ReplyIx>,
    ) {
        // An unexecuted reply pins its caller; receiving with the same
        // reply object evicts them.
        if let Some(r) = reply {
            if let Some(pinned) = self.reply(r).tcb {
                if pinned != thread {
                    log::warn!("reply object reused while a reply was outstanding");
                    self.cancel_ipc(pinned);
                }
            }
        }

        if let Some(ntfn) = self.tcb(thread).bound_notification {
            if self.ntfn(ntfn).state == super::notification::NtfnState::Active {
                self.complete_signal(ntfn, thread);
                return;
            }
        }

        match self.ep(ep).state {
            EpState::Idle | EpState::Recv => {
                if is_blocking {
                    self.set_thread_state(thread, ThreadState::BlockedOnReceive { ep, reply });
                    if let Some(r) = reply {
                        self.reply_mut(r).tcb = Some(thread);
                    }
                    let queue = (self.ep(ep).head, self.ep(ep).tail);
                    let queue = self.wait_queue_insert(queue, thread);
                    self.ep_mut(ep).state = EpState::Recv;
                    self.ep_set_queue(ep, queue);
                } else {
                    self.hal.set_register(thread, Register::Badge, 0);
                }
            }
            EpState::Send => {
                let Some(sender) = self.ep(ep).head else {
                    return;
                };
                let queue = (self.ep(ep).head, self.ep(ep).tail);
                let queue = self.wait_queue_remove(queue, sender);
                self.ep_set_queue(ep, queue);
                if queue.0.is_none() {
                    self.ep_mut(ep).state = EpState::Idle;
                }

                let (badge, can_grant, can_grant_reply, is_call) = match self.tcb(sender).state {
                    ThreadState::BlockedOnSend {
                        badge,
                        can_grant,
                        can_grant_reply,
                        is_call,
                        ..
                    } => (badge, can_grant, can_grant_reply, is_call),
                    _ => (0, false, false, false),
                };

                self.do_ipc_transfer(sender, Some(ep), badge, can_grant, thread);

                if is_call || self.tcb(sender).fault.is_some() {
                    match reply {
                        Some(r) if can_grant || can_grant_reply => {
                            let donate = self.tcb(sender).sched_context.is_some();
                            self.reply_push(sender, thread, r, donate);
                        }
                        _ => self.set_thread_state(sender, ThreadState::Inactive),
                    }
                } else {
                    self.set_thread_state(sender, ThreadState::Running);
                    self.possible_switch_to(sender);
                }
            }
        }
    }

    /// Pull a thread out of whatever IPC rendezvous it is blocked in.
    /// Discards any fault it was about to deliver.
    pub(crate) fn cancel_ipc(&mut self, thread: TcbIx) {
        self.tcb_mut(thread).fault = None;
        match self.tcb(thread).state {
            ThreadState::BlockedOnSend { ep, .. } => {
                self.blocked_ipc_cancel(thread, ep, None);
            }
            ThreadState::BlockedOnReceive { ep, reply } => {
                self.blocked_ipc_cancel(thread, ep, reply);
            }
            ThreadState::BlockedOnNotification { ntfn } => {
                self.cancel_signal(thread, ntfn);
            }
            ThreadState::BlockedOnReply { reply } => {
                self.reply_remove_tcb(thread, reply);
            }
            _ => {}
        }
    }

    fn blocked_ipc_cancel(&mut self, thread: TcbIx, ep: EpIx, reply: Option<ReplyIx>) {
        let queue = (self.ep(ep).head, self.ep(ep).tail);
        let queue = self.wait_queue_remove(queue, thread);
        self.ep_set_queue(ep, queue);
        if queue.0.is_none() {
            self.ep_mut(ep).state = EpState::Idle;
        }
        if let Some(r) = reply {
            self.reply_unlink(r);
        }
        self.set_thread_state(thread, ThreadState::Inactive);
    }

    /// Empty an endpoint, restarting every fault-free thread it blocked.
    pub(crate) fn cancel_all_ipc(&mut self, ep: EpIx) {
        if self.ep(ep).state == EpState::Idle {
            return;
        }
        let mut cursor = self.ep(ep).head;
        {
            let e = self.ep_mut(ep);
            e.state = EpState::Idle;
            e.head = None;
            e.tail = None;
        }
        while let Some(thread) = cursor {
            cursor = self.tcb(thread).ep_next;
            self.tcb_mut(thread).ep_prev = None;
            self.tcb_mut(thread).ep_next = None;
            let reply = match self.tcb(thread).state {
                ThreadState::BlockedOnReceive { reply, .. } => reply,
                _ => None,
            };
            if let Some(r) = reply {
                self.reply_unlink(r);
            }
            if self.tcb(thread).fault.is_none() {
                self.set_thread_state(thread, ThreadState::Restart);
                self.possible_switch_to(thread);
            } else {
                self.set_thread_state(thread, ThreadState::Inactive);
            }
        }
        self.reschedule_required();
    }

    /// Restart exactly the senders blocked with a matching badge; used to
    /// retire a badge before reusing it.
    pub(crate) fn cancel_badged_sends(&mut self, ep: EpIx, badge: Badge) {
        if self.ep(ep).state != EpState::Send {
            return;
        }
        let mut queue = (self.ep(ep).head, self.ep(ep).tail);
        {
            let e = self.ep_mut(ep);
            e.state = EpState::Idle;
            e.head = None;
            e.tail = None;
        }

        let mut cursor = queue.0;
        while let Some(thread) = cursor {
            cursor = self.tcb(thread).ep_next;
            let blocked_badge = match self.tcb(thread).state {
                ThreadState::BlockedOnSend { badge, .. } => badge,
                _ => continue,
            };
            if blocked_badge == badge {
                queue = self.wait_queue_remove(queue, thread);
                if self.tcb(thread).fault.is_none() {
                    self.set_thread_state(thread, ThreadState::Restart);
                    self.possible_switch_to(thread);
                } else {
                    self.set_thread_state(thread, ThreadState::Inactive);
                }
            }
        }

        self.ep_set_queue(ep, queue);
        if queue.0.is_some() {
            self.ep_mut(ep).state = EpState::Send;
        }
        self.reschedule_required();
    }

    /// Re-place a thread whose priority changed within its endpoint queue.
    pub(crate) fn reorder_ep(&mut self, ep: EpIx, thread: TcbIx) {
        let queue = (self.ep(ep).head, self.ep(ep).tail);
        let queue = self.wait_queue_remove(queue, thread);
        let queue = self.wait_queue_insert(queue, thread);
        self.ep_set_queue(ep, queue);
    }

    /// Re-place a thread whose priority changed within its notification
    /// queue.
    pub(crate) fn reorder_ntfn(&mut self, ntfn: NtfnIx, thread: TcbIx) {
        let queue = (self.ntfn(ntfn).head, self.ntfn(ntfn).tail);
        let queue = self.wait_queue_remove(queue, thread);
        let queue = self.wait_queue_insert(queue, thread);
        let n = self.ntfn_mut(ntfn);
        n.head = queue.0;
        n.tail = queue.1;
    }
}
