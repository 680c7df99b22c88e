//! Reply Objects and Call Stacks
//!
//! A reply object is the one-shot right to answer a blocked caller. When
//! a call donates the caller's scheduling context to a passive server,
//! the reply is also pushed onto that context's call stack, so nested
//! calls unwind the donation in order even if a middle link is destroyed.
//!
//! Stack shape: `prev` points towards older replies, `next` towards newer
//! ones; the newest reply carries `sc` instead of a `next` link.

use crate::hal::Hal;
use crate::kernel::Kernel;
use crate::sched::ThreadState;
use crate::types::{Region, ReplyIx, TcbIx};

/// The callee-side handle for answering one call.
#[derive(Clone, Copy, Debug)]
pub struct Reply {
    /// The caller blocked waiting on this reply, if any.
    pub tcb: Option<TcbIx>,
    /// Older neighbour in the call stack.
    pub prev: Option<ReplyIx>,
    /// Newer neighbour in the call stack; `None` at the head.
    pub next: Option<ReplyIx>,
    /// The donated scheduling context; set only at the stack head.
    pub sc: Option<crate::types::ScIx>,
    pub region: Region,
    pub live: bool,
}

impl Reply {
    pub fn new(region: Region) -> Self {
        Self {
            tcb: None,
            prev: None,
            next: None,
            sc: None,
            region,
            live: true,
        }
    }
}

impl<H: Hal> Kernel<H> {
    /// Detach a reply from its blocked caller, leaving the caller
    /// inactive.
    pub(crate) fn reply_unlink(&mut self, reply: ReplyIx) {
        if let Some(tcb) = self.reply(reply).tcb {
            self.reply_mut(reply).tcb = None;
            if let ThreadState::BlockedOnReceive { ep, .. } = self.tcb(tcb).state {
                self.tcb_mut(tcb).state = ThreadState::BlockedOnReceive { ep, reply: None };
            } else {
                self.set_thread_state(tcb, ThreadState::Inactive);
            }
        }
    }

    /// Block `caller` on `reply` and, when the callee is passive and the
    /// caller agrees, push the reply onto the donated context's call
    /// stack.
    pub(crate) fn reply_push(
        &mut self,
        caller: TcbIx,
        callee: TcbIx,
        reply: ReplyIx,
        can_donate: bool,
    ) {
        debug_assert!(self.reply(reply).tcb.is_none());
        let donated_sc = self.tcb(caller).sched_context;

        self.reply_mut(reply).tcb = Some(caller);
        self.set_thread_state(caller, ThreadState::BlockedOnReply { reply });

        if let Some(sc) = donated_sc {
            if can_donate && self.tcb(callee).sched_context.is_none() {
                let old_head = self.sc(sc).reply;
                self.reply_mut(reply).prev = old_head;
                if let Some(old) = old_head {
                    self.reply_mut(old).next = Some(reply);
                    self.reply_mut(old).sc = None;
                }
                self.reply_mut(reply).sc = Some(sc);
                self.sc_mut(sc).reply = Some(reply);

                self.sched_context_donate(sc, callee);
            }
        }
    }

    /// Pop the head of a call stack, returning the context to the caller
    /// if it has none of its own.
    pub(crate) fn reply_pop(&mut self, reply: ReplyIx, tcb: TcbIx) {
        debug_assert_eq!(self.reply(reply).tcb, Some(tcb));

        self.reply_mut(reply).tcb = None;
        if matches!(self.tcb(tcb).state, ThreadState::BlockedOnReply { .. }) {
            self.tcb_mut(tcb).state = ThreadState::Inactive;
        }

        if let Some(sc) = self.reply(reply).sc {
            let prev = self.reply(reply).prev;
            self.sc_mut(sc).reply = prev;
            if let Some(p) = prev {
                self.reply_mut(p).next = None;
                self.reply_mut(p).sc = Some(sc);
            }
            if self.tcb(tcb).sched_context.is_none() {
                self.sched_context_donate(sc, tcb);
            }
            self.reply_mut(reply).sc = None;
        }
        self.reply_mut(reply).prev = None;
        self.reply_mut(reply).next = None;
    }

    /// Remove a reply from wherever it sits in a call stack. A middle
    /// removal breaks the chain rather than re-splicing it: the donation
    /// below it can no longer unwind through the gap.
    pub(crate) fn reply_remove(&mut self, reply: ReplyIx) {
        let Some(tcb) = self.reply(reply).tcb else {
            return;
        };
        if self.reply(reply).sc.is_some() {
            self.reply_pop(reply, tcb);
            return;
        }
        let (prev, next) = (self.reply(reply).prev, self.reply(reply).next);
        if let Some(n) = next {
            self.reply_mut(n).prev = None;
        }
        if let Some(p) = prev {
            self.reply_mut(p).next = None;
        }
        self.reply_mut(reply).prev = None;
        self.reply_mut(reply).next = None;
        self.reply_mut(reply).tcb = None;
        self.set_thread_state(tcb, ThreadState::Inactive);
    }

    /// Unwind a thread's reply linkage when the thread itself goes away.
    pub(crate) fn reply_remove_tcb(&mut self, tcb: TcbIx, reply: ReplyIx) {
        let (prev, next, sc) = {
            let r = self.reply(reply);
            (r.prev, r.next, r.sc)
        };
        if let Some(s) = sc {
            self.sc_mut(s).reply = None;
        } else if let Some(n) = next {
            self.reply_mut(n).prev = None;
        }
        if let Some(p) = prev {
            self.reply_mut(p).next = None;
        }
        {
            let r = self.reply_mut(reply);
            r.prev = None;
            r.next = None;
            r.sc = None;
            r.tcb = None;
        }
        self.set_thread_state(tcb, ThreadState::Inactive);
    }

    /// Answer the call held by `reply`: transfer the message (or the
    /// fault verdict), pop the call stack, and resume the caller.
    pub(crate) fn do_reply_transfer(&mut self, sender: TcbIx, reply: ReplyIx, grant: bool) {
        let Some(receiver) = self.reply(reply).tcb else {
            return;
        };
        if !matches!(self.tcb(receiver).state, ThreadState::BlockedOnReply { .. }) {
            return;
        }

        self.reply_pop(reply, receiver);

        let fault = self.tcb(receiver).fault;
        match fault {
            None => {
                self.do_ipc_transfer(sender, None, 0, grant, receiver);
                self.set_thread_state(receiver, ThreadState::Running);
            }
            Some(_) => {
                let restart = self.handle_fault_reply(receiver, sender);
                self.tcb_mut(receiver).fault = None;
                if restart {
                    self.set_thread_state(receiver, ThreadState::Restart);
                } else {
                    self.set_thread_state(receiver, ThreadState::Inactive);
                }
            }
        }

        if let Some(sc) = self.tcb(receiver).sched_context {
            if self.tcb(receiver).state.is_runnable() {
                let now = self.cur_time;
                let timed_out_fault =
                    matches!(fault, Some(super::fault::Fault::Timeout { .. }));
                if self.sc(sc).ready(now) && self.sc(sc).sufficient(0) {
                    self.possible_switch_to(receiver);
                } else if self.valid_timeout_handler(receiver) && !timed_out_fault {
                    let badge = self.sc(sc).badge;
                    self.handle_timeout(receiver, badge);
                } else {
                    self.postpone(sc);
                }
            }
        }
    }
}
