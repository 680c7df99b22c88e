//! Scheduling Decisions and Time Accounting
//!
//! Every kernel entry ends by calling [`Kernel::schedule`], which commits
//! the deferred scheduler action for the entering core, switches the
//! charged scheduling context, and reprograms the deadline timer when
//! needed. Preemption is driven entirely by that timer: it fires at the
//! earliest of budget expiry, domain-slice expiry and the next release
//! wake-up.
//!
//! # Design
//! - The scheduler action collapses the common IPC pattern (block the
//!   sender, wake the receiver) into a direct switch without touching the
//!   ready queues
//! - A thread is schedulable only when runnable, bound to an active
//!   scheduling context and not parked in the release queue
//! - Cross-core wake-ups enqueue remotely and post a reschedule IPI; a
//!   core's queues are otherwise only popped by that core

use crate::config::{DOM_SCHEDULE, MIN_BUDGET, NUM_DOMAINS};
use crate::hal::Hal;
use crate::kernel::Kernel;
use crate::sched::tcb::ThreadState;
use crate::types::{Domain, Prio, ScIx, TcbIx, Ticks};

/// Deferred scheduling decision for one core.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SchedulerAction {
    /// Nothing woke anything more urgent; keep running the current thread.
    ResumeCurrentThread,
    /// The current thread blocked or something changed globally; scan the
    /// ready queues.
    ChooseNewThread,
    /// A single candidate was woken; switch straight to it if the policy
    /// check passes.
    SwitchToThread(TcbIx),
}

impl<H: Hal> Kernel<H> {
    /// Whether `thread` may be given the processor right now.
    pub(crate) fn is_schedulable(&self, thread: TcbIx) -> bool {
        let tcb = self.tcb(thread);
        if !tcb.state.is_runnable() || tcb.in_release_queue {
            return false;
        }
        match tcb.sched_context {
            Some(sc) => self.sc(sc).active(),
            None => false,
        }
    }

    /// Change a thread's lifecycle state and fold the consequence into the
    /// pending scheduler action.
    pub(crate) fn set_thread_state(&mut self, thread: TcbIx, state: ThreadState) {
        self.tcb_mut(thread).state = state;
        self.schedule_tcb(thread);
    }

    /// If the current thread just became unschedulable, force a rescan.
    pub(crate) fn schedule_tcb(&mut self, thread: TcbIx) {
        if thread == self.cur_thread()
            && self.core().action == SchedulerAction::ResumeCurrentThread
            && !self.is_schedulable(thread)
        {
            self.reschedule_required();
        }
    }

    /// Demote any pending direct-switch candidate to the ready queues and
    /// force a full queue scan at kernel exit.
    pub(crate) fn reschedule_required(&mut self) {
        if let SchedulerAction::SwitchToThread(candidate) = self.core().action {
            if self.is_schedulable(candidate) {
                self.sched_enqueue(candidate);
            }
        }
        self.core_mut().action = SchedulerAction::ChooseNewThread;
    }

    /// Offer the processor to a thread that just became runnable.
    pub(crate) fn possible_switch_to(&mut self, target: TcbIx) {
        let tcb = self.tcb(target);
        if tcb.sched_context.is_none() || tcb.in_release_queue {
            return;
        }
        let (target_dom, target_core) = (tcb.domain, tcb.affinity);

        if self.cur_domain != target_dom || target_core != self.current_core {
            self.sched_enqueue(target);
        } else if self.core().action != SchedulerAction::ResumeCurrentThread {
            // Two candidates raced; fall back to the queues for both.
            self.reschedule_required();
            self.sched_enqueue(target);
        } else {
            self.core_mut().action = SchedulerAction::SwitchToThread(target);
        }
    }

    // ---- ready-queue plumbing ----------------------------------------

    pub(crate) fn sched_enqueue(&mut self, thread: TcbIx) {
        debug_assert!(self.is_schedulable(thread));
        let core = self.tcb(thread).affinity;
        self.cores[core].ready.enqueue(&mut self.tcbs, thread);
        if core != self.current_core {
            self.hal.send_reschedule_ipi(core);
        }
    }

    pub(crate) fn sched_append(&mut self, thread: TcbIx) {
        debug_assert!(self.is_schedulable(thread));
        let core = self.tcb(thread).affinity;
        self.cores[core].ready.append(&mut self.tcbs, thread);
        if core != self.current_core {
            self.hal.send_reschedule_ipi(core);
        }
    }

    pub(crate) fn sched_dequeue(&mut self, thread: TcbIx) {
        let core = self.tcb(thread).affinity;
        self.cores[core].ready.dequeue(&mut self.tcbs, thread);
    }

    fn is_highest_prio(&self, dom: Domain, prio: Prio) -> bool {
        match self.core().ready.highest_prio(dom) {
            Some(highest) => prio >= highest,
            None => true,
        }
    }

    // ---- release queue ------------------------------------------------

    /// Park a thread until its head refill activates. The queue is kept
    /// ordered by activation time; a new front entry forces a timer
    /// reprogram.
    pub(crate) fn release_enqueue(&mut self, thread: TcbIx) {
        let Some(sc) = self.tcb(thread).sched_context else {
            return;
        };
        let time = self.sc(sc).head().time;
        let core = self.tcb(thread).affinity;

        let mut prev: Option<TcbIx> = None;
        let mut cursor = self.cores[core].release_head;
        while let Some(c) = cursor {
            let c_time = match self.tcb(c).sched_context {
                Some(c_sc) => self.sc(c_sc).head().time,
                None => 0,
            };
            if time < c_time {
                break;
            }
            prev = Some(c);
            cursor = self.tcb(c).release_next;
        }

        self.tcb_mut(thread).release_next = cursor;
        self.tcb_mut(thread).in_release_queue = true;
        match prev {
            Some(p) => self.tcb_mut(p).release_next = Some(thread),
            None => {
                self.cores[core].release_head = Some(thread);
                self.cores[core].reprogram = true;
            }
        }
    }

    /// Pop the earliest release-queue entry on the entering core.
    fn release_dequeue(&mut self) -> Option<TcbIx> {
        let head = self.core().release_head?;
        let next = self.tcb(head).release_next;
        self.core_mut().release_head = next;
        self.tcb_mut(head).release_next = None;
        self.tcb_mut(head).in_release_queue = false;
        self.core_mut().reprogram = true;
        Some(head)
    }

    /// Unlink a thread from its core's release queue, wherever it sits.
    pub(crate) fn release_remove(&mut self, thread: TcbIx) {
        if !self.tcb(thread).in_release_queue {
            return;
        }
        let core = self.tcb(thread).affinity;
        let mut prev: Option<TcbIx> = None;
        let mut cursor = self.cores[core].release_head;
        while let Some(c) = cursor {
            if c == thread {
                let next = self.tcb(thread).release_next;
                match prev {
                    Some(p) => self.tcb_mut(p).release_next = next,
                    None => {
                        self.cores[core].release_head = next;
                        self.cores[core].reprogram = true;
                    }
                }
                break;
            }
            prev = Some(c);
            cursor = self.tcb(c).release_next;
        }
        self.tcb_mut(thread).release_next = None;
        self.tcb_mut(thread).in_release_queue = false;
    }

    /// Wake every released thread whose head refill has activated.
    pub(crate) fn awaken(&mut self) {
        loop {
            let Some(head) = self.core().release_head else {
                break;
            };
            let ready = match self.tcb(head).sched_context {
                Some(sc) => self.sc(sc).ready(self.cur_time),
                None => true,
            };
            if !ready {
                break;
            }
            if let Some(awakened) = self.release_dequeue() {
                self.possible_switch_to(awakened);
            }
        }
    }

    // ---- the decision function ---------------------------------------

    /// Commit the pending scheduler action, switch the charged scheduling
    /// context and rearm the deadline timer. Called on every kernel exit.
    pub fn schedule(&mut self) {
        self.awaken();

        let action = self.core().action;
        if let SchedulerAction::SwitchToThread(candidate) = action {
            let cur = self.cur_thread();
            let was_schedulable = self.is_schedulable(cur);
            if was_schedulable {
                self.sched_enqueue(cur);
            }
            let cand_prio = self.tcb(candidate).prio;
            let cur_prio = self.tcb(cur).prio;
            let fastfail = cur == self.core().idle_thread || cand_prio < cur_prio;

            if fastfail && !self.is_highest_prio(self.cur_domain, cand_prio) {
                self.sched_enqueue(candidate);
                self.core_mut().action = SchedulerAction::ChooseNewThread;
                self.schedule_choose_new_thread();
            } else if was_schedulable && cand_prio == cur_prio {
                // An awakened thread of equal priority goes behind the
                // current one; it does not steal the rest of the round.
                self.sched_append(candidate);
                self.core_mut().action = SchedulerAction::ChooseNewThread;
                self.schedule_choose_new_thread();
            } else {
                self.switch_to_thread(candidate);
            }
        } else if action == SchedulerAction::ChooseNewThread {
            let cur = self.cur_thread();
            if self.is_schedulable(cur) {
                self.sched_enqueue(cur);
            }
            self.schedule_choose_new_thread();
        }
        self.core_mut().action = SchedulerAction::ResumeCurrentThread;

        self.switch_sched_context();
        if self.core().reprogram {
            self.set_next_interrupt();
            self.core_mut().reprogram = false;
        }
    }

    fn schedule_choose_new_thread(&mut self) {
        if self.domain_time == 0 {
            self.next_domain();
        }
        self.choose_thread();
    }

    /// Pick the head of the highest non-empty priority queue in the
    /// current domain, or idle.
    fn choose_thread(&mut self) {
        match self.core().ready.highest_prio(self.cur_domain) {
            Some(prio) => {
                let queue = self.core().ready.queue(self.cur_domain, prio);
                match queue.head {
                    Some(thread) => self.switch_to_thread(thread),
                    None => self.switch_to_idle_thread(),
                }
            }
            None => self.switch_to_idle_thread(),
        }
    }

    fn switch_to_thread(&mut self, thread: TcbIx) {
        self.sched_dequeue(thread);
        self.hal.switch_address_space(thread);
        self.core_mut().cur_thread = thread;
    }

    fn switch_to_idle_thread(&mut self) {
        let idle = self.core().idle_thread;
        self.hal.switch_address_space(idle);
        self.core_mut().cur_thread = idle;
    }

    /// Advance to the next entry of the static domain schedule.
    fn next_domain(&mut self) {
        self.dom_schedule_index = (self.dom_schedule_index + 1) % DOM_SCHEDULE.len();
        let (domain, length) = DOM_SCHEDULE[self.dom_schedule_index];
        self.cur_domain = domain;
        self.domain_time = length;
        self.work_units = 0;
        self.core_mut().reprogram = true;
    }

    // ---- time accounting ----------------------------------------------

    /// Sample the clock at kernel entry and accumulate unconsumed time.
    pub(crate) fn update_timestamp(&mut self) {
        let now = self.hal.timestamp();
        let delta = now.saturating_sub(self.cur_time);
        self.cur_time = now;
        self.core_mut().consumed += delta;
    }

    fn is_cur_domain_expired(&self) -> bool {
        NUM_DOMAINS > 1 && self.domain_time < self.core().consumed + MIN_BUDGET
    }

    /// Whether the current scheduling context can pay for the work already
    /// consumed plus one more kernel round trip. Charges the budget and
    /// ends the timeslice when it cannot.
    pub(crate) fn check_budget(&mut self) -> bool {
        let sc_ix = self.core().cur_sc;
        let consumed = self.core().consumed;
        let capacity = self.sc(sc_ix).capacity(consumed);
        if capacity >= MIN_BUDGET && !self.is_cur_domain_expired() {
            return true;
        }
        self.charge_budget(capacity, consumed, true);
        false
    }

    /// [`Self::check_budget`], additionally marking the current thread to
    /// re-execute its syscall once its budget returns.
    pub(crate) fn check_budget_restart(&mut self) -> bool {
        let ok = self.check_budget();
        let cur = self.cur_thread();
        if !ok && self.tcb(cur).state.is_runnable() {
            self.set_thread_state(cur, ThreadState::Restart);
        }
        ok
    }

    /// Charge `consumed` ticks to the current scheduling context and, if
    /// the current thread is still schedulable, end its timeslice.
    pub(crate) fn charge_budget(&mut self, capacity: Ticks, consumed: Ticks, can_timeout_fault: bool) {
        let sc_ix = self.core().cur_sc;
        let now = self.cur_time;
        {
            let sc = self.sc_mut(sc_ix);
            if sc.active() {
                if sc.is_round_robin() {
                    sc.round_robin_reset();
                } else {
                    sc.budget_check(consumed, capacity, now);
                }
                sc.consumed += consumed;
            }
        }
        if NUM_DOMAINS > 1 {
            self.domain_time = self.domain_time.saturating_sub(consumed);
        }
        self.core_mut().consumed = 0;

        let cur = self.cur_thread();
        if self.is_schedulable(cur) {
            self.end_timeslice(can_timeout_fault);
            self.reschedule_required();
            self.core_mut().reprogram = true;
        }
    }

    /// The current thread's budget ran out: hand it to its timeout
    /// handler, give it a fresh round, or park it until its refill
    /// activates.
    fn end_timeslice(&mut self, can_timeout_fault: bool) {
        let cur = self.cur_thread();
        let sc_ix = self.core().cur_sc;
        let now = self.cur_time;

        if can_timeout_fault
            && !self.sc(sc_ix).is_round_robin()
            && self.valid_timeout_handler(cur)
        {
            let badge = self.sc(sc_ix).badge;
            self.handle_timeout(cur, badge);
        } else if self.sc(sc_ix).ready(now) && self.sc(sc_ix).sufficient(0) {
            self.sched_append(cur);
        } else {
            self.postpone(sc_ix);
        }
    }

    /// Move a context's thread from the ready queues to the release queue.
    pub(crate) fn postpone(&mut self, sc: ScIx) {
        let Some(thread) = self.sc(sc).tcb else {
            return;
        };
        self.sched_dequeue(thread);
        self.release_enqueue(thread);
        let core = self.sc(sc).core;
        self.cores[core].reprogram = true;
    }

    /// Bill pending consumed time to the outgoing scheduling context.
    pub(crate) fn commit_time(&mut self) {
        let consumed = self.core().consumed;
        let sc_ix = self.core().cur_sc;
        if consumed > 0 {
            let sc = self.sc_mut(sc_ix);
            if sc.active() {
                if sc.is_round_robin() {
                    sc.round_robin_charge(consumed.min(sc.head().amount));
                } else {
                    sc.split_check(consumed.min(sc.head().amount));
                }
                sc.consumed += consumed;
            }
            if NUM_DOMAINS > 1 {
                self.domain_time = self.domain_time.saturating_sub(consumed);
            }
        }
        self.core_mut().consumed = 0;
    }

    /// Swap the charged scheduling context to the incoming thread's.
    fn switch_sched_context(&mut self) {
        let cur = self.cur_thread();
        let cur_sc = self.core().cur_sc;
        let thread_sc = self.tcb(cur).sched_context;

        if let Some(sc) = thread_sc {
            if sc != cur_sc && self.sc(cur_sc).active() {
                self.core_mut().reprogram = true;
                let now = self.cur_time;
                self.sc_mut(sc).unblock_check(now);
            }
        }
        if self.core().reprogram {
            self.commit_time();
        }
        if let Some(sc) = thread_sc {
            self.core_mut().cur_sc = sc;
        }
    }

    /// Arm the deadline timer for the earliest of budget expiry, domain
    /// expiry and the next release-queue activation.
    fn set_next_interrupt(&mut self) {
        let mut next: Option<Ticks> = None;
        let cur = self.cur_thread();
        if self.is_schedulable(cur) {
            if let Some(sc) = self.tcb(cur).sched_context {
                let mut deadline = self.cur_time + self.sc(sc).head().amount;
                if NUM_DOMAINS > 1 {
                    deadline = deadline.min(self.cur_time + self.domain_time);
                }
                next = Some(deadline);
            }
        }
        if let Some(head) = self.core().release_head {
            if let Some(sc) = self.tcb(head).sched_context {
                let wake = self.sc(sc).head().time;
                next = Some(match next {
                    Some(n) => n.min(wake),
                    None => wake,
                });
            }
        }
        if let Some(deadline) = next {
            self.hal.set_deadline(deadline);
        }
    }

    // ---- thread lifecycle ---------------------------------------------

    /// Prepare the chosen thread to run user code again.
    pub(crate) fn activate_thread(&mut self) {
        let cur = self.cur_thread();
        if self.tcb(cur).state == ThreadState::Restart {
            let pc = self.hal.get_restart_pc(cur);
            self.hal.set_next_pc(cur, pc);
            self.set_thread_state(cur, ThreadState::Running);
        }
    }

    /// Make a stopped thread runnable again at its restart point.
    pub(crate) fn restart_thread(&mut self, thread: TcbIx) {
        let state = self.tcb(thread).state;
        if state.is_runnable() || state == ThreadState::IdleThreadState {
            return;
        }
        self.cancel_ipc(thread);
        self.set_thread_state(thread, ThreadState::Restart);
        if let Some(sc) = self.tcb(thread).sched_context {
            if sc != self.core().cur_sc && !self.sc(sc).is_round_robin() {
                let now = self.cur_time;
                self.sc_mut(sc).unblock_check(now);
            }
            self.sched_context_resume(sc);
        }
        if self.is_schedulable(thread) {
            self.possible_switch_to(thread);
        }
    }

    /// Take a thread out of circulation: off every queue, out of any IPC
    /// rendezvous, state `Inactive`.
    pub(crate) fn suspend(&mut self, thread: TcbIx) {
        self.cancel_ipc(thread);
        self.set_thread_state(thread, ThreadState::Inactive);
        self.sched_dequeue(thread);
        self.release_remove(thread);
    }

    /// If the context's thread is schedulable but its budget has not yet
    /// activated, park it in the release queue.
    pub(crate) fn sched_context_resume(&mut self, sc: ScIx) {
        let Some(thread) = self.sc(sc).tcb else {
            return;
        };
        if !self.is_schedulable(thread) {
            return;
        }
        let now = self.cur_time;
        if !(self.sc(sc).ready(now) && self.sc(sc).sufficient(0)) {
            self.postpone(sc);
        }
    }

    /// Hand a scheduling context to another thread, evicting any current
    /// holder from the scheduler queues.
    pub(crate) fn sched_context_donate(&mut self, sc: ScIx, to: TcbIx) {
        if let Some(from) = self.sc(sc).tcb {
            self.sched_dequeue(from);
            self.release_remove(from);
            self.tcb_mut(from).sched_context = None;
            if from == self.cur_thread() {
                self.reschedule_required();
            } else if let SchedulerAction::SwitchToThread(candidate) = self.core().action {
                if candidate == from {
                    self.reschedule_required();
                }
            }
        }
        self.sc_mut(sc).tcb = Some(to);
        self.tcb_mut(to).sched_context = Some(sc);
        self.tcb_mut(to).affinity = self.sc(sc).core;
    }

    /// Attach a context to a thread and let it run if its budget allows.
    pub(crate) fn sched_context_bind_tcb(&mut self, sc: ScIx, thread: TcbIx) {
        self.sc_mut(sc).tcb = Some(thread);
        self.tcb_mut(thread).sched_context = Some(sc);
        self.tcb_mut(thread).affinity = self.sc(sc).core;
        self.sched_context_resume(sc);
        if self.is_schedulable(thread) {
            self.sched_enqueue(thread);
            self.reschedule_required();
        }
    }

    /// Detach a context from its thread, pulling the thread out of the
    /// scheduler queues.
    pub(crate) fn sched_context_unbind_tcb(&mut self, sc: ScIx) {
        let Some(thread) = self.sc(sc).tcb else {
            return;
        };
        if thread == self.cur_thread() {
            self.reschedule_required();
        }
        self.sched_dequeue(thread);
        self.release_remove(thread);
        self.tcb_mut(thread).sched_context = None;
        self.sc_mut(sc).tcb = None;
    }

    /// Detach a context from its donor notification.
    pub(crate) fn sched_context_unbind_ntfn(&mut self, sc: ScIx) {
        if let Some(ntfn) = self.sc(sc).ntfn {
            self.ntfn_mut(ntfn).sc = None;
            self.sc_mut(sc).ntfn = None;
        }
    }

    /// Drop the head of the context's call stack, orphaning the stack.
    pub(crate) fn sched_context_unbind_reply(&mut self, sc: ScIx) {
        if let Some(reply) = self.sc(sc).reply {
            self.reply_mut(reply).sc = None;
            self.sc_mut(sc).reply = None;
        }
    }

    /// Change a thread's priority, reordering whichever queue it occupies.
    pub(crate) fn set_priority(&mut self, thread: TcbIx, prio: Prio) {
        match self.tcb(thread).state {
            ThreadState::Running | ThreadState::Restart => {
                let requeue = self.tcb(thread).queued || thread == self.cur_thread();
                self.sched_dequeue(thread);
                self.tcb_mut(thread).prio = prio;
                if requeue && self.is_schedulable(thread) {
                    self.sched_enqueue(thread);
                    self.reschedule_required();
                }
            }
            ThreadState::BlockedOnSend { ep, .. } | ThreadState::BlockedOnReceive { ep, .. } => {
                self.tcb_mut(thread).prio = prio;
                self.reorder_ep(ep, thread);
            }
            ThreadState::BlockedOnNotification { ntfn } => {
                self.tcb_mut(thread).prio = prio;
                self.reorder_ntfn(ntfn, thread);
            }
            _ => self.tcb_mut(thread).prio = prio,
        }
    }

    /// Move a thread to another domain.
    pub(crate) fn set_domain(&mut self, thread: TcbIx, domain: Domain) {
        self.sched_dequeue(thread);
        self.tcb_mut(thread).domain = domain;
        if self.is_schedulable(thread) {
            self.sched_enqueue(thread);
        }
        if thread == self.cur_thread() {
            self.reschedule_required();
        }
    }

    /// Move a thread to another core; follows its scheduling context.
    pub(crate) fn migrate_thread(&mut self, thread: TcbIx, core: usize) {
        if self.tcb(thread).affinity == core {
            return;
        }
        self.sched_dequeue(thread);
        self.release_remove(thread);
        self.tcb_mut(thread).affinity = core;
        if self.is_schedulable(thread) {
            self.sched_enqueue(thread);
        }
        if thread == self.cur_thread() {
            self.reschedule_required();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MAX_REFILLS;
    use crate::hal::mock::MockHal;
    use crate::types::Region;

    fn kernel() -> Kernel<MockHal> {
        Kernel::new(MockHal::new())
    }

    /// A running thread with an active sporadic context, ready now.
    fn spawn(kernel: &mut Kernel<MockHal>, prio: Prio, budget: Ticks) -> TcbIx {
        let tcb = kernel.create_tcb(Region::new(0, crate::config::TCB_BITS));
        let sc = kernel.create_sc(Region::new(0, crate::config::SC_BITS));
        let now = kernel.cur_time;
        kernel.sc_mut(sc).refill_new(MAX_REFILLS, budget, 100_000, now);
        kernel.sc_mut(sc).tcb = Some(tcb);
        kernel.tcb_mut(tcb).sched_context = Some(sc);
        kernel.tcb_mut(tcb).prio = prio;
        kernel.tcb_mut(tcb).state = ThreadState::Running;
        tcb
    }

    #[test]
    fn test_higher_priority_candidate_wins() {
        let mut k = kernel();
        let low = spawn(&mut k, 5, 10_000);
        let high = spawn(&mut k, 10, 10_000);
        k.sched_enqueue(low);
        k.possible_switch_to(high);
        k.schedule();
        assert_eq!(k.cur_thread(), high);
        // The lower-priority thread stays queued for later.
        assert!(k.tcb(low).queued);
    }

    #[test]
    fn test_equal_priority_candidate_appends() {
        let mut k = kernel();
        let first = spawn(&mut k, 7, 10_000);
        let second = spawn(&mut k, 7, 10_000);
        k.possible_switch_to(first);
        k.schedule();
        assert_eq!(k.cur_thread(), first);

        // A woken equal-priority peer does not preempt mid-round.
        k.possible_switch_to(second);
        k.schedule();
        assert_eq!(k.cur_thread(), first);
        assert!(k.tcb(second).queued);
    }

    #[test]
    fn test_low_priority_candidate_falls_back_to_queues() {
        let mut k = kernel();
        let high = spawn(&mut k, 200, 10_000);
        let low = spawn(&mut k, 3, 10_000);
        k.sched_enqueue(high);
        // Candidate below the best queued thread loses the fast path.
        k.possible_switch_to(low);
        k.schedule();
        assert_eq!(k.cur_thread(), high);
        assert!(k.tcb(low).queued);
    }

    #[test]
    fn test_blocked_current_thread_forces_rescan() {
        let mut k = kernel();
        let a = spawn(&mut k, 9, 10_000);
        let b = spawn(&mut k, 4, 10_000);
        k.possible_switch_to(a);
        k.schedule();
        k.sched_enqueue(b);

        k.set_thread_state(a, ThreadState::Inactive);
        assert_eq!(k.core().action, SchedulerAction::ChooseNewThread);
        k.schedule();
        assert_eq!(k.cur_thread(), b);
    }

    #[test]
    fn test_idle_when_no_thread_ready() {
        let mut k = kernel();
        let a = spawn(&mut k, 9, 10_000);
        k.possible_switch_to(a);
        k.schedule();
        k.set_thread_state(a, ThreadState::Inactive);
        k.schedule();
        assert_eq!(k.cur_thread(), k.core().idle_thread);
    }

    #[test]
    fn test_release_queue_is_time_ordered() {
        let mut k = kernel();
        let late = spawn(&mut k, 5, 1_000);
        let early = spawn(&mut k, 5, 1_000);
        let late_sc = k.tcb(late).sched_context.unwrap();
        let early_sc = k.tcb(early).sched_context.unwrap();
        // Push the refills into the future at different distances.
        k.sc_mut(late_sc).budget_check(1_000, 0, 0);
        k.sc_mut(early_sc).split_check(1_000);
        k.release_enqueue(late);
        k.release_enqueue(early);

        let head = k.core().release_head.unwrap();
        let head_sc = k.tcb(head).sched_context.unwrap();
        let next = k.tcb(head).release_next.unwrap();
        let next_sc = k.tcb(next).sched_context.unwrap();
        assert!(k.sc(head_sc).head().time <= k.sc(next_sc).head().time);
    }

    #[test]
    fn test_awaken_wakes_released_thread() {
        let mut k = kernel();
        let t = spawn(&mut k, 5, 1_000);
        let sc = k.tcb(t).sched_context.unwrap();
        k.sc_mut(sc).split_check(1_000);
        k.release_enqueue(t);
        assert!(k.tcb(t).in_release_queue);
        assert!(!k.is_schedulable(t));

        // Nothing happens before the refill activates.
        k.schedule();
        assert!(k.tcb(t).in_release_queue);

        k.hal.tick(200_000);
        k.update_timestamp();
        k.schedule();
        assert!(!k.tcb(t).in_release_queue);
        assert_eq!(k.cur_thread(), t);
    }

    #[test]
    fn test_charge_budget_postpones_exhausted_thread() {
        let mut k = kernel();
        let t = spawn(&mut k, 5, 1_000);
        k.possible_switch_to(t);
        k.schedule();
        assert_eq!(k.cur_thread(), t);

        // Burn past the whole budget.
        k.hal.tick(1_500);
        k.update_timestamp();
        assert!(!k.check_budget());
        assert!(k.tcb(t).in_release_queue);
        assert_eq!(k.core().action, SchedulerAction::ChooseNewThread);
    }

    #[test]
    fn test_deadline_timer_covers_release_head() {
        let mut k = kernel();
        let running = spawn(&mut k, 5, 5_000);
        let parked = spawn(&mut k, 5, 1_000);
        let parked_sc = k.tcb(parked).sched_context.unwrap();
        k.sc_mut(parked_sc).split_check(1_000);
        let wake = k.sc(parked_sc).head().time;
        k.release_enqueue(parked);

        k.possible_switch_to(running);
        k.schedule();
        let deadline = *k.hal.deadlines.last().unwrap();
        assert!(deadline <= wake.max(k.cur_time + 5_000));
    }

    #[test]
    fn test_domain_rotation_advances_schedule() {
        let mut k = kernel();
        let start_domain = k.cur_domain;
        k.domain_time = 0;
        k.reschedule_required();
        k.schedule();
        assert_ne!(k.cur_domain, start_domain);
        assert_eq!(k.domain_time, DOM_SCHEDULE[k.dom_schedule_index].1);
    }

    #[test]
    fn test_cross_core_wake_posts_ipi() {
        let mut k = kernel();
        let t = spawn(&mut k, 5, 10_000);
        k.tcb_mut(t).affinity = 2;
        k.possible_switch_to(t);
        assert!(k.hal.ipis.contains(&2));
        // The remote queue, not this core's action, holds the thread.
        assert_eq!(k.core().action, SchedulerAction::ResumeCurrentThread);
        assert!(k.tcb(t).queued);
    }

    #[test]
    fn test_priority_change_requeues_running_thread() {
        let mut k = kernel();
        let a = spawn(&mut k, 5, 10_000);
        let b = spawn(&mut k, 6, 10_000);
        k.sched_enqueue(a);
        k.sched_enqueue(b);
        k.set_priority(a, 20);
        k.schedule();
        assert_eq!(k.cur_thread(), a);
    }
}
