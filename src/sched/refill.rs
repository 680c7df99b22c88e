//! Scheduling Contexts and Sporadic Refills
//!
//! A scheduling context is the right to consume processor time: `budget`
//! ticks out of every `period`. The budget is tracked as a circular queue
//! of refill records ordered by activation time; spending moves amounts
//! from the head towards the tail, one period into the future, so the
//! total never changes and at most `budget` ticks can ever be spent inside
//! any sliding window one period wide.
//!
//! # Design
//! - The queue always holds at least one record and at most `refill_max`
//! - A period of zero marks a round-robin context: two records, the head
//!   holding the remaining slice and the tail accumulating used time
//! - After any charge the head is topped back up to [`MIN_BUDGET`] by
//!   merging, so a woken thread can always enter and leave the kernel

use crate::config::{MAX_REFILLS, MIN_BUDGET, MIN_REFILLS};
use crate::types::{Badge, CoreId, NtfnIx, Region, ReplyIx, TcbIx, Ticks};

/// One budget replenishment: `amount` ticks usable from `time` onwards.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct Refill {
    pub time: Ticks,
    pub amount: Ticks,
}

/// A sporadic-server scheduling context.
#[derive(Clone, Debug)]
pub struct SchedContext {
    /// Replenishment period in ticks; zero selects round-robin behaviour.
    pub period: Ticks,
    /// Total ticks ever charged to this context, for `Consumed` queries.
    pub consumed: Ticks,
    /// Core the context may be scheduled on.
    pub core: CoreId,
    /// Thread currently bound to this context.
    pub tcb: Option<TcbIx>,
    /// Notification donating this context to signalled threads.
    pub ntfn: Option<NtfnIx>,
    /// Head of the reply-object call stack riding on this context.
    pub reply: Option<ReplyIx>,
    /// Badge reported with timeout faults raised against this context.
    pub badge: Badge,

    /// Capacity of the refill queue; zero means the context is inactive.
    pub refill_max: usize,
    refill_head: usize,
    refill_count: usize,
    refills: [Refill; MAX_REFILLS],

    /// Physical span the context was carved from.
    pub region: Region,
    /// Cleared when the object is destroyed.
    pub live: bool,
}

impl SchedContext {
    /// A fresh, inactive context. It gains a budget through `refill_new`.
    pub fn new(region: Region) -> Self {
        Self {
            period: 0,
            consumed: 0,
            core: 0,
            tcb: None,
            ntfn: None,
            reply: None,
            badge: 0,
            refill_max: 0,
            refill_head: 0,
            refill_count: 0,
            refills: [Refill::default(); MAX_REFILLS],
            region,
            live: true,
        }
    }

    /// Whether the context has ever been given a budget.
    #[inline]
    pub fn active(&self) -> bool {
        self.refill_max > 0
    }

    /// Round-robin contexts have no period and never wait for refills.
    #[inline]
    pub fn is_round_robin(&self) -> bool {
        self.period == 0
    }

    #[inline]
    fn next_index(&self, index: usize) -> usize {
        if index == self.refill_max - 1 {
            0
        } else {
            index + 1
        }
    }

    #[inline]
    fn single(&self) -> bool {
        self.refill_count == 1
    }

    #[inline]
    fn full(&self) -> bool {
        self.refill_count == self.refill_max
    }

    /// The front refill record.
    #[inline]
    pub fn head(&self) -> Refill {
        self.refills[self.refill_head]
    }

    #[inline]
    fn head_mut(&mut self) -> &mut Refill {
        &mut self.refills[self.refill_head]
    }

    #[inline]
    fn tail_index(&self) -> usize {
        let mut index = self.refill_head;
        for _ in 1..self.refill_count {
            index = self.next_index(index);
        }
        index
    }

    #[inline]
    fn tail_mut(&mut self) -> &mut Refill {
        let index = self.tail_index();
        &mut self.refills[index]
    }

    fn pop_head(&mut self) -> Refill {
        debug_assert!(!self.single());
        let refill = self.refills[self.refill_head];
        self.refill_head = self.next_index(self.refill_head);
        self.refill_count -= 1;
        refill
    }

    fn add_tail(&mut self, refill: Refill) {
        debug_assert!(self.refill_count < self.refill_max);
        self.refill_count += 1;
        *self.tail_mut() = refill;
    }

    /// Round-robin contexts keep an empty tail record accumulating used
    /// time.
    fn maybe_add_empty_tail(&mut self, now: Ticks) {
        if self.is_round_robin() {
            self.add_tail(Refill { time: now, amount: 0 });
            debug_assert_eq!(self.refill_count, MIN_REFILLS);
        }
    }

    /// Budget remaining in the head record after charging `usage`.
    #[inline]
    pub fn capacity(&self, usage: Ticks) -> Ticks {
        let head = self.head();
        if usage > head.amount {
            0
        } else {
            head.amount - usage
        }
    }

    /// Whether enough budget remains after `usage` to enter and leave the
    /// kernel once more.
    #[inline]
    pub fn sufficient(&self, usage: Ticks) -> bool {
        self.capacity(usage) >= MIN_BUDGET
    }

    /// Whether the head refill's activation time has arrived.
    #[inline]
    pub fn ready(&self, now: Ticks) -> bool {
        self.head().time <= now
    }

    /// Sum of all queued amounts; invariant under every charge operation.
    pub fn budget_sum(&self) -> Ticks {
        let mut sum = 0;
        let mut index = self.refill_head;
        for _ in 0..self.refill_count {
            sum += self.refills[index].amount;
            index = self.next_index(index);
        }
        sum
    }

    /// Install a fresh budget, discarding any queued refills.
    pub fn refill_new(&mut self, max_refills: usize, budget: Ticks, period: Ticks, now: Ticks) {
        debug_assert!(budget >= MIN_BUDGET);
        self.period = period;
        self.refill_max = max_refills;
        self.refill_head = 0;
        self.refill_count = 1;
        self.refills[0] = Refill { time: now, amount: budget };
        self.maybe_add_empty_tail(now);
    }

    /// Change the parameters of an active context. The queue collapses to
    /// the head record so the sliding-window bound holds for the new
    /// parameters from this instant.
    pub fn refill_update(
        &mut self,
        new_period: Ticks,
        new_budget: Ticks,
        new_max_refills: usize,
        now: Ticks,
    ) {
        debug_assert!(self.active());

        // Park the head at index zero before shrinking the ring.
        self.refills[0] = self.head();
        self.refill_head = 0;
        self.refill_count = 1;
        self.refill_max = new_max_refills;
        self.period = new_period;

        if self.ready(now) {
            self.head_mut().time = now;
        }

        if self.head().amount >= new_budget {
            self.head_mut().amount = new_budget;
            self.maybe_add_empty_tail(now);
        } else {
            let shortfall = Refill {
                amount: new_budget - self.head().amount,
                time: self.head().time + new_period,
            };
            self.add_tail(shortfall);
        }
    }

    /// Queue a spent chunk for replenishment one period ahead, merging
    /// into the tail when the chunk is too small to stand alone or would
    /// activate no later than the tail.
    fn schedule_used(&mut self, spent: Refill) {
        if spent.amount < MIN_BUDGET && !self.single() {
            let tail = self.tail_mut();
            tail.amount += spent.amount;
            tail.time = tail.time.max(spent.time);
        } else if spent.time <= self.tail_mut().time {
            self.tail_mut().amount += spent.amount;
        } else {
            self.add_tail(spent);
        }
    }

    /// Charge `usage` ticks after the head ran dry (or the queue filled).
    /// `capacity` is the head budget remaining before the charge.
    pub fn budget_check(&mut self, mut usage: Ticks, capacity: Ticks, now: Ticks) {
        debug_assert!(capacity < MIN_BUDGET || self.full());
        debug_assert!(self.period > 0);

        if capacity == 0 {
            while self.head().amount <= usage {
                usage -= self.head().amount;
                if self.single() {
                    let period = self.period;
                    self.head_mut().time += period;
                } else {
                    let mut old_head = self.pop_head();
                    old_head.time += self.period;
                    self.schedule_used(old_head);
                }
            }

            // Overrun: the next activation slips by the excess.
            if usage > 0 {
                self.head_mut().time += usage;
                if !self.single() {
                    let next = self.refills[self.next_index(self.refill_head)];
                    if self.head().time + self.head().amount >= next.time {
                        let popped = self.pop_head();
                        self.head_mut().amount += popped.amount;
                        self.head_mut().time = popped.time;
                    }
                }
            }
        }

        if self.capacity(usage) > 0 && self.ready(now) {
            self.split_check(usage);
        }

        // Top the head back up to the spendable floor.
        while self.head().amount < MIN_BUDGET || self.full() {
            let popped = self.pop_head();
            self.head_mut().amount += popped.amount;
        }
    }

    /// Charge `usage` ticks against a head that can cover them: the spent
    /// part moves one period into the future, the remnant stays at the
    /// front (or merges forward when too small).
    pub fn split_check(&mut self, usage: Ticks) {
        debug_assert!(usage > 0);
        debug_assert!(usage <= self.head().amount);
        debug_assert!(self.period > 0);

        let remnant = self.head().amount - usage;
        let mut spent = Refill {
            amount: usage,
            time: self.head().time + self.period,
        };

        if self.full() || remnant < MIN_BUDGET {
            if self.single() {
                spent.amount += remnant;
                *self.head_mut() = spent;
            } else {
                self.pop_head();
                self.head_mut().amount += remnant;
                self.schedule_used(spent);
            }
        } else {
            self.head_mut().amount = remnant;
            self.schedule_used(spent);
        }
    }

    /// Charge used time on a round-robin context: the head shrinks and the
    /// tail grows by the same amount.
    pub fn round_robin_charge(&mut self, usage: Ticks) {
        debug_assert!(self.is_round_robin());
        let charge = usage.min(self.head().amount);
        self.head_mut().amount -= charge;
        self.tail_mut().amount += charge;
    }

    /// Reset a round-robin context to a full head slice.
    pub fn round_robin_reset(&mut self) {
        debug_assert!(self.is_round_robin());
        let used = self.tail_mut().amount;
        self.tail_mut().amount = 0;
        self.head_mut().amount += used;
    }

    /// On unblock, pull the head activation up to now and merge every
    /// refill that would activate within the head's span. Returns true
    /// when the deadline timer needs reprogramming.
    pub fn unblock_check(&mut self, now: Ticks) -> bool {
        if self.is_round_robin() {
            return false;
        }

        if !self.ready(now) {
            return false;
        }
        self.head_mut().time = now;

        while !self.single() {
            let amount = self.head().amount;
            let next = self.refills[self.next_index(self.refill_head)];
            if next.time <= now + amount {
                self.pop_head();
                self.head_mut().amount += amount;
                self.head_mut().time = now;
            } else {
                break;
            }
        }

        debug_assert!(self.sufficient(0));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn active_sc(budget: Ticks, period: Ticks, now: Ticks) -> SchedContext {
        let mut sc = SchedContext::new(Region::new(0, crate::config::SC_BITS));
        sc.refill_new(MAX_REFILLS, budget, period, now);
        sc
    }

    #[test]
    fn test_new_refill_available_immediately() {
        let sc = active_sc(1_000, 10_000, 500);
        assert!(sc.active());
        assert!(sc.ready(500));
        assert_eq!(sc.head().amount, 1_000);
        assert_eq!(sc.budget_sum(), 1_000);
    }

    #[test]
    fn test_split_check_conserves_budget() {
        let mut sc = active_sc(1_000, 10_000, 0);
        sc.split_check(400);
        assert_eq!(sc.budget_sum(), 1_000);
        // Remnant stays spendable now; the spent chunk waits one period.
        assert_eq!(sc.head().amount, 600);
        assert_eq!(sc.head().time, 0);
    }

    #[test]
    fn test_split_check_merges_small_remnant() {
        let mut sc = active_sc(1_000, 10_000, 0);
        // Leave less than MIN_BUDGET at the head.
        sc.split_check(1_000 - MIN_BUDGET / 2);
        assert_eq!(sc.budget_sum(), 1_000);
        assert!(sc.head().amount >= MIN_BUDGET || sc.single());
    }

    #[test]
    fn test_budget_check_overrun_delays_activation() {
        let mut sc = active_sc(1_000, 10_000, 0);
        // Charge more than the whole head.
        sc.budget_check(1_200, 0, 0);
        assert_eq!(sc.budget_sum(), 1_000);
        // The refill moved a period out, plus the 200-tick overrun.
        assert!(sc.head().time >= 10_000);
        assert!(sc.head().amount >= MIN_BUDGET);
    }

    #[test]
    fn test_unblock_merges_overlapping_refills() {
        let mut sc = active_sc(1_000, 2_000, 0);
        // Split a few times to fragment the queue.
        sc.split_check(300);
        sc.split_check(300);
        let total = sc.budget_sum();
        // Far in the future every refill has activated; unblock merges
        // them all back into one spendable head.
        assert!(sc.unblock_check(100_000));
        assert_eq!(sc.budget_sum(), total);
        assert_eq!(sc.head().amount, total);
        assert!(sc.ready(100_000));
    }

    #[test]
    fn test_round_robin_charge_and_reset() {
        let mut sc = SchedContext::new(Region::new(0, crate::config::SC_BITS));
        sc.refill_new(MIN_REFILLS, 1_000, 0, 0);
        assert!(sc.is_round_robin());
        sc.round_robin_charge(300);
        assert_eq!(sc.head().amount, 700);
        assert_eq!(sc.budget_sum(), 1_000);
        sc.round_robin_reset();
        assert_eq!(sc.head().amount, 1_000);
    }

    #[test]
    fn test_update_shrinks_budget_in_place() {
        let mut sc = active_sc(1_000, 10_000, 0);
        sc.refill_update(5_000, 600, MAX_REFILLS, 0);
        assert_eq!(sc.head().amount, 600);
        assert_eq!(sc.budget_sum(), 600);
        assert_eq!(sc.period, 5_000);
    }

    #[test]
    fn test_update_grows_budget_next_period() {
        let mut sc = active_sc(1_000, 10_000, 0);
        sc.refill_update(10_000, 1_500, MAX_REFILLS, 0);
        assert_eq!(sc.budget_sum(), 1_500);
        // Only the original 1000 is spendable this period.
        assert_eq!(sc.head().amount, 1_000);
    }
}
