//! Ready Queues
//!
//! One doubly-linked FIFO per (domain, priority) pair, shadowed by a
//! two-level bitmap so the highest occupied priority of the active domain
//! is found with two word scans. Links are intrusive through the thread
//! control blocks; the `queued` flag makes enqueue and dequeue idempotent.

use alloc::vec;
use alloc::vec::Vec;

use super::tcb::Tcb;
use crate::config::{L2_BITMAP_WORDS, NUM_DOMAINS, NUM_PRIORITIES, WORD_BITS};
use crate::types::{Domain, Prio, TcbIx, Word};

/// Head and tail of one intrusive thread list.
#[derive(Clone, Copy, Debug, Default)]
pub struct TcbQueue {
    pub head: Option<TcbIx>,
    pub tail: Option<TcbIx>,
}

/// All ready queues of one core.
#[derive(Clone, Debug)]
pub struct ReadyQueues {
    queues: Vec<TcbQueue>,
    /// Bit `w` set iff `l2[dom][w]` is non-zero.
    l1: [Word; NUM_DOMAINS],
    /// Bit `p % 64` of word `p / 64` set iff queue `(dom, p)` is non-empty.
    l2: [[Word; L2_BITMAP_WORDS]; NUM_DOMAINS],
}

impl ReadyQueues {
    pub fn new() -> Self {
        Self {
            queues: vec![TcbQueue::default(); NUM_DOMAINS * NUM_PRIORITIES],
            l1: [0; NUM_DOMAINS],
            l2: [[0; L2_BITMAP_WORDS]; NUM_DOMAINS],
        }
    }

    #[inline]
    fn queue_index(dom: Domain, prio: Prio) -> usize {
        dom * NUM_PRIORITIES + prio
    }

    /// The queue for one (domain, priority) pair.
    #[inline]
    pub fn queue(&self, dom: Domain, prio: Prio) -> TcbQueue {
        self.queues[Self::queue_index(dom, prio)]
    }

    fn mark_occupied(&mut self, dom: Domain, prio: Prio) {
        let word = prio / WORD_BITS;
        self.l2[dom][word] |= 1 << (prio % WORD_BITS);
        self.l1[dom] |= 1 << word;
    }

    fn mark_empty(&mut self, dom: Domain, prio: Prio) {
        let word = prio / WORD_BITS;
        self.l2[dom][word] &= !(1 << (prio % WORD_BITS));
        if self.l2[dom][word] == 0 {
            self.l1[dom] &= !(1 << word);
        }
    }

    /// Highest non-empty priority in `dom`, if any.
    pub fn highest_prio(&self, dom: Domain) -> Option<Prio> {
        if self.l1[dom] == 0 {
            return None;
        }
        let word = WORD_BITS - 1 - self.l1[dom].leading_zeros() as usize;
        let bit = WORD_BITS - 1 - self.l2[dom][word].leading_zeros() as usize;
        Some(word * WORD_BITS + bit)
    }

    /// Push `tcb` at the front of its queue; threads re-entering with
    /// unconsumed budget go first. No-op if already queued.
    pub fn enqueue(&mut self, tcbs: &mut [Tcb], tcb: TcbIx) {
        if tcbs[tcb.index()].queued {
            return;
        }
        let (dom, prio) = (tcbs[tcb.index()].domain, tcbs[tcb.index()].prio);
        let index = Self::queue_index(dom, prio);
        let old_head = self.queues[index].head;

        tcbs[tcb.index()].sched_prev = None;
        tcbs[tcb.index()].sched_next = old_head;
        tcbs[tcb.index()].queued = true;
        match old_head {
            Some(h) => tcbs[h.index()].sched_prev = Some(tcb),
            None => {
                self.queues[index].tail = Some(tcb);
                self.mark_occupied(dom, prio);
            }
        }
        self.queues[index].head = Some(tcb);
    }

    /// Push `tcb` at the back of its queue; preempted threads yield the
    /// rest of their round to equal-priority peers. No-op if already
    /// queued.
    pub fn append(&mut self, tcbs: &mut [Tcb], tcb: TcbIx) {
        if tcbs[tcb.index()].queued {
            return;
        }
        let (dom, prio) = (tcbs[tcb.index()].domain, tcbs[tcb.index()].prio);
        let index = Self::queue_index(dom, prio);
        let old_tail = self.queues[index].tail;

        tcbs[tcb.index()].sched_prev = old_tail;
        tcbs[tcb.index()].sched_next = None;
        tcbs[tcb.index()].queued = true;
        match old_tail {
            Some(t) => tcbs[t.index()].sched_next = Some(tcb),
            None => {
                self.queues[index].head = Some(tcb);
                self.mark_occupied(dom, prio);
            }
        }
        self.queues[index].tail = Some(tcb);
    }

    /// Unlink `tcb` from wherever it sits in its queue. No-op if not
    /// queued.
    pub fn dequeue(&mut self, tcbs: &mut [Tcb], tcb: TcbIx) {
        if !tcbs[tcb.index()].queued {
            return;
        }
        let (dom, prio) = (tcbs[tcb.index()].domain, tcbs[tcb.index()].prio);
        let index = Self::queue_index(dom, prio);
        let (prev, next) = (tcbs[tcb.index()].sched_prev, tcbs[tcb.index()].sched_next);

        match prev {
            Some(p) => tcbs[p.index()].sched_next = next,
            None => self.queues[index].head = next,
        }
        match next {
            Some(n) => tcbs[n.index()].sched_prev = prev,
            None => self.queues[index].tail = prev,
        }
        if self.queues[index].head.is_none() {
            self.mark_empty(dom, prio);
        }

        tcbs[tcb.index()].sched_prev = None;
        tcbs[tcb.index()].sched_next = None;
        tcbs[tcb.index()].queued = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Region, SlotIx};

    fn make_tcbs(n: usize) -> Vec<Tcb> {
        (0..n)
            .map(|i| {
                let mut t = Tcb::new(SlotIx::new(i * 5), Region::new(0, 10));
                t.prio = 0;
                t
            })
            .collect()
    }

    #[test]
    fn test_bitmap_tracks_queue_occupancy() {
        let mut tcbs = make_tcbs(2);
        tcbs[0].prio = 10;
        tcbs[1].prio = 130;
        let mut q = ReadyQueues::new();
        assert_eq!(q.highest_prio(0), None);

        q.enqueue(&mut tcbs, TcbIx::new(0));
        assert_eq!(q.highest_prio(0), Some(10));
        q.enqueue(&mut tcbs, TcbIx::new(1));
        assert_eq!(q.highest_prio(0), Some(130));

        q.dequeue(&mut tcbs, TcbIx::new(1));
        assert_eq!(q.highest_prio(0), Some(10));
        q.dequeue(&mut tcbs, TcbIx::new(0));
        assert_eq!(q.highest_prio(0), None);
    }

    #[test]
    fn test_enqueue_is_idempotent() {
        let mut tcbs = make_tcbs(1);
        let mut q = ReadyQueues::new();
        q.enqueue(&mut tcbs, TcbIx::new(0));
        q.enqueue(&mut tcbs, TcbIx::new(0));
        let queue = q.queue(0, 0);
        assert_eq!(queue.head, Some(TcbIx::new(0)));
        assert_eq!(queue.tail, Some(TcbIx::new(0)));
        assert!(tcbs[0].sched_next.is_none());
    }

    #[test]
    fn test_append_preserves_fifo_order() {
        let mut tcbs = make_tcbs(3);
        let mut q = ReadyQueues::new();
        for i in 0..3 {
            q.append(&mut tcbs, TcbIx::new(i));
        }
        let queue = q.queue(0, 0);
        assert_eq!(queue.head, Some(TcbIx::new(0)));
        assert_eq!(queue.tail, Some(TcbIx::new(2)));
        assert_eq!(tcbs[0].sched_next, Some(TcbIx::new(1)));
        assert_eq!(tcbs[1].sched_next, Some(TcbIx::new(2)));

        // Enqueue places at the front instead.
        q.dequeue(&mut tcbs, TcbIx::new(2));
        q.enqueue(&mut tcbs, TcbIx::new(2));
        assert_eq!(q.queue(0, 0).head, Some(TcbIx::new(2)));
    }

    #[test]
    fn test_dequeue_middle_relinks() {
        let mut tcbs = make_tcbs(3);
        let mut q = ReadyQueues::new();
        for i in 0..3 {
            q.append(&mut tcbs, TcbIx::new(i));
        }
        q.dequeue(&mut tcbs, TcbIx::new(1));
        assert_eq!(tcbs[0].sched_next, Some(TcbIx::new(2)));
        assert_eq!(tcbs[2].sched_prev, Some(TcbIx::new(0)));
        assert_eq!(q.highest_prio(0), Some(0));
    }
}
