//! Thread Control Blocks
//!
//! A thread is its saved context (held behind the HAL), a lifecycle state,
//! scheduling parameters, and a run of five built-in capability slots. All
//! queue membership is intrusive: the block carries its own ready-queue,
//! endpoint-queue and release-queue links.

use crate::ipc::fault::Fault;
use crate::types::{Badge, CoreId, Domain, EpIx, NtfnIx, Prio, Region, ReplyIx, ScIx, SlotIx, TcbIx};

/// Lifecycle state of a thread.
///
/// Blocked states carry the object the thread is enqueued on so that
/// cancellation can unlink it without a search.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum ThreadState {
    /// Not runnable and not waiting; the initial and post-suspend state.
    #[default]
    Inactive,
    /// Eligible to run.
    Running,
    /// Eligible to run, but re-executes its current syscall instruction
    /// first. Used to resume preempted operations and restarted threads.
    Restart,
    /// Enqueued on an endpoint's send queue.
    BlockedOnSend {
        ep: EpIx,
        badge: Badge,
        can_grant: bool,
        can_grant_reply: bool,
        is_call: bool,
    },
    /// Enqueued on an endpoint's receive queue, with the reply object to
    /// push should the partner call.
    BlockedOnReceive { ep: EpIx, reply: Option<ReplyIx> },
    /// Waiting for the answer to a call it made.
    BlockedOnReply { reply: ReplyIx },
    /// Enqueued on a notification's wait queue.
    BlockedOnNotification { ntfn: NtfnIx },
    /// The per-core idle thread's permanent state.
    IdleThreadState,
}

impl ThreadState {
    /// Whether a thread in this state may be picked by the scheduler.
    #[inline]
    pub fn is_runnable(&self) -> bool {
        matches!(self, ThreadState::Running | ThreadState::Restart)
    }

    /// Whether the thread is parked on some object's queue.
    #[inline]
    pub fn is_blocked(&self) -> bool {
        matches!(
            self,
            ThreadState::BlockedOnSend { .. }
                | ThreadState::BlockedOnReceive { .. }
                | ThreadState::BlockedOnReply { .. }
                | ThreadState::BlockedOnNotification { .. }
        )
    }
}

/// A thread control block.
#[derive(Clone, Debug)]
pub struct Tcb {
    pub state: ThreadState,
    /// Effective priority.
    pub prio: Prio,
    /// Maximum controlled priority: ceiling on priorities this thread can
    /// set on others (and itself).
    pub mcp: Prio,
    pub domain: Domain,
    /// Core this thread runs on.
    pub affinity: CoreId,
    /// First of the five built-in slots (cspace, vspace, buffer, fault
    /// handler, timeout handler).
    pub cnode_base: SlotIx,
    /// Scheduling context bound to this thread, if any.
    pub sched_context: Option<ScIx>,
    /// Notification bound for signal delivery while waiting on IPC.
    pub bound_notification: Option<NtfnIx>,
    /// Pending fault, saved while the handler is being contacted.
    pub fault: Option<Fault>,

    // Ready-queue links.
    pub sched_prev: Option<TcbIx>,
    pub sched_next: Option<TcbIx>,
    pub queued: bool,

    // Endpoint / notification wait-queue links.
    pub ep_prev: Option<TcbIx>,
    pub ep_next: Option<TcbIx>,

    // Release-queue link (time-ordered, singly threaded per core).
    pub release_next: Option<TcbIx>,
    pub in_release_queue: bool,

    /// Physical span the block was carved from.
    pub region: Region,
    /// Cleared when the object is destroyed; its arena entry is dead.
    pub live: bool,
}

impl Tcb {
    /// A fresh, inactive thread owning the slot run at `cnode_base`.
    pub fn new(cnode_base: SlotIx, region: Region) -> Self {
        Self {
            state: ThreadState::Inactive,
            prio: 0,
            mcp: 0,
            domain: 0,
            affinity: 0,
            cnode_base,
            sched_context: None,
            bound_notification: None,
            fault: None,
            sched_prev: None,
            sched_next: None,
            queued: false,
            ep_prev: None,
            ep_next: None,
            release_next: None,
            in_release_queue: false,
            region,
            live: true,
        }
    }
}
