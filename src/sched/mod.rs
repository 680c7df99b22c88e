//! Scheduler Core
//!
//! Per-core priority-bitmap ready queues, sporadic budget refills, domain
//! rotation, and the single decision function that commits the next-thread
//! choice at kernel exit.
//!
//! # Design
//! - One [`queues::ReadyQueues`] set and one current thread per core;
//!   remote cores are only ever poked with a reschedule IPI, never
//!   switched synchronously
//! - Scheduling decisions are deferred through a three-way scheduler
//!   action to avoid wasted enqueue/dequeue pairs
//! - Time budgets are circular buffers of refill records owned by
//!   scheduling contexts ([`refill`])

pub mod queues;
pub mod refill;
pub mod scheduler;
pub mod tcb;

pub use refill::{Refill, SchedContext};
pub use scheduler::SchedulerAction;
pub use tcb::{Tcb, ThreadState};
