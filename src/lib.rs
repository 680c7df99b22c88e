//! Ocelot - Capability Microkernel Core
//!
//! The scheduling and capability-invocation core of a capability-based
//! microkernel: it decides which thread runs next, enforces sporadic time
//! budgets, and mediates every privileged operation (IPC, object creation,
//! capability manipulation) through unforgeable capability tokens held in
//! per-domain capability spaces.
//!
//! # What lives here
//! - Capability spaces: guarded radix-trie resolution over CNode tables
//! - Derivation tracking: a doubly-linked list of slots with atomic
//!   insert/move/swap, recursive revocation, and incremental (Zombie)
//!   deletion of composite objects
//! - Scheduler: per-core priority-bitmap ready queues, sporadic budget
//!   refills, domain rotation, and the deferred scheduler-action decision
//! - IPC: synchronous endpoint rendezvous and asynchronous notifications
//! - Invocation dispatch: side-effect-free decode, then a committing
//!   invoke phase with cooperative preemption points
//!
//! # What does not
//! Page tables, register save/restore, timers and interrupt controllers are
//! external collaborators reached through the narrow [`hal::Hal`] trait.
//! There is no kernel heap: every kernel object is carved out of Untyped
//! memory by Retype, and the slot/object arenas grow only there.
//!
//! # Security Properties
//! - Capabilities cannot be forged; all access is checked against rights
//! - Rights can only be reduced along derivation, never increased
//! - Revocation removes every descendant of a capability, atomically with
//!   respect to user observation (bounded per-entry work via Zombies)
//! - One core in the kernel at a time: callers take [`kernel::KernelLock`]

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

pub mod cap;
pub mod config;
pub mod error;
pub mod hal;
pub mod ipc;
pub mod kernel;
pub mod sched;
pub mod syscall;
pub mod types;

pub use cap::capability::{CapRights, Capability};
pub use error::{LookupFault, Preempted, SyscallError};
pub use hal::Hal;
pub use kernel::{Kernel, KernelLock};
