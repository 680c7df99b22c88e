//! System-Call Surface
//!
//! The kernel's only entry points: the syscall dispatcher, the interrupt
//! entries and the invocation decoder.
//!
//! # Design
//! - Every entry samples the clock and settles the budget before doing
//!   anything else; a thread with no usable budget has its syscall
//!   deferred, not half-executed ([`handler`])
//! - Decoding is side-effect-free: all argument and capability checks
//!   complete before the first mutation, so a failed invocation leaves
//!   the kernel exactly as it found it ([`decode`])
//! - Long-running invocations surrender at preemption points; the caller
//!   is left in `Restart` so the syscall re-enters on resume
//!
//! # Security Properties
//! - No operation proceeds on a capability without the rights it demands
//! - Kernel errors are reported only to callers that asked (`Call`);
//!   plain sends fail silently, exactly as delivery does

pub mod decode;
pub mod handler;

pub use handler::Syscall;

use crate::error::{Preempted, SyscallError};

/// Why an invocation did not complete.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum InvocationFailure {
    /// Decode rejected the request; reported to a calling invoker.
    Error(SyscallError),
    /// The invocation ran out of work quota and will re-enter.
    Preempted,
}

impl From<SyscallError> for InvocationFailure {
    fn from(err: SyscallError) -> Self {
        Self::Error(err)
    }
}

impl From<Preempted> for InvocationFailure {
    fn from(_: Preempted) -> Self {
        Self::Preempted
    }
}

/// Result of decoding and performing one invocation; `Ok` carries the
/// reply length in message words.
pub(crate) type InvocationResult = Result<usize, InvocationFailure>;
