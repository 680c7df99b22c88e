//! Error Taxonomy
//!
//! Three disjoint channels leave the kernel:
//! - [`SyscallError`]: a decode or invoke failure, written back to the
//!   invoking thread's message registers. Decode-phase checks fail fast
//!   and leave no partial mutation.
//! - Faults (see [`crate::ipc::fault`]): delivered asynchronously to a
//!   registered handler endpoint, never returned to the faulting call.
//! - [`Preempted`]: a cooperative-restart signal from a long-running
//!   structural operation that legitimately needs more than one kernel
//!   entry; the dispatcher restarts the invoking thread so the operation
//!   re-enters on resume.

use core::fmt;

use crate::types::Word;

/// Why a capability-space walk failed.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LookupFault {
    /// The root of the walk was not a CNode capability.
    InvalidRoot,
    /// The walk ended at an empty slot with bits left to resolve.
    MissingCapability { bits_left: usize },
    /// A level needed more bits than the pointer had left, or the walk
    /// stopped early at a non-CNode capability.
    DepthMismatch { bits_found: usize, bits_left: usize },
    /// The guard bits in the pointer did not match the CNode's guard.
    GuardMismatch {
        guard: Word,
        bits_left: usize,
        guard_bits: usize,
    },
}

/// Result of a failed system call, reported to the invoker.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SyscallError {
    /// The capability at the given argument position has the wrong type or
    /// insufficient rights for the requested operation.
    InvalidCapability { index: usize },
    /// A non-capability argument is malformed.
    InvalidArgument { index: usize },
    /// The operation is never legal on this capability.
    IllegalOperation,
    /// A numeric argument fell outside its legal range.
    RangeError { min: Word, max: Word },
    /// Alignment requirement violated.
    AlignmentError,
    /// Fewer argument words were supplied than the method requires.
    TruncatedMessage,
    /// A capability-space walk failed. `source` distinguishes the
    /// source-side lookup of a transfer from the destination side.
    FailedLookup { source: bool, fault: LookupFault },
    /// An Untyped region cannot hold the requested objects.
    NotEnoughMemory { bytes_available: Word },
    /// The destination slot holds a capability that must be deleted first.
    DeleteFirst,
    /// The capability still has derived children that must be revoked
    /// first.
    RevokeFirst,
}

impl fmt::Display for SyscallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidCapability { index } => write!(f, "invalid capability at {}", index),
            Self::InvalidArgument { index } => write!(f, "invalid argument at {}", index),
            Self::IllegalOperation => write!(f, "illegal operation"),
            Self::RangeError { min, max } => write!(f, "argument out of range [{}, {}]", min, max),
            Self::AlignmentError => write!(f, "misaligned argument"),
            Self::TruncatedMessage => write!(f, "truncated message"),
            Self::FailedLookup { source, fault } => {
                let side = if *source { "source" } else { "destination" };
                write!(f, "failed {} lookup: {:?}", side, fault)
            }
            Self::NotEnoughMemory { bytes_available } => {
                write!(f, "not enough memory ({} bytes available)", bytes_available)
            }
            Self::DeleteFirst => write!(f, "destination must be deleted first"),
            Self::RevokeFirst => write!(f, "capability must be revoked first"),
        }
    }
}

impl SyscallError {
    /// Wire label written to the invoker's message-info register.
    pub fn label(&self) -> Word {
        match self {
            Self::InvalidCapability { .. } => 1,
            Self::InvalidArgument { .. } => 2,
            Self::IllegalOperation => 3,
            Self::RangeError { .. } => 4,
            Self::AlignmentError => 5,
            Self::TruncatedMessage => 6,
            Self::FailedLookup { .. } => 7,
            Self::NotEnoughMemory { .. } => 8,
            Self::DeleteFirst => 9,
            Self::RevokeFirst => 10,
        }
    }
}

/// Cooperative-restart signal: the kernel work quota for this entry ran out
/// or an interrupt is pending, and the operation must be re-entered.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Preempted;

/// Result of a committing invocation: either it finished, or it was cut
/// short at a preemption point and the caller re-enters later.
pub type InvokeResult = Result<(), Preempted>;

/// Result of a decode-phase check.
pub type DecodeResult<T> = Result<T, SyscallError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_labels_distinct() {
        let errors = [
            SyscallError::InvalidCapability { index: 0 },
            SyscallError::InvalidArgument { index: 0 },
            SyscallError::IllegalOperation,
            SyscallError::RangeError { min: 0, max: 1 },
            SyscallError::AlignmentError,
            SyscallError::TruncatedMessage,
            SyscallError::FailedLookup {
                source: true,
                fault: LookupFault::InvalidRoot,
            },
            SyscallError::NotEnoughMemory { bytes_available: 0 },
            SyscallError::DeleteFirst,
            SyscallError::RevokeFirst,
        ];
        for (i, a) in errors.iter().enumerate() {
            for b in &errors[i + 1..] {
                assert_ne!(a.label(), b.label());
            }
        }
    }
}
