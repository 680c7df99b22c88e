//! Kernel Configuration Constants
//!
//! Compile-time parameters for the scheduling and capability core.
//! Values mirror a small SMP configuration; all sizing is static because
//! the core has no heap of its own.

use crate::types::{Domain, Ticks};

/// Machine word width in bits. Capability pointers resolve up to this depth.
pub const WORD_BITS: usize = 64;

/// Number of thread priorities. Priority 255 is the most urgent.
pub const NUM_PRIORITIES: usize = 256;

/// Words in the level-2 priority bitmap (one bit per priority).
pub const L2_BITMAP_WORDS: usize = NUM_PRIORITIES / 64;

/// Number of scheduling domains.
pub const NUM_DOMAINS: usize = 4;

/// Number of logical cores.
pub const NUM_CORES: usize = 4;

/// Static domain schedule: `(domain, ticks)` entries applied round-robin.
pub const DOM_SCHEDULE: [(Domain, Ticks); NUM_DOMAINS] =
    [(0, 50_000), (1, 50_000), (2, 50_000), (3, 50_000)];

/// Minimum spendable budget chunk, in ticks. The head refill settles at or
/// above this floor so a woken thread can always enter and leave the kernel.
pub const MIN_BUDGET: Ticks = 200;

/// Hard cap on refill records per scheduling context.
pub const MAX_REFILLS: usize = 8;

/// Refill records used by a round-robin context (head plus used-time tail).
pub const MIN_REFILLS: usize = 2;

/// Inline message registers copied on every IPC transfer.
pub const MSG_REGISTERS: usize = 4;

/// Maximum message length in words (inline registers plus buffer overflow).
pub const MSG_MAX_LENGTH: usize = 120;

/// Maximum capabilities transferable alongside one message.
pub const MAX_EXTRA_CAPS: usize = 3;

/// Fixed offset of the capability-transfer descriptor in the IPC buffer.
pub const CAP_TRANSFER_OFFSET: usize = MSG_MAX_LENGTH + MAX_EXTRA_CAPS + 2;

/// Work units a long-running operation may burn before it must poll the
/// preemption point.
pub const WORK_UNITS_LIMIT: usize = 100;

/// log2 bytes per capability slot.
pub const SLOT_BITS: usize = 5;

/// log2 object sizes for Retype targets.
pub const EP_BITS: usize = 4;
pub const NTFN_BITS: usize = 5;
pub const TCB_BITS: usize = 10;
pub const SC_BITS: usize = 8;
pub const REPLY_BITS: usize = 5;
pub const FRAME_BITS: usize = 12;
pub const VSPACE_BITS: usize = 12;

/// Smallest and largest legal Untyped region, log2 bytes.
pub const MIN_UNTYPED_BITS: usize = 4;
pub const MAX_UNTYPED_BITS: usize = 47;

/// Largest CNode radix accepted by Retype.
pub const MAX_CNODE_RADIX: usize = 24;

/// Fixed capability slots owned by every thread control block.
pub const TCB_CNODE_SLOTS: usize = 5;

/// Offsets of a thread's built-in slots within its slot run.
pub const TCB_CSPACE_SLOT: usize = 0;
pub const TCB_VSPACE_SLOT: usize = 1;
pub const TCB_BUFFER_SLOT: usize = 2;
pub const TCB_FAULT_HANDLER_SLOT: usize = 3;
pub const TCB_TIMEOUT_HANDLER_SLOT: usize = 4;

/// Most objects one Retype may create.
pub const RETYPE_FAN_OUT_LIMIT: usize = 256;

/// Chunk of an Untyped region cleared between preemption checks during a
/// Retype reset.
pub const RESET_CHUNK_BITS: usize = 8;

/// Number of interrupt lines the core will hand out handlers for.
pub const NUM_IRQS: usize = 64;
