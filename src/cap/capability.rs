//! Capability Types and Rights
//!
//! A capability is a fixed-width tagged value naming a kernel object
//! together with the operations its holder may perform on it. User level
//! only ever sees capability pointers; the values themselves live in slots
//! and are copied out by the kernel after validation.
//!
//! # Design
//! The variant set is closed and small, so the type is a plain enum with
//! per-variant methods rather than open polymorphism. Object references
//! are arena indices; Untyped, Frame and VSpace capabilities carry their
//! physical span inline because the span *is* the object.

use bitflags::bitflags;

use crate::types::{Badge, CNodeIx, CoreId, EpIx, Irq, NtfnIx, Region, ReplyIx, ScIx, SlotIx, TcbIx, Word};

bitflags! {
    /// Rights carried by a capability.
    ///
    /// Deriving a capability can only clear bits, never set them.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct CapRights: u8 {
        /// Receive on an endpoint / wait on a notification / read a frame.
        const READ = 1 << 0;
        /// Send on an endpoint / signal a notification / write a frame.
        const WRITE = 1 << 1;
        /// Transfer capabilities through this endpoint.
        const GRANT = 1 << 2;
        /// Establish a reply path through this endpoint.
        const GRANT_REPLY = 1 << 3;
    }
}

/// What a Zombie used to be, and where its remaining sub-slots live.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ZombieKind {
    /// A half-deleted CNode; `radix` gives the original slot count.
    CNode { cnode: CNodeIx, radix: usize },
    /// A half-deleted thread; the run holds its built-in slots.
    Thread { tcb: TcbIx },
}

/// A typed, rights-scoped reference to a kernel object.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum Capability {
    /// The empty slot contents.
    #[default]
    Null,
    /// Raw, untyped physical memory; the sole source of new objects.
    Untyped {
        region: Region,
        /// Watermark: bytes of the region already consumed by Retype.
        free_offset: Word,
        /// Device memory cannot hold kernel objects, only frames.
        device: bool,
    },
    /// Synchronous IPC rendezvous object.
    Endpoint {
        ep: EpIx,
        badge: Badge,
        rights: CapRights,
    },
    /// Asynchronous signal object.
    Notification {
        ntfn: NtfnIx,
        badge: Badge,
        rights: CapRights,
    },
    /// One-shot right to answer a blocked caller.
    Reply { reply: ReplyIx, can_grant: bool },
    /// A capability table, with the guard prefix used during resolution.
    CNode {
        cnode: CNodeIx,
        radix: usize,
        guard: Word,
        guard_bits: usize,
    },
    /// A thread control block.
    Thread { tcb: TcbIx },
    /// Sporadic-budget scheduling context.
    SchedContext { sc: ScIx },
    /// Authority to configure scheduling contexts on one core.
    SchedControl { core: CoreId },
    /// A physical memory frame (IPC buffers, user mappings).
    Frame {
        region: Region,
        rights: CapRights,
        device: bool,
    },
    /// A top-level address space; consumed opaquely by the HAL.
    VSpace { region: Region },
    /// Authority to mint interrupt-handler capabilities.
    IrqControl,
    /// Authority over one interrupt line.
    IrqHandler { irq: Irq },
    /// Continuation of an interrupted composite deletion: `remaining`
    /// sub-slots starting at `base` are still to be cleared.
    Zombie {
        base: SlotIx,
        kind: ZombieKind,
        remaining: usize,
    },
}

impl Capability {
    /// Whether this is the null capability.
    #[inline]
    pub const fn is_null(&self) -> bool {
        matches!(self, Capability::Null)
    }

    /// Badge carried by endpoint/notification capabilities, zero otherwise.
    #[inline]
    pub fn badge(&self) -> Badge {
        match *self {
            Capability::Endpoint { badge, .. } | Capability::Notification { badge, .. } => badge,
            _ => 0,
        }
    }

    /// Short tag for diagnostics.
    pub fn tag(&self) -> &'static str {
        match self {
            Capability::Null => "null",
            Capability::Untyped { .. } => "untyped",
            Capability::Endpoint { .. } => "endpoint",
            Capability::Notification { .. } => "notification",
            Capability::Reply { .. } => "reply",
            Capability::CNode { .. } => "cnode",
            Capability::Thread { .. } => "thread",
            Capability::SchedContext { .. } => "sched-context",
            Capability::SchedControl { .. } => "sched-control",
            Capability::Frame { .. } => "frame",
            Capability::VSpace { .. } => "vspace",
            Capability::IrqControl => "irq-control",
            Capability::IrqHandler { .. } => "irq-handler",
            Capability::Zombie { .. } => "zombie",
        }
    }

    /// Apply a rights mask. Only rights-bearing variants change; masking
    /// can never add a right the capability does not already have.
    pub fn mask_rights(self, mask: CapRights) -> Self {
        match self {
            Capability::Endpoint { ep, badge, rights } => Capability::Endpoint {
                ep,
                badge,
                rights: rights & mask,
            },
            Capability::Notification { ntfn, badge, rights } => Capability::Notification {
                ntfn,
                badge,
                rights: rights & mask,
            },
            Capability::Frame { region, rights, device } => Capability::Frame {
                region,
                rights: rights & mask,
                device,
            },
            other => other,
        }
    }

    /// Apply a data word during Mint/Mutate: a badge for endpoint and
    /// notification capabilities, a guard descriptor for CNodes.
    ///
    /// Returns `Null` when the update is illegal (re-badging an already
    /// badged capability, oversized guard), which decode turns into
    /// `IllegalOperation`.
    pub fn update_data(self, preserve: bool, data: Word) -> Self {
        match self {
            Capability::Endpoint { ep, badge, rights } => {
                if preserve || data == 0 {
                    self
                } else if badge == 0 {
                    Capability::Endpoint { ep, badge: data, rights }
                } else {
                    Capability::Null
                }
            }
            Capability::Notification { ntfn, badge, rights } => {
                if preserve || data == 0 {
                    self
                } else if badge == 0 {
                    Capability::Notification { ntfn, badge: data, rights }
                } else {
                    Capability::Null
                }
            }
            Capability::CNode { cnode, radix, .. } => {
                // Guard descriptor word: guard value above 6 bits of size.
                let guard_bits = (data & 0x3f) as usize;
                let guard = (data >> 6) & ((1u64 << guard_bits) - 1);
                if guard_bits + radix > crate::config::WORD_BITS {
                    Capability::Null
                } else {
                    Capability::CNode { cnode, radix, guard, guard_bits }
                }
            }
            other => other,
        }
    }

    /// Whether a copy of `self` derived from `src` is revocable relative to
    /// it. Freshly badged endpoint/notification copies and children of
    /// Untyped or IrqControl are; plain copies are not.
    pub fn is_revocable(&self, src: &Capability) -> bool {
        match (self, src) {
            (Capability::Endpoint { badge: nb, .. }, Capability::Endpoint { badge: sb, .. }) => {
                nb != sb
            }
            (
                Capability::Notification { badge: nb, .. },
                Capability::Notification { badge: sb, .. },
            ) => nb != sb,
            (Capability::IrqHandler { .. }, Capability::IrqControl) => true,
            (Capability::Untyped { .. }, _) => true,
            _ => false,
        }
    }
}
