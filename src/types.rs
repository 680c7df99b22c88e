//! Core Kernel Types
//!
//! Typed indices into the kernel's object arenas, plus the small scalar
//! aliases used throughout. Arena indices are newtypes so a slot index can
//! never be confused with a thread index at a call site; raw links inside
//! objects are `Option<…Ix>` rather than pointers, which keeps the
//! derivation list and scheduler queues free of aliasing hazards.

use core::fmt;

/// Machine word.
pub type Word = u64;

/// Kernel time in timer ticks.
pub type Ticks = u64;

/// Badge carried by endpoint and notification capabilities.
pub type Badge = u64;

/// A capability pointer: a path through a CSpace, resolved bit by bit.
pub type CPtr = u64;

/// Scheduling domain identifier.
pub type Domain = usize;

/// Logical core identifier.
pub type CoreId = usize;

/// Thread priority. Numerically higher is more urgent.
pub type Prio = usize;

/// Interrupt line number.
pub type Irq = usize;

macro_rules! arena_index {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(pub(crate) u32);

        impl $name {
            /// Wrap a raw arena offset.
            #[inline]
            pub const fn new(index: usize) -> Self {
                Self(index as u32)
            }

            /// Raw arena offset.
            #[inline]
            pub const fn index(self) -> usize {
                self.0 as usize
            }

            /// Offset this index by `n` slots within the same arena run.
            #[inline]
            pub const fn add(self, n: usize) -> Self {
                Self(self.0 + n as u32)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.0)
            }
        }
    };
}

arena_index! {
    /// Index of one capability slot in the global slot arena.
    SlotIx
}
arena_index! {
    /// Index of a thread control block.
    TcbIx
}
arena_index! {
    /// Index of an endpoint object.
    EpIx
}
arena_index! {
    /// Index of a notification object.
    NtfnIx
}
arena_index! {
    /// Index of a scheduling context.
    ScIx
}
arena_index! {
    /// Index of a reply object.
    ReplyIx
}
arena_index! {
    /// Index of a CNode (capability table) descriptor.
    CNodeIx
}

/// The physical span an object was carved from. Untyped capabilities cover
/// the spans of everything retyped out of them; all other capabilities
/// cover exactly their own object.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Region {
    /// First byte of the object.
    pub base: Word,
    /// log2 size in bytes.
    pub size_bits: usize,
}

impl Region {
    /// Create a region descriptor.
    #[inline]
    pub const fn new(base: Word, size_bits: usize) -> Self {
        Self { base, size_bits }
    }

    /// Exclusive end of the region.
    #[inline]
    pub const fn end(self) -> Word {
        self.base + (1u64 << self.size_bits)
    }

    /// Whether `other` lies entirely within this region.
    #[inline]
    pub const fn contains(self, other: Region) -> bool {
        self.base <= other.base && other.end() <= self.end()
    }
}

/// Message metadata exchanged on every IPC: a user-chosen label, the number
/// of message words, and how many extra capabilities ride along.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct MessageInfo {
    pub label: Word,
    pub caps_unwrapped: usize,
    pub extra_caps: usize,
    pub length: usize,
}

impl MessageInfo {
    /// Build message info, clamping the counts to their wire limits.
    pub fn new(label: Word, caps_unwrapped: usize, extra_caps: usize, length: usize) -> Self {
        Self {
            label,
            caps_unwrapped,
            extra_caps: extra_caps.min(crate::config::MAX_EXTRA_CAPS),
            length: length.min(crate::config::MSG_MAX_LENGTH),
        }
    }

    /// Pack into the wire word read and written through the message-info
    /// register.
    pub fn to_word(self) -> Word {
        (self.label << 12)
            | ((self.caps_unwrapped as Word & 0x7) << 9)
            | ((self.extra_caps as Word & 0x3) << 7)
            | (self.length as Word & 0x7f)
    }

    /// Unpack from the wire word.
    pub fn from_word(w: Word) -> Self {
        Self {
            label: w >> 12,
            caps_unwrapped: ((w >> 9) & 0x7) as usize,
            extra_caps: ((w >> 7) & 0x3) as usize,
            length: (w & 0x7f) as usize,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_containment() {
        let parent = Region::new(0x1000, 12);
        let child = Region::new(0x1800, 10);
        assert!(parent.contains(child));
        assert!(!child.contains(parent));
        assert!(parent.contains(parent));
    }

    #[test]
    fn test_message_info_round_trip() {
        let info = MessageInfo::new(0x42, 1, 2, 7);
        let back = MessageInfo::from_word(info.to_word());
        assert_eq!(info, back);
    }
}
