//! Capability-Space Resolution
//!
//! A CSpace is a guarded radix trie of CNodes. Resolving a capability
//! pointer consumes bits from the top: each level first strips the CNode's
//! guard, then indexes by its radix. Resolution stops early, successfully,
//! when it lands on a non-CNode capability with bits still unconsumed;
//! depth-bounded lookups reject exactly that case instead.

use crate::cap::Capability;
use crate::config::WORD_BITS;
use crate::error::{DecodeResult, LookupFault, SyscallError};
use crate::hal::Hal;
use crate::kernel::Kernel;
use crate::types::{CPtr, SlotIx, TcbIx, Word};

/// Result of a successful walk: the slot found and the bits the walk did
/// not consume.
#[derive(Clone, Copy, Debug)]
pub struct ResolvedSlot {
    pub slot: SlotIx,
    pub bits_remaining: usize,
}

#[inline]
fn mask(bits: usize) -> Word {
    if bits >= WORD_BITS {
        Word::MAX
    } else {
        (1u64 << bits) - 1
    }
}

impl<H: Hal> Kernel<H> {
    /// Walk a CSpace from `root` for up to `n_bits` pointer bits.
    pub(crate) fn resolve_address_bits(
        &self,
        root: Capability,
        cptr: CPtr,
        n_bits: usize,
    ) -> Result<ResolvedSlot, LookupFault> {
        let Capability::CNode { mut cnode, mut radix, mut guard, mut guard_bits } = root else {
            return Err(LookupFault::InvalidRoot);
        };

        let mut bits_left = n_bits;
        loop {
            let level_bits = radix + guard_bits;
            if level_bits > bits_left {
                return Err(LookupFault::DepthMismatch {
                    bits_found: level_bits,
                    bits_left,
                });
            }

            let found_guard = if guard_bits == 0 {
                0
            } else {
                (cptr >> (bits_left - guard_bits)) & mask(guard_bits)
            };
            if found_guard != guard {
                return Err(LookupFault::GuardMismatch {
                    guard,
                    bits_left,
                    guard_bits,
                });
            }

            let offset = ((cptr >> (bits_left - level_bits)) & mask(radix)) as usize;
            let slot = self.cnodes[cnode.index()].base.add(offset);
            bits_left -= level_bits;

            if bits_left == 0 {
                return Ok(ResolvedSlot { slot, bits_remaining: 0 });
            }

            match self.slot(slot).cap {
                Capability::CNode {
                    cnode: next,
                    radix: next_radix,
                    guard: next_guard,
                    guard_bits: next_guard_bits,
                } => {
                    cnode = next;
                    radix = next_radix;
                    guard = next_guard;
                    guard_bits = next_guard_bits;
                }
                // Early, successful stop at a non-CNode capability.
                _ => return Ok(ResolvedSlot { slot, bits_remaining: bits_left }),
            }
        }
    }

    /// The CSpace root capability of a thread.
    pub(crate) fn cspace_root(&self, thread: TcbIx) -> Capability {
        let slot = self.tcb(thread).cnode_base.add(crate::config::TCB_CSPACE_SLOT);
        self.slot(slot).cap
    }

    /// Resolve a full-depth capability pointer to its slot.
    pub(crate) fn lookup_slot(&self, thread: TcbIx, cptr: CPtr) -> Result<SlotIx, LookupFault> {
        let root = self.cspace_root(thread);
        let resolved = self.resolve_address_bits(root, cptr, WORD_BITS)?;
        Ok(resolved.slot)
    }

    /// Resolve a full-depth capability pointer to the capability it names.
    /// Failure reports a missing capability rather than a bare depth
    /// error, since the pointer named a whole path.
    pub(crate) fn lookup_cap(&self, thread: TcbIx, cptr: CPtr) -> Result<Capability, LookupFault> {
        let slot = self.lookup_slot(thread, cptr)?;
        Ok(self.slot(slot).cap)
    }

    /// Depth-exact slot lookup for CNode operations: the walk must consume
    /// exactly `depth` bits and may land on any slot, full or empty.
    pub(crate) fn lookup_slot_for_cnode_op(
        &self,
        source: bool,
        root: Capability,
        cptr: CPtr,
        depth: usize,
    ) -> DecodeResult<SlotIx> {
        if !matches!(root, Capability::CNode { .. }) {
            return Err(SyscallError::FailedLookup {
                source,
                fault: LookupFault::InvalidRoot,
            });
        }
        if depth < 1 || depth > WORD_BITS {
            return Err(SyscallError::RangeError {
                min: 1,
                max: WORD_BITS as Word,
            });
        }
        let resolved = self
            .resolve_address_bits(root, cptr, depth)
            .map_err(|fault| SyscallError::FailedLookup { source, fault })?;
        if resolved.bits_remaining != 0 {
            return Err(SyscallError::FailedLookup {
                source,
                fault: LookupFault::DepthMismatch {
                    bits_found: 0,
                    bits_left: resolved.bits_remaining,
                },
            });
        }
        Ok(resolved.slot)
    }

    /// Source-side depth-exact lookup requiring a present capability.
    pub(crate) fn lookup_source_slot(
        &self,
        root: Capability,
        cptr: CPtr,
        depth: usize,
    ) -> DecodeResult<SlotIx> {
        let slot = self.lookup_slot_for_cnode_op(true, root, cptr, depth)?;
        if self.slot(slot).is_empty() {
            return Err(SyscallError::FailedLookup {
                source: true,
                fault: LookupFault::MissingCapability { bits_left: 0 },
            });
        }
        Ok(slot)
    }

    /// Destination-side depth-exact lookup; the slot may be empty.
    pub(crate) fn lookup_target_slot(
        &self,
        root: Capability,
        cptr: CPtr,
        depth: usize,
    ) -> DecodeResult<SlotIx> {
        self.lookup_slot_for_cnode_op(false, root, cptr, depth)
    }

    /// Pivot-side lookup for three-way rotates; same rules as a target.
    pub(crate) fn lookup_pivot_slot(
        &self,
        root: Capability,
        cptr: CPtr,
        depth: usize,
    ) -> DecodeResult<SlotIx> {
        self.lookup_slot_for_cnode_op(false, root, cptr, depth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::mock::MockHal;
    use crate::types::Region;

    /// One root CNode of 2^8 slots guarded to a full 64-bit depth.
    fn kernel_with_root() -> (Kernel<MockHal>, Capability, TcbIx) {
        let mut k = Kernel::new(MockHal::new());
        let boot = k.bootstrap(8, Region::new(0x10_0000, 20), 10_000, 0);
        let root = k.slot(boot.root_cnode_slot).cap;
        (k, root, boot.tcb)
    }

    #[test]
    fn test_resolve_full_depth() {
        let (k, root, _) = kernel_with_root();
        // Slot 2 holds the IrqControl capability after bootstrap.
        let resolved = k.resolve_address_bits(root, 2, WORD_BITS).unwrap();
        assert_eq!(resolved.bits_remaining, 0);
        assert!(matches!(k.slot(resolved.slot).cap, Capability::IrqControl));
    }

    #[test]
    fn test_lookup_cap_through_thread_root() {
        let (k, _, tcb) = kernel_with_root();
        let cap = k.lookup_cap(tcb, 1).unwrap();
        assert!(matches!(cap, Capability::CNode { .. }));
    }

    #[test]
    fn test_guard_mismatch_reported() {
        let (k, root, _) = kernel_with_root();
        // Any high bit set violates the all-zero guard.
        let bad = 1u64 << 60;
        match k.resolve_address_bits(root, bad, WORD_BITS) {
            Err(LookupFault::GuardMismatch { guard: 0, .. }) => {}
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_non_cnode_root_rejected() {
        let (k, _, _) = kernel_with_root();
        let result = k.resolve_address_bits(Capability::IrqControl, 0, WORD_BITS);
        assert!(matches!(result, Err(LookupFault::InvalidRoot)));
    }

    #[test]
    fn test_two_level_resolution_stops_early_at_leaf() {
        let (mut k, root, _) = kernel_with_root();
        // Hang a second, unguarded CNode off slot 9 of the root.
        let child = k.create_cnode(4, Region::new(0x20_0000, 9));
        let child_cap = Capability::CNode { cnode: child, radix: 4, guard: 0, guard_bits: 0 };
        let (root_cnode, root_base) = match root {
            Capability::CNode { cnode, .. } => (cnode, k.cnodes[cnode.index()].base),
            _ => unreachable!(),
        };
        k.slot_mut(root_base.add(9)).cap = child_cap;
        let child_base = k.cnodes[child.index()].base;
        k.slot_mut(child_base.add(3)).cap = Capability::IrqControl;

        // An unguarded view of the root: the top 8 bits select slot 9,
        // the next 4 select slot 3 of the child, 52 bits are left over.
        let flat_root = Capability::CNode { cnode: root_cnode, radix: 8, guard: 0, guard_bits: 0 };
        let cptr = (9u64 << 56) | (3u64 << 52);
        let resolved = k.resolve_address_bits(flat_root, cptr, WORD_BITS).unwrap();
        assert_eq!(resolved.bits_remaining, 52);
        assert!(matches!(k.slot(resolved.slot).cap, Capability::IrqControl));
    }

    #[test]
    fn test_depth_exact_lookup_rejects_leftover_bits() {
        let (k, root, _) = kernel_with_root();
        let err = k.lookup_source_slot(root, 2 << 1, WORD_BITS - 1);
        assert!(matches!(
            err,
            Err(SyscallError::RangeError { .. }) | Err(SyscallError::FailedLookup { .. })
        ));
        // Depth zero is out of range outright.
        let err = k.lookup_target_slot(root, 0, 0);
        assert!(matches!(err, Err(SyscallError::RangeError { min: 1, .. })));
    }
}
