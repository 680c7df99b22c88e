//! Untyped Memory and Retype
//!
//! Untyped capabilities are the only source of new kernel objects. Each
//! carries a watermark (`free_offset`) below which its region has already
//! been consumed; Retype carves objects from the watermark upward and
//! records the new children in the derivation list, so revoking the
//! Untyped reclaims everything carved from it.
//!
//! A Retype against an Untyped with no surviving children first resets
//! it: the watermark is walked back to zero chunk by chunk, polling the
//! preemption point between chunks.

use crate::cap::capability::{CapRights, Capability};
use crate::config::{
    EP_BITS, MAX_CNODE_RADIX, MAX_UNTYPED_BITS, MIN_UNTYPED_BITS, NTFN_BITS, REPLY_BITS,
    RESET_CHUNK_BITS, RETYPE_FAN_OUT_LIMIT, SC_BITS, SLOT_BITS, TCB_BITS, VSPACE_BITS, FRAME_BITS,
};
use crate::error::{DecodeResult, InvokeResult, SyscallError};
use crate::hal::Hal;
use crate::kernel::Kernel;
use crate::types::{Region, SlotIx, Word};

/// Object kinds Retype can produce.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ObjectType {
    Untyped,
    Tcb,
    Endpoint,
    Notification,
    CNode,
    SchedContext,
    Reply,
    Frame,
    VSpace,
}

impl ObjectType {
    /// Decode the wire encoding of an object kind.
    pub fn from_word(w: Word) -> Option<Self> {
        match w {
            0 => Some(Self::Untyped),
            1 => Some(Self::Tcb),
            2 => Some(Self::Endpoint),
            3 => Some(Self::Notification),
            4 => Some(Self::CNode),
            5 => Some(Self::SchedContext),
            6 => Some(Self::Reply),
            7 => Some(Self::Frame),
            8 => Some(Self::VSpace),
            _ => None,
        }
    }

    /// log2 bytes one object of this kind occupies. Only Untyped and
    /// CNode objects have a user-chosen size.
    pub fn size_bits(self, user_bits: usize) -> usize {
        match self {
            Self::Untyped => user_bits,
            Self::Tcb => TCB_BITS,
            Self::Endpoint => EP_BITS,
            Self::Notification => NTFN_BITS,
            Self::CNode => user_bits + SLOT_BITS,
            Self::SchedContext => SC_BITS,
            Self::Reply => REPLY_BITS,
            Self::Frame => FRAME_BITS,
            Self::VSpace => VSPACE_BITS,
        }
    }
}

/// A validated Retype, ready to commit.
#[derive(Clone, Copy, Debug)]
pub(crate) struct RetypeCall {
    pub src: SlotIx,
    /// Walk the watermark back to zero before carving.
    pub reset: bool,
    pub obj_type: ObjectType,
    pub user_bits: usize,
    /// First byte of the first new object.
    pub base: Word,
    /// First destination slot; the window continues contiguously.
    pub dest: SlotIx,
    pub window: usize,
    /// Watermark after all objects are carved.
    pub free_offset_after: Word,
}

#[inline]
fn align_up(value: Word, bits: usize) -> Word {
    let align = 1u64 << bits;
    (value + align - 1) & !(align - 1)
}

impl<H: Hal> Kernel<H> {
    /// Validate a Retype request against the Untyped in `slot`.
    ///
    /// Argument words: object type, size argument, destination offset and
    /// window; `dest_root` arrives as the transfer's extra capability and
    /// names the CNode receiving the new capabilities.
    pub(crate) fn decode_retype(
        &self,
        slot: SlotIx,
        args: &[Word],
        dest_root: Capability,
    ) -> DecodeResult<RetypeCall> {
        if args.len() < 4 {
            return Err(SyscallError::TruncatedMessage);
        }
        let Capability::Untyped { region, free_offset, device } = self.slot(slot).cap else {
            return Err(SyscallError::InvalidCapability { index: 0 });
        };
        let Some(obj_type) = ObjectType::from_word(args[0]) else {
            return Err(SyscallError::InvalidArgument { index: 0 });
        };
        let user_bits = args[1] as usize;
        let node_offset = args[2] as usize;
        let window = args[3] as usize;

        match obj_type {
            ObjectType::Untyped => {
                if user_bits < MIN_UNTYPED_BITS || user_bits > MAX_UNTYPED_BITS {
                    return Err(SyscallError::RangeError {
                        min: MIN_UNTYPED_BITS as Word,
                        max: MAX_UNTYPED_BITS as Word,
                    });
                }
            }
            ObjectType::CNode => {
                if user_bits < 1 || user_bits > MAX_CNODE_RADIX {
                    return Err(SyscallError::RangeError {
                        min: 1,
                        max: MAX_CNODE_RADIX as Word,
                    });
                }
            }
            _ => {}
        }
        if device && !matches!(obj_type, ObjectType::Untyped | ObjectType::Frame) {
            return Err(SyscallError::InvalidArgument { index: 0 });
        }

        let Capability::CNode { cnode, radix, .. } = dest_root else {
            return Err(SyscallError::InvalidCapability { index: 1 });
        };
        if window < 1 || window > RETYPE_FAN_OUT_LIMIT {
            return Err(SyscallError::RangeError {
                min: 1,
                max: RETYPE_FAN_OUT_LIMIT as Word,
            });
        }
        if node_offset + window > 1 << radix {
            return Err(SyscallError::RangeError {
                min: 0,
                max: (1 << radix) as Word - window as Word,
            });
        }
        let dest = self.cnodes[cnode.index()].base.add(node_offset);
        for i in 0..window {
            self.ensure_empty_slot(dest.add(i))?;
        }

        // An Untyped with no surviving children is reclaimed in full.
        let reset = self.ensure_no_children(slot).is_ok();
        let free = if reset { 0 } else { free_offset };

        let obj_bits = obj_type.size_bits(user_bits);
        let aligned = align_up(free, obj_bits);
        let total = (window as Word) << obj_bits;
        let untyped_size = 1u64 << region.size_bits;
        if aligned > untyped_size || untyped_size - aligned < total {
            return Err(SyscallError::NotEnoughMemory {
                bytes_available: untyped_size - free,
            });
        }

        Ok(RetypeCall {
            src: slot,
            reset,
            obj_type,
            user_bits,
            base: region.base + aligned,
            dest,
            window,
            free_offset_after: aligned + total,
        })
    }

    /// Walk an Untyped's watermark back to zero, one chunk per work unit.
    fn reset_untyped(&mut self, slot: SlotIx) -> InvokeResult {
        let Capability::Untyped { region, free_offset, device } = self.slot(slot).cap else {
            return Ok(());
        };
        if free_offset == 0 {
            return Ok(());
        }
        // Device memory is never scrubbed; small regions go in one step.
        if device || region.size_bits <= RESET_CHUNK_BITS {
            self.slot_mut(slot).cap = Capability::Untyped { region, free_offset: 0, device };
            return Ok(());
        }
        let chunk = 1u64 << RESET_CHUNK_BITS;
        let mut offset = (free_offset - 1) & !(chunk - 1);
        loop {
            self.slot_mut(slot).cap = Capability::Untyped { region, free_offset: offset, device };
            if offset == 0 {
                return Ok(());
            }
            self.preemption_point()?;
            offset -= chunk;
        }
    }

    /// Commit a validated Retype: reset if due, advance the watermark,
    /// create the objects and record them as children of the Untyped.
    pub(crate) fn invoke_retype(&mut self, call: RetypeCall) -> InvokeResult {
        if call.reset {
            self.reset_untyped(call.src)?;
        }
        let Capability::Untyped { region, device, .. } = self.slot(call.src).cap else {
            return Ok(());
        };
        self.slot_mut(call.src).cap = Capability::Untyped {
            region,
            free_offset: call.free_offset_after,
            device,
        };

        let obj_bits = call.obj_type.size_bits(call.user_bits);
        for i in 0..call.window {
            let obj_region = Region::new(call.base + ((i as Word) << obj_bits), obj_bits);
            let cap = self.create_object(call.obj_type, call.user_bits, obj_region, device);
            self.insert_new_cap(call.src, call.dest.add(i), cap);
        }
        Ok(())
    }

    fn create_object(
        &mut self,
        obj_type: ObjectType,
        user_bits: usize,
        region: Region,
        device: bool,
    ) -> Capability {
        match obj_type {
            ObjectType::Untyped => Capability::Untyped { region, free_offset: 0, device },
            ObjectType::Tcb => {
                let tcb = self.create_tcb(region);
                Capability::Thread { tcb }
            }
            ObjectType::Endpoint => {
                let ep = self.create_endpoint(region);
                Capability::Endpoint { ep, badge: 0, rights: CapRights::all() }
            }
            ObjectType::Notification => {
                let ntfn = self.create_notification(region);
                Capability::Notification { ntfn, badge: 0, rights: CapRights::all() }
            }
            ObjectType::CNode => {
                let cnode = self.create_cnode(user_bits, region);
                Capability::CNode { cnode, radix: user_bits, guard: 0, guard_bits: 0 }
            }
            ObjectType::SchedContext => {
                let sc = self.create_sc(region);
                Capability::SchedContext { sc }
            }
            ObjectType::Reply => {
                let reply = self.create_reply(region);
                Capability::Reply { reply, can_grant: true }
            }
            ObjectType::Frame => Capability::Frame { region, rights: CapRights::all(), device },
            ObjectType::VSpace => Capability::VSpace { region },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Preempted;
    use crate::hal::mock::MockHal;

    fn kernel() -> (Kernel<MockHal>, SlotIx, Capability) {
        let mut k = Kernel::new(MockHal::new());
        let boot = k.bootstrap(8, Region::new(0x10_0000, 20), 10_000, 0);
        let root = k.slot(boot.root_cnode_slot).cap;
        (k, boot.cnode_base, root)
    }

    fn seed_untyped(k: &mut Kernel<MockHal>, slot: SlotIx, size_bits: usize) -> Region {
        let region = Region::new(0x40_0000, size_bits);
        let s = k.slot_mut(slot);
        s.cap = Capability::Untyped { region, free_offset: 0, device: false };
        s.revocable = true;
        region
    }

    #[test]
    fn test_retype_carves_endpoints_and_links_children() {
        let (mut k, base, root) = kernel();
        let src = base.add(20);
        let region = seed_untyped(&mut k, src, 16);

        let args = [2, 0, 30, 2];
        let call = k.decode_retype(src, &args, root).unwrap();
        k.invoke_retype(call).unwrap();

        for i in 0..2 {
            let slot = base.add(30 + i);
            match k.slot(slot).cap {
                Capability::Endpoint { badge: 0, .. } => {}
                other => panic!("unexpected capability {:?}", other),
            }
            assert!(k.is_mdb_parent_of(src, slot));
        }
        match k.slot(src).cap {
            Capability::Untyped { free_offset, .. } => {
                assert_eq!(free_offset, 2 << EP_BITS);
            }
            _ => panic!("source no longer untyped"),
        }
        // Object spans tile the region from its base.
        match k.slot(base.add(31)).cap {
            Capability::Endpoint { ep, .. } => {
                assert_eq!(k.ep(ep).region.base, region.base + (1 << EP_BITS));
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_retype_rejects_occupied_destination() {
        let (mut k, base, root) = kernel();
        let src = base.add(20);
        seed_untyped(&mut k, src, 16);
        k.slot_mut(base.add(30)).cap = Capability::IrqControl;

        let args = [2, 0, 30, 1];
        assert_eq!(
            k.decode_retype(src, &args, root).err(),
            Some(SyscallError::DeleteFirst)
        );
    }

    #[test]
    fn test_retype_reports_available_bytes_when_full() {
        let (mut k, base, root) = kernel();
        let src = base.add(20);
        seed_untyped(&mut k, src, 10);

        // Child blocks the implicit reset, so the watermark stands.
        let args = [0, 8, 30, 1];
        let call = k.decode_retype(src, &args, root).unwrap();
        k.invoke_retype(call).unwrap();

        let args = [0, 10, 31, 1];
        match k.decode_retype(src, &args, root) {
            Err(SyscallError::NotEnoughMemory { bytes_available }) => {
                assert_eq!(bytes_available, (1 << 10) - (1 << 8));
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_retype_resets_childless_untyped_first() {
        let (mut k, base, root) = kernel();
        let src = base.add(20);
        let region = seed_untyped(&mut k, src, 16);
        k.slot_mut(src).cap = Capability::Untyped {
            region,
            free_offset: 1 << 12,
            device: false,
        };

        let args = [2, 0, 30, 1];
        let call = k.decode_retype(src, &args, root).unwrap();
        assert!(call.reset);
        k.invoke_retype(call).unwrap();
        // The object sits at the region base, not above the stale mark.
        match k.slot(base.add(30)).cap {
            Capability::Endpoint { ep, .. } => assert_eq!(k.ep(ep).region.base, region.base),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_retype_respects_watermark_of_parent_with_children() {
        let (mut k, base, root) = kernel();
        let src = base.add(20);
        let region = seed_untyped(&mut k, src, 16);

        let args = [3, 0, 30, 1];
        let call = k.decode_retype(src, &args, root).unwrap();
        k.invoke_retype(call).unwrap();

        // Second carve must not reset, and must align above the first.
        let args = [1, 0, 31, 1];
        let call = k.decode_retype(src, &args, root).unwrap();
        assert!(!call.reset);
        assert_eq!(call.base, region.base + (1 << TCB_BITS));
    }

    #[test]
    fn test_device_untyped_only_yields_frames_and_untypeds() {
        let (mut k, base, root) = kernel();
        let src = base.add(20);
        let region = Region::new(0x8000_0000, 16);
        k.slot_mut(src).cap = Capability::Untyped { region, free_offset: 0, device: true };
        k.slot_mut(src).revocable = true;

        let args = [2, 0, 30, 1];
        assert_eq!(
            k.decode_retype(src, &args, root).err(),
            Some(SyscallError::InvalidArgument { index: 0 })
        );
        let args = [7, 0, 30, 1];
        let call = k.decode_retype(src, &args, root).unwrap();
        k.invoke_retype(call).unwrap();
        match k.slot(base.add(30)).cap {
            Capability::Frame { device: true, .. } => {}
            other => panic!("unexpected capability {:?}", other),
        }
    }

    #[test]
    fn test_reset_preempts_under_pending_interrupt() {
        let (mut k, base, root) = kernel();
        let src = base.add(20);
        let region = seed_untyped(&mut k, src, 20);
        let high_mark = 1u64 << 19;
        k.slot_mut(src).cap = Capability::Untyped {
            region,
            free_offset: high_mark,
            device: false,
        };

        k.hal.irq_pending = true;
        let args = [2, 0, 30, 1];
        let call = k.decode_retype(src, &args, root).unwrap();
        assert_eq!(k.invoke_retype(call), Err(Preempted));
        // Partial progress is recorded in the watermark.
        match k.slot(src).cap {
            Capability::Untyped { free_offset, .. } => {
                assert!(free_offset < high_mark);
                assert!(free_offset > 0);
            }
            _ => unreachable!(),
        }

        k.hal.irq_pending = false;
        let call = k.decode_retype(src, &args, root).unwrap();
        k.invoke_retype(call).unwrap();
        match k.slot(src).cap {
            Capability::Untyped { free_offset, .. } => assert_eq!(free_offset, 1 << EP_BITS),
            _ => unreachable!(),
        }
    }
}
