//! Message Transfer
//!
//! Moves one message from a committed sender to a committed receiver:
//! inline registers first, then IPC-buffer words, then any capabilities
//! riding along. A capability of the very endpoint the message crosses
//! is unwrapped into its badge instead of being copied; everything else
//! lands in the receiver's advertised receive slot, of which there is
//! exactly one per message.

use crate::cap::Capability;
use crate::config::{CAP_TRANSFER_OFFSET, MAX_EXTRA_CAPS, MSG_MAX_LENGTH, MSG_REGISTERS};
use crate::hal::{Hal, Register};
use crate::kernel::Kernel;
use crate::types::{Badge, EpIx, MessageInfo, SlotIx, TcbIx};

impl<H: Hal> Kernel<H> {
    /// Transfer from `sender` to `receiver`, either the pending message
    /// or, if the sender carries a fault, the fault on its behalf.
    pub(crate) fn do_ipc_transfer(
        &mut self,
        sender: TcbIx,
        ep: Option<EpIx>,
        badge: Badge,
        grant: bool,
        receiver: TcbIx,
    ) {
        if self.tcb(sender).fault.is_none() {
            self.do_normal_transfer(sender, ep, badge, grant, receiver);
        } else {
            self.do_fault_transfer(sender, receiver, badge);
        }
    }

    fn do_normal_transfer(
        &mut self,
        sender: TcbIx,
        ep: Option<EpIx>,
        badge: Badge,
        grant: bool,
        receiver: TcbIx,
    ) {
        let info = MessageInfo::from_word(self.hal.get_register(sender, Register::MsgInfo));
        let extra = if grant && ep.is_some() {
            self.lookup_extra_caps(sender, info.extra_caps)
        } else {
            [None; MAX_EXTRA_CAPS]
        };
        let length = self.copy_mrs(sender, receiver, info.length);
        let info = self.transfer_caps(info, &extra, ep, receiver);

        let info = MessageInfo { length, ..info };
        self.hal.set_register(receiver, Register::MsgInfo, info.to_word());
        self.hal.set_register(receiver, Register::Badge, badge);
    }

    /// Resolve the capability pointers riding in the sender's buffer. A
    /// missing buffer or a failed lookup truncates the list; the message
    /// itself still goes through.
    pub(crate) fn lookup_extra_caps(
        &self,
        sender: TcbIx,
        count: usize,
    ) -> [Option<SlotIx>; MAX_EXTRA_CAPS] {
        let mut slots = [None; MAX_EXTRA_CAPS];
        for (i, out) in slots.iter_mut().enumerate().take(count) {
            let Some(cptr) = self.hal.ipc_buffer_word(sender, MSG_MAX_LENGTH + i) else {
                break;
            };
            let Ok(slot) = self.lookup_slot(sender, cptr) else {
                break;
            };
            if self.slot(slot).is_empty() {
                break;
            }
            *out = Some(slot);
        }
        slots
    }

    /// Copy message words: the inline registers always move, buffer words
    /// move as far as both sides have a buffer mapped. Returns the number
    /// of words actually delivered.
    fn copy_mrs(&mut self, sender: TcbIx, receiver: TcbIx, length: usize) -> usize {
        let mut i = 0;
        while i < length && i < MSG_REGISTERS {
            let value = self.hal.get_register(sender, Register::Msg(i));
            self.hal.set_register(receiver, Register::Msg(i), value);
            i += 1;
        }
        while i < length {
            let Some(value) = self.hal.ipc_buffer_word(sender, i) else {
                break;
            };
            if !self.hal.set_ipc_buffer_word(receiver, i, value) {
                break;
            }
            i += 1;
        }
        i
    }

    /// Deliver the extra capabilities, unwrapping same-endpoint badges.
    /// Stops at the first capability that can neither be unwrapped nor
    /// placed; the count and unwrap mask in the returned info reflect
    /// what actually arrived.
    fn transfer_caps(
        &mut self,
        info: MessageInfo,
        extra: &[Option<SlotIx>; MAX_EXTRA_CAPS],
        ep: Option<EpIx>,
        receiver: TcbIx,
    ) -> MessageInfo {
        let mut caps_unwrapped = 0;
        let mut processed = 0;
        let mut recv_slot = self.get_receive_slot(receiver);

        for (i, entry) in extra.iter().enumerate() {
            let Some(slot) = *entry else { break };
            let cap = self.slot(slot).cap;
            match (cap, ep) {
                (Capability::Endpoint { ep: cap_ep, badge, .. }, Some(e)) if cap_ep == e => {
                    if !self.hal.set_ipc_buffer_word(receiver, MSG_MAX_LENGTH + i, badge) {
                        break;
                    }
                    caps_unwrapped |= 1 << i;
                }
                _ => {
                    let Some(dest) = recv_slot.take() else { break };
                    let Ok(derived) = self.derive_cap(slot, cap) else { break };
                    if derived.is_null() {
                        break;
                    }
                    self.cte_insert(derived, slot, dest);
                }
            }
            processed = i + 1;
        }
        MessageInfo {
            caps_unwrapped,
            extra_caps: processed,
            ..info
        }
    }

    /// The receiver's advertised receive slot: a three-word descriptor in
    /// its IPC buffer naming a CSpace root, an index and a depth. Absent,
    /// unresolvable or occupied means no capability can be received.
    fn get_receive_slot(&self, receiver: TcbIx) -> Option<SlotIx> {
        let root_ptr = self.hal.ipc_buffer_word(receiver, CAP_TRANSFER_OFFSET)?;
        let index = self.hal.ipc_buffer_word(receiver, CAP_TRANSFER_OFFSET + 1)?;
        let depth = self.hal.ipc_buffer_word(receiver, CAP_TRANSFER_OFFSET + 2)?;
        let root = self.lookup_cap(receiver, root_ptr).ok()?;
        let slot = self.lookup_target_slot(root, index, depth as usize).ok()?;
        if self.slot(slot).is_empty() {
            Some(slot)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cap::CapRights;
    use crate::config::{MAX_REFILLS, SC_BITS, TCB_BITS, TCB_CSPACE_SLOT, WORD_BITS};
    use crate::hal::mock::MockHal;
    use crate::ipc::EpState;
    use crate::sched::ThreadState;
    use crate::types::{Prio, Region, Word};

    fn kernel() -> (Kernel<MockHal>, Capability, SlotIx) {
        let mut k = Kernel::new(MockHal::new());
        let boot = k.bootstrap(8, Region::new(0x10_0000, 20), 10_000, 0);
        let root = k.slot(boot.root_cnode_slot).cap;
        (k, root, boot.cnode_base)
    }

    /// A runnable thread whose CSpace is the boot CNode.
    fn spawn(k: &mut Kernel<MockHal>, root: Capability, prio: Prio) -> TcbIx {
        let tcb = k.create_tcb(Region::new(0, TCB_BITS));
        let sc = k.create_sc(Region::new(0, SC_BITS));
        let now = k.cur_time;
        k.sc_mut(sc).refill_new(MAX_REFILLS, 10_000, 100_000, now);
        k.sc_mut(sc).tcb = Some(tcb);
        k.tcb_mut(tcb).sched_context = Some(sc);
        k.tcb_mut(tcb).prio = prio;
        k.tcb_mut(tcb).state = ThreadState::Running;
        let cspace = k.tcb(tcb).cnode_base.add(TCB_CSPACE_SLOT);
        k.slot_mut(cspace).cap = root;
        tcb
    }

    fn set_message(k: &mut Kernel<MockHal>, sender: TcbIx, info: MessageInfo, words: &[Word]) {
        k.hal.set_register(sender, Register::MsgInfo, info.to_word());
        for (i, w) in words.iter().enumerate() {
            if i < MSG_REGISTERS {
                k.hal.set_register(sender, Register::Msg(i), *w);
            } else {
                k.hal.set_ipc_buffer_word(sender, i, *w);
            }
        }
    }

    #[test]
    fn test_message_words_cross_registers_and_buffer() {
        let (mut k, root, _) = kernel();
        let sender = spawn(&mut k, root, 5);
        let receiver = spawn(&mut k, root, 5);
        k.hal.map_buffer(sender);
        k.hal.map_buffer(receiver);
        let ep = k.create_endpoint(Region::new(0x800, 4));

        let words: [Word; 6] = [10, 11, 12, 13, 14, 15];
        set_message(&mut k, sender, MessageInfo::new(0x5, 0, 0, 6), &words);

        k.receive_ipc(receiver, ep, true, None);
        k.send_ipc(true, false, 9, false, false, false, sender, ep);

        for (i, w) in words.iter().enumerate() {
            let got = if i < MSG_REGISTERS {
                k.hal.get_register(receiver, Register::Msg(i))
            } else {
                k.hal.ipc_buffer_word(receiver, i).unwrap()
            };
            assert_eq!(got, *w);
        }
        let info = MessageInfo::from_word(k.hal.get_register(receiver, Register::MsgInfo));
        assert_eq!(info.length, 6);
        assert_eq!(info.label, 0x5);
        assert_eq!(k.hal.get_register(receiver, Register::Badge), 9);
    }

    #[test]
    fn test_transfer_without_buffers_truncates_to_registers() {
        let (mut k, root, _) = kernel();
        let sender = spawn(&mut k, root, 5);
        let receiver = spawn(&mut k, root, 5);
        let ep = k.create_endpoint(Region::new(0x800, 4));

        set_message(&mut k, sender, MessageInfo::new(0, 0, 0, 6), &[1, 2, 3, 4]);
        k.receive_ipc(receiver, ep, true, None);
        k.send_ipc(true, false, 0, false, false, false, sender, ep);

        let info = MessageInfo::from_word(k.hal.get_register(receiver, Register::MsgInfo));
        assert_eq!(info.length, MSG_REGISTERS);
    }

    #[test]
    fn test_granted_capability_lands_in_receive_slot() {
        let (mut k, root, base) = kernel();
        let sender = spawn(&mut k, root, 5);
        let receiver = spawn(&mut k, root, 5);
        k.hal.map_buffer(sender);
        k.hal.map_buffer(receiver);
        let ep = k.create_endpoint(Region::new(0x800, 4));

        // A notification capability parked at slot 40 of the boot CNode.
        let ntfn = k.create_notification(Region::new(0x900, 5));
        let src = base.add(40);
        k.slot_mut(src).cap =
            Capability::Notification { ntfn, badge: 0, rights: CapRights::all() };
        k.slot_mut(src).revocable = true;

        // Receiver advertises slot 50 via the boot CNode capability.
        k.hal.set_ipc_buffer_word(receiver, CAP_TRANSFER_OFFSET, 1);
        k.hal.set_ipc_buffer_word(receiver, CAP_TRANSFER_OFFSET + 1, 50);
        k.hal.set_ipc_buffer_word(receiver, CAP_TRANSFER_OFFSET + 2, WORD_BITS as Word);

        set_message(&mut k, sender, MessageInfo::new(0, 0, 1, 0), &[]);
        k.hal.set_ipc_buffer_word(sender, MSG_MAX_LENGTH, 40);

        k.receive_ipc(receiver, ep, true, None);
        k.send_ipc(true, false, 0, true, false, false, sender, ep);

        let dest = base.add(50);
        assert!(matches!(
            k.slot(dest).cap,
            Capability::Notification { badge: 0, .. }
        ));
        assert!(k.is_mdb_parent_of(src, dest));
        let info = MessageInfo::from_word(k.hal.get_register(receiver, Register::MsgInfo));
        assert_eq!(info.extra_caps, 1);
        assert_eq!(info.caps_unwrapped, 0);
    }

    #[test]
    fn test_same_endpoint_capability_unwraps_to_badge() {
        let (mut k, root, base) = kernel();
        let sender = spawn(&mut k, root, 5);
        let receiver = spawn(&mut k, root, 5);
        k.hal.map_buffer(sender);
        k.hal.map_buffer(receiver);
        let ep = k.create_endpoint(Region::new(0x800, 4));

        let src = base.add(40);
        k.slot_mut(src).cap = Capability::Endpoint { ep, badge: 77, rights: CapRights::all() };
        k.slot_mut(src).revocable = true;
        k.slot_mut(src).first_badged = true;

        set_message(&mut k, sender, MessageInfo::new(0, 0, 1, 0), &[]);
        k.hal.set_ipc_buffer_word(sender, MSG_MAX_LENGTH, 40);

        k.receive_ipc(receiver, ep, true, None);
        k.send_ipc(true, false, 0, true, false, false, sender, ep);

        assert_eq!(k.hal.ipc_buffer_word(receiver, MSG_MAX_LENGTH), Some(77));
        let info = MessageInfo::from_word(k.hal.get_register(receiver, Register::MsgInfo));
        assert_eq!(info.caps_unwrapped, 1);
        assert_eq!(info.extra_caps, 1);
    }

    #[test]
    fn test_capabilities_stay_put_without_grant() {
        let (mut k, root, base) = kernel();
        let sender = spawn(&mut k, root, 5);
        let receiver = spawn(&mut k, root, 5);
        k.hal.map_buffer(sender);
        k.hal.map_buffer(receiver);
        let ep = k.create_endpoint(Region::new(0x800, 4));

        let ntfn = k.create_notification(Region::new(0x900, 5));
        k.slot_mut(base.add(40)).cap =
            Capability::Notification { ntfn, badge: 0, rights: CapRights::all() };
        k.hal.set_ipc_buffer_word(receiver, CAP_TRANSFER_OFFSET, 1);
        k.hal.set_ipc_buffer_word(receiver, CAP_TRANSFER_OFFSET + 1, 50);
        k.hal.set_ipc_buffer_word(receiver, CAP_TRANSFER_OFFSET + 2, WORD_BITS as Word);

        set_message(&mut k, sender, MessageInfo::new(0, 0, 1, 0), &[]);
        k.hal.set_ipc_buffer_word(sender, MSG_MAX_LENGTH, 40);

        k.receive_ipc(receiver, ep, true, None);
        k.send_ipc(true, false, 0, false, false, false, sender, ep);

        assert!(k.slot(base.add(50)).is_empty());
        let info = MessageInfo::from_word(k.hal.get_register(receiver, Register::MsgInfo));
        assert_eq!(info.extra_caps, 0);
        assert_eq!(k.ep(ep).state, EpState::Idle);
    }
}
