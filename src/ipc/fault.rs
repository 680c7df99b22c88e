//! Fault Delivery
//!
//! A fault is a message the kernel composes on a thread's behalf and
//! sends, as a call, through the thread's registered fault handler
//! endpoint. The handler answers through the reply object it received
//! with; the label of its answer is the verdict, zero meaning resume the
//! faulting thread.
//!
//! Budget expiry raises a [`Fault::Timeout`] through a separate timeout
//! handler endpoint, so a server's passive worker can be bailed out
//! without conflating it with a crash.

use crate::cap::Capability;
use crate::config::{
    MSG_REGISTERS, TCB_FAULT_HANDLER_SLOT, TCB_TIMEOUT_HANDLER_SLOT,
};
use crate::error::LookupFault;
use crate::hal::{Hal, Register};
use crate::kernel::Kernel;
use crate::sched::ThreadState;
use crate::types::{Badge, MessageInfo, TcbIx, Word};

/// Why a thread stopped running user code.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Fault {
    /// A capability lookup performed on the thread's behalf failed.
    CapFault {
        addr: Word,
        /// The failed lookup was the receive phase of an invocation.
        in_receive: bool,
        fault: LookupFault,
    },
    /// The thread trapped with a syscall number the kernel does not know.
    UnknownSyscall { syscall: Word },
    /// An architecture-defined user-level exception.
    UserException { number: Word, code: Word },
    /// The thread's scheduling context ran out of budget inside a
    /// timeout-fault-sensitive operation.
    Timeout { badge: Badge },
    /// A memory access the thread's address space cannot satisfy.
    VmFault {
        addr: Word,
        fsr: Word,
        instruction: Word,
    },
}

impl Fault {
    /// Wire label identifying the fault kind to the handler.
    pub fn label(&self) -> Word {
        match self {
            Fault::CapFault { .. } => 1,
            Fault::UnknownSyscall { .. } => 2,
            Fault::UserException { .. } => 3,
            Fault::Timeout { .. } => 5,
            Fault::VmFault { .. } => 6,
        }
    }

    /// Message words describing the fault, in wire order.
    fn message(&self) -> ([Word; 5], usize) {
        let mut words = [0; 5];
        let len = match *self {
            Fault::CapFault { addr, in_receive, fault } => {
                let (kind, a, b) = lookup_fault_words(fault);
                words[0] = addr;
                words[1] = in_receive as Word;
                words[2] = kind;
                words[3] = a;
                words[4] = b;
                5
            }
            Fault::UnknownSyscall { syscall } => {
                words[0] = syscall;
                1
            }
            Fault::UserException { number, code } => {
                words[0] = number;
                words[1] = code;
                2
            }
            Fault::Timeout { badge } => {
                words[0] = badge;
                1
            }
            Fault::VmFault { addr, fsr, instruction } => {
                words[0] = addr;
                words[1] = fsr;
                words[2] = instruction;
                3
            }
        };
        (words, len)
    }
}

/// Flatten a lookup fault into its wire triple.
pub(crate) fn lookup_fault_words(fault: LookupFault) -> (Word, Word, Word) {
    match fault {
        LookupFault::InvalidRoot => (0, 0, 0),
        LookupFault::MissingCapability { bits_left } => (1, bits_left as Word, 0),
        LookupFault::DepthMismatch { bits_found, bits_left } => {
            (2, bits_found as Word, bits_left as Word)
        }
        LookupFault::GuardMismatch { guard, bits_left, guard_bits } => {
            (3, guard, ((bits_left as Word) << 8) | guard_bits as Word)
        }
    }
}

impl<H: Hal> Kernel<H> {
    /// Compose the pending fault of `sender` into `receiver`'s message
    /// registers.
    pub(crate) fn do_fault_transfer(&mut self, sender: TcbIx, receiver: TcbIx, badge: Badge) {
        let Some(fault) = self.tcb(sender).fault else {
            return;
        };
        let (words, len) = fault.message();
        for (i, w) in words.iter().enumerate().take(len) {
            if i < MSG_REGISTERS {
                self.hal.set_register(receiver, Register::Msg(i), *w);
            } else if !self.hal.set_ipc_buffer_word(receiver, i, *w) {
                break;
            }
        }
        let info = MessageInfo::new(fault.label(), 0, 0, len);
        self.hal.set_register(receiver, Register::MsgInfo, info.to_word());
        self.hal.set_register(receiver, Register::Badge, badge);
    }

    /// Raise `fault` on behalf of `thread` and deliver it through the
    /// thread's fault handler endpoint.
    pub(crate) fn handle_fault(&mut self, thread: TcbIx, fault: Fault) {
        self.tcb_mut(thread).fault = Some(fault);
        let slot = self.tcb(thread).cnode_base.add(TCB_FAULT_HANDLER_SLOT);
        match self.slot(slot).cap {
            Capability::Endpoint { ep, badge, rights }
                if rights.contains(crate::cap::CapRights::WRITE) =>
            {
                let can_grant = rights.contains(crate::cap::CapRights::GRANT);
                let can_grant_reply = rights.contains(crate::cap::CapRights::GRANT_REPLY);
                let can_donate = self.tcb(thread).sched_context.is_some();
                self.send_ipc(true, false, badge, can_grant, can_grant_reply, can_donate, thread, ep);
            }
            _ => self.handle_no_fault_handler(thread, fault),
        }
    }

    /// A fault with nowhere to go stops the thread for good.
    fn handle_no_fault_handler(&mut self, thread: TcbIx, fault: Fault) {
        log::error!(
            "thread {:?} has no fault handler for {:?}, halting it",
            thread,
            fault
        );
        self.tcb_mut(thread).fault = None;
        self.set_thread_state(thread, ThreadState::Inactive);
    }

    /// Whether the thread's timeout handler slot holds a sendable
    /// endpoint capability.
    pub(crate) fn valid_timeout_handler(&self, thread: TcbIx) -> bool {
        let slot = self.tcb(thread).cnode_base.add(TCB_TIMEOUT_HANDLER_SLOT);
        matches!(
            self.slot(slot).cap,
            Capability::Endpoint { rights, .. }
                if rights.contains(crate::cap::CapRights::WRITE)
        )
    }

    /// Deliver a timeout fault through the thread's timeout handler.
    /// Unlike an ordinary fault the sender's context is never donated;
    /// the handler runs on its own budget.
    pub(crate) fn handle_timeout(&mut self, thread: TcbIx, badge: Badge) {
        self.tcb_mut(thread).fault = Some(Fault::Timeout { badge });
        let slot = self.tcb(thread).cnode_base.add(TCB_TIMEOUT_HANDLER_SLOT);
        let Capability::Endpoint { ep, badge: cap_badge, rights } = self.slot(slot).cap else {
            return;
        };
        let can_grant = rights.contains(crate::cap::CapRights::GRANT);
        let can_grant_reply = rights.contains(crate::cap::CapRights::GRANT_REPLY);
        self.send_ipc(true, false, cap_badge, can_grant, can_grant_reply, false, thread, ep);
    }

    /// Apply a handler's verdict to a faulted thread. A zero label means
    /// resume; anything else leaves the thread stopped.
    pub(crate) fn handle_fault_reply(&mut self, _receiver: TcbIx, sender: TcbIx) -> bool {
        let info = MessageInfo::from_word(self.hal.get_register(sender, Register::MsgInfo));
        info.label == 0
    }
}
