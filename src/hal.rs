//! Hardware Abstraction Boundary
//!
//! The core never touches page tables, saved register frames, timers or
//! interrupt controllers directly; it reaches them through [`Hal`]. The
//! trait is deliberately narrow: each method corresponds to one boundary
//! interaction named in the design (switch address space for a thread,
//! read/write an argument slot, reprogram the deadline timer, poke a
//! remote core).
//!
//! The kernel passes threads by arena index; the implementation maps that
//! to whatever per-thread context frame the architecture keeps.

use crate::types::{CoreId, Irq, TcbIx, Ticks, Word};

/// A virtual register of a thread's saved context.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum Register {
    /// Capability pointer naming the invoked object.
    CapPtr,
    /// Reply object offered alongside a receive.
    ReplyCPtr,
    /// Receives the badge of the capability a message arrived through.
    Badge,
    /// Message metadata word ([`crate::types::MessageInfo`]).
    MsgInfo,
    /// Inline message register `0..MSG_REGISTERS`.
    Msg(usize),
}

/// External collaborators of the scheduling and invocation core.
pub trait Hal {
    /// Install `thread`'s address space; called when it becomes current.
    fn switch_address_space(&mut self, thread: TcbIx);

    /// Read a virtual register from a thread's saved context.
    fn get_register(&self, thread: TcbIx, reg: Register) -> Word;

    /// Write a virtual register into a thread's saved context.
    fn set_register(&mut self, thread: TcbIx, reg: Register, value: Word);

    /// Program counter the thread restarts at after `Restart`.
    fn get_restart_pc(&self, thread: TcbIx) -> Word;

    /// Redirect the thread's next instruction (fault-handler entry,
    /// restarted syscalls).
    fn set_next_pc(&mut self, thread: TcbIx, pc: Word);

    /// Read a general-purpose register by frame index (TCB ReadRegisters).
    fn read_gp_register(&self, thread: TcbIx, index: usize) -> Word;

    /// Write a general-purpose register by frame index (TCB WriteRegisters).
    fn write_gp_register(&mut self, thread: TcbIx, index: usize, value: Word);

    /// Read word `index` of the thread's mapped IPC buffer, if any.
    fn ipc_buffer_word(&self, thread: TcbIx, index: usize) -> Option<Word>;

    /// Write word `index` of the thread's mapped IPC buffer. Returns false
    /// if no buffer is mapped.
    fn set_ipc_buffer_word(&mut self, thread: TcbIx, index: usize, value: Word) -> bool;

    /// Current time in ticks.
    fn timestamp(&mut self) -> Ticks;

    /// Arm the deadline timer.
    fn set_deadline(&mut self, deadline: Ticks);

    /// Acknowledge a handled interrupt line.
    fn ack_interrupt(&mut self, irq: Irq);

    /// Mask or unmask an interrupt line.
    fn mask_interrupt(&mut self, masked: bool, irq: Irq);

    /// Ask a remote core to run its scheduler; used instead of ever
    /// switching remote state synchronously.
    fn send_reschedule_ipi(&mut self, core: CoreId);

    /// Whether an interrupt is pending; polled at preemption points.
    fn interrupt_pending(&self) -> bool;
}

#[cfg(test)]
pub mod mock {
    //! A recording test double for the architecture boundary.

    use alloc::collections::BTreeMap;
    use alloc::vec::Vec;

    use super::{Hal, Register};
    use crate::types::{CoreId, Irq, TcbIx, Ticks, Word};

    /// In-memory [`Hal`] that records every boundary interaction.
    #[derive(Default)]
    pub struct MockHal {
        regs: BTreeMap<(u32, Register), Word>,
        gp_regs: BTreeMap<(u32, usize), Word>,
        buffers: BTreeMap<(u32, usize), Word>,
        /// Threads that have an IPC buffer mapped at all.
        pub mapped_buffers: Vec<TcbIx>,
        pub restart_pcs: BTreeMap<u32, Word>,
        pub next_pcs: Vec<(TcbIx, Word)>,
        pub switched_to: Vec<TcbIx>,
        pub deadlines: Vec<Ticks>,
        pub acked_irqs: Vec<Irq>,
        pub masked_irqs: Vec<(bool, Irq)>,
        pub ipis: Vec<CoreId>,
        pub now: Ticks,
        pub irq_pending: bool,
    }

    impl MockHal {
        pub fn new() -> Self {
            Self::default()
        }

        /// Map an IPC buffer for `thread` so buffer reads succeed.
        pub fn map_buffer(&mut self, thread: TcbIx) {
            if !self.mapped_buffers.contains(&thread) {
                self.mapped_buffers.push(thread);
            }
        }

        /// Advance the mock clock.
        pub fn tick(&mut self, delta: Ticks) {
            self.now += delta;
        }
    }

    impl Hal for MockHal {
        fn switch_address_space(&mut self, thread: TcbIx) {
            self.switched_to.push(thread);
        }

        fn get_register(&self, thread: TcbIx, reg: Register) -> Word {
            *self.regs.get(&(thread.0, reg)).unwrap_or(&0)
        }

        fn set_register(&mut self, thread: TcbIx, reg: Register, value: Word) {
            self.regs.insert((thread.0, reg), value);
        }

        fn get_restart_pc(&self, thread: TcbIx) -> Word {
            *self.restart_pcs.get(&thread.0).unwrap_or(&0)
        }

        fn set_next_pc(&mut self, thread: TcbIx, pc: Word) {
            self.next_pcs.push((thread, pc));
        }

        fn read_gp_register(&self, thread: TcbIx, index: usize) -> Word {
            *self.gp_regs.get(&(thread.0, index)).unwrap_or(&0)
        }

        fn write_gp_register(&mut self, thread: TcbIx, index: usize, value: Word) {
            self.gp_regs.insert((thread.0, index), value);
        }

        fn ipc_buffer_word(&self, thread: TcbIx, index: usize) -> Option<Word> {
            if self.mapped_buffers.contains(&thread) {
                Some(*self.buffers.get(&(thread.0, index)).unwrap_or(&0))
            } else {
                None
            }
        }

        fn set_ipc_buffer_word(&mut self, thread: TcbIx, index: usize, value: Word) -> bool {
            if self.mapped_buffers.contains(&thread) {
                self.buffers.insert((thread.0, index), value);
                true
            } else {
                false
            }
        }

        fn timestamp(&mut self) -> Ticks {
            self.now
        }

        fn set_deadline(&mut self, deadline: Ticks) {
            self.deadlines.push(deadline);
        }

        fn ack_interrupt(&mut self, irq: Irq) {
            self.acked_irqs.push(irq);
        }

        fn mask_interrupt(&mut self, masked: bool, irq: Irq) {
            self.masked_irqs.push((masked, irq));
        }

        fn send_reschedule_ipi(&mut self, core: CoreId) {
            self.ipis.push(core);
        }

        fn interrupt_pending(&self) -> bool {
            self.irq_pending
        }
    }
}
