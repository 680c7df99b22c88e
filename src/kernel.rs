//! Kernel State
//!
//! All kernel objects live in typed arenas owned by one [`Kernel`] value;
//! objects refer to each other by arena index, never by pointer. One
//! [`KernelLock`] serialises every kernel entry, so all operations run to
//! completion (or to an explicit preemption point) without fine-grained
//! locking.
//!
//! # Design
//! - Per-core scheduler state sits in [`CoreState`]; domain rotation is
//!   global
//! - Object destruction marks arena entries dead rather than removing
//!   them, so stale indices can never alias a recycled object
//! - [`Kernel::bootstrap`] plays the role of the boot protocol: it mints
//!   the initial CNode, thread and authority capabilities that all later
//!   objects derive from

use alloc::vec::Vec;

use crate::cap::{Capability, Slot};
use crate::config::{
    DOM_SCHEDULE, MIN_REFILLS, NUM_CORES, NUM_IRQS, SC_BITS, TCB_BITS, TCB_CNODE_SLOTS,
};
use crate::hal::Hal;
use crate::ipc::{Endpoint, Notification, Reply};
use crate::sched::queues::ReadyQueues;
use crate::sched::scheduler::SchedulerAction;
use crate::sched::{SchedContext, Tcb, ThreadState};
use crate::types::{CNodeIx, CoreId, Domain, EpIx, NtfnIx, Region, ReplyIx, ScIx, SlotIx, TcbIx, Ticks};

/// Ticks granted to each per-core idle scheduling context.
const IDLE_BUDGET: Ticks = 1_000;

/// Descriptor of one CNode: a contiguous run of `1 << radix` slots.
#[derive(Clone, Copy, Debug)]
pub struct CNodeMeta {
    pub base: SlotIx,
    pub radix: usize,
    /// Physical span the node was carved from.
    pub region: Region,
    pub live: bool,
}

/// Scheduler state owned by one core.
#[derive(Clone, Debug)]
pub struct CoreState {
    pub cur_thread: TcbIx,
    pub idle_thread: TcbIx,
    /// Scheduling context being charged for the current activity.
    pub cur_sc: ScIx,
    /// Pending scheduling decision, committed at kernel exit.
    pub action: SchedulerAction,
    pub ready: ReadyQueues,
    /// Time-ordered list of threads waiting for a refill to activate.
    pub release_head: Option<TcbIx>,
    /// Whether the deadline timer must be reprogrammed before exit.
    pub reprogram: bool,
    /// Ticks consumed since the last commit.
    pub consumed: Ticks,
}

/// Capabilities minted by [`Kernel::bootstrap`] for the initial task.
#[derive(Clone, Copy, Debug)]
pub struct BootCaps {
    /// The initial thread.
    pub tcb: TcbIx,
    /// The initial thread's scheduling context.
    pub sc: ScIx,
    /// The root CNode and the base of its slot run.
    pub cnode: CNodeIx,
    pub cnode_base: SlotIx,
    /// Well-known slots within the root CNode.
    pub root_cnode_slot: SlotIx,
    pub irq_control_slot: SlotIx,
    pub sched_control_slots: [SlotIx; NUM_CORES],
    pub untyped_slot: SlotIx,
}

/// Slot offsets used by [`Kernel::bootstrap`] within the root CNode.
const BOOT_CNODE_SLOT: usize = 1;
const BOOT_IRQ_CONTROL_SLOT: usize = 2;
const BOOT_SCHED_CONTROL_SLOT: usize = 3;
const BOOT_UNTYPED_SLOT: usize = BOOT_SCHED_CONTROL_SLOT + NUM_CORES;

/// The whole machine-independent kernel state.
pub struct Kernel<H: Hal> {
    pub hal: H,
    pub(crate) slots: Vec<Slot>,
    pub(crate) cnodes: Vec<CNodeMeta>,
    pub(crate) tcbs: Vec<Tcb>,
    pub(crate) endpoints: Vec<Endpoint>,
    pub(crate) notifications: Vec<Notification>,
    pub(crate) scs: Vec<SchedContext>,
    pub(crate) replies: Vec<Reply>,
    pub(crate) cores: Vec<CoreState>,
    /// Core executing the current kernel entry.
    pub(crate) current_core: CoreId,

    /// Position in the static domain schedule.
    pub(crate) dom_schedule_index: usize,
    pub(crate) cur_domain: Domain,
    /// Ticks left in the current domain's slice.
    pub(crate) domain_time: Ticks,
    /// Timestamp taken at the current kernel entry.
    pub(crate) cur_time: Ticks,

    /// Work units burned since the last preemption-point check.
    pub(crate) work_units: usize,

    /// Base of the interrupt dispatch slot run (one slot per line).
    pub(crate) irq_node: SlotIx,
    pub(crate) irq_active: [bool; NUM_IRQS],
}

impl<H: Hal> Kernel<H> {
    /// Build the kernel state with per-core idle threads and empty arenas.
    pub fn new(hal: H) -> Self {
        let mut kernel = Self {
            hal,
            slots: Vec::new(),
            cnodes: Vec::new(),
            tcbs: Vec::new(),
            endpoints: Vec::new(),
            notifications: Vec::new(),
            scs: Vec::new(),
            replies: Vec::new(),
            cores: Vec::new(),
            current_core: 0,
            dom_schedule_index: 0,
            cur_domain: DOM_SCHEDULE[0].0,
            domain_time: DOM_SCHEDULE[0].1,
            cur_time: 0,
            work_units: 0,
            irq_node: SlotIx::new(0),
            irq_active: [false; NUM_IRQS],
        };

        kernel.irq_node = kernel.alloc_slots(NUM_IRQS);

        for core in 0..NUM_CORES {
            let idle = kernel.create_tcb(Region::new(0, TCB_BITS));
            let idle_sc = kernel.create_sc(Region::new(0, SC_BITS));
            {
                let tcb = &mut kernel.tcbs[idle.index()];
                tcb.state = ThreadState::IdleThreadState;
                tcb.affinity = core;
                tcb.sched_context = Some(idle_sc);
            }
            {
                let sc = &mut kernel.scs[idle_sc.index()];
                sc.core = core;
                sc.tcb = Some(idle);
                sc.refill_new(MIN_REFILLS, IDLE_BUDGET, 0, 0);
            }
            kernel.cores.push(CoreState {
                cur_thread: idle,
                idle_thread: idle,
                cur_sc: idle_sc,
                action: SchedulerAction::ResumeCurrentThread,
                ready: ReadyQueues::new(),
                release_head: None,
                reprogram: false,
                consumed: 0,
            });
        }

        kernel
    }

    // ---- arena access ------------------------------------------------

    #[inline]
    pub(crate) fn core(&self) -> &CoreState {
        &self.cores[self.current_core]
    }

    #[inline]
    pub(crate) fn core_mut(&mut self) -> &mut CoreState {
        let core = self.current_core;
        &mut self.cores[core]
    }

    /// Thread running on the entering core.
    #[inline]
    pub fn cur_thread(&self) -> TcbIx {
        self.core().cur_thread
    }

    #[inline]
    pub(crate) fn slot(&self, ix: SlotIx) -> &Slot {
        &self.slots[ix.index()]
    }

    #[inline]
    pub(crate) fn slot_mut(&mut self, ix: SlotIx) -> &mut Slot {
        &mut self.slots[ix.index()]
    }

    #[inline]
    pub(crate) fn tcb(&self, ix: TcbIx) -> &Tcb {
        &self.tcbs[ix.index()]
    }

    #[inline]
    pub(crate) fn tcb_mut(&mut self, ix: TcbIx) -> &mut Tcb {
        &mut self.tcbs[ix.index()]
    }

    #[inline]
    pub(crate) fn ep(&self, ix: EpIx) -> &Endpoint {
        &self.endpoints[ix.index()]
    }

    #[inline]
    pub(crate) fn ep_mut(&mut self, ix: EpIx) -> &mut Endpoint {
        &mut self.endpoints[ix.index()]
    }

    #[inline]
    pub(crate) fn ntfn(&self, ix: NtfnIx) -> &Notification {
        &self.notifications[ix.index()]
    }

    #[inline]
    pub(crate) fn ntfn_mut(&mut self, ix: NtfnIx) -> &mut Notification {
        &mut self.notifications[ix.index()]
    }

    #[inline]
    pub(crate) fn sc(&self, ix: ScIx) -> &SchedContext {
        &self.scs[ix.index()]
    }

    #[inline]
    pub(crate) fn sc_mut(&mut self, ix: ScIx) -> &mut SchedContext {
        &mut self.scs[ix.index()]
    }

    #[inline]
    pub(crate) fn reply(&self, ix: ReplyIx) -> &Reply {
        &self.replies[ix.index()]
    }

    #[inline]
    pub(crate) fn reply_mut(&mut self, ix: ReplyIx) -> &mut Reply {
        &mut self.replies[ix.index()]
    }

    /// Slot holding the interrupt dispatch capability for `irq`.
    #[inline]
    pub(crate) fn irq_slot(&self, irq: usize) -> SlotIx {
        self.irq_node.add(irq)
    }

    // ---- object creation ---------------------------------------------

    /// Extend the slot arena by `count` empty slots, returning the base.
    pub(crate) fn alloc_slots(&mut self, count: usize) -> SlotIx {
        let base = SlotIx::new(self.slots.len());
        self.slots.resize(self.slots.len() + count, Slot::empty());
        base
    }

    /// Create a CNode with `1 << radix` slots.
    pub(crate) fn create_cnode(&mut self, radix: usize, region: Region) -> CNodeIx {
        let base = self.alloc_slots(1 << radix);
        let ix = CNodeIx::new(self.cnodes.len());
        self.cnodes.push(CNodeMeta { base, radix, region, live: true });
        ix
    }

    /// Create an inactive thread and its run of built-in slots.
    pub(crate) fn create_tcb(&mut self, region: Region) -> TcbIx {
        let base = self.alloc_slots(TCB_CNODE_SLOTS);
        let ix = TcbIx::new(self.tcbs.len());
        self.tcbs.push(Tcb::new(base, region));
        ix
    }

    pub(crate) fn create_endpoint(&mut self, region: Region) -> EpIx {
        let ix = EpIx::new(self.endpoints.len());
        self.endpoints.push(Endpoint::new(region));
        ix
    }

    pub(crate) fn create_notification(&mut self, region: Region) -> NtfnIx {
        let ix = NtfnIx::new(self.notifications.len());
        self.notifications.push(Notification::new(region));
        ix
    }

    pub(crate) fn create_sc(&mut self, region: Region) -> ScIx {
        let ix = ScIx::new(self.scs.len());
        self.scs.push(SchedContext::new(region));
        ix
    }

    pub(crate) fn create_reply(&mut self, region: Region) -> ReplyIx {
        let ix = ReplyIx::new(self.replies.len());
        self.replies.push(Reply::new(region));
        ix
    }

    // ---- bootstrap ----------------------------------------------------

    /// Mint the initial task: a root CNode of `1 << radix` slots holding
    /// the authority capabilities, plus a maximum-priority thread bound to
    /// a fresh scheduling context.
    ///
    /// The root CNode capability guards away all pointer bits above its
    /// radix, so depth-64 pointers resolve in a single level.
    pub fn bootstrap(&mut self, radix: usize, untyped: Region, budget: Ticks, period: Ticks) -> BootCaps {
        let cnode = self.create_cnode(radix, Region::new(0, radix + crate::config::SLOT_BITS));
        let cnode_base = self.cnodes[cnode.index()].base;

        let cnode_cap = Capability::CNode {
            cnode,
            radix,
            guard: 0,
            guard_bits: crate::config::WORD_BITS - radix,
        };

        let root_cnode_slot = cnode_base.add(BOOT_CNODE_SLOT);
        let irq_control_slot = cnode_base.add(BOOT_IRQ_CONTROL_SLOT);
        let untyped_slot = cnode_base.add(BOOT_UNTYPED_SLOT);

        self.write_boot_cap(root_cnode_slot, cnode_cap);
        self.write_boot_cap(irq_control_slot, Capability::IrqControl);
        let mut sched_control_slots = [SlotIx::new(0); NUM_CORES];
        for core in 0..NUM_CORES {
            let slot = cnode_base.add(BOOT_SCHED_CONTROL_SLOT + core);
            self.write_boot_cap(slot, Capability::SchedControl { core });
            sched_control_slots[core] = slot;
        }
        self.write_boot_cap(
            untyped_slot,
            Capability::Untyped { region: untyped, free_offset: 0, device: false },
        );

        let tcb = self.create_tcb(Region::new(0, TCB_BITS));
        let sc = self.create_sc(Region::new(0, SC_BITS));
        {
            let t = &mut self.tcbs[tcb.index()];
            t.prio = crate::config::NUM_PRIORITIES - 1;
            t.mcp = crate::config::NUM_PRIORITIES - 1;
            t.sched_context = Some(sc);
        }
        let now = self.cur_time;
        {
            let s = &mut self.scs[sc.index()];
            s.tcb = Some(tcb);
            s.refill_new(crate::config::MAX_REFILLS, budget, period, now);
        }
        let cspace_slot = self.tcb(tcb).cnode_base.add(crate::config::TCB_CSPACE_SLOT);
        self.write_boot_cap(cspace_slot, cnode_cap);
        self.write_boot_cap(
            cnode_base,
            Capability::Thread { tcb },
        );

        self.restart_thread(tcb);

        BootCaps {
            tcb,
            sc,
            cnode,
            cnode_base,
            root_cnode_slot,
            irq_control_slot,
            sched_control_slots,
            untyped_slot,
        }
    }

    /// Install a boot-time capability with no derivation parent.
    fn write_boot_cap(&mut self, slot: SlotIx, cap: Capability) {
        let s = self.slot_mut(slot);
        s.cap = cap;
        s.revocable = true;
        s.first_badged = matches!(
            cap,
            Capability::Endpoint { .. } | Capability::Notification { .. }
        );
    }
}

/// The big kernel lock: one entry at a time, interior state fully owned.
pub struct KernelLock<H: Hal> {
    inner: spin::Mutex<Kernel<H>>,
}

impl<H: Hal> KernelLock<H> {
    pub fn new(kernel: Kernel<H>) -> Self {
        Self { inner: spin::Mutex::new(kernel) }
    }

    /// Acquire the lock for one kernel entry.
    pub fn lock(&self) -> spin::MutexGuard<'_, Kernel<H>> {
        self.inner.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::mock::MockHal;

    #[test]
    fn test_new_kernel_has_idle_threads() {
        let kernel = Kernel::new(MockHal::new());
        assert_eq!(kernel.cores.len(), NUM_CORES);
        for core in &kernel.cores {
            assert_eq!(core.cur_thread, core.idle_thread);
            let idle = &kernel.tcbs[core.idle_thread.index()];
            assert_eq!(idle.state, ThreadState::IdleThreadState);
            let sc = &kernel.scs[core.cur_sc.index()];
            assert!(sc.is_round_robin());
        }
    }

    #[test]
    fn test_bootstrap_mints_authority_caps() {
        let mut kernel = Kernel::new(MockHal::new());
        let boot = kernel.bootstrap(8, Region::new(0x10_0000, 20), 10_000, 0);

        assert!(matches!(
            kernel.slot(boot.root_cnode_slot).cap,
            Capability::CNode { guard_bits: 56, .. }
        ));
        assert!(matches!(kernel.slot(boot.irq_control_slot).cap, Capability::IrqControl));
        assert!(matches!(
            kernel.slot(boot.untyped_slot).cap,
            Capability::Untyped { device: false, .. }
        ));
        for (core, slot) in boot.sched_control_slots.iter().enumerate() {
            match kernel.slot(*slot).cap {
                Capability::SchedControl { core: c } => assert_eq!(c, core),
                other => panic!("unexpected cap {:?}", other),
            }
        }

        let tcb = kernel.tcb(boot.tcb);
        assert!(tcb.state.is_runnable());
        assert_eq!(tcb.sched_context, Some(boot.sc));
    }
}
