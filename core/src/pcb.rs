//! # Process Control Blocks
//!
//! One PCB per bound process. The ready-list links are pid indices
//! into the scheduler's table, so the circular list is walkable
//! without pointers. The lock-holding bitmap is the high-order half of
//! the scheduling key: holders sort ahead of everything at their state
//! level so they run soon and release promptly.

use vela_types::{Asid, Clock, Pid};

use crate::ec::EcId;

bitflags::bitflags! {
    /// PCB state flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PcbFlags: u8 {
        /// Blocked on an event count.
        const WAITING = 0x01;
        /// Suspended.
        const SUSPENDED = 0x02;
        /// Suspension requested while inhibited; completes later.
        const DEFER_SUSPEND = 0x04;
        /// The slot is bound to a live process.
        const BOUND = 0x08;
        /// Ready-list reinsertion owed once the last lock drops.
        const REORDER_PENDING = 0x10;
    }
}

/// Why a parked process was woken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wakeup {
    /// The n-th event count of its wait was satisfied.
    Satisfied(usize),
    /// The process quit EC advanced during the wait.
    Quit,
}

/// A process control block.
#[derive(Debug)]
pub struct Pcb {
    /// Next pid on the circular ready list (self when unlisted).
    pub(crate) next: Pid,
    /// Previous pid on the circular ready list (self when unlisted).
    pub(crate) prev: Pid,
    /// Whether the PCB is currently linked into the ready list.
    pub in_ready_list: bool,

    /// This process's id.
    pub mypid: Pid,
    /// Address space the process runs in.
    pub asid: Asid,
    /// Remaining virtual-time ticks until preemption.
    pub vtimer: i16,
    /// CPU time accumulated since bind.
    pub cpu_total: Clock,
    /// Scheduling state; lower is higher priority at equal lock rank.
    pub state: u16,
    /// Floor the timeslice aging clamps the state to.
    pub state_floor: u16,
    /// Ceiling for operator priority changes.
    pub state_ceiling: u16,
    /// State flags.
    pub flags: PcbFlags,
    /// Nested preemption-inhibit depth.
    pub inhibit_count: u16,
    /// Bitmap of resource locks held (or being acquired).
    pub locks_held: u32,
    /// Clock high word sampled when the last wait began.
    pub wait_start: u32,
    /// Operator-assigned process type.
    pub proc_type: u16,

    /// This process's own event count.
    pub proc_ec: EcId,
    /// Advanced to cancel this process's waits.
    pub quit_ec: EcId,
    /// Wake reason parked here between wakeup and pickup.
    pub(crate) wakeup: Option<Wakeup>,
}

impl Pcb {
    pub(crate) fn new(pid: Pid, asid: Asid, state: u16, proc_ec: EcId, quit_ec: EcId) -> Self {
        Self {
            next: pid,
            prev: pid,
            in_ready_list: false,
            mypid: pid,
            asid,
            vtimer: 0,
            cpu_total: Clock::ZERO,
            state,
            state_floor: 1,
            state_ceiling: u16::MAX,
            flags: PcbFlags::BOUND,
            inhibit_count: 0,
            locks_held: 0,
            wait_start: 0,
            proc_type: 0,
            proc_ec,
            quit_ec,
            wakeup: None,
        }
    }

    /// True while the process may not be preempted or suspended.
    pub fn inhibited(&self) -> bool {
        self.inhibit_count != 0
    }

    /// True when the process is runnable (bound, not waiting, not
    /// suspended).
    pub fn runnable(&self) -> bool {
        self.flags.contains(PcbFlags::BOUND)
            && !self.flags.intersects(PcbFlags::WAITING | PcbFlags::SUSPENDED)
    }

    /// Ready-list sort key: more locks first, then lower state.
    pub(crate) fn sorts_before(&self, other: &Pcb) -> bool {
        self.locks_held > other.locks_held
            || (self.locks_held == other.locks_held && self.state < other.state)
    }
}

/// Snapshot returned by the process-information query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcInfo {
    /// Process id.
    pub pid: Pid,
    /// Address space id.
    pub asid: Asid,
    /// Scheduling state.
    pub state: u16,
    /// State flags.
    pub flags: PcbFlags,
    /// Lock-holding bitmap.
    pub locks_held: u32,
    /// Accumulated CPU time.
    pub cpu_total: Clock,
    /// Process type.
    pub proc_type: u16,
}
