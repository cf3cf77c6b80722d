//! # Scheduler and Ready List
//!
//! The ready list is a circular doubly linked list of bound, runnable
//! processes, sorted by (locks held descending, state ascending).
//! That key floats lock holders to the head so they run and release
//! quickly; within a lock rank, lower state runs first. The dispatcher
//! simply takes the head.
//!
//! Insertion is a linear walk from the head - the list is never longer
//! than the bound-process count, and on this class of machine that is
//! small.
//!
//! Operations that need event counts (blocking waits, suspension with
//! its wakeup, lock acquisition) layer on top of this module in
//! [`crate::kernel`].

use alloc::vec::Vec;
use vela_hal::ipl;
use vela_types::status::{proc, Status};
use vela_types::{Asid, Clock, KernelResult, Pid};

use crate::crash;
use crate::pcb::{Pcb, PcbFlags, ProcInfo};

// =============================================================================
// Constants
// =============================================================================

/// Maximum number of bound processes.
pub const MAX_PROCESSES: usize = 64;

/// Number of scheduling states the timeslice table covers.
pub const MAX_STATES: usize = 32;

/// Default timeslice, in virtual-time ticks.
pub const DEFAULT_TIMESLICE: i16 = 0x0800;

/// Timeslice value meaning "never expire" (used by the idle process).
pub const TIMESLICE_MAX: i16 = -1;

// =============================================================================
// Scheduler
// =============================================================================

/// The process table, ready list and dispatch state.
#[derive(Debug)]
pub struct Scheduler {
    pcbs: Vec<Option<Pcb>>,
    head: Option<Pid>,
    current: Pid,
    ready_count: u16,
    atomic_depth: u16,
    timeslice_table: [i16; MAX_STATES],
}

impl Scheduler {
    /// An empty scheduler; processes are bound by the kernel wrapper.
    pub(crate) fn empty() -> Self {
        let mut pcbs = Vec::with_capacity(MAX_PROCESSES + 1);
        for _ in 0..=MAX_PROCESSES {
            pcbs.push(None);
        }
        Self {
            pcbs,
            head: None,
            current: Pid(0),
            ready_count: 0,
            atomic_depth: 0,
            timeslice_table: [DEFAULT_TIMESLICE; MAX_STATES],
        }
    }

    // =========================================================================
    // PCB access
    // =========================================================================

    /// Borrow a bound PCB.
    pub fn pcb(&self, pid: Pid) -> Option<&Pcb> {
        self.pcbs.get(pid.index()).and_then(|s| s.as_ref())
    }

    /// Mutably borrow a bound PCB.
    pub fn pcb_mut(&mut self, pid: Pid) -> Option<&mut Pcb> {
        self.pcbs.get_mut(pid.index()).and_then(|s| s.as_mut())
    }

    fn pcb_ref(&self, pid: Pid) -> &Pcb {
        match self.pcb(pid) {
            Some(p) => p,
            None => crash::crash_system(proc::ILLEGAL_PROCESS_ID, crash::ILLEGAL_PROCESS_ID),
        }
    }

    /// Validate a pid and return its PCB or the matching status.
    pub fn checked_pcb(&self, pid: Pid) -> KernelResult<&Pcb> {
        if pid.value() == 0 || pid.index() > MAX_PROCESSES {
            return Err(proc::ILLEGAL_PROCESS_ID);
        }
        self.pcb(pid).ok_or(proc::NOT_BOUND)
    }

    pub(crate) fn first_free_slot(&self) -> Option<Pid> {
        (1..=MAX_PROCESSES).map(|i| Pid(i as u16)).find(|p| self.pcb(*p).is_none())
    }

    pub(crate) fn install(&mut self, pcb: Pcb) {
        let pid = pcb.mypid;
        self.pcbs[pid.index()] = Some(pcb);
    }

    pub(crate) fn evict(&mut self, pid: Pid) {
        self.pcbs[pid.index()] = None;
    }

    // =========================================================================
    // Dispatch state
    // =========================================================================

    /// The currently dispatched process.
    pub fn current(&self) -> Pid {
        self.current
    }

    /// The ready-list head.
    pub fn ready_head(&self) -> Option<Pid> {
        self.head
    }

    /// Number of processes on the ready list.
    pub fn ready_count(&self) -> u16 {
        self.ready_count
    }

    /// Set the currently running process.
    pub fn set_current(&mut self, pid: Pid) {
        self.current = pid;
    }

    /// Select the ready-list head as the current process.
    ///
    /// Dispatching inside an atomic operation is an invariant
    /// violation and stops the system.
    pub fn dispatch(&mut self) {
        if self.atomic_depth != 0 {
            crash::crash_system(
                Status::new(vela_types::status::subsys::PROC, 0x000F),
                "dispatch inside atomic operation",
            );
        }
        if let Some(head) = self.head {
            self.current = head;
        }
    }

    // =========================================================================
    // Atomic-op depth
    // =========================================================================

    /// Enter a region that mutates scheduling metadata.
    pub fn begin_atomic_op(&mut self) {
        self.atomic_depth += 1;
    }

    /// Leave an atomic region.
    pub fn end_atomic_op(&mut self) {
        debug_assert!(self.atomic_depth > 0);
        self.atomic_depth -= 1;
    }

    // =========================================================================
    // Ready list
    // =========================================================================

    /// Insert a PCB into the ready list at its sort position.
    pub(crate) fn insert_into_ready_list(&mut self, pid: Pid) {
        debug_assert!(!self.pcb_ref(pid).in_ready_list);

        match self.head {
            None => {
                let pcb = self.pcb_mut(pid).unwrap();
                pcb.next = pid;
                pcb.prev = pid;
                pcb.in_ready_list = true;
                self.head = Some(pid);
            }
            Some(head) => {
                // First node the newcomer sorts strictly before; a full
                // cycle without one means it joins at the tail.
                let mut anchor = head;
                let mut becomes_head = false;
                let mut pos = head;
                loop {
                    if self.pcb_ref(pid).sorts_before(self.pcb_ref(pos)) {
                        anchor = pos;
                        becomes_head = pos == head;
                        break;
                    }
                    pos = self.pcb_ref(pos).next;
                    if pos == head {
                        anchor = head;
                        break;
                    }
                }

                let prev = self.pcb_ref(anchor).prev;
                {
                    let pcb = self.pcb_mut(pid).unwrap();
                    pcb.next = anchor;
                    pcb.prev = prev;
                    pcb.in_ready_list = true;
                }
                self.pcb_mut(anchor).unwrap().prev = pid;
                self.pcb_mut(prev).unwrap().next = pid;
                if becomes_head {
                    self.head = Some(pid);
                }
            }
        }
        self.ready_count += 1;
    }

    /// Unlink a PCB from the ready list.
    pub(crate) fn remove_from_ready_list(&mut self, pid: Pid) {
        debug_assert!(self.pcb_ref(pid).in_ready_list);

        let (next, prev) = {
            let pcb = self.pcb_ref(pid);
            (pcb.next, pcb.prev)
        };

        if next == pid {
            self.head = None;
        } else {
            self.pcb_mut(prev).unwrap().next = next;
            self.pcb_mut(next).unwrap().prev = prev;
            if self.head == Some(pid) {
                self.head = Some(next);
            }
        }

        let pcb = self.pcb_mut(pid).unwrap();
        pcb.next = pid;
        pcb.prev = pid;
        pcb.in_ready_list = false;
        self.ready_count -= 1;
    }

    /// Insert under raised IPL.
    pub fn add_ready(&mut self, pid: Pid) {
        ipl::with_raised_ipl(|| self.insert_into_ready_list(pid));
    }

    /// Remove under raised IPL.
    pub fn remove_ready(&mut self, pid: Pid) {
        ipl::with_raised_ipl(|| self.remove_from_ready_list(pid));
    }

    /// Re-sort one PCB if its key changed relative to its neighbors.
    pub(crate) fn reorder_if_needed(&mut self, pid: Pid) {
        if !self.pcb_ref(pid).in_ready_list {
            return;
        }
        let head = match self.head {
            Some(h) => h,
            None => return,
        };

        // Out of order against the previous node (unless we are the head).
        if pid != head {
            let prev = self.pcb_ref(pid).prev;
            if self.pcb_ref(pid).sorts_before(self.pcb_ref(prev)) {
                self.remove_from_ready_list(pid);
                self.insert_into_ready_list(pid);
                return;
            }
        }

        // Out of order against the next node (unless we are the tail).
        let next = self.pcb_ref(pid).next;
        if next != head && next != pid && self.pcb_ref(next).sorts_before(self.pcb_ref(pid)) {
            self.remove_from_ready_list(pid);
            self.insert_into_ready_list(pid);
        }
    }

    // =========================================================================
    // Inhibit regions
    // =========================================================================

    /// Raise the current process's preemption-inhibit depth.
    pub fn inhibit_begin(&mut self) {
        let current = self.current;
        if let Some(pcb) = self.pcb_mut(current) {
            pcb.inhibit_count += 1;
        }
    }

    /// True when the process may not be suspended or preempted.
    pub fn inhibit_check(&self, pid: Pid) -> bool {
        self.pcb(pid).is_some_and(Pcb::inhibited)
    }

    // =========================================================================
    // Virtual time and timeslices
    // =========================================================================

    /// Virtual-timer interrupt: fold the elapsed slice into the
    /// current process's CPU total and reset the timer.
    pub fn vt_int(&mut self) -> Clock {
        let current = self.current;
        let pcb = self.pcb_mut(current).expect("current process is bound");
        let delta = Clock::new(0, pcb.vtimer as u16);
        pcb.cpu_total = pcb.cpu_total.wrapping_add(delta);
        pcb.vtimer = 0;
        pcb.cpu_total
    }

    /// Set a process's virtual timer.
    pub fn set_vt(&mut self, pid: Pid, value: i16) -> Status {
        match self.checked_pcb(pid) {
            Ok(_) => {
                self.pcb_mut(pid).unwrap().vtimer = value;
                Status::OK
            }
            Err(status) => status,
        }
    }

    /// Timeslice-end aging: step the state toward its floor, requeue,
    /// and return the next timeslice to program.
    ///
    /// The idle process keeps its state and gets the maximum slice.
    pub fn ts_end(&mut self, pid: Pid) -> i16 {
        if pid == Pid::IDLE {
            return TIMESLICE_MAX;
        }
        let Some(pcb) = self.pcb_mut(pid) else {
            return TIMESLICE_MAX;
        };
        let floor = pcb.state_floor;
        if pcb.state > floor {
            pcb.state -= 1;
        }
        let state = pcb.state;
        let has_locks = pcb.locks_held != 0;
        let listed = pcb.in_ready_list;

        if listed {
            if has_locks {
                // Holders keep their boost; the full reinsertion is
                // owed when the last lock drops.
                self.reorder_if_needed(pid);
                self.pcb_mut(pid).unwrap().flags |= PcbFlags::REORDER_PENDING;
            } else {
                self.remove_from_ready_list(pid);
                self.insert_into_ready_list(pid);
            }
        }

        self.timeslice_table[(state as usize).min(MAX_STATES - 1)]
    }

    /// Replace one timeslice-table entry.
    pub fn set_timeslice(&mut self, state: u16, ticks: i16) {
        if (state as usize) < MAX_STATES {
            self.timeslice_table[state as usize] = ticks;
        }
    }

    // =========================================================================
    // Queries and operator controls
    // =========================================================================

    /// CPU time consumed by a process since bind.
    pub fn get_cput(&self, pid: Pid) -> KernelResult<Clock> {
        Ok(self.checked_pcb(pid)?.cpu_total)
    }

    /// CPU time low half, for the legacy usage counter.
    pub fn get_cpu_usage(&self, pid: Pid) -> KernelResult<u32> {
        Ok(self.checked_pcb(pid)?.cpu_total.as_ticks() as u32)
    }

    /// Snapshot a process's scheduling state.
    pub fn get_info(&self, pid: Pid) -> KernelResult<ProcInfo> {
        let pcb = self.checked_pcb(pid)?;
        Ok(ProcInfo {
            pid: pcb.mypid,
            asid: pcb.asid,
            state: pcb.state,
            flags: pcb.flags,
            locks_held: pcb.locks_held,
            cpu_total: pcb.cpu_total,
            proc_type: pcb.proc_type,
        })
    }

    /// List all bound pids.
    pub fn get_list(&self) -> Vec<Pid> {
        (1..=MAX_PROCESSES)
            .map(|i| Pid(i as u16))
            .filter(|p| self.pcb(*p).is_some())
            .collect()
    }

    /// Set a process's state clamp range and clamp its state into it.
    pub fn set_priority(&mut self, pid: Pid, floor: u16, ceiling: u16) -> Status {
        if floor > ceiling {
            return proc::ILLEGAL_PROCESS_ID;
        }
        match self.checked_pcb(pid) {
            Ok(_) => {
                let pcb = self.pcb_mut(pid).unwrap();
                pcb.state_floor = floor;
                pcb.state_ceiling = ceiling;
                pcb.state = pcb.state.clamp(floor, ceiling);
                let listed = pcb.in_ready_list;
                if listed {
                    self.reorder_if_needed(pid);
                }
                Status::OK
            }
            Err(status) => status,
        }
    }

    /// Set a process's type word.
    pub fn set_type(&mut self, pid: Pid, proc_type: u16) -> Status {
        match self.checked_pcb(pid) {
            Ok(_) => {
                self.pcb_mut(pid).unwrap().proc_type = proc_type;
                Status::OK
            }
            Err(status) => status,
        }
    }

    /// Read a process's type word.
    pub fn get_type(&self, pid: Pid) -> u16 {
        self.pcb(pid).map_or(0, |p| p.proc_type)
    }

    /// Bind the current process to an address space.
    pub fn set_asid(&mut self, asid: Asid) {
        let current = self.current;
        if let Some(pcb) = self.pcb_mut(current) {
            pcb.asid = asid;
        }
    }

    /// The current process's lock bitmap.
    pub fn get_locks(&self) -> u32 {
        self.pcb(self.current).map_or(0, |p| p.locks_held)
    }

    /// Test whether the current process holds a lock bit.
    pub fn tst_lock(&self, lock_bit: u16) -> bool {
        self.get_locks() & (1u32 << (lock_bit & 0x1F)) != 0
    }

    // =========================================================================
    // Invariant checking (test support)
    // =========================================================================

    /// Verify the ready-list ordering invariant: walking from the head,
    /// keys are non-increasing in (locks desc, state asc) order.
    pub fn ready_list_ordered(&self) -> bool {
        let Some(head) = self.head else { return true };
        let mut pos = head;
        loop {
            let next = self.pcb_ref(pos).next;
            if next == head {
                return true;
            }
            if self.pcb_ref(next).sorts_before(self.pcb_ref(pos)) {
                return false;
            }
            pos = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ec::EcId;
    use proptest::prelude::*;

    fn scheduler_with(entries: &[(u32, u16)]) -> Scheduler {
        let mut s = Scheduler::empty();
        for (i, &(locks, state)) in entries.iter().enumerate() {
            let pid = Pid(i as u16 + 1);
            let mut pcb = Pcb::new(pid, Asid(0), state, EcId(0), EcId(0));
            pcb.locks_held = locks;
            s.install(pcb);
            s.add_ready(pid);
        }
        s
    }

    #[test]
    fn test_head_has_max_key() {
        let s = scheduler_with(&[(0, 5), (0x10, 9), (0, 1)]);
        // The lock holder outranks both lockless processes.
        assert_eq!(s.ready_head(), Some(Pid(2)));
        assert!(s.ready_list_ordered());
        assert_eq!(s.ready_count(), 3);
    }

    #[test]
    fn test_equal_keys_are_fifo() {
        let s = scheduler_with(&[(0, 4), (0, 4), (0, 4)]);
        assert_eq!(s.ready_head(), Some(Pid(1)));
        let second = s.pcb(Pid(1)).unwrap().next;
        assert_eq!(second, Pid(2));
    }

    #[test]
    fn test_remove_then_insert_is_stable() {
        let mut s = scheduler_with(&[(0, 5), (0, 2), (0, 8)]);
        s.remove_ready(Pid(1));
        assert_eq!(s.ready_count(), 2);
        assert!(s.ready_list_ordered());
        s.add_ready(Pid(1));
        assert!(s.ready_list_ordered());
        assert_eq!(s.ready_head(), Some(Pid(2)));
    }

    #[test]
    fn test_reorder_after_state_change() {
        let mut s = scheduler_with(&[(0, 1), (0, 5)]);
        s.pcb_mut(Pid(2)).unwrap().state = 0;
        s.reorder_if_needed(Pid(2));
        assert_eq!(s.ready_head(), Some(Pid(2)));
        assert!(s.ready_list_ordered());
    }

    #[test]
    fn test_ts_end_ages_state_toward_floor() {
        let mut s = scheduler_with(&[(0, 5)]);
        s.pcb_mut(Pid(1)).unwrap().state_floor = 3;
        s.ts_end(Pid(1));
        assert_eq!(s.pcb(Pid(1)).unwrap().state, 4);
        s.ts_end(Pid(1));
        s.ts_end(Pid(1));
        // Clamped at the floor.
        assert_eq!(s.pcb(Pid(1)).unwrap().state, 3);
    }

    #[test]
    fn test_ts_end_gives_idle_max_slice() {
        let mut s = scheduler_with(&[(0, 5), (0, u16::MAX)]);
        assert_eq!(s.ts_end(Pid::IDLE), TIMESLICE_MAX);
        assert_eq!(s.pcb(Pid::IDLE).unwrap().state, u16::MAX);
    }

    #[test]
    fn test_vt_int_accumulates_cpu_time() {
        let mut s = scheduler_with(&[(0, 5)]);
        s.set_current(Pid(1));
        s.pcb_mut(Pid(1)).unwrap().vtimer = 0x100;
        let total = s.vt_int();
        assert_eq!(total, Clock::new(0, 0x100));
        assert_eq!(s.pcb(Pid(1)).unwrap().vtimer, 0);
    }

    #[test]
    fn test_set_priority_clamps_state() {
        let mut s = scheduler_with(&[(0, 9)]);
        assert!(s.set_priority(Pid(1), 2, 5).is_ok());
        assert_eq!(s.pcb(Pid(1)).unwrap().state, 5);
        assert_eq!(s.set_vt(Pid(40), 1), proc::NOT_BOUND);
    }

    proptest! {
        #[test]
        fn prop_insertion_keeps_order(
            entries in proptest::collection::vec((0u32..16, 0u16..8), 1..12)
        ) {
            let keys: alloc::vec::Vec<(u32, u16)> =
                entries.iter().map(|&(l, s)| (l, s)).collect();
            let s = scheduler_with(&keys);
            prop_assert!(s.ready_list_ordered());
            prop_assert_eq!(s.ready_count() as usize, keys.len());

            // The head is lexicographically maximal in (locks, -state).
            let head = s.ready_head().unwrap();
            let head_pcb = s.pcb(head).unwrap();
            for i in 0..keys.len() {
                let p = s.pcb(Pid(i as u16 + 1)).unwrap();
                prop_assert!(!p.sorts_before(head_pcb));
            }
        }

        #[test]
        fn prop_remove_insert_round_trip(
            entries in proptest::collection::vec((0u32..16, 0u16..8), 2..10),
            victim in 0usize..9,
        ) {
            let keys: alloc::vec::Vec<(u32, u16)> =
                entries.iter().map(|&(l, s)| (l, s)).collect();
            let mut s = scheduler_with(&keys);
            let pid = Pid((victim % keys.len()) as u16 + 1);

            s.remove_ready(pid);
            s.add_ready(pid);
            prop_assert!(s.ready_list_ordered());
            prop_assert_eq!(s.ready_count() as usize, keys.len());
        }
    }
}
