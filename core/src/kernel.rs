//! # The Combined Kernel State Machine
//!
//! Event counts, the scheduler and the lock table are mutually
//! entangled: an advance may wake a waiter (scheduler), a lock release
//! advances an event count, and suspension completion advances the
//! global suspend count. This module owns all three and implements the
//! operations that cross between them.
//!
//! ## Blocking model
//!
//! A blocking operation performed by the current process either
//! completes immediately or *parks* the process: it is removed from
//! the ready list, marked WAITING, and the dispatcher selects a new
//! head. The parked flow resumes when another process (or an interrupt
//! path) advances the event count it is enqueued on; the wake reason
//! is held on the PCB until the resumed code picks it up with
//! [`Kernel::take_wakeup`]. Loops such as lock acquisition re-enter
//! the operation on resume, exactly one suspension point per turn.

use vela_hal::ipl;
use vela_types::status::{ec as ec_status, proc, Status};
use vela_types::{Asid, KernelResult, Pid};

use crate::crash;
use crate::ec::{EcId, EcKind, EcTable};
use crate::ec2::Ec2Table;
use crate::loadav::LoadAverage;
use crate::lock::{Exclusion, LockId, LockTable};
use crate::pcb::{Pcb, PcbFlags, Wakeup};
use crate::sched::Scheduler;

/// Waiter-array slot reserved for the quit EC.
const QUIT_SLOT: usize = usize::MAX;

/// Largest wait array a single `wait_n` accepts.
pub const MAX_WAIT_ECS: usize = 16;

// =============================================================================
// Verdicts
// =============================================================================

/// Outcome of a potentially blocking operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitVerdict {
    /// Completed: the n-th event count was already satisfied.
    Ready(usize),
    /// The process parked; it resumes when a waker advances one of the
    /// counts (or its quit EC).
    Parked,
}

/// Outcome of a lock or exclusion acquire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquisition {
    /// The caller now holds the resource.
    Acquired,
    /// The caller parked on the resource's event count; re-enter the
    /// acquire once woken.
    Waiting,
}

// =============================================================================
// Kernel
// =============================================================================

/// The kernel's scheduling state machine.
#[derive(Debug)]
pub struct Kernel {
    /// Process table and ready list.
    pub sched: Scheduler,
    /// Event-count arena.
    pub ecs: EcTable,
    /// Resource-lock table.
    pub locks: LockTable,
    /// The user-visible event-count tier.
    pub ec2: Ec2Table,
    /// Ready-count moving averages.
    pub loadav: LoadAverage,
    suspend_ec: EcId,
}

impl Kernel {
    /// Bring up the scheduler with the boot process (pid 1) current and
    /// the idle process (pid 2) parked at the bottom of the ready list.
    pub fn init() -> Self {
        let mut ecs = EcTable::new();
        let locks = LockTable::new(&mut ecs);
        let suspend_ec = ecs.init(EcKind::Condition);
        let mut kernel = Self {
            sched: Scheduler::empty(),
            ecs,
            locks,
            ec2: Ec2Table::new(),
            loadav: LoadAverage::new(),
            suspend_ec,
        };

        let boot = kernel.bind(Asid::GLOBAL, 1).expect("boot pcb");
        debug_assert_eq!(boot, Pid(1));
        let idle = kernel.bind(Asid::GLOBAL, u16::MAX).expect("idle pcb");
        debug_assert_eq!(idle, Pid::IDLE);
        // The idle state level never ages.
        let idle_pcb = kernel.sched.pcb_mut(idle).unwrap();
        idle_pcb.state_floor = u16::MAX;

        kernel.sched.set_current(boot);
        kernel.sched.dispatch();
        kernel
    }

    /// The global suspend event count.
    pub fn suspend_ec(&self) -> EcId {
        self.suspend_ec
    }

    // =========================================================================
    // Bind / unbind
    // =========================================================================

    /// Bind a new process into a free PCB slot and make it ready.
    pub fn bind(&mut self, asid: Asid, state: u16) -> KernelResult<Pid> {
        let pid = self.sched.first_free_slot().ok_or(proc::NO_PCB_AVAILABLE)?;
        let proc_ec = self.ecs.init_for(pid);
        let quit_ec = self.ecs.init_for(pid);
        self.sched.install(Pcb::new(pid, asid, state, proc_ec, quit_ec));
        self.sched.add_ready(pid);
        log::debug!("proc: bound pid {} at state {}", pid.value(), state);
        Ok(pid)
    }

    /// Unbind a process, unlinking it from every list it is on.
    pub fn unbind(&mut self, pid: Pid) -> Status {
        if pid == self.sched.current() {
            return proc::ILLEGAL_PROCESS_ID;
        }
        match self.sched.checked_pcb(pid) {
            Ok(pcb) => {
                let listed = pcb.in_ready_list;
                if listed {
                    self.sched.remove_ready(pid);
                }
                self.ecs.unlink_all(pid);
                self.ec2.release_waiters(pid);
                self.sched.evict(pid);
                log::debug!("proc: unbound pid {}", pid.value());
                Status::OK
            }
            Err(status) => status,
        }
    }

    // =========================================================================
    // Event-count operations
    // =========================================================================

    /// Advance an event count, waking satisfied waiters and
    /// rescheduling.
    pub fn advance(&mut self, ec: EcId) {
        self.advance_inner(ec, true);
    }

    /// Advance without invoking the dispatcher; interrupt handlers use
    /// this so the outermost inhibit-end reschedules instead.
    pub fn advance_without_dispatch(&mut self, ec: EcId) {
        self.advance_inner(ec, false);
    }

    fn advance_inner(&mut self, ec: EcId, dispatch: bool) {
        let woken = ipl::with_raised_ipl(|| self.ecs.advance(ec));
        for (pid, slot) in woken {
            self.wake(pid, slot);
        }
        if dispatch {
            self.sched.dispatch();
        }
    }

    fn wake(&mut self, pid: Pid, slot: usize) {
        let Some(pcb) = self.sched.pcb_mut(pid) else {
            return;
        };
        if !pcb.flags.contains(PcbFlags::WAITING) {
            return;
        }
        if pcb.wakeup.is_none() {
            pcb.wakeup = Some(if slot == QUIT_SLOT {
                Wakeup::Quit
            } else {
                Wakeup::Satisfied(slot)
            });
        }
        pcb.flags.remove(PcbFlags::WAITING);
        let suspended = pcb.flags.contains(PcbFlags::SUSPENDED);

        // Total cleanup: no record survives on any other count.
        self.ecs.unlink_all(pid);
        if !suspended {
            self.sched.add_ready(pid);
        }
    }

    /// Wait until any of `ecs` reaches its target value.
    ///
    /// Returns [`WaitVerdict::Ready`] with the first satisfied index
    /// (ties broken by array order) without blocking, or parks the
    /// process after enqueuing it on every count plus its quit EC.
    pub fn wait_n(&mut self, pid: Pid, ecs: &[EcId], targets: &[u32]) -> WaitVerdict {
        debug_assert_eq!(ecs.len(), targets.len());
        debug_assert!(ecs.len() <= MAX_WAIT_ECS);

        // Already satisfied? First index wins.
        for (i, (&ec, &target)) in ecs.iter().zip(targets).enumerate() {
            if satisfied(self.ecs.value(ec), target) {
                return WaitVerdict::Ready(i);
            }
        }

        let _ipl = ipl::raise_ipl();
        for (i, (&ec, &target)) in ecs.iter().zip(targets).enumerate() {
            self.ecs.enqueue(ec, pid, target, i);
        }
        let quit_ec = {
            let pcb = self.sched.pcb_mut(pid).expect("waiting pid is bound");
            pcb.wakeup = None;
            pcb.quit_ec
        };
        let quit_target = self.ecs.value(quit_ec).wrapping_add(1);
        self.ecs.enqueue(quit_ec, pid, quit_target, QUIT_SLOT);

        self.park(pid);
        WaitVerdict::Parked
    }

    fn park(&mut self, pid: Pid) {
        let pcb = self.sched.pcb_mut(pid).expect("parked pid is bound");
        pcb.flags.insert(PcbFlags::WAITING);
        pcb.wait_start = 0;
        let listed = pcb.in_ready_list;
        if listed {
            self.sched.remove_from_ready_list(pid);
        }
        self.sched.dispatch();
    }

    /// Collect a parked process's wake reason, once.
    ///
    /// `Err` carries the async-fault status when the quit EC fired.
    pub fn take_wakeup(&mut self, pid: Pid) -> Option<KernelResult<usize>> {
        let pcb = self.sched.pcb_mut(pid)?;
        pcb.wakeup.take().map(|w| match w {
            Wakeup::Satisfied(slot) => Ok(slot),
            Wakeup::Quit => Err(ec_status::ASYNC_FAULT_WHILE_WAITING),
        })
    }

    /// Advance a process's quit EC, cancelling any wait it is in.
    pub fn post_quit(&mut self, pid: Pid) {
        let Some(pcb) = self.sched.pcb(pid) else {
            return;
        };
        let quit_ec = pcb.quit_ec;
        self.advance(quit_ec);
    }

    // =========================================================================
    // Resource locks (blocking tier)
    // =========================================================================

    /// Acquire a resource lock for the current process.
    ///
    /// The ordering invariant is checked on the first attempt: every
    /// lock already held must have a lower number, or the system
    /// crashes with `Lock_ordering_violation`. If the lock is held the
    /// caller parks on the lock's event count; re-enter on wake.
    pub fn ml_lock(&mut self, id: LockId) -> Acquisition {
        let current = self.sched.current();
        let head = self.sched.ready_head();
        let mask = id.mask();

        let first_attempt = {
            let pcb = self.sched.pcb_mut(current).expect("current is bound");
            pcb.locks_held & mask == 0
        };

        if first_attempt {
            let pcb = self.sched.pcb_mut(current).unwrap();
            pcb.inhibit_count += 1;
            if pcb.locks_held >= mask {
                crash::crash_system(
                    Status::new(vela_types::status::subsys::PROC, 0x000E),
                    crash::LOCK_ORDERING_VIOLATION,
                );
            }
            pcb.locks_held |= mask;
            if Some(current) != head {
                ipl::with_raised_ipl(|| self.sched.reorder_if_needed(current));
            }
        }

        let _ipl = ipl::raise_ipl();
        let lock = self.locks.lock_mut(id);
        if !lock.held {
            lock.held = true;
            return Acquisition::Acquired;
        }

        // Held elsewhere: queue up on the lock's event count.
        lock.wait_count = lock.wait_count.wrapping_add(1);
        let target = lock.wait_count;
        let ec = lock.ec;
        drop(_ipl);
        log::trace!("ml: pid {} waits for lock {}", current.value(), id.0);
        self.wait_n(current, &[ec], &[target]);
        Acquisition::Waiting
    }

    /// Release a resource lock held by the current process.
    pub fn ml_unlock(&mut self, id: LockId) {
        let current = self.sched.current();
        let mask = id.mask();

        let (ec, wake) = {
            let _ipl = ipl::raise_ipl();
            let lock = self.locks.lock_mut(id);
            lock.held = false;
            let wake = self.ecs.value(lock.ec) != lock.wait_count;
            (lock.ec, wake)
        };
        if wake {
            self.advance_without_dispatch(ec);
        }

        let pcb = self.sched.pcb_mut(current).expect("current is bound");
        if pcb.locks_held & mask == 0 {
            crash::crash_system(
                Status::new(vela_types::status::subsys::PROC, 0x000D),
                crash::ILLEGAL_LOCK,
            );
        }
        pcb.locks_held &= !mask;
        pcb.inhibit_count -= 1;

        self.lock_exit_common(current);
    }

    /// Shared release tail: reorder, settle deferred work once the
    /// last lock is gone, dispatch.
    fn lock_exit_common(&mut self, current: Pid) {
        ipl::with_raised_ipl(|| self.sched.reorder_if_needed(current));

        let locks_left = self
            .sched
            .pcb(current)
            .map_or(0, |p| p.locks_held);
        if locks_left == 0 {
            let pending = {
                let pcb = self.sched.pcb_mut(current).unwrap();
                let pending = pcb.flags.contains(PcbFlags::REORDER_PENDING);
                pcb.flags.remove(PcbFlags::REORDER_PENDING);
                pending
            };
            if pending && self.sched.pcb(current).unwrap().in_ready_list {
                self.sched.remove_ready(current);
                self.sched.add_ready(current);
            }
            if self
                .sched
                .pcb(current)
                .unwrap()
                .flags
                .contains(PcbFlags::DEFER_SUSPEND)
            {
                self.try_to_suspend(current);
            }
        }
        self.sched.dispatch();
    }

    // =========================================================================
    // Resource locks (non-blocking tier)
    // =========================================================================

    /// Take a lock bit by ordering discipline alone.
    ///
    /// This tier relies on the inhibit region for exclusion: the holder
    /// cannot be preempted, so no held byte is needed. Crashes on an
    /// ordering violation, like the blocking tier.
    pub fn set_lock(&mut self, id: LockId) {
        let current = self.sched.current();
        let head = self.sched.ready_head();
        let mask = id.mask();

        let pcb = self.sched.pcb_mut(current).expect("current is bound");
        pcb.inhibit_count += 1;
        if pcb.locks_held >= mask {
            crash::crash_system(
                Status::new(vela_types::status::subsys::PROC, 0x000E),
                crash::LOCK_ORDERING_VIOLATION,
            );
        }
        pcb.locks_held |= mask;
        if Some(current) != head {
            ipl::with_raised_ipl(|| self.sched.reorder_if_needed(current));
        }
    }

    /// Release a lock bit taken with [`Kernel::set_lock`].
    pub fn clr_lock(&mut self, id: LockId) {
        let current = self.sched.current();
        let mask = id.mask();

        let pcb = self.sched.pcb_mut(current).expect("current is bound");
        if pcb.locks_held & mask == 0 {
            crash::crash_system(
                Status::new(vela_types::status::subsys::PROC, 0x000D),
                crash::ILLEGAL_LOCK,
            );
        }
        pcb.locks_held &= !mask;
        pcb.inhibit_count -= 1;

        self.lock_exit_common(current);
    }

    // =========================================================================
    // Exclusion regions
    // =========================================================================

    /// Enter an exclusion region, parking if it is occupied.
    pub fn exclusion_start(&mut self, excl: &mut Exclusion) -> Acquisition {
        let current = self.sched.current();
        self.sched
            .pcb_mut(current)
            .expect("current is bound")
            .inhibit_count += 1;

        excl.level += 1;
        if excl.level != 0 {
            excl.wait_count = excl.wait_count.wrapping_add(1);
            let target = excl.wait_count;
            let ec = excl.ec;
            self.wait_n(current, &[ec], &[target]);
            return Acquisition::Waiting;
        }
        Acquisition::Acquired
    }

    /// Leave an exclusion region, waking the next waiter in turn.
    pub fn exclusion_stop(&mut self, excl: &mut Exclusion) {
        let current = self.sched.current();
        let had_waiters = excl.level >= 1;
        excl.level -= 1;

        if had_waiters {
            self.advance_without_dispatch(excl.ec);
        }

        let pcb = self.sched.pcb_mut(current).expect("current is bound");
        pcb.inhibit_count -= 1;
        if pcb.inhibit_count != 0 {
            return;
        }
        self.lock_exit_common(current);
    }

    // =========================================================================
    // Inhibit regions
    // =========================================================================

    /// Enter a preemption-inhibit region.
    pub fn inhibit_begin(&mut self) {
        self.sched.inhibit_begin();
    }

    /// Leave a preemption-inhibit region; at depth zero the deferred
    /// work (reorder, suspension) settles and the dispatcher runs.
    pub fn inhibit_end(&mut self) {
        let current = self.sched.current();
        let depth = {
            let pcb = self.sched.pcb_mut(current).expect("current is bound");
            debug_assert!(pcb.inhibit_count > 0);
            pcb.inhibit_count -= 1;
            pcb.inhibit_count
        };
        if depth != 0 {
            return;
        }
        self.lock_exit_common(current);
    }

    // =========================================================================
    // Suspend / resume
    // =========================================================================

    /// Suspend a process. Returns whether it is now suspended (false
    /// means the suspension was deferred past an inhibit region).
    pub fn suspend(&mut self, pid: Pid) -> KernelResult<bool> {
        let pcb = self.sched.checked_pcb(pid)?;
        let flags = pcb.flags;
        if flags.intersects(PcbFlags::SUSPENDED | PcbFlags::DEFER_SUSPEND) {
            return Err(proc::ALREADY_SUSPENDED);
        }

        self.try_to_suspend(pid);
        self.sched.dispatch();
        Ok(self
            .sched
            .pcb(pid)
            .is_some_and(|p| p.flags.contains(PcbFlags::SUSPENDED)))
    }

    /// Attempt the actual suspension; defers while inhibited.
    pub(crate) fn try_to_suspend(&mut self, pid: Pid) {
        {
            let Some(pcb) = self.sched.pcb_mut(pid) else {
                return;
            };
            pcb.flags.insert(PcbFlags::DEFER_SUSPEND);
        }
        if self.sched.inhibit_check(pid) {
            // Deferred: completes when the last lock drops.
            return;
        }

        let waiting = {
            let pcb = self.sched.pcb_mut(pid).unwrap();
            pcb.flags.contains(PcbFlags::WAITING)
        };
        if !waiting && self.sched.pcb(pid).unwrap().in_ready_list {
            self.sched.remove_ready(pid);
        }
        let pcb = self.sched.pcb_mut(pid).unwrap();
        pcb.flags.remove(PcbFlags::DEFER_SUSPEND);
        pcb.flags.insert(PcbFlags::SUSPENDED);

        let suspend_ec = self.suspend_ec;
        self.advance_without_dispatch(suspend_ec);
    }

    /// Resume a suspended process.
    pub fn resume(&mut self, pid: Pid) -> Status {
        let flags = match self.sched.checked_pcb(pid) {
            Ok(pcb) => pcb.flags,
            Err(status) => return status,
        };

        if flags.contains(PcbFlags::SUSPENDED) {
            let pcb = self.sched.pcb_mut(pid).unwrap();
            pcb.flags.remove(PcbFlags::SUSPENDED);
            let waiting = pcb.flags.contains(PcbFlags::WAITING);
            if !waiting {
                self.sched.add_ready(pid);
            }
            self.sched.dispatch();
            return Status::OK;
        }
        if flags.contains(PcbFlags::DEFER_SUSPEND) {
            self.sched
                .pcb_mut(pid)
                .unwrap()
                .flags
                .remove(PcbFlags::DEFER_SUSPEND);
            return Status::OK;
        }
        proc::NOT_SUSPENDED
    }
}

/// Wrapped comparison: has `value` reached `target`?
pub(crate) fn satisfied(value: u32, target: u32) -> bool {
    value.wrapping_sub(target) < 0x8000_0000
}

// =============================================================================
// Global Kernel
// =============================================================================

static GLOBAL_KERNEL: spin::Once<spin::Mutex<Kernel>> = spin::Once::new();

/// The system-wide kernel instance, brought up on first access.
///
/// Supervisor-call entries go through this; subsystems under test
/// build their own [`Kernel`] instead.
pub fn global_kernel() -> &'static spin::Mutex<Kernel> {
    GLOBAL_KERNEL.call_once(|| spin::Mutex::new(Kernel::init()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ec::EcKind;

    fn kernel_with_proc(state: u16) -> (Kernel, Pid) {
        let mut k = Kernel::init();
        let pid = k.bind(Asid(5), state).unwrap();
        (k, pid)
    }

    #[test]
    fn test_init_binds_boot_and_idle() {
        let k = Kernel::init();
        assert_eq!(k.sched.current(), Pid(1));
        assert!(k.sched.pcb(Pid::IDLE).is_some());
        assert_eq!(k.sched.ready_count(), 2);
        // Boot outranks idle.
        assert_eq!(k.sched.ready_head(), Some(Pid(1)));
    }

    #[test]
    fn test_wait_already_satisfied_returns_first_index() {
        let (mut k, pid) = kernel_with_proc(3);
        let a = k.ecs.init(EcKind::Condition);
        let b = k.ecs.init(EcKind::Condition);
        k.advance(a);
        k.advance(b);
        // Both satisfied; array order breaks the tie.
        assert_eq!(k.wait_n(pid, &[a, b], &[1, 1]), WaitVerdict::Ready(0));
    }

    #[test]
    fn test_wake_on_exact_advance() {
        let (mut k, pid) = kernel_with_proc(3);
        let ec = k.ecs.init(EcKind::Condition);
        for _ in 0..5 {
            k.advance(ec);
        }

        // Wait for 7 while the value is 5.
        assert_eq!(k.wait_n(pid, &[ec], &[7]), WaitVerdict::Parked);
        assert!(!k.sched.pcb(pid).unwrap().in_ready_list);

        k.advance(ec); // 6: not yet
        assert!(!k.sched.pcb(pid).unwrap().in_ready_list);
        assert!(k.take_wakeup(pid).is_none());

        k.advance(ec); // 7: wake
        assert!(k.sched.pcb(pid).unwrap().in_ready_list);
        assert_eq!(k.take_wakeup(pid), Some(Ok(0)));
        assert!(k.ecs.value(ec) >= 7);
    }

    #[test]
    fn test_quit_cancels_wait_with_total_cleanup() {
        let (mut k, pid) = kernel_with_proc(3);
        let a = k.ecs.init(EcKind::Condition);
        let b = k.ecs.init(EcKind::Condition);

        assert_eq!(k.wait_n(pid, &[a, b], &[1, 1]), WaitVerdict::Parked);
        k.post_quit(pid);

        assert_eq!(
            k.take_wakeup(pid),
            Some(Err(ec_status::ASYNC_FAULT_WHILE_WAITING))
        );
        // Unlinked from every count it was enqueued on.
        assert_eq!(k.ecs.get(a).waiter_count(), 0);
        assert_eq!(k.ecs.get(b).waiter_count(), 0);
        assert!(k.sched.pcb(pid).unwrap().in_ready_list);
    }

    #[test]
    fn test_lock_holder_floats_to_head() {
        let (mut k, pid) = kernel_with_proc(3);
        // Boot (state 1) outranks pid (state 3) at equal lock rank.
        assert_eq!(k.sched.ready_head(), Some(Pid(1)));

        // Run as pid and take a lock: it must float to the head.
        k.sched.set_current(pid);
        assert_eq!(k.ml_lock(LockId::AST), Acquisition::Acquired);
        assert_eq!(k.sched.ready_head(), Some(pid));
        assert!(k.sched.ready_list_ordered());

        k.ml_unlock(LockId::AST);
        assert_eq!(k.sched.ready_head(), Some(Pid(1)));
        assert!(k.sched.ready_list_ordered());
    }

    #[test]
    fn test_contended_lock_parks_then_hands_over() {
        let (mut k, p3) = kernel_with_proc(3);

        // Boot takes the lock.
        assert_eq!(k.ml_lock(LockId::AST), Acquisition::Acquired);

        // The other process contends and parks.
        k.sched.set_current(p3);
        assert_eq!(k.ml_lock(LockId::AST), Acquisition::Waiting);
        assert!(k.sched.pcb(p3).unwrap().flags.contains(PcbFlags::WAITING));

        // Holder releases; the waiter wakes and retries successfully.
        k.sched.set_current(Pid(1));
        k.ml_unlock(LockId::AST);
        assert_eq!(k.take_wakeup(p3), Some(Ok(0)));

        k.sched.set_current(p3);
        assert_eq!(k.ml_lock(LockId::AST), Acquisition::Acquired);
        k.ml_unlock(LockId::AST);
    }

    #[test]
    #[should_panic(expected = "Lock_ordering_violation")]
    fn test_lock_ordering_violation_crashes() {
        let mut k = Kernel::init();
        // Hold CAL (14), then try XPD (2): held mask 0x4000 >= 0x4.
        k.ml_lock(LockId::CAL);
        k.ml_lock(LockId::XPD);
    }

    #[test]
    #[should_panic(expected = "Illegal_lock_err")]
    fn test_release_unheld_lock_crashes() {
        let mut k = Kernel::init();
        k.ml_unlock(LockId::DISK);
    }

    #[test]
    fn test_suspend_defers_while_locks_held() {
        let (mut k, pid) = kernel_with_proc(3);
        k.sched.set_current(pid);
        k.ml_lock(LockId::AST);

        // Inhibited by the lock: suspension must defer.
        assert_eq!(k.suspend(pid), Ok(false));
        assert!(k
            .sched
            .pcb(pid)
            .unwrap()
            .flags
            .contains(PcbFlags::DEFER_SUSPEND));

        // Releasing the last lock completes the suspension.
        k.ml_unlock(LockId::AST);
        let flags = k.sched.pcb(pid).unwrap().flags;
        assert!(flags.contains(PcbFlags::SUSPENDED));
        assert!(!flags.contains(PcbFlags::DEFER_SUSPEND));
        assert!(!k.sched.pcb(pid).unwrap().in_ready_list);

        assert_eq!(k.resume(pid), Status::OK);
        assert!(k.sched.pcb(pid).unwrap().in_ready_list);
    }

    #[test]
    fn test_suspend_and_resume_immediate() {
        let (mut k, pid) = kernel_with_proc(3);
        assert_eq!(k.suspend(pid), Ok(true));
        assert_eq!(k.suspend(pid), Err(proc::ALREADY_SUSPENDED));
        assert_eq!(k.resume(pid), Status::OK);
        assert_eq!(k.resume(pid), proc::NOT_SUSPENDED);
    }

    #[test]
    fn test_resume_of_bare_deferred_suspend_clears_flag() {
        let (mut k, pid) = kernel_with_proc(3);
        k.sched.set_current(pid);
        k.inhibit_begin();
        assert_eq!(k.suspend(pid), Ok(false));
        assert_eq!(k.resume(pid), Status::OK);
        assert!(!k
            .sched
            .pcb(pid)
            .unwrap()
            .flags
            .intersects(PcbFlags::SUSPENDED | PcbFlags::DEFER_SUSPEND));
        k.inhibit_end();
    }

    #[test]
    fn test_exclusion_serializes_in_fifo_order() {
        let (mut k, p3) = kernel_with_proc(3);
        let p4 = k.bind(Asid(6), 4).unwrap();
        let mut excl = Exclusion::new(&mut k.ecs);

        assert_eq!(k.exclusion_start(&mut excl), Acquisition::Acquired);
        assert!(excl.occupied());

        k.sched.set_current(p3);
        assert_eq!(k.exclusion_start(&mut excl), Acquisition::Waiting);
        k.sched.set_current(p4);
        assert_eq!(k.exclusion_start(&mut excl), Acquisition::Waiting);

        // First stop admits the first waiter only.
        k.sched.set_current(Pid(1));
        k.exclusion_stop(&mut excl);
        assert_eq!(k.take_wakeup(p3), Some(Ok(0)));
        assert_eq!(k.take_wakeup(p4), None);

        k.sched.set_current(p3);
        k.exclusion_stop(&mut excl);
        assert_eq!(k.take_wakeup(p4), Some(Ok(0)));

        k.sched.set_current(p4);
        k.exclusion_stop(&mut excl);
        assert!(!excl.occupied());
    }

    #[test]
    fn test_dispatcher_head_is_max_key() {
        let (mut k, p3) = kernel_with_proc(3);
        let p2 = k.bind(Asid(7), 2).unwrap();
        let _ = p3;

        // Lower state outranks at equal lock rank.
        assert_eq!(k.sched.ready_head(), Some(Pid(1)));
        assert!(k.sched.ready_list_ordered());

        // Suspending the head moves the crown.
        assert!(k.suspend(Pid(1)).is_ok());
        assert_eq!(k.sched.ready_head(), Some(p2));
        assert_eq!(k.sched.current(), p2);
    }
}
