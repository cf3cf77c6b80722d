//! # Time Service
//!
//! The glue the interrupt paths call. The real-time tick advances the
//! time-of-day state, advances the clock event counts, and scans the
//! real-time queue; wired callbacks run right there with dispatch
//! suppressed, unwired ones queue for the kernel-mode consumer. A
//! process's virtual-time tick charges its CPU total and scans that
//! process's virtual queue, which is where timeslice ends fire.
//!
//! The service also carries the user-facing wait surface: schedule an
//! event-count advance after a delay, cancel it, or sleep on a
//! synthetic count with an optional companion.

use alloc::vec::Vec;
use hashbrown::HashMap;
use vela_core::{EcId, EcKind, Kernel, WaitVerdict};
use vela_hal::timer::{TimerChannel, TimerDevice};
use vela_types::status::{time as time_status, Status};
use vela_types::{Clock, KernelResult, Pid};

use crate::queue::{Fired, QElemId, QueueFlags, TimerAction, TimerQueue};
use crate::tod::TimeOfDay;

/// Delay interpretation for the wait surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayKind {
    /// Delay relative to now.
    Relative,
    /// Absolute 48-bit deadline.
    Absolute,
}

/// Which of a two-way wait completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// The timer fired.
    Timer,
    /// The companion event count fired first.
    Companion,
    /// Still parked.
    Pending,
}

// =============================================================================
// Service
// =============================================================================

/// Timer queues, time-of-day state and the clock event counts.
#[derive(Debug)]
pub struct TimeService {
    /// Time-of-day and clock composition state.
    pub tod: TimeOfDay,
    rtq: spin::Mutex<TimerQueue>,
    vt_queues: HashMap<Pid, TimerQueue>,
    deferred: Vec<TimerAction>,
    clock_ec: EcId,
    fast_clock_ec: EcId,
    fast_divider: u8,
}

impl TimeService {
    /// Bring up the service, creating the clock event counts.
    pub fn init(kernel: &mut Kernel) -> Self {
        let clock_ec = kernel.ecs.init(EcKind::Condition);
        let fast_clock_ec = kernel.ecs.init(EcKind::Condition);
        Self {
            tod: TimeOfDay::new(),
            rtq: spin::Mutex::new(TimerQueue::new(1)),
            vt_queues: HashMap::new(),
            deferred: Vec::new(),
            clock_ec,
            fast_clock_ec,
            fast_divider: 0,
        }
    }

    /// Number of elements on the real-time queue.
    pub fn rt_queue_len(&self) -> usize {
        self.rtq.lock().len()
    }

    /// The exported clock event counts: 0 = clock, 1 = fast clock.
    pub fn get_ec(&self, which: u16) -> KernelResult<EcId> {
        match which {
            0 => Ok(self.clock_ec),
            1 => Ok(self.fast_clock_ec),
            _ => Err(time_status::BAD_DELAY_TYPE),
        }
    }

    // =========================================================================
    // Interrupt paths
    // =========================================================================

    /// Real-time timer interrupt.
    ///
    /// Reloads the hardware counter, folds the tick into the clock,
    /// advances the clock counts, and fires everything due on the
    /// real-time queue. Wired callbacks run here with dispatch
    /// suppressed; unwired ones wait for [`TimeService::run_deferred`].
    pub fn rte_int(&mut self, kernel: &mut Kernel, timer: &dyn TimerDevice) {
        self.tod.rt_tick();
        timer.write_counter(TimerChannel::RealTime, self.tod.current_tick());

        kernel.advance_without_dispatch(self.fast_clock_ec);
        self.fast_divider = self.fast_divider.wrapping_add(1);
        if self.fast_divider % 4 == 0 {
            kernel.advance_without_dispatch(self.clock_ec);
        }

        let now = self.tod.stored();
        loop {
            // The spinlock drops before callbacks run; each batch
            // re-takes it and re-examines the queue because a callback
            // may have entered new elements.
            let batch = self.rtq.lock().scan(now);
            if batch.is_empty() {
                break;
            }
            for fired in batch {
                self.apply(kernel, fired);
            }
        }
        self.rearm(timer);
    }

    fn apply(&mut self, kernel: &mut Kernel, fired: Fired) {
        if !fired.wired {
            self.deferred.push(fired.action);
            return;
        }
        match fired.action {
            TimerAction::AdvanceEc(ec) => kernel.advance_without_dispatch(ec),
            TimerAction::LoadSample => {
                let ready = kernel.sched.ready_count();
                kernel.loadav.sample(ready);
            }
            TimerAction::Timeslice(pid) => {
                let next = kernel.sched.ts_end(pid);
                self.set_ts(kernel, pid, next);
            }
            TimerAction::Hook(token) => {
                log::debug!("time: wired hook {token} fired");
            }
        }
    }

    /// Run callbacks deferred out of interrupt context.
    pub fn run_deferred(&mut self, kernel: &mut Kernel) {
        let actions: Vec<TimerAction> = self.deferred.drain(..).collect();
        for action in actions {
            match action {
                TimerAction::AdvanceEc(ec) => kernel.advance(ec),
                TimerAction::LoadSample => {
                    let ready = kernel.sched.ready_count();
                    kernel.loadav.sample(ready);
                }
                TimerAction::Timeslice(pid) => {
                    let next = kernel.sched.ts_end(pid);
                    self.set_ts(kernel, pid, next);
                }
                TimerAction::Hook(token) => {
                    log::debug!("time: deferred hook {token} ran");
                }
            }
        }
    }

    /// Re-arm the hardware countdown when the head deadline lands
    /// inside the current reload.
    pub fn rearm(&self, timer: &dyn TimerDevice) {
        let Some(deadline) = self.rtq.lock().next_deadline() else {
            return;
        };
        let span = deadline.wrapping_sub(self.tod.stored());
        let reload = self.tod.current_tick();
        if span.high == 0 && span.low < reload {
            timer.write_counter(TimerChannel::RealTime, span.low.max(1));
        }
    }

    /// Virtual-timer interrupt for the current process.
    ///
    /// Charges the elapsed slice to the process and fires its virtual
    /// queue against the new CPU total.
    pub fn vt_int(&mut self, kernel: &mut Kernel) {
        let pid = kernel.sched.current();
        let cpu_total = kernel.sched.vt_int();

        let batch = match self.vt_queues.get_mut(&pid) {
            Some(queue) => queue.scan(cpu_total),
            None => return,
        };
        for fired in batch {
            match fired.action {
                TimerAction::Timeslice(p) => {
                    let next = kernel.sched.ts_end(p);
                    self.set_ts(kernel, p, next);
                }
                TimerAction::AdvanceEc(ec) => {
                    kernel.advance_without_dispatch(ec);
                }
                other => {
                    log::debug!("time: vt action {other:?} ignored");
                }
            }
        }
    }

    // =========================================================================
    // Timeslice programming
    // =========================================================================

    /// Program a process's timeslice: a virtual-queue callback at
    /// `cpu_total + ticks`.
    ///
    /// A negative slice means "never expire" and clears any pending
    /// element instead.
    pub fn set_ts(&mut self, kernel: &mut Kernel, pid: Pid, ticks: i16) {
        let queue = self.vt_queues.entry(pid).or_insert_with(|| TimerQueue::new(2));
        queue.flush();
        if ticks < 0 {
            return;
        }
        let cpu_total = kernel
            .sched
            .pcb(pid)
            .map_or(Clock::ZERO, |p| p.cpu_total);
        let deadline = cpu_total.wrapping_add(Clock::new(0, ticks as u16));
        queue.enter(
            deadline,
            Clock::ZERO,
            QueueFlags::WIRED,
            TimerAction::Timeslice(pid),
        );
        kernel.sched.set_vt(pid, ticks);
    }

    /// Initialize a process's timeslice timer with the default slice.
    pub fn init_ts_timer(&mut self, kernel: &mut Kernel, pid: Pid) {
        self.set_ts(kernel, pid, vela_core::sched::DEFAULT_TIMESLICE);
    }

    /// Schedule the repeating load-average sample.
    pub fn init_loadav(&mut self) {
        let interval = vela_core::loadav::SAMPLE_INTERVAL;
        let first = self.tod.stored().wrapping_add(interval);
        self.rtq.lock().enter(
            first,
            interval,
            QueueFlags::WIRED | QueueFlags::REPEATING,
            TimerAction::LoadSample,
        );
    }

    // =========================================================================
    // Wait surface
    // =========================================================================

    fn resolve_deadline(&self, kind: DelayKind, delay: Clock) -> Clock {
        match kind {
            DelayKind::Relative => self.tod.stored().wrapping_add(delay),
            DelayKind::Absolute => delay,
        }
    }

    /// Schedule an event-count advance after a delay.
    pub fn time_advance(
        &mut self,
        kind: DelayKind,
        delay: Clock,
        ec: EcId,
    ) -> QElemId {
        let deadline = self.resolve_deadline(kind, delay);
        let (id, _) = self.rtq.lock().enter(
            deadline,
            Clock::ZERO,
            QueueFlags::WIRED,
            TimerAction::AdvanceEc(ec),
        );
        id
    }

    /// Cancel a scheduled advance.
    pub fn time_cancel(&mut self, elem: QElemId) -> Status {
        match self.rtq.lock().remove(elem) {
            Ok(_) => Status::OK,
            Err(status) => status,
        }
    }

    /// Sleep until a deadline.
    ///
    /// Creates a synthetic event count, schedules its advance, and
    /// parks the process on it. Returns the count and element for the
    /// caller's bookkeeping; an already-passed deadline completes
    /// without parking.
    pub fn time_wait(
        &mut self,
        kernel: &mut Kernel,
        pid: Pid,
        kind: DelayKind,
        delay: Clock,
    ) -> (WaitVerdict, EcId, QElemId) {
        let deadline = self.resolve_deadline(kind, delay);
        let ec = kernel.ecs.init(EcKind::Condition);

        if deadline <= self.tod.stored() {
            return (WaitVerdict::Ready(0), ec, QElemId(u16::MAX));
        }
        let (elem, _) = self.rtq.lock().enter(
            deadline,
            Clock::ZERO,
            QueueFlags::WIRED,
            TimerAction::AdvanceEc(ec),
        );
        let verdict = kernel.wait_n(pid, &[ec], &[1]);
        (verdict, ec, elem)
    }

    /// Sleep until a deadline or a companion event count, whichever
    /// comes first.
    pub fn time_wait2(
        &mut self,
        kernel: &mut Kernel,
        pid: Pid,
        kind: DelayKind,
        delay: Clock,
        companion: EcId,
        companion_target: u32,
    ) -> (WaitVerdict, EcId, QElemId) {
        let deadline = self.resolve_deadline(kind, delay);
        let ec = kernel.ecs.init(EcKind::Condition);

        if deadline <= self.tod.stored() {
            return (WaitVerdict::Ready(0), ec, QElemId(u16::MAX));
        }
        let (elem, _) = self.rtq.lock().enter(
            deadline,
            Clock::ZERO,
            QueueFlags::WIRED,
            TimerAction::AdvanceEc(ec),
        );
        let verdict = kernel.wait_n(pid, &[ec, companion], &[1, companion_target]);
        (verdict, ec, elem)
    }

    /// Interpret a completed two-way wait.
    pub fn classify_expiry(verdict: Option<KernelResult<usize>>) -> Expiry {
        match verdict {
            Some(Ok(0)) => Expiry::Timer,
            Some(Ok(_)) => Expiry::Companion,
            _ => Expiry::Pending,
        }
    }

    // =========================================================================
    // Time of day
    // =========================================================================

    /// Step the time of day and latch the new civil time into the
    /// calendar chip.
    pub fn set_time_of_day(
        &mut self,
        seconds: u32,
        micros: u32,
        calendar: &crate::calendar::Calendar,
        chip: &dyn vela_hal::rtc::CalendarChip,
    ) -> Status {
        let clock = self.tod.set_time_of_day(seconds, micros);
        let civil = crate::calendar::decode_time(calendar.apply_local_offset(clock));
        calendar.write_calendar(chip, &civil)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vela_hal::timer::SimTimers;
    use vela_types::Asid;

    fn setup() -> (Kernel, TimeService, SimTimers) {
        let mut kernel = Kernel::init();
        let service = TimeService::init(&mut kernel);
        (kernel, service, SimTimers::new())
    }

    fn tick_n(service: &mut TimeService, kernel: &mut Kernel, timer: &SimTimers, n: u32) {
        for _ in 0..n {
            service.rte_int(kernel, timer);
        }
    }

    #[test]
    fn test_rte_int_advances_clock_ecs() {
        let (mut kernel, mut service, timer) = setup();
        let fast = service.get_ec(1).unwrap();
        let slow = service.get_ec(0).unwrap();

        tick_n(&mut service, &mut kernel, &timer, 8);
        assert_eq!(kernel.ecs.value(fast), 8);
        assert_eq!(kernel.ecs.value(slow), 2);
    }

    #[test]
    fn test_time_advance_fires_at_deadline() {
        let (mut kernel, mut service, timer) = setup();
        let ec = kernel.ecs.init(EcKind::Condition);

        // Two reloads from now.
        let delay = Clock::new(0, service.tod.current_tick() * 2);
        service.time_advance(DelayKind::Relative, delay, ec);

        service.rte_int(&mut kernel, &timer);
        assert_eq!(kernel.ecs.value(ec), 0);
        service.rte_int(&mut kernel, &timer);
        assert_eq!(kernel.ecs.value(ec), 1);
    }

    #[test]
    fn test_time_cancel_removes_element() {
        let (mut kernel, mut service, timer) = setup();
        let ec = kernel.ecs.init(EcKind::Condition);
        let elem = service.time_advance(DelayKind::Relative, Clock::new(0, 0x100), ec);

        assert!(service.time_cancel(elem).is_ok());
        assert_eq!(service.time_cancel(elem), time_status::NOT_IN_QUEUE);
        tick_n(&mut service, &mut kernel, &timer, 2);
        assert_eq!(kernel.ecs.value(ec), 0);
    }

    #[test]
    fn test_time_wait_parks_until_timer() {
        let (mut kernel, mut service, timer) = setup();
        let pid = kernel.bind(Asid(4), 5).unwrap();

        let delay = Clock::new(0, service.tod.current_tick());
        let (verdict, _, _) = service.time_wait(&mut kernel, pid, DelayKind::Relative, delay);
        assert_eq!(verdict, WaitVerdict::Parked);

        service.rte_int(&mut kernel, &timer);
        assert_eq!(kernel.take_wakeup(pid), Some(Ok(0)));
        assert!(kernel.sched.pcb(pid).unwrap().in_ready_list);
    }

    #[test]
    fn test_time_wait_past_deadline_completes() {
        let (mut kernel, mut service, _) = setup();
        let pid = kernel.bind(Asid(4), 5).unwrap();
        let (verdict, _, _) =
            service.time_wait(&mut kernel, pid, DelayKind::Absolute, Clock::ZERO);
        assert_eq!(verdict, WaitVerdict::Ready(0));
    }

    #[test]
    fn test_time_wait2_companion_first() {
        let (mut kernel, mut service, _) = setup();
        let pid = kernel.bind(Asid(4), 5).unwrap();
        let companion = kernel.ecs.init(EcKind::Condition);

        let (verdict, _, elem) = service.time_wait2(
            &mut kernel,
            pid,
            DelayKind::Relative,
            Clock::new(0, 0x4000),
            companion,
            1,
        );
        assert_eq!(verdict, WaitVerdict::Parked);

        kernel.advance(companion);
        let expiry = TimeService::classify_expiry(kernel.take_wakeup(pid));
        assert_eq!(expiry, Expiry::Companion);
        assert!(service.time_cancel(elem).is_ok());
    }

    #[test]
    fn test_deferred_actions_run_outside_interrupt() {
        let (mut kernel, mut service, timer) = setup();
        let ec = kernel.ecs.init(EcKind::Condition);

        let deadline = service.tod.stored().wrapping_add(Clock::new(0, 1));
        service.rtq.lock().enter(
            deadline,
            Clock::ZERO,
            QueueFlags::UNWIRED,
            TimerAction::AdvanceEc(ec),
        );

        service.rte_int(&mut kernel, &timer);
        // Fired but deferred; the advance has not happened yet.
        assert_eq!(kernel.ecs.value(ec), 0);
        service.run_deferred(&mut kernel);
        assert_eq!(kernel.ecs.value(ec), 1);
    }

    #[test]
    fn test_loadav_samples_on_interval() {
        let (mut kernel, mut service, timer) = setup();
        service.init_loadav();

        let interval = vela_core::loadav::SAMPLE_INTERVAL.as_ticks();
        let reload = service.tod.current_tick() as u64;
        let ticks = interval / reload + 1;
        tick_n(&mut service, &mut kernel, &timer, ticks as u32);

        // One sample with two ready processes has landed.
        assert!(kernel.loadav.get()[0] > 0);
        // The element re-entered for the next period.
        assert_eq!(service.rt_queue_len(), 1);
    }

    #[test]
    fn test_set_time_of_day_latches_rtc() {
        use vela_hal::rtc::CalendarChip;

        let (_, mut service, _) = setup();
        let calendar = crate::calendar::Calendar::diskless();
        let chip = vela_hal::rtc::SimCalendar::new();

        // One day plus one minute past the epoch.
        let seconds = crate::tod::EPOCH_OFFSET_SECONDS + 86_400 + 60;
        let status = service.set_time_of_day(seconds, 0, &calendar, &chip);
        assert!(status.is_ok());

        let latched = chip.read_time().unwrap();
        assert_eq!((latched.year, latched.month, latched.day), (1980, 1, 2));
        assert_eq!((latched.hour, latched.minute), (0, 1));
        assert_eq!(service.tod.get_time_of_day().0, seconds);
    }

    #[test]
    fn test_timeslice_round_trip() {
        let (mut kernel, mut service, _) = setup();
        let pid = kernel.bind(Asid(4), 5).unwrap();
        service.set_ts(&mut kernel, pid, 0x10);

        // Charge enough virtual time to cross the slice deadline.
        kernel.sched.set_current(pid);
        kernel.sched.pcb_mut(pid).unwrap().vtimer = 0x20;
        service.vt_int(&mut kernel);

        // The state aged by one and a fresh default slice was
        // programmed.
        assert_eq!(kernel.sched.pcb(pid).unwrap().state, 4);
        assert_eq!(
            kernel.sched.pcb(pid).unwrap().vtimer,
            vela_core::sched::DEFAULT_TIMESLICE
        );
    }
}
