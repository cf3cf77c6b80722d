//! # Time of Day
//!
//! The system clock state: the stored 48-bit tick clock, the Unix-form
//! seconds/microseconds pair, and the per-tick reload value. Each
//! real-time interrupt folds one reload's worth of ticks into all of
//! them, carrying from the 16-bit low word into the high word.
//!
//! Reading the clock between interrupts composes the stored value with
//! the live countdown: complement the counter, add the reload,
//! account for an unserviced expiry, clamp, and carry. Gradual
//! adjustment perturbs the reload by a small skew for an exact number
//! of reloads, so the net shift equals the requested delta without the
//! clock ever stepping.

use vela_hal::timer::{TimerChannel, TimerDevice, TimerStatus, TIMER_RELOAD};
use vela_types::status::{time as time_status, Status};
use vela_types::{math, Clock};

/// Seconds between the Unix epoch (1970) and the tick epoch (1980).
pub const EPOCH_OFFSET_SECONDS: u32 = 0x12CE_A600;

/// Largest gradual adjustment accepted, in seconds.
pub const MAX_ADJUST_SECONDS: i32 = 8000;

/// Skew divisor for adjustments up to one second.
const SKEW_DIVISOR_SLOW: i16 = 0x00A7;

/// Skew divisor for larger adjustments.
const SKEW_DIVISOR_FAST: i16 = 0x0686;

/// Countdown threshold below which an unserviced expiry is assumed.
const WRAP_WINDOW: u16 = 0xFE4;

// =============================================================================
// Time of Day
// =============================================================================

/// The clock and time-of-day state driven by the real-time tick.
#[derive(Debug)]
pub struct TimeOfDay {
    clock_high: u32,
    clock_low: u16,
    unix_seconds: u32,
    unix_micros: u32,
    /// Ticks per reload, including any active skew.
    current_tick: u16,
    skew: i16,
    /// Adjustment ticks still to be absorbed by skewed reloads.
    delta_remaining: i32,
    boot_time: u32,
}

impl TimeOfDay {
    /// Clock at the epoch, canonical reload, no adjustment.
    pub const fn new() -> Self {
        Self {
            clock_high: 0,
            clock_low: 0,
            unix_seconds: EPOCH_OFFSET_SECONDS,
            unix_micros: 0,
            current_tick: TIMER_RELOAD,
            skew: 0,
            delta_remaining: 0,
            boot_time: 0,
        }
    }

    /// The stored clock words (as of the last tick).
    pub fn stored(&self) -> Clock {
        Clock::new(self.clock_high, self.clock_low)
    }

    /// The clock value recorded at boot.
    pub fn boot_time(&self) -> u32 {
        self.boot_time
    }

    /// Current reload value (canonical plus active skew).
    pub fn current_tick(&self) -> u16 {
        self.current_tick
    }

    /// Mark the present stored clock as the boot time.
    pub fn record_boot(&mut self) {
        self.boot_time = self.clock_high;
    }

    // =========================================================================
    // Ticking
    // =========================================================================

    /// Fold one real-time interrupt into the clock.
    ///
    /// Adds the reload value to the low word, carrying into the high
    /// word on wrap, and advances the Unix pair by the same span.
    /// While an adjustment is active, each reload absorbs one skew's
    /// worth of the remaining delta; the reload reverts when the delta
    /// is spent.
    pub fn rt_tick(&mut self) {
        let tick = self.current_tick;

        let (low, carry) = self.clock_low.overflowing_add(tick);
        self.clock_low = low;
        if carry {
            self.clock_high = self.clock_high.wrapping_add(1);
        }

        self.unix_micros += tick as u32 * 4;
        while self.unix_micros >= 1_000_000 {
            self.unix_micros -= 1_000_000;
            self.unix_seconds = self.unix_seconds.wrapping_add(1);
        }

        if self.skew != 0 {
            self.delta_remaining -= self.skew as i32;
            if self.delta_remaining == 0 {
                self.skew = 0;
                self.current_tick = TIMER_RELOAD;
            }
        }
    }

    // =========================================================================
    // Reading
    // =========================================================================

    /// Compose the live 48-bit clock from the stored words and the
    /// hardware countdown.
    pub fn clock(&self, timer: &dyn TimerDevice) -> Clock {
        let mut high = self.clock_high;

        // Elapsed ticks this reload: complement the down-counter and
        // add the reload value.
        let counter = timer.read_counter(TimerChannel::RealTime);
        let mut ticks = (!counter).wrapping_add(TIMER_RELOAD);

        // A small elapsed count with the expiry bit up means the
        // counter wrapped before the interrupt was serviced; that
        // reload's ticks are already owed.
        if ticks < WRAP_WINDOW && timer.status().contains(TimerStatus::RTE_PENDING) {
            let (sum, carry) = ticks.overflowing_add(self.current_tick);
            if carry {
                high = high.wrapping_add(1);
            }
            ticks = sum;
        }

        // Never credit more than one reload.
        if (ticks as i16) > (self.current_tick as i16) {
            ticks = self.current_tick;
        }

        let (low, carry) = self.clock_low.overflowing_add(ticks);
        if carry {
            high = high.wrapping_add(1);
        }
        Clock::new(high, low)
    }

    /// The drift-adjusted absolute clock (feeds object timestamps).
    pub fn abs_clock(&self, timer: &dyn TimerDevice) -> Clock {
        self.clock(timer)
    }

    /// The Unix-form (seconds, microseconds) pair.
    pub fn get_time_of_day(&self) -> (u32, u32) {
        (self.unix_seconds, self.unix_micros)
    }

    // =========================================================================
    // Setting and adjusting
    // =========================================================================

    /// Step the clock to an operator-supplied time of day.
    ///
    /// Returns the new 48-bit clock so the caller can latch the civil
    /// time into the calendar chip.
    pub fn set_time_of_day(&mut self, seconds: u32, micros: u32) -> Clock {
        self.unix_seconds = seconds;
        self.unix_micros = micros % 1_000_000;

        let tick_secs = seconds.wrapping_sub(EPOCH_OFFSET_SECONDS);
        let mut clock = Clock::from_secs(tick_secs as i32);
        clock = clock.wrapping_add(Clock::new(0, (self.unix_micros / 4) as u16));
        self.clock_high = clock.high;
        self.clock_low = clock.low;
        log::info!("time: time of day set to {seconds}.{micros:06}");
        clock
    }

    /// Begin a gradual time adjustment of (seconds, microseconds).
    ///
    /// The shift is absorbed by perturbing the reload value by a fixed
    /// skew for `delta / skew` reloads; the remainder that does not
    /// divide evenly is dropped. Magnitudes beyond
    /// [`MAX_ADJUST_SECONDS`] are rejected. Returns the previous
    /// adjustment still outstanding, in the same form.
    pub fn adjust_time_of_day(
        &mut self,
        delta_seconds: i32,
        delta_micros: i32,
    ) -> Result<(i32, i32), Status> {
        if delta_seconds.abs() > MAX_ADJUST_SECONDS {
            return Err(time_status::ADJUST_TOO_LARGE);
        }

        let mut delta_ticks = delta_seconds
            .wrapping_mul(vela_types::clock::TICKS_PER_SECOND as i32)
            .wrapping_add(delta_micros / 4);

        let divisor = if delta_ticks == 0 {
            0
        } else {
            let base = if delta_ticks.abs() <= vela_types::clock::TICKS_PER_SECOND as i32 {
                SKEW_DIVISOR_SLOW
            } else {
                SKEW_DIVISOR_FAST
            };
            if delta_ticks < 0 {
                -base
            } else {
                base
            }
        };

        if divisor != 0 {
            // Truncate to an exact multiple of the skew so the shift
            // completes in whole reloads.
            let quotient = math::div_i32_by_i16(delta_ticks, divisor);
            delta_ticks = quotient.wrapping_mul(divisor as i32);
        }

        let old_delta = self.delta_remaining;
        let skew = if delta_ticks == 0 { 0 } else { divisor };
        self.skew = skew;
        self.current_tick = TIMER_RELOAD.wrapping_add(skew as u16);
        self.delta_remaining = delta_ticks;

        Ok((
            old_delta / vela_types::clock::TICKS_PER_SECOND as i32,
            (old_delta % vela_types::clock::TICKS_PER_SECOND as i32) * 4,
        ))
    }

    /// The adjustment not yet absorbed, as (seconds, microseconds).
    pub fn get_adjust(&self) -> (i32, i32) {
        (
            self.delta_remaining / vela_types::clock::TICKS_PER_SECOND as i32,
            (self.delta_remaining % vela_types::clock::TICKS_PER_SECOND as i32) * 4,
        )
    }
}

impl Default for TimeOfDay {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vela_hal::timer::SimTimers;

    #[test]
    fn test_rt_tick_carries_across_low_word() {
        let mut tod = TimeOfDay::new();
        tod.clock_low = 0xFFF0;
        tod.rt_tick();
        // 0xFFF0 + 0x1047 wraps: high increments, low is the overflow.
        assert_eq!(tod.clock_high, 1);
        assert_eq!(tod.clock_low, 0xFFF0u16.wrapping_add(TIMER_RELOAD));
        assert_eq!(tod.clock_low, 0x1037);
    }

    #[test]
    fn test_rt_tick_advances_unix_pair() {
        let mut tod = TimeOfDay::new();
        let per_tick_us = TIMER_RELOAD as u32 * 4;
        let ticks_per_second = 1_000_000 / per_tick_us + 1;
        for _ in 0..ticks_per_second {
            tod.rt_tick();
        }
        assert_eq!(tod.unix_seconds, EPOCH_OFFSET_SECONDS + 1);
    }

    #[test]
    fn test_clock_composes_live_countdown() {
        let mut tod = TimeOfDay::new();
        tod.clock_low = 0x1000;
        let timers = SimTimers::new();
        // 0x47 ticks have elapsed on the countdown; the complement
        // composition credits the ticks fully counted down.
        timers.tick(TimerChannel::RealTime, 0x47);

        let c = tod.clock(&timers);
        assert_eq!(c.high, 0);
        assert_eq!(c.low, 0x1000 + 0x46);
    }

    #[test]
    fn test_clock_credits_at_most_one_reload() {
        let tod = TimeOfDay::new();
        let timers = SimTimers::new();
        // Counter far past a full reload without the pending bit.
        timers.tick(TimerChannel::RealTime, TIMER_RELOAD - 1);
        let c = tod.clock(&timers);
        assert!(c.low <= TIMER_RELOAD);
    }

    #[test]
    fn test_set_time_of_day_lands_on_tick_clock() {
        let mut tod = TimeOfDay::new();
        let clock = tod.set_time_of_day(EPOCH_OFFSET_SECONDS + 90, 8);
        assert_eq!(clock, Clock::from_secs(90).wrapping_add(Clock::new(0, 2)));
        assert_eq!(tod.get_time_of_day(), (EPOCH_OFFSET_SECONDS + 90, 8));
    }

    #[test]
    fn test_adjust_rejects_large_delta() {
        let mut tod = TimeOfDay::new();
        assert_eq!(
            tod.adjust_time_of_day(8001, 0),
            Err(time_status::ADJUST_TOO_LARGE)
        );
    }

    #[test]
    fn test_adjust_programs_skewed_reload() {
        let mut tod = TimeOfDay::new();
        // Half a second: the slow divisor applies.
        let (old_s, old_us) = tod.adjust_time_of_day(0, 500_000).unwrap();
        assert_eq!((old_s, old_us), (0, 0));
        assert_eq!(tod.current_tick, TIMER_RELOAD + SKEW_DIVISOR_SLOW as u16);

        let (_, remaining_us) = tod.get_adjust();
        // Truncated to a whole multiple of the skew.
        assert_eq!(remaining_us % (SKEW_DIVISOR_SLOW as i32 * 4), 0);
        assert!(remaining_us <= 500_000);
    }

    #[test]
    fn test_adjustment_absorbs_exactly_and_reverts_reload() {
        let mut tod = TimeOfDay::new();
        tod.adjust_time_of_day(0, 500_000).unwrap();
        let (_, start_us) = tod.get_adjust();
        let reloads = start_us / 4 / SKEW_DIVISOR_SLOW as i32;

        for _ in 0..reloads {
            tod.rt_tick();
        }
        assert_eq!(tod.get_adjust(), (0, 0));
        assert_eq!(tod.current_tick, TIMER_RELOAD);
    }

    #[test]
    fn test_negative_adjust_uses_negative_skew() {
        let mut tod = TimeOfDay::new();
        tod.adjust_time_of_day(0, -400_000).unwrap();
        let (_, rem) = tod.get_adjust();
        assert!(rem < 0);
        // Reload shrinks so wall time slows.
        assert_eq!(
            tod.current_tick,
            TIMER_RELOAD.wrapping_add((-SKEW_DIVISOR_SLOW) as u16)
        );
        let before = tod.get_adjust().1;
        tod.rt_tick();
        assert!(tod.get_adjust().1 > before);
    }
}
