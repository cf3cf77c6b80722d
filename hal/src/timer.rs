//! # Interval Timer Pair
//!
//! The machine carries one real-time interval timer driving the
//! wall-clock tick and one virtual timer counting only while a process
//! runs. Both are 16-bit down-counters reloaded from a programmable
//! value; the canonical reload is [`TIMER_RELOAD`] ticks, and a
//! pending bit in the control register records an expiry that has not
//! been serviced yet.
//!
//! The core reads the live countdown when composing the 48-bit clock,
//! so the device interface exposes raw counter access rather than a
//! cooked elapsed-time view.

use core::sync::atomic::{AtomicU16, AtomicU8, Ordering};

// =============================================================================
// Constants
// =============================================================================

/// Canonical reload value for the real-time tick (0x1047 ticks ~= 16.7 ms).
pub const TIMER_RELOAD: u16 = 0x1047;

bitflags::bitflags! {
    /// Control/status register bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TimerStatus: u8 {
        /// Real-time timer expiry pending.
        const RTE_PENDING = 0x01;
        /// Virtual timer expiry pending.
        const VT_PENDING = 0x02;
    }
}

/// The addressable timer channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TimerChannel {
    /// Control/status register.
    Control = 0,
    /// Real-time event timer.
    RealTime = 1,
    /// Virtual (process) timer.
    Virtual = 2,
    /// Auxiliary timer.
    Aux = 3,
}

// =============================================================================
// Device Interface
// =============================================================================

/// Access to the interval-timer hardware.
pub trait TimerDevice: Send + Sync {
    /// Read a channel's current countdown value.
    fn read_counter(&self, channel: TimerChannel) -> u16;

    /// Write a channel's countdown value.
    ///
    /// Writing the real-time or virtual channel also clears that
    /// channel's pending bit, matching the hardware acknowledge.
    fn write_counter(&self, channel: TimerChannel, value: u16);

    /// Read the control/status bits.
    fn status(&self) -> TimerStatus;
}

// =============================================================================
// Simulated Device
// =============================================================================

/// RAM-backed timer pair for the test machine.
///
/// Tests drive it explicitly: [`SimTimers::tick`] consumes countdown
/// ticks and raises the pending bit on expiry the way the silicon
/// would.
#[derive(Debug)]
pub struct SimTimers {
    rte: AtomicU16,
    vt: AtomicU16,
    aux: AtomicU16,
    status: AtomicU8,
}

impl SimTimers {
    /// A fresh device with both counters at the canonical reload.
    pub const fn new() -> Self {
        Self {
            rte: AtomicU16::new(TIMER_RELOAD),
            vt: AtomicU16::new(TIMER_RELOAD),
            aux: AtomicU16::new(0),
            status: AtomicU8::new(0),
        }
    }

    fn cell(&self, channel: TimerChannel) -> &AtomicU16 {
        match channel {
            TimerChannel::RealTime => &self.rte,
            TimerChannel::Virtual => &self.vt,
            _ => &self.aux,
        }
    }

    fn pending_bit(channel: TimerChannel) -> TimerStatus {
        match channel {
            TimerChannel::RealTime => TimerStatus::RTE_PENDING,
            TimerChannel::Virtual => TimerStatus::VT_PENDING,
            _ => TimerStatus::empty(),
        }
    }

    /// Advance a channel by `ticks` countdown steps.
    ///
    /// On underflow the counter wraps (it keeps counting down through
    /// zero) and the pending bit is raised.
    pub fn tick(&self, channel: TimerChannel, ticks: u16) {
        let cell = self.cell(channel);
        let before = cell.load(Ordering::Acquire);
        let after = before.wrapping_sub(ticks);
        cell.store(after, Ordering::Release);
        if ticks >= before && ticks > 0 {
            self.status
                .fetch_or(Self::pending_bit(channel).bits(), Ordering::AcqRel);
        }
    }

    /// Force a pending bit, as an interrupt assertion would.
    pub fn set_pending(&self, channel: TimerChannel) {
        self.status
            .fetch_or(Self::pending_bit(channel).bits(), Ordering::AcqRel);
    }
}

impl Default for SimTimers {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerDevice for SimTimers {
    fn read_counter(&self, channel: TimerChannel) -> u16 {
        self.cell(channel).load(Ordering::Acquire)
    }

    fn write_counter(&self, channel: TimerChannel, value: u16) {
        self.cell(channel).store(value, Ordering::Release);
        let bit = Self::pending_bit(channel);
        if !bit.is_empty() {
            self.status.fetch_and(!bit.bits(), Ordering::AcqRel);
        }
    }

    fn status(&self) -> TimerStatus {
        TimerStatus::from_bits_truncate(self.status.load(Ordering::Acquire))
    }
}
