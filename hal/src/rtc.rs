//! # Battery-backed Calendar Chip
//!
//! The calendar chip keeps civil time across power cycles. The kernel
//! pokes it when the operator sets the time of day and reads it once at
//! boot; everything else runs off the tick clock.

use spin::Mutex;
use vela_types::status::{cal, Status};

// =============================================================================
// Civil Time
// =============================================================================

/// A decoded civil time as the calendar chip stores it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CivilTime {
    /// Four-digit year.
    pub year: i16,
    /// Month, 1-12.
    pub month: i16,
    /// Day of month, 1-31.
    pub day: i16,
    /// Day of week, 0 = Sunday.
    pub weekday: i16,
    /// Hour, 0-23.
    pub hour: i16,
    /// Minute, 0-59.
    pub minute: i16,
    /// Second, 0-59.
    pub second: i16,
}

// =============================================================================
// Chip Interface
// =============================================================================

/// Access to the calendar hardware.
pub trait CalendarChip: Send + Sync {
    /// True when the machine carries a calendar chip.
    fn present(&self) -> bool;

    /// Latch a civil time into the chip.
    fn write_time(&self, time: &CivilTime) -> Status;

    /// Read the chip's current civil time.
    fn read_time(&self) -> Result<CivilTime, Status>;
}

// =============================================================================
// Simulated Chip
// =============================================================================

/// RAM-backed calendar chip.
#[derive(Debug)]
pub struct SimCalendar {
    present: bool,
    time: Mutex<CivilTime>,
}

impl SimCalendar {
    /// A present chip initialized to the epoch.
    pub const fn new() -> Self {
        Self {
            present: true,
            time: Mutex::new(CivilTime {
                year: 1980,
                month: 1,
                day: 1,
                weekday: 2,
                hour: 0,
                minute: 0,
                second: 0,
            }),
        }
    }

    /// A machine with no calendar chip fitted.
    pub const fn absent() -> Self {
        Self {
            present: false,
            time: Mutex::new(CivilTime {
                year: 0,
                month: 0,
                day: 0,
                weekday: 0,
                hour: 0,
                minute: 0,
                second: 0,
            }),
        }
    }
}

impl Default for SimCalendar {
    fn default() -> Self {
        Self::new()
    }
}

impl CalendarChip for SimCalendar {
    fn present(&self) -> bool {
        self.present
    }

    fn write_time(&self, time: &CivilTime) -> Status {
        if !self.present {
            return cal::NO_CALENDAR;
        }
        *self.time.lock() = *time;
        Status::OK
    }

    fn read_time(&self) -> Result<CivilTime, Status> {
        if !self.present {
            return Err(cal::NO_CALENDAR);
        }
        Ok(*self.time.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_then_read() {
        let rtc = SimCalendar::new();
        let t = CivilTime {
            year: 1987,
            month: 6,
            day: 30,
            weekday: 2,
            hour: 12,
            minute: 30,
            second: 5,
        };
        assert!(rtc.write_time(&t).is_ok());
        assert_eq!(rtc.read_time().unwrap(), t);
    }

    #[test]
    fn test_absent_chip_reports_no_calendar() {
        let rtc = SimCalendar::absent();
        assert!(!rtc.present());
        assert_eq!(rtc.read_time().unwrap_err(), cal::NO_CALENDAR);
    }
}
