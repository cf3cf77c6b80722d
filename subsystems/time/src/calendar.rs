//! # Civil Calendar
//!
//! Conversions between the 48-bit tick clock and Gregorian civil time,
//! plus the persistent timezone record on the boot volume's label
//! block. Epoch is 1980-01-01 00:00:00.
//!
//! The leap rule is the simplified divisible-by-four test, valid for
//! the machine's service life through 2099: 2000 is a leap year and
//! 1900 is not representable as a tick clock anyway. The weekday
//! formula carries the full century corrections so it agrees with the
//! proleptic calendar across 1900-2099.

use vela_core::{Kernel, LockId};
use vela_hal::disk::{self, DiskController, PAGE_SIZE, TIMEZONE_RECORD_OFFSET};
use vela_hal::rtc::{CalendarChip, CivilTime};
use vela_types::status::{cal as cal_status, Status};
use vela_types::{Clock, KernelResult};

/// Days in each month of a non-leap year.
pub const DAYS_PER_MONTH: [i16; 12] = [31, 28, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];

/// Size of the persistent timezone record.
pub const TIMEZONE_RECORD_SIZE: usize = 10;

/// Ticks the clock may lag the last valid time before verify objects
/// (about one minute of high-word units).
const BACKWARD_SLACK: i32 = 229;

// =============================================================================
// Decode
// =============================================================================

/// Decode a tick clock into civil (year, month, day, hour, minute,
/// second), weekday filled in.
pub fn decode_time(clock: Clock) -> CivilTime {
    let total_seconds = clock.to_secs_unsigned();

    let second = (total_seconds % 60) as i16;
    let remaining = total_seconds / 60;
    let minute = (remaining % 60) as i16;
    let remaining = remaining / 60;
    let hour = (remaining % 24) as i16;
    let mut day_of_year = (remaining / 24) as i32 + 1;

    let mut year: i16 = 1980;
    let mut days_in_year: i32 = 366;
    while days_in_year < day_of_year {
        day_of_year -= days_in_year;
        year += 1;
        days_in_year = if year % 4 == 0 { 366 } else { 365 };
    }

    let mut months = DAYS_PER_MONTH;
    if year % 4 == 0 {
        months[1] = 29;
    }

    let mut month: i16 = 1;
    let mut cumulative: i32 = 0;
    for &len in &months {
        if day_of_year <= cumulative + len as i32 {
            break;
        }
        cumulative += len as i32;
        month += 1;
    }
    let day = (day_of_year - cumulative) as i16;

    CivilTime {
        year,
        month,
        day,
        weekday: weekday(year, month, day),
        hour,
        minute,
        second,
    }
}

/// Day of week for a civil date, 0 = Sunday.
pub fn weekday(year: i16, month: i16, day: i16) -> i16 {
    let y = if month < 3 { year as i32 - 1 } else { year as i32 };

    // Leap and century corrections.
    let mut sum = y + y.div_euclid(4) + 1 - y / 100 + y / 400;

    // Month offset: ((month + 9) mod 12) maps March to zero.
    let adjusted = (month as i32 + 9).rem_euclid(12);
    sum += (adjusted * 153 + 2) / 5;

    ((day as i32 + sum + 1).rem_euclid(7)) as i16
}

// =============================================================================
// Timezone Record
// =============================================================================

/// The in-memory timezone record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimezoneRec {
    /// Offset from UTC in minutes.
    pub utc_delta: i16,
    /// Four-character timezone name.
    pub name: [u8; 4],
    /// Drift correction applied on top of the offset.
    pub drift: Clock,
}

impl Default for TimezoneRec {
    fn default() -> Self {
        Self {
            utc_delta: 0,
            name: *b"UTC ",
            drift: Clock::ZERO,
        }
    }
}

// =============================================================================
// Calendar
// =============================================================================

/// Calendar state: timezone, drift, and the last-valid-time fence.
#[derive(Debug)]
pub struct Calendar {
    tz: TimezoneRec,
    last_valid_time: u32,
    boot_volume: u16,
    /// No boot disk: the in-memory record is authoritative.
    diskless: bool,
}

impl Calendar {
    /// A calendar for a machine booted from `boot_volume`.
    pub fn new(boot_volume: u16) -> Self {
        Self {
            tz: TimezoneRec::default(),
            last_valid_time: 0,
            boot_volume,
            diskless: false,
        }
    }

    /// A calendar for a diskless machine.
    pub fn diskless() -> Self {
        Self {
            tz: TimezoneRec::default(),
            last_valid_time: 0,
            boot_volume: 0,
            diskless: true,
        }
    }

    /// Snapshot the timezone record.
    pub fn get_info(&self) -> TimezoneRec {
        self.tz
    }

    /// The last-valid-time fence (clock high word).
    pub fn last_valid_time(&self) -> u32 {
        self.last_valid_time
    }

    /// Replace the drift correction.
    pub fn set_drift(&mut self, drift: Clock) {
        self.tz.drift = drift;
    }

    // =========================================================================
    // Offsets
    // =========================================================================

    fn offset_clock(&self) -> Clock {
        Clock::from_secs(self.tz.utc_delta as i32 * 60)
    }

    /// UTC to local: add the timezone offset.
    pub fn apply_local_offset(&self, clock: Clock) -> Clock {
        clock.wrapping_add(self.offset_clock())
    }

    /// Local to UTC: remove the timezone offset.
    pub fn remove_local_offset(&self, clock: Clock) -> Clock {
        clock.wrapping_sub(self.offset_clock())
    }

    /// Local time: the given UTC clock plus offset plus drift.
    pub fn get_local_time(&self, utc: Clock) -> Clock {
        self.apply_local_offset(utc).wrapping_add(self.tz.drift)
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Read the timezone record from the boot volume's label block.
    ///
    /// Diskless machines keep the in-memory record; nothing is read.
    pub fn read_timezone(
        &mut self,
        kernel: &mut Kernel,
        controller: &dyn DiskController,
    ) -> KernelResult<TimezoneRec> {
        if !self.diskless {
            kernel.set_lock(LockId::CAL);
            let label = match disk::read_label(controller, self.boot_volume) {
                Ok(l) => l,
                Err(status) => {
                    kernel.clr_lock(LockId::CAL);
                    return Err(status);
                }
            };
            let o = TIMEZONE_RECORD_OFFSET;
            self.tz.utc_delta = i16::from_be_bytes([label[o], label[o + 1]]);
            self.tz.name.copy_from_slice(&label[o + 2..o + 6]);
            self.last_valid_time =
                u32::from_be_bytes([label[o + 6], label[o + 7], label[o + 8], label[o + 9]]);
            kernel.clr_lock(LockId::CAL);
        }
        Ok(self.tz)
    }

    /// Write the timezone record to the label block, stamping the
    /// current clock as the last valid time.
    ///
    /// The name must be printable ASCII or high characters.
    pub fn write_timezone(
        &mut self,
        kernel: &mut Kernel,
        controller: &dyn DiskController,
        tz: TimezoneRec,
        now_high: u32,
    ) -> Status {
        for &c in &tz.name {
            if c < 0x20 || (c > 0x7E && c < 0xA1) {
                return cal_status::DATE_OR_TIME_INVALID;
            }
        }

        self.tz = tz;
        self.last_valid_time = now_high;

        if self.diskless {
            return Status::OK;
        }

        kernel.set_lock(LockId::CAL);
        let mut label = match disk::read_label(controller, self.boot_volume) {
            Ok(l) => l,
            Err(status) => {
                kernel.clr_lock(LockId::CAL);
                return status;
            }
        };
        self.encode_record(&mut label);
        let status = disk::write_label(controller, self.boot_volume, &label);
        kernel.clr_lock(LockId::CAL);
        status
    }

    fn encode_record(&self, label: &mut [u8; PAGE_SIZE]) {
        let o = TIMEZONE_RECORD_OFFSET;
        label[o..o + 2].copy_from_slice(&self.tz.utc_delta.to_be_bytes());
        label[o + 2..o + 6].copy_from_slice(&self.tz.name);
        label[o + 6..o + 10].copy_from_slice(&self.last_valid_time.to_be_bytes());
    }

    // =========================================================================
    // Verification
    // =========================================================================

    /// Check the wall clock against the last valid time.
    ///
    /// Backwards by more than about a minute, or forwards by more than
    /// `max_delta` high-word units, is suspect: `ask` is consulted
    /// (returning true to accept the clock anyway). A declined clock
    /// reports `cal_refused`.
    pub fn verify(
        &mut self,
        clock_high: u32,
        max_delta: i32,
        ask: &mut dyn FnMut(&str) -> bool,
    ) -> KernelResult<bool> {
        // Drift resets on every verification pass.
        self.tz.drift = Clock::ZERO;

        let delta = clock_high.wrapping_sub(self.last_valid_time) as i32;
        let message = if delta < -BACKWARD_SLACK {
            "the calendar is more than a minute behind the last valid time"
        } else if delta <= max_delta {
            return Ok(true);
        } else {
            "more days have elapsed since the last valid time than expected"
        };

        log::warn!("cal: {message}");
        if ask(message) {
            Ok(true)
        } else {
            Err(cal_status::REFUSED)
        }
    }

    // =========================================================================
    // Hardware calendar
    // =========================================================================

    /// Latch a civil time into the calendar chip.
    pub fn write_calendar(&self, chip: &dyn CalendarChip, time: &CivilTime) -> Status {
        if time.month < 1
            || time.month > 12
            || time.day < 1
            || time.day > 31
            || time.hour > 23
            || time.minute > 59
            || time.second > 59
        {
            return cal_status::DATE_OR_TIME_INVALID;
        }
        chip.write_time(time)
    }
}

// The on-disk record is exactly ten bytes.
static_assertions::const_assert_eq!(TIMEZONE_RECORD_SIZE, 2 + 4 + 4);

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use vela_hal::disk::RamDisk;
    use vela_hal::rtc::SimCalendar;

    fn ticks_of_days(days: u64) -> Clock {
        Clock::from_ticks(days * 86_400 * 250_000)
    }

    #[test]
    fn test_epoch_decodes_to_1980() {
        let t = decode_time(Clock::ZERO);
        assert_eq!((t.year, t.month, t.day), (1980, 1, 1));
        assert_eq!((t.hour, t.minute, t.second), (0, 0, 0));
        // 1980-01-01 was a Tuesday.
        assert_eq!(t.weekday, 2);
    }

    #[test]
    fn test_january_has_31_days() {
        let t = decode_time(ticks_of_days(31));
        assert_eq!((t.year, t.month, t.day), (1980, 2, 1));
    }

    #[test]
    fn test_leap_day_1980() {
        let t = decode_time(ticks_of_days(59));
        assert_eq!((t.year, t.month, t.day), (1980, 2, 29));
    }

    #[test]
    fn test_year_rollover_past_leap_year() {
        let t = decode_time(ticks_of_days(366));
        assert_eq!((t.year, t.month, t.day), (1981, 1, 1));
    }

    #[test]
    fn test_weekday_calibration() {
        assert_eq!(weekday(1980, 1, 1), 2); // Tuesday
        assert_eq!(weekday(1900, 1, 1), 1); // Monday (1900 not leap)
        assert_eq!(weekday(2000, 2, 29), 2); // Tuesday (2000 leap)
        assert_eq!(weekday(2099, 12, 31), 4); // Thursday
    }

    #[test]
    fn test_offset_round_trip_ist() {
        let mut cal = Calendar::diskless();
        cal.tz.utc_delta = 330; // IST
        let c = Clock::from_secs(50_000);
        assert_eq!(cal.remove_local_offset(cal.apply_local_offset(c)), c);
        assert_eq!(cal.apply_local_offset(cal.remove_local_offset(c)), c);
    }

    #[test]
    fn test_local_time_includes_drift() {
        let mut cal = Calendar::diskless();
        cal.tz.utc_delta = 60;
        cal.set_drift(Clock::new(0, 100));
        let local = cal.get_local_time(Clock::ZERO);
        assert_eq!(local, Clock::from_secs(3600).wrapping_add(Clock::new(0, 100)));
    }

    #[test]
    fn test_timezone_persists_through_label_block() {
        let mut kernel = Kernel::init();
        let disk = RamDisk::new(1);
        let mut cal = Calendar::new(0);

        let tz = TimezoneRec {
            utc_delta: -300,
            name: *b"EST ",
            drift: Clock::ZERO,
        };
        assert!(cal.write_timezone(&mut kernel, &disk, tz, 0x1234).is_ok());

        let mut other = Calendar::new(0);
        let read = other.read_timezone(&mut kernel, &disk).unwrap();
        assert_eq!(read.utc_delta, -300);
        assert_eq!(read.name, *b"EST ");
        assert_eq!(other.last_valid_time(), 0x1234);
    }

    #[test]
    fn test_write_timezone_rejects_unprintable_name() {
        let mut kernel = Kernel::init();
        let disk = RamDisk::new(1);
        let mut cal = Calendar::new(0);
        let tz = TimezoneRec {
            utc_delta: 0,
            name: [0x01, b'S', b'T', b' '],
            drift: Clock::ZERO,
        };
        assert_eq!(
            cal.write_timezone(&mut kernel, &disk, tz, 0),
            cal_status::DATE_OR_TIME_INVALID
        );
    }

    #[test]
    fn test_diskless_record_is_authoritative() {
        let mut kernel = Kernel::init();
        let disk = RamDisk::new(0);
        let mut cal = Calendar::diskless();
        let tz = TimezoneRec {
            utc_delta: 120,
            name: *b"EET ",
            drift: Clock::ZERO,
        };
        // No volumes mounted: a disk access would fail, so none happens.
        assert!(cal.write_timezone(&mut kernel, &disk, tz, 7).is_ok());
        assert_eq!(cal.read_timezone(&mut kernel, &disk).unwrap().utc_delta, 120);
    }

    #[test]
    fn test_verify_accepts_in_range_clock() {
        let mut cal = Calendar::diskless();
        cal.last_valid_time = 1000;
        let mut asked = false;
        let result = cal.verify(1500, 1000, &mut |_| {
            asked = true;
            false
        });
        assert_eq!(result, Ok(true));
        assert!(!asked);
    }

    #[test]
    fn test_verify_refused_when_operator_declines() {
        let mut cal = Calendar::diskless();
        cal.last_valid_time = 1000;
        assert_eq!(
            cal.verify(1_000_000, 1000, &mut |_| false),
            Err(cal_status::REFUSED)
        );
        assert_eq!(cal.verify(1_000_000, 1000, &mut |_| true), Ok(true));
    }

    #[test]
    fn test_verify_flags_backwards_clock() {
        let mut cal = Calendar::diskless();
        cal.last_valid_time = 10_000;
        // Within the minute of slack: fine.
        assert_eq!(cal.verify(10_000 - 200, 1000, &mut |_| false), Ok(true));
        // Beyond it: the operator is consulted.
        assert_eq!(
            cal.verify(10_000 - 300, 1000, &mut |_| false),
            Err(cal_status::REFUSED)
        );
    }

    #[test]
    fn test_write_calendar_validates_fields() {
        let cal = Calendar::diskless();
        let chip = SimCalendar::new();
        let mut t = decode_time(Clock::ZERO);
        assert!(cal.write_calendar(&chip, &t).is_ok());
        t.month = 13;
        assert_eq!(
            cal.write_calendar(&chip, &t),
            cal_status::DATE_OR_TIME_INVALID
        );
    }

    proptest! {
        // The 48-bit clock spans about 35 years past the epoch, so
        // decode properties range over days the clock can express.
        #[test]
        fn prop_weekday_agrees_with_day_count(days in 0u64..13_000) {
            // Successive days cycle through the week, anchored at the
            // epoch Tuesday.
            let t = decode_time(ticks_of_days(days));
            let expected = ((days + 2) % 7) as i16;
            prop_assert_eq!(t.weekday, expected);
        }

        #[test]
        fn prop_decode_fields_in_range(days in 0u64..13_000, secs in 0u64..86_400) {
            let clock = Clock::from_ticks((days * 86_400 + secs) * 250_000);
            let t = decode_time(clock);
            prop_assert!(t.year >= 1980 && t.year <= 2015);
            prop_assert!(t.month >= 1 && t.month <= 12);
            prop_assert!(t.day >= 1 && t.day <= 31);
            prop_assert!(t.hour <= 23 && t.minute <= 59 && t.second <= 59);
        }

        #[test]
        fn prop_offset_round_trip(
            secs in 0i32..1_000_000,
            delta in -720i16..=780,
        ) {
            let mut cal = Calendar::diskless();
            cal.tz.utc_delta = delta;
            let c = Clock::from_secs(secs);
            prop_assert_eq!(cal.remove_local_offset(cal.apply_local_offset(c)), c);
        }
    }
}
