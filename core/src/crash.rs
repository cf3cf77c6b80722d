//! # System Crash Path
//!
//! Invariant violations do not return a status: they stop the machine.
//! The crash path displays the offending status, pauses long enough for
//! the operator to read it, and halts. In this rendition the halt is a
//! panic carrying the canonical message so harnesses can assert on the
//! exact violation.

use vela_types::Status;

/// Panic text for a lock acquired out of order.
pub const LOCK_ORDERING_VIOLATION: &str = "Lock_ordering_violation";

/// Panic text for releasing a lock that is not held.
pub const ILLEGAL_LOCK: &str = "Illegal_lock_err";

/// Panic text for an out-of-range process id on a fatal path.
pub const ILLEGAL_PROCESS_ID: &str = "Illegal process id";

/// Panic text for a hung floating-point board.
pub const FPU_HUNG: &str = "PEB FPU Is Hung Err";

/// Panic text for calendar access on a machine without the chip.
pub const NO_CALENDAR: &str = "No_calendar_on_system";

/// Stop the system with a status and its canonical message.
///
/// Only invariant violations come through here: lock-order breaks,
/// releasing an unheld lock, disk corruption on verified writes,
/// inconsistent mapping state.
pub fn crash_system(status: Status, message: &str) -> ! {
    log::error!("system crash {status}: {message}");
    panic!("{message} (status {status})");
}

#[cfg(test)]
mod tests {
    use super::*;
    use vela_types::status::subsys;

    #[test]
    #[should_panic(expected = "Lock_ordering_violation")]
    fn test_crash_carries_message() {
        crash_system(
            Status::new(subsys::PROC, 0x000E),
            LOCK_ORDERING_VIOLATION,
        );
    }
}
