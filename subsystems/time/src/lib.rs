//! # Vela Time Subsystem
//!
//! Everything the kernel knows about time: the 48-bit system clock
//! composed from the live hardware countdown, the real-time and
//! per-process virtual-time callback queues, the gradual time-of-day
//! adjustment machinery, and the civil calendar with its timezone
//! record on the boot volume.
//!
//! The [`TimeService`] struct ties the pieces together the way the
//! interrupt paths see them: the real-time tick advances the clock and
//! scans the real-time queue; a process's virtual tick charges its
//! timeslice and scans that process's virtual queue.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

pub mod calendar;
pub mod queue;
pub mod service;
pub mod tod;

pub use calendar::{Calendar, TimezoneRec};
pub use queue::{QElemId, QueueFlags, TimerAction, TimerQueue};
pub use service::{DelayKind, Expiry, TimeService};
pub use tod::TimeOfDay;
