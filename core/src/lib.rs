//! # Vela Kernel Core
//!
//! The scheduling heart of the kernel: event counts, the
//! priority-ordered ready list, resource locks, and the glue that ties
//! them together (preemption-inhibit regions, atomic-op depth, the
//! crash path, shutdown ordering).
//!
//! ## Model
//!
//! One CPU. Every wait in the system bottoms out in an event count;
//! the scheduler is invoked on every lock release, on every EC advance
//! that may satisfy a waiter, and on timer expiry. A context switch is
//! a scheduling-state transition: the dispatcher selects the ready-list
//! head as the current process, and blocked control flows continue when
//! their waker advances the event count they parked on.
//!
//! ## Components
//!
//! - [`ec`]: event counts (EC1 arena) and wake policies
//! - [`ec2`]: the general event-count tier visible to user processes
//! - [`sched`]: PCB table, ready list, dispatch, timeslice, suspend
//! - [`lock`]: the strictly ordered resource-lock lattice
//! - [`kernel`]: the combined state machine and its blocking operations
//! - [`os`]: boot-time error reporting and the shutdown walk
//! - [`xpd`]: the debugger observation surface

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

pub mod crash;
pub mod ec;
pub mod ec2;
pub mod kernel;
pub mod loadav;
pub mod lock;
pub mod os;
pub mod pcb;
pub mod sched;
pub mod xpd;

pub use ec::{EcId, EcKind};
pub use ec2::Ec2Ref;
pub use kernel::{global_kernel, Acquisition, Kernel, WaitVerdict};
pub use lock::{Exclusion, LockId, LOCK_ORDER};
pub use pcb::{Pcb, PcbFlags, ProcInfo};
pub use sched::{Scheduler, MAX_PROCESSES};

// The flag byte is wire-visible to the debugger; keep it a byte.
static_assertions::assert_eq_size!(PcbFlags, u8);
