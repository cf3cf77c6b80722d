//! # Vela Hardware Abstraction Layer
//!
//! The kernel core talks to hardware through the narrow interfaces in
//! this crate: the interval-timer pair, the battery-backed calendar
//! chip, the disk controller, the remote-file service, and the MMU
//! control registers. Each interface is a trait with a RAM-backed
//! implementation that gives the core a deterministic machine to run
//! against; platform ports supply register-level implementations of the
//! same traits.
//!
//! Interrupt masking is modeled by the [`ipl`] module: a scoped guard
//! standing in for raising the processor interrupt priority level on a
//! single-CPU machine.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

cfg_if::cfg_if! {
    if #[cfg(target_pointer_width = "16")] {
        compile_error!("vela-hal requires a 32-bit or wider host");
    }
}

pub mod disk;
pub mod ipl;
pub mod mmu_regs;
pub mod remote;
pub mod rtc;
pub mod timer;

pub use disk::{DiskController, DiskOp, RamDisk};
pub use ipl::{raise_ipl, IplGuard};
pub use mmu_regs::{MmuCsr, MmuRegisters};
pub use remote::{LoopbackPeer, RemoteFileService};
pub use rtc::{CalendarChip, CivilTime, SimCalendar};
pub use timer::{SimTimers, TimerChannel, TimerDevice, TIMER_RELOAD};
