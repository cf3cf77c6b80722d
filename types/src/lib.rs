//! # Vela Shared Types
//!
//! Foundation types used by every kernel subsystem: the 48-bit tick
//! clock, object UIDs, status codes, and the small id newtypes
//! (process, address space, physical/virtual page numbers).
//!
//! Everything here is plain data with exact integer semantics. The
//! wire representation of multibyte integers is big-endian; the
//! conversion helpers on each type are bit-exact at that boundary.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

pub mod clock;
pub mod ids;
pub mod math;
pub mod status;
pub mod uid;

pub use clock::Clock;
pub use ids::{Asid, Pid, Ppn, Vpn};
pub use status::{KernelResult, Status};
pub use uid::Uid;

// Wire-visible types must keep their exact widths.
static_assertions::assert_eq_size!(Status, u32);
static_assertions::assert_eq_size!(Uid, u64);
