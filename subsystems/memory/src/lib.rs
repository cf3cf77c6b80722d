//! # Vela Memory Subsystem
//!
//! The reverse-mapped side of virtual memory: an inverted page table
//! keyed by physical page number, with hash chains by virtual address
//! for the forward lookup, plus the frame-level accounting the paging
//! daemons steer by (free and impure counts, purifier thresholds,
//! working-set lists).
//!
//! The mapping structures follow the hardware shape - a PMAPE per
//! physical page carrying the chain link and attribute bits, a packed
//! ASID+VA word per page, and a PTT of bucket heads - but the chain
//! link is an arena index, never a pointer.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

pub mod frames;
pub mod mmu;

pub use frames::{FrameMap, WorkingSet, WorkingSetTable};
pub use mmu::{MmuDriver, MmuVariant, Protection};
