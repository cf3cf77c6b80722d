//! # Vela Object Cache
//!
//! Every file, directory and device in the distributed namespace is an
//! object named by a UID. This crate is the indirection between that
//! UID and its page-mapped storage: the active-object table (AOTE)
//! caching the attribute record, the active-segment table (ASTE)
//! mapping each 32 KB segment's pages to disk addresses, and the
//! background purifiers that write dirty pages back to the local disk
//! or the remote file server.
//!
//! Remote objects look the same as local ones behind this layer; the
//! difference is whether a miss or a writeback crosses the remote-file
//! service.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

pub mod attrs;
pub mod cache;
pub mod purifier;

pub use attrs::{AttrFlags, Attributes, SetAttr, ATTR_RECORD_SIZE};
pub use cache::{AoteFlags, AoteId, AstCache, FlushOpts, Home, SegFlags};
pub use purifier::{LocalPurifier, RemotePurifier};
