//! # Remote File Service
//!
//! Objects homed on a file server reach the cache through this
//! interface. Framing, timeouts and retries belong to the RPC layer
//! below it; the kernel core only observes success, failure, and
//! object-not-found.

use hashbrown::HashMap;
use spin::Mutex;
use vela_types::status::{file, Status};
use vela_types::Uid;

/// Size of the wire attribute record.
pub const ATTR_RECORD_SIZE: usize = 144;

// =============================================================================
// Service Interface
// =============================================================================

/// Remote operations the object cache forwards to a file server.
pub trait RemoteFileService: Send + Sync {
    /// Truncate a remote object.
    fn truncate(&self, volume: Uid, object: Uid, new_size: u32, flags: u16) -> Status;

    /// Invalidate a page range of a remote object.
    fn invalidate(&self, volume: Uid, object: Uid, start_page: u32, count: u32) -> Status;

    /// Reserve backing store for a byte range of a remote object.
    fn reserve(&self, volume: Uid, object: Uid, start: u32, count: u32) -> Status;

    /// Fetch a remote object's attribute record.
    fn get_attributes(
        &self,
        volume: Uid,
        object: Uid,
        flags: u16,
        out: &mut [u8; ATTR_RECORD_SIZE],
    ) -> Status;

    /// Write one page of a remote object.
    fn write_page(&self, volume: Uid, object: Uid, page_no: u32, page: &[u8]) -> Status;
}

// =============================================================================
// Loopback Peer
// =============================================================================

/// RAM-backed peer standing in for a file server.
///
/// Tests prime it with attribute records and fault injections; the
/// purifier and cache paths then exercise the same call shapes a real
/// network peer would see.
#[derive(Default)]
pub struct LoopbackPeer {
    attrs: Mutex<HashMap<Uid, [u8; ATTR_RECORD_SIZE]>>,
    pages: Mutex<HashMap<(Uid, u32), Status>>,
    truncates: Mutex<u32>,
    invalidates: Mutex<u32>,
}

impl core::fmt::Debug for LoopbackPeer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LoopbackPeer").finish_non_exhaustive()
    }
}

impl LoopbackPeer {
    /// A peer with no objects.
    pub fn new() -> Self {
        Self::default()
    }

    /// Prime the attribute record served for an object.
    pub fn put_attributes(&self, object: Uid, record: [u8; ATTR_RECORD_SIZE]) {
        self.attrs.lock().insert(object, record);
    }

    /// Arrange for a page write to report the given status.
    pub fn fail_page_write(&self, object: Uid, page_no: u32, status: Status) {
        self.pages.lock().insert((object, page_no), status);
    }

    /// Number of truncates the peer has served.
    pub fn truncate_count(&self) -> u32 {
        *self.truncates.lock()
    }

    /// Number of invalidations the peer has served.
    pub fn invalidate_count(&self) -> u32 {
        *self.invalidates.lock()
    }
}

impl RemoteFileService for LoopbackPeer {
    fn truncate(&self, _volume: Uid, object: Uid, _new_size: u32, _flags: u16) -> Status {
        if !self.attrs.lock().contains_key(&object) {
            return file::OBJECT_NOT_FOUND;
        }
        *self.truncates.lock() += 1;
        Status::OK
    }

    fn invalidate(&self, _volume: Uid, object: Uid, _start_page: u32, _count: u32) -> Status {
        if !self.attrs.lock().contains_key(&object) {
            return file::OBJECT_NOT_FOUND;
        }
        *self.invalidates.lock() += 1;
        Status::OK
    }

    fn reserve(&self, _volume: Uid, object: Uid, _start: u32, _count: u32) -> Status {
        if !self.attrs.lock().contains_key(&object) {
            return file::OBJECT_NOT_FOUND;
        }
        Status::OK
    }

    fn get_attributes(
        &self,
        _volume: Uid,
        object: Uid,
        _flags: u16,
        out: &mut [u8; ATTR_RECORD_SIZE],
    ) -> Status {
        match self.attrs.lock().get(&object) {
            Some(record) => {
                out.copy_from_slice(record);
                Status::OK
            }
            None => file::OBJECT_NOT_FOUND,
        }
    }

    fn write_page(&self, _volume: Uid, object: Uid, page_no: u32, _page: &[u8]) -> Status {
        if let Some(status) = self.pages.lock().get(&(object, page_no)) {
            return *status;
        }
        Status::OK
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_object_not_found() {
        let peer = LoopbackPeer::new();
        let uid = Uid::new(1, 2);
        assert_eq!(
            peer.truncate(Uid::NIL, uid, 0, 0),
            file::OBJECT_NOT_FOUND
        );
    }

    #[test]
    fn test_primed_attributes_served() {
        let peer = LoopbackPeer::new();
        let uid = Uid::new(1, 2);
        let mut record = [0u8; ATTR_RECORD_SIZE];
        record[0] = 0x42;
        peer.put_attributes(uid, record);

        let mut out = [0u8; ATTR_RECORD_SIZE];
        assert!(peer.get_attributes(Uid::NIL, uid, 0, &mut out).is_ok());
        assert_eq!(out[0], 0x42);
    }

    #[test]
    fn test_page_write_fault_injection() {
        let peer = LoopbackPeer::new();
        let uid = Uid::new(3, 4);
        peer.fail_page_write(uid, 7, file::OBJECT_NOT_FOUND);
        assert_eq!(
            peer.write_page(Uid::NIL, uid, 7, &[0u8; 16]),
            file::OBJECT_NOT_FOUND
        );
        assert!(peer.write_page(Uid::NIL, uid, 8, &[0u8; 16]).is_ok());
    }
}
