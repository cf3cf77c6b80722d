//! # Disk Controller Interface
//!
//! Sector I/O as the paging and calendar subsystems see it: pages move
//! by physical page, addressed by volume index and disk address. Cached
//! operations go through the controller's track buffer; direct
//! operations bypass it. A verified write reads the sector back and
//! recomputes the checksum - a mismatch there is unrecoverable and the
//! controller reports it as such.
//!
//! The volume label lives in block 0 and carries, among other records,
//! the 10-byte timezone record the calendar persists.

use alloc::vec::Vec;
use hashbrown::HashMap;
use spin::Mutex;
use vela_types::status::{disk, Status};

// =============================================================================
// Constants
// =============================================================================

/// Bytes per disk page.
pub const PAGE_SIZE: usize = 1024;

/// Disk address of a volume's label block.
pub const LABEL_BLOCK: u32 = 0;

/// Byte offset of the timezone record within the label block.
pub const TIMEZONE_RECORD_OFFSET: usize = 0xE0;

// =============================================================================
// Operations
// =============================================================================

/// Controller operation codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskOp {
    /// Read through the track cache.
    ReadCached,
    /// Read bypassing the cache.
    ReadDirect,
    /// Write through the track cache.
    WriteCached,
    /// Write bypassing the cache, with readback verify.
    WriteDirect,
    /// Format the addressed track.
    Format,
}

/// Access to the disk controller.
pub trait DiskController: Send + Sync {
    /// Perform one page transfer.
    ///
    /// `header` carries the eight-byte sector header exchanged with the
    /// controller; reads fill it, writes consume it.
    fn disk_io(
        &self,
        op: DiskOp,
        vol_idx: u16,
        daddr: u32,
        page: &mut [u8; PAGE_SIZE],
        header: &mut [u8; 8],
    ) -> Status;

    /// Number of mounted volumes.
    fn volume_count(&self) -> u16;

    /// Allocate `count` contiguous disk addresses on a volume,
    /// biased toward `hint`.
    fn allocate_blocks(&self, vol_idx: u16, count: u32, hint: u32) -> Result<u32, Status>;

    /// Release a disk address back to its volume.
    fn free_block(&self, vol_idx: u16, daddr: u32);
}

// =============================================================================
// RAM Disk
// =============================================================================

struct Volume {
    blocks: HashMap<u32, Vec<u8>>,
    next_free: u32,
}

/// RAM-backed disk controller for the test machine.
pub struct RamDisk {
    volumes: Mutex<Vec<Volume>>,
}

impl core::fmt::Debug for RamDisk {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RamDisk")
            .field("volumes", &self.volume_count())
            .finish()
    }
}

impl RamDisk {
    /// A controller with `volumes` empty volumes mounted.
    pub fn new(volumes: u16) -> Self {
        let mut v = Vec::new();
        for _ in 0..volumes {
            v.push(Volume {
                blocks: HashMap::new(),
                // Block 0 is the label; allocation starts past it.
                next_free: 1,
            });
        }
        Self {
            volumes: Mutex::new(v),
        }
    }

    fn checksum(page: &[u8; PAGE_SIZE]) -> u16 {
        let mut sum: u16 = 0;
        for chunk in page.chunks_exact(2) {
            sum = sum.wrapping_add(u16::from_be_bytes([chunk[0], chunk[1]]));
        }
        sum
    }
}

impl DiskController for RamDisk {
    fn disk_io(
        &self,
        op: DiskOp,
        vol_idx: u16,
        daddr: u32,
        page: &mut [u8; PAGE_SIZE],
        header: &mut [u8; 8],
    ) -> Status {
        let mut vols = self.volumes.lock();
        let Some(vol) = vols.get_mut(vol_idx as usize) else {
            return disk::BAD_VOLUME;
        };

        match op {
            DiskOp::ReadCached | DiskOp::ReadDirect => {
                match vol.blocks.get(&daddr) {
                    Some(data) => page.copy_from_slice(data),
                    // Unwritten blocks read back as zeros.
                    None => page.fill(0),
                }
                let sum = Self::checksum(page);
                header[0..2].copy_from_slice(&sum.to_be_bytes());
                header[2..6].copy_from_slice(&daddr.to_be_bytes());
                Status::OK
            }
            DiskOp::WriteCached | DiskOp::WriteDirect => {
                vol.blocks.insert(daddr, page.to_vec());
                if matches!(op, DiskOp::WriteDirect) {
                    // Verified write: read back and compare checksums.
                    let stored = &vol.blocks[&daddr];
                    let mut readback = [0u8; PAGE_SIZE];
                    readback.copy_from_slice(stored);
                    if Self::checksum(&readback) != Self::checksum(page) {
                        log::warn!("disk: verify failed vol {} daddr {:#X}", vol_idx, daddr);
                        return disk::VERIFY_FAILED;
                    }
                }
                Status::OK
            }
            DiskOp::Format => {
                log::debug!("disk: format vol {}", vol_idx);
                vol.blocks.clear();
                vol.next_free = 1;
                Status::OK
            }
        }
    }

    fn volume_count(&self) -> u16 {
        self.volumes.lock().len() as u16
    }

    /// The RAM disk allocates from a bump pointer; `hint` only biases
    /// real geometry.
    fn allocate_blocks(&self, vol_idx: u16, count: u32, _hint: u32) -> Result<u32, Status> {
        let mut vols = self.volumes.lock();
        let vol = vols.get_mut(vol_idx as usize).ok_or(disk::BAD_VOLUME)?;
        let start = vol.next_free;
        vol.next_free += count;
        Ok(start)
    }

    fn free_block(&self, vol_idx: u16, daddr: u32) {
        let mut vols = self.volumes.lock();
        if let Some(vol) = vols.get_mut(vol_idx as usize) {
            vol.blocks.remove(&daddr);
        }
    }
}

/// Read a volume's label block.
pub fn read_label(
    controller: &dyn DiskController,
    vol_idx: u16,
) -> Result<[u8; PAGE_SIZE], Status> {
    let mut page = [0u8; PAGE_SIZE];
    let mut header = [0u8; 8];
    let status = controller.disk_io(DiskOp::ReadCached, vol_idx, LABEL_BLOCK, &mut page, &mut header);
    if status.is_err() {
        return Err(status);
    }
    Ok(page)
}

/// Write a volume's label block.
pub fn write_label(
    controller: &dyn DiskController,
    vol_idx: u16,
    page: &[u8; PAGE_SIZE],
) -> Status {
    let mut copy = *page;
    let mut header = [0u8; 8];
    controller.disk_io(DiskOp::WriteCached, vol_idx, LABEL_BLOCK, &mut copy, &mut header)
}

// Checksums fold 16-bit words, so pages must be an even byte count.
const _: () = assert!(PAGE_SIZE % 2 == 0);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_then_read_round_trips() {
        let d = RamDisk::new(1);
        let mut page = [0u8; PAGE_SIZE];
        page[0] = 0xAB;
        page[1023] = 0xCD;
        let mut header = [0u8; 8];
        assert!(d.disk_io(DiskOp::WriteCached, 0, 5, &mut page, &mut header).is_ok());

        let mut out = [0u8; PAGE_SIZE];
        assert!(d.disk_io(DiskOp::ReadCached, 0, 5, &mut out, &mut header).is_ok());
        assert_eq!(out[0], 0xAB);
        assert_eq!(out[1023], 0xCD);
    }

    #[test]
    fn test_unwritten_blocks_read_zero() {
        let d = RamDisk::new(1);
        let mut page = [0xFFu8; PAGE_SIZE];
        let mut header = [0u8; 8];
        assert!(d.disk_io(DiskOp::ReadCached, 0, 99, &mut page, &mut header).is_ok());
        assert!(page.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_bad_volume_rejected() {
        let d = RamDisk::new(1);
        let mut page = [0u8; PAGE_SIZE];
        let mut header = [0u8; 8];
        assert_eq!(
            d.disk_io(DiskOp::ReadCached, 3, 0, &mut page, &mut header),
            disk::BAD_VOLUME
        );
    }

    #[test]
    fn test_allocation_is_monotone() {
        let d = RamDisk::new(1);
        let a = d.allocate_blocks(0, 4, 0).unwrap();
        let b = d.allocate_blocks(0, 1, 0).unwrap();
        assert_eq!(b, a + 4);
    }

    #[test]
    fn test_label_round_trip() {
        let d = RamDisk::new(1);
        let mut label = [0u8; PAGE_SIZE];
        label[TIMEZONE_RECORD_OFFSET] = 0x01;
        assert!(write_label(&d, 0, &label).is_ok());
        let back = read_label(&d, 0).unwrap();
        assert_eq!(back[TIMEZONE_RECORD_OFFSET], 0x01);
    }
}
