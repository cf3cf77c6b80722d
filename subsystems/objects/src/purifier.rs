//! # Purifier Daemons
//!
//! Two long-running kernel processes keep the page pool clean. The
//! local purifier batches up to sixteen impure frames, marks them
//! being-written in their segment maps, writes them to disk in one
//! sweep, and hands the frames back to the free pool; when frames run
//! dangerously low it ages the working sets instead of waiting for
//! writes alone. The remote purifier drains one page at a time through
//! the file server, leaving a page marked for retry when the server
//! reports a recoverable failure.
//!
//! Both sleep on their own event counts; anyone who dirties pages
//! advances the count to wake them.

use arrayvec::ArrayVec;
use vela_core::kernel::Acquisition;
use vela_core::{EcId, EcKind, Kernel, LockId};
use vela_hal::disk::{DiskController, DiskOp, PAGE_SIZE};
use vela_hal::remote::RemoteFileService;
use vela_memory::frames::{AgeAction, FrameMap, WorkingSetTable, IMPURE_BATCH};
use vela_memory::MmuDriver;
use vela_types::status::file;
use vela_types::{Clock, Ppn};

use crate::cache::{AstCache, SegFlags};

fn take_lock(kernel: &mut Kernel, id: LockId) {
    let got = kernel.ml_lock(id);
    debug_assert_eq!(got, Acquisition::Acquired, "purifier lock contended");
}

// =============================================================================
// Local Purifier
// =============================================================================

/// The local-disk purifier's state.
#[derive(Debug)]
pub struct LocalPurifier {
    ec: EcId,
    carryover: u32,
    carryover_delta: u32,
    steal_baseline: u32,
    pages_written: u32,
}

impl LocalPurifier {
    /// Create the daemon state and its wake event count.
    pub fn init(kernel: &mut Kernel) -> Self {
        Self {
            ec: kernel.ecs.init(EcKind::Condition),
            carryover: 0,
            carryover_delta: 0,
            steal_baseline: 0,
            pages_written: 0,
        }
    }

    /// The event count that wakes the daemon.
    pub fn ec(&self) -> EcId {
        self.ec
    }

    /// Pages written to disk over the daemon's lifetime.
    pub fn pages_written(&self) -> u32 {
        self.pages_written
    }

    /// One wakeup's worth of work.
    ///
    /// Batches impure frames to disk while the free pool sits below
    /// the mid threshold or write debt (carryover) remains, then ages
    /// working sets if frames are still dangerously low.
    pub fn service(
        &mut self,
        kernel: &mut Kernel,
        cache: &mut AstCache,
        frames: &mut FrameMap,
        working_sets: &mut WorkingSetTable,
        mmu: &mut MmuDriver,
        disk: &dyn DiskController,
        now_abs: Clock,
    ) {
        take_lock(kernel, LockId::PMAP);

        loop {
            if !(frames.below_mid() || self.carryover > 0) || frames.impure_count() == 0 {
                break;
            }

            let batch = frames.get_impure(IMPURE_BATCH);
            if batch.is_empty() {
                break;
            }

            // Stage: mark each page being-written and clear its
            // hardware modified bit so new dirtying is observable.
            let mut writes: ArrayVec<(Ppn, u16, u32), IMPURE_BATCH> = ArrayVec::new();
            for &ppn in &batch {
                let Some((aste, slot)) = cache.find_page(ppn) else {
                    continue;
                };
                let entry = {
                    let e = &mut cache.aste_mut(aste).map[slot as usize];
                    e.flags.insert(SegFlags::IN_TRANS);
                    *e
                };
                if mmu.pmape(ppn).modified() {
                    mmu.clr_modified(ppn);
                    // Freshly dirty under us: the object's timestamps
                    // move with the data.
                    let aote = cache.aste(aste).aote;
                    if !cache.aote(aote).is_remote() {
                        cache.aote_mut(aote).attrs.dtm = now_abs;
                        cache.aote_mut(aote).attrs.mod_time = now_abs;
                    }
                }
                let aote = cache.aste(aste).aote;
                let volume = match cache.aote(aote).home {
                    crate::cache::Home::Local { volume } => volume,
                    crate::cache::Home::Remote { .. } => continue,
                };
                writes.push((ppn, volume, entry.disk_addr));
            }

            // The batch writes happen without the segment-map lock.
            kernel.ml_unlock(LockId::PMAP);

            for &(ppn, volume, daddr) in &writes {
                let mut page = [0u8; PAGE_SIZE];
                let mut header = [0u8; 8];
                let status = disk.disk_io(DiskOp::WriteCached, volume, daddr, &mut page, &mut header);
                if status.is_err() {
                    // Local batch writes only fail on broken hardware.
                    vela_core::crash::crash_system(status, "purifier batch write failed");
                }
                let _ = ppn;
            }

            take_lock(kernel, LockId::PMAP);

            let written = writes.len() as u32;
            for (ppn, _, _) in writes {
                if let Some((aste, slot)) = cache.find_page(ppn) {
                    let entry = &mut cache.aste_mut(aste).map[slot as usize];
                    entry.flags.remove(SegFlags::MODIFIED | SegFlags::IN_TRANS);
                }
                frames.avail(ppn);
            }
            self.pages_written += written;
            self.carryover = self.carryover.saturating_sub(written);

            if written > 0 {
                let in_trans = cache.in_trans_ec();
                let pages = cache.pages_ec();
                kernel.advance(in_trans);
                kernel.advance(pages);
            }
        }

        // Frame famine: age the working sets. The scans only shrink
        // the set accounting here; the frames themselves come back
        // through the reference-bit sweep on later passes.
        let mut passes = 0;
        while frames.dangerously_low() && passes < working_sets.len() {
            passes += 1;
            match working_sets.age(now_abs.high) {
                AgeAction::ScanOverdue(slot) | AgeAction::ScanChosen(slot) => {
                    frames.count_steal();
                    let set = working_sets.get_mut(slot);
                    set.page_count = set.page_count.saturating_sub(1);
                }
                AgeAction::Purge(slot) => {
                    let set = working_sets.get_mut(slot);
                    set.page_count = 0;
                    set.in_use = false;
                }
                AgeAction::Idle => break,
            }
        }

        // Bookkeeping: write debt and the adaptive scan interval.
        self.carryover += self.carryover_delta;
        self.carryover_delta = (frames.impure_count() + 11) / 12;
        let steals = frames.steal_count();
        working_sets.adapt_interval(steals - self.steal_baseline);
        self.steal_baseline = steals;
        frames.smooth_thresholds();

        kernel.ml_unlock(LockId::PMAP);
    }
}

// =============================================================================
// Remote Purifier
// =============================================================================

/// The remote-writeback purifier's state.
#[derive(Debug)]
pub struct RemotePurifier {
    ec: EcId,
    pages_written: u32,
    retries: u32,
}

impl RemotePurifier {
    /// Create the daemon state and its wake event count.
    pub fn init(kernel: &mut Kernel) -> Self {
        Self {
            ec: kernel.ecs.init(EcKind::Condition),
            pages_written: 0,
            retries: 0,
        }
    }

    /// The event count that wakes the daemon.
    pub fn ec(&self) -> EcId {
        self.ec
    }

    /// Pages pushed to the server so far.
    pub fn pages_written(&self) -> u32 {
        self.pages_written
    }

    /// Pages left marked for retry.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// One wakeup's worth of work: drain impure remote pages one at a
    /// time through the server.
    pub fn service(
        &mut self,
        kernel: &mut Kernel,
        cache: &mut AstCache,
        frames: &mut FrameMap,
        remote: &dyn RemoteFileService,
    ) {
        take_lock(kernel, LockId::PMAP);

        // Pages that belong to the local daemon go back afterwards, so
        // a mixed queue cannot spin this loop.
        let mut holdback: ArrayVec<Ppn, IMPURE_BATCH> = ArrayVec::new();

        loop {
            let batch = frames.get_impure(1);
            let Some(&ppn) = batch.first() else {
                break;
            };
            let Some((aste, slot)) = cache.find_page(ppn) else {
                continue;
            };

            let aote = cache.aste(aste).aote;
            let (volume_uid, uid) = match cache.aote(aote).home {
                crate::cache::Home::Remote { volume_uid } => (volume_uid, cache.aote(aote).uid),
                crate::cache::Home::Local { .. } => {
                    // Not ours; hand it back for the local daemon.
                    if holdback.try_push(ppn).is_err() {
                        frames.requeue_impure(ppn);
                        break;
                    }
                    continue;
                }
            };

            let seg = cache.aste(aste).seg_index as u32;
            let page_no = seg * crate::cache::PAGES_PER_SEGMENT as u32 + slot as u32;

            cache.aste_mut(aste).map[slot as usize]
                .flags
                .insert(SegFlags::IN_TRANS);

            kernel.ml_unlock(LockId::PMAP);
            let payload = [0u8; 16];
            let status = remote.write_page(volume_uid, uid, page_no, &payload);
            take_lock(kernel, LockId::PMAP);

            let entry = &mut cache.aste_mut(aste).map[slot as usize];
            entry.flags.remove(SegFlags::IN_TRANS);

            if status.is_ok() {
                entry.flags.remove(SegFlags::MODIFIED);
                frames.avail(ppn);
                self.pages_written += 1;
                let pages = cache.pages_ec();
                kernel.advance(pages);
            } else if status == file::OBJECT_NOT_FOUND {
                // The object is gone; the page cannot be saved.
                log::warn!("purifier: remote page for vanished object dropped");
                frames.avail(ppn);
            } else {
                // Recoverable: leave it marked for a later pass.
                frames.requeue_impure(ppn);
                self.retries += 1;
                break;
            }
        }

        for ppn in holdback {
            frames.requeue_impure(ppn);
        }

        kernel.ml_unlock(LockId::PMAP);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{AstCache, Home};
    use vela_hal::disk::RamDisk;
    use vela_hal::remote::LoopbackPeer;
    use vela_memory::MmuVariant;
    use vela_types::{Status, Uid};

    const LOCAL_UID: Uid = Uid::new(0x10, 0x01);
    const REMOTE_UID: Uid = Uid::new(0x20, 0x02);
    const VOLUME_UID: Uid = Uid::new(0x99, 0x01);

    struct Rig {
        kernel: Kernel,
        cache: AstCache,
        frames: FrameMap,
        working_sets: WorkingSetTable,
        mmu: MmuDriver,
        disk: RamDisk,
        peer: LoopbackPeer,
    }

    fn setup() -> Rig {
        let mut kernel = Kernel::init();
        let mut cache = AstCache::new(&mut kernel);
        cache.register_home(LOCAL_UID, Home::Local { volume: 0 });
        cache.register_home(REMOTE_UID, Home::Remote { volume_uid: VOLUME_UID });
        Rig {
            kernel,
            cache,
            frames: FrameMap::new(1000),
            working_sets: WorkingSetTable::new(4),
            mmu: MmuDriver::new(MmuVariant::Mc68020, 128, 4),
            disk: RamDisk::new(1),
            peer: LoopbackPeer::new(),
        }
    }

    fn dirty_local_pages(rig: &mut Rig, count: u16) {
        let id = rig.cache.activate(LOCAL_UID, false, &rig.peer).unwrap();
        rig.cache.aote_mut(id).attrs.size = count as u32 * 1024;
        for i in 0..count {
            let ppn = Ppn(20 + i);
            rig.cache.attach_page(id, i as u32, ppn, 700 + i as u32);
            rig.cache.dirty_page(ppn);
            rig.frames.mark_impure(ppn);
        }
    }

    #[test]
    fn test_local_purifier_writes_batch_and_frees_frames() {
        let mut rig = setup();
        dirty_local_pages(&mut rig, 5);
        let mut purifier = LocalPurifier::init(&mut rig.kernel);
        let pages_ec = rig.cache.pages_ec();
        let before = rig.kernel.ecs.value(pages_ec);

        purifier.service(
            &mut rig.kernel,
            &mut rig.cache,
            &mut rig.frames,
            &mut rig.working_sets,
            &mut rig.mmu,
            &rig.disk,
            Clock::new(0x100, 0),
        );

        assert_eq!(purifier.pages_written(), 5);
        assert_eq!(rig.frames.free_count(), 5);
        assert_eq!(rig.frames.impure_count(), 0);
        assert!(rig.kernel.ecs.value(pages_ec) > before);

        // The segment maps are clean again.
        let id = rig.cache.lookup_aote_by_uid(LOCAL_UID).unwrap();
        let idx = rig.cache.ensure_aste(id, 0);
        for slot in 0..5 {
            assert!(!rig.cache.aste(idx).map[slot]
                .flags
                .contains(SegFlags::MODIFIED));
        }
    }

    #[test]
    fn test_local_purifier_caps_batches_at_sixteen() {
        let mut rig = setup();
        dirty_local_pages(&mut rig, 20);
        let mut purifier = LocalPurifier::init(&mut rig.kernel);

        purifier.service(
            &mut rig.kernel,
            &mut rig.cache,
            &mut rig.frames,
            &mut rig.working_sets,
            &mut rig.mmu,
            &rig.disk,
            Clock::new(0x100, 0),
        );

        // Both batches drained in one service pass.
        assert_eq!(purifier.pages_written(), 20);
        assert_eq!(rig.frames.impure_count(), 0);
    }

    #[test]
    fn test_local_purifier_ages_working_sets_when_starved() {
        let mut rig = setup();
        let mut purifier = LocalPurifier::init(&mut rig.kernel);
        rig.working_sets.get_mut(1).in_use = true;
        rig.working_sets.get_mut(1).page_count = 40;
        rig.working_sets.get_mut(1).last_active = 0x100;

        purifier.service(
            &mut rig.kernel,
            &mut rig.cache,
            &mut rig.frames,
            &mut rig.working_sets,
            &mut rig.mmu,
            &rig.disk,
            Clock::new(0x100, 0),
        );

        // Starved for frames with no impure pages: the aging pass ran.
        assert!(rig.frames.steal_count() > 0);
        assert!(rig.working_sets.get(1).page_count < 40);
    }

    #[test]
    fn test_remote_purifier_drains_one_at_a_time() {
        let mut rig = setup();
        rig.peer
            .put_attributes(REMOTE_UID, crate::attrs::Attributes::default().encode());
        let id = rig.cache.activate(REMOTE_UID, false, &rig.peer).unwrap();
        for i in 0..3u16 {
            let ppn = Ppn(60 + i);
            rig.cache.attach_page(id, i as u32, ppn, 0);
            rig.cache.dirty_page(ppn);
            rig.frames.mark_impure(ppn);
        }
        let mut purifier = RemotePurifier::init(&mut rig.kernel);

        purifier.service(&mut rig.kernel, &mut rig.cache, &mut rig.frames, &rig.peer);

        assert_eq!(purifier.pages_written(), 3);
        assert_eq!(rig.frames.free_count(), 3);
        assert_eq!(purifier.retries(), 0);
    }

    #[test]
    fn test_remote_purifier_leaves_failed_page_for_retry() {
        let mut rig = setup();
        rig.peer
            .put_attributes(REMOTE_UID, crate::attrs::Attributes::default().encode());
        let id = rig.cache.activate(REMOTE_UID, false, &rig.peer).unwrap();
        let ppn = Ppn(60);
        rig.cache.attach_page(id, 0, ppn, 0);
        rig.cache.dirty_page(ppn);
        rig.frames.mark_impure(ppn);
        // The server reports a transient failure for page 0.
        rig.peer
            .fail_page_write(REMOTE_UID, 0, Status::new(8, 0x0003));

        let mut purifier = RemotePurifier::init(&mut rig.kernel);
        purifier.service(&mut rig.kernel, &mut rig.cache, &mut rig.frames, &rig.peer);

        assert_eq!(purifier.pages_written(), 0);
        assert_eq!(purifier.retries(), 1);
        assert_eq!(rig.frames.impure_count(), 1);
        // Still marked dirty for the next pass.
        let idx = rig.cache.ensure_aste(id, 0);
        assert!(rig.cache.aste(idx).map[0].flags.contains(SegFlags::MODIFIED));
    }
}
