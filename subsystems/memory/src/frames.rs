//! # Frame Accounting and Working Sets
//!
//! The page-level bookkeeping the purifier daemons steer by: how many
//! frames are clean and free, which frames are impure (dirty and
//! reclaimable once written), and the per-address-space working-set
//! lists with their aging state.
//!
//! Thresholds derive from the pageable limit: the purifiers run while
//! free frames sit below `limit / 20` and panic-scan working sets
//! when the count falls under the hard floor.

use alloc::vec::Vec;
use arrayvec::ArrayVec;
use vela_types::Ppn;

/// Largest batch of impure pages handed to the local purifier.
pub const IMPURE_BATCH: usize = 16;

/// Free-frame floor that triggers working-set aging.
pub const AGING_FLOOR: u32 = 24;

/// Multiplier of the working-set random-choice generator.
const SEED_MULTIPLIER: u16 = 0x3039;

// =============================================================================
// Frame Map
// =============================================================================

/// Free and impure frame accounting.
#[derive(Debug)]
pub struct FrameMap {
    free: Vec<Ppn>,
    impure: Vec<Ppn>,
    pageable_limit: u32,
    low_thresh: u16,
    mid_thresh: u16,
    steal_count: u32,
}

impl FrameMap {
    /// A map for `pageable_limit` pageable frames.
    pub fn new(pageable_limit: u32) -> Self {
        let mut map = Self {
            free: Vec::new(),
            impure: Vec::new(),
            pageable_limit,
            low_thresh: 0,
            mid_thresh: 0,
            steal_count: 0,
        };
        map.recompute_thresholds();
        map
    }

    /// Recompute the purifier thresholds from the pageable limit.
    pub fn recompute_thresholds(&mut self) {
        self.low_thresh = (self.pageable_limit / 50) as u16;
        self.mid_thresh = (self.pageable_limit / 20) as u16;
    }

    /// Blend a fresh threshold pair into the running ones (the
    /// purifier's periodic smoothing).
    pub fn smooth_thresholds(&mut self) {
        self.low_thresh = ((self.low_thresh as u32 + self.pageable_limit / 50) / 2) as u16;
        self.mid_thresh = ((self.mid_thresh as u32 + self.pageable_limit / 20) / 2) as u16;
    }

    /// The hard floor.
    pub fn low_thresh(&self) -> u16 {
        self.low_thresh
    }

    /// The purifier's run-while-below threshold.
    pub fn mid_thresh(&self) -> u16 {
        self.mid_thresh
    }

    /// Frames currently free.
    pub fn free_count(&self) -> u32 {
        self.free.len() as u32
    }

    /// Frames dirty and awaiting writeout.
    pub fn impure_count(&self) -> u32 {
        self.impure.len() as u32
    }

    /// Pages stolen from working sets so far.
    pub fn steal_count(&self) -> u32 {
        self.steal_count
    }

    /// Record a theft from a working set.
    pub fn count_steal(&mut self) {
        self.steal_count += 1;
    }

    /// A frame became clean and reusable.
    pub fn avail(&mut self, ppn: Ppn) {
        self.free.push(ppn);
    }

    /// Take a free frame.
    pub fn take_free(&mut self) -> Option<Ppn> {
        self.free.pop()
    }

    /// A frame turned dirty and reclaimable.
    pub fn mark_impure(&mut self, ppn: Ppn) {
        if !self.impure.contains(&ppn) {
            self.impure.push(ppn);
        }
    }

    /// Hand the purifier a batch of impure frames, oldest first.
    pub fn get_impure(&mut self, max: usize) -> ArrayVec<Ppn, IMPURE_BATCH> {
        let take = max.min(IMPURE_BATCH).min(self.impure.len());
        let mut batch = ArrayVec::new();
        for ppn in self.impure.drain(..take) {
            batch.push(ppn);
        }
        batch
    }

    /// Put a frame back on the impure list for retry.
    pub fn requeue_impure(&mut self, ppn: Ppn) {
        self.impure.push(ppn);
    }

    /// True while the purifier should keep writing.
    pub fn below_mid(&self) -> bool {
        self.free_count() < self.mid_thresh as u32
    }

    /// True when frames are dangerously low.
    pub fn dangerously_low(&self) -> bool {
        self.free_count() + self.impure_count() < AGING_FLOOR
    }
}

// =============================================================================
// Working Sets
// =============================================================================

/// One address space's working-set list.
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkingSet {
    /// High-water page count.
    pub high_water: u32,
    /// Pages currently in the set.
    pub page_count: u32,
    /// Clock high word at the last scan.
    pub last_scan: u32,
    /// Clock high word of the last activity.
    pub last_active: u32,
    /// Scans owed (incremented by the periodic sweep).
    pub scan_due: u16,
    /// The slot is live.
    pub in_use: bool,
}

/// What the aging pass decided to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgeAction {
    /// Scan this slot immediately; it is overdue.
    ScanOverdue(usize),
    /// Purge this idle slot entirely.
    Purge(usize),
    /// The weighted random choice landed on this slot.
    ScanChosen(usize),
    /// Nothing eligible.
    Idle,
}

/// The working-set lists and their aging parameters.
#[derive(Debug)]
pub struct WorkingSetTable {
    sets: Vec<WorkingSet>,
    seed: u16,
    /// Scans-owed threshold before a slot is overdue.
    pub scan_interval: u16,
    /// Floor and ceiling for the adaptive interval.
    pub min_interval: u16,
    /// Ceiling for the adaptive interval.
    pub max_interval: u16,
    /// Step the interval grows by while steals are quiet.
    pub interval_delta: u16,
    /// Clock high-word span after which a slot counts as idle.
    pub idle_span: u32,
}

impl WorkingSetTable {
    /// A table with `slots` working-set lists.
    pub fn new(slots: usize) -> Self {
        let mut sets = Vec::with_capacity(slots);
        for _ in 0..slots {
            sets.push(WorkingSet::default());
        }
        Self {
            sets,
            seed: 1,
            scan_interval: 8,
            min_interval: 2,
            max_interval: 64,
            interval_delta: 2,
            idle_span: 0x1000,
        }
    }

    /// Borrow a slot.
    pub fn get(&self, slot: usize) -> &WorkingSet {
        &self.sets[slot]
    }

    /// Mutably borrow a slot.
    pub fn get_mut(&mut self, slot: usize) -> &mut WorkingSet {
        &mut self.sets[slot]
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.sets.len()
    }

    /// True when no slots exist.
    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    /// One step of the aging pass.
    ///
    /// Overdue slots scan immediately and idle slots purge; otherwise
    /// a slot is chosen with probability proportional to its page
    /// count, using the multiplicative generator.
    pub fn age(&mut self, now_high: u32) -> AgeAction {
        let mut weight_total: u32 = 0;

        for (i, set) in self.sets.iter_mut().enumerate() {
            if !set.in_use || set.page_count == 0 {
                continue;
            }
            if set.scan_due > self.scan_interval {
                set.scan_due = 0;
                set.last_scan = now_high;
                return AgeAction::ScanOverdue(i);
            }
            if now_high.wrapping_sub(set.last_active) > self.idle_span {
                return AgeAction::Purge(i);
            }
            if set.page_count > set.high_water || weight_total == 0 {
                weight_total += set.page_count;
            }
        }

        if weight_total == 0 {
            return AgeAction::Idle;
        }

        // Weighted random choice over the accumulated page counts.
        self.seed = self.seed.wrapping_mul(SEED_MULTIPLIER) & 0x3FF;
        let target = (weight_total * self.seed as u32) >> 10;
        let mut accumulator = 0u32;
        for (i, set) in self.sets.iter().enumerate() {
            if !set.in_use || set.page_count == 0 {
                continue;
            }
            accumulator += set.page_count;
            if accumulator > target {
                return AgeAction::ScanChosen(i);
            }
        }
        AgeAction::Idle
    }

    /// Grow the scan interval while nothing is being stolen; shrink it
    /// when steals spike.
    pub fn adapt_interval(&mut self, steal_delta: u32) {
        if steal_delta == 0 {
            self.scan_interval =
                (self.scan_interval + self.interval_delta).min(self.max_interval);
        } else if steal_delta > 5 {
            self.scan_interval = (self.scan_interval >> 1).max(self.min_interval);
        }
    }
}
