//! # MMU Driver - Inverted Page Table
//!
//! Translation state is kept per *physical* page: each PPN owns a
//! PMAPE with the hash-chain link, attribute bits and protection, and
//! a packed ASID+VA word naming the virtual page mapped onto it. The
//! forward path hashes the virtual page number into the PTT, whose
//! buckets point at chain heads; the reverse path recovers the bucket
//! from the packed word, so removal never searches.
//!
//! PPN 0 is reserved - a zero link ends a chain and a zero bucket is
//! empty.
//!
//! Two packing layouts exist for the ASID+VA word, selected once at
//! boot by the processor generation. All chain mutation happens at
//! raised IPL with the control register's PTT-access window open.

use alloc::vec;
use alloc::vec::Vec;
use vela_hal::ipl;
use vela_hal::mmu_regs::MmuRegisters;
use vela_types::{Asid, Ppn, Vpn};

// =============================================================================
// Variants and Protection
// =============================================================================

/// Processor generation, fixing the ASID+VA packing layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmuVariant {
    /// 68020-class: 10 VA bits, 6 ASID bits.
    Mc68020,
    /// 68010-class: 9 VA bits, 7 ASID bits.
    Mc68010,
}

impl MmuVariant {
    const fn va_bits(self) -> u32 {
        match self {
            MmuVariant::Mc68020 => 10,
            MmuVariant::Mc68010 => 9,
        }
    }

    const fn asid_bits(self) -> u32 {
        match self {
            MmuVariant::Mc68020 => 6,
            MmuVariant::Mc68010 => 7,
        }
    }

    /// Number of PTT buckets under this packing.
    pub const fn bucket_count(self) -> usize {
        1 << self.va_bits()
    }

    fn pack(self, vpn: Vpn, asid: Asid) -> u16 {
        let va_part = vpn.value() & ((1 << self.va_bits()) - 1);
        let asid_part = asid.value() as u32 & ((1 << self.asid_bits()) - 1);
        ((va_part << self.asid_bits()) | asid_part) as u16
    }

    fn unpack_bucket(self, packed: u16) -> usize {
        (packed >> self.asid_bits()) as usize
    }

    fn unpack_asid(self, packed: u16) -> u16 {
        packed & ((1 << self.asid_bits()) - 1) as u16
    }
}

bitflags::bitflags! {
    /// Page protection bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Protection: u8 {
        /// Readable.
        const READ = 0x1;
        /// Writable.
        const WRITE = 0x2;
    }
}

impl Protection {
    /// No access.
    pub const NONE: Self = Self::empty();
    /// Read-write.
    pub const READ_WRITE: Self = Self::READ.union(Self::WRITE);
}

// Bucket counts follow the packed VA width.
static_assertions::const_assert_eq!(MmuVariant::Mc68020.bucket_count(), 1024);
static_assertions::const_assert_eq!(MmuVariant::Mc68010.bucket_count(), 512);

// =============================================================================
// PMAPE
// =============================================================================

/// Per-physical-page mapping attributes.
#[derive(Debug, Clone, Copy, Default)]
pub struct Pmape {
    /// Next PPN on the hash chain; 0 ends the chain.
    link: u16,
    head: bool,
    global: bool,
    referenced: bool,
    modified: bool,
    valid: bool,
    prot: Protection,
}

impl Pmape {
    /// Whether this page currently carries a mapping.
    pub fn installed(&self) -> bool {
        self.valid
    }

    /// The referenced (clock-hand) bit.
    pub fn referenced(&self) -> bool {
        self.referenced
    }

    /// The modified bit.
    pub fn modified(&self) -> bool {
        self.modified
    }

    /// The global (shared-mapping) bit.
    pub fn global(&self) -> bool {
        self.global
    }
}

// =============================================================================
// Driver
// =============================================================================

/// The inverted page table and its control registers.
pub struct MmuDriver {
    variant: MmuVariant,
    pmape: Vec<Pmape>,
    asid_va: Vec<u16>,
    ptt: Vec<u16>,
    /// Lowest pageable PPN (below are wired kernel pages).
    low_ppn: u16,
    regs: MmuRegisters,
}

impl core::fmt::Debug for MmuDriver {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MmuDriver")
            .field("variant", &self.variant)
            .field("pages", &self.pmape.len())
            .finish_non_exhaustive()
    }
}

impl MmuDriver {
    /// A driver for `page_count` physical pages.
    pub fn new(variant: MmuVariant, page_count: usize, low_ppn: u16) -> Self {
        Self {
            variant,
            pmape: vec![Pmape::default(); page_count],
            asid_va: vec![0; page_count],
            ptt: vec![0; variant.bucket_count()],
            low_ppn,
            regs: MmuRegisters::new(),
        }
    }

    /// The packing variant in force.
    pub fn variant(&self) -> MmuVariant {
        self.variant
    }

    /// The control registers (for the DMA-setup MCR toggle).
    pub fn regs(&self) -> &MmuRegisters {
        &self.regs
    }

    /// Borrow a page's PMAPE.
    pub fn pmape(&self, ppn: Ppn) -> &Pmape {
        &self.pmape[ppn.index()]
    }

    // =========================================================================
    // Install
    // =========================================================================

    /// Install a shared mapping (GLOBAL set).
    pub fn install(&mut self, ppn: Ppn, vpn: Vpn, asid: Asid, prot: Protection) {
        self.install_inner(ppn, vpn, asid, prot, true);
    }

    /// Install a private mapping (GLOBAL clear).
    pub fn install_private(&mut self, ppn: Ppn, vpn: Vpn, asid: Asid, prot: Protection) {
        self.install_inner(ppn, vpn, asid, prot, false);
    }

    /// Install a run of contiguous virtual pages onto a list of
    /// physical pages.
    pub fn install_list(&mut self, ppns: &[Ppn], start: Vpn, asid: Asid, prot: Protection) {
        for (i, &ppn) in ppns.iter().enumerate() {
            self.install_inner(ppn, Vpn(start.value() + i as u32), asid, prot, true);
        }
    }

    fn install_inner(&mut self, ppn: Ppn, vpn: Vpn, asid: Asid, prot: Protection, global: bool) {
        debug_assert_ne!(ppn.value(), 0, "PPN 0 is reserved");

        ipl::with_raised_ipl(|| {
            let saved_csr = self.regs.open_ptt_access();

            // An existing mapping for this frame goes first.
            if self.pmape[ppn.index()].valid {
                self.remove_locked(ppn);
            }

            let packed = self.variant.pack(vpn, asid);
            self.asid_va[ppn.index()] = packed;

            let bucket = self.variant.unpack_bucket(packed);
            let head = self.ptt[bucket];
            let head_link = if head == 0 {
                0
            } else {
                self.pmape[head as usize].link
            };

            let entry = &mut self.pmape[ppn.index()];
            entry.valid = true;
            entry.global = global;
            entry.prot = prot;
            entry.referenced = false;
            entry.modified = false;

            if head == 0 {
                // First mapping in this bucket: new chain head.
                entry.head = true;
                entry.link = 0;
                self.ptt[bucket] = ppn.value();
            } else {
                // Join just behind the head, taking over its link.
                entry.head = false;
                entry.link = head_link;
                self.pmape[head as usize].link = ppn.value();
            }

            self.regs.restore_csr(saved_csr);
        });
    }

    // =========================================================================
    // Remove
    // =========================================================================

    /// Remove a page's mapping, keeping only its referenced/modified
    /// bits.
    pub fn remove(&mut self, ppn: Ppn) {
        ipl::with_raised_ipl(|| {
            let saved_csr = self.regs.open_ptt_access();
            self.remove_locked(ppn);
            self.regs.restore_csr(saved_csr);
        });
    }

    fn remove_locked(&mut self, ppn: Ppn) {
        if !self.pmape[ppn.index()].valid {
            return;
        }

        let packed = self.asid_va[ppn.index()];
        let bucket = self.variant.unpack_bucket(packed);

        if self.ptt[bucket] == ppn.value() {
            // Head removal: the successor becomes the bucket head.
            let link = self.pmape[ppn.index()].link;
            self.ptt[bucket] = link;
            if link != 0 {
                self.pmape[link as usize].head = true;
            }
        } else {
            // Interior: splice out behind the predecessor.
            let mut pos = self.ptt[bucket];
            while pos != 0 && self.pmape[pos as usize].link != ppn.value() {
                pos = self.pmape[pos as usize].link;
            }
            if pos != 0 {
                self.pmape[pos as usize].link = self.pmape[ppn.index()].link;
            }
        }

        // Clear everything but the usage attribute bits.
        let entry = &mut self.pmape[ppn.index()];
        let (referenced, modified) = (entry.referenced, entry.modified);
        *entry = Pmape {
            referenced,
            modified,
            ..Pmape::default()
        };
    }

    /// Remove every mapping belonging to an address space.
    ///
    /// Scans the pageable range; each candidate is re-checked with the
    /// access window open before removal.
    pub fn remove_asid(&mut self, asid: Asid) {
        log::debug!("mmu: removing mappings for asid {}", asid.value());
        let asid_match = asid.value() & ((1 << self.variant.asid_bits()) - 1) as u16;
        for i in (self.low_ppn as usize)..self.pmape.len() {
            if !self.pmape[i].valid {
                continue;
            }
            if self.variant.unpack_asid(self.asid_va[i]) != asid_match {
                continue;
            }
            ipl::with_raised_ipl(|| {
                let saved_csr = self.regs.open_ptt_access();
                // Re-check under the window; the world may have moved.
                if self.pmape[i].valid
                    && self.variant.unpack_asid(self.asid_va[i]) == asid_match
                {
                    self.remove_locked(Ppn(i as u16));
                }
                self.regs.restore_csr(saved_csr);
            });
        }
    }

    // =========================================================================
    // Attributes
    // =========================================================================

    /// Flip a page's protection, returning the previous value.
    pub fn set_prot(&mut self, ppn: Ppn, prot: Protection) -> Protection {
        ipl::with_raised_ipl(|| {
            let entry = &mut self.pmape[ppn.index()];
            let old = entry.prot;
            // XOR flip: clears the old bits and sets the new in one
            // store, the way the register update works.
            entry.prot =
                Protection::from_bits_retain(old.bits() ^ (old.bits() ^ prot.bits()));
            old
        })
    }

    /// Clear the referenced bit (the clock-hand sweep action).
    pub fn clr_used(&mut self, ppn: Ppn) {
        self.pmape[ppn.index()].referenced = false;
    }

    /// Clear the modified bit (the page is being written out).
    pub fn clr_modified(&mut self, ppn: Ppn) {
        self.pmape[ppn.index()].modified = false;
    }

    /// Record a reference (fault-path bookkeeping).
    pub fn mark_referenced(&mut self, ppn: Ppn) {
        self.pmape[ppn.index()].referenced = true;
    }

    /// Record a modification (fault-path bookkeeping).
    pub fn mark_modified(&mut self, ppn: Ppn) {
        let entry = &mut self.pmape[ppn.index()];
        entry.referenced = true;
        entry.modified = true;
    }

    // =========================================================================
    // Lookup and invariants
    // =========================================================================

    /// Translate (vpn, asid) to a physical page by walking the bucket
    /// chain. Global mappings match any ASID.
    pub fn translate(&self, vpn: Vpn, asid: Asid) -> Option<Ppn> {
        let packed = self.variant.pack(vpn, asid);
        let bucket = self.variant.unpack_bucket(packed);
        let mut pos = self.ptt[bucket];
        let mut hops = 0;
        while pos != 0 && hops <= self.pmape.len() {
            let entry = &self.pmape[pos as usize];
            let stored = self.asid_va[pos as usize];
            if stored == packed
                || (entry.global && self.variant.unpack_bucket(stored) == bucket)
            {
                return Some(Ppn(pos));
            }
            pos = entry.link;
            hops += 1;
        }
        None
    }

    /// Check the chain invariant for one page: an installed page is
    /// exactly one of head or interior, and its stored bucket reaches
    /// it within the bucket's length.
    pub fn chain_consistent(&self, ppn: Ppn) -> bool {
        let entry = &self.pmape[ppn.index()];
        if !entry.valid {
            return true;
        }
        let bucket = self.variant.unpack_bucket(self.asid_va[ppn.index()]);
        let is_head = self.ptt[bucket] == ppn.value();
        if is_head != entry.head {
            return false;
        }

        let mut pos = self.ptt[bucket];
        let mut hops = 0;
        while pos != 0 && hops <= self.pmape.len() {
            if pos == ppn.value() {
                return true;
            }
            pos = self.pmape[pos as usize].link;
            hops += 1;
        }
        false
    }

    /// Snapshot of a bucket's chain (test support).
    pub fn bucket_chain(&self, bucket: usize) -> Vec<u16> {
        let mut chain = Vec::new();
        let mut pos = self.ptt[bucket];
        while pos != 0 && chain.len() <= self.pmape.len() {
            chain.push(pos);
            pos = self.pmape[pos as usize].link;
        }
        chain
    }

    #[cfg(test)]
    fn bucket_of(&self, ppn: Ppn) -> usize {
        self.variant.unpack_bucket(self.asid_va[ppn.index()])
    }
}

// =============================================================================
// Global Driver
// =============================================================================

static GLOBAL_MMU: spin::Once<spin::Mutex<MmuDriver>> = spin::Once::new();

/// Bring up the system-wide MMU driver (boot path).
pub fn init_global_mmu(
    variant: MmuVariant,
    page_count: usize,
    low_ppn: u16,
) -> &'static spin::Mutex<MmuDriver> {
    GLOBAL_MMU.call_once(|| spin::Mutex::new(MmuDriver::new(variant, page_count, low_ppn)))
}

/// The system-wide MMU driver, if brought up.
pub fn global_mmu() -> Option<&'static spin::Mutex<MmuDriver>> {
    GLOBAL_MMU.get()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn driver() -> MmuDriver {
        MmuDriver::new(MmuVariant::Mc68020, 64, 4)
    }

    #[test]
    fn test_install_makes_bucket_head() {
        let mut m = driver();
        m.install(Ppn(5), Vpn(0x20), Asid(1), Protection::READ_WRITE);

        assert!(m.pmape(Ppn(5)).installed());
        assert!(m.pmape(Ppn(5)).global());
        let bucket = m.bucket_of(Ppn(5));
        assert_eq!(m.bucket_chain(bucket), alloc::vec![5]);
        assert!(m.chain_consistent(Ppn(5)));
    }

    #[test]
    fn test_second_mapping_joins_behind_head() {
        let mut m = driver();
        // Same VA page in two address spaces lands in one bucket.
        m.install(Ppn(5), Vpn(0x20), Asid(1), Protection::READ);
        m.install_private(Ppn(6), Vpn(0x20), Asid(2), Protection::READ);

        let bucket = m.bucket_of(Ppn(5));
        assert_eq!(m.bucket_chain(bucket), alloc::vec![5, 6]);
        assert!(m.chain_consistent(Ppn(5)));
        assert!(m.chain_consistent(Ppn(6)));
        assert!(!m.pmape(Ppn(6)).global());
    }

    #[test]
    fn test_install_then_remove_is_chain_noop() {
        let mut m = driver();
        m.install(Ppn(5), Vpn(0x20), Asid(1), Protection::READ);
        let bucket = m.bucket_of(Ppn(5));
        let before = m.bucket_chain(bucket);

        m.install(Ppn(7), Vpn(0x21), Asid(1), Protection::READ);
        m.mark_modified(Ppn(7));
        m.remove(Ppn(7));

        assert_eq!(m.bucket_chain(bucket), before);
        assert!(!m.pmape(Ppn(7)).installed());
        // Usage bits survive removal.
        assert!(m.pmape(Ppn(7)).modified());
        assert!(m.pmape(Ppn(7)).referenced());
    }

    #[test]
    fn test_remove_head_promotes_successor() {
        let mut m = driver();
        m.install(Ppn(5), Vpn(0x20), Asid(1), Protection::READ);
        m.install(Ppn(6), Vpn(0x20), Asid(2), Protection::READ);
        let bucket = m.bucket_of(Ppn(5));

        m.remove(Ppn(5));
        assert_eq!(m.bucket_chain(bucket), alloc::vec![6]);
        assert!(m.chain_consistent(Ppn(6)));
    }

    #[test]
    fn test_reinstall_replaces_old_mapping() {
        let mut m = driver();
        m.install(Ppn(5), Vpn(0x20), Asid(1), Protection::READ);
        let old_bucket = m.bucket_of(Ppn(5));
        m.install(Ppn(5), Vpn(0x99), Asid(1), Protection::READ);

        // Gone from the old bucket, present in the new.
        assert!(m.bucket_chain(old_bucket).is_empty());
        assert!(m.chain_consistent(Ppn(5)));
        assert_eq!(m.translate(Vpn(0x99), Asid(1)), Some(Ppn(5)));
        assert_eq!(m.translate(Vpn(0x20), Asid(1)), None);
    }

    #[test]
    fn test_install_list_maps_contiguous_pages() {
        let mut m = driver();
        m.install_list(&[Ppn(10), Ppn(11), Ppn(12)], Vpn(0x40), Asid(3), Protection::READ_WRITE);
        assert_eq!(m.translate(Vpn(0x40), Asid(3)), Some(Ppn(10)));
        assert_eq!(m.translate(Vpn(0x41), Asid(3)), Some(Ppn(11)));
        assert_eq!(m.translate(Vpn(0x42), Asid(3)), Some(Ppn(12)));
    }

    #[test]
    fn test_remove_asid_clears_only_that_space() {
        let mut m = driver();
        m.install_private(Ppn(5), Vpn(0x10), Asid(1), Protection::READ);
        m.install_private(Ppn(6), Vpn(0x11), Asid(2), Protection::READ);
        m.install_private(Ppn(7), Vpn(0x12), Asid(1), Protection::READ);

        m.remove_asid(Asid(1));
        assert!(!m.pmape(Ppn(5)).installed());
        assert!(m.pmape(Ppn(6)).installed());
        assert!(!m.pmape(Ppn(7)).installed());
    }

    #[test]
    fn test_set_prot_returns_previous() {
        let mut m = driver();
        m.install(Ppn(5), Vpn(0x20), Asid(1), Protection::READ);
        assert_eq!(m.set_prot(Ppn(5), Protection::READ_WRITE), Protection::READ);
        assert_eq!(m.set_prot(Ppn(5), Protection::READ_WRITE), Protection::READ_WRITE);
    }

    #[test]
    fn test_clr_used_is_clock_hand() {
        let mut m = driver();
        m.install(Ppn(5), Vpn(0x20), Asid(1), Protection::READ);
        m.mark_referenced(Ppn(5));
        assert!(m.pmape(Ppn(5)).referenced());
        m.clr_used(Ppn(5));
        assert!(!m.pmape(Ppn(5)).referenced());
    }

    #[test]
    fn test_variant_packings_differ() {
        let wide = MmuVariant::Mc68020.pack(Vpn(0x155), Asid(0x15));
        let narrow = MmuVariant::Mc68010.pack(Vpn(0x155), Asid(0x15));
        assert_ne!(wide, narrow);
        assert_eq!(MmuVariant::Mc68020.unpack_asid(wide), 0x15);
        assert_eq!(MmuVariant::Mc68010.unpack_asid(narrow), 0x15);
    }

    proptest! {
        #[test]
        fn prop_chains_stay_consistent(
            ops in proptest::collection::vec((1u16..32, 0u32..64, 0u16..8, any::<bool>()), 1..40)
        ) {
            let mut m = driver();
            for (ppn, vpn, asid, install) in ops {
                if install {
                    m.install(Ppn(ppn), Vpn(vpn), Asid(asid), Protection::READ);
                } else {
                    m.remove(Ppn(ppn));
                }
                for p in 1..32u16 {
                    prop_assert!(m.chain_consistent(Ppn(p)), "ppn {} inconsistent", p);
                }
            }
        }

        #[test]
        fn prop_translate_finds_installed(
            ppn in 1u16..40,
            vpn in 0u32..256,
            asid in 0u16..16,
        ) {
            let mut m = driver();
            m.install_private(Ppn(ppn), Vpn(vpn), Asid(asid), Protection::READ);
            prop_assert_eq!(m.translate(Vpn(vpn), Asid(asid)), Some(Ppn(ppn)));
            m.remove(Ppn(ppn));
            prop_assert_eq!(m.translate(Vpn(vpn), Asid(asid)), None);
        }
    }
}
