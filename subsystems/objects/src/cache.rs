//! # Active Object and Segment Tables
//!
//! The AOTE table caches one entry per active object: its UID, the
//! 144-byte attribute record, state flags, and where the object lives
//! (a local volume or a remote server). Each active 32 KB segment of
//! an object gets an ASTE carrying the segment map - one entry per
//! 1 KB page with its disk address, state flags and physical page.
//!
//! Serialization follows the system lock order: the AST lock guards
//! the tables, the PMAP lock guards segment maps, and every state
//! transition that parks someone (IN_TRANS) advances the transition
//! event count on exit so waiters re-examine the world.

use alloc::vec::Vec;
use hashbrown::HashMap;
use vela_core::kernel::Acquisition;
use vela_core::{EcId, EcKind, Kernel, LockId};
use vela_hal::disk::DiskController;
use vela_hal::remote::RemoteFileService;
use vela_memory::MmuDriver;
use vela_types::status::{ast as ast_status, file, Status};
use vela_types::{Clock, KernelResult, Ppn, Uid};

use crate::attrs::{
    AttrFlags, Attributes, SetAttr, ATTR_RECORD_SIZE, DEFAULT_ACCESS_MODE, PLAIN_OBJECT_MASK,
    REFCOUNT_SATURATION, TIMESTAMP_MASK,
};

/// Pages per 32 KB segment.
pub const PAGES_PER_SEGMENT: usize = 32;

/// Bytes per page.
pub const PAGE_BYTES: u32 = 1024;

/// Bytes per segment.
pub const SEGMENT_BYTES: u32 = PAGE_BYTES * PAGES_PER_SEGMENT as u32;

// =============================================================================
// Flags
// =============================================================================

bitflags::bitflags! {
    /// AOTE state flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AoteFlags: u16 {
        /// Recently referenced; not a reclamation candidate.
        const BUSY = 0x01;
        /// A state transition is in progress.
        const IN_TRANS = 0x02;
        /// The attribute record needs writing back.
        const DIRTY = 0x04;
        /// Touched since the last timestamp update.
        const TOUCHED = 0x08;
        /// Data pages were modified.
        const MODIFIED = 0x10;
    }
}

bitflags::bitflags! {
    /// Segment-map entry flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SegFlags: u16 {
        /// The page is moving (read or write in flight).
        const IN_TRANS = 0x8000;
        /// A physical page is installed.
        const INSTALLED = 0x4000;
        /// The page is wired into a working set.
        const IN_USE = 0x2000;
        /// The page is dirty on its frame.
        const MODIFIED = 0x0400;
    }
}

bitflags::bitflags! {
    /// ASTE flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AsteFlags: u8 {
        /// Segment-level transition in progress.
        const IN_TRANS = 0x80;
        /// Locked against reclamation.
        const LOCKED = 0x40;
    }
}

bitflags::bitflags! {
    /// Flush options.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FlushOpts: u16 {
        /// Do not stamp the modification time.
        const SUPPRESS_TIMESTAMP = 0x01;
        /// Drop the MMU mapping after writing.
        const REMOVE_MAPPINGS = 0x02;
    }
}

// =============================================================================
// Records
// =============================================================================

/// Stable index of an AOTE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct AoteId(pub u16);

/// Where an object's storage lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Home {
    /// On a mounted volume.
    Local {
        /// Volume index.
        volume: u16,
    },
    /// On a file server.
    Remote {
        /// The serving volume's UID.
        volume_uid: Uid,
    },
}

/// One segment-map entry (per 1 KB page).
#[derive(Debug, Clone, Copy, Default)]
pub struct SegMapEntry {
    /// Disk address; 0 means unallocated.
    pub disk_addr: u32,
    /// State flags.
    pub flags: SegFlags,
    /// Installed physical page.
    pub ppn: u16,
}

/// An active-object table entry.
#[derive(Debug)]
pub struct Aote {
    /// The object's UID.
    pub uid: Uid,
    /// Cached attribute record.
    pub attrs: Attributes,
    /// State flags.
    pub flags: AoteFlags,
    /// Storage home.
    pub home: Home,
}

impl Aote {
    /// True for server-homed objects.
    pub fn is_remote(&self) -> bool {
        matches!(self.home, Home::Remote { .. })
    }

    fn volume_uid(&self) -> Uid {
        match self.home {
            Home::Remote { volume_uid } => volume_uid,
            Home::Local { .. } => Uid::NIL,
        }
    }

    fn volume(&self) -> u16 {
        match self.home {
            Home::Local { volume } => volume,
            Home::Remote { .. } => 0,
        }
    }
}

/// An active-segment table entry.
#[derive(Debug)]
pub struct Aste {
    /// Owning object.
    pub aote: AoteId,
    /// Segment index within the object.
    pub seg_index: u16,
    /// Segment flags.
    pub flags: AsteFlags,
    /// Per-page map.
    pub map: [SegMapEntry; PAGES_PER_SEGMENT],
}

// =============================================================================
// Cache
// =============================================================================

/// The object cache: AOTE and ASTE tables plus the page reverse map.
#[derive(Debug)]
pub struct AstCache {
    aotes: Vec<Option<Aote>>,
    by_uid: HashMap<Uid, AoteId>,
    astes: Vec<Option<Aste>>,
    seg_index: HashMap<(AoteId, u16), u16>,
    page_owner: HashMap<u16, (u16, u8)>,
    homes: HashMap<Uid, Home>,
    clobbered: Vec<Uid>,
    in_trans_ec: EcId,
    pages_ec: EcId,
}

fn take_lock(kernel: &mut Kernel, id: LockId) {
    let got = kernel.ml_lock(id);
    debug_assert_eq!(got, Acquisition::Acquired, "cache path lock contended");
}

impl AstCache {
    /// An empty cache with its transition event counts.
    pub fn new(kernel: &mut Kernel) -> Self {
        Self {
            aotes: Vec::new(),
            by_uid: HashMap::new(),
            astes: Vec::new(),
            seg_index: HashMap::new(),
            page_owner: HashMap::new(),
            homes: HashMap::new(),
            clobbered: Vec::new(),
            in_trans_ec: kernel.ecs.init(EcKind::Condition),
            pages_ec: kernel.ecs.init(EcKind::Condition),
        }
    }

    /// The transition event count (waiters for IN_TRANS exits).
    pub fn in_trans_ec(&self) -> EcId {
        self.in_trans_ec
    }

    /// The pages event count (advanced as frames become available).
    pub fn pages_ec(&self) -> EcId {
        self.pages_ec
    }

    /// UIDs of objects whose pages were lost to corruption.
    pub fn clobbered_uids(&self) -> &[Uid] {
        &self.clobbered
    }

    /// Teach the cache where an object lives (the directory layer's
    /// job in the full system).
    pub fn register_home(&mut self, uid: Uid, home: Home) {
        self.homes.insert(uid, home);
    }

    // =========================================================================
    // Lookup and activation
    // =========================================================================

    /// Hash an active object's AOTE, if cached.
    pub fn lookup_aote_by_uid(&self, uid: Uid) -> Option<AoteId> {
        self.by_uid.get(&uid).copied()
    }

    /// Borrow an AOTE.
    pub fn aote(&self, id: AoteId) -> &Aote {
        self.aotes[id.0 as usize].as_ref().expect("live aote")
    }

    /// Mutably borrow an AOTE.
    pub fn aote_mut(&mut self, id: AoteId) -> &mut Aote {
        self.aotes[id.0 as usize].as_mut().expect("live aote")
    }

    /// Find or create the AOTE for a UID.
    ///
    /// A miss consults the registered home: local objects start with a
    /// fresh attribute record; remote ones fetch theirs from the
    /// server when `force` is set, and otherwise start cold.
    pub fn activate(
        &mut self,
        uid: Uid,
        force: bool,
        remote: &dyn RemoteFileService,
    ) -> KernelResult<AoteId> {
        if let Some(id) = self.lookup_aote_by_uid(uid) {
            self.aote_mut(id).flags.insert(AoteFlags::BUSY);
            return Ok(id);
        }

        let home = *self.homes.get(&uid).ok_or(file::OBJECT_NOT_FOUND)?;
        let mut attrs = Attributes::default();

        if let Home::Remote { volume_uid } = home {
            if force {
                let mut wire = [0u8; ATTR_RECORD_SIZE];
                let status = remote.get_attributes(volume_uid, uid, 0, &mut wire);
                if status.is_err() {
                    return Err(status);
                }
                attrs = Attributes::decode(&wire);
            }
        }

        let id = AoteId(self.aotes.len() as u16);
        self.aotes.push(Some(Aote {
            uid,
            attrs,
            flags: AoteFlags::BUSY,
            home,
        }));
        self.by_uid.insert(uid, id);
        log::debug!("ast: activated {uid:?}");
        Ok(id)
    }

    // =========================================================================
    // Segments and pages
    // =========================================================================

    /// Find or create the ASTE for one segment of an object.
    pub fn ensure_aste(&mut self, aote: AoteId, seg: u16) -> u16 {
        if let Some(&idx) = self.seg_index.get(&(aote, seg)) {
            return idx;
        }
        let idx = self.astes.len() as u16;
        self.astes.push(Some(Aste {
            aote,
            seg_index: seg,
            flags: AsteFlags::default(),
            map: [SegMapEntry::default(); PAGES_PER_SEGMENT],
        }));
        self.seg_index.insert((aote, seg), idx);
        idx
    }

    /// Borrow an ASTE.
    pub fn aste(&self, idx: u16) -> &Aste {
        self.astes[idx as usize].as_ref().expect("live aste")
    }

    /// Mutably borrow an ASTE.
    pub fn aste_mut(&mut self, idx: u16) -> &mut Aste {
        self.astes[idx as usize].as_mut().expect("live aste")
    }

    /// Attach a physical page to an object page (fault-path plumbing).
    pub fn attach_page(&mut self, aote: AoteId, page_no: u32, ppn: Ppn, disk_addr: u32) {
        let seg = (page_no / PAGES_PER_SEGMENT as u32) as u16;
        let slot = (page_no % PAGES_PER_SEGMENT as u32) as u8;
        let idx = self.ensure_aste(aote, seg);
        let entry = &mut self.aste_mut(idx).map[slot as usize];
        entry.disk_addr = disk_addr;
        entry.ppn = ppn.value();
        entry.flags = SegFlags::INSTALLED | SegFlags::IN_USE;
        self.page_owner.insert(ppn.value(), (idx, slot));
    }

    /// Mark an installed page dirty.
    pub fn dirty_page(&mut self, ppn: Ppn) {
        if let Some(&(idx, slot)) = self.page_owner.get(&ppn.value()) {
            self.aste_mut(idx).map[slot as usize].flags.insert(SegFlags::MODIFIED);
            let aote = self.aste(idx).aote;
            self.aote_mut(aote)
                .flags
                .insert(AoteFlags::MODIFIED | AoteFlags::DIRTY);
        }
    }

    /// The owner of a physical page, if any.
    pub fn find_page(&self, ppn: Ppn) -> Option<(u16, u8)> {
        self.page_owner.get(&ppn.value()).copied()
    }

    fn detach_page(&mut self, ppn: u16) {
        self.page_owner.remove(&ppn);
    }

    // =========================================================================
    // Attribute read paths
    // =========================================================================

    /// Fetch an object's attributes.
    ///
    /// `flags` bit 0x20 requests a server refresh for remote objects.
    /// The refresh overwrites the cached record except the cached size
    /// (kept as the max of cached and fetched) and the two preserved
    /// timestamps (DTM and DTV).
    pub fn get_attributes(
        &mut self,
        kernel: &mut Kernel,
        uid: Uid,
        flags: u16,
        remote: &dyn RemoteFileService,
    ) -> KernelResult<Attributes> {
        if flags & 0xFC00 != 0 {
            return Err(ast_status::INCOMPATIBLE_REQUEST);
        }
        if uid.is_nil() {
            return Err(file::OBJECT_NOT_FOUND);
        }

        kernel.inhibit_begin();
        take_lock(kernel, LockId::AST);

        let result = self.get_attributes_locked(kernel, uid, flags, remote);

        kernel.ml_unlock(LockId::AST);
        kernel.inhibit_end();
        result
    }

    fn get_attributes_locked(
        &mut self,
        kernel: &mut Kernel,
        uid: Uid,
        flags: u16,
        remote: &dyn RemoteFileService,
    ) -> KernelResult<Attributes> {
        let id = match self.activate(uid, flags & 0x80 != 0, remote) {
            Ok(id) => id,
            Err(status) => return Err(status),
        };

        let wants_refresh = flags & 0x20 != 0;
        if wants_refresh && self.aote(id).is_remote() {
            let volume_uid = self.aote(id).volume_uid();
            self.aote_mut(id).flags.insert(AoteFlags::IN_TRANS);
            self.aote_mut(id).flags.remove(AoteFlags::TOUCHED);

            // The fetch happens without the table lock held.
            kernel.ml_unlock(LockId::AST);
            let mut wire = [0u8; ATTR_RECORD_SIZE];
            let status = remote.get_attributes(volume_uid, uid, flags, &mut wire);
            take_lock(kernel, LockId::AST);

            if status.is_ok() {
                take_lock(kernel, LockId::PMAP);
                let fetched = Attributes::decode(&wire);
                let cached = self.aote(id).attrs;

                let mut merged = fetched;
                merged.size = cached.size.max(fetched.size);
                merged.dtm = cached.dtm;
                merged.dtv = cached.dtv;
                self.aote_mut(id).attrs = merged;
                kernel.ml_unlock(LockId::PMAP);
            }

            self.aote_mut(id).flags.remove(AoteFlags::IN_TRANS);
            let ec = self.in_trans_ec;
            kernel.advance(ec);

            if status.is_err() {
                return Err(status);
            }
            return Ok(self.aote(id).attrs);
        }

        // Local or no refresh: cached record.
        let attrs = self.aote(id).attrs;
        let ec = self.in_trans_ec;
        self.aote_mut(id).flags.remove(AoteFlags::IN_TRANS);
        kernel.advance(ec);
        Ok(attrs)
    }

    /// The DTV (version) timestamp of an object.
    ///
    /// Remote objects answer from the cache but flag the result, since
    /// only the server's copy is authoritative.
    pub fn get_dtv(&mut self, kernel: &mut Kernel, uid: Uid, remote: &dyn RemoteFileService) -> KernelResult<Clock> {
        kernel.inhibit_begin();
        take_lock(kernel, LockId::AST);

        let result = match self.activate(uid, true, remote) {
            Ok(id) => {
                take_lock(kernel, LockId::PMAP);
                let dtv = self.aote(id).attrs.dtv;
                kernel.ml_unlock(LockId::PMAP);
                if self.aote(id).is_remote() {
                    Err(file::OBJECT_NOT_FOUND)
                } else {
                    Ok(dtv)
                }
            }
            Err(status) => Err(status),
        };

        kernel.ml_unlock(LockId::AST);
        kernel.inhibit_end();
        result
    }

    // =========================================================================
    // Attribute dispatch
    // =========================================================================

    /// Apply one typed attribute write to an object.
    ///
    /// `now` stamps the record's modification time; `now_abs` is the
    /// absolute clock used for the attribute timestamp when the
    /// operation is in the timestamp mask and the object is local.
    pub fn set_attribute(
        &mut self,
        kernel: &mut Kernel,
        uid: Uid,
        op: SetAttr,
        now: Clock,
        now_abs: Clock,
        disk: &dyn DiskController,
        remote: &dyn RemoteFileService,
    ) -> Status {
        kernel.inhibit_begin();
        take_lock(kernel, LockId::AST);

        let id = match self.activate(uid, true, remote) {
            Ok(id) => id,
            Err(status) => {
                kernel.ml_unlock(LockId::AST);
                kernel.inhibit_end();
                return status;
            }
        };

        let (status, acl_change) = self.dispatch(id, op, now, now_abs);
        kernel.ml_unlock(LockId::AST);

        // The ACL-change protocol runs without the table lock: the new
        // ACL gains a reference, the old one is truncated away.
        if let Some((old_acl, new_acl)) = acl_change {
            if status.is_ok() {
                if !new_acl.is_nil() {
                    let s = self.set_attribute(
                        kernel,
                        new_acl,
                        SetAttr::AddRefcount,
                        now,
                        now_abs,
                        disk,
                        remote,
                    );
                    if s.is_err() {
                        kernel.inhibit_end();
                        return s;
                    }
                }
                if !old_acl.is_nil() {
                    let s = self.truncate(kernel, old_acl, 0, 0x3, disk, remote);
                    if let Err(ts) = s {
                        // A vanished old ACL is not an error.
                        if ts != file::OBJECT_NOT_FOUND {
                            kernel.inhibit_end();
                            return ts;
                        }
                    }
                }
            }
        }

        kernel.inhibit_end();
        status
    }

    /// The 28-way attribute dispatch. Returns the status and, for ACL
    /// changes, the (old, new) pair needing follow-up.
    fn dispatch(
        &mut self,
        id: AoteId,
        op: SetAttr,
        now: Clock,
        now_abs: Clock,
    ) -> (Status, Option<(Uid, Uid)>) {
        let code = op.type_code();
        let aote = self.aotes[id.0 as usize].as_mut().expect("live aote");
        let attrs = &mut aote.attrs;
        let mut acl_change = None;

        // Plain files accept only the base attribute set.
        if attrs.object_type == 0 && (1u32 << code) & PLAIN_OBJECT_MASK == 0 {
            return (ast_status::INVALID_ATTRIBUTE_TYPE, None);
        }

        // Special objects admit only mod-time and block-count writes.
        if attrs.flags.contains(AttrFlags::SPECIAL) {
            match op {
                SetAttr::ModTime(t) => {
                    attrs.mod_time = t;
                    return (Status::OK, None);
                }
                SetAttr::Blocks(b) => {
                    attrs.blocks = b;
                    return (Status::OK, None);
                }
                _ => return (file::OBJECT_SPECIAL_ATTRIBUTE, None),
            }
        }

        let mut status = Status::OK;
        match op {
            SetAttr::Readonly(v) => attrs.flags.set(AttrFlags::READONLY, v),
            SetAttr::CopyOnWrite(v) => attrs.flags.set(AttrFlags::COPY_ON_WRITE, v),
            SetAttr::Dirty(v) => attrs.flags.set(AttrFlags::DIRTY, v),
            SetAttr::AclUid(new_acl) => {
                if attrs.acl_uid == new_acl {
                    return (Status::OK, None);
                }
                let old = attrs.acl_uid;
                attrs.acl_uid = new_acl;
                attrs.access_mode = DEFAULT_ACCESS_MODE;
                attrs.access_flag = false;
                acl_change = Some((old, new_acl));
            }
            SetAttr::CreationTime(t) => attrs.creation_time = t,
            SetAttr::ModTime(t) => attrs.mod_time = t,
            SetAttr::AddRefcount => {
                if attrs.refcount <= REFCOUNT_SATURATION {
                    attrs.refcount += 1;
                    attrs.flags.insert(AttrFlags::MODIFIED);
                }
            }
            SetAttr::SubRefcount => {
                let floor_two = matches!(attrs.object_type, 1 | 2);
                if attrs.refcount > REFCOUNT_SATURATION {
                    return (Status::OK, None);
                }
                if attrs.refcount == 0 || (attrs.refcount == 1 && floor_two) {
                    return (ast_status::REFCOUNT_UNDERFLOW, None);
                }
                attrs.refcount -= 1;
                if attrs.refcount == 0 {
                    // Unreferenced: the underflow status doubles as
                    // the became-garbage signal.
                    attrs.flags.remove(AttrFlags::MODIFIED);
                    status = ast_status::REFCOUNT_UNDERFLOW;
                }
            }
            SetAttr::SetRefcount(n) => {
                attrs.refcount = n;
                attrs.flags.set(AttrFlags::MODIFIED, n != 0);
            }
            SetAttr::Size(n) => attrs.size = n,
            SetAttr::Dtm(t) => attrs.dtm = t,
            SetAttr::Blocks(n) => {
                if attrs.blocks == n {
                    return (Status::OK, None);
                }
                attrs.blocks = n;
            }
            SetAttr::AccessFlag(v) => attrs.access_flag = v,
            SetAttr::AccessMode(m) => attrs.access_mode = m,
            SetAttr::Owner1Uid(u) => attrs.owner1 = u,
            SetAttr::Owner2Uid(u) => attrs.owner2 = u,
            SetAttr::SetOwner1(u) => attrs.owner1 = u,
            SetAttr::SetOwner2(u) => attrs.owner2 = u,
            SetAttr::SetOwner3(u) => {
                attrs.owner1 = u;
                attrs.owner2 = u;
            }
            SetAttr::SetAllOwners(a, b) => {
                attrs.owner1 = a;
                attrs.owner2 = b;
            }
            SetAttr::SetAllExt {
                owner1,
                owner2,
                acl,
                modes,
            } => {
                attrs.owner1 = owner1;
                attrs.owner2 = owner2;
                if attrs.acl_uid != acl {
                    let old = attrs.acl_uid;
                    attrs.acl_uid = acl;
                    attrs.access_mode = DEFAULT_ACCESS_MODE;
                    acl_change = Some((old, acl));
                }
                attrs.modes = modes;
            }
            SetAttr::SetModes(m) => attrs.modes = m,
            SetAttr::SetLinkCount(n) => attrs.link_count = n,
            SetAttr::SizeAndDtm(n, t) => {
                attrs.size = n;
                attrs.dtm = t;
            }
            SetAttr::SizeAndDtm2(n, t) => {
                attrs.size = n;
                attrs.dtv = t;
            }
            SetAttr::SpecialFlag(v) => attrs.flags.set(AttrFlags::SPECIAL, v),
            SetAttr::UpdateDtm => attrs.dtm = now,
            SetAttr::UpdateDtm2 => attrs.dtv = now,
        }

        attrs.mod_time = now;
        aote.flags.insert(AoteFlags::DIRTY);

        if TIMESTAMP_MASK & (1u32 << code) != 0 && !aote.is_remote() {
            aote.attrs.attr_stamp = now_abs;
        }

        (status, acl_change)
    }

    // =========================================================================
    // Timestamp operations
    // =========================================================================

    /// Update selected timestamps under the PMAP lock.
    ///
    /// Flag bits: 0x01 load on miss, 0x02 set DTV, 0x04 set access and
    /// mod times, 0x08 set DTM, 0x10 stamp DTM from the current clock.
    /// Returns whether the current-clock path ran.
    pub fn set_dts(
        &mut self,
        kernel: &mut Kernel,
        uid: Uid,
        flags: u16,
        dtv: Clock,
        atime: Clock,
        now: Clock,
        remote: &dyn RemoteFileService,
    ) -> KernelResult<bool> {
        kernel.inhibit_begin();
        take_lock(kernel, LockId::AST);

        let id = match self.lookup_aote_by_uid(uid) {
            Some(id) => id,
            None if flags & 0x01 != 0 => match self.activate(uid, true, remote) {
                Ok(id) => id,
                Err(status) => {
                    kernel.ml_unlock(LockId::AST);
                    kernel.inhibit_end();
                    return Err(status);
                }
            },
            None => {
                kernel.ml_unlock(LockId::AST);
                kernel.inhibit_end();
                return Ok(false);
            }
        };

        take_lock(kernel, LockId::PMAP);
        let mut used_current = false;
        {
            let aote = self.aote_mut(id);
            if flags & 0x10 != 0 {
                used_current = true;
                aote.flags.remove(AoteFlags::TOUCHED);
                if !aote.is_remote() {
                    aote.attrs.dtm = now;
                }
            } else {
                if flags & 0x02 != 0 {
                    aote.attrs.dtv = dtv;
                }
                if flags & 0x04 != 0 {
                    aote.attrs.access_time = atime;
                    aote.attrs.mod_time = atime;
                }
                if flags & 0x08 != 0 {
                    aote.attrs.dtm = atime;
                }
            }
            aote.flags.insert(AoteFlags::DIRTY);
        }
        kernel.ml_unlock(LockId::PMAP);
        kernel.ml_unlock(LockId::AST);
        kernel.inhibit_end();
        Ok(used_current)
    }

    // =========================================================================
    // Size and page operations
    // =========================================================================

    /// Truncate (or logically extend) an object.
    ///
    /// Flag bits: 0x01 truncate to zero, 0x02 allow extension. Local
    /// truncation frees pages and disk blocks above the new size;
    /// remote objects forward to the server.
    pub fn truncate(
        &mut self,
        kernel: &mut Kernel,
        uid: Uid,
        new_size: u32,
        flags: u16,
        disk: &dyn DiskController,
        remote: &dyn RemoteFileService,
    ) -> KernelResult<()> {
        let target_size = if flags & 0x01 != 0 { 0 } else { new_size };

        kernel.inhibit_begin();
        take_lock(kernel, LockId::AST);

        let id = match self.activate(uid, false, remote) {
            Ok(id) => id,
            Err(status) => {
                kernel.ml_unlock(LockId::AST);
                kernel.inhibit_end();
                return Err(status);
            }
        };

        if self.aote(id).is_remote() {
            let volume_uid = self.aote(id).volume_uid();
            kernel.ml_unlock(LockId::AST);
            let status = remote.truncate(volume_uid, uid, target_size, flags);
            kernel.inhibit_end();
            return if status.is_ok() { Ok(()) } else { Err(status) };
        }

        self.aote_mut(id).flags.insert(AoteFlags::IN_TRANS);

        let current_size = self.aote(id).attrs.size;
        if target_size < current_size {
            self.free_pages_above(id, target_size, disk);
        } else if target_size > current_size && flags & 0x02 == 0 {
            // Growth needs the extension flag.
            self.aote_mut(id).flags.remove(AoteFlags::IN_TRANS);
            let ec = self.in_trans_ec;
            kernel.advance(ec);
            kernel.ml_unlock(LockId::AST);
            kernel.inhibit_end();
            return Err(ast_status::INCOMPATIBLE_REQUEST);
        }

        let aote = self.aote_mut(id);
        aote.attrs.size = target_size;
        aote.flags.insert(AoteFlags::DIRTY);

        // Truncation to zero flushes what remains of the record.
        if flags & 0x01 != 0 {
            let _ = self.pmap_flush(
                kernel,
                id,
                0,
                1,
                FlushOpts::SUPPRESS_TIMESTAMP,
                Clock::ZERO,
                disk,
                remote,
                None,
            );
        }

        self.aote_mut(id).flags.remove(AoteFlags::IN_TRANS);
        let ec = self.in_trans_ec;
        kernel.advance(ec);
        kernel.ml_unlock(LockId::AST);
        kernel.inhibit_end();
        Ok(())
    }

    fn free_pages_above(&mut self, id: AoteId, new_size: u32, disk: &dyn DiskController) {
        let first_dead_page = new_size.div_ceil(PAGE_BYTES);
        let volume = self.aote(id).volume();

        let aste_ids: Vec<u16> = self
            .seg_index
            .iter()
            .filter(|((aote, _), _)| *aote == id)
            .map(|(_, &idx)| idx)
            .collect();

        let mut freed_blocks = 0u32;
        for idx in aste_ids {
            let seg = self.aste(idx).seg_index as u32;
            for slot in 0..PAGES_PER_SEGMENT as u32 {
                let page_no = seg * PAGES_PER_SEGMENT as u32 + slot;
                if page_no < first_dead_page {
                    continue;
                }
                let entry = self.aste(idx).map[slot as usize];
                if entry.disk_addr != 0 {
                    disk.free_block(volume, entry.disk_addr);
                    freed_blocks += 1;
                }
                if entry.flags.contains(SegFlags::INSTALLED) {
                    self.detach_page(entry.ppn);
                }
                self.aste_mut(idx).map[slot as usize] = SegMapEntry::default();
            }
        }

        let attrs = &mut self.aote_mut(id).attrs;
        attrs.blocks = attrs.blocks.saturating_sub(freed_blocks);
    }

    /// Allocate backing store for a byte range of an object.
    ///
    /// Local objects get disk blocks (hinted by the object's volume)
    /// written into their segment maps; remote ones forward to the
    /// server.
    pub fn reserve(
        &mut self,
        kernel: &mut Kernel,
        uid: Uid,
        start_byte: u32,
        byte_count: u32,
        disk: &dyn DiskController,
        remote: &dyn RemoteFileService,
    ) -> Status {
        if byte_count == 0 {
            return Status::OK;
        }

        kernel.inhibit_begin();
        take_lock(kernel, LockId::AST);

        let id = match self.activate(uid, false, remote) {
            Ok(id) => id,
            Err(status) => {
                kernel.ml_unlock(LockId::AST);
                kernel.inhibit_end();
                return status;
            }
        };

        if self.aote(id).is_remote() {
            let volume_uid = self.aote(id).volume_uid();
            kernel.ml_unlock(LockId::AST);
            let status = remote.reserve(volume_uid, uid, start_byte, byte_count);
            kernel.inhibit_end();
            return status;
        }

        self.aote_mut(id).flags.insert(AoteFlags::IN_TRANS);
        let volume = self.aote(id).volume();

        let first_page = start_byte / PAGE_BYTES;
        let last_page = (start_byte + byte_count - 1) / PAGE_BYTES;
        let mut status = Status::OK;
        let mut allocated = 0u32;

        for page_no in first_page..=last_page {
            let seg = (page_no / PAGES_PER_SEGMENT as u32) as u16;
            let slot = (page_no % PAGES_PER_SEGMENT as u32) as usize;
            let idx = self.ensure_aste(id, seg);

            // Segment maps change under the PMAP lock.
            self.aste_mut(idx).flags.insert(AsteFlags::IN_TRANS | AsteFlags::LOCKED);
            kernel.ml_unlock(LockId::AST);
            take_lock(kernel, LockId::PMAP);

            let needs = {
                let entry = &self.aste(idx).map[slot];
                entry.disk_addr == 0 && !entry.flags.contains(SegFlags::IN_USE)
            };
            if needs {
                self.aste_mut(idx).map[slot].flags.insert(SegFlags::IN_TRANS);
                match disk.allocate_blocks(volume, 1, 0) {
                    Ok(daddr) => {
                        let entry = &mut self.aste_mut(idx).map[slot];
                        entry.disk_addr = daddr;
                        entry.flags.remove(SegFlags::IN_TRANS);
                        allocated += 1;
                    }
                    Err(s) => {
                        self.aste_mut(idx).map[slot].flags.remove(SegFlags::IN_TRANS);
                        status = s;
                    }
                }
            }

            kernel.ml_unlock(LockId::PMAP);
            take_lock(kernel, LockId::AST);
            self.aste_mut(idx)
                .flags
                .remove(AsteFlags::IN_TRANS | AsteFlags::LOCKED);

            if status.is_err() {
                break;
            }
        }

        let attrs = &mut self.aote_mut(id).attrs;
        attrs.blocks += allocated;

        self.aote_mut(id).flags.remove(AoteFlags::IN_TRANS);
        let ec = self.in_trans_ec;
        kernel.advance(ec);
        kernel.ml_unlock(LockId::AST);
        kernel.inhibit_end();
        status
    }

    /// Invalidate a page range, dropping cached page state.
    ///
    /// Remote objects additionally forward the invalidation to the
    /// server once local state is clean.
    pub fn invalidate(
        &mut self,
        kernel: &mut Kernel,
        uid: Uid,
        start_page: u32,
        count: u32,
        remote: &dyn RemoteFileService,
    ) -> Status {
        kernel.inhibit_begin();
        take_lock(kernel, LockId::AST);

        let id = match self.activate(uid, false, remote) {
            Ok(id) => id,
            Err(status) => {
                kernel.ml_unlock(LockId::AST);
                kernel.inhibit_end();
                return status;
            }
        };

        let size = self.aote(id).attrs.size;
        let is_remote = self.aote(id).is_remote();
        let volume_uid = self.aote(id).volume_uid();

        if size != 0 && count != 0 && start_page <= (size - 1) / PAGE_BYTES {
            let end_page = (start_page + count - 1).min((size - 1) / PAGE_BYTES);
            self.aote_mut(id).flags.insert(AoteFlags::IN_TRANS);

            for page_no in start_page..=end_page {
                let seg = (page_no / PAGES_PER_SEGMENT as u32) as u16;
                let slot = (page_no % PAGES_PER_SEGMENT as u32) as usize;
                let Some(&idx) = self.seg_index.get(&(id, seg)) else {
                    continue;
                };
                let entry = &mut self.aste_mut(idx).map[slot];
                let ppn = entry.ppn;
                if entry.flags.contains(SegFlags::INSTALLED) {
                    entry.flags.remove(
                        SegFlags::INSTALLED | SegFlags::IN_USE | SegFlags::MODIFIED,
                    );
                    entry.ppn = 0;
                    self.detach_page(ppn);
                }
            }

            self.aote_mut(id).flags.remove(AoteFlags::IN_TRANS);
            let ec = self.in_trans_ec;
            kernel.advance(ec);
        }

        kernel.ml_unlock(LockId::AST);

        let status = if is_remote {
            remote.invalidate(volume_uid, uid, start_page, count)
        } else {
            Status::OK
        };
        kernel.inhibit_end();
        status
    }

    // =========================================================================
    // Flush
    // =========================================================================

    /// Write an object's dirty pages out.
    ///
    /// Local pages batch through the disk; remote pages go one at a
    /// time through the server. Clean pages are skipped. Unless
    /// suppressed, a successful local flush stamps the modification
    /// time.
    pub fn pmap_flush(
        &mut self,
        kernel: &mut Kernel,
        id: AoteId,
        start_page: u32,
        count: u32,
        opts: FlushOpts,
        now_abs: Clock,
        disk: &dyn DiskController,
        remote: &dyn RemoteFileService,
        mmu: Option<&mut MmuDriver>,
    ) -> Status {
        if count == 0 {
            return Status::OK;
        }
        take_lock(kernel, LockId::PMAP);

        let is_remote = self.aote(id).is_remote();
        let volume = self.aote(id).volume();
        let volume_uid = self.aote(id).volume_uid();
        let uid = self.aote(id).uid;

        let mut status = Status::OK;
        let mut wrote_any = false;
        let mut mmu = mmu;

        let end_page = start_page + count.saturating_sub(1);
        for page_no in start_page..=end_page {
            let seg = (page_no / PAGES_PER_SEGMENT as u32) as u16;
            let slot = (page_no % PAGES_PER_SEGMENT as u32) as usize;
            let Some(&idx) = self.seg_index.get(&(id, seg)) else {
                continue;
            };
            let entry = self.aste(idx).map[slot];
            if !entry.flags.contains(SegFlags::MODIFIED) {
                continue;
            }

            let page_status = if is_remote {
                let payload = [0u8; 16];
                remote.write_page(volume_uid, uid, page_no, &payload)
            } else {
                let mut page = [0u8; vela_hal::disk::PAGE_SIZE];
                let mut header = [0u8; 8];
                disk.disk_io(
                    vela_hal::disk::DiskOp::WriteCached,
                    volume,
                    entry.disk_addr,
                    &mut page,
                    &mut header,
                )
            };

            if page_status.is_ok() {
                let entry = &mut self.aste_mut(idx).map[slot];
                entry.flags.remove(SegFlags::MODIFIED | SegFlags::IN_TRANS);
                wrote_any = true;
                if opts.contains(FlushOpts::REMOVE_MAPPINGS) {
                    let ppn = entry.ppn;
                    entry.flags.remove(SegFlags::INSTALLED);
                    entry.ppn = 0;
                    if let Some(m) = mmu.as_deref_mut() {
                        m.remove(Ppn(ppn));
                    }
                    self.detach_page(ppn);
                }
            } else {
                // The page stays marked for retry.
                status = page_status;
            }
        }

        if wrote_any && !is_remote && !opts.contains(FlushOpts::SUPPRESS_TIMESTAMP) {
            self.aote_mut(id).attrs.dtm = now_abs;
        }
        if status.is_ok() {
            self.aote_mut(id).flags.remove(AoteFlags::MODIFIED);
        }

        kernel.ml_unlock(LockId::PMAP);
        status
    }

    /// Flush only when the cached DTM differs from `ts`.
    pub fn cond_flush(
        &mut self,
        kernel: &mut Kernel,
        uid: Uid,
        ts: Clock,
        now_abs: Clock,
        disk: &dyn DiskController,
        remote: &dyn RemoteFileService,
    ) -> Status {
        kernel.inhibit_begin();
        take_lock(kernel, LockId::AST);

        let mut status = Status::OK;
        if let Some(id) = self.lookup_aote_by_uid(uid) {
            if self.aote(id).attrs.dtm != ts {
                let pages = self.aote(id).attrs.size.div_ceil(PAGE_BYTES).max(1);
                status = self.pmap_flush(
                    kernel,
                    id,
                    0,
                    pages,
                    FlushOpts::empty(),
                    now_abs,
                    disk,
                    remote,
                    None,
                );
            }
        }

        kernel.ml_unlock(LockId::AST);
        kernel.inhibit_end();
        status
    }

    // =========================================================================
    // Corruption recovery
    // =========================================================================

    /// Drop a corrupted physical page if it can be lost safely.
    ///
    /// Refuses while the AST or PMAP locks are held or the page is
    /// outside the pageable range. A modified page cannot be dropped
    /// silently: its object's UID is saved for the trouble handler and
    /// the call reports failure.
    pub fn remove_corrupted_page(
        &mut self,
        kernel: &mut Kernel,
        ppn: Ppn,
        mmu: &mut MmuDriver,
    ) -> bool {
        if kernel.sched.tst_lock(LockId::AST.0 as u16)
            || kernel.sched.tst_lock(LockId::PMAP.0 as u16)
        {
            return false;
        }
        let Some((idx, slot)) = self.find_page(ppn) else {
            return false;
        };
        if self.aste(idx).flags.contains(AsteFlags::LOCKED) {
            return false;
        }

        let entry = self.aste(idx).map[slot as usize];
        if !entry.flags.contains(SegFlags::INSTALLED) {
            return false;
        }

        if entry.flags.contains(SegFlags::MODIFIED) || mmu.pmape(ppn).modified() {
            // Losing modified data: remember the victim for the
            // trouble handler.
            let aote = self.aste(idx).aote;
            let uid = self.aote(aote).uid;
            self.clobbered.push(uid);
            log::warn!("ast: modified page {} clobbered on {uid:?}", ppn.value());
            return false;
        }

        let entry = &mut self.aste_mut(idx).map[slot as usize];
        entry.flags.remove(SegFlags::INSTALLED | SegFlags::IN_USE);
        entry.ppn = 0;
        mmu.remove(ppn);
        self.detach_page(ppn.value());
        true
    }
}

// =============================================================================
// Global Cache
// =============================================================================

static GLOBAL_CACHE: spin::Once<spin::Mutex<AstCache>> = spin::Once::new();

/// Bring up the system-wide object cache (boot path).
pub fn init_global_cache(kernel: &mut Kernel) -> &'static spin::Mutex<AstCache> {
    GLOBAL_CACHE.call_once(|| spin::Mutex::new(AstCache::new(kernel)))
}

/// The system-wide object cache, if brought up.
pub fn global_cache() -> Option<&'static spin::Mutex<AstCache>> {
    GLOBAL_CACHE.get()
}
