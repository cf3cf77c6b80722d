//! # Object Attributes
//!
//! The 144-byte attribute record cached per object and exchanged with
//! the file server, and the typed set-attribute operation that writes
//! into it. Every slot write goes through one dispatch that owns the
//! contracts: refcount floors and saturation, the ACL-change protocol,
//! the special-object restriction, and the timestamp mask.

use vela_types::{Clock, Uid};

/// Wire size of the attribute record.
pub const ATTR_RECORD_SIZE: usize = 144;

/// Reference counts saturate silently above this value.
pub const REFCOUNT_SATURATION: u16 = 0xFFF4;

/// Default access-mode bits installed when the ACL changes.
pub const DEFAULT_ACCESS_MODE: u16 = 0x1010;

bitflags::bitflags! {
    /// Attribute flag bits (byte 1 of the record).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AttrFlags: u8 {
        /// Special object: only mod-time and blocks may change.
        const SPECIAL = 0x02;
        /// Dirty data pages exist.
        const DIRTY = 0x04;
        /// Copy the object on the next write.
        const COPY_ON_WRITE = 0x08;
        /// Read-only object.
        const READONLY = 0x10;
        /// The object is referenced (refcount above zero).
        const MODIFIED = 0x20;
    }
}

// =============================================================================
// Attributes
// =============================================================================

/// The cached attribute record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Attributes {
    /// Object type code (0 = file, 1 = directory, 2 = ACL container).
    pub object_type: u8,
    /// Flag bits.
    pub flags: AttrFlags,
    /// Byte size.
    pub size: u32,
    /// Allocated block count.
    pub blocks: u32,
    /// Reference count.
    pub refcount: u16,
    /// Hard-link count.
    pub link_count: u16,
    /// Governing ACL object.
    pub acl_uid: Uid,
    /// First owner.
    pub owner1: Uid,
    /// Second owner.
    pub owner2: Uid,
    /// Creation timestamp.
    pub creation_time: Clock,
    /// Access timestamp.
    pub access_time: Clock,
    /// Data-modified timestamp.
    pub dtm: Clock,
    /// Version timestamp (DTV).
    pub dtv: Clock,
    /// Modification timestamp of the record itself.
    pub mod_time: Clock,
    /// Absolute-clock stamp of the last attribute write.
    pub attr_stamp: Clock,
    /// Access-control flag bit.
    pub access_flag: bool,
    /// Access-mode bits.
    pub access_mode: u16,
    /// Mode word.
    pub modes: u16,
}

impl Attributes {
    fn put_clock(buf: &mut [u8; ATTR_RECORD_SIZE], offset: usize, clock: Clock) {
        buf[offset..offset + 4].copy_from_slice(&clock.high.to_be_bytes());
        buf[offset + 4..offset + 6].copy_from_slice(&clock.low.to_be_bytes());
    }

    fn get_clock(buf: &[u8; ATTR_RECORD_SIZE], offset: usize) -> Clock {
        Clock::new(
            u32::from_be_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]]),
            u16::from_be_bytes([buf[offset + 4], buf[offset + 5]]),
        )
    }

    /// Encode to the big-endian wire record.
    pub fn encode(&self) -> [u8; ATTR_RECORD_SIZE] {
        let mut buf = [0u8; ATTR_RECORD_SIZE];
        buf[0] = self.object_type;
        buf[1] = self.flags.bits();
        buf[2] = u8::from(self.access_flag);
        buf[4..8].copy_from_slice(&self.size.to_be_bytes());
        buf[8..12].copy_from_slice(&self.blocks.to_be_bytes());
        buf[12..14].copy_from_slice(&self.refcount.to_be_bytes());
        buf[14..16].copy_from_slice(&self.link_count.to_be_bytes());
        buf[16..24].copy_from_slice(&self.acl_uid.to_be_bytes());
        buf[24..32].copy_from_slice(&self.owner1.to_be_bytes());
        buf[32..40].copy_from_slice(&self.owner2.to_be_bytes());
        Self::put_clock(&mut buf, 40, self.creation_time);
        Self::put_clock(&mut buf, 48, self.access_time);
        Self::put_clock(&mut buf, 56, self.dtm);
        Self::put_clock(&mut buf, 64, self.dtv);
        Self::put_clock(&mut buf, 72, self.mod_time);
        buf[80..82].copy_from_slice(&self.access_mode.to_be_bytes());
        buf[82..84].copy_from_slice(&self.modes.to_be_bytes());
        Self::put_clock(&mut buf, 84, self.attr_stamp);
        buf
    }

    /// Decode from the wire record.
    pub fn decode(buf: &[u8; ATTR_RECORD_SIZE]) -> Self {
        Self {
            object_type: buf[0],
            flags: AttrFlags::from_bits_truncate(buf[1]),
            access_flag: buf[2] != 0,
            size: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            blocks: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
            refcount: u16::from_be_bytes([buf[12], buf[13]]),
            link_count: u16::from_be_bytes([buf[14], buf[15]]),
            acl_uid: Uid::from_be_bytes(buf[16..24].try_into().expect("8 bytes")),
            owner1: Uid::from_be_bytes(buf[24..32].try_into().expect("8 bytes")),
            owner2: Uid::from_be_bytes(buf[32..40].try_into().expect("8 bytes")),
            creation_time: Self::get_clock(buf, 40),
            access_time: Self::get_clock(buf, 48),
            dtm: Self::get_clock(buf, 56),
            dtv: Self::get_clock(buf, 64),
            mod_time: Self::get_clock(buf, 72),
            access_mode: u16::from_be_bytes([buf[80], buf[81]]),
            modes: u16::from_be_bytes([buf[82], buf[83]]),
            attr_stamp: Self::get_clock(buf, 84),
        }
    }
}

static_assertions::const_assert_eq!(ATTR_RECORD_SIZE, 144);

// =============================================================================
// Set-attribute Operations
// =============================================================================

/// A typed write into the attribute record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetAttr {
    /// Set or clear the read-only flag.
    Readonly(bool),
    /// Set or clear copy-on-write.
    CopyOnWrite(bool),
    /// Set or clear the dirty flag.
    Dirty(bool),
    /// Change the governing ACL (triggers the ACL-change protocol).
    AclUid(Uid),
    /// Set the creation timestamp.
    CreationTime(Clock),
    /// Set the modification timestamp.
    ModTime(Clock),
    /// Increment the reference count (saturating).
    AddRefcount,
    /// Decrement the reference count (floored).
    SubRefcount,
    /// Set the reference count outright.
    SetRefcount(u16),
    /// Set the byte size.
    Size(u32),
    /// Set the data-modified timestamp.
    Dtm(Clock),
    /// Set the block count.
    Blocks(u32),
    /// Set the access-control flag.
    AccessFlag(bool),
    /// Set the access-mode bits.
    AccessMode(u16),
    /// Set the first owner.
    Owner1Uid(Uid),
    /// Set the second owner.
    Owner2Uid(Uid),
    /// Set owner one, stamping the record.
    SetOwner1(Uid),
    /// Set owner two, stamping the record.
    SetOwner2(Uid),
    /// Set both owners from one UID, stamping the record.
    SetOwner3(Uid),
    /// Set both owners.
    SetAllOwners(Uid, Uid),
    /// Set owners, ACL and modes together.
    SetAllExt {
        /// First owner.
        owner1: Uid,
        /// Second owner.
        owner2: Uid,
        /// Governing ACL.
        acl: Uid,
        /// Mode word.
        modes: u16,
    },
    /// Set the mode word.
    SetModes(u16),
    /// Set the hard-link count.
    SetLinkCount(u16),
    /// Set size and DTM together.
    SizeAndDtm(u32, Clock),
    /// Set size and DTV together.
    SizeAndDtm2(u32, Clock),
    /// Set or clear the special-object flag.
    SpecialFlag(bool),
    /// Stamp DTM from the current clock.
    UpdateDtm,
    /// Stamp DTV from the current clock.
    UpdateDtm2,
}

impl SetAttr {
    /// The operation's type code in the 28-entry dispatch table.
    pub fn type_code(&self) -> u16 {
        match self {
            SetAttr::Readonly(_) => 0,
            SetAttr::CopyOnWrite(_) => 1,
            SetAttr::Dirty(_) => 2,
            SetAttr::AclUid(_) => 3,
            SetAttr::CreationTime(_) => 4,
            SetAttr::ModTime(_) => 5,
            SetAttr::AddRefcount => 6,
            SetAttr::SubRefcount => 7,
            SetAttr::SetRefcount(_) => 8,
            SetAttr::Size(_) => 9,
            SetAttr::Dtm(_) => 10,
            SetAttr::Blocks(_) => 11,
            SetAttr::AccessFlag(_) => 12,
            SetAttr::AccessMode(_) => 13,
            SetAttr::Owner1Uid(_) => 14,
            SetAttr::Owner2Uid(_) => 15,
            SetAttr::SetOwner1(_) => 16,
            SetAttr::SetOwner2(_) => 17,
            SetAttr::SetOwner3(_) => 18,
            SetAttr::SetAllOwners(..) => 19,
            SetAttr::SetAllExt { .. } => 20,
            SetAttr::SetModes(_) => 21,
            SetAttr::SetLinkCount(_) => 22,
            SetAttr::SizeAndDtm(..) => 23,
            SetAttr::SizeAndDtm2(..) => 24,
            SetAttr::SpecialFlag(_) => 25,
            SetAttr::UpdateDtm => 26,
            SetAttr::UpdateDtm2 => 27,
        }
    }
}

/// Type codes permitted on a type-0 (plain file) object.
pub const PLAIN_OBJECT_MASK: u32 = 0x3FFF;

/// Type codes whose success updates the absolute-clock attribute
/// timestamp on local objects: the metadata writes (flags, ACL,
/// owners, modes, link count, access bits, special flag).
pub const TIMESTAMP_MASK: u32 = (1 << 0)
    | (1 << 1)
    | (1 << 3)
    | (1 << 12)
    | (1 << 13)
    | (1 << 14)
    | (1 << 15)
    | (1 << 16)
    | (1 << 17)
    | (1 << 18)
    | (1 << 19)
    | (1 << 20)
    | (1 << 21)
    | (1 << 22)
    | (1 << 25);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_round_trip() {
        let attrs = Attributes {
            object_type: 1,
            flags: AttrFlags::DIRTY | AttrFlags::MODIFIED,
            size: 0x0003_2000,
            blocks: 0xC8,
            refcount: 7,
            link_count: 2,
            acl_uid: Uid::new(0xAAAA_0001, 0x5555_0002),
            owner1: Uid::new(1, 2),
            owner2: Uid::new(3, 4),
            creation_time: Clock::new(0x100, 0x20),
            access_time: Clock::new(0x200, 0x40),
            dtm: Clock::new(0x300, 0x60),
            dtv: Clock::new(0x400, 0x80),
            mod_time: Clock::new(0x500, 0xA0),
            attr_stamp: Clock::new(0x600, 0xC0),
            access_flag: true,
            access_mode: 0x1010,
            modes: 0o755,
        };
        let wire = attrs.encode();
        assert_eq!(Attributes::decode(&wire), attrs);
        // Spot-check the big-endian layout.
        assert_eq!(wire[0], 1);
        assert_eq!(wire[4..8], 0x0003_2000u32.to_be_bytes());
        assert_eq!(wire[16], 0xAA);
    }

    #[test]
    fn test_type_codes_are_dense() {
        // All 28 codes, each exactly once.
        let ops = [
            SetAttr::Readonly(true),
            SetAttr::CopyOnWrite(true),
            SetAttr::Dirty(true),
            SetAttr::AclUid(Uid::NIL),
            SetAttr::CreationTime(Clock::ZERO),
            SetAttr::ModTime(Clock::ZERO),
            SetAttr::AddRefcount,
            SetAttr::SubRefcount,
            SetAttr::SetRefcount(0),
            SetAttr::Size(0),
            SetAttr::Dtm(Clock::ZERO),
            SetAttr::Blocks(0),
            SetAttr::AccessFlag(true),
            SetAttr::AccessMode(0),
            SetAttr::Owner1Uid(Uid::NIL),
            SetAttr::Owner2Uid(Uid::NIL),
            SetAttr::SetOwner1(Uid::NIL),
            SetAttr::SetOwner2(Uid::NIL),
            SetAttr::SetOwner3(Uid::NIL),
            SetAttr::SetAllOwners(Uid::NIL, Uid::NIL),
            SetAttr::SetAllExt {
                owner1: Uid::NIL,
                owner2: Uid::NIL,
                acl: Uid::NIL,
                modes: 0,
            },
            SetAttr::SetModes(0),
            SetAttr::SetLinkCount(0),
            SetAttr::SizeAndDtm(0, Clock::ZERO),
            SetAttr::SizeAndDtm2(0, Clock::ZERO),
            SetAttr::SpecialFlag(true),
            SetAttr::UpdateDtm,
            SetAttr::UpdateDtm2,
        ];
        for (i, op) in ops.iter().enumerate() {
            assert_eq!(op.type_code() as usize, i);
        }
    }

    #[test]
    fn test_timestamp_mask_covers_metadata_only() {
        assert_ne!(TIMESTAMP_MASK & (1 << SetAttr::AclUid(Uid::NIL).type_code()), 0);
        assert_eq!(TIMESTAMP_MASK & (1 << SetAttr::Size(0).type_code()), 0);
        assert_eq!(TIMESTAMP_MASK & (1 << SetAttr::UpdateDtm.type_code()), 0);
    }
}
