//! # Status Codes
//!
//! Every kernel operation reports a 32-bit status: the top 16 bits name
//! the originating subsystem, the low 16 bits the code within it, and
//! zero is success. Recoverable conditions travel up the call chain as
//! values; only invariant violations crash the system.
//!
//! The top bit marks a status as internal: wrappers at the supervisor
//! boundary remap such values to their external equivalents before they
//! reach a user process.

// =============================================================================
// Subsystem Numbers
// =============================================================================

/// Subsystem identifiers occupying the high 16 bits of a status.
pub mod subsys {
    /// Object attribute cache.
    pub const AST: u16 = 3;
    /// Mapped-segment tables.
    pub const MST: u16 = 4;
    /// Disk controller.
    pub const DISK: u16 = 8;
    /// Process management.
    pub const PROC: u16 = 10;
    /// Terminal services.
    pub const TERM: u16 = 11;
    /// Fault interception.
    pub const FAULT: u16 = 12;
    /// Time and timer queues.
    pub const TIME: u16 = 13;
    /// File service.
    pub const FILE: u16 = 15;
    /// Event counts.
    pub const EC: u16 = 18;
    /// Calendar.
    pub const CAL: u16 = 20;
    /// Memory-management unit.
    pub const MMU: u16 = 21;
    /// Process debugger.
    pub const XPD: u16 = 22;
}

// =============================================================================
// Status
// =============================================================================

/// A 32-bit status word: `subsystem << 16 | code`, zero on success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct Status(pub u32);

impl Status {
    /// Success.
    pub const OK: Self = Self(0);

    /// Bit marking a status as internal-only.
    pub const INTERNAL_BIT: u32 = 0x8000_0000;

    /// Build a status from subsystem and code.
    pub const fn new(subsystem: u16, code: u16) -> Self {
        Self(((subsystem as u32) << 16) | code as u32)
    }

    /// True on success.
    pub const fn is_ok(self) -> bool {
        self.0 == 0
    }

    /// True on any failure.
    pub const fn is_err(self) -> bool {
        self.0 != 0
    }

    /// The subsystem half (internal bit masked off).
    pub const fn subsystem(self) -> u16 {
        ((self.0 & !Self::INTERNAL_BIT) >> 16) as u16
    }

    /// The code half.
    pub const fn code(self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }

    /// True when the internal marker bit is set.
    pub const fn is_internal(self) -> bool {
        self.0 & Self::INTERNAL_BIT != 0
    }

    /// The same status with the internal marker set.
    pub const fn as_internal(self) -> Self {
        Self(self.0 | Self::INTERNAL_BIT)
    }
}

impl core::fmt::Display for Status {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:08X}", self.0)
    }
}

/// Result alias carrying a failure status.
pub type KernelResult<T> = Result<T, Status>;

// =============================================================================
// Well-known Codes
// =============================================================================

/// Process-management statuses.
pub mod proc {
    use super::{subsys, Status};

    /// PID outside the bound table.
    pub const ILLEGAL_PROCESS_ID: Status = Status::new(subsys::PROC, 0x0001);
    /// Resume of a process that is not suspended.
    pub const NOT_SUSPENDED: Status = Status::new(subsys::PROC, 0x0003);
    /// Suspend of a process already suspended or deferring one.
    pub const ALREADY_SUSPENDED: Status = Status::new(subsys::PROC, 0x0004);
    /// Operation on an unbound PCB slot.
    pub const NOT_BOUND: Status = Status::new(subsys::PROC, 0x0005);
    /// The PCB table is full.
    pub const NO_PCB_AVAILABLE: Status = Status::new(subsys::PROC, 0x0008);
}

/// Object-cache statuses.
pub mod ast {
    use super::{subsys, Status};

    /// Request flag bits outside the supported set.
    pub const INCOMPATIBLE_REQUEST: Status = Status::new(subsys::AST, 0x0002);
    /// Attribute type code outside the dispatch table.
    pub const INVALID_ATTRIBUTE_TYPE: Status = Status::new(subsys::AST, 0x0006);
    /// Reference count would drop below its floor.
    pub const REFCOUNT_UNDERFLOW: Status = Status::new(subsys::AST, 0x0007);
    /// The AOTE table has no free entry.
    pub const TABLE_FULL: Status = Status::new(subsys::AST, 0x0009);
}

/// File-service statuses.
pub mod file {
    use super::{subsys, Status};

    /// The named object does not exist.
    pub const OBJECT_NOT_FOUND: Status = Status::new(subsys::FILE, 0x0001);
    /// Attribute write on a special object other than mod-time/blocks.
    pub const OBJECT_SPECIAL_ATTRIBUTE: Status = Status::new(subsys::FILE, 0x0016);
    /// ACL rejected the access.
    pub const INSUFFICIENT_RIGHTS: Status = Status::new(subsys::FILE, 0x0009);
}

/// Time statuses.
pub mod time {
    use super::{subsys, Status};

    /// Timer element is not queued.
    pub const NOT_IN_QUEUE: Status = Status::new(subsys::TIME, 0x0003);
    /// Gradual adjustment beyond the supported magnitude.
    pub const ADJUST_TOO_LARGE: Status = Status::new(subsys::TIME, 0x000C);
    /// Delay type outside relative/absolute.
    pub const BAD_DELAY_TYPE: Status = Status::new(subsys::TIME, 0x0005);
}

/// Event-count statuses.
pub mod ec {
    use super::{subsys, Status};

    /// More event counts than a single wait supports.
    pub const TOO_MANY_ECS: Status = Status::new(subsys::EC, 0x0001);
    /// An EC2 reference that resolves to nothing.
    pub const BAD_EVENT_COUNT: Status = Status::new(subsys::EC, 0x0002);
    /// The process quit EC advanced during the wait.
    pub const ASYNC_FAULT_WHILE_WAITING: Status = Status::new(subsys::EC, 0x0003);
    /// The EC2 waiter table is exhausted.
    pub const NO_WAITER_ENTRIES: Status = Status::new(subsys::EC, 0x0004);
}

/// Fault-interception statuses.
pub mod fault {
    use super::{subsys, Status};

    /// A guarded pointer crossed the address-space boundary.
    pub const PROTECTION_BOUNDARY: Status = Status::new(subsys::FAULT, 0x0001);
}

/// Calendar statuses.
pub mod cal {
    use super::{subsys, Status};

    /// A civil date or time field is out of range.
    pub const DATE_OR_TIME_INVALID: Status = Status::new(subsys::CAL, 0x0002);
    /// The operator declined the out-of-range calendar.
    pub const REFUSED: Status = Status::new(subsys::CAL, 0x0007);
    /// No calendar hardware present.
    pub const NO_CALENDAR: Status = Status::new(subsys::CAL, 0x0008);
}

/// Disk statuses.
pub mod disk {
    use super::{subsys, Status};

    /// Readback checksum mismatch after a verified write.
    pub const VERIFY_FAILED: Status = Status::new(subsys::DISK, 0x0005);
    /// Volume index outside the mounted set.
    pub const BAD_VOLUME: Status = Status::new(subsys::DISK, 0x0002);
    /// No free space on the volume.
    pub const VOLUME_FULL: Status = Status::new(subsys::DISK, 0x0007);
    /// Transfer failed after retries.
    pub const IO_ERROR: Status = Status::new(subsys::DISK, 0x0003);
}

/// Debugger statuses.
pub mod xpd {
    use super::{subsys, Status};

    /// Caller is not the registered debugger of the target.
    pub const NOT_DEBUGGER: Status = Status::new(subsys::XPD, 0x0002);
    /// Target address range not readable or writable.
    pub const BAD_ADDRESS: Status = Status::new(subsys::XPD, 0x0003);
}

/// Memory-management statuses.
pub mod mmu {
    use super::{subsys, Status};

    /// The page is locked and cannot be invalidated.
    pub const PAGE_LOCKED: Status = Status::new(subsys::MMU, 0x0002);
    /// The page is not in a state that can be safely invalidated.
    pub const PAGE_NOT_REMOVABLE: Status = Status::new(subsys::MMU, 0x0003);
}
