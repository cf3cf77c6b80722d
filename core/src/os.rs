//! # Boot-time Error Reporting and Shutdown
//!
//! Two pieces of operator-facing glue: `boot_errchk` formats any
//! non-zero status during bring-up and keeps going unless told the
//! condition is fatal, and `shutdown` walks the subsystems down in
//! reverse-startup order once the caller proves it is the superuser or
//! the locksmith.
//!
//! The status-translation tables live here too: terminal-facing calls
//! fold serial, line-discipline and keyboard statuses into the TERM
//! domain, and the shutdown-wired remap turns internal ACL errors into
//! their external file-error equivalents.

use alloc::string::String;
use alloc::vec::Vec;
use vela_types::status::{file, subsys, Status};
use vela_types::Uid;

use crate::crash;

// =============================================================================
// Well-known principals
// =============================================================================

/// The superuser's UID.
pub const SUPERUSER_UID: Uid = Uid::new(0x0000_0001, 0x0000_0100);

/// The locksmith's UID.
pub const LOCKSMITH_UID: Uid = Uid::new(0x0000_0001, 0x0000_0200);

// =============================================================================
// Boot error check
// =============================================================================

/// Report a status during bring-up.
///
/// A zero status is silent. A non-zero, non-fatal status is displayed
/// and boot continues; a fatal one stops the system.
pub fn boot_errchk(status: Status, what: &str, fatal: bool) {
    if status.is_ok() {
        return;
    }
    log::warn!("boot: {what} failed with status {status}");
    if fatal {
        crash::crash_system(status, what);
    }
}

// =============================================================================
// Shutdown
// =============================================================================

/// Subsystems registered for the shutdown walk, in startup order.
#[derive(Debug, Default)]
pub struct ShutdownRegistry {
    names: Vec<String>,
}

impl ShutdownRegistry {
    /// An empty registry.
    pub const fn new() -> Self {
        Self { names: Vec::new() }
    }

    /// Record one subsystem as started.
    pub fn started(&mut self, name: &str) {
        self.names.push(String::from(name));
    }

    /// Walk the registered subsystems in reverse-startup order,
    /// returning the shutdown sequence.
    ///
    /// Only the superuser or the locksmith may shut the system down.
    pub fn shutdown(&self, caller: Uid) -> Result<Vec<String>, Status> {
        if caller != SUPERUSER_UID && caller != LOCKSMITH_UID {
            return Err(file::INSUFFICIENT_RIGHTS);
        }
        let mut order: Vec<String> = self.names.clone();
        order.reverse();
        for name in &order {
            log::info!("shutdown: stopping {name}");
        }
        Ok(order)
    }
}

// =============================================================================
// Status translation
// =============================================================================

/// Subsystem ids of the terminal-facing driver domains.
mod term_domains {
    /// Serial I/O driver.
    pub const SIO: u16 = 24;
    /// Line discipline.
    pub const TTY: u16 = 25;
    /// Keyboard driver.
    pub const KBD: u16 = 26;
}

/// Translation table rows: (domain code, TERM code).
const SIO_TO_TERM: &[(u16, u16)] = &[(0x0001, 0x0001), (0x0002, 0x0004), (0x0003, 0x0005)];
const TTY_TO_TERM: &[(u16, u16)] = &[(0x0001, 0x0002), (0x0002, 0x0006), (0x0004, 0x0007)];
const KBD_TO_TERM: &[(u16, u16)] = &[(0x0001, 0x0003), (0x0002, 0x0008)];

/// Fold a driver-domain status into the TERM domain.
///
/// Statuses from other subsystems pass through unchanged, as do codes
/// without a table row.
pub fn to_term_status(status: Status) -> Status {
    if status.is_ok() {
        return status;
    }
    let table = match status.subsystem() {
        term_domains::SIO => SIO_TO_TERM,
        term_domains::TTY => TTY_TO_TERM,
        term_domains::KBD => KBD_TO_TERM,
        _ => return status,
    };
    for &(code, term_code) in table {
        if status.code() == code {
            return Status::new(subsys::TERM, term_code);
        }
    }
    status
}

/// Shutdown-wired remap: internal ACL rejections surface to user
/// processes as external file errors, marked internal.
pub fn shutwired_remap(status: Status) -> Status {
    if status.subsystem() == subsys::AST && status.code() == file::INSUFFICIENT_RIGHTS.code() {
        return file::INSUFFICIENT_RIGHTS.as_internal();
    }
    status
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boot_errchk_ignores_ok() {
        boot_errchk(Status::OK, "timer", false);
        boot_errchk(Status::new(subsys::TIME, 5), "timer", false);
    }

    #[test]
    fn test_shutdown_requires_privilege() {
        let mut reg = ShutdownRegistry::new();
        reg.started("time");
        reg.started("disk");
        reg.started("ast");

        assert_eq!(
            reg.shutdown(Uid::new(9, 9)),
            Err(file::INSUFFICIENT_RIGHTS)
        );
        let order = reg.shutdown(SUPERUSER_UID).unwrap();
        assert_eq!(order, alloc::vec!["ast", "disk", "time"]);
        assert!(reg.shutdown(LOCKSMITH_UID).is_ok());
    }

    #[test]
    fn test_term_translation() {
        let sio = Status::new(24, 0x0002);
        let translated = to_term_status(sio);
        assert_eq!(translated.subsystem(), subsys::TERM);
        assert_eq!(translated.code(), 0x0004);

        // No row: passes through.
        let odd = Status::new(24, 0x0099);
        assert_eq!(to_term_status(odd), odd);

        // Other domains untouched.
        let time = Status::new(subsys::TIME, 1);
        assert_eq!(to_term_status(time), time);
    }

    #[test]
    fn test_shutwired_remap_marks_internal() {
        let internal_acl = Status::new(subsys::AST, file::INSUFFICIENT_RIGHTS.code());
        let remapped = shutwired_remap(internal_acl);
        assert!(remapped.is_internal());
        assert_eq!(remapped.subsystem(), subsys::FILE);
    }
}
