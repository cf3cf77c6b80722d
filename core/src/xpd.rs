//! # Debugger Observation Surface
//!
//! A registered debugger may inspect and patch its target's memory and
//! restart it after a stop. Registration is one debugger per target;
//! every call checks the caller against the registration before
//! touching anything. Out-of-range accesses surface as a status
//! rather than a fault, the guarded-copy contract of the original
//! cleanup-frame machinery.

use hashbrown::HashMap;

use alloc::vec::Vec;
use vela_types::status::{xpd, Status};
use vela_types::{KernelResult, Pid};

use crate::kernel::Kernel;
use crate::lock::LockId;

/// Per-target debugger registrations and observation windows.
#[derive(Debug, Default)]
pub struct XpdTable {
    debuggers: HashMap<Pid, Pid>,
    windows: HashMap<Pid, Vec<u8>>,
}

impl XpdTable {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `debugger` for `target`, replacing any previous one.
    pub fn set_debugger(&mut self, target: Pid, debugger: Pid) {
        self.debuggers.insert(target, debugger);
    }

    /// Expose a target's observation window (its debugger-visible
    /// memory image).
    pub fn set_window(&mut self, target: Pid, window: Vec<u8>) {
        self.windows.insert(target, window);
    }

    fn check_debugger(&self, caller: Pid, target: Pid) -> Result<(), Status> {
        match self.debuggers.get(&target) {
            Some(d) if *d == caller => Ok(()),
            _ => Err(xpd::NOT_DEBUGGER),
        }
    }

    /// Copy out of the target's window.
    pub fn read_proc(
        &self,
        caller: Pid,
        target: Pid,
        offset: usize,
        out: &mut [u8],
    ) -> Status {
        if let Err(status) = self.check_debugger(caller, target) {
            return status;
        }
        let Some(window) = self.windows.get(&target) else {
            return xpd::BAD_ADDRESS;
        };
        let end = offset.saturating_add(out.len());
        if end > window.len() {
            return xpd::BAD_ADDRESS;
        }
        out.copy_from_slice(&window[offset..end]);
        Status::OK
    }

    /// Patch the target's window.
    pub fn write_proc(
        &mut self,
        caller: Pid,
        target: Pid,
        offset: usize,
        data: &[u8],
    ) -> Status {
        if let Err(status) = self.check_debugger(caller, target) {
            return status;
        }
        let Some(window) = self.windows.get_mut(&target) else {
            return xpd::BAD_ADDRESS;
        };
        let end = offset.saturating_add(data.len());
        if end > window.len() {
            return xpd::BAD_ADDRESS;
        }
        window[offset..end].copy_from_slice(data);
        Status::OK
    }

    /// True when `caller` is the registered debugger of `target`.
    pub fn is_debugger(&self, caller: Pid, target: Pid) -> bool {
        self.check_debugger(caller, target).is_ok()
    }
}

/// Restart a stopped target on behalf of its debugger.
///
/// Holds the XPD lock across the resume so the observation tables
/// cannot shift under a concurrent registration.
pub fn restart(kernel: &mut Kernel, table: &XpdTable, caller: Pid, target: Pid) -> KernelResult<()> {
    if !table.is_debugger(caller, target) {
        return Err(xpd::NOT_DEBUGGER);
    }
    kernel.set_lock(LockId::XPD);
    let status = kernel.resume(target);
    kernel.clr_lock(LockId::XPD);
    if status.is_err() {
        return Err(status);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use vela_types::Asid;

    #[test]
    fn test_only_registered_debugger_may_read() {
        let mut t = XpdTable::new();
        t.set_debugger(Pid(5), Pid(3));
        t.set_window(Pid(5), alloc::vec![1, 2, 3, 4]);

        let mut buf = [0u8; 2];
        assert_eq!(t.read_proc(Pid(9), Pid(5), 0, &mut buf), xpd::NOT_DEBUGGER);
        assert_eq!(t.read_proc(Pid(3), Pid(5), 1, &mut buf), Status::OK);
        assert_eq!(buf, [2, 3]);
    }

    #[test]
    fn test_out_of_range_access_is_status_not_fault() {
        let mut t = XpdTable::new();
        t.set_debugger(Pid(5), Pid(3));
        t.set_window(Pid(5), alloc::vec![0; 8]);

        let mut buf = [0u8; 4];
        assert_eq!(t.read_proc(Pid(3), Pid(5), 6, &mut buf), xpd::BAD_ADDRESS);
        assert_eq!(t.write_proc(Pid(3), Pid(5), 7, &[1, 2]), xpd::BAD_ADDRESS);
    }

    #[test]
    fn test_write_proc_patches_window() {
        let mut t = XpdTable::new();
        t.set_debugger(Pid(5), Pid(3));
        t.set_window(Pid(5), alloc::vec![0; 4]);

        assert_eq!(t.write_proc(Pid(3), Pid(5), 2, &[0xAA, 0xBB]), Status::OK);
        let mut buf = [0u8; 4];
        assert_eq!(t.read_proc(Pid(3), Pid(5), 0, &mut buf), Status::OK);
        assert_eq!(buf, [0, 0, 0xAA, 0xBB]);
    }

    #[test]
    fn test_restart_resumes_suspended_target() {
        let mut kernel = Kernel::init();
        let target = kernel.bind(Asid(4), 5).unwrap();
        let debugger = kernel.bind(Asid(4), 5).unwrap();

        let mut t = XpdTable::new();
        t.set_debugger(target, debugger);

        kernel.suspend(target).unwrap();
        assert_eq!(
            restart(&mut kernel, &t, Pid(63), target),
            Err(xpd::NOT_DEBUGGER)
        );
        assert_eq!(restart(&mut kernel, &t, debugger, target), Ok(()));
        assert!(kernel.sched.pcb(target).unwrap().in_ready_list);
    }
}
