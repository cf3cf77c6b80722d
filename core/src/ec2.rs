//! # EC2 - The General Event-Count Tier
//!
//! User processes see event counts through EC2 references. A reference
//! is either a registered index naming a kernel event count exported
//! by a subsystem, or a guarded handle to a count living in user
//! memory, bounds-checked against the address-space protection
//! boundary before the kernel touches it.
//!
//! Waits normalize everything to the kernel tier under the global EC2
//! lock: registered references join the wait array directly; user
//! counts get waiter records from a fixed free-listed table and wake
//! the waiting process through its own process event count. A woken
//! or cancelled wait always releases its waiter records, whichever
//! path it returns by.

use hashbrown::HashMap;
use vela_types::status::{ec as ec_status, fault, Status};
use vela_types::{KernelResult, Pid};

use crate::ec::EcId;
use crate::kernel::{satisfied, Kernel, WaitVerdict};
use crate::lock::LockId;
use crate::pcb::Wakeup;

/// Capacity of the waiter-record table.
pub const WAITER_TABLE_SIZE: usize = 128;

/// Most EC2 references a single wait accepts.
pub const MAX_EC2_WAIT: usize = 12;

/// Default user address-space protection boundary.
pub const DEFAULT_BOUNDARY: u32 = 0x0100_0000;

// =============================================================================
// References
// =============================================================================

/// A user-visible event-count reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ec2Ref {
    /// The reserved empty reference; always an error to wait on.
    Nil,
    /// The always-satisfied reference.
    Always,
    /// Index into the kernel's registered-export table.
    Registered(u16),
    /// A count in user memory, named by its address handle.
    User(u32),
}

// =============================================================================
// Waiter Table
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct WaiterRecord {
    /// Next free-list link when free; unused when live.
    next_free: u16,
    pid: Pid,
    target: u32,
    addr: u32,
    live: bool,
}

const FREE_END: u16 = u16::MAX;

// =============================================================================
// Table
// =============================================================================

/// A user-memory event count.
#[derive(Debug, Default, Clone, Copy)]
struct UserEc {
    value: u32,
}

/// The EC2 registry, user-count map and waiter table.
#[derive(Debug)]
pub struct Ec2Table {
    registry: alloc::vec::Vec<EcId>,
    users: HashMap<u32, UserEc>,
    waiters: [WaiterRecord; WAITER_TABLE_SIZE],
    free_head: u16,
    boundary: u32,
}

impl Ec2Table {
    /// An empty table with the default protection boundary.
    pub fn new() -> Self {
        let mut waiters = [WaiterRecord {
            next_free: FREE_END,
            pid: Pid(0),
            target: 0,
            addr: 0,
            live: false,
        }; WAITER_TABLE_SIZE];
        for (i, w) in waiters.iter_mut().enumerate() {
            w.next_free = if i + 1 < WAITER_TABLE_SIZE {
                (i + 1) as u16
            } else {
                FREE_END
            };
        }
        Self {
            registry: alloc::vec::Vec::new(),
            users: HashMap::new(),
            waiters,
            free_head: 0,
            boundary: DEFAULT_BOUNDARY,
        }
    }

    /// Export a kernel event count; returns its registered index.
    pub fn register(&mut self, ec: EcId) -> u16 {
        self.registry.push(ec);
        (self.registry.len() - 1) as u16
    }

    /// Move the protection boundary (boot-time configuration).
    pub fn set_boundary(&mut self, boundary: u32) {
        self.boundary = boundary;
    }

    /// Create a user event count at an address handle, value zero.
    pub fn ec2_init(&mut self, addr: u32) -> Status {
        if addr >= self.boundary {
            return fault::PROTECTION_BOUNDARY;
        }
        self.users.insert(addr, UserEc::default());
        Status::OK
    }

    fn lookup_registered(&self, idx: u16) -> Option<EcId> {
        self.registry.get(idx as usize).copied()
    }

    fn alloc_waiter(&mut self, pid: Pid, target: u32, addr: u32) -> Option<u16> {
        let idx = self.free_head;
        if idx == FREE_END {
            return None;
        }
        let rec = &mut self.waiters[idx as usize];
        self.free_head = rec.next_free;
        *rec = WaiterRecord {
            next_free: FREE_END,
            pid,
            target,
            addr,
            live: true,
        };
        Some(idx)
    }

    /// Release every waiter record owned by a process.
    pub fn release_waiters(&mut self, pid: Pid) {
        for i in 0..WAITER_TABLE_SIZE {
            if self.waiters[i].live && self.waiters[i].pid == pid {
                self.waiters[i].live = false;
                self.waiters[i].next_free = self.free_head;
                self.free_head = i as u16;
            }
        }
    }

    /// Count live waiter records (diagnostic).
    pub fn live_waiters(&self) -> usize {
        self.waiters.iter().filter(|w| w.live).count()
    }
}

impl Default for Ec2Table {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Kernel Operations
// =============================================================================

impl Kernel {
    /// Read an EC2's current value.
    pub fn ec2_read(&self, ec: Ec2Ref) -> KernelResult<u32> {
        match ec {
            Ec2Ref::Nil => Err(ec_status::BAD_EVENT_COUNT),
            Ec2Ref::Always => Ok(u32::MAX),
            Ec2Ref::Registered(idx) => {
                let id = self
                    .ec2
                    .lookup_registered(idx)
                    .ok_or(ec_status::BAD_EVENT_COUNT)?;
                Ok(self.ecs.value(id))
            }
            Ec2Ref::User(addr) => {
                if addr >= self.ec2.boundary {
                    return Err(fault::PROTECTION_BOUNDARY);
                }
                self.ec2
                    .users
                    .get(&addr)
                    .map(|u| u.value)
                    .ok_or(ec_status::BAD_EVENT_COUNT)
            }
        }
    }

    /// Advance an EC2, waking any satisfied waiters.
    pub fn ec2_advance(&mut self, ec: Ec2Ref) -> Status {
        match ec {
            Ec2Ref::Registered(idx) => match self.ec2.lookup_registered(idx) {
                Some(id) => {
                    self.advance(id);
                    Status::OK
                }
                None => ec_status::BAD_EVENT_COUNT,
            },
            Ec2Ref::User(addr) => {
                if addr >= self.ec2.boundary {
                    return fault::PROTECTION_BOUNDARY;
                }
                let Some(user) = self.ec2.users.get_mut(&addr) else {
                    return ec_status::BAD_EVENT_COUNT;
                };
                user.value = user.value.wrapping_add(1);
                let value = user.value;

                // Wake every satisfied waiter through its process EC.
                let mut to_wake = arrayvec::ArrayVec::<Pid, WAITER_TABLE_SIZE>::new();
                for rec in &self.ec2.waiters {
                    if rec.live && rec.addr == addr && satisfied(value, rec.target) {
                        to_wake.push(rec.pid);
                    }
                }
                for pid in to_wake {
                    if let Some(pcb) = self.sched.pcb(pid) {
                        let proc_ec = pcb.proc_ec;
                        self.advance(proc_ec);
                    }
                }
                Status::OK
            }
            Ec2Ref::Nil | Ec2Ref::Always => ec_status::BAD_EVENT_COUNT,
        }
    }

    /// Wait on a set of EC2 references.
    ///
    /// Returns the satisfied index, parks the process, or fails with
    /// the offending status. Re-enter after a wake; a pending quit
    /// cancellation surfaces here as `async_fault_while_waiting`, with
    /// every waiter record released.
    pub fn ec2_wait(
        &mut self,
        pid: Pid,
        refs: &[Ec2Ref],
        targets: &[u32],
    ) -> KernelResult<WaitVerdict> {
        if refs.len() > MAX_EC2_WAIT {
            return Err(ec_status::TOO_MANY_ECS);
        }
        debug_assert_eq!(refs.len(), targets.len());

        // A quit posted while parked cancels the whole wait.
        if let Some(pcb) = self.sched.pcb_mut(pid) {
            if pcb.wakeup == Some(Wakeup::Quit) {
                pcb.wakeup = None;
                self.ec2.release_waiters(pid);
                return Err(ec_status::ASYNC_FAULT_WHILE_WAITING);
            }
            pcb.wakeup = None;
        }

        self.set_lock(LockId::EC2);
        // Re-entry leaves no stale records behind.
        self.ec2.release_waiters(pid);

        let mut ec1_list = arrayvec::ArrayVec::<EcId, { MAX_EC2_WAIT + 1 }>::new();
        let mut ec1_targets = arrayvec::ArrayVec::<u32, { MAX_EC2_WAIT + 1 }>::new();
        let mut result: Option<KernelResult<usize>> = None;

        // Slot 0 is the process's own EC; user-count wakes arrive there.
        let proc_ec = self.sched.pcb(pid).expect("waiting pid is bound").proc_ec;
        ec1_list.push(proc_ec);
        ec1_targets.push(self.ecs.value(proc_ec).wrapping_add(1));

        for (i, (&r, &target)) in refs.iter().zip(targets).enumerate() {
            match r {
                Ec2Ref::Nil => {
                    result = Some(Err(ec_status::BAD_EVENT_COUNT));
                    break;
                }
                Ec2Ref::Always => {
                    result = Some(Ok(i));
                    break;
                }
                Ec2Ref::Registered(idx) => match self.ec2.lookup_registered(idx) {
                    Some(id) => {
                        if satisfied(self.ecs.value(id), target) {
                            result = Some(Ok(i));
                            break;
                        }
                        ec1_list.push(id);
                        ec1_targets.push(target);
                    }
                    None => {
                        result = Some(Err(ec_status::BAD_EVENT_COUNT));
                        break;
                    }
                },
                Ec2Ref::User(addr) => {
                    if addr >= self.ec2.boundary {
                        result = Some(Err(fault::PROTECTION_BOUNDARY));
                        break;
                    }
                    let Some(user) = self.ec2.users.get(&addr).copied() else {
                        result = Some(Err(ec_status::BAD_EVENT_COUNT));
                        break;
                    };
                    if self.ec2.alloc_waiter(pid, target, addr).is_none() {
                        result = Some(Err(ec_status::NO_WAITER_ENTRIES));
                        break;
                    }
                    if satisfied(user.value, target) {
                        result = Some(Ok(i));
                        break;
                    }
                }
            }
        }

        if let Some(outcome) = result {
            self.ec2.release_waiters(pid);
            self.clr_lock(LockId::EC2);
            return outcome.map(WaitVerdict::Ready);
        }

        self.clr_lock(LockId::EC2);
        // Nothing in the wait array is satisfied (all checked above
        // with the EC2 lock held), so this parks; the wake re-enters
        // this function and resolves against the fresh values.
        let verdict = self.wait_n(pid, &ec1_list, &ec1_targets);
        debug_assert_eq!(verdict, WaitVerdict::Parked);
        Ok(WaitVerdict::Parked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vela_types::Asid;

    fn setup() -> (Kernel, Pid) {
        let mut k = Kernel::init();
        let pid = k.bind(Asid(3), 5).unwrap();
        (k, pid)
    }

    #[test]
    fn test_user_ec_init_and_read() {
        let (mut k, _) = setup();
        assert!(k.ec2.ec2_init(0x1000).is_ok());
        assert_eq!(k.ec2_read(Ec2Ref::User(0x1000)), Ok(0));
        assert_eq!(
            k.ec2_read(Ec2Ref::User(0x2000)),
            Err(ec_status::BAD_EVENT_COUNT)
        );
    }

    #[test]
    fn test_boundary_violation_rejected() {
        let (mut k, pid) = setup();
        let addr = DEFAULT_BOUNDARY + 4;
        assert_eq!(k.ec2.ec2_init(addr), fault::PROTECTION_BOUNDARY);
        assert_eq!(
            k.ec2_wait(pid, &[Ec2Ref::User(addr)], &[1]),
            Err(fault::PROTECTION_BOUNDARY)
        );
    }

    #[test]
    fn test_nil_reference_is_bad() {
        let (mut k, pid) = setup();
        assert_eq!(
            k.ec2_wait(pid, &[Ec2Ref::Nil], &[1]),
            Err(ec_status::BAD_EVENT_COUNT)
        );
        assert_eq!(k.ec2.live_waiters(), 0);
    }

    #[test]
    fn test_user_wait_then_advance_wakes() {
        let (mut k, pid) = setup();
        k.ec2.ec2_init(0x1000);

        let verdict = k.ec2_wait(pid, &[Ec2Ref::User(0x1000)], &[1]).unwrap();
        assert_eq!(verdict, WaitVerdict::Parked);
        assert_eq!(k.ec2.live_waiters(), 1);

        assert!(k.ec2_advance(Ec2Ref::User(0x1000)).is_ok());
        // The wake arrived through the process EC; re-entering the wait
        // finds the satisfied count and releases the records.
        let verdict = k.ec2_wait(pid, &[Ec2Ref::User(0x1000)], &[1]).unwrap();
        assert_eq!(verdict, WaitVerdict::Ready(0));
        assert_eq!(k.ec2.live_waiters(), 0);
    }

    #[test]
    fn test_registered_wait_ready_immediately() {
        let (mut k, pid) = setup();
        let ec = k.ecs.init(crate::ec::EcKind::Condition);
        let idx = k.ec2.register(ec);
        k.advance(ec);

        let verdict = k
            .ec2_wait(pid, &[Ec2Ref::Registered(idx)], &[1])
            .unwrap();
        assert_eq!(verdict, WaitVerdict::Ready(0));
    }

    #[test]
    fn test_quit_during_ec2_wait_cleans_up() {
        let (mut k, pid) = setup();
        k.ec2.ec2_init(0x1000);

        let verdict = k.ec2_wait(pid, &[Ec2Ref::User(0x1000)], &[5]).unwrap();
        assert_eq!(verdict, WaitVerdict::Parked);

        k.post_quit(pid);
        assert_eq!(
            k.ec2_wait(pid, &[Ec2Ref::User(0x1000)], &[5]),
            Err(ec_status::ASYNC_FAULT_WHILE_WAITING)
        );
        assert_eq!(k.ec2.live_waiters(), 0);
    }

    #[test]
    fn test_multi_ec_wait_releases_all_records() {
        let (mut k, pid) = setup();
        for addr in [0x1000u32, 0x1100, 0x1200] {
            k.ec2.ec2_init(addr);
        }
        let refs = [
            Ec2Ref::User(0x1000),
            Ec2Ref::User(0x1100),
            Ec2Ref::User(0x1200),
        ];

        let verdict = k.ec2_wait(pid, &refs, &[1, 1, 1]).unwrap();
        assert_eq!(verdict, WaitVerdict::Parked);
        assert_eq!(k.ec2.live_waiters(), 3);

        assert!(k.ec2_advance(Ec2Ref::User(0x1100)).is_ok());
        let verdict = k.ec2_wait(pid, &refs, &[1, 1, 1]).unwrap();
        assert_eq!(verdict, WaitVerdict::Ready(1));
        // Total cleanup: no record survives the return.
        assert_eq!(k.ec2.live_waiters(), 0);
    }
}
