//! # Event Counts
//!
//! An event count is a monotonic counter with a wait primitive: a
//! waiter names a target value and sleeps until the count reaches it.
//! Advancing the count by one is the only mutation; the count never
//! moves backwards and is never destroyed.
//!
//! Wake policy is a property of the count's kind. Lock and condition
//! counts wake every waiter whose target is satisfied; a process count
//! belongs to one process and wakes only its owner.
//!
//! The arena here holds the kernel-resident tier (EC1): counts are
//! addressed by stable [`EcId`] index, and waiter records are embedded
//! in the arena rather than on anyone's stack, so unlinking on every
//! return path is a plain retain.

use alloc::vec::Vec;
use vela_types::Pid;

// =============================================================================
// Ids and Kinds
// =============================================================================

/// Stable index of an event count in the kernel arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct EcId(pub u16);

/// What an event count synchronizes, which fixes its wake policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EcKind {
    /// Guards a resource lock; every satisfied waiter retries.
    Lock,
    /// Belongs to one process; only the owner wakes.
    Process,
    /// Guards a state transition (IN_TRANS and friends); wakes all.
    Condition,
}

// =============================================================================
// Event Count
// =============================================================================

/// One waiter record: a process, the value it is waiting for, and the
/// position of this count in the process's wait array (so the wake can
/// report which member fired).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EcWaiter {
    /// The waiting process.
    pub pid: Pid,
    /// Wake when the count reaches this value.
    pub target: u32,
    /// Index of this count in the waiter's wait array.
    pub slot: usize,
}

/// A kernel-resident event count.
#[derive(Debug)]
pub struct EventCount {
    value: u32,
    kind: EcKind,
    owner: Option<Pid>,
    waiters: Vec<EcWaiter>,
}

impl EventCount {
    fn new(kind: EcKind, owner: Option<Pid>) -> Self {
        Self {
            value: 0,
            kind,
            owner,
            waiters: Vec::new(),
        }
    }

    /// Current value.
    pub fn value(&self) -> u32 {
        self.value
    }

    /// The count's kind.
    pub fn kind(&self) -> EcKind {
        self.kind
    }

    /// Number of enqueued waiters.
    pub fn waiter_count(&self) -> usize {
        self.waiters.len()
    }
}

// =============================================================================
// Arena
// =============================================================================

/// Arena of kernel event counts.
#[derive(Debug, Default)]
pub struct EcTable {
    ecs: Vec<EventCount>,
}

impl EcTable {
    /// An empty arena.
    pub const fn new() -> Self {
        Self { ecs: Vec::new() }
    }

    /// Create a count with value zero.
    pub fn init(&mut self, kind: EcKind) -> EcId {
        self.init_owned(kind, None)
    }

    /// Create a process count owned by `pid`.
    pub fn init_for(&mut self, pid: Pid) -> EcId {
        self.init_owned(EcKind::Process, Some(pid))
    }

    fn init_owned(&mut self, kind: EcKind, owner: Option<Pid>) -> EcId {
        let id = EcId(self.ecs.len() as u16);
        self.ecs.push(EventCount::new(kind, owner));
        id
    }

    /// Borrow a count.
    pub fn get(&self, id: EcId) -> &EventCount {
        &self.ecs[id.0 as usize]
    }

    /// Current value of a count.
    pub fn value(&self, id: EcId) -> u32 {
        self.ecs[id.0 as usize].value
    }

    /// Enqueue a waiter. The caller has already checked satisfaction.
    pub(crate) fn enqueue(&mut self, id: EcId, pid: Pid, target: u32, slot: usize) {
        self.ecs[id.0 as usize]
            .waiters
            .push(EcWaiter { pid, target, slot });
    }

    /// Drop every waiter record belonging to `pid`, on any count.
    ///
    /// Cleanup must be total: a woken or cancelled process leaves no
    /// record behind on any count it enqueued on.
    pub(crate) fn unlink_all(&mut self, pid: Pid) {
        for ec in &mut self.ecs {
            ec.waiters.retain(|w| w.pid != pid);
        }
    }

    /// Advance a count by one and collect `(pid, slot)` pairs to wake.
    ///
    /// The woken records are removed from the waiter list. For a
    /// process count only the owner's records are eligible; lock and
    /// condition counts wake every satisfied waiter.
    pub(crate) fn advance(&mut self, id: EcId) -> Vec<(Pid, usize)> {
        let ec = &mut self.ecs[id.0 as usize];
        ec.value = ec.value.wrapping_add(1);

        let value = ec.value;
        let owner = ec.owner;
        let wake_owner_only = matches!(ec.kind, EcKind::Process);

        let mut woken = Vec::new();
        ec.waiters.retain(|w| {
            let satisfied = value.wrapping_sub(w.target) < 0x8000_0000;
            let eligible = !wake_owner_only || Some(w.pid) == owner;
            if satisfied && eligible {
                woken.push((w.pid, w.slot));
                false
            } else {
                true
            }
        });
        woken
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(n: u16) -> Pid {
        Pid(n)
    }

    #[test]
    fn test_init_starts_at_zero() {
        let mut t = EcTable::new();
        let id = t.init(EcKind::Condition);
        assert_eq!(t.value(id), 0);
    }

    #[test]
    fn test_advance_is_monotonic() {
        let mut t = EcTable::new();
        let id = t.init(EcKind::Condition);
        for expected in 1..=5u32 {
            t.advance(id);
            assert_eq!(t.value(id), expected);
        }
    }

    #[test]
    fn test_wake_only_at_target() {
        let mut t = EcTable::new();
        let id = t.init(EcKind::Lock);
        t.enqueue(id, pid(3), 2, 0);

        assert!(t.advance(id).is_empty());
        assert_eq!(t.advance(id), alloc::vec![(pid(3), 0)]);
        assert_eq!(t.get(id).waiter_count(), 0);
    }

    #[test]
    fn test_lock_kind_wakes_all_satisfied() {
        let mut t = EcTable::new();
        let id = t.init(EcKind::Lock);
        t.enqueue(id, pid(3), 1, 0);
        t.enqueue(id, pid(4), 1, 0);
        t.enqueue(id, pid(5), 2, 0);

        let woken = t.advance(id);
        assert_eq!(woken, alloc::vec![(pid(3), 0), (pid(4), 0)]);
        assert_eq!(t.get(id).waiter_count(), 1);
    }

    #[test]
    fn test_process_kind_wakes_owner_only() {
        let mut t = EcTable::new();
        let id = t.init_for(pid(7));
        t.enqueue(id, pid(7), 1, 0);
        t.enqueue(id, pid(9), 1, 0);

        let woken = t.advance(id);
        assert_eq!(woken, alloc::vec![(pid(7), 0)]);
        // The stray record stays; it does not belong to the owner.
        assert_eq!(t.get(id).waiter_count(), 1);
    }

    #[test]
    fn test_unlink_all_is_total() {
        let mut t = EcTable::new();
        let a = t.init(EcKind::Lock);
        let b = t.init(EcKind::Condition);
        t.enqueue(a, pid(3), 5, 0);
        t.enqueue(b, pid(3), 9, 1);
        t.enqueue(b, pid(4), 1, 0);

        t.unlink_all(pid(3));
        assert_eq!(t.get(a).waiter_count(), 0);
        assert_eq!(t.get(b).waiter_count(), 1);
    }
}
