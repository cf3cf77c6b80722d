//! # Timer Callback Queues
//!
//! A timer queue is an ordered list of callback elements, head at the
//! earliest deadline. Elements live in an arena with stable ids; the
//! list link is an index, never a pointer. Deadlines are absolute
//! 48-bit clocks - for the real-time queue that is wall time, for a
//! virtual-time queue the owning process's accumulated CPU time.
//!
//! A scan pops and fires everything at or past `now`. Repeating
//! elements are re-entered at `deadline + interval` before they fire,
//! so a slow callback cannot slip the period. Wired callbacks are run
//! by the interrupt itself; unwired ones are handed to the kernel-mode
//! consumer.

use alloc::vec::Vec;
use arrayvec::ArrayVec;
use vela_core::EcId;
use vela_types::status::{time as time_status, Status};
use vela_types::{Clock, Pid};

/// Most elements one scan batch returns.
pub const SCAN_BATCH: usize = 16;

// =============================================================================
// Elements
// =============================================================================

/// Stable id of a queue element in its arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct QElemId(pub u16);

bitflags::bitflags! {
    /// Element flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct QueueFlags: u16 {
        /// Linked into a queue.
        const IN_QUEUE = 0x01;
        /// Re-enter at deadline + interval after firing.
        const REPEATING = 0x02;
        /// Callback runs in the interrupt.
        const WIRED = 0x04;
        /// Callback is deferred to the kernel-mode consumer.
        const UNWIRED = 0x08;
    }
}

/// What a fired element does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerAction {
    /// Advance an event count.
    AdvanceEc(EcId),
    /// A process's timeslice ended.
    Timeslice(Pid),
    /// Fold a load-average sample.
    LoadSample,
    /// An externally dispatched consumer token.
    Hook(u16),
}

#[derive(Debug)]
struct QElem {
    next: Option<QElemId>,
    deadline: Clock,
    interval: Clock,
    flags: QueueFlags,
    action: TimerAction,
}

/// One fired callback, ready for its executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fired {
    /// The element that fired.
    pub elem: QElemId,
    /// What to do.
    pub action: TimerAction,
    /// True when the callback may run in interrupt context.
    pub wired: bool,
}

// =============================================================================
// Queue
// =============================================================================

/// An ordered timer queue over an element arena.
#[derive(Debug)]
pub struct TimerQueue {
    elems: Vec<Option<QElem>>,
    head: Option<QElemId>,
    queue_id: u16,
}

impl TimerQueue {
    /// An empty queue.
    pub fn new(queue_id: u16) -> Self {
        Self {
            elems: Vec::new(),
            head: None,
            queue_id,
        }
    }

    /// The queue's id word.
    pub fn queue_id(&self) -> u16 {
        self.queue_id
    }

    /// The earliest deadline, if any element is queued.
    pub fn next_deadline(&self) -> Option<Clock> {
        self.head.map(|h| self.elem(h).deadline)
    }

    /// Number of queued elements.
    pub fn len(&self) -> usize {
        let mut n = 0;
        let mut pos = self.head;
        while let Some(id) = pos {
            n += 1;
            pos = self.elem(id).next;
        }
        n
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    fn elem(&self, id: QElemId) -> &QElem {
        self.elems[id.0 as usize].as_ref().expect("live element")
    }

    fn elem_mut(&mut self, id: QElemId) -> &mut QElem {
        self.elems[id.0 as usize].as_mut().expect("live element")
    }

    fn alloc(&mut self, elem: QElem) -> QElemId {
        for (i, slot) in self.elems.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(elem);
                return QElemId(i as u16);
            }
        }
        self.elems.push(Some(elem));
        QElemId((self.elems.len() - 1) as u16)
    }

    /// Create and insert an element.
    ///
    /// Returns the element id and whether it became the new head (in
    /// which case the caller re-arms the hardware timer).
    pub fn enter(
        &mut self,
        deadline: Clock,
        interval: Clock,
        flags: QueueFlags,
        action: TimerAction,
    ) -> (QElemId, bool) {
        let id = self.alloc(QElem {
            next: None,
            deadline,
            interval,
            flags: flags | QueueFlags::IN_QUEUE,
            action,
        });
        let new_head = self.link(id);
        (id, new_head)
    }

    /// Insert an existing element in ascending-deadline order.
    fn link(&mut self, id: QElemId) -> bool {
        let deadline = self.elem(id).deadline;

        match self.head {
            None => {
                self.elem_mut(id).next = None;
                self.head = Some(id);
                true
            }
            Some(head) if deadline < self.elem(head).deadline => {
                self.elem_mut(id).next = Some(head);
                self.head = Some(id);
                true
            }
            Some(head) => {
                let mut pos = head;
                loop {
                    let next = self.elem(pos).next;
                    match next {
                        Some(n) if self.elem(n).deadline <= deadline => pos = n,
                        _ => break,
                    }
                }
                let next = self.elem(pos).next;
                self.elem_mut(id).next = next;
                self.elem_mut(pos).next = Some(id);
                false
            }
        }
    }

    /// Unlink a queued element, keeping its slot.
    fn unlink(&mut self, id: QElemId) -> Result<bool, Status> {
        let queued = self
            .elems
            .get(id.0 as usize)
            .and_then(|s| s.as_ref())
            .is_some_and(|e| e.flags.contains(QueueFlags::IN_QUEUE));
        if !queued {
            return Err(time_status::NOT_IN_QUEUE);
        }

        let was_head = self.head == Some(id);
        if was_head {
            self.head = self.elem(id).next;
        } else {
            let mut pos = self.head.expect("non-head removal implies a head");
            while self.elem(pos).next != Some(id) {
                pos = self.elem(pos).next.expect("element is linked");
            }
            let next = self.elem(id).next;
            self.elem_mut(pos).next = next;
        }
        let elem = self.elem_mut(id);
        elem.next = None;
        elem.flags.remove(QueueFlags::IN_QUEUE);
        Ok(was_head)
    }

    /// Unlink an element and free its slot.
    ///
    /// Returns whether the head was removed (the caller re-arms from
    /// the next head).
    pub fn remove(&mut self, id: QElemId) -> Result<bool, Status> {
        let was_head = self.unlink(id)?;
        self.elems[id.0 as usize] = None;
        Ok(was_head)
    }

    /// Move a queued element to a new deadline, keeping its action.
    pub fn reenter(&mut self, id: QElemId, deadline: Clock) -> Result<bool, Status> {
        self.unlink(id)?;
        let elem = self.elem_mut(id);
        elem.deadline = deadline;
        elem.flags.insert(QueueFlags::IN_QUEUE);
        Ok(self.link(id))
    }

    /// Pop and return every element whose deadline has arrived.
    ///
    /// Repeating elements are re-entered at `deadline + interval`
    /// before being returned; one-shots are freed. At most
    /// [`SCAN_BATCH`] fire per call - the caller loops until the batch
    /// comes back empty, re-taking its spinlock between batches so
    /// callbacks never run under it.
    pub fn scan(&mut self, now: Clock) -> ArrayVec<Fired, SCAN_BATCH> {
        let mut fired = ArrayVec::new();

        while let Some(head) = self.head {
            if fired.is_full() {
                break;
            }
            if self.elem(head).deadline > now {
                break;
            }

            self.head = self.elem(head).next;
            let wired = self.elem(head).flags.contains(QueueFlags::WIRED);
            let action = self.elem(head).action;

            if self.elem(head).flags.contains(QueueFlags::REPEATING) {
                let next_deadline = {
                    let e = self.elem(head);
                    e.deadline.wrapping_add(e.interval)
                };
                self.elem_mut(head).deadline = next_deadline;
                self.elem_mut(head).next = None;
                self.link(head);
            } else {
                self.elems[head.0 as usize] = None;
            }

            fired.push(Fired {
                elem: head,
                action,
                wired,
            });
        }
        fired
    }

    /// Drop every element.
    pub fn flush(&mut self) {
        self.head = None;
        for slot in &mut self.elems {
            *slot = None;
        }
    }
}
