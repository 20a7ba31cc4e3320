//! Deadline timers for session lifecycle transitions.
//!
//! A small binary-heap timer service, polled by the host with the current
//! time. Each registration carries a typed [`TimerEvent`] naming the
//! session it belongs to and the transition it drives; handlers receive
//! values, never raw pointers.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use smallvec::SmallVec;

/// What a fired timer means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// A remote session's grace period elapsed.
    GracePeriod,
    /// A session's linger hold elapsed.
    Linger,
}

/// A fired or pending timer, bound to a session slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerEvent {
    /// Index of the session in the pool.
    pub session: usize,
    /// Transition the timer drives.
    pub kind: TimerKind,
}

/// One registration in the heap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerRegistration {
    /// Unique id, usable with [`TimerService::cancel`].
    pub id: u64,
    /// Absolute deadline in milliseconds.
    pub deadline: u64,
    /// Event delivered when the deadline passes.
    pub event: TimerEvent,
}

impl Ord for TimerRegistration {
    fn cmp(&self, other: &Self) -> Ordering {
        // reverse ordering for min-heap behavior (earliest first)
        other.deadline.cmp(&self.deadline)
    }
}

impl PartialOrd for TimerRegistration {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Collection type for fired timers; sized so typical polls avoid heap
/// allocation.
pub type FiredTimers = SmallVec<[TimerRegistration; 4]>;

/// Deadline-ordered timer service.
#[derive(Debug, Default)]
pub struct TimerService {
    timers: BinaryHeap<TimerRegistration>,
    next_id: u64,
}

impl TimerService {
    /// Creates an empty service.
    #[must_use]
    pub fn new() -> Self {
        Self {
            timers: BinaryHeap::new(),
            next_id: 0,
        }
    }

    /// Registers a timer firing at `deadline`. Returns its id.
    pub fn arm(&mut self, deadline: u64, event: TimerEvent) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.timers.push(TimerRegistration {
            id,
            deadline,
            event,
        });
        id
    }

    /// Cancels a timer by id. Returns whether it was pending.
    pub fn cancel(&mut self, id: u64) -> bool {
        let before = self.timers.len();
        self.timers.retain(|t| t.id != id);
        self.timers.len() < before
    }

    /// Pops every timer with `deadline <= now`, earliest first.
    pub fn poll(&mut self, now: u64) -> FiredTimers {
        let mut fired = FiredTimers::new();
        while let Some(head) = self.timers.peek() {
            if head.deadline > now {
                break;
            }
            if let Some(reg) = self.timers.pop() {
                fired.push(reg);
            }
        }
        fired
    }

    /// Number of pending registrations.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.timers.len()
    }

    /// Earliest pending deadline, if any.
    #[must_use]
    pub fn next_deadline(&self) -> Option<u64> {
        self.timers.peek().map(|t| t.deadline)
    }
}
