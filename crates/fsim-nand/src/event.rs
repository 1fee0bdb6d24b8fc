//! Passive discrete-event queue.
//!
//! The engine never calls back into anything: the host allocates an event
//! id, schedules firings at absolute ticks, and pumps `pop_due` from its
//! main loop, dispatching on the returned id. This keeps every mutation of
//! simulator state in one place and one borrow.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// Handle for a schedulable event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId(u64);

/// Min-heap of `(tick, event)` firings.
#[derive(Debug, Default)]
pub struct EventEngine {
    next_id: u64,
    queue: BinaryHeap<Reverse<(u64, u64)>>,
}

impl EventEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh event id.
    pub fn allocate(&mut self) -> EventId {
        let id = self.next_id;
        self.next_id += 1;
        EventId(id)
    }

    /// Schedule `event` to fire at absolute tick `at`.
    pub fn schedule(&mut self, event: EventId, at: u64) {
        self.queue.push(Reverse((at, event.0)));
    }

    /// Earliest pending firing time, if any.
    #[must_use]
    pub fn peek_next(&self) -> Option<u64> {
        self.queue.peek().map(|Reverse((at, _))| *at)
    }

    /// Pop the earliest firing with `tick <= now`, returning the event and
    /// its scheduled time. Ties fire in schedule order of id.
    pub fn pop_due(&mut self, now: u64) -> Option<(EventId, u64)> {
        match self.queue.peek() {
            Some(Reverse((at, _))) if *at <= now => {
                let Reverse((at, id)) = self.queue.pop()?;
                Some((EventId(id), at))
            }
            _ => None,
        }
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.queue.len()
    }
}
