//! Externally stored event ranges.
//!
//! A platform can own the storage for a contiguous range of event ids and
//! splice them into the logical event stream. The ring keeps only an inert
//! slot record: the id range and two plain function pointers, invoked on
//! the worker during fetch and delivery notification. Slots are reclaimed
//! once the ring's first event id moves past the range.

use crate::error::LogError;
use crate::event::EventId;

/// A contiguous, externally stored range of event ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExternalRange {
    /// First id in the range.
    pub first_id: EventId,
    /// Last id in the range, inclusive.
    pub last_id: EventId,
}

/// What to do with a slot after its delivery-notification callback ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyAction {
    /// Keep the registration.
    Keep,
    /// Drop the registration; equivalent to unregistering from within the
    /// callback.
    Unregister,
}

/// Callback fetching externally stored events into a retrieval window.
///
/// The callback must advance `ctx.current_id` past the ids it handled (at
/// minimum to `range.last_id + 1` when it produced everything).
pub type FetchExternalEventsFn =
    fn(ctx: &mut crate::engine::FetchContext<'_, '_>, range: &ExternalRange) -> Result<(), LogError>;

/// Callback invoked when events in the range were delivered to a
/// subscriber.
pub type NotifyExternalEventsFn =
    fn(range: &ExternalRange, last_delivered: EventId, recipient: u64) -> NotifyAction;

/// One external-events slot on a ring.
#[derive(Debug, Clone, Copy)]
pub struct ExternalEvents {
    pub(crate) range: ExternalRange,
    pub(crate) fetch: Option<FetchExternalEventsFn>,
    pub(crate) notify: Option<NotifyExternalEventsFn>,
}

impl ExternalEvents {
    pub(crate) const fn empty() -> Self {
        Self {
            range: ExternalRange {
                first_id: 0,
                last_id: 0,
            },
            fetch: None,
            notify: None,
        }
    }

    /// A slot is reclaimable once unregistered, or once the ring's first
    /// stored id has moved past its range.
    pub(crate) fn is_free(&self, ring_first_id: EventId) -> bool {
        self.fetch.is_none() && self.range.last_id <= ring_first_id
    }

    /// Whether `id` falls inside this range and the range is still live
    /// relative to the ring's first stored id. Registration state is not
    /// consulted: an unregistered range still occupies its ids until the
    /// ring evicts past it.
    pub(crate) fn covers(&self, id: EventId, ring_first_id: EventId) -> bool {
        id >= self.range.first_id
            && id <= self.range.last_id
            && ring_first_id <= self.range.first_id
    }
}

/// Opaque handle naming a registration, used to unregister it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExternalEventsHandle {
    pub(crate) priority: crate::event::Priority,
    pub(crate) slot: usize,
    /// Range recorded at registration, echoed back to the caller.
    pub range: ExternalRange,
}

/// Number of external-event slots per ring.
pub const EXTERNAL_EVENT_SLOTS: usize = 4;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_slot_is_free() {
        let slot = ExternalEvents::empty();
        assert!(slot.is_free(1));
    }

    #[test]
    fn test_covers_range_bounds() {
        let mut slot = ExternalEvents::empty();
        slot.range = ExternalRange {
            first_id: 10,
            last_id: 14,
        };

        assert!(slot.covers(10, 1));
        assert!(slot.covers(14, 1));
        assert!(!slot.covers(15, 1));
        // ring already evicted past the start of the range
        assert!(!slot.covers(12, 11));
    }

    #[test]
    fn test_slot_freed_by_eviction() {
        let mut slot = ExternalEvents::empty();
        slot.range = ExternalRange {
            first_id: 10,
            last_id: 14,
        };
        // still registered, but the ring moved past it
        slot.fetch = None;
        assert!(slot.is_free(14));
        assert!(!slot.is_free(13));
    }
}
