//! Per-priority event ring.
//!
//! An event ring owns the byte ring for one priority plus the bookkeeping
//! that makes the bytes interpretable: the id counter, the first/last
//! event ids and timestamps, the lazily latched UTC pair, and the
//! external-event slots.
//!
//! The id and timestamp metadata track the ring's *priority chain*, not
//! its physical contents: while an event of this priority sits in a
//! lower ring awaiting promotion, its id and delta are already accounted
//! for here.

use crate::counter::{InMemoryCounter, MonotonicCounter};
use crate::error::LogError;
use crate::event::{EventEnvelope, EventId, Priority, SystemTimestamp, UtcTimestamp};
use crate::external::{ExternalEvents, EXTERNAL_EVENT_SLOTS};
use crate::ring::CircularTlvBuffer;

/// Configuration for one ring of the log.
pub struct RingConfig {
    /// Byte capacity of the ring.
    pub capacity: usize,
    /// Priority owned by the ring. Must strictly increase across the
    /// configured rings.
    pub priority: Priority,
    /// Counter backing event-id vending. `None` uses a volatile counter
    /// starting at 1.
    pub counter: Option<Box<dyn MonotonicCounter>>,
}

impl RingConfig {
    /// Ring with a volatile counter.
    pub fn new(priority: Priority, capacity: usize) -> Self {
        Self {
            capacity,
            priority,
            counter: None,
        }
    }

    /// Ring with an embedder-supplied (typically persistent) counter.
    pub fn with_counter(
        priority: Priority,
        capacity: usize,
        counter: Box<dyn MonotonicCounter>,
    ) -> Self {
        Self {
            capacity,
            priority,
            counter: Some(counter),
        }
    }
}

pub(crate) struct EventRing {
    pub(crate) buffer: CircularTlvBuffer,
    pub(crate) priority: Priority,
    pub(crate) first_event_id: EventId,
    pub(crate) last_event_id: EventId,
    pub(crate) first_event_ts: SystemTimestamp,
    pub(crate) last_event_ts: SystemTimestamp,
    pub(crate) first_event_utc: UtcTimestamp,
    pub(crate) last_event_utc: UtcTimestamp,
    pub(crate) utc_initialized: bool,
    counter: Box<dyn MonotonicCounter>,
    pub(crate) external: [ExternalEvents; EXTERNAL_EVENT_SLOTS],
}

impl EventRing {
    pub(crate) fn new(config: RingConfig) -> Self {
        let counter = config
            .counter
            .unwrap_or_else(|| Box::new(InMemoryCounter::new()));
        let first_event_id = counter.value();
        Self {
            buffer: CircularTlvBuffer::new(config.capacity),
            priority: config.priority,
            first_event_id,
            last_event_id: first_event_id.wrapping_sub(1),
            first_event_ts: 0,
            last_event_ts: 0,
            first_event_utc: 0,
            last_event_utc: 0,
            utc_initialized: false,
            counter,
            external: [ExternalEvents::empty(); EXTERNAL_EVENT_SLOTS],
        }
    }

    /// Whether an event of priority `p` is dropped from this ring on
    /// overflow (true) or promoted into the successor (false).
    ///
    /// `next_priority` is the priority of the successor ring, if any. A
    /// successor reserved for strictly more important events than `p`
    /// means `p`'s home is here.
    pub(crate) fn is_final_destination_for(
        &self,
        p: Priority,
        next_priority: Option<Priority>,
    ) -> bool {
        match next_priority {
            None => true,
            Some(np) => np > p,
        }
    }

    /// Vends the next event id. The value is returned even when advancing
    /// the underlying counter fails; the failure is surfaced as a warning.
    pub(crate) fn vend_event_id(&mut self) -> EventId {
        let id = self.counter.value();
        self.last_event_id = id;
        if let Err(err) = self.counter.advance() {
            tracing::warn!(priority = self.priority.0, %err, "event id counter advance failed");
        }
        id
    }

    /// Records an event timestamp, initializing the first-event timestamp
    /// on the very first event.
    pub(crate) fn note_event(&mut self, timestamp: SystemTimestamp) {
        if self.first_event_ts == 0 {
            self.first_event_ts = timestamp;
        }
        self.last_event_ts = timestamp;
    }

    /// Records a UTC event timestamp; the first-UTC latch initializes on
    /// the first UTC-tagged event.
    pub(crate) fn note_event_utc(&mut self, timestamp: UtcTimestamp) {
        if !self.utc_initialized {
            self.first_event_utc = timestamp;
            self.utc_initialized = true;
        }
        self.last_event_utc = timestamp;
    }

    /// Drops the head record: advances the first event id (skipping any
    /// external ranges that start there), folds the record's deltas into
    /// the first-event timestamps, and reclaims the bytes.
    pub(crate) fn drop_head_event(&mut self, envelope: &EventEnvelope) {
        loop {
            let first_id = self.first_event_id;
            let covering = self
                .external
                .iter_mut()
                .find(|slot| slot.covers(first_id, first_id));
            match covering {
                Some(slot) => {
                    self.first_event_id = slot.range.last_id.wrapping_add(1);
                    slot.fetch = None;
                }
                None => break,
            }
        }
        self.first_event_id = self.first_event_id.wrapping_add(1);
        self.first_event_ts = self.first_event_ts.wrapping_add_signed(envelope.delta_system);
        self.first_event_utc = self
            .first_event_utc
            .wrapping_add_signed(envelope.delta_utc);
        self.buffer.advance_head(envelope.total_len);
    }

    /// Finds the slot covering `id`, if any.
    pub(crate) fn external_covering(&self, id: EventId) -> Option<usize> {
        self.external
            .iter()
            .position(|slot| slot.covers(id, self.first_event_id))
    }

    /// Finds a reclaimable slot.
    pub(crate) fn next_free_slot(&self) -> Option<usize> {
        self.external
            .iter()
            .position(|slot| slot.is_free(self.first_event_id))
    }

    /// Vends `count` consecutive ids and installs an external range over
    /// them.
    pub(crate) fn register_external(
        &mut self,
        fetch: crate::external::FetchExternalEventsFn,
        notify: Option<crate::external::NotifyExternalEventsFn>,
        count: usize,
    ) -> Result<usize, LogError> {
        if count == 0 {
            return Err(LogError::InvalidArgument);
        }
        let slot = self.next_free_slot().ok_or(LogError::OutOfSlots)?;
        let first_id = self.vend_event_id();
        for _ in 1..count {
            let _ = self.vend_event_id();
        }
        self.external[slot] = ExternalEvents {
            range: crate::external::ExternalRange {
                first_id,
                last_id: self.last_event_id,
            },
            fetch: Some(fetch),
            notify,
        };
        Ok(slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring(priority: u8, capacity: usize) -> EventRing {
        EventRing::new(RingConfig::new(Priority(priority), capacity))
    }

    #[test]
    fn test_fresh_ring_ids() {
        let r = ring(1, 64);
        assert_eq!(r.first_event_id, 1);
        assert_eq!(r.last_event_id, 0);
    }

    #[test]
    fn test_vend_advances() {
        let mut r = ring(1, 64);
        assert_eq!(r.vend_event_id(), 1);
        assert_eq!(r.vend_event_id(), 2);
        assert_eq!(r.last_event_id, 2);
    }

    #[test]
    fn test_final_destination_rule() {
        let r = ring(2, 64);
        // no successor: everything is dropped here
        assert!(r.is_final_destination_for(Priority(3), None));
        // successor reserved for strictly more important events
        assert!(r.is_final_destination_for(Priority(2), Some(Priority(3))));
        // successor also houses this priority: promote
        assert!(!r.is_final_destination_for(Priority(2), Some(Priority(2))));
        assert!(!r.is_final_destination_for(Priority(3), Some(Priority(3))));
    }

    #[test]
    fn test_note_event_initializes_first() {
        let mut r = ring(1, 64);
        r.note_event(1000);
        assert_eq!(r.first_event_ts, 1000);
        assert_eq!(r.last_event_ts, 1000);
        r.note_event(1500);
        assert_eq!(r.first_event_ts, 1000);
        assert_eq!(r.last_event_ts, 1500);
    }

    #[test]
    fn test_utc_latch() {
        let mut r = ring(1, 64);
        assert!(!r.utc_initialized);
        r.note_event_utc(5_000_000);
        assert!(r.utc_initialized);
        assert_eq!(r.first_event_utc, 5_000_000);
        r.note_event_utc(5_000_700);
        assert_eq!(r.first_event_utc, 5_000_000);
        assert_eq!(r.last_event_utc, 5_000_700);
    }

    #[test]
    fn test_drop_head_event_bookkeeping() {
        let mut r = ring(1, 64);
        r.buffer.push(&[0u8; 10]).unwrap();
        r.note_event(1000);
        let envelope = EventEnvelope {
            priority: Some(Priority(1)),
            delta_system: 250,
            delta_utc: 0,
            total_len: 10,
        };
        r.drop_head_event(&envelope);
        assert_eq!(r.first_event_id, 2);
        assert_eq!(r.first_event_ts, 1250);
        assert!(r.buffer.is_empty());
    }

    #[test]
    fn test_register_external_vends_range() {
        let mut r = ring(1, 64);
        let slot = r.register_external(|_, _| Ok(()), None, 5).unwrap();
        assert_eq!(r.external[slot].range.first_id, 1);
        assert_eq!(r.external[slot].range.last_id, 5);
        // next ordinary event id continues after the range
        assert_eq!(r.vend_event_id(), 6);
    }

    #[test]
    fn test_drop_head_skips_external_range() {
        let mut r = ring(1, 64);
        let _ = r.register_external(|_, _| Ok(()), None, 3).unwrap();
        r.buffer.push(&[0u8; 4]).unwrap();
        let envelope = EventEnvelope {
            priority: Some(Priority(1)),
            delta_system: 0,
            delta_utc: 0,
            total_len: 4,
        };
        r.drop_head_event(&envelope);
        // range 1..=3 skipped, then one ordinary event dropped
        assert_eq!(r.first_event_id, 5);
        // the slot was released
        assert!(r.external[0].fetch.is_none());
    }
}
