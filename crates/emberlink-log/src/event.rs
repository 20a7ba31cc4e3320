//! Event model: priorities, schemas, options, and the record envelope.

/// Identifier of a logged event. IDs are vended per priority by the owning
/// ring's counter and increase strictly within that priority.
pub type EventId = u32;

/// Milliseconds since boot, as carried by system timestamps.
pub type SystemTimestamp = u32;

/// Milliseconds since the UNIX epoch, as carried by UTC timestamps.
pub type UtcTimestamp = u64;

/// Event priority. `Priority(1)` is the lowest; rings are ordered from
/// lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(pub u8);

/// Context tags used inside the event record envelope.
pub mod tag {
    /// Event priority, u16.
    pub const PRIORITY: u8 = 1;
    /// Event id, u64; present only on the first event of a retrieval
    /// window.
    pub const EVENT_ID: u8 = 2;
    /// Related event priority, u16.
    pub const RELATED_PRIORITY: u8 = 3;
    /// Related event id, u64.
    pub const RELATED_ID: u8 = 4;
    /// Absolute system timestamp, u32.
    pub const SYSTEM_TIMESTAMP: u8 = 5;
    /// Absolute UTC timestamp, u64.
    pub const UTC_TIMESTAMP: u8 = 6;
    /// Delta system time from the previous same-priority event, i32.
    pub const DELTA_SYSTEM_TIME: u8 = 7;
    /// Delta UTC time from the previous same-priority event, i64.
    pub const DELTA_UTC_TIME: u8 = 8;
    /// Trait profile id, u32 scalar or array.
    pub const PROFILE_ID: u8 = 9;
    /// Resource id of a non-local source, u64.
    pub const RESOURCE_ID: u8 = 10;
    /// Trait instance id of a non-local source, u64.
    pub const TRAIT_INSTANCE_ID: u8 = 11;
    /// Event type, u32.
    pub const EVENT_TYPE: u8 = 12;
    /// Caller-written event payload.
    pub const EVENT_DATA: u8 = 13;
}

/// Schema of an event: where it sorts, and how its payload is to be
/// interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventSchema {
    /// Priority governing admission, storage ring, and retrieval.
    pub priority: Priority,
    /// Trait profile the payload belongs to.
    pub profile_id: u32,
    /// Structure type within the profile.
    pub event_type: u32,
    /// Schema version of the payload.
    pub data_version: u32,
    /// Oldest schema version the payload is compatible with.
    pub min_compatible_version: u32,
}

impl EventSchema {
    /// Schema with both versions at 1, which encodes the profile id as a
    /// plain scalar.
    pub fn new(priority: Priority, profile_id: u32, event_type: u32) -> Self {
        Self {
            priority,
            profile_id,
            event_type,
            data_version: 1,
            min_compatible_version: 1,
        }
    }
}

/// Timestamp attached to an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventTimestamp {
    /// Milliseconds since boot.
    System(SystemTimestamp),
    /// Milliseconds since the UNIX epoch.
    Utc(UtcTimestamp),
}

/// Source of an event that did not originate on this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventSource {
    /// Resource that produced the event.
    pub resource_id: u64,
    /// Trait instance on that resource.
    pub trait_instance_id: u64,
}

/// Per-event options supplied by the caller.
#[derive(Debug, Clone, Copy)]
pub struct EventOptions {
    /// Event timestamp. The engine never reads a clock; the caller supplies
    /// the current time here.
    pub timestamp: EventTimestamp,
    /// Event this one relates to, if any. A related id of 0 means
    /// unrelated.
    pub related: Option<(Priority, EventId)>,
    /// Source, when the event did not originate locally.
    pub source: Option<EventSource>,
    /// Request an immediate offload pass after this event is committed.
    pub urgent: bool,
}

impl EventOptions {
    /// Options carrying only a system timestamp.
    pub fn at(timestamp: SystemTimestamp) -> Self {
        Self {
            timestamp: EventTimestamp::System(timestamp),
            related: None,
            source: None,
            urgent: false,
        }
    }

    /// Options carrying a UTC timestamp.
    pub fn at_utc(timestamp: UtcTimestamp) -> Self {
        Self {
            timestamp: EventTimestamp::Utc(timestamp),
            related: None,
            source: None,
            urgent: false,
        }
    }
}

/// Envelope fields pulled out of a stored record: just enough to route
/// eviction and retrieval decisions.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct EventEnvelope {
    pub priority: Option<Priority>,
    pub delta_system: i32,
    pub delta_utc: i64,
    /// Total encoded length of the record, header included.
    pub total_len: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority(1) < Priority(2));
        assert!(Priority(3) > Priority(2));
    }

    #[test]
    fn test_schema_defaults_scalar_profile() {
        let schema = EventSchema::new(Priority(1), 0x235A, 7);
        assert_eq!(schema.data_version, 1);
        assert_eq!(schema.min_compatible_version, 1);
    }
}
