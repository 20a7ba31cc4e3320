//! # Emberlink Event Log
//!
//! A bounded, priority-aware in-memory event log for resource-constrained
//! devices.
//!
//! Events are TLV-encoded into a stack of circular byte rings ordered from
//! lowest to highest priority. Writes always land in the lowest ring; under
//! pressure the engine reclaims space from ring heads, dropping records
//! whose final destination is the overflowing ring and promoting records
//! bound for higher rings. Timestamps are delta-compressed per priority and
//! re-synthesized to absolutes during retrieval.
//!
//! ## Design
//!
//! - **Fixed footprint**: every ring is sized at construction; steady-state
//!   operation performs no heap allocation.
//! - **Single-writer discipline**: one short critical section guards the
//!   log interior; throttling and the upload latch are lone atomics usable
//!   from interrupt-like contexts.
//! - **Checkpointed writes**: a failed or short write restores the ring
//!   byte-identically before retrying with a larger reservation.
//!
//! ## Example
//!
//! ```rust
//! use emberlink_log::{
//!     tag, EventLog, EventOptions, EventSchema, LogConfig, Priority, RingConfig,
//! };
//!
//! let log = EventLog::new(
//!     vec![
//!         RingConfig::new(Priority(1), 1024),
//!         RingConfig::new(Priority(2), 512),
//!     ],
//!     LogConfig::default(),
//! )
//! .unwrap();
//!
//! let schema = EventSchema::new(Priority(1), 0x235A, 1);
//! let id = log.log_event(&schema, &EventOptions::at(1_000), |w| {
//!     w.put_bytes(Some(tag::EVENT_DATA), b"door opened")
//! });
//! assert_eq!(id, 1);
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]

mod buffer;
mod counter;
mod engine;
mod error;
mod event;
mod external;
mod flush;
mod ring;
mod tlv;

pub use buffer::RingConfig;
pub use counter::{InMemoryCounter, MonotonicCounter};
pub use engine::{EventLog, EventWriter, FetchContext, LogConfig, EVENT_SIZE_RESERVE};
pub use error::LogError;
pub use event::{
    tag, EventId, EventOptions, EventSchema, EventSource, EventTimestamp, Priority,
    SystemTimestamp, UtcTimestamp,
};
pub use external::{
    ExternalEventsHandle, ExternalRange, FetchExternalEventsFn, NotifyAction,
    NotifyExternalEventsFn, EXTERNAL_EVENT_SLOTS,
};
pub use flush::{BulkUploader, FlushConfig, FlushState, SubscriberPositions};
pub use ring::{CircularTlvBuffer, RingCheckpoint, RingSink, RingSource};
pub use tlv::{
    ContainerHandle, Element, ElementKind, SliceSink, TlvReader, TlvSink, TlvSource, TlvWriter,
};

/// Result alias for log-engine operations.
pub type Result<T> = std::result::Result<T, LogError>;
