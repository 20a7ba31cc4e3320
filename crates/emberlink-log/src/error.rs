//! Error types for the event log engine.

/// Errors surfaced by the event log engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LogError {
    /// A transient out-of-space condition inside a ring; callers retry with
    /// a larger reservation before this becomes [`LogError::BufferTooSmall`].
    #[error("out of memory in event ring")]
    NoMemory,

    /// The request can never be satisfied, e.g. a single event larger than
    /// the ring it must land in.
    #[error("buffer too small for request")]
    BufferTooSmall,

    /// An argument was rejected (null callback, zero event count, unknown
    /// priority).
    #[error("invalid argument")]
    InvalidArgument,

    /// The engine is not in a state that permits the operation.
    #[error("incorrect state for operation")]
    IncorrectState,

    /// Stored bytes failed to decode as an event record.
    #[error("malformed event record in ring")]
    MalformedRecord,

    /// The output writer ran out of space mid-record; the writer has been
    /// rolled back to the last whole-event boundary and more events remain.
    #[error("end of stream: output writer exhausted")]
    EndOfStream,

    /// All external-event slots of the target ring are in use.
    #[error("no free external event slot")]
    OutOfSlots,
}
