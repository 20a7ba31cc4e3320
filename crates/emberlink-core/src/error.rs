//! Error types for the alarm session engine.

/// Errors surfaced by the alarm engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AlarmError {
    /// A pool (sessions, message buffers, exchanges) is exhausted.
    #[error("out of memory: pool exhausted")]
    NoMemory,

    /// The output buffer cannot hold the serialized message.
    #[error("buffer too small")]
    BufferTooSmall,

    /// The input ended before the message was complete.
    #[error("message incomplete")]
    MessageIncomplete,

    /// The message declared a length this engine cannot represent.
    #[error("invalid message length")]
    InvalidMessageLength,

    /// An argument was rejected, e.g. an undersized signing key.
    #[error("invalid argument")]
    InvalidArgument,

    /// The object is not in a state that permits the operation.
    #[error("incorrect state for operation")]
    IncorrectState,

    /// The message arrived on an interface other than the configured one.
    #[error("no endpoint: interface mismatch")]
    NoEndpoint,

    /// An incoming payload exceeds the stored-message cap.
    #[error("message too long")]
    MessageTooLong,

    /// The secure random source failed.
    #[error("random data unavailable")]
    RandomDataUnavailable,

    /// The message layer refused a send.
    #[error("send failed")]
    SendFailed,
}
