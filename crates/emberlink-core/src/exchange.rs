//! Message-layer seam.
//!
//! Wire framing, exchange multiplexing, and Trickle retransmission live in
//! the transport below this engine. The engine drives them through
//! [`ExchangeLayer`] and never holds anything heavier than an integer
//! handle. The transport, in turn, feeds received messages into
//! `AlarmServer::handle_message` and reports Trickle staleness through
//! `AlarmServer::handle_retransmit_timeout`.

use crate::error::AlarmError;

/// A node identifier on the fabric.
pub type NodeId = u64;

/// The broadcast/any node id: messages address every node.
pub const ANY_NODE_ID: NodeId = u64::MAX;

/// Opaque network interface identifier.
pub type InterfaceId = u64;

/// Handle to an open exchange in the message layer.
pub type ExchangeId = u32;

/// Alarm profile message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AlarmMessageType {
    /// Alarm dissemination message, originator to all nodes.
    Alarm = 1,
    /// Hush request.
    HushRequest = 4,
    /// Hush response.
    HushResponse = 5,
}

impl AlarmMessageType {
    /// Decodes a wire message type.
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Alarm),
            4 => Some(Self::HushRequest),
            5 => Some(Self::HushResponse),
            _ => None,
        }
    }
}

/// Link-level facts about a received packet.
#[derive(Debug, Clone, Copy, Default)]
pub struct PacketInfo {
    /// Interface the packet arrived on, when known.
    pub interface: Option<InterfaceId>,
}

/// Message-layer facts about a received message.
#[derive(Debug, Clone, Copy)]
pub struct MessageInfo {
    /// Node that sent the message.
    pub source_node_id: NodeId,
    /// Encryption type the message used.
    pub encryption_type: u8,
    /// Key the message was protected with.
    pub key_id: u16,
}

/// Trickle retransmission parameters for one exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrickleConfig {
    /// Interval `T` in milliseconds.
    pub rebroadcast_period_ms: u32,
    /// Redundancy constant `k`.
    pub rebroadcast_threshold: u8,
    /// Staleness timeout: when it elapses without a refresh, the layer
    /// reports a retransmission timeout.
    pub timeout_ms: u32,
}

/// Send behavior flags, bit-or combinable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendFlags(u16);

impl SendFlags {
    /// No special behavior.
    pub const NONE: SendFlags = SendFlags(0);
    /// Retransmit under Trickle until cancelled.
    pub const RETRANSMIT_TRICKLE: SendFlags = SendFlags(1 << 0);
    /// Delay the first transmission by a random Trickle offset.
    pub const DELAY_SEND: SendFlags = SendFlags(1 << 1);
    /// Keep the message id of the copied original.
    pub const REUSE_MESSAGE_ID: SendFlags = SendFlags(1 << 2);
    /// Keep the source id of the copied original.
    pub const REUSE_SOURCE_ID: SendFlags = SendFlags(1 << 3);
    /// Mark the exchange header as initiator-sent.
    pub const FROM_INITIATOR: SendFlags = SendFlags(1 << 4);

    /// Whether every flag in `other` is set.
    #[must_use]
    pub fn contains(self, other: SendFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for SendFlags {
    type Output = SendFlags;

    fn bitor(self, rhs: SendFlags) -> SendFlags {
        SendFlags(self.0 | rhs.0)
    }
}

/// Parameters applied when opening an exchange.
#[derive(Debug, Clone, Copy)]
pub struct ExchangeBinding {
    /// Encryption type for messages on the exchange.
    pub encryption_type: u8,
    /// Key id for messages on the exchange.
    pub key_id: u16,
    /// Interface the exchange sends through, when pinned.
    pub interface: Option<InterfaceId>,
    /// Deliver duplicate messages instead of filtering them; alarm
    /// sessions count duplicates for Trickle suppression.
    pub allow_duplicate_msgs: bool,
}

/// Common-profile status codes used in status reports.
pub mod common_status {
    /// Request understood and executed.
    pub const SUCCESS: u16 = 0;
    /// Another delegated operation is in flight.
    pub const BUSY: u16 = 1;
    /// The message type is not handled here.
    pub const UNSUPPORTED_MESSAGE: u16 = 2;
    /// The message arrived with no handler configured.
    pub const UNEXPECTED_MESSAGE: u16 = 3;
    /// The request failed to parse.
    pub const BAD_REQUEST: u16 = 4;

    /// Profile id status reports are issued under.
    pub const PROFILE_ID: u32 = 0;
}

/// The message layer as seen by the alarm engine.
///
/// All methods are synchronous and non-blocking; the layer owns its own
/// buffering and copies payloads on `send`.
pub trait ExchangeLayer {
    /// Opens an exchange addressed to `peer` (use [`ANY_NODE_ID`] for the
    /// alarm multicast group). `None` means the layer is out of exchange
    /// contexts.
    fn open(&mut self, peer: NodeId, binding: ExchangeBinding) -> Option<ExchangeId>;

    /// Closes an exchange, cancelling any retransmission attached to it.
    fn close(&mut self, exchange: ExchangeId);

    /// Installs Trickle parameters on an exchange. Must precede the send
    /// it governs.
    fn setup_trickle(
        &mut self,
        exchange: ExchangeId,
        config: TrickleConfig,
    ) -> Result<(), AlarmError>;

    /// Sends a message on an exchange.
    fn send(
        &mut self,
        exchange: ExchangeId,
        message_type: AlarmMessageType,
        payload: &[u8],
        flags: SendFlags,
    ) -> Result<(), AlarmError>;

    /// Stops Trickle retransmission on an exchange.
    fn cancel_retransmit(&mut self, exchange: ExchangeId);

    /// Counts a received duplicate against the exchange's Trickle
    /// suppression threshold.
    fn note_duplicate(&mut self, exchange: ExchangeId);

    /// Sends a status report on an exchange.
    fn send_status_report(
        &mut self,
        exchange: ExchangeId,
        profile_id: u32,
        status_code: u16,
    ) -> Result<(), AlarmError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_flags_combine() {
        let flags = SendFlags::RETRANSMIT_TRICKLE | SendFlags::DELAY_SEND;
        assert!(flags.contains(SendFlags::RETRANSMIT_TRICKLE));
        assert!(flags.contains(SendFlags::DELAY_SEND));
        assert!(!flags.contains(SendFlags::REUSE_MESSAGE_ID));
    }

    #[test]
    fn test_message_type_wire_codes() {
        assert_eq!(AlarmMessageType::from_wire(1), Some(AlarmMessageType::Alarm));
        assert_eq!(
            AlarmMessageType::from_wire(4),
            Some(AlarmMessageType::HushRequest)
        );
        assert_eq!(
            AlarmMessageType::from_wire(5),
            Some(AlarmMessageType::HushResponse)
        );
        // deprecated AlarmUpdate/AlarmAck types are not handled
        assert_eq!(AlarmMessageType::from_wire(2), None);
        assert_eq!(AlarmMessageType::from_wire(3), None);
    }
}
