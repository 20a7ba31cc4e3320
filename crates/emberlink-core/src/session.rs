//! Per-originator alarm session state.
//!
//! A session is one epoch of alarm traffic from a single originator,
//! local or remote. The struct here is deliberately inert — plain state
//! plus read accessors. The behavior (transitions, timers, sends) lives
//! on `AlarmServer`, which addresses sessions by pool index; nothing in a
//! session points back at the server or the exchange layer.

use crate::exchange::{ExchangeId, NodeId, ANY_NODE_ID};
use crate::message::Alarm;
use crate::pool::MsgBuffer;

/// Lifecycle states of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// No active state; the slot is free for allocation.
    #[default]
    Closed,
    /// Actively (re-)transmitting; the alarm is fresh.
    Active,
    /// The alarm went stale but the session still accepts delayed
    /// messages of the same session id. Remote sessions only.
    GracePeriod,
    /// Terminal hold preventing collision between two consecutive
    /// sessions from the same originator.
    Linger,
}

impl SessionState {
    /// Human-readable state name for logs.
    pub fn name(self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Active => "ACTIVE",
            Self::GracePeriod => "GRACE",
            Self::Linger => "LINGER",
        }
    }
}

/// One slot in the session pool.
#[derive(Debug, Default)]
pub struct Session {
    pub(crate) current_alarm: Alarm,
    pub(crate) state: SessionState,
    pub(crate) is_local: bool,
    pub(crate) exchange: Option<ExchangeId>,
    pub(crate) peer: NodeId,
    pub(crate) buffer: Option<MsgBuffer>,
    pub(crate) grace_timer: Option<u64>,
    pub(crate) linger_timer: Option<u64>,
}

impl Session {
    /// Resets the slot for reuse.
    pub(crate) fn reset(&mut self) {
        self.current_alarm = Alarm::default();
        self.state = SessionState::Closed;
        self.is_local = false;
        self.exchange = None;
        self.peer = ANY_NODE_ID;
        self.buffer = None;
        self.grace_timer = None;
        self.linger_timer = None;
    }

    /// Current lifecycle state.
    #[inline]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether this node originated the alarm.
    #[inline]
    pub fn is_local(&self) -> bool {
        self.is_local
    }

    /// The alarm message this session currently carries.
    #[inline]
    pub fn current_alarm(&self) -> &Alarm {
        &self.current_alarm
    }

    /// Node id of the originator. For local sessions the peer is the
    /// any-node multicast id, so the caller's own id is reported.
    pub fn originator(&self, local_node_id: NodeId) -> NodeId {
        if self.exchange.is_none() {
            return 0;
        }
        if self.peer == ANY_NODE_ID {
            local_node_id
        } else {
            self.peer
        }
    }

    /// Spoken-location id of the originator.
    #[inline]
    pub fn originator_where(&self) -> u8 {
        self.current_alarm.where_id
    }

    /// Exchange handle, when the session is bound to one.
    #[inline]
    pub fn exchange(&self) -> Option<ExchangeId> {
        self.exchange
    }
}
