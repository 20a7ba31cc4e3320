//! Engine configuration.

use crate::exchange::InterfaceId;

/// Default Trickle interval `T`, in milliseconds.
pub const DEFAULT_REBROADCAST_PERIOD_MS: u32 = 3_000;

/// Default Trickle redundancy constant `k`: receptions required to
/// suppress a retransmission within one interval.
pub const DEFAULT_REBROADCAST_THRESHOLD: u8 = 6;

/// Default refresh period: how often the originator must refresh an alarm
/// before it is considered stale.
pub const DEFAULT_REFRESH_PERIOD_MS: u32 = 30_000;

/// Default grace period for remote sessions after the last receipt.
pub const DEFAULT_GRACE_PERIOD_MS: u32 = 30_000;

/// Maximum number of hops an alarm is expected to traverse; drives the
/// linger duration of remote sessions.
pub const DEFAULT_MAX_HOPS: u32 = 4;

/// Default session pool size.
pub const DEFAULT_MAX_SESSIONS: usize = 10;

/// Hard cap on the stored payload of an incoming alarm message.
pub const MAX_INCOMING_ALARM_SIZE: usize = 64;

/// Maximum forward distance for the legacy 8-bit alarm counter: half the
/// counter space.
pub const FORWARD_COUNTER_DISTANCE_LIMIT: u8 = u8::MAX / 2;

/// Default minimum hush-signing-key length. HMAC silently right-pads
/// shorter keys with zeros, which collapses distinct keys; a fixed floor
/// avoids that trap.
pub const DEFAULT_HUSH_KEY_MIN_SIZE: usize = 16;

/// Runtime parameters of the alarm engine.
///
/// The timing values must be the same on every node in the network.
#[derive(Debug, Clone)]
pub struct AlarmConfig {
    /// Trickle interval `T` in milliseconds.
    pub rebroadcast_period_ms: u32,
    /// Trickle suppression threshold `k`.
    pub rebroadcast_threshold: u8,
    /// Maximum time between local refreshes; staleness threshold for
    /// remotes.
    pub refresh_period_ms: u32,
    /// Time a remote session stays available after its last receipt.
    pub grace_period_ms: u32,
    /// Linger multiplier for remote sessions.
    pub max_hops: u32,
    /// Session pool size.
    pub max_concurrent_sessions: usize,
    /// Stored-payload cap for incoming alarms.
    pub max_incoming_alarm_size: usize,
    /// Freshness window for legacy v1 counters.
    pub forward_counter_distance_limit: u8,
    /// Minimum length accepted for hush signing keys.
    pub hush_key_min_size: usize,
    /// Accept alarm packets only from this interface, when set.
    pub interface: Option<InterfaceId>,
}

impl Default for AlarmConfig {
    fn default() -> Self {
        Self {
            rebroadcast_period_ms: DEFAULT_REBROADCAST_PERIOD_MS,
            rebroadcast_threshold: DEFAULT_REBROADCAST_THRESHOLD,
            refresh_period_ms: DEFAULT_REFRESH_PERIOD_MS,
            grace_period_ms: DEFAULT_GRACE_PERIOD_MS,
            max_hops: DEFAULT_MAX_HOPS,
            max_concurrent_sessions: DEFAULT_MAX_SESSIONS,
            max_incoming_alarm_size: MAX_INCOMING_ALARM_SIZE,
            forward_counter_distance_limit: FORWARD_COUNTER_DISTANCE_LIMIT,
            hush_key_min_size: DEFAULT_HUSH_KEY_MIN_SIZE,
            interface: None,
        }
    }
}

impl AlarmConfig {
    /// Message-buffer pool size: one buffer per session, plus one so an
    /// admission decision can inspect a candidate without evicting first.
    pub fn max_concurrent_messages(&self) -> usize {
        self.max_concurrent_sessions + 1
    }
}
