//! # Emberlink Core
//!
//! The alarm session engine for interconnected safety devices on a
//! mesh/link-local network. Devices cooperatively disseminate alarm
//! conditions, converge on shared state through Trickle-style epidemic
//! rebroadcast, and accept authenticated hush requests.
//!
//! ## Architecture
//!
//! ```text
//!              ┌────────────────────────┐
//!  incoming ──►│     AlarmServer        │◄── message layer (ExchangeLayer)
//!  messages    │  dispatcher + pool     │
//!              └─────┬──────────┬───────┘
//!                    │          │
//!           matches  │          │ no match → admit / evict
//!                    ▼          ▼
//!              [Session × N]  severity-based admission
//!                    │
//!                    ▼
//!              AlarmDelegate (application)
//! ```
//!
//! Each [`AlarmServer`] tracks one logical alarm session per originator in
//! a fixed pool. Sessions replay-suppress via random session ids, drive
//! Trickle rebroadcast through the [`ExchangeLayer`] seam, and wind down
//! through grace and linger holds. All pools are sized at construction;
//! steady-state operation performs no heap allocation.
//!
//! The engine is single-threaded and host-driven: the message layer feeds
//! [`AlarmServer::handle_message`] and [`AlarmServer::handle_retransmit_timeout`],
//! and the worker loop calls [`AlarmServer::poll_timers`] with the current
//! time.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]

mod condition;
mod config;
mod delegate;
mod error;
mod exchange;
mod message;
mod pool;
mod random;
mod server;
mod session;
mod timer;

pub use condition::{Condition, Source, State};
pub use config::{
    AlarmConfig, DEFAULT_GRACE_PERIOD_MS, DEFAULT_HUSH_KEY_MIN_SIZE, DEFAULT_MAX_HOPS,
    DEFAULT_MAX_SESSIONS, DEFAULT_REBROADCAST_PERIOD_MS, DEFAULT_REBROADCAST_THRESHOLD,
    DEFAULT_REFRESH_PERIOD_MS, FORWARD_COUNTER_DISTANCE_LIMIT, MAX_INCOMING_ALARM_SIZE,
};
pub use delegate::AlarmDelegate;
pub use error::AlarmError;
pub use exchange::{
    common_status, AlarmMessageType, ExchangeBinding, ExchangeId, ExchangeLayer, InterfaceId,
    MessageInfo, NodeId, PacketInfo, SendFlags, TrickleConfig, ANY_NODE_ID,
};
pub use message::{
    Alarm, HushRequest, HushResponse, HushSignature, SessionTag, HMAC_SHA1_LEN, HUSH_KEY_ID,
    HUSH_REQUEST_LEN, HUSH_RESULT_SUCCESS, MAX_CONDITIONS, STATUS_HUSH_REJECTED_PROXIMITY,
    STATUS_HUSH_REJECTED_SIGNATURE, V1_BASE_LEN, V2_BASE_LEN,
};
pub use pool::{MsgBuffer, MsgBufferPool, MAX_POOL_SESSIONS};
pub use random::{OsRandom, RandomSource};
pub use server::AlarmServer;
pub use session::{Session, SessionState};
pub use timer::{FiredTimers, TimerEvent, TimerKind, TimerRegistration, TimerService};

/// Result alias for alarm-engine operations.
pub type Result<T> = std::result::Result<T, AlarmError>;
