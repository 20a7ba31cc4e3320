//! The alarm dissemination message.

use arrayvec::ArrayVec;

use crate::condition::{Condition, Source, State};
use crate::error::AlarmError;

/// Maximum number of conditions an alarm message carries, v1 and v2 alike.
pub const MAX_CONDITIONS: usize = 8;

/// v1 payload size without conditions: counter, length, where.
pub const V1_BASE_LEN: usize = 3;

/// v2 payload size without conditions: v1 plus session id and extended
/// event sequence number.
pub const V2_BASE_LEN: usize = V1_BASE_LEN + 8;

/// The v2 session tail: a random per-epoch session id and a 32-bit
/// sequence number monotone within the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTag {
    /// Random session identifier, regenerated per originator epoch.
    pub session_id: u32,
    /// Extended event sequence number; its low byte mirrors `alarm_ctr`.
    pub ext_evt_sn: u32,
}

/// An alarm message: the current set of conditions at one originator.
///
/// Equality compares the spoken location and the condition list only; the
/// counter and session tail identify *when*, not *what*.
#[derive(Debug, Clone, Default)]
pub struct Alarm {
    /// Legacy 8-bit freshness counter.
    pub alarm_ctr: u8,
    /// Conditions, at most [`MAX_CONDITIONS`].
    pub conditions: ArrayVec<Condition, MAX_CONDITIONS>,
    /// Spoken-location id of the originator.
    pub where_id: u8,
    /// v2 session tail; `None` on legacy messages. Newly composed alarms
    /// must carry it.
    pub session: Option<SessionTag>,
}

impl PartialEq for Alarm {
    fn eq(&self, other: &Self) -> bool {
        self.where_id == other.where_id && self.conditions == other.conditions
    }
}

impl Alarm {
    /// Condition at index `i`, or `None` past the list.
    pub fn condition(&self, i: usize) -> Option<Condition> {
        self.conditions.get(i).copied()
    }

    /// State nibble of condition `i`.
    pub fn state_of(&self, i: usize) -> Option<State> {
        self.condition(i).and_then(Condition::state)
    }

    /// Source nibble of condition `i`.
    pub fn source_of(&self, i: usize) -> Option<Source> {
        self.condition(i).and_then(Condition::source)
    }

    /// Replaces condition `i` wholesale; out of range is a no-op.
    pub fn set_condition(&mut self, i: usize, condition: Condition) {
        if let Some(slot) = self.conditions.get_mut(i) {
            *slot = condition;
        }
    }

    /// Replaces the state of condition `i`, keeping its source.
    pub fn set_state(&mut self, i: usize, state: State) {
        if let Some(slot) = self.conditions.get_mut(i) {
            *slot = slot.with_state(state);
        }
    }

    /// Replaces the source of condition `i`, keeping its state.
    pub fn set_source(&mut self, i: usize, source: Source) {
        if let Some(slot) = self.conditions.get_mut(i) {
            *slot = slot.with_source(source);
        }
    }

    /// Appends a condition; silently full at capacity.
    pub fn push_condition(&mut self, condition: Condition) {
        let _ = self.conditions.try_push(condition);
    }

    /// Whether the alarm still merits epidemic rebroadcast: true iff any
    /// condition is in a non-quiescent state.
    pub fn keep_rebroadcasting(&self) -> bool {
        self.conditions
            .iter()
            .any(|c| c.state().map_or(true, |s| !s.is_quiescent()))
    }

    /// Serialized length of this alarm as a v2 message.
    pub fn encoded_len(&self) -> usize {
        V2_BASE_LEN + self.conditions.len()
    }

    /// Serializes the alarm into `out`, returning the byte count.
    ///
    /// All newly composed alarms carry the v2 tail, so a missing session
    /// tag is a usage error.
    ///
    /// # Errors
    ///
    /// - [`AlarmError::BufferTooSmall`] when `out` cannot hold the
    ///   message.
    /// - [`AlarmError::IncorrectState`] when no session tag is present.
    pub fn encode(&self, out: &mut [u8]) -> Result<usize, AlarmError> {
        let len = self.encoded_len();
        if out.len() < len {
            return Err(AlarmError::BufferTooSmall);
        }
        let Some(session) = self.session else {
            return Err(AlarmError::IncorrectState);
        };

        out[0] = self.alarm_ctr;
        out[1] = self.conditions.len() as u8;
        let mut at = 2;
        for condition in &self.conditions {
            out[at] = condition.raw();
            at += 1;
        }
        out[at] = self.where_id;
        at += 1;
        out[at..at + 4].copy_from_slice(&session.session_id.to_le_bytes());
        at += 4;
        out[at..at + 4].copy_from_slice(&session.ext_evt_sn.to_le_bytes());
        at += 4;
        Ok(at)
    }

    /// Deserializes an alarm message.
    ///
    /// The v1 prefix is mandatory; the v2 tail is read iff the payload is
    /// long enough to hold it, otherwise the result carries no session
    /// tag and legacy counter semantics apply.
    ///
    /// # Errors
    ///
    /// - [`AlarmError::MessageIncomplete`] when the payload ends early.
    /// - [`AlarmError::InvalidMessageLength`] when more than
    ///   [`MAX_CONDITIONS`] conditions are declared.
    pub fn decode(payload: &[u8]) -> Result<Alarm, AlarmError> {
        if payload.len() < V1_BASE_LEN {
            return Err(AlarmError::MessageIncomplete);
        }
        let alarm_ctr = payload[0];
        let declared = payload[1] as usize;
        if payload.len() < V1_BASE_LEN + declared {
            return Err(AlarmError::MessageIncomplete);
        }
        if declared > MAX_CONDITIONS {
            return Err(AlarmError::InvalidMessageLength);
        }

        let mut conditions = ArrayVec::new();
        for &raw in &payload[2..2 + declared] {
            conditions.push(Condition(raw));
        }
        let where_id = payload[2 + declared];

        let session = if payload.len() >= V2_BASE_LEN + declared {
            let at = V1_BASE_LEN + declared;
            let session_id = u32::from_le_bytes(payload[at..at + 4].try_into().unwrap());
            let ext_evt_sn = u32::from_le_bytes(payload[at + 4..at + 8].try_into().unwrap());
            if alarm_ctr != (ext_evt_sn & 0xFF) as u8 {
                tracing::warn!(alarm_ctr, ext_evt_sn, "alarm counter does not mirror sequence");
            }
            Some(SessionTag {
                session_id,
                ext_evt_sn,
            })
        } else {
            None
        };

        Ok(Alarm {
            alarm_ctr,
            conditions,
            where_id,
            session,
        })
    }

    /// Logs each condition at debug level, the way operators read traces.
    pub fn log_detail(&self) {
        for (i, condition) in self.conditions.iter().enumerate() {
            tracing::debug!(
                seq = self.session.map_or(u32::from(self.alarm_ctr), |s| s.ext_evt_sn),
                index = i,
                raw = format_args!("{:#04X}", condition.raw()),
                source = condition.source().map_or("unknown", Source::name),
                state = condition.state().map_or("unknown", State::name),
            );
        }
    }
}
