//! Hush request and response messages.

use arrayvec::ArrayVec;
use hmac::{Hmac, Mac};
use sha1::Sha1;

use super::alarm::MAX_CONDITIONS;
use crate::condition::Condition;
use crate::error::AlarmError;

/// Length of an HMAC-SHA1 digest.
pub const HMAC_SHA1_LEN: usize = 20;

/// Key id applications fill into hush requests until a richer key scheme
/// lands.
pub const HUSH_KEY_ID: u16 = 0x0002;

/// Serialized hush-request length: proximity code, key id, digest.
pub const HUSH_REQUEST_LEN: usize = 4 + 2 + HMAC_SHA1_LEN;

/// Hush succeeded; the response's condition list is valid.
pub const HUSH_RESULT_SUCCESS: u8 = 0;

/// Status-report code: hush rejected, proximity verification failed.
pub const STATUS_HUSH_REJECTED_PROXIMITY: u16 = 4;

/// Status-report code: hush rejected, signature verification failed.
pub const STATUS_HUSH_REJECTED_SIGNATURE: u16 = 5;

const RESPONSE_BASE_LEN: usize = 2;

/// A keyed signature over a hush request.
///
/// Equality is only meaningful between signed instances: two signatures
/// compare equal iff both are signed, the key ids match, and the digests
/// match. An unsigned operand always compares unequal — including to
/// another unsigned signature — so callers must check signedness
/// explicitly rather than lean on `==`.
#[derive(Debug, Clone, Copy)]
pub struct HushSignature {
    signed: bool,
    /// Id of the signing key.
    pub key_id: u16,
    /// HMAC-SHA1 digest.
    pub digest: [u8; HMAC_SHA1_LEN],
}

impl HushSignature {
    /// An unsigned placeholder.
    pub fn unsigned() -> Self {
        Self {
            signed: false,
            key_id: 0,
            digest: [0u8; HMAC_SHA1_LEN],
        }
    }

    /// Whether this signature has been produced by `sign` or parsed off
    /// the wire.
    #[inline]
    pub fn is_signed(&self) -> bool {
        self.signed
    }
}

impl PartialEq for HushSignature {
    fn eq(&self, other: &Self) -> bool {
        if self.signed && other.signed && self.key_id == other.key_id {
            return self.digest == other.digest;
        }
        false
    }
}

impl Default for HushSignature {
    fn default() -> Self {
        Self::unsigned()
    }
}

/// A hush request: proximity proof plus a keyed signature.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HushRequest {
    /// Random 32-bit code delivered out of band by the originator,
    /// proving physical proximity.
    pub proximity_code: u32,
    /// Signature over the challenge and proximity code.
    pub signature: HushSignature,
}

impl HushRequest {
    /// Request carrying a proximity code, not yet signed.
    pub fn new(proximity_code: u32) -> Self {
        Self {
            proximity_code,
            signature: HushSignature::unsigned(),
        }
    }

    /// Signs the request: HMAC-SHA1 over `challenge || proximity_code`
    /// (both little-endian) with `key`.
    ///
    /// `min_key_size` is the engine's configured key-length floor
    /// (`AlarmConfig::hush_key_min_size`). HMAC silently right-pads
    /// shorter keys with zeros, collapsing distinct keys, so undersized
    /// keys are refused outright.
    ///
    /// # Errors
    ///
    /// [`AlarmError::InvalidArgument`] when `key` is shorter than
    /// `min_key_size`.
    pub fn sign(
        &mut self,
        challenge: u32,
        key_id: u16,
        key: &[u8],
        min_key_size: usize,
    ) -> Result<(), AlarmError> {
        if key.len() < min_key_size {
            return Err(AlarmError::InvalidArgument);
        }
        let mut mac =
            Hmac::<Sha1>::new_from_slice(key).map_err(|_| AlarmError::InvalidArgument)?;
        mac.update(&challenge.to_le_bytes());
        mac.update(&self.proximity_code.to_le_bytes());
        self.signature.digest.copy_from_slice(&mac.finalize().into_bytes());
        self.signature.key_id = key_id;
        self.signature.signed = true;
        Ok(())
    }

    /// Serializes the request.
    ///
    /// # Errors
    ///
    /// - [`AlarmError::BufferTooSmall`] when `out` is short.
    /// - [`AlarmError::IncorrectState`] when the request is unsigned.
    pub fn encode(&self, out: &mut [u8]) -> Result<usize, AlarmError> {
        if out.len() < HUSH_REQUEST_LEN {
            return Err(AlarmError::BufferTooSmall);
        }
        if !self.signature.signed {
            return Err(AlarmError::IncorrectState);
        }
        out[0..4].copy_from_slice(&self.proximity_code.to_le_bytes());
        out[4..6].copy_from_slice(&self.signature.key_id.to_le_bytes());
        out[6..6 + HMAC_SHA1_LEN].copy_from_slice(&self.signature.digest);
        Ok(HUSH_REQUEST_LEN)
    }

    /// Deserializes a request; the result is marked signed.
    ///
    /// # Errors
    ///
    /// [`AlarmError::MessageIncomplete`] when the payload is short.
    pub fn decode(payload: &[u8]) -> Result<HushRequest, AlarmError> {
        if payload.len() < HUSH_REQUEST_LEN {
            return Err(AlarmError::MessageIncomplete);
        }
        let mut digest = [0u8; HMAC_SHA1_LEN];
        digest.copy_from_slice(&payload[6..6 + HMAC_SHA1_LEN]);
        Ok(HushRequest {
            proximity_code: u32::from_le_bytes(payload[0..4].try_into().unwrap()),
            signature: HushSignature {
                signed: true,
                key_id: u16::from_le_bytes(payload[4..6].try_into().unwrap()),
                digest,
            },
        })
    }
}

/// A hush response: result code plus the post-hush condition list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HushResponse {
    /// Result code; [`HUSH_RESULT_SUCCESS`] or a profile status code.
    pub result: u8,
    /// Updated conditions, at most [`MAX_CONDITIONS`].
    pub conditions: ArrayVec<Condition, MAX_CONDITIONS>,
}

impl HushResponse {
    /// Builds a response from a result code and condition list.
    ///
    /// # Errors
    ///
    /// [`AlarmError::BufferTooSmall`] when more than [`MAX_CONDITIONS`]
    /// conditions are passed.
    pub fn new(result: u8, conditions: &[Condition]) -> Result<Self, AlarmError> {
        if conditions.len() > MAX_CONDITIONS {
            return Err(AlarmError::BufferTooSmall);
        }
        let mut list = ArrayVec::new();
        list.try_extend_from_slice(conditions)
            .map_err(|_| AlarmError::BufferTooSmall)?;
        Ok(Self {
            result,
            conditions: list,
        })
    }

    /// Serializes the response.
    ///
    /// # Errors
    ///
    /// [`AlarmError::BufferTooSmall`] when `out` is short.
    pub fn encode(&self, out: &mut [u8]) -> Result<usize, AlarmError> {
        let len = RESPONSE_BASE_LEN + self.conditions.len();
        if out.len() < len {
            return Err(AlarmError::BufferTooSmall);
        }
        out[0] = self.result;
        out[1] = self.conditions.len() as u8;
        for (slot, condition) in out[2..len].iter_mut().zip(&self.conditions) {
            *slot = condition.raw();
        }
        Ok(len)
    }

    /// Deserializes a response.
    ///
    /// # Errors
    ///
    /// - [`AlarmError::MessageIncomplete`] when the payload ends early.
    /// - [`AlarmError::InvalidMessageLength`] when more than
    ///   [`MAX_CONDITIONS`] conditions are declared.
    pub fn decode(payload: &[u8]) -> Result<HushResponse, AlarmError> {
        if payload.len() < RESPONSE_BASE_LEN {
            return Err(AlarmError::MessageIncomplete);
        }
        let result = payload[0];
        let declared = payload[1] as usize;
        if declared > MAX_CONDITIONS {
            return Err(AlarmError::InvalidMessageLength);
        }
        if payload.len() < RESPONSE_BASE_LEN + declared {
            return Err(AlarmError::MessageIncomplete);
        }
        let mut conditions = ArrayVec::new();
        for &raw in &payload[2..2 + declared] {
            conditions.push(Condition(raw));
        }
        Ok(HushResponse { result, conditions })
    }
}
