//! Wire codecs for the alarm profile.
//!
//! All multi-byte integers are little-endian. The alarm message exists in
//! two generations: the v1 prefix every peer understands, and the v2 tail
//! (session id plus extended sequence number) appended by current
//! originators. Presence of the tail is inferred from payload length.

mod alarm;
mod hush;

pub use alarm::{Alarm, SessionTag, MAX_CONDITIONS, V1_BASE_LEN, V2_BASE_LEN};
pub use hush::{
    HushRequest, HushResponse, HushSignature, HMAC_SHA1_LEN, HUSH_KEY_ID, HUSH_REQUEST_LEN,
    HUSH_RESULT_SUCCESS, STATUS_HUSH_REJECTED_PROXIMITY, STATUS_HUSH_REJECTED_SIGNATURE,
};
