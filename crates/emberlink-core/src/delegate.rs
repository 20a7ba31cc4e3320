//! Application delegate surface.

use std::cmp::Ordering;

use crate::error::AlarmError;
use crate::exchange::ExchangeId;
use crate::message::{Alarm, HushSignature};
use crate::session::Session;

/// Application-level hooks the alarm engine calls into.
///
/// The engine keeps running the protocol whether or not the hooks do
/// anything; the delegate is how alarm state reaches the product layer
/// (sirens, spoken announcements, UX).
pub trait AlarmDelegate {
    /// A session changed state. The session still carries its originator
    /// and alarm contents, including on the transition to `Closed`.
    fn on_session_state_change(&mut self, session: &Session);

    /// A new remote alarm could not be admitted (parse failure or pool
    /// pressure without an evictable victim) and was dropped.
    fn on_new_remote_alarm_dropped(&mut self, alarm: &Alarm);

    /// A hush request arrived with no other hush operation in flight.
    ///
    /// The application must answer on the engine via
    /// `send_hush_response` or `send_status_report`, either of which
    /// closes the exchange. Returning an error makes the engine close the
    /// exchange without a reply.
    fn on_hush_request(
        &mut self,
        exchange: ExchangeId,
        proximity_code: u32,
        signature: &HushSignature,
    ) -> Result<(), AlarmError>;

    /// Total order over alarms by severity, domain-defined.
    /// `Ordering::Less` means `a` is less severe than `b`.
    fn compare_severity(&mut self, a: &Alarm, b: &Alarm) -> Ordering;
}
