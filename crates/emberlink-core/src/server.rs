//! The alarm server: session pool, dispatcher, and lifecycle driver.
//!
//! One server instance runs per node. Every incoming alarm-profile message
//! funnels through [`AlarmServer::handle_message`]; the server does its own
//! session matching (the session-id mechanism can invalidate any dispatch
//! decision the message layer made), admits or evicts under pool pressure,
//! and drives each session's Trickle, grace, and linger timing.
//!
//! Sessions are addressed by pool index everywhere. Behavior lives here;
//! the [`Session`] struct itself is inert state.

use std::cmp::Ordering;

use crate::config::AlarmConfig;
use crate::delegate::AlarmDelegate;
use crate::error::AlarmError;
use crate::exchange::{
    common_status, AlarmMessageType, ExchangeBinding, ExchangeId, ExchangeLayer, MessageInfo,
    NodeId, PacketInfo, SendFlags, TrickleConfig,
};
use crate::message::{Alarm, HushRequest, HushResponse, SessionTag};
use crate::pool::{MsgBufferPool, MAX_POOL_SESSIONS};
use crate::random::RandomSource;
use crate::session::{Session, SessionState};
use crate::timer::{TimerEvent, TimerKind, TimerService};
use crate::condition::Condition;

/// The alarm protocol engine for one node.
pub struct AlarmServer<D: AlarmDelegate, X: ExchangeLayer> {
    config: AlarmConfig,
    local_node_id: NodeId,
    sessions: Vec<Session>,
    buffers: MsgBufferPool,
    timers: TimerService,
    delegate: D,
    exchange: X,
    random: Box<dyn RandomSource>,
    current_hush_op: Option<ExchangeId>,
}

impl<D: AlarmDelegate, X: ExchangeLayer> AlarmServer<D, X> {
    /// Builds the server with its session and buffer pools fully
    /// allocated. No allocation happens after this point.
    pub fn new(
        config: AlarmConfig,
        local_node_id: NodeId,
        delegate: D,
        exchange: X,
        random: Box<dyn RandomSource>,
    ) -> Self {
        let pool_size = config.max_concurrent_sessions.min(MAX_POOL_SESSIONS);
        let mut sessions = Vec::with_capacity(pool_size);
        for _ in 0..pool_size {
            let mut session = Session::default();
            session.reset();
            sessions.push(session);
        }
        let buffers = MsgBufferPool::new(pool_size + 1);
        Self {
            config,
            local_node_id,
            sessions,
            buffers,
            timers: TimerService::new(),
            delegate,
            exchange,
            random,
            current_hush_op: None,
        }
    }

    // Accessors

    /// Engine configuration.
    pub fn config(&self) -> &AlarmConfig {
        &self.config
    }

    /// This node's id.
    pub fn local_node_id(&self) -> NodeId {
        self.local_node_id
    }

    /// Read access to a session slot.
    pub fn session(&self, idx: usize) -> Option<&Session> {
        self.sessions.get(idx)
    }

    /// Iterates every session slot, closed ones included.
    pub fn sessions(&self) -> impl Iterator<Item = &Session> {
        self.sessions.iter()
    }

    /// The application delegate.
    pub fn delegate(&self) -> &D {
        &self.delegate
    }

    /// Mutable access to the application delegate.
    pub fn delegate_mut(&mut self) -> &mut D {
        &mut self.delegate
    }

    /// The message layer.
    pub fn exchange_layer(&self) -> &X {
        &self.exchange
    }

    /// Mutable access to the message layer.
    pub fn exchange_layer_mut(&mut self) -> &mut X {
        &mut self.exchange
    }

    // Local session management

    /// Allocates a local alarm session bound to `peer` (normally the
    /// any-node multicast id).
    ///
    /// The slot is reserved in `Linger` so it cannot be claimed for a
    /// remote alarm before the first `send_alarm`, and a fresh session id
    /// is drawn immediately. An RNG failure is logged and left for
    /// `send_alarm` to refuse.
    ///
    /// # Errors
    ///
    /// [`AlarmError::NoMemory`] when no exchange context or session slot
    /// is available.
    pub fn new_session(
        &mut self,
        peer: NodeId,
        encryption_type: u8,
        key_id: u16,
    ) -> Result<usize, AlarmError> {
        let binding = ExchangeBinding {
            encryption_type,
            key_id,
            interface: self.config.interface,
            allow_duplicate_msgs: true,
        };
        let exchange = self.exchange.open(peer, binding).ok_or(AlarmError::NoMemory)?;
        let Some(idx) = self.alloc_session(exchange, peer, false) else {
            return Err(AlarmError::NoMemory);
        };
        self.sessions[idx].is_local = true;

        // reserve the slot until the application sends; also forces the
        // session-id freshness check on anything routed here meanwhile
        self.force_state(idx, SessionState::Linger);

        if let Err(err) = self.regenerate_session_id(idx) {
            tracing::error!(session = idx, %err, "session id generation failed at allocation");
        }
        Ok(idx)
    }

    /// Sends (or refreshes) the local alarm for session `idx` and starts
    /// Trickle dissemination.
    ///
    /// On failure past the precondition checks the session falls to
    /// `Linger`.
    ///
    /// # Errors
    ///
    /// - [`AlarmError::IncorrectState`] when the session is not local, has
    ///   no exchange, or has no valid session id.
    /// - [`AlarmError::NoMemory`] when the message-buffer pool is dry.
    /// - Errors from the message layer's trickle setup or send.
    pub fn send_alarm(
        &mut self,
        idx: usize,
        payload: &Alarm,
        now: u64,
    ) -> Result<(), AlarmError> {
        let session = self.sessions.get(idx).ok_or(AlarmError::InvalidArgument)?;
        if !session.is_local {
            return Err(AlarmError::IncorrectState);
        }
        let Some(exchange) = session.exchange else {
            return Err(AlarmError::IncorrectState);
        };
        let Some(tag) = session.current_alarm.session else {
            return Err(AlarmError::IncorrectState);
        };

        if tag.ext_evt_sn == u32::MAX {
            tracing::warn!(session = idx, "event sequence wrap, regenerating session id");
            // a failure here leaves the tag invalid; the check below
            // converts that into the linger fallback
            let _ = self.regenerate_session_id(idx);
        }
        let Some(tag) = self.sessions[idx].current_alarm.session else {
            return self.fail_send_to_linger(idx, now, AlarmError::IncorrectState);
        };

        let Some(mut buffer) = self.buffers.acquire() else {
            return self.fail_send_to_linger(idx, now, AlarmError::NoMemory);
        };

        let mut sn = tag.ext_evt_sn.wrapping_add(1);
        if (sn & 0xFF) == 0 {
            // the legacy counter rides in the low byte and never shows 0
            sn = sn.wrapping_add(1);
            tracing::warn!(session = idx, "alarm counter wrap");
        }

        let mut alarm = payload.clone();
        alarm.session = Some(SessionTag {
            session_id: tag.session_id,
            ext_evt_sn: sn,
        });
        alarm.alarm_ctr = (sn & 0xFF) as u8;
        self.sessions[idx].current_alarm = alarm;

        let packed = match self.sessions[idx]
            .current_alarm
            .encode(buffer.as_mut_storage())
        {
            Ok(n) => n,
            Err(err) => {
                self.buffers.release(buffer);
                return self.fail_send_to_linger(idx, now, err);
            }
        };
        buffer.set_len(packed);

        tracing::debug!(
            session = idx,
            session_id = format_args!("{:#x}", tag.session_id),
            ctr = self.sessions[idx].current_alarm.alarm_ctr,
            ext_evt_sn = sn,
            "send alarm"
        );
        self.sessions[idx].current_alarm.log_detail();

        // trickle setup must precede the send; it governs its behavior
        let trickle = TrickleConfig {
            rebroadcast_period_ms: self.config.rebroadcast_period_ms,
            rebroadcast_threshold: self.config.rebroadcast_threshold,
            timeout_ms: self.config.refresh_period_ms,
        };
        if let Err(err) = self.exchange.setup_trickle(exchange, trickle) {
            self.buffers.release(buffer);
            return self.fail_send_to_linger(idx, now, err);
        }
        if let Err(err) = self.exchange.send(
            exchange,
            AlarmMessageType::Alarm,
            buffer.as_slice(),
            SendFlags::RETRANSMIT_TRICKLE,
        ) {
            self.buffers.release(buffer);
            return self.fail_send_to_linger(idx, now, err);
        }

        if let Some(old) = self.sessions[idx].buffer.replace(buffer) {
            self.buffers.release(old);
        }
        self.set_state_active(idx);
        Ok(())
    }

    fn fail_send_to_linger(
        &mut self,
        idx: usize,
        now: u64,
        err: AlarmError,
    ) -> Result<(), AlarmError> {
        tracing::error!(session = idx, %err, "send alarm failed");
        let _ = self.set_state_linger(idx, now);
        Err(err)
    }

    /// Closes a session on application request, without a state-change
    /// notification. The slot becomes reusable.
    pub fn close_session(&mut self, idx: usize) {
        if idx < self.sessions.len() {
            self.set_state_closed(idx, false);
        }
    }

    /// Closes every session. The server may be reused afterwards.
    pub fn shutdown(&mut self) {
        for idx in 0..self.sessions.len() {
            self.set_state_closed(idx, false);
        }
        self.close_hush_op();
    }

    // Session id & sequence management

    /// Draws a fresh random session id and zeroes the sequence.
    ///
    /// # Errors
    ///
    /// [`AlarmError::RandomDataUnavailable`]; the session id stays
    /// invalid, so sends refuse until a later regeneration succeeds.
    pub fn regenerate_session_id(&mut self, idx: usize) -> Result<(), AlarmError> {
        self.sessions[idx].current_alarm.session = None;
        let session_id = self.random.random_u32()?;
        self.sessions[idx].current_alarm.session = Some(SessionTag {
            session_id,
            ext_evt_sn: 0,
        });
        self.sessions[idx].current_alarm.alarm_ctr = 0;
        Ok(())
    }

    /// Advances the sequence number to the next 256 boundary, or
    /// regenerates the session id when the advance would wrap.
    ///
    /// # Errors
    ///
    /// Errors of [`AlarmServer::regenerate_session_id`].
    pub fn try_advance_ext_evt_sn(&mut self, idx: usize) -> Result<(), AlarmError> {
        if let Some(tag) = self.sessions[idx].current_alarm.session {
            let next = ((u64::from(tag.ext_evt_sn) + 0xFF) >> 8) << 8;
            if next > u64::from(tag.ext_evt_sn) && next <= u64::from(u32::MAX) {
                let next = next as u32;
                self.sessions[idx].current_alarm.session = Some(SessionTag {
                    session_id: tag.session_id,
                    ext_evt_sn: next,
                });
                self.sessions[idx].current_alarm.alarm_ctr = (next & 0xFF) as u8;
                tracing::debug!(session = idx, ext_evt_sn = next, "advance event sequence");
                return Ok(());
            }
        }
        self.regenerate_session_id(idx)?;
        tracing::debug!(session = idx, "reset event sequence with new session id");
        Ok(())
    }

    /// Generates the 32-bit proximity verification code the originator
    /// publishes out of band.
    ///
    /// # Errors
    ///
    /// [`AlarmError::RandomDataUnavailable`].
    pub fn generate_proximity_verification_code(&mut self) -> Result<u32, AlarmError> {
        self.random.random_u32()
    }

    /// Generates a 32-bit hush challenge.
    ///
    /// # Errors
    ///
    /// [`AlarmError::RandomDataUnavailable`].
    pub fn generate_hush_challenge(&mut self) -> Result<u32, AlarmError> {
        self.random.random_u32()
    }

    // Incoming message handling

    /// Entry point for every unsolicited alarm-profile message.
    ///
    /// Alarm messages close the incoming exchange immediately and are
    /// re-dispatched by session id; hush requests claim the single
    /// delegated-operation slot.
    pub fn handle_message(
        &mut self,
        exchange: ExchangeId,
        message_type: u8,
        pkt: &PacketInfo,
        msg: &MessageInfo,
        payload: &[u8],
        now: u64,
    ) {
        match AlarmMessageType::from_wire(message_type) {
            Some(AlarmMessageType::Alarm) => {
                // the session-id mechanism invalidates whatever matching
                // the exchange layer did; always re-dispatch from scratch
                self.exchange.close(exchange);
                self.dispatch_alarm(pkt, msg, payload, now);
            }
            Some(AlarmMessageType::HushRequest) => {
                self.handle_hush_request(exchange, payload);
            }
            Some(AlarmMessageType::HushResponse) | None => {
                tracing::warn!(message_type, "unsupported message");
                let _ = self.exchange.send_status_report(
                    exchange,
                    common_status::PROFILE_ID,
                    common_status::UNSUPPORTED_MESSAGE,
                );
                self.exchange.close(exchange);
            }
        }
    }

    /// Reports a Trickle staleness timeout on a session's exchange.
    ///
    /// Local sessions refresh themselves while their alarm still merits
    /// rebroadcast, and fall to `Linger` otherwise; remote sessions enter
    /// their grace period.
    pub fn handle_retransmit_timeout(&mut self, exchange: ExchangeId, now: u64) {
        let Some(idx) = self.find_session_by_exchange(exchange) else {
            return;
        };
        if self.sessions[idx].is_local {
            if self.sessions[idx].current_alarm.keep_rebroadcasting() {
                tracing::debug!(session = idx, "retransmission timeout: refresh");
                let alarm = self.sessions[idx].current_alarm.clone();
                if let Err(err) = self.send_alarm(idx, &alarm, now) {
                    tracing::error!(session = idx, %err, "refresh failed");
                }
            } else {
                tracing::debug!(session = idx, "retransmission timeout: nothing to report");
                self.sessions[idx].current_alarm.log_detail();
                let _ = self.set_state_linger(idx, now);
            }
        } else {
            tracing::debug!(session = idx, "retransmission timeout: stop");
            let _ = self.set_state_grace(idx, now);
        }
    }

    /// Fires due lifecycle timers. The host calls this from its worker
    /// loop with the current time in milliseconds.
    pub fn poll_timers(&mut self, now: u64) {
        for fired in self.timers.poll(now) {
            let TimerEvent { session: idx, kind } = fired.event;
            if idx >= self.sessions.len() {
                continue;
            }
            match kind {
                TimerKind::GracePeriod => {
                    if self.sessions[idx].grace_timer == Some(fired.id) {
                        self.sessions[idx].grace_timer = None;
                        tracing::debug!(session = idx, "grace period ended, moving to linger");
                        let _ = self.set_state_linger(idx, now);
                    }
                }
                TimerKind::Linger => {
                    if self.sessions[idx].linger_timer == Some(fired.id) {
                        self.sessions[idx].linger_timer = None;
                        tracing::debug!(session = idx, "linger ended, closing");
                        self.set_state_closed(idx, true);
                    }
                }
            }
        }
    }

    // Hush delegate operations

    /// Replies to the in-flight hush request and closes its exchange.
    ///
    /// # Errors
    ///
    /// [`AlarmError::IncorrectState`] when no hush operation is in flight;
    /// otherwise codec or send errors. The exchange is closed either way.
    pub fn send_hush_response(
        &mut self,
        result: u8,
        conditions: &[Condition],
    ) -> Result<(), AlarmError> {
        let Some(op) = self.current_hush_op else {
            return Err(AlarmError::IncorrectState);
        };
        let outcome = (|| {
            let response = HushResponse::new(result, conditions)?;
            let mut wire = [0u8; 16];
            let n = response.encode(&mut wire)?;
            self.exchange
                .send(op, AlarmMessageType::HushResponse, &wire[..n], SendFlags::NONE)
        })();
        self.close_hush_op();
        outcome
    }

    /// Answers the in-flight hush request with a status report and closes
    /// its exchange.
    ///
    /// # Errors
    ///
    /// [`AlarmError::IncorrectState`] when no hush operation is in
    /// flight; otherwise send errors. The exchange is closed either way.
    pub fn send_status_report(
        &mut self,
        profile_id: u32,
        status_code: u16,
    ) -> Result<(), AlarmError> {
        let Some(op) = self.current_hush_op else {
            return Err(AlarmError::IncorrectState);
        };
        let outcome = self.exchange.send_status_report(op, profile_id, status_code);
        self.close_hush_op();
        outcome
    }

    fn handle_hush_request(&mut self, exchange: ExchangeId, payload: &[u8]) {
        // one delegated operation at a time
        if self.current_hush_op.is_some() {
            let _ = self.exchange.send_status_report(
                exchange,
                common_status::PROFILE_ID,
                common_status::BUSY,
            );
            self.exchange.close(exchange);
            return;
        }
        self.current_hush_op = Some(exchange);

        match HushRequest::decode(payload) {
            Ok(request) => {
                let result = self.delegate.on_hush_request(
                    exchange,
                    request.proximity_code,
                    &request.signature,
                );
                if let Err(err) = result {
                    tracing::warn!(%err, "hush request rejected by delegate");
                    self.close_hush_op();
                }
            }
            Err(err) => {
                tracing::warn!(%err, "malformed hush request");
                let _ = self
                    .send_status_report(common_status::PROFILE_ID, common_status::BAD_REQUEST);
            }
        }
    }

    fn close_hush_op(&mut self) {
        if let Some(op) = self.current_hush_op.take() {
            self.exchange.close(op);
        }
    }

    // Dispatcher

    fn dispatch_alarm(&mut self, pkt: &PacketInfo, msg: &MessageInfo, payload: &[u8], now: u64) {
        let parsed = match Alarm::decode(payload) {
            Ok(alarm) => alarm,
            Err(err) => {
                tracing::warn!(%err, src = format_args!("{:#x}", msg.source_node_id), "alarm parse failed");
                self.delegate.on_new_remote_alarm_dropped(&Alarm::default());
                return;
            }
        };

        match parsed.session {
            Some(tag) => tracing::info!(
                src = format_args!("{:#x}", msg.source_node_id),
                session_id = format_args!("{:#x}", tag.session_id),
                ext_evt_sn = tag.ext_evt_sn,
                "incoming alarm"
            ),
            None => tracing::info!(
                src = format_args!("{:#x}", msg.source_node_id),
                ctr = parsed.alarm_ctr,
                "incoming legacy alarm"
            ),
        }

        if let Some(required) = self.config.interface {
            if pkt.interface != Some(required) {
                tracing::error!(
                    interface = ?pkt.interface,
                    expected = required,
                    "reject: unexpected interface"
                );
                self.delegate.on_new_remote_alarm_dropped(&parsed);
                return;
            }
        }

        // route to the session already tracking this (originator,
        // session id); this also catches overheard copies of our own
        // alarms, which the exchange layer cannot match back to us
        for idx in 0..self.sessions.len() {
            let session = &self.sessions[idx];
            if session.state == SessionState::Closed {
                continue;
            }
            if session.originator(self.local_node_id) != msg.source_node_id {
                continue;
            }
            let validity_matches =
                session.current_alarm.session.is_some() == parsed.session.is_some();
            if !validity_matches {
                continue;
            }
            if let (Some(current), Some(incoming)) = (session.current_alarm.session, parsed.session)
            {
                if current.session_id != incoming.session_id {
                    continue;
                }
            }
            self.handle_alarm(idx, pkt, msg, payload, &parsed, now);
            return;
        }

        // an unmatched message from ourselves is an echo of a retired
        // session; discard it
        if msg.source_node_id == self.local_node_id {
            tracing::debug!("drop: echo of retired local session");
            return;
        }

        tracing::info!(src = format_args!("{:#x}", msg.source_node_id), "admitting remote alarm");
        if self.remote_pool_full() {
            if let Err(err) = self.close_less_severe(msg.source_node_id, &parsed) {
                tracing::warn!(%err, "no evictable session for incoming alarm");
                self.delegate.on_new_remote_alarm_dropped(&parsed);
                return;
            }
        }

        let binding = ExchangeBinding {
            encryption_type: msg.encryption_type,
            key_id: msg.key_id,
            interface: pkt.interface,
            allow_duplicate_msgs: true,
        };
        let Some(exchange) = self.exchange.open(msg.source_node_id, binding) else {
            tracing::error!("out of exchange contexts");
            self.delegate.on_new_remote_alarm_dropped(&parsed);
            return;
        };
        let Some(idx) = self.alloc_session(exchange, msg.source_node_id, true) else {
            self.delegate.on_new_remote_alarm_dropped(&parsed);
            return;
        };
        self.handle_alarm(idx, pkt, msg, payload, &parsed, now);
    }

    /// Core per-session ingress path.
    fn handle_alarm(
        &mut self,
        idx: usize,
        pkt: &PacketInfo,
        _msg: &MessageInfo,
        payload: &[u8],
        parsed: &Alarm,
        now: u64,
    ) {
        if let Some(required) = self.config.interface {
            if pkt.interface != Some(required) {
                tracing::debug!(
                    session = idx,
                    interface = ?pkt.interface,
                    expected = required,
                    "drop: unexpected interface"
                );
                return;
            }
        }

        let is_new = self.sessions[idx].state == SessionState::Closed;
        if is_new {
            tracing::debug!(session = idx, "new remote alarm");
            self.sessions[idx].current_alarm = Alarm::default();
        }

        let same_seq = {
            let current = &self.sessions[idx].current_alarm;
            match (current.session, parsed.session) {
                (None, _) => parsed.alarm_ctr == current.alarm_ctr,
                (Some(cur), Some(inc)) => cur.ext_evt_sn == inc.ext_evt_sn,
                (Some(_), None) => false,
            }
        };
        let state = self.sessions[idx].state;

        if state == SessionState::Active && same_seq {
            // a consistent copy; only feed Trickle suppression. Lingering
            // sessions are not trickling, so nothing to count there.
            if let Some(exchange) = self.sessions[idx].exchange {
                self.exchange.note_duplicate(exchange);
            }
            return;
        }
        if self.sessions[idx].is_local {
            // locally originated: incoming copies only matter for
            // suppression counting, handled above
            tracing::debug!(session = idx, "discard: different counter on local session");
            return;
        }
        if (state == SessionState::Linger || state == SessionState::GracePeriod) && same_seq {
            // the same counter must not bounce a wound-down session back
            tracing::debug!(session = idx, "discard: same counter while winding down");
            return;
        }

        if !is_new {
            let current = &self.sessions[idx].current_alarm;
            match (current.session, parsed.session) {
                (Some(cur), Some(inc)) => {
                    // wrap is impossible within a session: a new session id
                    // is generated before the sequence could roll over
                    if inc.ext_evt_sn < cur.ext_evt_sn {
                        tracing::debug!(
                            session = idx,
                            incoming = inc.ext_evt_sn,
                            current = cur.ext_evt_sn,
                            "drop: stale sequence"
                        );
                        return;
                    }
                }
                _ => {
                    let distance = parsed.alarm_ctr.wrapping_sub(current.alarm_ctr);
                    if distance > self.config.forward_counter_distance_limit {
                        tracing::debug!(
                            session = idx,
                            incoming = parsed.alarm_ctr,
                            current = current.alarm_ctr,
                            distance,
                            "drop: counter beyond forward distance"
                        );
                        return;
                    }
                }
            }
        }

        self.sessions[idx].current_alarm = parsed.clone();
        tracing::debug!(session = idx, "overwrite current alarm");
        self.sessions[idx].current_alarm.log_detail();

        // from here every failure is unrecoverable for this session
        let Some(mut buffer) = self.buffers.acquire() else {
            tracing::error!(session = idx, "message buffer pool exhausted");
            self.set_state_closed(idx, true);
            return;
        };
        if payload.len() > self.config.max_incoming_alarm_size {
            tracing::debug!(session = idx, len = payload.len(), "message too long");
            self.buffers.release(buffer);
            self.set_state_closed(idx, true);
            return;
        }
        buffer.fill_from(payload);

        let Some(exchange) = self.sessions[idx].exchange else {
            self.buffers.release(buffer);
            self.set_state_closed(idx, true);
            return;
        };

        // remotes keep one extra rebroadcast period of slack before the
        // alarm is judged stale
        let trickle = TrickleConfig {
            rebroadcast_period_ms: self.config.rebroadcast_period_ms,
            rebroadcast_threshold: self.config.rebroadcast_threshold,
            timeout_ms: self.config.refresh_period_ms + self.config.rebroadcast_period_ms,
        };
        if let Err(err) = self.exchange.setup_trickle(exchange, trickle) {
            tracing::error!(session = idx, %err, "trickle setup failed");
            self.buffers.release(buffer);
            self.set_state_closed(idx, true);
            return;
        }

        // re-multicast the incoming message verbatim, keeping its
        // message and source ids so peers recognize the copy
        let flags = SendFlags::RETRANSMIT_TRICKLE
            | SendFlags::DELAY_SEND
            | SendFlags::REUSE_MESSAGE_ID
            | SendFlags::REUSE_SOURCE_ID
            | SendFlags::FROM_INITIATOR;
        if let Err(err) = self
            .exchange
            .send(exchange, AlarmMessageType::Alarm, buffer.as_slice(), flags)
        {
            tracing::error!(session = idx, %err, "rebroadcast send failed");
            self.buffers.release(buffer);
            self.set_state_closed(idx, true);
            return;
        }

        if let Some(old) = self.sessions[idx].buffer.replace(buffer) {
            self.buffers.release(old);
        }
        self.set_state_active(idx);
    }

    // Admission control

    fn remote_pool_full(&self) -> bool {
        !self
            .sessions
            .iter()
            .any(|s| s.state == SessionState::Closed && !s.is_local)
    }

    /// Two-pass victim selection under pool pressure. Never touches local
    /// sessions; never closes a session more severe than the incoming
    /// alarm.
    fn close_less_severe(&mut self, src: NodeId, incoming: &Alarm) -> Result<(), AlarmError> {
        // pass 1: any strictly less severe remote
        for idx in 0..self.sessions.len() {
            if self.sessions[idx].is_local {
                continue;
            }
            let ordering = self
                .delegate
                .compare_severity(&self.sessions[idx].current_alarm, incoming);
            if ordering == Ordering::Less {
                tracing::info!(
                    session = idx,
                    originator = format_args!("{:#x}", self.sessions[idx].originator(self.local_node_id)),
                    "closing less severe session"
                );
                self.set_state_closed(idx, true);
                return Ok(());
            }
        }

        // pass 2: among equally severe remotes with a larger node id than
        // the incoming source, the largest id loses. Every node resolves
        // the same victim, so the fabric converges.
        let mut victim: Option<usize> = None;
        for idx in 0..self.sessions.len() {
            if self.sessions[idx].is_local {
                continue;
            }
            let originator = self.sessions[idx].originator(self.local_node_id);
            if originator <= src {
                continue;
            }
            let ordering = self
                .delegate
                .compare_severity(&self.sessions[idx].current_alarm, incoming);
            if ordering == Ordering::Equal {
                match victim {
                    Some(v)
                        if self.sessions[v].originator(self.local_node_id) >= originator => {}
                    _ => victim = Some(idx),
                }
            }
        }

        match victim {
            Some(idx) => {
                tracing::debug!(
                    session = idx,
                    originator = format_args!("{:#x}", self.sessions[idx].originator(self.local_node_id)),
                    "closing equally severe session"
                );
                self.set_state_closed(idx, true);
                Ok(())
            }
            None => Err(AlarmError::NoMemory),
        }
    }

    fn alloc_session(
        &mut self,
        exchange: ExchangeId,
        peer: NodeId,
        remote_only: bool,
    ) -> Option<usize> {
        for idx in 0..self.sessions.len() {
            if self.sessions[idx].state != SessionState::Closed {
                continue;
            }
            if remote_only && self.sessions[idx].is_local {
                tracing::error!(session = idx, "local session in CLOSED state");
                continue;
            }
            self.sessions[idx].exchange = Some(exchange);
            self.sessions[idx].peer = peer;
            return Some(idx);
        }
        // nobody owns the exchange; close it
        self.exchange.close(exchange);
        None
    }

    fn find_session_by_exchange(&self, exchange: ExchangeId) -> Option<usize> {
        self.sessions.iter().position(|s| s.exchange == Some(exchange))
    }

    // State transitions

    fn force_state(&mut self, idx: usize, new_state: SessionState) {
        tracing::debug!(
            session = idx,
            from = self.sessions[idx].state.name(),
            to = new_state.name(),
            "session state"
        );
        self.sessions[idx].state = new_state;
    }

    fn cancel_lifecycle_timers(&mut self, idx: usize) {
        if let Some(id) = self.sessions[idx].grace_timer.take() {
            self.timers.cancel(id);
        }
        if let Some(id) = self.sessions[idx].linger_timer.take() {
            self.timers.cancel(id);
        }
    }

    fn release_session_buffer(&mut self, idx: usize) {
        if let Some(buffer) = self.sessions[idx].buffer.take() {
            self.buffers.release(buffer);
        }
    }

    fn set_state_active(&mut self, idx: usize) {
        self.cancel_lifecycle_timers(idx);
        self.force_state(idx, SessionState::Active);
        self.delegate.on_session_state_change(&self.sessions[idx]);
    }

    fn set_state_closed(&mut self, idx: usize, notify: bool) {
        if self.sessions[idx].state == SessionState::Closed {
            return;
        }
        self.cancel_lifecycle_timers(idx);
        self.force_state(idx, SessionState::Closed);
        if notify {
            // is_local and the originator are still intact here so the
            // application can see what just ended
            self.delegate.on_session_state_change(&self.sessions[idx]);
        }
        self.sessions[idx].is_local = false;
        self.release_session_buffer(idx);
        if let Some(exchange) = self.sessions[idx].exchange.take() {
            // closing the exchange cancels trickle implicitly
            self.exchange.close(exchange);
        }
    }

    fn set_state_grace(&mut self, idx: usize, now: u64) -> Result<(), AlarmError> {
        if self.sessions[idx].is_local || self.sessions[idx].state != SessionState::Active {
            tracing::error!(session = idx, "invalid transition to GRACE");
            if !self.sessions[idx].is_local {
                self.set_state_closed(idx, true);
            }
            self.delegate.on_session_state_change(&self.sessions[idx]);
            return Err(AlarmError::IncorrectState);
        }

        tracing::debug!(session = idx, "stop trickle");
        if let Some(exchange) = self.sessions[idx].exchange {
            self.exchange.cancel_retransmit(exchange);
        }
        self.release_session_buffer(idx);
        self.cancel_lifecycle_timers(idx);

        let deadline = now + u64::from(self.config.grace_period_ms);
        let timer = self.timers.arm(
            deadline,
            TimerEvent {
                session: idx,
                kind: TimerKind::GracePeriod,
            },
        );
        self.sessions[idx].grace_timer = Some(timer);
        self.force_state(idx, SessionState::GracePeriod);
        self.delegate.on_session_state_change(&self.sessions[idx]);
        Ok(())
    }

    fn set_state_linger(&mut self, idx: usize, now: u64) -> Result<(), AlarmError> {
        if let Some(exchange) = self.sessions[idx].exchange {
            self.exchange.cancel_retransmit(exchange);
        }
        self.release_session_buffer(idx);

        let valid_from = match self.sessions[idx].state {
            SessionState::Active => self.sessions[idx].is_local,
            SessionState::GracePeriod => true,
            SessionState::Closed | SessionState::Linger => false,
        };
        if !valid_from {
            tracing::error!(session = idx, "invalid transition to LINGER");
            if !self.sessions[idx].is_local {
                self.set_state_closed(idx, true);
            }
            self.delegate.on_session_state_change(&self.sessions[idx]);
            return Err(AlarmError::IncorrectState);
        }

        self.cancel_lifecycle_timers(idx);

        if self.sessions[idx].is_local {
            // local sessions are never closed automatically; they linger
            // until the next send
            tracing::debug!(session = idx, "initiator alarm timed out");
            if let Err(err) = self.try_advance_ext_evt_sn(idx) {
                tracing::error!(session = idx, %err, "sequence advance failed");
                self.delegate.on_session_state_change(&self.sessions[idx]);
                return Err(err);
            }
            self.force_state(idx, SessionState::Linger);
        } else {
            let linger_ms =
                u64::from(self.config.refresh_period_ms) * u64::from(self.config.max_hops);
            let grace_ms = u64::from(self.config.grace_period_ms);
            if linger_ms > grace_ms {
                let duration = linger_ms - grace_ms;
                tracing::debug!(session = idx, duration, "arm linger timer");
                let timer = self.timers.arm(
                    now + duration,
                    TimerEvent {
                        session: idx,
                        kind: TimerKind::Linger,
                    },
                );
                self.sessions[idx].linger_timer = Some(timer);
                self.force_state(idx, SessionState::Linger);
            } else {
                // the whole linger budget was spent in the grace period
                tracing::debug!(session = idx, "no linger needed");
                self.set_state_closed(idx, true);
            }
        }

        self.delegate.on_session_state_change(&self.sessions[idx]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::{Source, State};
    use crate::random::testing::ScriptedRandom;

    const LOCAL_NODE: NodeId = 0x100;

    // ==================== Mocks ====================

    #[derive(Default)]
    struct MockExchange {
        next_id: ExchangeId,
        opened: Vec<(ExchangeId, NodeId)>,
        closed: Vec<ExchangeId>,
        sends: Vec<(ExchangeId, AlarmMessageType, Vec<u8>, SendFlags)>,
        trickles: Vec<(ExchangeId, TrickleConfig)>,
        cancels: Vec<ExchangeId>,
        duplicates: Vec<ExchangeId>,
        status_reports: Vec<(ExchangeId, u32, u16)>,
        fail_open: bool,
    }

    impl ExchangeLayer for MockExchange {
        fn open(&mut self, peer: NodeId, _binding: ExchangeBinding) -> Option<ExchangeId> {
            if self.fail_open {
                return None;
            }
            let id = self.next_id;
            self.next_id += 1;
            self.opened.push((id, peer));
            Some(id)
        }

        fn close(&mut self, exchange: ExchangeId) {
            self.closed.push(exchange);
        }

        fn setup_trickle(
            &mut self,
            exchange: ExchangeId,
            config: TrickleConfig,
        ) -> Result<(), AlarmError> {
            self.trickles.push((exchange, config));
            Ok(())
        }

        fn send(
            &mut self,
            exchange: ExchangeId,
            message_type: AlarmMessageType,
            payload: &[u8],
            flags: SendFlags,
        ) -> Result<(), AlarmError> {
            self.sends
                .push((exchange, message_type, payload.to_vec(), flags));
            Ok(())
        }

        fn cancel_retransmit(&mut self, exchange: ExchangeId) {
            self.cancels.push(exchange);
        }

        fn note_duplicate(&mut self, exchange: ExchangeId) {
            self.duplicates.push(exchange);
        }

        fn send_status_report(
            &mut self,
            exchange: ExchangeId,
            profile_id: u32,
            status_code: u16,
        ) -> Result<(), AlarmError> {
            self.status_reports.push((exchange, profile_id, status_code));
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockDelegate {
        state_changes: Vec<(SessionState, bool, NodeId)>,
        dropped: Vec<Alarm>,
        hush_requests: Vec<(ExchangeId, u32)>,
    }

    impl AlarmDelegate for MockDelegate {
        fn on_session_state_change(&mut self, session: &Session) {
            self.state_changes
                .push((session.state(), session.is_local(), session.originator(0)));
        }

        fn on_new_remote_alarm_dropped(&mut self, alarm: &Alarm) {
            self.dropped.push(alarm.clone());
        }

        fn on_hush_request(
            &mut self,
            exchange: ExchangeId,
            proximity_code: u32,
            _signature: &HushSignature,
        ) -> Result<(), AlarmError> {
            self.hush_requests.push((exchange, proximity_code));
            Ok(())
        }

        fn compare_severity(&mut self, a: &Alarm, b: &Alarm) -> Ordering {
            let worst = |alarm: &Alarm| {
                alarm
                    .conditions
                    .iter()
                    .map(|c| c.state_nibble())
                    .max()
                    .unwrap_or(0)
            };
            worst(a).cmp(&worst(b))
        }
    }

    use crate::message::HushSignature;

    type TestServer = AlarmServer<MockDelegate, MockExchange>;

    fn server_with_random(values: Vec<u32>) -> TestServer {
        AlarmServer::new(
            AlarmConfig::default(),
            LOCAL_NODE,
            MockDelegate::default(),
            MockExchange::default(),
            Box::new(ScriptedRandom { values }),
        )
    }

    fn server() -> TestServer {
        server_with_random((1..100).map(|i| 0x5EED_0000 + i).collect())
    }

    fn alarm_with(state: State, where_id: u8) -> Alarm {
        let mut alarm = Alarm {
            where_id,
            ..Alarm::default()
        };
        alarm.push_condition(Condition::new(Source::Smoke, state));
        alarm
    }

    fn remote_payload(src_session: u32, sn: u32, state: State) -> Vec<u8> {
        let mut alarm = alarm_with(state, 9);
        alarm.session = Some(SessionTag {
            session_id: src_session,
            ext_evt_sn: sn,
        });
        alarm.alarm_ctr = (sn & 0xFF) as u8;
        let mut wire = [0u8; 32];
        let n = alarm.encode(&mut wire).unwrap();
        wire[..n].to_vec()
    }

    fn inject_alarm(server: &mut TestServer, src: NodeId, payload: &[u8], now: u64) {
        let pkt = PacketInfo::default();
        let msg = MessageInfo {
            source_node_id: src,
            encryption_type: 0,
            key_id: 0,
        };
        // incoming exchange id 0xFFFF stands in for the one the message
        // layer opened; the dispatcher closes it immediately
        server.handle_message(0xFFFF, AlarmMessageType::Alarm as u8, &pkt, &msg, payload, now);
    }

    fn remote_session_idx(server: &TestServer, src: NodeId) -> Option<usize> {
        (0..server.sessions.len()).find(|&i| {
            server.sessions[i].state() != SessionState::Closed
                && server.sessions[i].peer == src
        })
    }

    // ==================== Local sessions ====================

    #[test]
    fn test_new_session_reserves_slot() {
        let mut server = server();
        let idx = server.new_session(crate::exchange::ANY_NODE_ID, 0, 0).unwrap();
        let session = server.session(idx).unwrap();
        assert_eq!(session.state(), SessionState::Linger);
        assert!(session.is_local());
        assert!(session.current_alarm().session.is_some());
        // slot reservation emits no state-change notification
        assert!(server.delegate().state_changes.is_empty());
    }

    #[test]
    fn test_send_alarm_counter_coupling() {
        let mut server = server();
        let idx = server.new_session(crate::exchange::ANY_NODE_ID, 0, 0).unwrap();
        server
            .send_alarm(idx, &alarm_with(State::AlarmHushable, 3), 0)
            .unwrap();

        let tag = server.session(idx).unwrap().current_alarm().session.unwrap();
        let ctr = server.session(idx).unwrap().current_alarm().alarm_ctr;
        assert_eq!(tag.ext_evt_sn, 1);
        assert_eq!(ctr, 1);
        assert_ne!(ctr, 0);
        assert_eq!(server.session(idx).unwrap().state(), SessionState::Active);

        // trickle configured before the send, with the refresh timeout
        let (_, trickle) = server.exchange_layer().trickles[0];
        assert_eq!(trickle.rebroadcast_period_ms, 3_000);
        assert_eq!(trickle.rebroadcast_threshold, 6);
        assert_eq!(trickle.timeout_ms, 30_000);
        let (_, message_type, _, flags) = &server.exchange_layer().sends[0];
        assert_eq!(*message_type, AlarmMessageType::Alarm);
        assert!(flags.contains(SendFlags::RETRANSMIT_TRICKLE));
    }

    #[test]
    fn test_send_alarm_sequence_monotone() {
        let mut server = server();
        let idx = server.new_session(crate::exchange::ANY_NODE_ID, 0, 0).unwrap();
        let payload = alarm_with(State::AlarmHushable, 3);
        let mut last = 0;
        for _ in 0..5 {
            server.send_alarm(idx, &payload, 0).unwrap();
            let sn = server.session(idx).unwrap().current_alarm().session.unwrap().ext_evt_sn;
            assert!(sn > last);
            last = sn;
        }
    }

    #[test]
    fn test_send_alarm_requires_local() {
        let mut server = server();
        inject_alarm(&mut server, 0x200, &remote_payload(0xAA, 1, State::AlarmHushable), 0);
        let idx = remote_session_idx(&server, 0x200).unwrap();
        assert_eq!(
            server.send_alarm(idx, &alarm_with(State::AlarmHushable, 1), 0),
            Err(AlarmError::IncorrectState)
        );
    }

    #[test]
    fn test_counter_wrap_regenerates_session() {
        let mut server = server();
        let idx = server.new_session(crate::exchange::ANY_NODE_ID, 0, 0).unwrap();
        let old_session_id = server.session(idx).unwrap().current_alarm().session.unwrap().session_id;

        server.sessions[idx].current_alarm.session = Some(SessionTag {
            session_id: old_session_id,
            ext_evt_sn: 0xFFFF_FFFE,
        });
        server
            .send_alarm(idx, &alarm_with(State::AlarmHushable, 3), 0)
            .unwrap();
        let tag = server.session(idx).unwrap().current_alarm().session.unwrap();
        assert_eq!(tag.ext_evt_sn, 0xFFFF_FFFF);

        // the next send detects the wrap and starts a fresh epoch
        server
            .send_alarm(idx, &alarm_with(State::AlarmHushable, 3), 0)
            .unwrap();
        let tag = server.session(idx).unwrap().current_alarm().session.unwrap();
        assert_ne!(tag.session_id, old_session_id);
        assert_eq!(tag.ext_evt_sn, 1);
        assert_eq!(server.session(idx).unwrap().current_alarm().alarm_ctr, 1);
    }

    #[test]
    fn test_counter_low_byte_never_zero() {
        let mut server = server();
        let idx = server.new_session(crate::exchange::ANY_NODE_ID, 0, 0).unwrap();
        let session_id = server.session(idx).unwrap().current_alarm().session.unwrap().session_id;
        server.sessions[idx].current_alarm.session = Some(SessionTag {
            session_id,
            ext_evt_sn: 0xFF,
        });
        server
            .send_alarm(idx, &alarm_with(State::AlarmHushable, 3), 0)
            .unwrap();
        let tag = server.session(idx).unwrap().current_alarm().session.unwrap();
        // 0x100 has a zero low byte and is skipped
        assert_eq!(tag.ext_evt_sn, 0x101);
        assert_eq!(server.session(idx).unwrap().current_alarm().alarm_ctr, 1);
    }

    #[test]
    fn test_local_refresh_to_linger_advances_sequence() {
        let mut server = server();
        let idx = server.new_session(crate::exchange::ANY_NODE_ID, 0, 0).unwrap();
        // a quiescent alarm stops rebroadcasting at the refresh timeout
        server
            .send_alarm(idx, &alarm_with(State::Standby, 3), 0)
            .unwrap();
        let exchange = server.session(idx).unwrap().exchange().unwrap();
        let sn_before = server.session(idx).unwrap().current_alarm().session.unwrap().ext_evt_sn;

        server.handle_retransmit_timeout(exchange, 30_000);
        assert_eq!(server.session(idx).unwrap().state(), SessionState::Linger);
        let tag = server.session(idx).unwrap().current_alarm().session.unwrap();
        // advanced to the next 256 boundary
        assert_eq!(tag.ext_evt_sn, 0x100);
        assert!(tag.ext_evt_sn > sn_before);
        assert_eq!(server.session(idx).unwrap().current_alarm().alarm_ctr, 0);
    }

    #[test]
    fn test_local_refresh_keeps_rebroadcasting() {
        let mut server = server();
        let idx = server.new_session(crate::exchange::ANY_NODE_ID, 0, 0).unwrap();
        server
            .send_alarm(idx, &alarm_with(State::AlarmNonHushable, 3), 0)
            .unwrap();
        let exchange = server.session(idx).unwrap().exchange().unwrap();

        server.handle_retransmit_timeout(exchange, 30_000);
        assert_eq!(server.session(idx).unwrap().state(), SessionState::Active);
        // refreshed with a new sequence number
        let sn = server.session(idx).unwrap().current_alarm().session.unwrap().ext_evt_sn;
        assert_eq!(sn, 2);
        assert_eq!(server.exchange_layer().sends.len(), 2);
    }

    // ==================== Remote lifecycle ====================

    #[test]
    fn test_remote_admission_and_rebroadcast() {
        let mut server = server();
        let payload = remote_payload(0xAA, 5, State::AlarmHushable);
        inject_alarm(&mut server, 0x200, &payload, 0);

        let idx = remote_session_idx(&server, 0x200).unwrap();
        let session = server.session(idx).unwrap();
        assert_eq!(session.state(), SessionState::Active);
        assert!(!session.is_local());
        assert_eq!(session.originator(LOCAL_NODE), 0x200);

        // the incoming exchange was closed; a fresh one rebroadcasts the
        // payload verbatim with the re-multicast flags
        assert!(server.exchange_layer().closed.contains(&0xFFFF));
        let (_, message_type, sent, flags) = &server.exchange_layer().sends[0];
        assert_eq!(*message_type, AlarmMessageType::Alarm);
        assert_eq!(sent, &payload);
        assert!(flags.contains(SendFlags::RETRANSMIT_TRICKLE));
        assert!(flags.contains(SendFlags::DELAY_SEND));
        assert!(flags.contains(SendFlags::REUSE_MESSAGE_ID));
        assert!(flags.contains(SendFlags::REUSE_SOURCE_ID));
        assert!(flags.contains(SendFlags::FROM_INITIATOR));

        // remote trickle staleness includes one extra rebroadcast period
        let (_, trickle) = server.exchange_layer().trickles[0];
        assert_eq!(trickle.timeout_ms, 33_000);
    }

    #[test]
    fn test_duplicate_counts_toward_suppression() {
        let mut server = server();
        let payload = remote_payload(0xAA, 5, State::AlarmHushable);
        inject_alarm(&mut server, 0x200, &payload, 0);
        let idx = remote_session_idx(&server, 0x200).unwrap();
        let changes_before = server.delegate().state_changes.len();

        // the same (source, session, sn) twice more
        inject_alarm(&mut server, 0x200, &payload, 100);
        inject_alarm(&mut server, 0x200, &payload, 200);

        assert_eq!(server.exchange_layer().duplicates.len(), 2);
        // no further state effects, no extra sends
        assert_eq!(server.delegate().state_changes.len(), changes_before);
        assert_eq!(server.exchange_layer().sends.len(), 1);
        assert_eq!(server.session(idx).unwrap().state(), SessionState::Active);
    }

    #[test]
    fn test_fresher_sequence_overwrites() {
        let mut server = server();
        inject_alarm(&mut server, 0x200, &remote_payload(0xAA, 5, State::HeadsUp1), 0);
        let idx = remote_session_idx(&server, 0x200).unwrap();

        inject_alarm(&mut server, 0x200, &remote_payload(0xAA, 6, State::AlarmHushable), 100);
        let tag = server.session(idx).unwrap().current_alarm().session.unwrap();
        assert_eq!(tag.ext_evt_sn, 6);
        assert_eq!(server.exchange_layer().sends.len(), 2);
    }

    #[test]
    fn test_stale_sequence_rejected() {
        let mut server = server();
        inject_alarm(&mut server, 0x200, &remote_payload(0xAA, 5, State::AlarmHushable), 0);
        let idx = remote_session_idx(&server, 0x200).unwrap();

        inject_alarm(&mut server, 0x200, &remote_payload(0xAA, 4, State::HeadsUp1), 100);
        let tag = server.session(idx).unwrap().current_alarm().session.unwrap();
        assert_eq!(tag.ext_evt_sn, 5);
        assert_eq!(server.exchange_layer().sends.len(), 1);
    }

    #[test]
    fn test_v1_forward_distance_limit() {
        let mut server = server();
        // legacy alarm: no session tail
        let mut alarm = alarm_with(State::AlarmHushable, 9);
        alarm.alarm_ctr = 10;
        let mut wire = [0u8; 16];
        // poke a v1 payload together by hand
        wire[0] = alarm.alarm_ctr;
        wire[1] = 1;
        wire[2] = alarm.conditions[0].raw();
        wire[3] = alarm.where_id;
        inject_alarm(&mut server, 0x200, &wire[..4], 0);
        let idx = remote_session_idx(&server, 0x200).unwrap();
        assert_eq!(server.session(idx).unwrap().current_alarm().alarm_ctr, 10);

        // distance 128 > 127: suspicious, rejected
        wire[0] = 138;
        inject_alarm(&mut server, 0x200, &wire[..4], 100);
        assert_eq!(server.session(idx).unwrap().current_alarm().alarm_ctr, 10);

        // distance within the window: accepted
        wire[0] = 11;
        inject_alarm(&mut server, 0x200, &wire[..4], 200);
        assert_eq!(server.session(idx).unwrap().current_alarm().alarm_ctr, 11);
    }

    #[test]
    fn test_remote_lifecycle_grace_linger_closed() {
        let mut server = server();
        inject_alarm(&mut server, 0x200, &remote_payload(0xAA, 5, State::AlarmHushable), 0);
        let idx = remote_session_idx(&server, 0x200).unwrap();
        let exchange = server.session(idx).unwrap().exchange().unwrap();

        // trickle staleness: remote enters its grace period
        server.handle_retransmit_timeout(exchange, 33_000);
        assert_eq!(server.session(idx).unwrap().state(), SessionState::GracePeriod);
        assert!(server.exchange_layer().cancels.contains(&exchange));

        // grace expiry: linger for refresh*hops - grace = 90s
        server.poll_timers(33_000 + 30_000);
        assert_eq!(server.session(idx).unwrap().state(), SessionState::Linger);

        // linger expiry: closed, slot reusable
        server.poll_timers(63_000 + 90_000);
        assert_eq!(server.session(idx).unwrap().state(), SessionState::Closed);
        assert!(server.exchange_layer().closed.contains(&exchange));
        let (state, _, originator) = *server.delegate().state_changes.last().unwrap();
        assert_eq!(state, SessionState::Closed);
        assert_eq!(originator, 0x200);
    }

    #[test]
    fn test_grace_bypass_when_linger_budget_spent() {
        let mut server = server_with_random((1..100).collect());
        // grace period swallows the whole linger budget
        server.config.grace_period_ms = 120_000;
        inject_alarm(&mut server, 0x200, &remote_payload(0xAA, 5, State::AlarmHushable), 0);
        let idx = remote_session_idx(&server, 0x200).unwrap();
        let exchange = server.session(idx).unwrap().exchange().unwrap();

        server.handle_retransmit_timeout(exchange, 33_000);
        server.poll_timers(33_000 + 120_000);
        // straight to closed, no linger hold
        assert_eq!(server.session(idx).unwrap().state(), SessionState::Closed);
    }

    #[test]
    fn test_same_seq_does_not_bounce_wound_down_session() {
        let mut server = server();
        let payload = remote_payload(0xAA, 5, State::AlarmHushable);
        inject_alarm(&mut server, 0x200, &payload, 0);
        let idx = remote_session_idx(&server, 0x200).unwrap();
        let exchange = server.session(idx).unwrap().exchange().unwrap();
        server.handle_retransmit_timeout(exchange, 33_000);

        // a delayed copy with the same sequence must not reactivate
        inject_alarm(&mut server, 0x200, &payload, 40_000);
        assert_eq!(server.session(idx).unwrap().state(), SessionState::GracePeriod);

        // but a fresher sequence revives the session
        inject_alarm(&mut server, 0x200, &remote_payload(0xAA, 6, State::AlarmHushable), 41_000);
        assert_eq!(server.session(idx).unwrap().state(), SessionState::Active);
    }

    #[test]
    fn test_own_echo_of_retired_session_dropped() {
        let mut server = server();
        let payload = remote_payload(0xAA, 5, State::AlarmHushable);
        inject_alarm(&mut server, LOCAL_NODE, &payload, 0);
        // no session admitted for our own echo
        assert!(remote_session_idx(&server, LOCAL_NODE).is_none());
        assert!(server.delegate().dropped.is_empty());
    }

    #[test]
    fn test_own_echo_counts_duplicates_on_live_session() {
        let mut server = server();
        let idx = server.new_session(crate::exchange::ANY_NODE_ID, 0, 0).unwrap();
        server
            .send_alarm(idx, &alarm_with(State::AlarmHushable, 3), 0)
            .unwrap();
        let current = server.session(idx).unwrap().current_alarm().clone();
        let mut wire = [0u8; 32];
        let n = current.encode(&mut wire).unwrap();

        // a neighbor rebroadcast our message; source id is ours
        inject_alarm(&mut server, LOCAL_NODE, &wire[..n], 100);
        assert_eq!(server.exchange_layer().duplicates.len(), 1);
        assert_eq!(server.session(idx).unwrap().state(), SessionState::Active);
    }

    #[test]
    fn test_different_session_id_admits_new_session() {
        let mut server = server();
        inject_alarm(&mut server, 0x200, &remote_payload(0xAA, 5, State::AlarmHushable), 0);
        inject_alarm(&mut server, 0x200, &remote_payload(0xBB, 1, State::AlarmHushable), 100);

        let live = server
            .sessions()
            .filter(|s| s.state() != SessionState::Closed)
            .count();
        assert_eq!(live, 2);
    }

    #[test]
    fn test_interface_mismatch_rejected() {
        let mut server = server();
        server.config.interface = Some(7);
        let pkt = PacketInfo { interface: Some(8) };
        let msg = MessageInfo {
            source_node_id: 0x200,
            encryption_type: 0,
            key_id: 0,
        };
        let payload = remote_payload(0xAA, 5, State::AlarmHushable);
        server.handle_message(0xFFFF, AlarmMessageType::Alarm as u8, &pkt, &msg, &payload, 0);

        assert!(remote_session_idx(&server, 0x200).is_none());
        assert_eq!(server.delegate().dropped.len(), 1);

        // matching interface admits
        let pkt = PacketInfo { interface: Some(7) };
        server.handle_message(0xFFFE, AlarmMessageType::Alarm as u8, &pkt, &msg, &payload, 0);
        assert!(remote_session_idx(&server, 0x200).is_some());
    }

    #[test]
    fn test_parse_failure_notifies_delegate() {
        let mut server = server();
        inject_alarm(&mut server, 0x200, &[0x01], 0);
        assert_eq!(server.delegate().dropped.len(), 1);
    }

    // ==================== Admission control ====================

    fn fill_pool_with_remotes(server: &mut TestServer, state: State) {
        for node in 1..=10u64 {
            let payload = remote_payload(0xAA00 + node as u32, 5, state);
            inject_alarm(server, node, &payload, 0);
        }
        let live = server
            .sessions()
            .filter(|s| s.state() != SessionState::Closed)
            .count();
        assert_eq!(live, 10);
    }

    #[test]
    fn test_eviction_of_less_severe() {
        let mut server = server();
        fill_pool_with_remotes(&mut server, State::HeadsUp1);

        // more severe incoming from node 0x0B: the first less severe
        // session (node 1) is closed and the newcomer admitted
        inject_alarm(&mut server, 0x0B, &remote_payload(0xCC, 1, State::HeadsUp2), 10);
        assert!(remote_session_idx(&server, 0x0B).is_some());
        assert!(remote_session_idx(&server, 1).is_none());
        let closed = server
            .delegate()
            .state_changes
            .iter()
            .filter(|(s, _, _)| *s == SessionState::Closed)
            .count();
        assert_eq!(closed, 1);
    }

    #[test]
    fn test_equal_severity_tiebreak_closes_largest_node_id() {
        let mut server = server();
        fill_pool_with_remotes(&mut server, State::HeadsUp1);

        // node 5 opens a second session (new session id) at equal
        // severity; among peers with a larger node id the largest loses
        inject_alarm(&mut server, 5, &remote_payload(0xCC, 1, State::HeadsUp1), 10);
        assert!(remote_session_idx(&server, 10).is_none());
    }

    #[test]
    fn test_admission_never_evicts_more_severe_or_local() {
        let mut server = server();
        let local = server.new_session(crate::exchange::ANY_NODE_ID, 0, 0).unwrap();
        for node in 1..=9u64 {
            let payload = remote_payload(0xAA00 + node as u32, 5, State::AlarmNonHushable);
            inject_alarm(&mut server, node, &payload, 0);
        }

        // less severe incoming finds no victim and is dropped
        inject_alarm(&mut server, 0x0B, &remote_payload(0xCC, 1, State::HeadsUp1), 10);
        assert!(remote_session_idx(&server, 0x0B).is_none());
        assert_eq!(server.delegate().dropped.len(), 1);
        // the local slot is untouched
        assert_eq!(server.session(local).unwrap().state(), SessionState::Linger);
        assert!(server.session(local).unwrap().is_local());
    }

    // ==================== Hush ====================

    fn signed_hush_payload() -> Vec<u8> {
        let mut request = HushRequest::new(0xDEAD_BEEF);
        request
            .sign(
                0xABCD_0123,
                0x0002,
                &[1u8; 16],
                crate::config::DEFAULT_HUSH_KEY_MIN_SIZE,
            )
            .unwrap();
        let mut wire = [0u8; 32];
        let n = request.encode(&mut wire).unwrap();
        wire[..n].to_vec()
    }

    #[test]
    fn test_hush_request_reaches_delegate() {
        let mut server = server();
        let payload = signed_hush_payload();
        let pkt = PacketInfo::default();
        let msg = MessageInfo {
            source_node_id: 0x300,
            encryption_type: 0,
            key_id: 0,
        };
        server.handle_message(42, AlarmMessageType::HushRequest as u8, &pkt, &msg, &payload, 0);

        assert_eq!(server.delegate().hush_requests, vec![(42, 0xDEAD_BEEF)]);

        // reply closes the exchange and frees the operation slot
        server
            .send_hush_response(crate::message::HUSH_RESULT_SUCCESS, &[Condition(0x13)])
            .unwrap();
        let (exchange, message_type, sent, _) = server.exchange_layer().sends.last().unwrap();
        assert_eq!(*exchange, 42);
        assert_eq!(*message_type, AlarmMessageType::HushResponse);
        assert_eq!(sent, &vec![0x00, 0x01, 0x13]);
        assert!(server.exchange_layer().closed.contains(&42));
        assert_eq!(
            server.send_hush_response(0, &[]),
            Err(AlarmError::IncorrectState)
        );
    }

    #[test]
    fn test_concurrent_hush_requests_get_busy() {
        let mut server = server();
        let payload = signed_hush_payload();
        let pkt = PacketInfo::default();
        let msg = MessageInfo {
            source_node_id: 0x300,
            encryption_type: 0,
            key_id: 0,
        };
        server.handle_message(42, AlarmMessageType::HushRequest as u8, &pkt, &msg, &payload, 0);
        server.handle_message(43, AlarmMessageType::HushRequest as u8, &pkt, &msg, &payload, 0);

        let (exchange, _, code) = *server.exchange_layer().status_reports.last().unwrap();
        assert_eq!(exchange, 43);
        assert_eq!(code, common_status::BUSY);
        assert!(server.exchange_layer().closed.contains(&43));
        // the first operation is still open
        assert_eq!(server.current_hush_op, Some(42));
    }

    #[test]
    fn test_malformed_hush_request_bad_request() {
        let mut server = server();
        let pkt = PacketInfo::default();
        let msg = MessageInfo {
            source_node_id: 0x300,
            encryption_type: 0,
            key_id: 0,
        };
        server.handle_message(42, AlarmMessageType::HushRequest as u8, &pkt, &msg, &[1, 2, 3], 0);

        let (exchange, _, code) = *server.exchange_layer().status_reports.last().unwrap();
        assert_eq!(exchange, 42);
        assert_eq!(code, common_status::BAD_REQUEST);
        assert!(server.exchange_layer().closed.contains(&42));
        assert_eq!(server.current_hush_op, None);
    }

    #[test]
    fn test_unsupported_message_type() {
        let mut server = server();
        let pkt = PacketInfo::default();
        let msg = MessageInfo {
            source_node_id: 0x300,
            encryption_type: 0,
            key_id: 0,
        };
        server.handle_message(42, 0x7F, &pkt, &msg, &[], 0);
        let (_, _, code) = *server.exchange_layer().status_reports.last().unwrap();
        assert_eq!(code, common_status::UNSUPPORTED_MESSAGE);
    }

    // ==================== Misc ====================

    #[test]
    fn test_shutdown_closes_everything() {
        let mut server = server();
        let _ = server.new_session(crate::exchange::ANY_NODE_ID, 0, 0).unwrap();
        inject_alarm(&mut server, 0x200, &remote_payload(0xAA, 5, State::AlarmHushable), 0);

        server.shutdown();
        assert!(server
            .sessions()
            .all(|s| s.state() == SessionState::Closed));
        // buffer pool fully recovered
        assert_eq!(server.buffers.available(), 11);
    }

    #[test]
    fn test_rng_failure_blocks_send() {
        let mut server = server_with_random(vec![]);
        let idx = server.new_session(crate::exchange::ANY_NODE_ID, 0, 0).unwrap();
        // session id generation failed at allocation; sends must refuse
        assert!(server.session(idx).unwrap().current_alarm().session.is_none());
        assert_eq!(
            server.send_alarm(idx, &alarm_with(State::AlarmHushable, 3), 0),
            Err(AlarmError::IncorrectState)
        );
    }

    #[test]
    fn test_generate_codes() {
        let mut server = server_with_random(vec![0x1111, 0x2222]);
        assert_eq!(server.generate_proximity_verification_code().unwrap(), 0x1111);
        assert_eq!(server.generate_hush_challenge().unwrap(), 0x2222);
        assert_eq!(
            server.generate_hush_challenge(),
            Err(AlarmError::RandomDataUnavailable)
        );
    }
}
