//! The multi-ring event log engine.
//!
//! Events are serialized directly into the lowest-priority ring. When a
//! ring needs room, it reclaims records from its head: a record whose final
//! destination is that ring is dropped outright, while a record bound for a
//! higher ring is promoted — copied verbatim into the successor, which may
//! recursively make room the same way. Retrieval walks the stored records
//! from the oldest (in the final-destination ring) toward the newest (in
//! the write ring), filters by priority, and re-synthesizes absolute
//! timestamps from the stored deltas.
//!
//! ## Locking
//!
//! All mutation happens under one short critical section. `log_event`,
//! external-event registration, endpoint capture, and fetch each take the
//! lock once and never block inside it. Throttling and the
//! upload-requested latch are plain atomics so they can be touched from
//! interrupt-like contexts without taking the lock.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::buffer::{EventRing, RingConfig};
use crate::error::LogError;
use crate::event::{
    tag, EventEnvelope, EventId, EventOptions, EventSchema, EventTimestamp, Priority,
    SystemTimestamp, UtcTimestamp,
};
use crate::external::{
    ExternalEventsHandle, FetchExternalEventsFn, NotifyAction, NotifyExternalEventsFn,
    EXTERNAL_EVENT_SLOTS,
};
use crate::flush::{BulkUploader, FlagOp, FlushConfig, FlushScheduler, FlushState, SubscriberPositions};
use crate::ring::{CircularTlvBuffer, RingSink, RingSource};
use crate::tlv::{Element, SliceSink, TlvReader, TlvSource, TlvWriter};

/// Initial byte reservation for a new event before its real size is known.
/// Retries double the reservation until the write fits or the request
/// exceeds the ring.
pub const EVENT_SIZE_RESERVE: usize = 64;

/// Writer handed to the event-data callback.
pub type EventWriter<'a> = TlvWriter<RingSink<'a>>;

/// Engine-wide configuration.
#[derive(Debug, Clone, Copy)]
pub struct LogConfig {
    /// Lowest priority admitted to the log.
    pub min_priority: Priority,
    /// Resource id of the local node; events sourced here omit the
    /// resource id field.
    pub local_resource_id: u64,
    /// Flush timing and thresholds.
    pub flush: FlushConfig,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            min_priority: Priority(1),
            local_resource_id: 0,
            flush: FlushConfig::default(),
        }
    }
}

/// State carried through one retrieval window.
///
/// External fetch callbacks receive this context; they append whole
/// records through `writer` and must advance `current_id` past the ids
/// they handled.
pub struct FetchContext<'a, 'b> {
    /// Output writer positioned inside the retrieval buffer.
    pub writer: &'a mut TlvWriter<SliceSink<'b>>,
    /// Priority being fetched.
    pub priority: Priority,
    /// First event id the subscriber asked for.
    pub starting_id: EventId,
    /// Id of the next event to be considered.
    pub current_id: EventId,
    /// Accumulated absolute system time at `current_id`.
    pub current_time: SystemTimestamp,
    /// Accumulated absolute UTC time at `current_id`.
    pub current_utc: UtcTimestamp,
    /// True until the first record of the window is emitted; that record
    /// carries an absolute timestamp and an explicit event id.
    pub first: bool,
    /// Separate latch for the UTC absolute timestamp.
    pub first_utc: bool,
}

struct LogInner {
    rings: Vec<EventRing>,
    bytes_written: u64,
    flush: FlushScheduler,
    config: LogConfig,
}

/// The event log engine.
pub struct EventLog {
    inner: Mutex<LogInner>,
    throttled: AtomicU32,
    upload_requested: AtomicBool,
}

impl EventLog {
    /// Builds the log from ring configurations ordered lowest priority
    /// first.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` when no rings are supplied or priorities are not
    /// strictly increasing.
    pub fn new(rings: Vec<RingConfig>, config: LogConfig) -> Result<Self, LogError> {
        if rings.is_empty() {
            return Err(LogError::InvalidArgument);
        }
        if rings.windows(2).any(|w| w[0].priority >= w[1].priority) {
            return Err(LogError::InvalidArgument);
        }
        let flush_config = config.flush;
        Ok(Self {
            inner: Mutex::new(LogInner {
                rings: rings.into_iter().map(EventRing::new).collect(),
                bytes_written: 0,
                flush: FlushScheduler::new(flush_config),
                config,
            }),
            throttled: AtomicU32::new(0),
            upload_requested: AtomicBool::new(false),
        })
    }

    // Write path

    /// Logs one event, serializing its payload through `write_data`.
    ///
    /// Returns the vended event id, or 0 when the event was dropped —
    /// below the admission threshold, after shutdown, or on a failure that
    /// already rolled the ring back byte-identically.
    pub fn log_event(
        &self,
        schema: &EventSchema,
        options: &EventOptions,
        mut write_data: impl FnMut(&mut EventWriter<'_>) -> Result<(), LogError>,
    ) -> EventId {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if inner.flush.state == FlushState::Shutdown {
            return 0;
        }

        let threshold = if self.throttled.load(Ordering::Acquire) != 0 {
            // under throttle only the most important ring admits events
            inner.rings.last().map_or(Priority(0), |r| r.priority)
        } else {
            inner.config.min_priority
        };
        if schema.priority < threshold {
            return 0;
        }

        let dest = ring_index_for(&inner.rings, schema.priority);

        // Initialize the first-event timestamp before computing the delta,
        // so the first event of a chain stores a delta of zero.
        match options.timestamp {
            EventTimestamp::System(ts) => {
                if inner.rings[dest].first_event_ts == 0 {
                    inner.rings[dest].note_event(ts);
                }
            }
            EventTimestamp::Utc(ts) => {
                if !inner.rings[dest].utc_initialized {
                    inner.rings[dest].note_event_utc(ts);
                }
            }
        }
        let prev_ts = inner.rings[dest].last_event_ts;
        let prev_utc = inner.rings[dest].last_event_utc;

        let mut reservation = EVENT_SIZE_RESERVE;
        let written;
        loop {
            if let Err(err) = ensure_space(&mut inner.rings, reservation) {
                tracing::error!(%err, priority = schema.priority.0, "no space for event");
                return 0;
            }
            let checkpoint = inner.rings[0].buffer.checkpoint();
            match blit_event(
                &mut inner.rings[0].buffer,
                schema,
                options,
                prev_ts,
                prev_utc,
                inner.config.local_resource_id,
                &mut write_data,
            ) {
                Ok(n) => {
                    written = n;
                    break;
                }
                Err(LogError::NoMemory) => {
                    inner.rings[0].buffer.restore(checkpoint);
                    reservation *= 2;
                }
                Err(err) => {
                    inner.rings[0].buffer.restore(checkpoint);
                    tracing::error!(%err, "event serialization failed");
                    return 0;
                }
            }
        }

        inner.bytes_written += written as u64;
        let event_id = inner.rings[dest].vend_event_id();
        match options.timestamp {
            EventTimestamp::System(ts) => inner.rings[dest].note_event(ts),
            EventTimestamp::Utc(ts) => inner.rings[dest].note_event_utc(ts),
        }
        tracing::debug!(
            event_id,
            priority = schema.priority.0,
            profile_id = schema.profile_id,
            event_type = schema.event_type,
            "event logged"
        );

        let request = options.urgent || inner.flush.should_flush(inner.bytes_written);
        if request && self.try_latch_upload() {
            inner.flush.request_work();
        }
        event_id
    }

    // Read path

    /// Fetches events of `priority` starting at `*since_id` into `writer`.
    ///
    /// On return, `*since_id` is the next id to request. `Ok(())` means the
    /// log (or an external segment boundary) was reached;
    /// `Err(EndOfStream)` means the writer ran out of space with more
    /// events remaining — the writer has been rolled back to the last
    /// whole-event boundary.
    pub fn fetch_events_since(
        &self,
        writer: &mut TlvWriter<SliceSink<'_>>,
        priority: Priority,
        since_id: &mut EventId,
    ) -> Result<(), LogError> {
        let guard = self.inner.lock();
        let dest = ring_index_for(&guard.rings, priority);
        let ring = &guard.rings[dest];
        let mut ctx = FetchContext {
            writer,
            priority,
            starting_id: *since_id,
            current_id: ring.first_event_id,
            current_time: ring.first_event_ts,
            current_utc: ring.first_event_utc,
            first: true,
            first_utc: true,
        };
        let result = fetch_into(&guard.rings, dest, &mut ctx);
        *since_id = ctx.current_id;
        result
    }

    /// Copies raw stored TLV bytes for `priority`, oldest first, spanning
    /// the final-destination ring and every lower ring. Returns the number
    /// of bytes copied. This is the surface bulk uploaders read through.
    pub fn read_raw(&self, priority: Priority, offset: usize, out: &mut [u8]) -> usize {
        let guard = self.inner.lock();
        let dest = ring_index_for(&guard.rings, priority);
        let mut position = 0usize;
        let mut written = 0usize;
        for idx in (0..=dest).rev() {
            let ring = &guard.rings[idx];
            let len = ring.buffer.len();
            let ring_start = position;
            position += len;
            if offset + written >= position || written == out.len() {
                continue;
            }
            let from = (offset + written) - ring_start;
            let n = (len - from).min(out.len() - written);
            if ring.buffer.read_at(from, &mut out[written..written + n]).is_err() {
                break;
            }
            written += n;
        }
        written
    }

    /// First stored (or next-to-be-vended) event id for `priority`.
    pub fn first_event_id(&self, priority: Priority) -> EventId {
        let guard = self.inner.lock();
        let dest = ring_index_for(&guard.rings, priority);
        guard.rings[dest].first_event_id
    }

    /// Most recently vended event id for `priority`.
    pub fn last_event_id(&self, priority: Priority) -> EventId {
        let guard = self.inner.lock();
        let dest = ring_index_for(&guard.rings, priority);
        guard.rings[dest].last_event_id
    }

    /// Total bytes serialized into the log since creation.
    pub fn bytes_written(&self) -> u64 {
        self.inner.lock().bytes_written
    }

    /// Records the current last event id of each ring into `endpoints`
    /// (indexed by ring position, lowest priority first) and returns the
    /// total bytes written. Used to mark an offload boundary.
    pub fn set_logging_endpoint(&self, endpoints: &mut [EventId]) -> u64 {
        let guard = self.inner.lock();
        for (slot, ring) in endpoints.iter_mut().zip(guard.rings.iter()) {
            *slot = ring.last_event_id;
        }
        guard.bytes_written
    }

    // Throttling

    /// Raises the admission threshold to the highest ring priority.
    /// Nestable; each call must be balanced by [`EventLog::unthrottle`].
    pub fn throttle(&self) {
        if self.throttled.fetch_add(1, Ordering::AcqRel) == 0 {
            tracing::info!("log throttle on");
        }
    }

    /// Reverses one [`EventLog::throttle`] call.
    pub fn unthrottle(&self) {
        if self.throttled.fetch_sub(1, Ordering::AcqRel) == 1 {
            tracing::info!("log throttle off");
        }
    }

    // External events

    /// Registers a contiguous externally stored range of `num_events` ids
    /// at `priority`. The ids are vended immediately from the live
    /// counter.
    pub fn register_external_events(
        &self,
        priority: Priority,
        fetch: FetchExternalEventsFn,
        notify: Option<NotifyExternalEventsFn>,
        num_events: usize,
    ) -> Result<ExternalEventsHandle, LogError> {
        let mut guard = self.inner.lock();
        let dest = ring_index_for(&guard.rings, priority);
        let ring_priority = guard.rings[dest].priority;
        let slot = guard.rings[dest].register_external(fetch, notify, num_events)?;
        Ok(ExternalEventsHandle {
            priority: ring_priority,
            slot,
            range: guard.rings[dest].external[slot].range,
        })
    }

    /// Unregisters an external range. The ids remain allocated; the slot
    /// becomes reclaimable once eviction passes the range. Unconditional —
    /// a stale handle is a no-op.
    pub fn unregister_external_events(&self, handle: ExternalEventsHandle) {
        let mut guard = self.inner.lock();
        let dest = ring_index_for(&guard.rings, handle.priority);
        let slot = &mut guard.rings[dest].external[handle.slot];
        if slot.range == handle.range {
            slot.fetch = None;
            slot.notify = None;
        }
    }

    /// Notifies external providers that events up to `last_delivered` were
    /// delivered to `recipient`.
    pub fn notify_events_delivered(
        &self,
        priority: Priority,
        last_delivered: EventId,
        recipient: u64,
    ) {
        let mut guard = self.inner.lock();
        let dest = ring_index_for(&guard.rings, priority);
        for slot_idx in 0..EXTERNAL_EVENT_SLOTS {
            let slot = guard.rings[dest].external[slot_idx];
            let (Some(_), Some(notify)) = (slot.fetch, slot.notify) else {
                continue;
            };
            if last_delivered < slot.range.first_id {
                continue;
            }
            let delivered = last_delivered.min(slot.range.last_id);
            if notify(&slot.range, delivered, recipient) == NotifyAction::Unregister {
                let slot = &mut guard.rings[dest].external[slot_idx];
                slot.fetch = None;
                slot.notify = None;
            }
        }
    }

    // Flush scheduling

    /// Installs the bulk uploader. Only the first call takes effect.
    pub fn set_uploader(&self, uploader: Box<dyn BulkUploader>) {
        self.inner.lock().flush.set_uploader(uploader);
    }

    /// Installs the subscriber-position provider for the notification
    /// trigger path.
    pub fn set_subscriber_positions(&self, subscribers: Box<dyn SubscriberPositions>) {
        self.inner.lock().flush.set_subscribers(subscribers);
    }

    /// Decides whether an offload pass should be scheduled and latches the
    /// request. Callable from any thread.
    ///
    /// # Errors
    ///
    /// `IncorrectState` after shutdown.
    pub fn schedule_flush_if_needed(&self, request: bool) -> Result<(), LogError> {
        let mut guard = self.inner.lock();
        if guard.flush.state == FlushState::Shutdown {
            return Err(LogError::IncorrectState);
        }
        let request = request || guard.flush.should_flush(guard.bytes_written);
        if request && self.try_latch_upload() {
            guard.flush.request_work();
        }
        Ok(())
    }

    /// Reports completion of an upload pass started by the scheduler.
    pub fn signal_upload_done(&self, now: u64) {
        self.inner.lock().flush.upload_done(now);
    }

    /// Drives pending flush work and timers. The host calls this from its
    /// worker loop with the current time in milliseconds.
    pub fn poll(&self, now: u64) {
        let mut guard = self.inner.lock();
        if !guard.flush.due(now) {
            return;
        }
        match guard.flush.run(now) {
            FlagOp::None => {}
            FlagOp::Reevaluate => {
                self.upload_requested.store(false, Ordering::Release);
                if guard.flush.should_flush(guard.bytes_written) && self.try_latch_upload() {
                    guard.flush.request_work();
                } else {
                    guard.flush.arm_retry(now);
                }
            }
        }
    }

    /// Current flush state, for host introspection.
    pub fn flush_state(&self) -> FlushState {
        self.inner.lock().flush.state
    }

    /// Shuts the log down. Subsequent `log_event` calls are silent no-ops
    /// returning 0.
    pub fn destroy(&self) {
        self.inner.lock().flush.shutdown();
    }

    fn try_latch_upload(&self) -> bool {
        self.upload_requested
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

// Ring resolution

/// First ring (walking from the lowest priority) that is the final
/// destination for `p`.
fn ring_index_for(rings: &[EventRing], p: Priority) -> usize {
    let mut idx = 0;
    while !rings[idx].is_final_destination_for(p, rings.get(idx + 1).map(|r| r.priority)) {
        idx += 1;
    }
    idx
}

// Space reclamation

/// Makes `required` bytes available in the lowest ring, evicting and
/// promoting head records as needed.
///
/// The walk keeps an explicit stack of stashed requirements: when a head
/// record must be promoted but the successor is full, the current
/// requirement is parked and the successor becomes the ring being
/// serviced. Promotion into a ring never triggers eviction there — space
/// is always secured first.
fn ensure_space(rings: &mut [EventRing], required: usize) -> Result<(), LogError> {
    if required <= rings[0].buffer.free() {
        return Ok(());
    }
    let mut idx = 0usize;
    let mut req = required;
    let mut stash: SmallVec<[(usize, usize); 8]> = SmallVec::new();
    loop {
        if req > rings[idx].buffer.capacity() {
            return Err(LogError::BufferTooSmall);
        }
        if req <= rings[idx].buffer.free() {
            match stash.pop() {
                None => return Ok(()),
                Some((parked_idx, parked_req)) => {
                    idx = parked_idx;
                    req = parked_req;
                    continue;
                }
            }
        }

        let envelope = decode_head_envelope(&rings[idx])?;
        let event_priority = envelope.priority.ok_or(LogError::MalformedRecord)?;
        let next_priority = rings.get(idx + 1).map(|r| r.priority);
        if rings[idx].is_final_destination_for(event_priority, next_priority) {
            rings[idx].drop_head_event(&envelope);
            continue;
        }

        if envelope.total_len <= rings[idx + 1].buffer.free() {
            let (lower, upper) = rings.split_at_mut(idx + 1);
            copy_head_record(&lower[idx].buffer, &mut upper[0].buffer, envelope.total_len)?;
            lower[idx].buffer.advance_head(envelope.total_len);
            continue;
        }

        stash.push((idx, req));
        req = envelope.total_len;
        idx += 1;
    }
}

/// Copies `len` head bytes of `src` verbatim to the tail of `dst`. The
/// caller has verified `dst` has room.
fn copy_head_record(
    src: &CircularTlvBuffer,
    dst: &mut CircularTlvBuffer,
    len: usize,
) -> Result<(), LogError> {
    let mut chunk = [0u8; 32];
    let mut copied = 0;
    while copied < len {
        let n = chunk.len().min(len - copied);
        src.read_at(copied, &mut chunk[..n])?;
        dst.push(&chunk[..n])?;
        copied += n;
    }
    Ok(())
}

/// Decodes the envelope of the record at a ring's head.
fn decode_head_envelope(ring: &EventRing) -> Result<EventEnvelope, LogError> {
    let source = RingSource::new(&ring.buffer);
    let mut reader = TlvReader::new(&source);
    let outer = reader.next_element()?.ok_or(LogError::MalformedRecord)?;
    let (priority, delta_system, delta_utc) = parse_envelope(&reader, &outer)?;
    Ok(EventEnvelope {
        priority,
        delta_system,
        delta_utc,
        total_len: outer.total_len,
    })
}

/// Pulls priority and delta-time fields out of a record structure.
/// Records store the priority and exactly one delta, so parsing stops
/// after two fields.
fn parse_envelope<R: TlvSource>(
    reader: &TlvReader<'_, R>,
    outer: &Element,
) -> Result<(Option<Priority>, i32, i64), LogError> {
    let mut inner = reader.enter_container(outer)?;
    let mut priority = None;
    let mut delta_system = 0i32;
    let mut delta_utc = 0i64;
    let mut fields = 0;
    while let Some(e) = inner.next_element()? {
        match e.tag {
            Some(tag::PRIORITY) => {
                priority = Some(Priority(inner.read_uint(&e)? as u8));
                fields += 1;
            }
            Some(tag::DELTA_SYSTEM_TIME) => {
                delta_system = inner.read_int(&e)? as i32;
                fields += 1;
            }
            Some(tag::DELTA_UTC_TIME) => {
                delta_utc = inner.read_int(&e)?;
                fields += 1;
            }
            _ => {}
        }
        if fields == 2 {
            break;
        }
    }
    Ok((priority, delta_system, delta_utc))
}

// Serialization

/// Writes one event record at the tail of the write ring. On any error
/// the caller restores the ring from its checkpoint.
#[allow(clippy::too_many_arguments)]
fn blit_event(
    ring: &mut CircularTlvBuffer,
    schema: &EventSchema,
    options: &EventOptions,
    prev_ts: SystemTimestamp,
    prev_utc: UtcTimestamp,
    local_resource_id: u64,
    write_data: &mut impl FnMut(&mut EventWriter<'_>) -> Result<(), LogError>,
) -> Result<usize, LogError> {
    let mut w = TlvWriter::new(RingSink::new(ring));
    let record = w.begin_struct(None)?;

    w.put_u16(Some(tag::PRIORITY), u16::from(schema.priority.0))?;

    if let Some((related_priority, related_id)) = options.related {
        if related_id != 0 {
            w.put_u16(Some(tag::RELATED_PRIORITY), u16::from(related_priority.0))?;
            w.put_u64(Some(tag::RELATED_ID), u64::from(related_id))?;
        }
    }

    // Stored records always carry deltas; absolute timestamps are
    // synthesized at fetch time.
    match options.timestamp {
        EventTimestamp::System(ts) => {
            w.put_i32(Some(tag::DELTA_SYSTEM_TIME), ts.wrapping_sub(prev_ts) as i32)?;
        }
        EventTimestamp::Utc(ts) => {
            w.put_i64(Some(tag::DELTA_UTC_TIME), ts.wrapping_sub(prev_utc) as i64)?;
        }
    }

    if schema.data_version != 1 || schema.min_compatible_version != 1 {
        let profile = w.begin_array(Some(tag::PROFILE_ID))?;
        w.put_u32(None, schema.profile_id)?;
        if schema.data_version != 1 {
            w.put_u32(None, schema.data_version)?;
        }
        if schema.min_compatible_version != 1 {
            w.put_u32(None, schema.min_compatible_version)?;
        }
        w.end_container(profile)?;
    } else {
        w.put_u32(Some(tag::PROFILE_ID), schema.profile_id)?;
    }

    if let Some(source) = options.source {
        if source.resource_id != local_resource_id {
            w.put_u64(Some(tag::RESOURCE_ID), source.resource_id)?;
        }
        w.put_u64(Some(tag::TRAIT_INSTANCE_ID), source.trait_instance_id)?;
    }

    w.put_u32(Some(tag::EVENT_TYPE), schema.event_type)?;

    write_data(&mut w)?;

    w.end_container(record)?;
    Ok(w.position())
}

// Retrieval

fn fetch_into(
    rings: &[EventRing],
    dest: usize,
    ctx: &mut FetchContext<'_, '_>,
) -> Result<(), LogError> {
    // A window starting inside an external range is served entirely by
    // its provider.
    if let Some(slot_idx) = rings[dest].external_covering(ctx.starting_id) {
        let slot = rings[dest].external[slot_idx];
        ctx.current_id = slot.range.first_id;
        return match slot.fetch {
            Some(fetch) => fetch(ctx, &slot.range),
            None => {
                // unregistered range: the ids stay a gap
                ctx.current_id = slot.range.last_id.wrapping_add(1);
                Ok(())
            }
        };
    }

    for ring_idx in (0..=dest).rev() {
        let source = RingSource::new(&rings[ring_idx].buffer);
        let mut reader = TlvReader::new(&source);
        while let Some(outer) = reader.next_element()? {
            // Stop at an external segment boundary; the next call
            // dispatches the provider.
            while let Some(slot_idx) = rings[dest].external_covering(ctx.current_id) {
                if ctx.current_id >= ctx.starting_id {
                    return Ok(());
                }
                ctx.current_id = rings[dest].external[slot_idx].range.last_id.wrapping_add(1);
            }

            let (priority, delta_system, delta_utc) = parse_envelope(&reader, &outer)?;
            if priority != Some(ctx.priority) {
                continue;
            }
            ctx.current_time = ctx.current_time.wrapping_add_signed(delta_system);
            ctx.current_utc = ctx.current_utc.wrapping_add_signed(delta_utc);
            if ctx.current_id >= ctx.starting_id {
                let checkpoint = ctx.writer.position();
                match copy_event(&source, &reader, &outer, ctx) {
                    Ok(()) => {
                        ctx.first = false;
                    }
                    Err(_) => {
                        ctx.writer.sink_mut().truncate(checkpoint);
                        return Err(LogError::EndOfStream);
                    }
                }
            }
            ctx.current_id = ctx.current_id.wrapping_add(1);
        }
    }
    Ok(())
}

/// Copies one record into the retrieval writer, applying the window
/// transformation: the first emitted record gains an absolute timestamp
/// and an explicit event id; later records keep their stored deltas.
fn copy_event<R: TlvSource>(
    source: &R,
    reader: &TlvReader<'_, R>,
    outer: &Element,
    ctx: &mut FetchContext<'_, '_>,
) -> Result<(), LogError> {
    let record = ctx.writer.begin_struct(None)?;
    let mut inner = reader.enter_container(outer)?;
    while let Some(e) = inner.next_element()? {
        match e.tag {
            Some(tag::DELTA_SYSTEM_TIME) if ctx.first => {
                ctx.writer
                    .put_u32(Some(tag::SYSTEM_TIMESTAMP), ctx.current_time)?;
            }
            Some(tag::DELTA_UTC_TIME) if ctx.first_utc => {
                ctx.writer.put_u64(Some(tag::UTC_TIMESTAMP), ctx.current_utc)?;
                ctx.first_utc = false;
            }
            _ => {
                ctx.writer.copy_element(source, &e)?;
            }
        }
        // the event id rides right behind the priority to keep tags ordered
        if e.tag == Some(tag::PRIORITY) && ctx.first {
            ctx.writer
                .put_u64(Some(tag::EVENT_ID), u64::from(ctx.current_id))?;
        }
    }
    ctx.writer.end_container(record)
}
