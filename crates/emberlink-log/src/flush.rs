//! Offload and flush scheduling.
//!
//! The log does not move bytes off the device itself; it decides *when* an
//! offload should run and hands the work to an embedder-supplied
//! [`BulkUploader`]. Scheduling is a small state machine driven from two
//! edges: `schedule_flush_if_needed` (called on the write path, possibly
//! from other threads, hence the CAS guard in the engine) and the
//! host-polled timer.

use crate::error::LogError;

/// Uploader seam for bulk offload of the log.
pub trait BulkUploader: Send {
    /// Begins an upload pass. The uploader reports completion through
    /// `EventLog::signal_upload_done`.
    fn start_upload(&mut self) -> Result<(), LogError>;

    /// Total log bytes the uploader has offloaded so far.
    fn upload_position(&self) -> u64;
}

/// Position provider for notification-path subscribers.
pub trait SubscriberPositions: Send {
    /// The smallest log position (in bytes written) across all live
    /// subscribers, or `None` when there are none.
    fn min_log_position(&self) -> Option<u64>;
}

/// Flush state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushState {
    /// Nothing in flight; a trigger may start an upload.
    Idle,
    /// An upload pass is running.
    InProgress,
    /// An upload just finished; wait out the minimum interval.
    Holdoff,
    /// The log has been shut down; no further scheduling.
    Shutdown,
}

/// Flush timing and trigger thresholds.
#[derive(Debug, Clone, Copy)]
pub struct FlushConfig {
    /// Bytes pending beyond the uploader position that trigger a bulk
    /// offload.
    pub upload_threshold: u64,
    /// Bytes pending beyond the slowest subscriber that trigger a
    /// notification pass.
    pub byte_threshold: u64,
    /// Minimum milliseconds between upload passes.
    pub min_upload_interval_ms: u64,
    /// Maximum milliseconds to wait before retrying when no upload could
    /// start.
    pub max_upload_interval_ms: u64,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            upload_threshold: 1024,
            byte_threshold: 512,
            min_upload_interval_ms: 5_000,
            max_upload_interval_ms: 300_000,
        }
    }
}

pub(crate) struct FlushScheduler {
    pub(crate) state: FlushState,
    config: FlushConfig,
    uploader: Option<Box<dyn BulkUploader>>,
    subscribers: Option<Box<dyn SubscriberPositions>>,
    timer_deadline: Option<u64>,
    work_pending: bool,
}

/// What the state-machine step asks the engine to do with the
/// `upload_requested` flag.
pub(crate) enum FlagOp {
    None,
    /// Clear, then re-request if the trigger predicates still hold.
    Reevaluate,
}

impl FlushScheduler {
    pub(crate) fn new(config: FlushConfig) -> Self {
        Self {
            state: FlushState::Idle,
            config,
            uploader: None,
            subscribers: None,
            timer_deadline: None,
            work_pending: false,
        }
    }

    pub(crate) fn set_uploader(&mut self, uploader: Box<dyn BulkUploader>) {
        if self.uploader.is_some() {
            tracing::error!("bulk uploader already set");
            return;
        }
        self.uploader = Some(uploader);
    }

    pub(crate) fn set_subscribers(&mut self, subscribers: Box<dyn SubscriberPositions>) {
        self.subscribers = Some(subscribers);
    }

    /// Trigger predicates: bulk path and notification path.
    pub(crate) fn should_flush(&self, bytes_written: u64) -> bool {
        let bulk = self
            .uploader
            .as_ref()
            .is_some_and(|u| bytes_written.saturating_sub(u.upload_position()) > self.config.upload_threshold);
        let notify = self
            .subscribers
            .as_ref()
            .and_then(|s| s.min_log_position())
            .is_some_and(|min| min + self.config.byte_threshold < bytes_written);
        bulk || notify
    }

    pub(crate) fn request_work(&mut self) {
        self.work_pending = true;
    }

    /// True when the host's poll should run the handler.
    pub(crate) fn due(&self, now: u64) -> bool {
        self.work_pending || self.timer_deadline.is_some_and(|d| d <= now)
    }

    /// One step of the flush handler. Returns how the engine must update
    /// the shared `upload_requested` flag.
    pub(crate) fn run(&mut self, now: u64) -> FlagOp {
        self.work_pending = false;
        self.timer_deadline = None;

        match self.state {
            FlushState::Idle => {
                if let Some(uploader) = self.uploader.as_mut() {
                    self.state = FlushState::InProgress;
                    if let Err(err) = uploader.start_upload() {
                        tracing::error!(%err, "failed to start log upload");
                    }
                } else {
                    // no destination yet: retry at the maximum interval
                    self.timer_deadline = Some(now + self.config.max_upload_interval_ms);
                }
                FlagOp::None
            }
            FlushState::Holdoff => {
                self.state = FlushState::Idle;
                FlagOp::Reevaluate
            }
            FlushState::InProgress | FlushState::Shutdown => FlagOp::None,
        }
    }

    /// Arms the max-interval retry timer; used when a holdoff
    /// re-evaluation found nothing to do.
    pub(crate) fn arm_retry(&mut self, now: u64) {
        self.timer_deadline = Some(now + self.config.max_upload_interval_ms);
    }

    /// Upload completion: enter holdoff and wait out the minimum interval.
    pub(crate) fn upload_done(&mut self, now: u64) {
        if self.state == FlushState::InProgress {
            self.state = FlushState::Holdoff;
            self.timer_deadline = Some(now + self.config.min_upload_interval_ms);
        }
    }

    pub(crate) fn shutdown(&mut self) {
        self.state = FlushState::Shutdown;
        self.timer_deadline = None;
        self.work_pending = false;
    }
}
