//! Frame data-flow contract between producers and consumers
//!
//! A consumer asks a [`FramedSource`] for the next frame by handing it a
//! [`FrameRequest`]: a buffer it owns, the most bytes it will accept, and a
//! continuation. The call returns immediately. Later, from a delayed task or
//! a readiness handler, the producer invokes the continuation exactly once
//! with either a frame or a closure notice. It never does so from inside
//! `get_next_frame` itself.
//!
//! Producers keep their outstanding request in a [`FrameState`]. Finishing
//! a request yields a [`Completion`] that must be fired *after* the
//! producer's `RefCell` borrow has ended, so the consumer may immediately ask
//! for the next frame from inside its continuation.

use crate::error::{MediaError, MediaResult};
use bytes::BytesMut;
use mediaflow_core::{Instant, Interval, TaskScheduler};
use std::cell::RefCell;
use std::rc::Rc;
use tracing::trace;

/// Shared handle to a producer
pub type SharedSource = Rc<RefCell<dyn FramedSource>>;

/// Continuation invoked once per frame request
pub type FrameContinuation = Box<dyn FnOnce(&mut TaskScheduler, FrameEvent)>;

/// Outcome of a frame request
#[derive(Debug)]
pub enum FrameEvent {
    /// A frame was delivered
    Frame(DeliveredFrame),
    /// The source has no more data
    Closed,
}

/// Frame returned to the consumer
#[derive(Debug)]
pub struct DeliveredFrame {
    /// The consumer's buffer, now holding the frame bytes
    pub data: BytesMut,
    /// Bytes of the unit dropped because it exceeded the requested maximum
    pub truncated_bytes: usize,
    /// When the frame is meant to be presented
    pub presentation_time: Instant,
    /// How long the frame lasts, in microseconds (0 if unknown)
    pub duration_us: u64,
}

impl DeliveredFrame {
    /// Number of bytes delivered
    pub fn frame_size(&self) -> usize {
        self.data.len()
    }
}

/// A request for the next frame
pub struct FrameRequest {
    buffer: BytesMut,
    max_size: usize,
    on_event: FrameContinuation,
}

impl FrameRequest {
    /// Request at most `max_size` bytes into `buffer`
    pub fn new(
        buffer: BytesMut,
        max_size: usize,
        on_event: impl FnOnce(&mut TaskScheduler, FrameEvent) + 'static,
    ) -> Self {
        Self {
            buffer,
            max_size,
            on_event: Box::new(on_event),
        }
    }

    /// Request into a freshly allocated buffer
    pub fn with_capacity(
        max_size: usize,
        on_event: impl FnOnce(&mut TaskScheduler, FrameEvent) + 'static,
    ) -> Self {
        Self::new(BytesMut::with_capacity(max_size), max_size, on_event)
    }

    /// Largest frame the consumer accepts
    pub fn max_size(&self) -> usize {
        self.max_size
    }
}

impl std::fmt::Debug for FrameRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameRequest")
            .field("max_size", &self.max_size)
            .finish_non_exhaustive()
    }
}

/// A finished request whose continuation has not run yet
#[must_use = "the consumer is only notified once the completion is fired"]
pub struct Completion {
    on_event: FrameContinuation,
    event: FrameEvent,
}

impl Completion {
    /// Invoke the consumer's continuation
    pub fn fire(self, sched: &mut TaskScheduler) {
        (self.on_event)(sched, self.event)
    }

    /// Event the continuation will receive
    pub fn event(&self) -> &FrameEvent {
        &self.event
    }
}

/// Fire an optional completion
pub fn fire(completion: Option<Completion>, sched: &mut TaskScheduler) {
    if let Some(completion) = completion {
        completion.fire(sched);
    }
}

/// Delivery counters kept by every producer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceStats {
    /// Frames delivered
    pub frames: u64,
    /// Bytes delivered
    pub bytes: u64,
    /// Bytes dropped by truncation
    pub truncated_bytes: u64,
}

/// Bookkeeping for a producer's outstanding request
#[derive(Default)]
pub struct FrameState {
    pending: Option<FrameRequest>,
    closed: bool,
    stats: SourceStats,
}

impl FrameState {
    /// Create an idle state
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept a new request; fails if one is already outstanding
    pub fn begin(&mut self, source_name: &str, request: FrameRequest) -> MediaResult<()> {
        if self.pending.is_some() {
            return Err(MediaError::ReadInProgress {
                source_name: source_name.to_string(),
            });
        }
        self.pending = Some(request);
        Ok(())
    }

    /// Whether a request is outstanding
    pub fn is_awaiting(&self) -> bool {
        self.pending.is_some()
    }

    /// Maximum size of the outstanding request (0 if none)
    pub fn max_size(&self) -> usize {
        self.pending.as_ref().map_or(0, FrameRequest::max_size)
    }

    /// Whether the producer has reported closure
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Delivery counters so far
    pub fn stats(&self) -> SourceStats {
        self.stats
    }

    /// Finish the outstanding request with `unit`
    ///
    /// Bytes past the request's maximum are dropped and reported as
    /// truncated. Returns `None` if no request is outstanding.
    pub fn complete(
        &mut self,
        unit: &[u8],
        presentation_time: Instant,
        duration_us: u64,
    ) -> Option<Completion> {
        let FrameRequest {
            mut buffer,
            max_size,
            on_event,
        } = self.pending.take()?;

        let size = unit.len().min(max_size);
        let truncated_bytes = unit.len() - size;
        buffer.clear();
        buffer.extend_from_slice(&unit[..size]);

        self.stats.frames += 1;
        self.stats.bytes += size as u64;
        self.stats.truncated_bytes += truncated_bytes as u64;
        trace!(size, truncated_bytes, %presentation_time, "frame completed");

        Some(Completion {
            on_event,
            event: FrameEvent::Frame(DeliveredFrame {
                data: buffer,
                truncated_bytes,
                presentation_time,
                duration_us,
            }),
        })
    }

    /// Finish the outstanding request with a closure notice
    pub fn close(&mut self) -> Option<Completion> {
        self.closed = true;
        let request = self.pending.take()?;
        Some(Completion {
            on_event: request.on_event,
            event: FrameEvent::Closed,
        })
    }

    /// Drop the outstanding request without notifying anyone
    pub fn cancel(&mut self) -> bool {
        self.pending.take().is_some()
    }
}

impl std::fmt::Debug for FrameState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameState")
            .field("awaiting", &self.is_awaiting())
            .field("closed", &self.closed)
            .field("stats", &self.stats)
            .finish()
    }
}

/// A producer of discrete frames
pub trait FramedSource {
    /// Name used in logs and errors
    fn name(&self) -> &str;

    /// Ask for the next frame; the request completes later, exactly once
    fn get_next_frame(&mut self, sched: &mut TaskScheduler, request: FrameRequest) -> MediaResult<()>;

    /// Cancel the outstanding request; its continuation will never run
    fn stop_getting_frames(&mut self, sched: &mut TaskScheduler);

    /// Whether a request is outstanding
    fn is_currently_awaiting_data(&self) -> bool;

    /// Largest frame this source produces, if known (0 = unknown)
    fn max_frame_size(&self) -> usize {
        0
    }
}

/// Delay in microseconds from now until `at`, for scheduling
pub(crate) fn micros_until(sched: &TaskScheduler, at: Instant) -> i64 {
    interval_micros(at.saturating_duration_since(sched.now()))
}

pub(crate) fn interval_micros(interval: Interval) -> i64 {
    i64::try_from(interval.as_micros()).unwrap_or(i64::MAX)
}
