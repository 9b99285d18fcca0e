//! Frame source reading an undifferentiated byte stream

use crate::error::MediaResult;
use crate::source::{fire, micros_until, Completion, FrameRequest, FrameState, FramedSource, SourceStats};
use mediaflow_core::{Instant, Interval, TaskHandle, TaskScheduler};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::io::{ErrorKind, Read};
use std::rc::{Rc, Weak};
use tracing::{debug, warn};

/// Byte stream source configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ByteStreamConfig {
    /// Bytes per read (0 = as many as the consumer accepts)
    pub preferred_frame_size: usize,
    /// Presentation duration of a preferred-size frame in microseconds
    /// (0 = deliver as fast as requested)
    pub play_time_per_frame_us: u64,
    /// Stop after this many bytes
    pub limit: Option<u64>,
}

/// Reads a byte stream (file, pipe, in-memory cursor) in chunks
///
/// Each request is served by a delayed task. With a play time per frame,
/// presentation times advance by the duration of each delivered chunk and
/// delivery waits until the chunk is due. End of stream and read errors
/// close the source.
pub struct ByteStreamSource<R> {
    name: String,
    reader: R,
    config: ByteStreamConfig,
    state: FrameState,
    task: Option<TaskHandle>,
    next_presentation: Option<Instant>,
    bytes_read: u64,
    self_ref: Weak<RefCell<Self>>,
}

impl<R: Read + 'static> ByteStreamSource<R> {
    /// Create a shared source over `reader`
    pub fn new(name: impl Into<String>, reader: R, config: ByteStreamConfig) -> Rc<RefCell<Self>> {
        Rc::new_cyclic(|self_ref| {
            RefCell::new(Self {
                name: name.into(),
                reader,
                config,
                state: FrameState::new(),
                task: None,
                next_presentation: None,
                bytes_read: 0,
                self_ref: self_ref.clone(),
            })
        })
    }

    /// Total bytes read so far
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Delivery counters
    pub fn stats(&self) -> SourceStats {
        self.state.stats()
    }

    fn frame_duration_us(&self, size: usize) -> u64 {
        let per_frame = self.config.play_time_per_frame_us;
        match self.config.preferred_frame_size {
            0 => per_frame,
            preferred => {
                let scaled = u128::from(per_frame) * size as u128 / preferred as u128;
                u64::try_from(scaled).unwrap_or(u64::MAX)
            }
        }
    }

    fn read_size(&self) -> usize {
        let mut size = self.state.max_size();
        if self.config.preferred_frame_size > 0 {
            size = size.min(self.config.preferred_frame_size);
        }
        if let Some(limit) = self.config.limit {
            let remaining = limit.saturating_sub(self.bytes_read);
            size = size.min(usize::try_from(remaining).unwrap_or(usize::MAX));
        }
        size
    }

    fn read_chunk(&mut self, sched: &TaskScheduler) -> Option<Completion> {
        self.task = None;
        if !self.state.is_awaiting() {
            return None;
        }

        let size = self.read_size();
        if size == 0 {
            debug!(source = %self.name, bytes = self.bytes_read, "read limit reached");
            return self.state.close();
        }

        let mut chunk = vec![0u8; size];
        let n = loop {
            match self.reader.read(&mut chunk) {
                Ok(n) => break n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(source = %self.name, "read failed, closing: {}", e);
                    return self.state.close();
                }
            }
        };
        if n == 0 {
            debug!(source = %self.name, bytes = self.bytes_read, "end of stream");
            return self.state.close();
        }
        self.bytes_read += n as u64;

        let presentation_time = self.next_presentation.unwrap_or_else(|| sched.now());
        let duration_us = self.frame_duration_us(n);
        self.next_presentation = Some(presentation_time + Interval::from_micros(duration_us));
        self.state.complete(&chunk[..n], presentation_time, duration_us)
    }
}

impl<R: Read + 'static> FramedSource for ByteStreamSource<R> {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_next_frame(&mut self, sched: &mut TaskScheduler, request: FrameRequest) -> MediaResult<()> {
        self.state.begin(&self.name, request)?;

        // The first chunk goes out at once; later ones when they are due.
        let delay = match self.next_presentation {
            Some(due) if self.config.play_time_per_frame_us > 0 => micros_until(sched, due),
            _ => 0,
        };
        let weak = self.self_ref.clone();
        self.task = Some(sched.schedule_delayed_task(delay, move |sched| {
            let Some(source) = weak.upgrade() else {
                return;
            };
            let completion = source.borrow_mut().read_chunk(sched);
            fire(completion, sched);
        }));
        Ok(())
    }

    fn stop_getting_frames(&mut self, sched: &mut TaskScheduler) {
        if let Some(task) = self.task.take() {
            sched.unschedule_delayed_task(task);
        }
        self.state.cancel();
    }

    fn is_currently_awaiting_data(&self) -> bool {
        self.state.is_awaiting()
    }

    fn max_frame_size(&self) -> usize {
        self.config.preferred_frame_size
    }
}
