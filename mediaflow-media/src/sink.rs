//! Frame consumers
//!
//! A sink pulls frames from one source at a time. `start_playing` issues the
//! first request; every notification triggers the next one until the source
//! closes, at which point the `after_playing` callback runs once.

use crate::error::{MediaError, MediaResult};
use crate::source::{FrameEvent, FrameRequest, SharedSource};
use bytes::BytesMut;
use mediaflow_core::TaskScheduler;
use std::cell::RefCell;
use std::io::Write;
use std::rc::{Rc, Weak};
use tracing::{debug, trace, warn};

/// Callback run once when a sink's source closes
pub type AfterPlaying = Box<dyn FnOnce(&mut TaskScheduler)>;

/// Default per-frame buffer size for sinks
pub const DEFAULT_SINK_BUFFER_SIZE: usize = 100_000;

/// A consumer of frames
pub trait MediaSink {
    /// Name used in logs and errors
    fn name(&self) -> &str;

    /// Start consuming `source`; `after_playing` runs when it closes
    fn start_playing(
        &mut self,
        sched: &mut TaskScheduler,
        source: SharedSource,
        after_playing: AfterPlaying,
    ) -> MediaResult<()>;

    /// Stop consuming; the source is stopped and `after_playing` is dropped
    fn stop_playing(&mut self, sched: &mut TaskScheduler);

    /// Request the next frame from the current source
    fn continue_playing(&mut self, sched: &mut TaskScheduler) -> MediaResult<()>;

    /// Whether a source is attached
    fn is_playing(&self) -> bool;
}

/// Source attachment shared by sink implementations
#[derive(Default)]
pub struct Playback {
    source: Option<SharedSource>,
    after_playing: Option<AfterPlaying>,
}

impl Playback {
    /// Attach `source`; fails if one is already attached
    pub fn start(&mut self, sink_name: &str, source: SharedSource, after_playing: AfterPlaying) -> MediaResult<()> {
        if self.source.is_some() {
            return Err(MediaError::AlreadyPlaying {
                sink_name: sink_name.to_string(),
            });
        }
        debug!(sink = sink_name, source = source.borrow().name(), "start playing");
        self.source = Some(source);
        self.after_playing = Some(after_playing);
        Ok(())
    }

    /// The attached source
    pub fn source(&self) -> Option<&SharedSource> {
        self.source.as_ref()
    }

    /// Whether a source is attached
    pub fn is_playing(&self) -> bool {
        self.source.is_some()
    }

    /// Detach and stop the source, dropping `after_playing`
    pub fn stop(&mut self, sched: &mut TaskScheduler) {
        self.after_playing = None;
        if let Some(source) = self.source.take() {
            source.borrow_mut().stop_getting_frames(sched);
        }
    }

    /// Detach after the source closed, handing back `after_playing`
    pub fn finish(&mut self) -> Option<AfterPlaying> {
        self.source = None;
        self.after_playing.take()
    }

    /// Issue a request to the attached source
    pub fn request(&self, sched: &mut TaskScheduler, request: FrameRequest) -> MediaResult<()> {
        match &self.source {
            Some(source) => source.borrow_mut().get_next_frame(sched, request),
            None => Err(MediaError::InvalidState {
                message: "no source attached".to_string(),
            }),
        }
    }
}

/// Counters kept by [`FileSink`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileSinkStats {
    /// Frames written
    pub frames: u64,
    /// Bytes written
    pub bytes: u64,
    /// Frames that arrived truncated
    pub truncated_frames: u64,
    /// Writes that failed
    pub write_errors: u64,
}

/// Writes each frame to a writer
pub struct FileSink<W> {
    name: String,
    writer: W,
    buffer_size: usize,
    flush_every_frame: bool,
    buffer: Option<BytesMut>,
    playback: Playback,
    stats: FileSinkStats,
    self_ref: Weak<RefCell<Self>>,
}

impl<W: Write + 'static> FileSink<W> {
    /// Create a shared sink over `writer`
    pub fn new(name: impl Into<String>, writer: W, buffer_size: usize, flush_every_frame: bool) -> Rc<RefCell<Self>> {
        Rc::new_cyclic(|self_ref| {
            RefCell::new(Self {
                name: name.into(),
                writer,
                buffer_size,
                flush_every_frame,
                buffer: None,
                playback: Playback::default(),
                stats: FileSinkStats::default(),
                self_ref: self_ref.clone(),
            })
        })
    }

    /// Write counters
    pub fn stats(&self) -> FileSinkStats {
        self.stats
    }

    /// The underlying writer
    pub fn writer(&self) -> &W {
        &self.writer
    }

    fn write_frame(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.writer.write_all(data)?;
        if self.flush_every_frame {
            self.writer.flush()?;
        }
        Ok(())
    }

    fn after_getting_frame(&mut self, sched: &mut TaskScheduler, event: FrameEvent) -> Option<AfterPlaying> {
        match event {
            FrameEvent::Frame(frame) => {
                if frame.truncated_bytes > 0 {
                    warn!(
                        sink = %self.name,
                        truncated = frame.truncated_bytes,
                        "frame truncated; consider a larger buffer"
                    );
                    self.stats.truncated_frames += 1;
                }
                match self.write_frame(&frame.data) {
                    Ok(()) => {
                        self.stats.frames += 1;
                        self.stats.bytes += frame.data.len() as u64;
                    }
                    Err(e) => {
                        warn!(sink = %self.name, "write failed: {}", e);
                        self.stats.write_errors += 1;
                    }
                }
                trace!(sink = %self.name, size = frame.data.len(), "frame written");
                self.buffer = Some(frame.data);

                match self.continue_playing(sched) {
                    Ok(()) => None,
                    Err(e) => {
                        warn!(sink = %self.name, "could not request next frame, finishing: {}", e);
                        self.finish()
                    }
                }
            }
            FrameEvent::Closed => {
                debug!(sink = %self.name, frames = self.stats.frames, "source closed");
                self.finish()
            }
        }
    }

    fn finish(&mut self) -> Option<AfterPlaying> {
        if let Err(e) = self.writer.flush() {
            warn!(sink = %self.name, "final flush failed: {}", e);
        }
        self.playback.finish()
    }
}

impl<W: Write + 'static> MediaSink for FileSink<W> {
    fn name(&self) -> &str {
        &self.name
    }

    fn start_playing(
        &mut self,
        sched: &mut TaskScheduler,
        source: SharedSource,
        after_playing: AfterPlaying,
    ) -> MediaResult<()> {
        self.playback.start(&self.name, source, after_playing)?;
        self.continue_playing(sched)
    }

    fn stop_playing(&mut self, sched: &mut TaskScheduler) {
        self.playback.stop(sched);
    }

    fn continue_playing(&mut self, sched: &mut TaskScheduler) -> MediaResult<()> {
        let buffer = self
            .buffer
            .take()
            .unwrap_or_else(|| BytesMut::with_capacity(self.buffer_size));
        let weak = self.self_ref.clone();
        let request = FrameRequest::new(buffer, self.buffer_size, move |sched, event| {
            let Some(sink) = weak.upgrade() else {
                return;
            };
            let after_playing = sink.borrow_mut().after_getting_frame(sched, event);
            if let Some(after_playing) = after_playing {
                after_playing(sched);
            }
        });
        self.playback.request(sched, request)
    }

    fn is_playing(&self) -> bool {
        self.playback.is_playing()
    }
}
