//! Bridge from the event loop to async consumers
//!
//! [`ChannelSink`] plays a source on the event loop thread and forwards every
//! frame over an unbounded `tokio` channel. The paired [`FrameReceiver`] can
//! move to any thread or task and be read as a [`Stream`]; it ends when the
//! source closes.

use crate::{
    AfterPlaying, DeliveredFrame, FrameEvent, FrameRequest, Instant, MediaError, MediaResult, MediaSink, Playback,
    SharedSource, TaskScheduler,
};
use bytes::{Bytes, BytesMut};
use futures::Stream;
use std::cell::RefCell;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// A frame handed to an async consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardedFrame {
    /// Frame payload
    pub data: Bytes,
    /// Bytes the producer dropped to fit the sink's buffer
    pub truncated_bytes: usize,
    /// Presentation instant
    pub presentation_time: Instant,
    /// Duration in microseconds (0 if unknown)
    pub duration_us: u64,
}

impl From<DeliveredFrame> for ForwardedFrame {
    fn from(frame: DeliveredFrame) -> Self {
        Self {
            data: frame.data.freeze(),
            truncated_bytes: frame.truncated_bytes,
            presentation_time: frame.presentation_time,
            duration_us: frame.duration_us,
        }
    }
}

/// Sink forwarding frames into a channel
pub struct ChannelSink {
    name: String,
    buffer_size: usize,
    sender: Option<mpsc::UnboundedSender<ForwardedFrame>>,
    playback: Playback,
    forwarded: u64,
    self_ref: Weak<RefCell<Self>>,
}

impl ChannelSink {
    /// Create a sink and the receiver for its frames
    pub fn new(name: impl Into<String>, buffer_size: usize) -> (Rc<RefCell<Self>>, FrameReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let sink = Rc::new_cyclic(|self_ref| {
            RefCell::new(Self {
                name: name.into(),
                buffer_size,
                sender: Some(sender),
                playback: Playback::default(),
                forwarded: 0,
                self_ref: self_ref.clone(),
            })
        });
        (sink, FrameReceiver { receiver })
    }

    /// Frames sent so far
    pub fn forwarded(&self) -> u64 {
        self.forwarded
    }

    fn after_getting_frame(&mut self, sched: &mut TaskScheduler, event: FrameEvent) -> Option<AfterPlaying> {
        match event {
            FrameEvent::Frame(frame) => {
                let size = frame.data.len();
                let sent = match &self.sender {
                    Some(sender) => sender.send(frame.into()).is_ok(),
                    None => false,
                };
                if !sent {
                    // Nobody left to consume: end playback as if the source closed.
                    debug!(sink = %self.name, "receiver dropped, stopping");
                    if let Some(source) = self.playback.source() {
                        source.borrow_mut().stop_getting_frames(sched);
                    }
                    self.sender = None;
                    return self.playback.finish();
                }
                self.forwarded += 1;
                trace!(sink = %self.name, size, "frame forwarded");
                match self.continue_playing(sched) {
                    Ok(()) => None,
                    Err(e) => {
                        debug!(sink = %self.name, "could not request next frame, finishing: {}", e);
                        self.sender = None;
                        self.playback.finish()
                    }
                }
            }
            FrameEvent::Closed => {
                debug!(sink = %self.name, frames = self.forwarded, "source closed");
                // Dropping the sender ends the receiver's stream.
                self.sender = None;
                self.playback.finish()
            }
        }
    }
}

impl MediaSink for ChannelSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn start_playing(
        &mut self,
        sched: &mut TaskScheduler,
        source: SharedSource,
        after_playing: AfterPlaying,
    ) -> MediaResult<()> {
        if self.sender.is_none() {
            return Err(MediaError::InvalidState {
                message: format!("channel of {} is closed", self.name),
            });
        }
        self.playback.start(&self.name, source, after_playing)?;
        self.continue_playing(sched)
    }

    fn stop_playing(&mut self, sched: &mut TaskScheduler) {
        self.playback.stop(sched);
    }

    fn continue_playing(&mut self, sched: &mut TaskScheduler) -> MediaResult<()> {
        // Each frame leaves with its buffer, so every request gets a fresh one.
        let buffer = BytesMut::with_capacity(self.buffer_size);
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

/// Async end of a [`ChannelSink`]
#[derive(Debug)]
pub struct FrameReceiver {
    receiver: mpsc::UnboundedReceiver<ForwardedFrame>,
}

impl FrameReceiver {
    /// Wait for the next frame; `None` once the source has closed
    pub async fn next(&mut self) -> Option<ForwardedFrame> {
        self.receiver.recv().await
    }

    /// Take a frame if one is ready
    pub fn try_next(&mut self) -> Option<ForwardedFrame> {
        self.receiver.try_recv().ok()
    }

    /// Stop accepting frames; the sink ends playback on its next frame
    pub fn close(&mut self) {
        self.receiver.close();
    }
}

impl Stream for FrameReceiver {
    type Item = ForwardedFrame;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}
