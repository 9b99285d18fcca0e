//! Sink packetizing frames into interleaved stream packets
//!
//! Each packet is one interleaved unit: a four-byte `'$'` header whose length
//! field is backfilled once the payload is known, followed by as many frames
//! as fit up to the preferred packet size. A frame larger than the remaining
//! room is split through the buffer's overflow carry.

use crate::error::{MediaError, MediaResult};
use crate::framer::{encode_interleaved_header, INTERLEAVED_HEADER_LEN, MAX_INTERLEAVED_PAYLOAD};
use crate::packet::{OutPacketBuffer, OutPacketBufferConfig};
use crate::sink::{AfterPlaying, MediaSink, Playback};
use crate::source::{micros_until, FrameEvent, FrameRequest, SharedSource};
use bytes::BytesMut;
use mediaflow_core::{Instant, Interval, TaskHandle, TaskScheduler};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::io::Write;
use std::rc::{Rc, Weak};
use tracing::{debug, trace, warn};

/// Interleaved packet sink configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InterleavedPacketSinkConfig {
    /// Channel written in every packet header
    pub channel: u8,
    /// Packet sizing
    pub packet: OutPacketBufferConfig,
    /// Space packets by the duration of the frames they carry
    pub pace_output: bool,
}

impl Default for InterleavedPacketSinkConfig {
    fn default() -> Self {
        Self {
            channel: 0,
            packet: OutPacketBufferConfig::default(),
            pace_output: true,
        }
    }
}

/// Counters kept by [`InterleavedPacketSink`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketSinkStats {
    /// Packets written
    pub packets: u64,
    /// Bytes written, headers included
    pub bytes: u64,
    /// Frames received
    pub frames: u64,
    /// Frames split across packets
    pub fragmented_frames: u64,
    /// Frames that arrived truncated
    pub truncated_frames: u64,
    /// Packet writes that failed
    pub send_errors: u64,
}

/// Packetizes frames of a source onto an interleaved byte stream
pub struct InterleavedPacketSink<W> {
    name: String,
    writer: W,
    channel: u8,
    pace_output: bool,
    packet: OutPacketBuffer,
    playback: Playback,
    buffer: Option<BytesMut>,
    frames_in_packet: u32,
    packet_duration_us: u64,
    source_closed: bool,
    next_send_time: Option<Instant>,
    task: Option<TaskHandle>,
    stats: PacketSinkStats,
    self_ref: Weak<RefCell<Self>>,
}

impl<W> std::fmt::Debug for InterleavedPacketSink<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterleavedPacketSink")
            .field("name", &self.name)
            .field("channel", &self.channel)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl<W: Write + 'static> InterleavedPacketSink<W> {
    /// Create a shared sink over `writer`
    pub fn new(
        name: impl Into<String>,
        writer: W,
        config: InterleavedPacketSinkConfig,
    ) -> MediaResult<Rc<RefCell<Self>>> {
        let max = config.packet.max_packet_size;
        if max <= INTERLEAVED_HEADER_LEN || max > INTERLEAVED_HEADER_LEN + MAX_INTERLEAVED_PAYLOAD {
            return Err(MediaError::InvalidConfiguration {
                message: format!(
                    "max_packet_size {} must be within {}..={}",
                    max,
                    INTERLEAVED_HEADER_LEN + 1,
                    INTERLEAVED_HEADER_LEN + MAX_INTERLEAVED_PAYLOAD
                ),
            });
        }
        let packet = OutPacketBuffer::new(&config.packet)?;

        Ok(Rc::new_cyclic(|self_ref| {
            RefCell::new(Self {
                name: name.into(),
                writer,
                channel: config.channel,
                pace_output: config.pace_output,
                packet,
                playback: Playback::default(),
                buffer: None,
                frames_in_packet: 0,
                packet_duration_us: 0,
                source_closed: false,
                next_send_time: None,
                task: None,
                stats: PacketSinkStats::default(),
                self_ref: self_ref.clone(),
            })
        }))
    }

    /// Packetizer counters
    pub fn stats(&self) -> PacketSinkStats {
        self.stats
    }

    /// The underlying writer
    pub fn writer(&self) -> &W {
        &self.writer
    }

    fn begin_packet(&mut self) {
        self.packet.reset_offset();
        self.packet.enqueue(&encode_interleaved_header(self.channel, 0));
        self.frames_in_packet = 0;
        self.packet_duration_us = 0;
    }

    fn build_and_send_packet(&mut self, sched: &mut TaskScheduler) -> Option<AfterPlaying> {
        self.task = None;
        if !self.playback.is_playing() {
            return None;
        }

        self.begin_packet();
        if self.packet.have_overflow_data() {
            let presentation_time = self.packet.overflow_presentation_time();
            let duration_us = self.packet.overflow_duration_us();
            let size = self.packet.use_overflow_data();
            return self.pack_frame(sched, size, presentation_time, duration_us);
        }
        if self.source_closed {
            return self.playback.finish();
        }
        self.request_frame(sched)
    }

    /// Ask for the next frame; a refused request ends playback like a close
    fn request_frame(&mut self, sched: &mut TaskScheduler) -> Option<AfterPlaying> {
        let Err(e) = self.issue_request(sched) else {
            return None;
        };
        warn!(sink = %self.name, "could not request next frame, finishing: {}", e);
        self.source_closed = true;
        self.send_packet(sched)
    }

    fn issue_request(&mut self, sched: &mut TaskScheduler) -> MediaResult<()> {
        let max_size = self.packet.total_bytes_available();
        let buffer = self
            .buffer
            .take()
            .unwrap_or_else(|| BytesMut::with_capacity(max_size));
        let weak = self.self_ref.clone();
        let request = FrameRequest::new(buffer, max_size, move |sched, event| {
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

    fn after_getting_frame(&mut self, sched: &mut TaskScheduler, event: FrameEvent) -> Option<AfterPlaying> {
        match event {
            FrameEvent::Frame(frame) => {
                if frame.truncated_bytes > 0 {
                    warn!(
                        sink = %self.name,
                        truncated = frame.truncated_bytes,
                        "frame truncated; consider a larger packet buffer"
                    );
                    self.stats.truncated_frames += 1;
                }
                self.stats.frames += 1;

                // In place at the cursor; `pack_frame` decides how much of it
                // belongs to this packet.
                let chunk = self.packet.cur_chunk_mut();
                let size = frame.data.len().min(chunk.len());
                chunk[..size].copy_from_slice(&frame.data[..size]);
                let (presentation_time, duration_us) = (frame.presentation_time, frame.duration_us);
                self.buffer = Some(frame.data);
                self.pack_frame(sched, size, presentation_time, duration_us)
            }
            FrameEvent::Closed => {
                debug!(sink = %self.name, packets = self.stats.packets, "source closed");
                self.source_closed = true;
                self.send_packet(sched)
            }
        }
    }

    /// Account for `size` frame bytes sitting at the cursor
    fn pack_frame(
        &mut self,
        sched: &mut TaskScheduler,
        size: usize,
        presentation_time: Instant,
        duration_us: u64,
    ) -> Option<AfterPlaying> {
        let mut used = size;
        if self.packet.would_overflow(size) {
            if self.frames_in_packet == 0 {
                // Nothing else in this packet: split the frame.
                used = size - self.packet.num_overflow_bytes(size);
                self.stats.fragmented_frames += 1;
            } else {
                // Carry the whole frame over to the next packet.
                used = 0;
            }
            let offset = self.packet.cur_packet_size() + used;
            self.packet
                .set_overflow_data(offset, size - used, presentation_time, duration_us);
        }

        if used > 0 {
            self.packet.increment(used);
            self.frames_in_packet += 1;
            if !self.packet.have_overflow_data() {
                self.packet_duration_us += duration_us;
            }
        }
        trace!(sink = %self.name, size, used, "frame packed");

        if self.packet.have_overflow_data() || self.packet.is_preferred_size() || self.source_closed {
            self.send_packet(sched)
        } else {
            self.request_frame(sched)
        }
    }

    fn send_packet(&mut self, sched: &mut TaskScheduler) -> Option<AfterPlaying> {
        let payload = self.packet.cur_packet_size() - INTERLEAVED_HEADER_LEN;
        if payload > 0 {
            // Bounded by the validated max packet size.
            let length = u16::try_from(payload).unwrap_or(u16::MAX);
            self.packet.insert(&length.to_be_bytes(), 2);
            match self.writer.write_all(self.packet.packet()) {
                Ok(()) => {
                    self.stats.packets += 1;
                    self.stats.bytes += self.packet.cur_packet_size() as u64;
                }
                Err(e) => {
                    warn!(sink = %self.name, "packet write failed: {}", e);
                    self.stats.send_errors += 1;
                }
            }
        }

        if self.packet.have_overflow_data()
            && self.packet.total_bytes_available() > self.packet.total_buffer_size() / 2
        {
            // Start the next packet just in front of the carried bytes so
            // they need not move.
            let start = self.packet.overflow_data_offset() - INTERLEAVED_HEADER_LEN;
            self.packet.adjust_packet_start(start);
        } else {
            self.packet.reset_packet_start();
        }

        if self.source_closed && !self.packet.have_overflow_data() {
            if let Err(e) = self.writer.flush() {
                warn!(sink = %self.name, "final flush failed: {}", e);
            }
            return self.playback.finish();
        }

        let delay = if self.pace_output {
            let now = sched.now();
            let next = self.next_send_time.unwrap_or(now).max(now)
                + Interval::from_micros(self.packet_duration_us);
            self.next_send_time = Some(next);
            micros_until(sched, next)
        } else {
            0
        };
        self.schedule_next_packet(sched, delay);
        None
    }

    fn schedule_next_packet(&mut self, sched: &mut TaskScheduler, delay_us: i64) {
        let weak = self.self_ref.clone();
        self.task = Some(sched.schedule_delayed_task(delay_us, move |sched| {
            let Some(sink) = weak.upgrade() else {
                return;
            };
            let after_playing = sink.borrow_mut().build_and_send_packet(sched);
            if let Some(after_playing) = after_playing {
                after_playing(sched);
            }
        }));
    }
}

impl<W: Write + 'static> MediaSink for InterleavedPacketSink<W> {
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
        self.source_closed = false;
        self.next_send_time = None;
        self.packet.reset_overflow_data();
        self.packet.reset_packet_start();
        self.continue_playing(sched)
    }

    fn stop_playing(&mut self, sched: &mut TaskScheduler) {
        if let Some(task) = self.task.take() {
            sched.unschedule_delayed_task(task);
        }
        self.playback.stop(sched);
        self.packet.reset_overflow_data();
    }

    fn continue_playing(&mut self, sched: &mut TaskScheduler) -> MediaResult<()> {
        self.begin_packet();
        self.issue_request(sched)
    }

    fn is_playing(&self) -> bool {
        self.playback.is_playing()
    }
}
