//! Framer for RTP-over-stream interleaving
//!
//! Units on the stream are `'$' <channel:u8> <length:u16 BE> <payload>`.
//! The framer reads chunks from an upstream byte source, reassembles units
//! and delivers each payload as one frame.

use crate::error::{MediaError, MediaResult};
use crate::source::{
    fire, Completion, FrameEvent, FrameRequest, FrameState, FramedSource, SharedSource, SourceStats,
};
use bytes::{Buf, BufMut, BytesMut};
use mediaflow_core::{TaskHandle, TaskScheduler};
use std::cell::RefCell;
use std::io::Write;
use std::rc::{Rc, Weak};
use tracing::{debug, trace, warn};

/// Marker byte opening every interleaved unit
pub const INTERLEAVED_MARKER: u8 = b'$';

/// Size of the unit header
pub const INTERLEAVED_HEADER_LEN: usize = 4;

/// Largest payload a unit can carry
pub const MAX_INTERLEAVED_PAYLOAD: usize = u16::MAX as usize;

/// Bytes requested from upstream per read
const UPSTREAM_CHUNK: usize = 4096;

/// Parsed unit header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterleavedHeader {
    /// Channel identifier
    pub channel: u8,
    /// Payload length in bytes
    pub length: u16,
}

/// Encode a unit header
pub fn encode_interleaved_header(channel: u8, length: u16) -> [u8; INTERLEAVED_HEADER_LEN] {
    let [hi, lo] = length.to_be_bytes();
    [INTERLEAVED_MARKER, channel, hi, lo]
}

/// Parse a unit header from the start of `bytes`
///
/// `Ok(None)` if fewer than four bytes are available.
pub fn parse_interleaved_header(bytes: &[u8]) -> MediaResult<Option<InterleavedHeader>> {
    if bytes.len() < INTERLEAVED_HEADER_LEN {
        return Ok(None);
    }
    if bytes[0] != INTERLEAVED_MARKER {
        return Err(MediaError::InvalidInterleavedHeader { found: bytes[0] });
    }
    Ok(Some(InterleavedHeader {
        channel: bytes[1],
        length: u16::from_be_bytes([bytes[2], bytes[3]]),
    }))
}

/// Write one framed unit to `writer`
pub fn write_interleaved_unit<W: Write>(writer: &mut W, channel: u8, payload: &[u8]) -> MediaResult<()> {
    let length = u16::try_from(payload.len()).map_err(|_| MediaError::FrameTooLarge {
        size: payload.len(),
        limit: MAX_INTERLEAVED_PAYLOAD,
    })?;
    let mut unit = BytesMut::with_capacity(INTERLEAVED_HEADER_LEN + payload.len());
    unit.put_slice(&encode_interleaved_header(channel, length));
    unit.put_slice(payload);
    writer.write_all(&unit)?;
    Ok(())
}

/// Splits an interleaved byte stream into one frame per unit payload
///
/// A header without the marker byte is a protocol inconsistency: the framer
/// closes rather than try to resynchronise. With a channel filter, units on
/// other channels are skipped. Stopping the framer stops its input.
pub struct InterleavedFramer {
    name: String,
    input: SharedSource,
    channel: Option<u8>,
    state: FrameState,
    pending: BytesMut,
    last_channel: Option<u8>,
    reading: bool,
    input_closed: bool,
    task: Option<TaskHandle>,
    self_ref: Weak<RefCell<Self>>,
}

impl InterleavedFramer {
    /// Framer delivering units from every channel
    pub fn new(name: impl Into<String>, input: SharedSource) -> Rc<RefCell<Self>> {
        Self::build(name.into(), input, None)
    }

    /// Framer delivering only units on `channel`
    pub fn for_channel(name: impl Into<String>, input: SharedSource, channel: u8) -> Rc<RefCell<Self>> {
        Self::build(name.into(), input, Some(channel))
    }

    fn build(name: String, input: SharedSource, channel: Option<u8>) -> Rc<RefCell<Self>> {
        Rc::new_cyclic(|self_ref| {
            RefCell::new(Self {
                name,
                input,
                channel,
                state: FrameState::new(),
                pending: BytesMut::new(),
                last_channel: None,
                reading: false,
                input_closed: false,
                task: None,
                self_ref: self_ref.clone(),
            })
        })
    }

    /// Channel of the most recently delivered unit
    pub fn last_channel(&self) -> Option<u8> {
        self.last_channel
    }

    /// Delivery counters
    pub fn stats(&self) -> SourceStats {
        self.state.stats()
    }

    /// Take the next complete unit for delivery out of the reassembly buffer
    fn next_unit(&mut self) -> MediaResult<Option<(u8, BytesMut)>> {
        loop {
            let Some(header) = parse_interleaved_header(&self.pending)? else {
                return Ok(None);
            };
            let total = INTERLEAVED_HEADER_LEN + header.length as usize;
            if self.pending.len() < total {
                return Ok(None);
            }

            self.pending.advance(INTERLEAVED_HEADER_LEN);
            let payload = self.pending.split_to(header.length as usize);
            match self.channel {
                Some(wanted) if wanted != header.channel => {
                    trace!(framer = %self.name, channel = header.channel, "skipping unit");
                }
                _ => return Ok(Some((header.channel, payload))),
            }
        }
    }

    /// Deliver a buffered unit, close, or ask upstream for more bytes
    fn process(&mut self, sched: &mut TaskScheduler) -> Option<Completion> {
        if !self.state.is_awaiting() {
            return None;
        }

        match self.next_unit() {
            Ok(Some((channel, payload))) => {
                self.last_channel = Some(channel);
                let now = sched.now();
                return self.state.complete(&payload, now, 0);
            }
            Ok(None) => {}
            Err(e) => {
                warn!(framer = %self.name, "closing on protocol inconsistency: {}", e);
                self.input.borrow_mut().stop_getting_frames(sched);
                return self.state.close();
            }
        }

        if self.input_closed {
            if !self.pending.is_empty() {
                debug!(framer = %self.name, leftover = self.pending.len(), "input closed mid-unit");
            }
            return self.state.close();
        }
        self.request_input(sched);
        None
    }

    fn request_input(&mut self, sched: &mut TaskScheduler) {
        if self.reading {
            return;
        }
        let weak = self.self_ref.clone();
        let request = FrameRequest::with_capacity(UPSTREAM_CHUNK, move |sched, event| {
            let Some(framer) = weak.upgrade() else {
                return;
            };
            let completion = framer.borrow_mut().after_getting(sched, event);
            fire(completion, sched);
        });

        let result = self.input.borrow_mut().get_next_frame(sched, request);
        match result {
            Ok(()) => self.reading = true,
            Err(e) => {
                // Treat a refused request like end of input; the close is
                // delivered from a task.
                warn!(framer = %self.name, "upstream request failed, closing: {}", e);
                self.input_closed = true;
                self.schedule_processing(sched);
            }
        }
    }

    fn after_getting(&mut self, sched: &mut TaskScheduler, event: FrameEvent) -> Option<Completion> {
        self.reading = false;
        match event {
            FrameEvent::Frame(frame) => self.pending.extend_from_slice(&frame.data),
            FrameEvent::Closed => self.input_closed = true,
        }
        self.process(sched)
    }

    fn schedule_processing(&mut self, sched: &mut TaskScheduler) {
        if let Some(task) = self.task.take() {
            sched.unschedule_delayed_task(task);
        }
        let weak = self.self_ref.clone();
        self.task = Some(sched.schedule_delayed_task(0, move |sched| {
            let Some(framer) = weak.upgrade() else {
                return;
            };
            let completion = {
                let mut framer = framer.borrow_mut();
                framer.task = None;
                framer.process(sched)
            };
            fire(completion, sched);
        }));
    }
}

impl FramedSource for InterleavedFramer {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_next_frame(&mut self, sched: &mut TaskScheduler, request: FrameRequest) -> MediaResult<()> {
        self.state.begin(&self.name, request)?;

        // Anything already buffered (or a closed input) is handled from a
        // task so the request never completes inside this call.
        if self.input_closed || !self.pending.is_empty() {
            self.schedule_processing(sched);
        } else {
            self.request_input(sched);
        }
        Ok(())
    }

    fn stop_getting_frames(&mut self, sched: &mut TaskScheduler) {
        if let Some(task) = self.task.take() {
            sched.unschedule_delayed_task(task);
        }
        self.state.cancel();
        if self.reading {
            self.input.borrow_mut().stop_getting_frames(sched);
            self.reading = false;
        }
    }

    fn is_currently_awaiting_data(&self) -> bool {
        self.state.is_awaiting()
    }

    fn max_frame_size(&self) -> usize {
        MAX_INTERLEAVED_PAYLOAD
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        let header = encode_interleaved_header(3, 0x0102);
        assert_eq!(header, [b'$', 3, 0x01, 0x02]);
        assert_eq!(
            parse_interleaved_header(&header).unwrap(),
            Some(InterleavedHeader {
                channel: 3,
                length: 0x0102
            })
        );
    }

    #[test]
    fn test_short_header_needs_more() {
        assert_eq!(parse_interleaved_header(b"$\x00").unwrap(), None);
    }

    #[test]
    fn test_bad_marker() {
        let err = parse_interleaved_header(b"RTSP").unwrap_err();
        assert!(matches!(err, MediaError::InvalidInterleavedHeader { found: b'R' }));
    }

    #[test]
    fn test_write_unit() {
        let mut out = Vec::new();
        write_interleaved_unit(&mut out, 1, b"abc").unwrap();
        assert_eq!(out, b"$\x01\x00\x03abc");

        let too_big = vec![0u8; MAX_INTERLEAVED_PAYLOAD + 1];
        let err = write_interleaved_unit(&mut out, 1, &too_big).unwrap_err();
        assert_eq!(err.error_code(), "FRAME_TOO_LARGE");
    }
}
