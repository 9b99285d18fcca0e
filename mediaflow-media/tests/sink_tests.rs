//! Integration tests for sinks, the interleaved framer and packetization

use bytes::Bytes;
use mediaflow_core::{Interval, TaskScheduler};
use mediaflow_media::*;
use std::cell::{Cell, RefCell};
use std::io::Cursor;
use std::rc::{Rc, Weak};
use tokio_test::{assert_err, assert_ok};

// ============================================================================
// Helpers
// ============================================================================

fn run_until(sched: &mut TaskScheduler, mut done: impl FnMut() -> bool) {
    for _ in 0..2_000 {
        if done() {
            return;
        }
        sched.single_step(Some(Interval::from_millis(5))).unwrap();
    }
    panic!("condition not reached");
}

fn counter() -> (Rc<Cell<u32>>, AfterPlaying) {
    let count = Rc::new(Cell::new(0));
    let handle = count.clone();
    (count, Box::new(move |_: &mut TaskScheduler| handle.set(handle.get() + 1)))
}

/// Split a stream of interleaved units into (channel, payload) pairs
fn parse_units(mut bytes: &[u8]) -> Vec<(u8, Vec<u8>)> {
    let mut units = Vec::new();
    while let Some(header) = parse_interleaved_header(bytes).unwrap() {
        let end = INTERLEAVED_HEADER_LEN + header.length as usize;
        units.push((header.channel, bytes[INTERLEAVED_HEADER_LEN..end].to_vec()));
        bytes = &bytes[end..];
    }
    assert!(bytes.is_empty(), "trailing bytes after last unit");
    units
}

fn interleaved_stream(units: &[(u8, &[u8])]) -> Vec<u8> {
    let mut out = Vec::new();
    for (channel, payload) in units {
        write_interleaved_unit(&mut out, *channel, payload).unwrap();
    }
    out
}

/// Serves `unit` a fixed number of times, then refuses every request
struct RefusingSource {
    unit: Bytes,
    remaining: usize,
    state: FrameState,
    self_ref: Weak<RefCell<Self>>,
}

impl RefusingSource {
    fn new(unit: &[u8], frames: usize) -> Rc<RefCell<Self>> {
        Rc::new_cyclic(|self_ref| {
            RefCell::new(Self {
                unit: Bytes::copy_from_slice(unit),
                remaining: frames,
                state: FrameState::new(),
                self_ref: self_ref.clone(),
            })
        })
    }
}

impl FramedSource for RefusingSource {
    fn name(&self) -> &str {
        "refusing"
    }

    fn get_next_frame(&mut self, sched: &mut TaskScheduler, request: FrameRequest) -> MediaResult<()> {
        if self.remaining == 0 {
            return Err(MediaError::InvalidState {
                message: "no more frames".to_string(),
            });
        }
        self.state.begin("refusing", request)?;
        self.remaining -= 1;
        let weak = self.self_ref.clone();
        sched.schedule_delayed_task(0, move |sched| {
            let Some(source) = weak.upgrade() else {
                return;
            };
            let completion = {
                let mut source = source.borrow_mut();
                let unit = source.unit.clone();
                let now = sched.now();
                source.state.complete(&unit, now, 0)
            };
            fire(completion, sched);
        });
        Ok(())
    }

    fn stop_getting_frames(&mut self, _sched: &mut TaskScheduler) {
        self.state.cancel();
    }

    fn is_currently_awaiting_data(&self) -> bool {
        self.state.is_awaiting()
    }
}

fn unpaced(preferred: usize, max: usize) -> InterleavedPacketSinkConfig {
    InterleavedPacketSinkConfig {
        channel: 7,
        packet: OutPacketBufferConfig {
            preferred_packet_size: preferred,
            max_packet_size: max,
            buffer_size: 4_096,
        },
        pace_output: false,
    }
}

// ============================================================================
// File sink
// ============================================================================

#[test]
fn test_file_sink_copies_stream() {
    let mut sched = TaskScheduler::new().unwrap();
    let input: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
    let config = ByteStreamConfig {
        preferred_frame_size: 1_000,
        ..Default::default()
    };
    let source = ByteStreamSource::new("input", Cursor::new(input.clone()), config);
    let sink = FileSink::new("output", Vec::new(), DEFAULT_SINK_BUFFER_SIZE, false);
    let (done, after_playing) = counter();

    assert_ok!(sink
        .borrow_mut()
        .start_playing(&mut sched, source, after_playing));
    run_until(&mut sched, || done.get() > 0);

    assert_eq!(done.get(), 1);
    assert_eq!(sink.borrow().writer(), &input);
    assert_eq!(sink.borrow().stats().frames, 10);
    assert!(!sink.borrow().is_playing());
}

#[test]
fn test_file_sink_counts_truncated_frames() {
    let mut sched = TaskScheduler::new().unwrap();
    let units = [Bytes::from_static(b"0123456789"), Bytes::from_static(b"ok")];
    let source = UnitQueueSource::new("units", units, 0);
    let sink = FileSink::new("output", Vec::new(), 4, true);
    let (done, after_playing) = counter();

    assert_ok!(sink
        .borrow_mut()
        .start_playing(&mut sched, source, after_playing));
    run_until(&mut sched, || done.get() > 0);

    assert_eq!(sink.borrow().writer().as_slice(), b"0123ok");
    assert_eq!(sink.borrow().stats().truncated_frames, 1);
}

#[test]
fn test_start_while_playing_is_rejected() {
    let mut sched = TaskScheduler::new().unwrap();
    let sink = FileSink::new("output", Vec::new(), 64, false);
    let (_, first) = counter();
    let (_, second) = counter();

    assert_ok!(sink
        .borrow_mut()
        .start_playing(&mut sched, UnitQueueSource::open("a", 0), first));
    let err = assert_err!(sink
        .borrow_mut()
        .start_playing(&mut sched, UnitQueueSource::open("b", 0), second));
    assert_eq!(err.error_code(), "ALREADY_PLAYING");
}

#[test]
fn test_stop_playing_cancels_source() {
    let mut sched = TaskScheduler::new().unwrap();
    let source = UnitQueueSource::open("live", 0);
    let sink = FileSink::new("output", Vec::new(), 64, false);
    let (done, after_playing) = counter();

    assert_ok!(sink
        .borrow_mut()
        .start_playing(&mut sched, source.clone(), after_playing));
    source
        .borrow_mut()
        .push_unit(&mut sched, Bytes::from_static(b"first"));
    run_until(&mut sched, || !sink.borrow().writer().is_empty());

    sink.borrow_mut().stop_playing(&mut sched);
    assert!(!source.borrow().is_currently_awaiting_data());
    source
        .borrow_mut()
        .push_unit(&mut sched, Bytes::from_static(b"second"));
    source.borrow_mut().finish(&mut sched);
    for _ in 0..5 {
        sched.single_step(Some(Interval::from_millis(1))).unwrap();
    }

    assert_eq!(sink.borrow().writer().as_slice(), b"first");
    assert_eq!(done.get(), 0);
}

#[test]
fn test_file_sink_finishes_when_next_request_is_refused() {
    let mut sched = TaskScheduler::new().unwrap();
    let source = RefusingSource::new(b"abc", 2);
    let sink = FileSink::new("output", Vec::new(), 64, false);
    let (done, after_playing) = counter();

    assert_ok!(sink
        .borrow_mut()
        .start_playing(&mut sched, source, after_playing));
    run_until(&mut sched, || done.get() > 0);

    assert_eq!(done.get(), 1);
    assert_eq!(sink.borrow().writer().as_slice(), b"abcabc");
    assert!(!sink.borrow().is_playing());
}

// ============================================================================
// Interleaved framer
// ============================================================================

#[test]
fn test_framer_reassembles_units_across_chunks() {
    let mut sched = TaskScheduler::new().unwrap();
    let stream = interleaved_stream(&[(1, b"hello"), (0, b"skip me"), (1, b"world")]);
    let config = ByteStreamConfig {
        preferred_frame_size: 3,
        ..Default::default()
    };
    let input = ByteStreamSource::new("tcp", Cursor::new(stream), config);
    let framer = InterleavedFramer::for_channel("framer", input, 1);
    let sink = FileSink::new("output", Vec::new(), 64, false);
    let (done, after_playing) = counter();

    assert_ok!(sink
        .borrow_mut()
        .start_playing(&mut sched, framer.clone(), after_playing));
    run_until(&mut sched, || done.get() > 0);

    assert_eq!(sink.borrow().writer().as_slice(), b"helloworld");
    assert_eq!(sink.borrow().stats().frames, 2);
    assert_eq!(framer.borrow().last_channel(), Some(1));
}

#[test]
fn test_framer_closes_on_bad_marker() {
    let mut sched = TaskScheduler::new().unwrap();
    let mut stream = interleaved_stream(&[(0, b"hi")]);
    stream.extend_from_slice(b"RTSP/1.0 200 OK\r\n");
    let input = ByteStreamSource::new("tcp", Cursor::new(stream), ByteStreamConfig::default());
    let framer = InterleavedFramer::new("framer", input);
    let sink = FileSink::new("output", Vec::new(), 64, false);
    let (done, after_playing) = counter();

    assert_ok!(sink
        .borrow_mut()
        .start_playing(&mut sched, framer, after_playing));
    run_until(&mut sched, || done.get() > 0);

    assert_eq!(sink.borrow().writer().as_slice(), b"hi");
    assert_eq!(done.get(), 1);
}

#[test]
fn test_framer_closes_when_upstream_refuses() {
    let mut sched = TaskScheduler::new().unwrap();
    let framer = InterleavedFramer::new("framer", RefusingSource::new(b"", 0));
    let events = Rc::new(RefCell::new(Vec::new()));
    let log = events.clone();
    let request = FrameRequest::with_capacity(64, move |_, event| log.borrow_mut().push(event));

    assert_ok!(framer.borrow_mut().get_next_frame(&mut sched, request));
    assert!(events.borrow().is_empty());

    run_until(&mut sched, || !events.borrow().is_empty());
    for _ in 0..10 {
        sched.single_step(Some(Interval::from_millis(1))).unwrap();
    }

    assert_eq!(events.borrow().len(), 1);
    assert!(matches!(events.borrow()[0], FrameEvent::Closed));
    assert!(!framer.borrow().is_currently_awaiting_data());
}

#[test]
fn test_framer_delivers_buffered_units_before_refusal_close() {
    let mut sched = TaskScheduler::new().unwrap();
    let stream = interleaved_stream(&[(2, b"one"), (2, b"two")]);
    let framer = InterleavedFramer::new("framer", RefusingSource::new(&stream, 1));
    let sink = FileSink::new("output", Vec::new(), 64, false);
    let (done, after_playing) = counter();

    assert_ok!(sink
        .borrow_mut()
        .start_playing(&mut sched, framer, after_playing));
    run_until(&mut sched, || done.get() > 0);

    assert_eq!(sink.borrow().writer().as_slice(), b"onetwo");
    assert_eq!(sink.borrow().stats().frames, 2);
}

// ============================================================================
// Packetization
// ============================================================================

#[test]
fn test_oversized_frame_splits_across_two_packets() {
    let mut sched = TaskScheduler::new().unwrap();
    let payload_room = 10;
    let unit: Vec<u8> = (100..113).collect();
    let source = UnitQueueSource::new("units", [Bytes::from(unit.clone())], 0);
    let sink = assert_ok!(InterleavedPacketSink::new(
        "packets",
        Vec::new(),
        unpaced(INTERLEAVED_HEADER_LEN + payload_room, INTERLEAVED_HEADER_LEN + payload_room),
    ));
    let (done, after_playing) = counter();

    assert_ok!(sink
        .borrow_mut()
        .start_playing(&mut sched, source, after_playing));
    run_until(&mut sched, || done.get() > 0);

    let packets = parse_units(sink.borrow().writer());
    assert_eq!(packets.len(), 2);
    assert!(packets.iter().all(|(channel, _)| *channel == 7));
    assert_eq!(packets[0].1.len(), payload_room);
    assert_eq!([packets[0].1.clone(), packets[1].1.clone()].concat(), unit);
    assert_eq!(sink.borrow().stats().fragmented_frames, 1);
}

#[test]
fn test_frame_larger_than_several_packets() {
    let mut sched = TaskScheduler::new().unwrap();
    let unit: Vec<u8> = (0..=255u8).cycle().take(1_000).collect();
    let source = UnitQueueSource::new("units", [Bytes::from(unit.clone())], 0);
    let sink = assert_ok!(InterleavedPacketSink::new("packets", Vec::new(), unpaced(200, 300)));
    let (done, after_playing) = counter();

    assert_ok!(sink
        .borrow_mut()
        .start_playing(&mut sched, source, after_playing));
    run_until(&mut sched, || done.get() > 0);

    let packets = parse_units(sink.borrow().writer());
    assert_eq!(packets.len(), 4);
    assert!(packets.iter().all(|(_, payload)| payload.len() <= 296));
    let joined: Vec<u8> = packets.into_iter().flat_map(|(_, payload)| payload).collect();
    assert_eq!(joined, unit);
}

#[test]
fn test_small_frames_share_a_packet() {
    let mut sched = TaskScheduler::new().unwrap();
    let units: Vec<Bytes> = (0..5u8).map(|i| Bytes::from(vec![i; 100])).collect();
    let source = UnitQueueSource::new("units", units, 0);
    let sink = assert_ok!(InterleavedPacketSink::new("packets", Vec::new(), unpaced(250, 1_000)));
    let (done, after_playing) = counter();

    assert_ok!(sink
        .borrow_mut()
        .start_playing(&mut sched, source, after_playing));
    run_until(&mut sched, || done.get() > 0);

    let packets = parse_units(sink.borrow().writer());
    let sizes: Vec<usize> = packets.iter().map(|(_, payload)| payload.len()).collect();
    assert_eq!(sizes, vec![300, 200]);
    assert_eq!(sink.borrow().stats().frames, 5);
}

#[test]
fn test_frame_that_does_not_fit_moves_to_next_packet() {
    let mut sched = TaskScheduler::new().unwrap();
    let units = [Bytes::from(vec![1u8; 6]), Bytes::from(vec![2u8; 8])];
    let source = UnitQueueSource::new("units", units, 0);
    let sink = assert_ok!(InterleavedPacketSink::new("packets", Vec::new(), unpaced(14, 14)));
    let (done, after_playing) = counter();

    assert_ok!(sink
        .borrow_mut()
        .start_playing(&mut sched, source, after_playing));
    run_until(&mut sched, || done.get() > 0);

    let packets = parse_units(sink.borrow().writer());
    assert_eq!(packets[0].1, vec![1u8; 6]);
    assert_eq!(packets[1].1, vec![2u8; 8]);
    assert_eq!(sink.borrow().stats().fragmented_frames, 0);
}

#[test]
fn test_packet_sink_sends_partial_packet_when_request_is_refused() {
    let mut sched = TaskScheduler::new().unwrap();
    let source = RefusingSource::new(b"abcd", 3);
    let sink = assert_ok!(InterleavedPacketSink::new("packets", Vec::new(), unpaced(100, 200)));
    let (done, after_playing) = counter();

    assert_ok!(sink
        .borrow_mut()
        .start_playing(&mut sched, source, after_playing));
    run_until(&mut sched, || done.get() > 0);

    assert_eq!(done.get(), 1);
    assert_eq!(parse_units(sink.borrow().writer()), vec![(7, b"abcdabcdabcd".to_vec())]);
    assert!(!sink.borrow().is_playing());
}

#[test]
fn test_packet_size_must_fit_interleaved_header() {
    let config = InterleavedPacketSinkConfig {
        packet: OutPacketBufferConfig {
            preferred_packet_size: 100,
            max_packet_size: 70_000,
            buffer_size: 140_000,
        },
        ..Default::default()
    };
    let err = assert_err!(InterleavedPacketSink::new("packets", Vec::new(), config));
    assert!(matches!(err, MediaError::InvalidConfiguration { .. }));
}

#[test]
fn test_packet_stream_feeds_back_through_framer() {
    let mut sched = TaskScheduler::new().unwrap();
    let units: Vec<Bytes> = (0..3u8).map(|i| Bytes::from(vec![i; 50])).collect();
    let source = UnitQueueSource::new("units", units, 0);
    let packets = assert_ok!(InterleavedPacketSink::new("packets", Vec::new(), unpaced(40, 60)));
    let (done, after_playing) = counter();
    assert_ok!(packets
        .borrow_mut()
        .start_playing(&mut sched, source, after_playing));
    run_until(&mut sched, || done.get() > 0);

    let wire = packets.borrow().writer().clone();
    let input = ByteStreamSource::new("wire", Cursor::new(wire), ByteStreamConfig::default());
    let framer = InterleavedFramer::for_channel("framer", input, 7);
    let sink = FileSink::new("output", Vec::new(), 1_024, false);
    let (done, after_playing) = counter();
    assert_ok!(sink
        .borrow_mut()
        .start_playing(&mut sched, framer, after_playing));
    run_until(&mut sched, || done.get() > 0);

    let expected: Vec<u8> = (0..3u8).flat_map(|i| vec![i; 50]).collect();
    assert_eq!(sink.borrow().writer(), &expected);
}
