//! # Mediaflow Media
//!
//! Frame data flow for the mediaflow runtime: the asynchronous request and
//! notification contract between producers and consumers, byte stream,
//! descriptor and unit queue sources, the interleaved framer, and sinks that
//! write frames out directly or packetize them through an
//! [`OutPacketBuffer`].

#![warn(clippy::all)]

pub mod byte_stream;
pub mod descriptor_source;
pub mod error;
pub mod framer;
pub mod packet;
pub mod packet_sink;
pub mod sink;
pub mod source;
pub mod unit_queue;

// Re-export main types
pub use byte_stream::{ByteStreamConfig, ByteStreamSource};
pub use descriptor_source::DescriptorSource;
pub use error::{ErrorCategory, MediaError, MediaResult};
pub use framer::{
    encode_interleaved_header, parse_interleaved_header, write_interleaved_unit, InterleavedFramer,
    InterleavedHeader, INTERLEAVED_HEADER_LEN, INTERLEAVED_MARKER, MAX_INTERLEAVED_PAYLOAD,
};
pub use packet::{OutPacketBuffer, OutPacketBufferConfig};
pub use packet_sink::{InterleavedPacketSink, InterleavedPacketSinkConfig, PacketSinkStats};
pub use sink::{AfterPlaying, FileSink, FileSinkStats, MediaSink, Playback, DEFAULT_SINK_BUFFER_SIZE};
pub use source::{
    fire, Completion, DeliveredFrame, FrameContinuation, FrameEvent, FrameRequest, FrameState,
    FramedSource, SharedSource, SourceStats,
};
pub use unit_queue::UnitQueueSource;
