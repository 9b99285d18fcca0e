//! Buffered output packet with overflow carry
//!
//! The buffer holds the packet being built plus room behind it. A frame that
//! does not fit the current packet is written in full past the packet end;
//! the part that does not fit is recorded as overflow data and moved to the
//! front of the next packet with [`OutPacketBuffer::use_overflow_data`], so
//! an oversized frame is split across packets without going back to its
//! source.

use crate::error::{MediaError, MediaResult};
use mediaflow_core::Instant;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Output packet buffer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutPacketBufferConfig {
    /// Size at which a packet is considered full enough to send
    pub preferred_packet_size: usize,
    /// Hard upper bound on a packet
    pub max_packet_size: usize,
    /// Total buffer size (rounded up to whole packets)
    pub buffer_size: usize,
}

impl Default for OutPacketBufferConfig {
    fn default() -> Self {
        Self {
            preferred_packet_size: 1000,
            max_packet_size: 1448,
            buffer_size: 60_000,
        }
    }
}

impl OutPacketBufferConfig {
    /// Validate the configuration
    pub fn validate(&self) -> MediaResult<()> {
        if self.max_packet_size == 0 {
            return Err(MediaError::InvalidConfiguration {
                message: "max_packet_size must be positive".to_string(),
            });
        }
        if self.preferred_packet_size > self.max_packet_size {
            return Err(MediaError::InvalidConfiguration {
                message: format!(
                    "preferred_packet_size {} exceeds max_packet_size {}",
                    self.preferred_packet_size, self.max_packet_size
                ),
            });
        }
        if self.buffer_size < self.max_packet_size {
            return Err(MediaError::InvalidConfiguration {
                message: format!(
                    "buffer_size {} is smaller than max_packet_size {}",
                    self.buffer_size, self.max_packet_size
                ),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Overflow {
    offset: usize,
    size: usize,
    presentation_time: Instant,
    duration_us: u64,
}

/// Packet assembly buffer
#[derive(Debug)]
pub struct OutPacketBuffer {
    buf: Vec<u8>,
    packet_start: usize,
    cur_offset: usize,
    preferred: usize,
    max: usize,
    overflow: Overflow,
}

impl OutPacketBuffer {
    /// Create a buffer from a validated configuration
    pub fn new(config: &OutPacketBufferConfig) -> MediaResult<Self> {
        config.validate()?;
        let packets = config.buffer_size.div_ceil(config.max_packet_size);
        Ok(Self {
            buf: vec![0; packets * config.max_packet_size],
            packet_start: 0,
            cur_offset: 0,
            preferred: config.preferred_packet_size,
            max: config.max_packet_size,
            overflow: Overflow::default(),
        })
    }

    // ------------------------------------------------------------------
    // Cursor
    // ------------------------------------------------------------------

    /// Bytes written to the current packet
    pub fn cur_packet_size(&self) -> usize {
        self.cur_offset
    }

    /// Free space from the cursor to the end of the buffer
    pub fn total_bytes_available(&self) -> usize {
        self.buf.len() - (self.packet_start + self.cur_offset)
    }

    /// Size of the whole buffer
    pub fn total_buffer_size(&self) -> usize {
        self.buf.len()
    }

    /// Preferred packet size
    pub fn preferred_packet_size(&self) -> usize {
        self.preferred
    }

    /// Maximum packet size
    pub fn max_packet_size(&self) -> usize {
        self.max
    }

    /// Free space at the cursor, for writing in place before [`increment`](Self::increment)
    pub fn cur_chunk_mut(&mut self) -> &mut [u8] {
        let start = self.packet_start + self.cur_offset;
        &mut self.buf[start..]
    }

    /// The packet written so far
    pub fn packet(&self) -> &[u8] {
        &self.buf[self.packet_start..self.packet_start + self.cur_offset]
    }

    /// Advance the cursor over bytes written in place
    pub fn increment(&mut self, n: usize) {
        self.cur_offset += self.clamp_to_available(n);
    }

    /// Advance the cursor over `n` bytes without writing them
    pub fn skip_bytes(&mut self, n: usize) {
        self.increment(n);
    }

    /// Start a new packet at the same packet start
    pub fn reset_offset(&mut self) {
        self.cur_offset = 0;
    }

    // ------------------------------------------------------------------
    // Writes and reads
    // ------------------------------------------------------------------

    /// Append `bytes` at the cursor
    pub fn enqueue(&mut self, bytes: &[u8]) {
        let n = self.clamp_to_available(bytes.len());
        let start = self.packet_start + self.cur_offset;
        self.buf[start..start + n].copy_from_slice(&bytes[..n]);
        self.cur_offset += n;
    }

    /// Append a big-endian 32-bit word
    pub fn enqueue_word(&mut self, word: u32) {
        self.enqueue(&word.to_be_bytes());
    }

    /// Write `bytes` at `position` within the packet
    ///
    /// Extends the packet if the write ends past the cursor.
    pub fn insert(&mut self, bytes: &[u8], position: usize) {
        let start = self.packet_start + position;
        let room = self.buf.len().saturating_sub(start);
        let n = bytes.len().min(room);
        if n < bytes.len() {
            warn!(
                requested = bytes.len(),
                written = n,
                "insert clamped to buffer capacity"
            );
        }
        if n == 0 {
            return;
        }
        self.buf[start..start + n].copy_from_slice(&bytes[..n]);
        if position + n > self.cur_offset {
            self.cur_offset = position + n;
        }
    }

    /// Write a big-endian 32-bit word at `position`
    pub fn insert_word(&mut self, word: u32, position: usize) {
        self.insert(&word.to_be_bytes(), position);
    }

    /// Copy bytes starting at `position` into `out`; returns the count copied
    pub fn extract(&self, out: &mut [u8], position: usize) -> usize {
        let start = self.packet_start + position;
        let room = self.buf.len().saturating_sub(start);
        let n = out.len().min(room);
        if n == 0 {
            return 0;
        }
        out[..n].copy_from_slice(&self.buf[start..start + n]);
        n
    }

    /// Read a big-endian 32-bit word at `position`
    pub fn extract_word(&self, position: usize) -> u32 {
        let mut word = [0u8; 4];
        self.extract(&mut word, position);
        u32::from_be_bytes(word)
    }

    // ------------------------------------------------------------------
    // Size checks
    // ------------------------------------------------------------------

    /// Whether the packet has reached its preferred size
    pub fn is_preferred_size(&self) -> bool {
        self.cur_offset >= self.preferred
    }

    /// Whether `n` more bytes would exceed the maximum packet size
    pub fn would_overflow(&self, n: usize) -> bool {
        self.cur_offset + n > self.max
    }

    /// Bytes of an `n`-byte write that would not fit the packet
    pub fn num_overflow_bytes(&self, n: usize) -> usize {
        (self.cur_offset + n).saturating_sub(self.max)
    }

    /// Whether `n` bytes exceed a whole packet
    pub fn is_too_big_for_a_packet(&self, n: usize) -> bool {
        n > self.max
    }

    // ------------------------------------------------------------------
    // Overflow carry
    // ------------------------------------------------------------------

    /// Remember `size` bytes at packet offset `offset` for the next packet
    pub fn set_overflow_data(&mut self, offset: usize, size: usize, presentation_time: Instant, duration_us: u64) {
        self.overflow = Overflow {
            offset,
            size,
            presentation_time,
            duration_us,
        };
    }

    /// Whether overflow data is waiting
    pub fn have_overflow_data(&self) -> bool {
        self.overflow.size > 0
    }

    /// Size of the waiting overflow data
    pub fn overflow_data_size(&self) -> usize {
        self.overflow.size
    }

    /// Packet offset of the waiting overflow data
    pub fn overflow_data_offset(&self) -> usize {
        self.overflow.offset
    }

    /// Presentation time of the frame the overflow data belongs to
    pub fn overflow_presentation_time(&self) -> Instant {
        self.overflow.presentation_time
    }

    /// Duration of the frame the overflow data belongs to
    pub fn overflow_duration_us(&self) -> u64 {
        self.overflow.duration_us
    }

    /// Move the overflow data to the cursor
    ///
    /// The cursor is not advanced: the carried bytes sit in place like a
    /// freshly written frame, to be accounted for with
    /// [`increment`](Self::increment). Returns the number of bytes moved.
    pub fn use_overflow_data(&mut self) -> usize {
        let from = self.packet_start + self.overflow.offset;
        let to = self.packet_start + self.cur_offset;
        let len = self.buf.len();
        if from >= len || to >= len {
            // Offset no longer points into the buffer: nothing to carry.
            self.reset_overflow_data();
            return 0;
        }
        let size = self.overflow.size.min(len - from).min(len - to);
        self.buf.copy_within(from..from + size, to);
        self.reset_overflow_data();
        size
    }

    /// Forget any overflow data
    pub fn reset_overflow_data(&mut self) {
        self.overflow.offset = 0;
        self.overflow.size = 0;
    }

    // ------------------------------------------------------------------
    // Packet start
    // ------------------------------------------------------------------

    /// Move the packet start forward by `n` bytes
    ///
    /// Overflow data behind the new start is kept at the same buffer
    /// position; overflow data in front of it is dropped.
    pub fn adjust_packet_start(&mut self, n: usize) {
        let n = n.min(self.buf.len() - self.packet_start);
        self.packet_start += n;
        if self.overflow.offset >= n {
            self.overflow.offset -= n;
        } else {
            self.reset_overflow_data();
        }
    }

    /// Move the packet start back to the beginning of the buffer
    pub fn reset_packet_start(&mut self) {
        if self.packet_start > 0 {
            self.overflow.offset += self.packet_start;
            self.packet_start = 0;
        }
    }

    fn clamp_to_available(&self, n: usize) -> usize {
        let available = self.total_bytes_available();
        if n > available {
            warn!(requested = n, available, "write clamped to buffer capacity");
            available
        } else {
            n
        }
    }
}
