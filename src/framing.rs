//! Wire framing for the bus socket.
//!
//! Every record on the bus is length-prefixed:
//!
//! ```text
//! [u32 LE length] [payload: length bytes]
//! ```
//!
//! The first payload byte is conventionally an opcode (see [`crate::message`]),
//! but framing never looks at it. A zero-length payload is a valid frame.
//!
//! [`FrameBuffer`] accumulates bytes from partial reads and hands out complete
//! frames in arrival order. Frames keep their header so the relay can forward
//! exactly the bytes it received.

use std::fmt;

use anyhow::{bail, Result};

/// Size of the little-endian length header.
pub const HEADER_LEN: usize = 4;

/// Default cap on the size of a single frame, header included (16 MB).
pub const DEFAULT_MAX_BUFFERED: usize = 16 * 1024 * 1024;

/// A complete frame: header plus payload, byte-identical to the wire form.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    raw: Vec<u8>,
}

impl Frame {
    /// Build a frame around `payload`, prepending the length header.
    ///
    /// # Errors
    ///
    /// Fails if the payload is too long for a `u32` length header.
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        let Ok(length) = u32::try_from(payload.len()) else {
            bail!(
                "Payload too large for a frame: {} bytes (max {})",
                payload.len(),
                u32::MAX
            );
        };
        let mut raw = Vec::with_capacity(HEADER_LEN + payload.len());
        raw.extend_from_slice(&length.to_le_bytes());
        raw.extend_from_slice(payload);
        Ok(Self { raw })
    }

    /// Length declared in the header.
    pub fn declared_len(&self) -> u32 {
        u32::from_le_bytes([self.raw[0], self.raw[1], self.raw[2], self.raw[3]])
    }

    /// Payload bytes (everything after the header).
    pub fn payload(&self) -> &[u8] {
        &self.raw[HEADER_LEN..]
    }

    /// Full wire form, header included.
    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    /// Consume the frame, returning its wire form.
    pub fn into_bytes(self) -> Vec<u8> {
        self.raw
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("len", &self.declared_len())
            .field("payload", &hex_dump(self.payload()))
            .finish()
    }
}

/// Per-connection accumulator that turns a byte stream into frames.
///
/// Append bytes with [`FrameBuffer::append`], then drain complete frames with
/// [`FrameBuffer::extract_all`]. A trailing partial frame stays buffered until
/// the rest of it arrives, however many reads that takes.
///
/// The cap applies to each frame as declared by its header, so whether a
/// stream is accepted never depends on how it was split into reads.
#[derive(Debug)]
pub struct FrameBuffer {
    buf: Vec<u8>,
    max_buffered: usize,
    /// Offset of the first header not yet checked against the cap.
    next_header: usize,
}

impl FrameBuffer {
    /// Create an empty buffer with the default cap.
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_MAX_BUFFERED)
    }

    /// Create an empty buffer that rejects frames over `max_buffered` bytes.
    pub fn with_limit(max_buffered: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_buffered,
            next_header: 0,
        }
    }

    /// Append freshly read bytes to the tail of the buffer.
    ///
    /// # Errors
    ///
    /// Fails without modifying the buffer if a header that arrived with
    /// `bytes` declares a frame larger than the cap.
    pub fn append(&mut self, bytes: &[u8]) -> Result<()> {
        let old_len = self.buf.len();
        let old_next_header = self.next_header;
        self.buf.extend_from_slice(bytes);

        while self.buf.len() >= self.next_header + HEADER_LEN {
            let at = self.next_header;
            let length = u32::from_le_bytes([
                self.buf[at],
                self.buf[at + 1],
                self.buf[at + 2],
                self.buf[at + 3],
            ]);
            let total = HEADER_LEN + length as usize;
            if total > self.max_buffered {
                self.buf.truncate(old_len);
                self.next_header = old_next_header;
                bail!(
                    "Frame too large: {total} bytes (max {})",
                    self.max_buffered
                );
            }
            self.next_header += total;
        }
        Ok(())
    }

    /// Lazily extract every complete frame at the head of the buffer.
    ///
    /// Each call makes one pass; frames come out in arrival order and the
    /// buffer advances past each one as it is yielded.
    pub fn extract_all(&mut self) -> Frames<'_> {
        Frames { buffer: self }
    }

    /// Pull one frame off the head, or `None` if no complete frame is buffered.
    fn try_extract_one(&mut self) -> Option<Frame> {
        // Need at least 4 bytes for the length header
        if self.buf.len() < HEADER_LEN {
            return None;
        }

        let length = u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);
        let total = HEADER_LEN + length as usize;
        if self.buf.len() < total {
            return None; // Incomplete frame, wait for more data
        }

        let raw: Vec<u8> = self.buf.drain(..total).collect();
        self.next_header = self.next_header.saturating_sub(total);
        Some(Frame { raw })
    }

    /// Number of bytes currently buffered.
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    /// Returns true if the buffer holds bytes of an unfinished frame.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator returned by [`FrameBuffer::extract_all`].
#[derive(Debug)]
pub struct Frames<'a> {
    buffer: &'a mut FrameBuffer,
}

impl Iterator for Frames<'_> {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        self.buffer.try_extract_one()
    }
}

/// Format bytes as space-separated lowercase hex pairs.
pub fn hex_dump(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}
