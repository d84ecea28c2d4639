//! Streaming frame reassembly.
//!
//! Serial reads arrive in arbitrary chunks; `FrameDecoder` buffers them and
//! yields one frame body at a time.

use bytes::{Buf, BytesMut};

/// Accumulates raw bytes and splits them into length-prefixed frames.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(256),
        }
    }

    /// Append freshly read bytes.
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Pop the next complete frame body (without its length byte).
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        loop {
            let len = *self.buf.first()? as usize;
            if len == 0 {
                // idle filler from the board, skip
                self.buf.advance(1);
                continue;
            }
            if self.buf.len() < len + 1 {
                return None;
            }
            self.buf.advance(1);
            return Some(self.buf.split_to(len).to_vec());
        }
    }

    /// Bytes buffered but not yet forming a full frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}
