//! Incremental framing of concatenated JSON objects.
//!
//! Devices write bare JSON objects back to back with no length prefix or
//! delimiter. A single read may carry several objects, or only part of
//! one, so the framer buffers bytes per connection and repeatedly tries to
//! decode one complete object from the front of the buffer:
//!
//! - a complete object is removed from the buffer and returned;
//! - an incomplete object leaves the buffer untouched until more bytes arrive;
//! - a malformed object is discarded through its closing brace (stray bytes
//!   up to the next `{`) and reported, so the stream can resynchronise on
//!   the following message.

use bytes::{Buf, BytesMut};
use serde_json::Value;

use crate::constants::MAX_FRAME_BYTES;
use crate::error::ProtocolError;
use crate::messages::WireMessage;

/// Per-connection receive buffer and decoder.
#[derive(Debug)]
pub struct MessageFramer {
    buf: BytesMut,
    max_frame_bytes: usize,
}

impl Default for MessageFramer {
    fn default() -> Self {
        Self::new(MAX_FRAME_BYTES)
    }
}

impl MessageFramer {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(8 * 1024),
            max_frame_bytes,
        }
    }

    /// Append freshly received bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Direct access for `AsyncReadExt::read_buf`.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Number of bytes waiting to be decoded.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Decode the next complete message at the front of the buffer.
    ///
    /// `Ok(None)` means more bytes are needed. An `Err` has already dropped
    /// the offending bytes, so calling again continues with whatever follows.
    pub fn next_message(&mut self) -> Result<Option<WireMessage>, ProtocolError> {
        let leading_ws = self
            .buf
            .iter()
            .take_while(|b| b.is_ascii_whitespace())
            .count();
        self.buf.advance(leading_ws);
        if self.buf.is_empty() {
            return Ok(None);
        }

        let (outcome, consumed) = {
            let mut stream = serde_json::Deserializer::from_slice(&self.buf).into_iter::<Value>();
            let outcome = stream.next();
            (outcome, stream.byte_offset())
        };

        match outcome {
            None => Ok(None),
            Some(Ok(value)) => {
                self.buf.advance(consumed);
                WireMessage::from_value(value).map(Some)
            }
            Some(Err(e)) if e.is_eof() => {
                if self.buf.len() > self.max_frame_bytes {
                    Err(ProtocolError::FrameTooLarge {
                        buffered: self.buf.len(),
                        limit: self.max_frame_bytes,
                    })
                } else {
                    Ok(None)
                }
            }
            Some(Err(e)) => {
                let discarded = self.resync();
                tracing::trace!(discarded, "discarded undecodable bytes");
                Err(ProtocolError::Malformed {
                    discarded,
                    source: e,
                })
            }
        }
    }

    /// Drop the malformed message at the front of the buffer.
    ///
    /// An object at the front is skipped through its closing brace, so objects
    /// nested inside it never surface as messages. When it does not close
    /// within the buffer (truncated, or the rest is still in flight), or the
    /// front is not an object at all, skip to the next `{` past the front.
    fn resync(&mut self) -> usize {
        let skip = match self.end_of_front_object() {
            Some(end) => self.buf[end..]
                .iter()
                .position(|b| *b == b'{')
                .map_or(self.buf.len(), |pos| end + pos),
            None => self
                .buf
                .iter()
                .skip(1)
                .position(|b| *b == b'{')
                .map_or(self.buf.len(), |pos| pos + 1),
        };
        self.buf.advance(skip);
        skip
    }

    /// Offset just past the brace closing the object at the front, ignoring
    /// braces inside strings.
    fn end_of_front_object(&self) -> Option<usize> {
        if self.buf.first() != Some(&b'{') {
            return None;
        }
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;
        for (i, &b) in self.buf.iter().enumerate() {
            if in_string {
                if escaped {
                    escaped = false;
                } else if b == b'\\' {
                    escaped = true;
                } else if b == b'"' {
                    in_string = false;
                }
                continue;
            }
            match b {
                b'"' => in_string = true,
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        return Some(i + 1);
                    }
                }
                _ => {}
            }
        }
        None
    }
}
