//! Length-prefixed framing.
//!
//! Every frame is a 4-byte little-endian payload length followed by the
//! payload. Partial reads are reassembled in a [`FrameBuffer`]; end of stream
//! in the middle of a frame is reported as [`Received::Truncated`], never as
//! a short frame.

use crate::config::types::{IsolateError, Result};

pub const HEADER_SIZE: usize = 4;

/// Result of reading one frame from an endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Received {
    /// A complete frame payload.
    Frame(Vec<u8>),
    /// The peer closed the stream without writing anything further.
    Closed,
    /// The stream ended part-way through a frame.
    Truncated { expected: usize, received: usize },
}

/// Prefix `payload` with its length.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>> {
    let len = u32::try_from(payload.len()).map_err(|_| {
        IsolateError::Serialization(format!(
            "payload of {} bytes exceeds the frame size limit",
            payload.len()
        ))
    })?;

    let mut framed = Vec::with_capacity(HEADER_SIZE + payload.len());
    framed.extend_from_slice(&len.to_le_bytes());
    framed.extend_from_slice(payload);
    Ok(framed)
}

/// Reassembly buffer for incoming frames.
#[derive(Debug)]
pub struct FrameBuffer {
    buf: Vec<u8>,
    max_payload: usize,
}

impl FrameBuffer {
    pub fn new(max_payload: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_payload,
        }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Announced payload length of the frame at the head of the buffer.
    fn announced_len(&self) -> Result<Option<usize>> {
        if self.buf.len() < HEADER_SIZE {
            return Ok(None);
        }
        let len = u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if len > self.max_payload {
            return Err(IsolateError::Serialization(format!(
                "frame announces {} bytes, limit is {}",
                len, self.max_payload
            )));
        }
        Ok(Some(len))
    }

    /// Pop the next complete frame, if one is buffered.
    pub fn take_frame(&mut self) -> Result<Option<Vec<u8>>> {
        let len = match self.announced_len()? {
            Some(len) => len,
            None => return Ok(None),
        };
        if self.buf.len() < HEADER_SIZE + len {
            return Ok(None);
        }
        let payload = self.buf[HEADER_SIZE..HEADER_SIZE + len].to_vec();
        self.buf.drain(..HEADER_SIZE + len);
        Ok(Some(payload))
    }

    /// Resolve the buffer once no more bytes can arrive.
    pub fn finish(&mut self) -> Result<Received> {
        if let Some(frame) = self.take_frame()? {
            return Ok(Received::Frame(frame));
        }
        if self.buf.is_empty() {
            return Ok(Received::Closed);
        }
        let expected = match self.announced_len()? {
            Some(len) => HEADER_SIZE + len,
            None => HEADER_SIZE,
        };
        let received = self.buf.len();
        self.buf.clear();
        Ok(Received::Truncated { expected, received })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_reassemble_from_fragments() {
        let framed = encode_frame(b"hello frame").unwrap();
        assert_eq!(framed.len(), HEADER_SIZE + 11);

        let mut buffer = FrameBuffer::new(1024);
        for chunk in framed.chunks(3) {
            assert_eq!(buffer.take_frame().unwrap(), None);
            buffer.extend(chunk);
        }
        assert_eq!(buffer.take_frame().unwrap(), Some(b"hello frame".to_vec()));
        assert!(buffer.is_empty());
    }

    #[test]
    fn consecutive_frames_are_split() {
        let mut buffer = FrameBuffer::new(1024);
        buffer.extend(&encode_frame(b"one").unwrap());
        buffer.extend(&encode_frame(b"").unwrap());
        buffer.extend(&encode_frame(b"three").unwrap());

        assert_eq!(buffer.take_frame().unwrap(), Some(b"one".to_vec()));
        assert_eq!(buffer.take_frame().unwrap(), Some(Vec::new()));
        assert_eq!(buffer.take_frame().unwrap(), Some(b"three".to_vec()));
        assert_eq!(buffer.finish().unwrap(), Received::Closed);
    }

    #[test]
    fn finish_reports_truncation() {
        let framed = encode_frame(&[7u8; 32]).unwrap();
        let mut buffer = FrameBuffer::new(1024);
        buffer.extend(&framed[..10]);
        assert_eq!(
            buffer.finish().unwrap(),
            Received::Truncated {
                expected: HEADER_SIZE + 32,
                received: 10
            }
        );

        let mut header_only = FrameBuffer::new(1024);
        header_only.extend(&framed[..2]);
        assert_eq!(
            header_only.finish().unwrap(),
            Received::Truncated {
                expected: HEADER_SIZE,
                received: 2
            }
        );
    }

    #[test]
    fn oversized_announcement_is_rejected() {
        let mut buffer = FrameBuffer::new(8);
        buffer.extend(&encode_frame(&[0u8; 9]).unwrap());
        assert!(matches!(
            buffer.take_frame(),
            Err(IsolateError::Serialization(_))
        ));
    }
}
