//! Message boundaries in a byte stream split across reads
//!
//! Before authentication a leg buffers whole messages, since it has to act on
//! them. Afterwards bytes are relayed as they arrive and [`MessageTracker`]
//! only follows headers, copying a bounded prefix of each message for
//! analysis.

use crate::error::{ProxyError, Result};
use crate::protocol::{check_length, scan_frames, MAX_AUTH_BUFFER, TAGGED_HEADER_LEN};

/// Payload bytes of one relayed message copied for analysis.
pub const CAPTURE_LIMIT: usize = 64 * 1024;

/// Accumulates bytes from one leg and releases them one complete message
/// run at a time. A trailing partial message stays buffered until the rest
/// arrives.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    buf: Vec<u8>,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `data` and return every complete message now at the front of
    /// the buffer, concatenated. Empty when nothing is complete yet.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        if self.buf.len() + data.len() > MAX_AUTH_BUFFER {
            return Err(ProxyError::ResourceExhaustion(format!(
                "more than {} bytes buffered before authentication completed",
                MAX_AUTH_BUFFER
            )));
        }
        self.buf.extend_from_slice(data);
        let scan = scan_frames(&self.buf)?;
        if scan.consumed == 0 {
            return Ok(Vec::new());
        }
        let rest = self.buf.split_off(scan.consumed);
        Ok(std::mem::replace(&mut self.buf, rest))
    }

    /// Whether the buffer holds the beginning of an unfinished message.
    pub fn is_partial(&self) -> bool {
        !self.buf.is_empty()
    }

    /// Hand the unfinished message over, leaving the buffer empty.
    pub fn take_pending(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }
}

/// Bytes copied out of a relayed stream for analysis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capture {
    /// One or more complete messages, concatenated
    Frames(Vec<u8>),
    /// Header and leading payload of one message too large to copy whole;
    /// the header still declares the full length
    Truncated(Vec<u8>),
}

/// Follows tagged-message boundaries without holding message bodies.
#[derive(Debug)]
pub struct MessageTracker {
    limit: usize,
    /// Header and captured payload of the message in progress
    current: Vec<u8>,
    /// Wire length of the message in progress, once its header is known
    expected: Option<usize>,
    /// Wire bytes of the message in progress seen so far
    seen: usize,
}

impl Default for MessageTracker {
    fn default() -> Self {
        Self::new(CAPTURE_LIMIT)
    }
}

impl MessageTracker {
    /// `limit` caps the payload bytes copied per message.
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            current: Vec::new(),
            expected: None,
            seen: 0,
        }
    }

    /// Account for `data` and return the captures of every message it
    /// finishes, in stream order.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Capture>> {
        let mut out: Vec<Capture> = Vec::new();
        let mut rest = data;

        while !rest.is_empty() {
            let expected = match self.expected {
                Some(expected) => expected,
                None => {
                    let take = (TAGGED_HEADER_LEN - self.current.len()).min(rest.len());
                    self.current.extend_from_slice(&rest[..take]);
                    self.seen += take;
                    rest = &rest[take..];
                    if self.current.len() < TAGGED_HEADER_LEN {
                        break;
                    }
                    let tag = self.current[0];
                    let length = u32::from_be_bytes([
                        self.current[1],
                        self.current[2],
                        self.current[3],
                        self.current[4],
                    ]);
                    check_length(tag, length)?;
                    let expected = 1 + length as usize;
                    self.expected = Some(expected);
                    expected
                }
            };

            let take = (expected - self.seen).min(rest.len());
            let room = (TAGGED_HEADER_LEN + self.limit).saturating_sub(self.current.len());
            self.current.extend_from_slice(&rest[..take.min(room)]);
            self.seen += take;
            rest = &rest[take..];

            if self.seen == expected {
                self.finish(expected, &mut out);
            }
        }
        Ok(out)
    }

    fn finish(&mut self, expected: usize, out: &mut Vec<Capture>) {
        let bytes = std::mem::take(&mut self.current);
        self.expected = None;
        self.seen = 0;

        if bytes.len() < expected {
            out.push(Capture::Truncated(bytes));
            return;
        }
        match out.last_mut() {
            Some(Capture::Frames(run)) => run.extend_from_slice(&bytes),
            _ => out.push(Capture::Frames(bytes)),
        }
    }

    /// Whether the last byte seen was inside a message.
    pub fn is_partial(&self) -> bool {
        self.seen > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::encode_message;

    #[test]
    fn test_push_complete_messages() {
        let mut asm = FrameAssembler::new();
        let mut data = encode_message(b'Q', b"SELECT 1\0");
        data.extend(encode_message(b'S', b""));

        let complete = asm.push(&data).unwrap();
        assert_eq!(complete, data);
        assert!(!asm.is_partial());
    }

    #[test]
    fn test_push_split_message() {
        let mut asm = FrameAssembler::new();
        let msg = encode_message(b'Q', b"SELECT now()\0");

        assert!(asm.push(&msg[..3]).unwrap().is_empty());
        assert!(asm.is_partial());
        assert!(asm.push(&msg[3..9]).unwrap().is_empty());
        assert_eq!(&asm.buf[..], &msg[..9]);

        let complete = asm.push(&msg[9..]).unwrap();
        assert_eq!(complete, msg);
        assert!(!asm.is_partial());
    }

    #[test]
    fn test_push_keeps_trailing_partial() {
        let mut asm = FrameAssembler::new();
        let first = encode_message(b'Z', b"I");
        let second = encode_message(b'C', b"SELECT 1\0");
        let mut data = first.clone();
        data.extend_from_slice(&second[..4]);

        assert_eq!(asm.push(&data).unwrap(), first);
        assert_eq!(&asm.buf[..], &second[..4]);
        assert_eq!(asm.push(&second[4..]).unwrap(), second);
    }

    #[test]
    fn test_push_rejects_impossible_length() {
        let mut asm = FrameAssembler::new();
        let err = asm.push(&[b'Q', 0, 0, 0, 1]).unwrap_err();
        assert!(matches!(err, ProxyError::Framing(_)));
    }

    #[test]
    fn test_push_bounds_buffered_bytes() {
        let mut asm = FrameAssembler::new();
        let mut header = vec![b'N'];
        header.extend_from_slice(&(MAX_AUTH_BUFFER as u32 * 2).to_be_bytes());
        assert!(asm.push(&header).unwrap().is_empty());

        let filler = vec![0u8; MAX_AUTH_BUFFER];
        assert!(matches!(
            asm.push(&filler),
            Err(ProxyError::ResourceExhaustion(_))
        ));
    }

    #[test]
    fn test_tracker_merges_small_messages() {
        let mut tracker = MessageTracker::default();
        let mut data = encode_message(b'Q', b"SELECT 1\0");
        data.extend(encode_message(b'S', b""));

        assert_eq!(tracker.push(&data).unwrap(), vec![Capture::Frames(data)]);
        assert!(!tracker.is_partial());
    }

    #[test]
    fn test_tracker_header_split_byte_by_byte() {
        let mut tracker = MessageTracker::default();
        let msg = encode_message(b'C', b"SELECT 1\0");

        for (i, byte) in msg.iter().enumerate() {
            let captures = tracker.push(std::slice::from_ref(byte)).unwrap();
            if i + 1 < msg.len() {
                assert!(captures.is_empty());
                assert!(tracker.is_partial());
            } else {
                assert_eq!(captures, vec![Capture::Frames(msg.clone())]);
            }
        }
        assert!(!tracker.is_partial());
    }

    #[test]
    fn test_tracker_empty_payload_at_read_end() {
        let mut tracker = MessageTracker::default();
        let sync = encode_message(b'S', b"");
        assert_eq!(tracker.push(&sync).unwrap(), vec![Capture::Frames(sync)]);
    }

    #[test]
    fn test_tracker_truncates_large_message() {
        let mut tracker = MessageTracker::new(8);
        let big = encode_message(b'D', &[7u8; 100]);
        let small = encode_message(b'C', b"SELECT 1\0");
        let mut data = big.clone();
        data.extend_from_slice(&small);

        let captures = tracker.push(&data).unwrap();
        assert_eq!(
            captures,
            vec![
                Capture::Truncated(big[..5 + 8].to_vec()),
                Capture::Frames(small)
            ]
        );
    }

    #[test]
    fn test_tracker_streams_gigantic_header() {
        // 150MB Query; only the header and the capture limit are held
        let mut tracker = MessageTracker::new(16);
        let declared: u32 = 150 * 1024 * 1024;
        let mut header = vec![b'Q'];
        header.extend_from_slice(&declared.to_be_bytes());

        assert!(tracker.push(&header).unwrap().is_empty());
        let chunk = vec![b'x'; 64 * 1024];
        let mut remaining = declared as usize - 4;
        let mut captures = Vec::new();
        while remaining > 0 {
            let n = remaining.min(chunk.len());
            captures.extend(tracker.push(&chunk[..n]).unwrap());
            remaining -= n;
            if remaining > 0 {
                assert!(tracker.is_partial());
                assert!(tracker.current.len() <= TAGGED_HEADER_LEN + 16);
            }
        }

        assert_eq!(captures.len(), 1);
        let Capture::Truncated(bytes) = &captures[0] else {
            panic!("expected a truncated capture");
        };
        assert_eq!(&bytes[..5], &header[..]);
        assert_eq!(bytes.len(), 5 + 16);
        assert!(!tracker.is_partial());
    }

    #[test]
    fn test_tracker_rejects_impossible_length() {
        let mut tracker = MessageTracker::default();
        assert!(matches!(
            tracker.push(&[b'Q', 0, 0, 0, 2]),
            Err(ProxyError::Framing(_))
        ));
        let mut tracker = MessageTracker::default();
        assert!(matches!(
            tracker.push(&[b'Q', 0x40, 0, 0, 0]),
            Err(ProxyError::Framing(_))
        ));
    }
}
