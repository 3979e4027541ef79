//! Message framing: the segment-table header, stream-safe.
//!
//! Layout on the wire:
//!
//! - `seg_count - 1 : u32le`
//! - `seg_count` × `seg_size_in_words : u32le`
//! - 4 bytes of zero padding when the count words leave the header on a
//!   4-byte boundary (bodies always start 8-byte aligned)
//! - the segment bodies, in order
//!
//! [`FrameParser`] accepts arbitrary byte chunks and yields whole messages;
//! partial input parks in an explicit continuation state until more bytes
//! arrive. Writing always emits a fresh buffer, never rewrites in place.

use crate::arena::BYTES_PER_WORD;
use crate::error::{Error, Result};

/// Upper bound on segments per message; a stream that claims more is
/// corrupt, not large.
pub const MAX_SEGMENTS: u32 = 512;

#[derive(Debug)]
enum ParseState {
    NeedHeader,
    NeedSizes { count: u32 },
    NeedBodies { sizes: Vec<u32> },
}

/// Incremental segment-table parser.
#[derive(Debug)]
pub struct FrameParser {
    buf: Vec<u8>,
    state: ParseState,
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameParser {
    pub fn new() -> FrameParser {
        FrameParser {
            buf: Vec::new(),
            state: ParseState::NeedHeader,
        }
    }

    /// Append a chunk of received bytes.
    pub fn feed(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Bytes buffered but not yet consumed by a complete message.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Advance the state machine; yields the next complete message's
    /// segments, or `None` until more bytes arrive.
    pub fn next_message(&mut self) -> Result<Option<Vec<Vec<u8>>>> {
        loop {
            match &self.state {
                ParseState::NeedHeader => {
                    if self.buf.len() < 4 {
                        return Ok(None);
                    }
                    let count =
                        u32::from_le_bytes(self.buf[..4].try_into().expect("4 bytes"))
                            .wrapping_add(1);
                    if count == 0 || count > MAX_SEGMENTS {
                        return Err(Error::InvalidFrame("segment count out of range"));
                    }
                    self.buf.drain(..4);
                    self.state = ParseState::NeedSizes { count };
                }
                ParseState::NeedSizes { count } => {
                    let count = *count;
                    // The count word plus `count` size words, padded to a
                    // whole word; the count word is already consumed.
                    let pad = if count % 2 == 0 { 4 } else { 0 };
                    let need = count as usize * 4 + pad;
                    if self.buf.len() < need {
                        return Ok(None);
                    }
                    let sizes: Vec<u32> = (0..count as usize)
                        .map(|i| {
                            u32::from_le_bytes(
                                self.buf[i * 4..i * 4 + 4].try_into().expect("4 bytes"),
                            )
                        })
                        .collect();
                    self.buf.drain(..need);
                    self.state = ParseState::NeedBodies { sizes };
                }
                ParseState::NeedBodies { sizes } => {
                    let total: usize = sizes
                        .iter()
                        .map(|s| *s as usize * BYTES_PER_WORD)
                        .sum();
                    if self.buf.len() < total {
                        return Ok(None);
                    }
                    let sizes = sizes.clone();
                    let mut segments = Vec::with_capacity(sizes.len());
                    let mut at = 0usize;
                    for size in &sizes {
                        let len = *size as usize * BYTES_PER_WORD;
                        segments.push(self.buf[at..at + len].to_vec());
                        at += len;
                    }
                    self.buf.drain(..total);
                    self.state = ParseState::NeedHeader;
                    return Ok(Some(segments));
                }
            }
        }
    }
}

/// Serialize segments with the segment-table header.
pub fn write_message<S: AsRef<[u8]>>(segments: &[S]) -> Vec<u8> {
    let count = segments.len() as u32;
    debug_assert!(count >= 1, "a message has at least one segment");
    let mut out = Vec::new();
    out.extend_from_slice(&(count - 1).to_le_bytes());
    for seg in segments {
        let words = (seg.as_ref().len() / BYTES_PER_WORD) as u32;
        out.extend_from_slice(&words.to_le_bytes());
    }
    if count % 2 == 0 {
        out.extend_from_slice(&[0u8; 4]);
    }
    for seg in segments {
        out.extend_from_slice(seg.as_ref());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(words: usize, fill: u8) -> Vec<u8> {
        vec![fill; words * BYTES_PER_WORD]
    }

    #[test]
    fn single_segment_header_has_no_padding() {
        let bytes = write_message(&[seg(2, 0xaa)]);
        // count-1 (4) + one size (4) = 8 bytes of header, then the body.
        assert_eq!(bytes.len(), 8 + 16);
        assert_eq!(&bytes[..4], &0u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &2u32.to_le_bytes());
    }

    #[test]
    fn two_segment_header_is_padded() {
        let bytes = write_message(&[seg(1, 1), seg(1, 2)]);
        assert_eq!(bytes.len(), 4 + 8 + 4 + 16);
        assert_eq!(&bytes[12..16], &[0u8; 4]);
        assert_eq!(bytes.len() % BYTES_PER_WORD, 0);
    }

    #[test]
    fn whole_message_round_trips() {
        let segments = vec![seg(1, 1), seg(3, 2), seg(2, 3)];
        let bytes = write_message(&segments);

        let mut parser = FrameParser::new();
        parser.feed(&bytes);
        let parsed = parser.next_message().unwrap().unwrap();
        assert_eq!(parsed, segments);
        assert_eq!(parser.pending(), 0);
        assert!(parser.next_message().unwrap().is_none());
    }

    #[test]
    fn byte_at_a_time_feeding() {
        let segments = vec![seg(2, 7), seg(1, 9)];
        let bytes = write_message(&segments);

        let mut parser = FrameParser::new();
        let mut got = None;
        for b in &bytes {
            parser.feed(std::slice::from_ref(b));
            if let Some(m) = parser.next_message().unwrap() {
                got = Some(m);
            }
        }
        assert_eq!(got.unwrap(), segments);
    }

    #[test]
    fn two_messages_in_one_chunk_with_leftover() {
        let first = vec![seg(1, 1)];
        let second = vec![seg(2, 2)];
        let mut bytes = write_message(&first);
        bytes.extend_from_slice(&write_message(&second));
        bytes.extend_from_slice(&[0x00, 0x00]); // start of a third header

        let mut parser = FrameParser::new();
        parser.feed(&bytes);
        assert_eq!(parser.next_message().unwrap().unwrap(), first);
        assert_eq!(parser.next_message().unwrap().unwrap(), second);
        assert!(parser.next_message().unwrap().is_none());
        assert_eq!(parser.pending(), 2);
    }

    #[test]
    fn oversized_segment_count_is_rejected() {
        let mut parser = FrameParser::new();
        parser.feed(&u32::MAX.to_le_bytes()); // count-1 = MAX → count = 0
        assert!(matches!(
            parser.next_message(),
            Err(Error::InvalidFrame(_))
        ));

        let mut parser = FrameParser::new();
        parser.feed(&100_000u32.to_le_bytes());
        assert!(matches!(
            parser.next_message(),
            Err(Error::InvalidFrame(_))
        ));
    }

    #[test]
    fn empty_segment_bodies_are_legal() {
        let segments = vec![seg(0, 0), seg(1, 5)];
        let bytes = write_message(&segments);
        let mut parser = FrameParser::new();
        parser.feed(&bytes);
        assert_eq!(parser.next_message().unwrap().unwrap(), segments);
    }
}
