//! Segment arena: the single source of truth for message bytes.
//!
//! A message is a set of numbered segments, each a growable word-aligned
//! byte buffer. Readers obtain slices; writers obtain `(segment, word)`
//! tokens from [`SegmentArena::alloc`] and patch in place. Buffers never
//! shrink while the message is alive.

use crate::error::{Error, Result};

/// Identifies one segment within a message.
pub type SegmentId = u32;

/// Bytes per word. Everything in the wire format is word-granular.
pub const BYTES_PER_WORD: usize = 8;

/// A mutable set of word-aligned byte buffers indexed by segment id.
#[derive(Debug, Clone)]
pub struct SegmentArena {
    segments: Vec<Vec<u8>>,
    /// Upper bound on any single segment, in words. `None` means unbounded,
    /// in which case allocation never fails.
    max_segment_words: Option<u32>,
}

impl Default for SegmentArena {
    fn default() -> Self {
        Self::new()
    }
}

impl SegmentArena {
    /// An empty arena with a single empty segment 0 and no size cap.
    pub fn new() -> SegmentArena {
        SegmentArena {
            segments: vec![Vec::new()],
            max_segment_words: None,
        }
    }

    /// An arena whose segments may not grow past `max_segment_words` words.
    pub fn with_cap(max_segment_words: u32) -> SegmentArena {
        SegmentArena {
            segments: vec![Vec::new()],
            max_segment_words: Some(max_segment_words),
        }
    }

    /// Adopt the segments of a received message.
    ///
    /// Every buffer must be a whole number of words.
    pub fn from_segments(segments: Vec<Vec<u8>>) -> Result<SegmentArena> {
        for seg in &segments {
            if seg.len() % BYTES_PER_WORD != 0 {
                return Err(Error::InvalidFrame("segment is not word-aligned"));
            }
        }
        Ok(SegmentArena {
            segments,
            max_segment_words: None,
        })
    }

    pub fn segment_count(&self) -> u32 {
        self.segments.len() as u32
    }

    /// Length of a segment in words.
    pub fn word_len(&self, segment: SegmentId) -> Result<u32> {
        let seg = self.segment(segment)?;
        Ok((seg.len() / BYTES_PER_WORD) as u32)
    }

    /// Ordered segment buffers, for serialization.
    pub fn segments(&self) -> &[Vec<u8>] {
        &self.segments
    }

    fn segment(&self, id: SegmentId) -> Result<&Vec<u8>> {
        self.segments
            .get(id as usize)
            .ok_or(Error::UnknownSegment(id))
    }

    fn fits(&self, segment_len: usize, words: u32) -> bool {
        match self.max_segment_words {
            None => true,
            Some(cap) => {
                segment_len / BYTES_PER_WORD + words as usize <= cap as usize
            }
        }
    }

    /// Allocate `words` contiguous zeroed words.
    ///
    /// Prefers `hint`; with no cap configured the hinted segment always has
    /// room (it grows in place). A capped arena falls back to the first
    /// segment with room, then to a fresh segment, and fails with
    /// [`Error::OutOfMemory`] only when nothing can hold the request.
    pub fn alloc(&mut self, hint: SegmentId, words: u32) -> Result<(SegmentId, u32)> {
        if (hint as usize) < self.segments.len() && self.fits(self.segments[hint as usize].len(), words) {
            return Ok((hint, self.grow(hint, words)));
        }
        for id in 0..self.segments.len() {
            if self.fits(self.segments[id].len(), words) {
                return Ok((id as SegmentId, self.grow(id as SegmentId, words)));
            }
        }
        if self.fits(0, words) {
            self.segments.push(Vec::new());
            let id = (self.segments.len() - 1) as SegmentId;
            return Ok((id, self.grow(id, words)));
        }
        Err(Error::OutOfMemory { words })
    }

    /// Allocate `words` words in exactly `segment`, or fail.
    ///
    /// Child objects live in their parent's segment, so the builder never
    /// emits far pointers; a capped arena that cannot grow the segment fails
    /// the write instead.
    pub fn alloc_in(&mut self, segment: SegmentId, words: u32) -> Result<u32> {
        let len = self.segment(segment)?.len();
        if !self.fits(len, words) {
            return Err(Error::OutOfMemory { words });
        }
        Ok(self.grow(segment, words))
    }

    fn grow(&mut self, segment: SegmentId, words: u32) -> u32 {
        let seg = &mut self.segments[segment as usize];
        let pos = (seg.len() / BYTES_PER_WORD) as u32;
        seg.resize(seg.len() + words as usize * BYTES_PER_WORD, 0);
        pos
    }

    /// A view of `words` words starting at `word_offset`.
    pub fn get(&self, segment: SegmentId, word_offset: u32, words: u32) -> Result<&[u8]> {
        self.get_bytes(
            segment,
            word_offset as u64 * BYTES_PER_WORD as u64,
            words as u64 * BYTES_PER_WORD as u64,
        )
    }

    /// A byte-granular view, used by the bit-window read paths.
    pub fn get_bytes(&self, segment: SegmentId, offset: u64, len: u64) -> Result<&[u8]> {
        let seg = self.segment(segment)?;
        let end = offset.checked_add(len).ok_or(Error::OutOfBounds {
            segment,
            offset,
            len,
            available: seg.len() as u64,
        })?;
        if end > seg.len() as u64 {
            return Err(Error::OutOfBounds {
                segment,
                offset,
                len,
                available: seg.len() as u64,
            });
        }
        Ok(&seg[offset as usize..end as usize])
    }

    /// Overwrite in place at a word offset. The range must already exist.
    pub fn update(&mut self, segment: SegmentId, word_offset: u32, bytes: &[u8]) -> Result<()> {
        self.update_bytes(segment, word_offset as u64 * BYTES_PER_WORD as u64, bytes)
    }

    /// Byte-granular overwrite, used by read-modify-write of bit windows.
    pub fn update_bytes(&mut self, segment: SegmentId, offset: u64, bytes: &[u8]) -> Result<()> {
        let available = self.segment(segment)?.len() as u64;
        let end = offset + bytes.len() as u64;
        if end > available {
            return Err(Error::OutOfBounds {
                segment,
                offset,
                len: bytes.len() as u64,
                available,
            });
        }
        let seg = &mut self.segments[segment as usize];
        seg[offset as usize..end as usize].copy_from_slice(bytes);
        Ok(())
    }

    /// Read one little-endian word.
    pub fn read_word(&self, segment: SegmentId, word_offset: u32) -> Result<u64> {
        let bytes = self.get(segment, word_offset, 1)?;
        Ok(u64::from_le_bytes(bytes.try_into().expect("word slice")))
    }

    /// Write one little-endian word.
    pub fn write_word(&mut self, segment: SegmentId, word_offset: u32, value: u64) -> Result<()> {
        self.update(segment, word_offset, &value.to_le_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_is_word_aligned_and_zeroed() {
        let mut arena = SegmentArena::new();
        let (seg, pos) = arena.alloc(0, 3).unwrap();
        assert_eq!((seg, pos), (0, 0));
        assert_eq!(arena.get(0, 0, 3).unwrap(), &[0u8; 24][..]);

        let (seg, pos) = arena.alloc(0, 1).unwrap();
        assert_eq!((seg, pos), (0, 3));
        assert_eq!(arena.word_len(0).unwrap(), 4);
    }

    #[test]
    fn uncapped_hint_always_grows_in_place() {
        let mut arena = SegmentArena::new();
        for i in 0..100 {
            let (seg, pos) = arena.alloc(0, 2).unwrap();
            assert_eq!((seg, pos), (0, i * 2));
        }
    }

    #[test]
    fn capped_arena_spills_then_fails() {
        let mut arena = SegmentArena::with_cap(4);
        let (seg, _) = arena.alloc(0, 4).unwrap();
        assert_eq!(seg, 0);
        // Segment 0 is full; the request spills to a new segment.
        let (seg, pos) = arena.alloc(0, 4).unwrap();
        assert_eq!((seg, pos), (1, 0));
        // Nothing can hold 5 words.
        assert_eq!(
            arena.alloc(0, 5),
            Err(Error::OutOfMemory { words: 5 })
        );
    }

    #[test]
    fn alloc_in_refuses_to_spill() {
        let mut arena = SegmentArena::with_cap(2);
        arena.alloc_in(0, 2).unwrap();
        assert_eq!(arena.alloc_in(0, 1), Err(Error::OutOfMemory { words: 1 }));
    }

    #[test]
    fn out_of_bounds_read_is_an_error() {
        let arena = SegmentArena::from_segments(vec![vec![0u8; 16]]).unwrap();
        assert!(arena.get(0, 0, 2).is_ok());
        assert!(matches!(
            arena.get(0, 1, 2),
            Err(Error::OutOfBounds { .. })
        ));
        assert_eq!(arena.read_word(1, 0), Err(Error::UnknownSegment(1)));
    }

    #[test]
    fn from_segments_rejects_ragged_buffers() {
        assert!(SegmentArena::from_segments(vec![vec![0u8; 7]]).is_err());
    }

    #[test]
    fn word_round_trip() {
        let mut arena = SegmentArena::new();
        arena.alloc(0, 2).unwrap();
        arena.write_word(0, 1, 0x0102_0304_0506_0708).unwrap();
        assert_eq!(arena.read_word(0, 1).unwrap(), 0x0102_0304_0506_0708);
        assert_eq!(arena.read_word(0, 0).unwrap(), 0);
    }
}
