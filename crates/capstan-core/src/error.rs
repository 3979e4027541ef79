//! Error types for the wire-format engine.

use crate::arena::SegmentId;

/// Errors raised by the segment arena and the reference engine.
///
/// Typed accessors recover from `MalformedPointer` where a schema default is
/// available; everything else surfaces to the call site.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// A pointer word had kind bits or ranges that make no sense.
    #[error("malformed pointer in segment {segment} at word {pos}: {reason}")]
    MalformedPointer {
        segment: SegmentId,
        pos: i64,
        reason: &'static str,
    },

    /// A read or write went past the end of a segment.
    #[error("segment {segment}: byte range {offset}+{len} exceeds segment of {available} bytes")]
    OutOfBounds {
        segment: SegmentId,
        offset: u64,
        len: u64,
        available: u64,
    },

    /// The referenced segment id does not exist in this message.
    #[error("unknown segment {0}")]
    UnknownSegment(SegmentId),

    /// Allocation would exceed the configured per-segment cap.
    #[error("allocation of {words} words exceeds the configured segment cap")]
    OutOfMemory { words: u32 },

    /// The byte stream does not parse as a segment table.
    #[error("invalid message framing: {0}")]
    InvalidFrame(&'static str),

    /// A text field did not end with the mandatory NUL byte.
    #[error("text field is not NUL-terminated")]
    UnterminatedText,

    /// A text field held bytes that are not valid UTF-8.
    #[error("text field is not valid UTF-8")]
    InvalidUtf8,

    /// An operation was applied to a reference of the wrong kind.
    #[error("reference kind does not support {0}")]
    WrongKind(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
