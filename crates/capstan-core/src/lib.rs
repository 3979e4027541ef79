//! capstan-core: the segmented wire-format engine.
//!
//! Messages are sets of word-aligned segments holding structs and lists
//! behind 8-byte typed pointers. This crate owns the hard parts of that
//! encoding:
//!
//! - [`arena`]: the segment store, allocation and in-place update
//! - [`layout`]: pointer preambles and list element layouts
//! - [`refs`]: the reference engine: decode, navigate, write
//! - [`copy`]: deep copy into self-contained images
//! - [`framing`]: the segment-table header, stream-safe
//! - [`schema`] / [`object`]: the schema-adapter seam and typed accessors
//! - [`transport`]: the byte-chunk transport seam
//!
//! # Example
//!
//! ```
//! use capstan_core::{Message, StructSize};
//!
//! let mut msg = Message::new();
//! let root = msg.init_root(StructSize::new(1, 1)).unwrap();
//! msg.write_struct_data(root, 0, 32, 42).unwrap();
//! msg.write_text(root, 0, "hello").unwrap();
//!
//! let root = msg.root().unwrap();
//! assert_eq!(msg.read_struct_data(root, 0, 32, 0).unwrap(), 42);
//! let text = msg.read_struct_ptr(root, 0).unwrap();
//! assert_eq!(msg.read_text(text).unwrap(), "hello");
//! ```

pub mod arena;
pub mod copy;
pub mod error;
pub mod framing;
pub mod layout;
pub mod object;
pub mod refs;
pub mod schema;
pub mod transport;

pub use arena::{SegmentArena, SegmentId, BYTES_PER_WORD};
pub use copy::{copy_to_blob, deep_copy};
pub use error::{Error, Result};
pub use framing::{write_message, FrameParser};
pub use layout::{ElementSize, ListLayout, RawPointer, StructSize};
pub use object::{Object, ObjectBuilder};
pub use refs::{ListView, Message, Ref, RefKind};
pub use schema::{
    FieldDescriptor, FieldSlot, MethodDescriptor, NodeKind, SchemaAdapter, SchemaNode,
    StaticSchema,
};
pub use transport::{Transport, TransportError};
