//! The reference engine: decoding, navigating, and writing typed pointers.
//!
//! A [`Ref`] is a plain `Copy` value naming a pointer's location and its
//! resolved target inside a [`Message`]'s arena; it never borrows into the
//! buffers. All reads and writes go through the owning [`Message`], which is
//! the only holder of the [`SegmentArena`].

use crate::arena::{SegmentArena, SegmentId, BYTES_PER_WORD};
use crate::error::{Error, Result};
use crate::layout::{ElementSize, ListLayout, RawPointer, StructSize};

/// Resolved kind of a reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefKind {
    Null,
    Struct(StructSize),
    List(ListLayout),
    /// A capability pointer; `cap` indexes the enclosing payload's cap table.
    Interface { cap: u32 },
    /// An unfollowed far pointer (only produced with far-following disabled).
    Far { segment: SegmentId, double: bool },
}

/// A pointer's location plus its decoded target.
///
/// `pos` is the word index of the pointer itself; `pos == -1` marks a
/// synthetic ref (composite list element or far tag) whose `offset` is the
/// absolute word index of its data rather than a relative displacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ref {
    pub segment: SegmentId,
    pub pos: i32,
    pub offset: i32,
    pub kind: RefKind,
}

impl Ref {
    pub const NULL: Ref = Ref {
        segment: 0,
        pos: -1,
        offset: 0,
        kind: RefKind::Null,
    };

    pub fn is_null(&self) -> bool {
        matches!(self.kind, RefKind::Null)
    }

    /// Word index of the first content word this reference points at.
    /// For composite lists this is the tag word.
    pub fn data_pos(&self) -> u32 {
        if self.pos >= 0 {
            (self.pos + 1 + self.offset) as u32
        } else {
            self.offset as u32
        }
    }

    /// Re-encode this reference as a preamble word, relative to `pos`.
    pub(crate) fn encode_word(&self) -> u64 {
        let raw = match self.kind {
            RefKind::Null => RawPointer::Null,
            RefKind::Struct(size) => RawPointer::Struct {
                offset: self.offset,
                size,
            },
            RefKind::List(ListLayout::Prim { elem, count }) => RawPointer::List {
                offset: self.offset,
                elem,
                count,
            },
            RefKind::List(layout @ ListLayout::Composite { .. }) => RawPointer::List {
                offset: self.offset,
                elem: ElementSize::InlineComposite,
                count: layout.body_words(),
            },
            RefKind::Interface { cap } => RawPointer::Capability { index: cap },
            RefKind::Far { segment, double } => RawPointer::Far {
                offset: self.offset as u32,
                segment,
                double,
            },
        };
        raw.encode()
    }
}

/// Element views of a list, per layout family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListView {
    /// `count` zero-length blanks; no body words at all.
    Void { count: u32 },
    /// Fixed-width elements, read via [`Message::read_list_prim`].
    Prims { elem: ElementSize, count: u32 },
    /// Decoded pointer elements.
    Ptrs(Vec<Ref>),
    /// Synthetic struct refs into an inline-composite body.
    Structs(Vec<Ref>),
}

impl ListView {
    pub fn len(&self) -> usize {
        match self {
            ListView::Void { count } => *count as usize,
            ListView::Prims { count, .. } => *count as usize,
            ListView::Ptrs(v) => v.len(),
            ListView::Structs(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One message: a segment arena plus the reference engine over it.
#[derive(Debug, Default)]
pub struct Message {
    arena: SegmentArena,
}

impl Message {

    pub fn new() -> Message {
        Message {
            arena: SegmentArena::new(),
        }
    }

    pub fn with_arena(arena: SegmentArena) -> Message {
        Message { arena }
    }

    /// Adopt received segments as a read-only message.
    pub fn from_segments(segments: Vec<Vec<u8>>) -> Result<Message> {
        Ok(Message {
            arena: SegmentArena::from_segments(segments)?,
        })
    }

    pub fn arena(&self) -> &SegmentArena {
        &self.arena
    }

    pub fn arena_mut(&mut self) -> &mut SegmentArena {
        &mut self.arena
    }

    pub fn segments(&self) -> &[Vec<u8>] {
        self.arena.segments()
    }

    /// The root reference at segment 0, word 0. An empty message has a null
    /// root.
    pub fn root(&self) -> Result<Ref> {
        if self.arena.segment_count() == 0 || self.arena.word_len(0)? == 0 {
            return Ok(Ref::NULL);
        }
        self.read_ref(0, 0, true)
    }

    /// Allocate the root pointer word plus a struct body for it.
    pub fn init_root(&mut self, size: StructSize) -> Result<Ref> {
        self.alloc(RefKind::Struct(size), 0, 1 + size.total())
    }

    // ------------------------------------------------------------------
    // Read path
    // ------------------------------------------------------------------

    /// Decode the pointer at `(segment, pos)`.
    ///
    /// With `follow_far` set, far pointers are resolved through their
    /// landing pad; the pad itself is always parsed with far-following
    /// disabled, so resolution never chains.
    pub fn read_ref(&self, segment: SegmentId, pos: u32, follow_far: bool) -> Result<Ref> {
        let word = self.arena.read_word(segment, pos)?;
        let raw = RawPointer::decode(word).map_err(|reason| Error::MalformedPointer {
            segment,
            pos: pos as i64,
            reason,
        })?;
        match raw {
            RawPointer::Null => Ok(Ref {
                segment,
                pos: pos as i32,
                offset: 0,
                kind: RefKind::Null,
            }),
            RawPointer::Struct { offset, size } => Ok(Ref {
                segment,
                pos: pos as i32,
                offset,
                kind: RefKind::Struct(size),
            }),
            RawPointer::List { offset, elem: ElementSize::InlineComposite, count } => {
                self.read_composite(segment, pos as i32, offset, count)
            }
            RawPointer::List { offset, elem, count } => Ok(Ref {
                segment,
                pos: pos as i32,
                offset,
                kind: RefKind::List(ListLayout::Prim { elem, count }),
            }),
            RawPointer::Far { offset, segment: pad_segment, double } => {
                if follow_far {
                    self.resolve_far(pad_segment, offset, double)
                } else {
                    Ok(Ref {
                        segment,
                        pos: pos as i32,
                        offset: offset as i32,
                        kind: RefKind::Far {
                            segment: pad_segment,
                            double,
                        },
                    })
                }
            }
            RawPointer::Capability { index } => Ok(Ref {
                segment,
                pos: pos as i32,
                offset: 0,
                kind: RefKind::Interface { cap: index },
            }),
        }
    }

    /// Combine an inline-composite list pointer with its tag word.
    fn read_composite(
        &self,
        segment: SegmentId,
        pos: i32,
        offset: i32,
        total_words: u32,
    ) -> Result<Ref> {
        let probe = Ref {
            segment,
            pos,
            offset,
            kind: RefKind::Null,
        };
        let tag_pos = probe.data_pos();
        let tag_word = self.arena.read_word(segment, tag_pos)?;
        let malformed = |reason| Error::MalformedPointer {
            segment,
            pos: tag_pos as i64,
            reason,
        };
        match RawPointer::decode(tag_word).map_err(malformed)? {
            RawPointer::Struct { offset: raw_count, size } => {
                // The tag's offset field is the element count, not a delta.
                let count = raw_count as u32;
                if count as u64 * size.total() as u64 > total_words as u64 {
                    return Err(malformed("composite elements exceed list body"));
                }
                Ok(Ref {
                    segment,
                    pos,
                    offset,
                    kind: RefKind::List(ListLayout::Composite {
                        count,
                        elem_size: size,
                    }),
                })
            }
            _ => Err(malformed("composite tag is not a struct preamble")),
        }
    }

    /// Resolve a far pointer through its landing pad.
    fn resolve_far(&self, pad_segment: SegmentId, pad_offset: u32, double: bool) -> Result<Ref> {
        let pad = self.read_ref(pad_segment, pad_offset, false)?;
        if !double {
            return match pad.kind {
                RefKind::Far { .. } => Err(Error::MalformedPointer {
                    segment: pad_segment,
                    pos: pad_offset as i64,
                    reason: "single-far landing pad is itself far",
                }),
                _ => Ok(pad),
            };
        }
        // Double-far: the pad is a far pointer at the data, followed by a
        // tag word describing it.
        let RefKind::Far { segment: data_segment, double: false } = pad.kind else {
            return Err(Error::MalformedPointer {
                segment: pad_segment,
                pos: pad_offset as i64,
                reason: "double-far landing pad must hold a single far",
            });
        };
        let data_offset = pad.offset;
        let tag_word = self.arena.read_word(pad_segment, pad_offset + 1)?;
        let malformed = |reason| Error::MalformedPointer {
            segment: pad_segment,
            pos: pad_offset as i64 + 1,
            reason,
        };
        match RawPointer::decode(tag_word).map_err(malformed)? {
            RawPointer::Struct { size, .. } => Ok(Ref {
                segment: data_segment,
                pos: -1,
                offset: data_offset,
                kind: RefKind::Struct(size),
            }),
            RawPointer::List { elem: ElementSize::InlineComposite, count, .. } => {
                self.read_composite(data_segment, -1, data_offset, count)
            }
            RawPointer::List { elem, count, .. } => Ok(Ref {
                segment: data_segment,
                pos: -1,
                offset: data_offset,
                kind: RefKind::List(ListLayout::Prim { elem, count }),
            }),
            _ => Err(malformed("double-far tag must be struct or list")),
        }
    }

    /// Read a bit window from a struct's data section.
    ///
    /// Returns `default` when the window falls outside the struct's data
    /// words (schema evolution: an older payload simply lacks the field),
    /// and for null struct refs.
    pub fn read_struct_data(
        &self,
        r: Ref,
        bit_align: u32,
        bit_len: u32,
        default: u64,
    ) -> Result<u64> {
        let size = match r.kind {
            RefKind::Struct(size) => size,
            RefKind::Null => return Ok(default),
            _ => return Err(Error::WrongKind("struct data read")),
        };
        if bit_len == 0 || bit_align as u64 + bit_len as u64 > size.data as u64 * 64 {
            return Ok(default);
        }
        self.read_bits(r.segment, r.data_pos(), bit_align as u64, bit_len)
    }

    /// Patch a bit window in a struct's data section in place.
    pub fn write_struct_data(
        &mut self,
        r: Ref,
        bit_align: u32,
        bit_len: u32,
        value: u64,
    ) -> Result<()> {
        let size = match r.kind {
            RefKind::Struct(size) => size,
            _ => return Err(Error::WrongKind("struct data write")),
        };
        let limit = size.data as u64 * 64;
        if bit_align as u64 + bit_len as u64 > limit {
            return Err(Error::OutOfBounds {
                segment: r.segment,
                offset: bit_align as u64,
                len: bit_len as u64,
                available: limit,
            });
        }
        self.write_bits(r.segment, r.data_pos(), bit_align as u64, bit_len, value)
    }

    fn ptr_section(&self, r: Ref) -> Result<(StructSize, u32)> {
        match r.kind {
            RefKind::Struct(size) => Ok((size, r.data_pos() + size.data as u32)),
            _ => Err(Error::WrongKind("pointer section access")),
        }
    }

    /// The undecoded pointer slot `idx` of a struct, for writers.
    pub fn ptr(&self, r: Ref, idx: u16) -> Result<Ref> {
        let (size, base) = self.ptr_section(r)?;
        if idx >= size.ptrs {
            return Err(Error::OutOfBounds {
                segment: r.segment,
                offset: idx as u64,
                len: 1,
                available: size.ptrs as u64,
            });
        }
        Ok(Ref {
            segment: r.segment,
            pos: (base + idx as u32) as i32,
            offset: 0,
            kind: RefKind::Null,
        })
    }

    /// Decode pointer slot `idx` of a struct; out-of-window indices and null
    /// parents yield the null ref.
    pub fn read_struct_ptr(&self, r: Ref, idx: u16) -> Result<Ref> {
        if r.is_null() {
            return Ok(Ref::NULL);
        }
        let (size, base) = self.ptr_section(r)?;
        if idx >= size.ptrs {
            return Ok(Ref::NULL);
        }
        self.read_ref(r.segment, base + idx as u32, true)
    }

    /// Emit `child`'s preamble at its slot, which must lie inside the
    /// parent's pointer section.
    pub fn write_struct_ptr(&mut self, child: Ref, parent: Ref) -> Result<()> {
        let (size, base) = self.ptr_section(parent)?;
        if child.pos < base as i32 || child.pos >= (base + size.ptrs as u32) as i32 {
            return Err(Error::WrongKind("pointer outside the parent's pointer section"));
        }
        self.arena
            .write_word(child.segment, child.pos as u32, child.encode_word())
    }

    // ------------------------------------------------------------------
    // Lists
    // ------------------------------------------------------------------

    pub fn list_len(&self, r: Ref) -> Result<u32> {
        match r.kind {
            RefKind::Null => Ok(0),
            RefKind::List(layout) => Ok(layout.count()),
            _ => Err(Error::WrongKind("list length")),
        }
    }

    /// Produce element views for a list reference.
    pub fn read_list(&self, r: Ref) -> Result<ListView> {
        match r.kind {
            RefKind::Null => Ok(ListView::Void { count: 0 }),
            RefKind::List(ListLayout::Prim { elem: ElementSize::Void, count }) => {
                Ok(ListView::Void { count })
            }
            RefKind::List(ListLayout::Prim { elem: ElementSize::Pointer, count }) => {
                let base = r.data_pos();
                let mut slots = Vec::with_capacity(count as usize);
                for i in 0..count {
                    slots.push(self.read_ref(r.segment, base + i, true)?);
                }
                Ok(ListView::Ptrs(slots))
            }
            RefKind::List(ListLayout::Prim { elem, count }) => {
                Ok(ListView::Prims { elem, count })
            }
            RefKind::List(ListLayout::Composite { count, elem_size }) => {
                let first = r.data_pos() + 1; // past the tag
                let stride = elem_size.total();
                let mut elems = Vec::with_capacity(count as usize);
                for i in 0..count {
                    elems.push(Ref {
                        segment: r.segment,
                        pos: -1,
                        offset: (first + i * stride) as i32,
                        kind: RefKind::Struct(elem_size),
                    });
                }
                Ok(ListView::Structs(elems))
            }
            _ => Err(Error::WrongKind("list read")),
        }
    }

    fn prim_bit_align(elem: ElementSize, idx: u32) -> u64 {
        match elem {
            // Bit lists are byte-big-endian: element 0 sits at bit 7.
            ElementSize::Bit => (idx / 8) as u64 * 8 + (7 - idx % 8) as u64,
            _ => idx as u64 * elem.data_bits() as u64,
        }
    }

    /// Read a fixed-width element of a primitive list.
    pub fn read_list_prim(&self, r: Ref, idx: u32) -> Result<u64> {
        let RefKind::List(ListLayout::Prim { elem, count }) = r.kind else {
            return Err(Error::WrongKind("primitive element read"));
        };
        if idx >= count {
            return Err(Error::OutOfBounds {
                segment: r.segment,
                offset: idx as u64,
                len: 1,
                available: count as u64,
            });
        }
        let bits = elem.data_bits();
        if bits == 0 {
            return Ok(0);
        }
        self.read_bits(r.segment, r.data_pos(), Self::prim_bit_align(elem, idx), bits)
    }

    /// Read-modify-write a fixed-width element of a primitive list.
    pub fn write_list_prim(&mut self, r: Ref, idx: u32, value: u64) -> Result<()> {
        let RefKind::List(ListLayout::Prim { elem, count }) = r.kind else {
            return Err(Error::WrongKind("primitive element write"));
        };
        if idx >= count {
            return Err(Error::OutOfBounds {
                segment: r.segment,
                offset: idx as u64,
                len: 1,
                available: count as u64,
            });
        }
        let bits = elem.data_bits();
        if bits == 0 {
            return Ok(());
        }
        self.write_bits(
            r.segment,
            r.data_pos(),
            Self::prim_bit_align(elem, idx),
            bits,
            value,
        )
    }

    /// Decode a pointer element of a pointer list.
    pub fn read_list_ptr(&self, r: Ref, idx: u32) -> Result<Ref> {
        let RefKind::List(ListLayout::Prim { elem: ElementSize::Pointer, count }) = r.kind else {
            return Err(Error::WrongKind("pointer element read"));
        };
        if idx >= count {
            return Ok(Ref::NULL);
        }
        self.read_ref(r.segment, r.data_pos() + idx, true)
    }

    // ------------------------------------------------------------------
    // Text and data
    // ------------------------------------------------------------------

    /// Read a text field. The trailing NUL is not part of the value.
    pub fn read_text(&self, r: Ref) -> Result<String> {
        if r.is_null() {
            return Ok(String::new());
        }
        let RefKind::List(ListLayout::Prim { elem: ElementSize::Byte, count }) = r.kind else {
            return Err(Error::WrongKind("text read"));
        };
        if count == 0 {
            return Err(Error::UnterminatedText);
        }
        let bytes = self.arena.get_bytes(
            r.segment,
            r.data_pos() as u64 * BYTES_PER_WORD as u64,
            count as u64,
        )?;
        if bytes[count as usize - 1] != 0 {
            return Err(Error::UnterminatedText);
        }
        String::from_utf8(bytes[..count as usize - 1].to_vec()).map_err(|_| Error::InvalidUtf8)
    }

    /// Read a data field: the raw byte list, no terminator.
    pub fn read_blob(&self, r: Ref) -> Result<Vec<u8>> {
        if r.is_null() {
            return Ok(Vec::new());
        }
        let RefKind::List(ListLayout::Prim { elem: ElementSize::Byte, count }) = r.kind else {
            return Err(Error::WrongKind("data read"));
        };
        Ok(self
            .arena
            .get_bytes(
                r.segment,
                r.data_pos() as u64 * BYTES_PER_WORD as u64,
                count as u64,
            )?
            .to_vec())
    }

    /// Allocate a byte list holding `text` plus the mandatory NUL and store
    /// its pointer in the parent's `idx` slot.
    pub fn write_text(&mut self, parent: Ref, idx: u16, text: &str) -> Result<Ref> {
        let count = text.len() as u32 + 1;
        let r = self.alloc_list(
            parent,
            idx,
            ListLayout::Prim {
                elem: ElementSize::Byte,
                count,
            },
        )?;
        self.arena.update_bytes(
            r.segment,
            r.data_pos() as u64 * BYTES_PER_WORD as u64,
            text.as_bytes(),
        )?;
        Ok(r)
    }

    /// Allocate a byte list holding `bytes` (padded with NULs to the word
    /// boundary) and store its pointer in the parent's `idx` slot.
    pub fn write_blob(&mut self, parent: Ref, idx: u16, bytes: &[u8]) -> Result<Ref> {
        let r = self.alloc_list(
            parent,
            idx,
            ListLayout::Prim {
                elem: ElementSize::Byte,
                count: bytes.len() as u32,
            },
        )?;
        self.arena.update_bytes(
            r.segment,
            r.data_pos() as u64 * BYTES_PER_WORD as u64,
            bytes,
        )?;
        Ok(r)
    }

    // ------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------

    /// Allocate `words` words (pointer word included), set the kind, and
    /// write the preamble with a zero offset. Composite list kinds also get
    /// their tag word.
    pub fn alloc(&mut self, kind: RefKind, hint: SegmentId, words: u32) -> Result<Ref> {
        let (segment, pos) = self.arena.alloc(hint, words)?;
        let r = Ref {
            segment,
            pos: pos as i32,
            offset: 0,
            kind,
        };
        self.arena.write_word(segment, pos, r.encode_word())?;
        if let RefKind::List(ListLayout::Composite { count, elem_size }) = kind {
            self.write_composite_tag(segment, pos + 1, count, elem_size)?;
        }
        Ok(r)
    }

    fn write_composite_tag(
        &mut self,
        segment: SegmentId,
        pos: u32,
        count: u32,
        elem_size: StructSize,
    ) -> Result<()> {
        let tag = RawPointer::Struct {
            offset: count as i32,
            size: elem_size,
        };
        self.arena.write_word(segment, pos, tag.encode())
    }

    /// Allocate a list body in the parent's segment and store its pointer in
    /// the parent's `idx` slot.
    pub fn alloc_list(&mut self, parent: Ref, idx: u16, layout: ListLayout) -> Result<Ref> {
        let slot = self.ptr(parent, idx)?;
        let tag_words = matches!(layout, ListLayout::Composite { .. }) as u32;
        let data = self
            .arena
            .alloc_in(parent.segment, layout.body_words() + tag_words)?;
        if let ListLayout::Composite { count, elem_size } = layout {
            self.write_composite_tag(parent.segment, data, count, elem_size)?;
        }
        let child = Ref {
            segment: parent.segment,
            pos: slot.pos,
            offset: data as i32 - slot.pos - 1,
            kind: RefKind::List(layout),
        };
        self.write_struct_ptr(child, parent)?;
        Ok(child)
    }

    /// Allocate a struct body in the parent's segment and store its pointer
    /// in the parent's `idx` slot.
    pub fn init_struct(&mut self, parent: Ref, idx: u16, size: StructSize) -> Result<Ref> {
        let slot = self.ptr(parent, idx)?;
        let data = self.arena.alloc_in(parent.segment, size.total())?;
        let child = Ref {
            segment: parent.segment,
            pos: slot.pos,
            offset: data as i32 - slot.pos - 1,
            kind: RefKind::Struct(size),
        };
        self.write_struct_ptr(child, parent)?;
        Ok(child)
    }

    /// Store a capability pointer in the parent's `idx` slot.
    pub fn write_cap_ptr(&mut self, parent: Ref, idx: u16, cap_index: u32) -> Result<Ref> {
        let slot = self.ptr(parent, idx)?;
        let child = Ref {
            segment: parent.segment,
            pos: slot.pos,
            offset: 0,
            kind: RefKind::Interface { cap: cap_index },
        };
        self.write_struct_ptr(child, parent)?;
        Ok(child)
    }

    /// Write a raw preamble at an arbitrary slot, bypassing the pointer
    /// window check. Used by the deep-copy path, which writes root slots and
    /// list element slots the window check cannot see.
    pub(crate) fn write_ref_at(&mut self, segment: SegmentId, pos: u32, r: Ref) -> Result<()> {
        self.arena.write_word(segment, pos, r.encode_word())
    }

    // ------------------------------------------------------------------
    // Bit windows
    // ------------------------------------------------------------------

    fn read_bits(
        &self,
        segment: SegmentId,
        base_word: u32,
        bit_align: u64,
        bit_len: u32,
    ) -> Result<u64> {
        let first_byte = base_word as u64 * BYTES_PER_WORD as u64 + bit_align / 8;
        let shift = (bit_align % 8) as u32;
        let nbytes = (shift as u64 + bit_len as u64).div_ceil(8);
        let bytes = self.arena.get_bytes(segment, first_byte, nbytes)?;
        let mut acc: u128 = 0;
        for (i, b) in bytes.iter().enumerate() {
            acc |= (*b as u128) << (8 * i);
        }
        let mask: u128 = if bit_len == 64 {
            u64::MAX as u128
        } else {
            (1u128 << bit_len) - 1
        };
        Ok(((acc >> shift) & mask) as u64)
    }

    fn write_bits(
        &mut self,
        segment: SegmentId,
        base_word: u32,
        bit_align: u64,
        bit_len: u32,
        value: u64,
    ) -> Result<()> {
        let first_byte = base_word as u64 * BYTES_PER_WORD as u64 + bit_align / 8;
        let shift = (bit_align % 8) as u32;
        let nbytes = (shift as u64 + bit_len as u64).div_ceil(8) as usize;
        let existing = self.arena.get_bytes(segment, first_byte, nbytes as u64)?;
        let mut acc: u128 = 0;
        for (i, b) in existing.iter().enumerate() {
            acc |= (*b as u128) << (8 * i);
        }
        let mask: u128 = if bit_len == 64 {
            u64::MAX as u128
        } else {
            (1u128 << bit_len) - 1
        };
        acc &= !(mask << shift);
        acc |= ((value as u128) & mask) << shift;
        let mut patched = vec![0u8; nbytes];
        for (i, b) in patched.iter_mut().enumerate() {
            *b = (acc >> (8 * i)) as u8;
        }
        self.arena.update_bytes(segment, first_byte, &patched)
    }
}
