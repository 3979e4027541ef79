//! Pointer preamble and list element layouts.
//!
//! Every reference on the wire is an 8-byte little-endian preamble: the low
//! 32 bits carry the kind (low 2 bits) and a signed word offset, the high 32
//! bits carry kind-specific size information. [`RawPointer`] is the lossless
//! decoded form; `encode(decode(w)) == w` for every well-formed word.

use crate::arena::SegmentId;

/// Element layout codes for list pointers, wire values 0..7.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementSize {
    Void = 0,
    Bit = 1,
    Byte = 2,
    TwoBytes = 3,
    FourBytes = 4,
    EightBytes = 5,
    Pointer = 6,
    InlineComposite = 7,
}

impl ElementSize {
    /// Decode the 3-bit wire code.
    pub fn from_code(code: u32) -> ElementSize {
        match code & 7 {
            0 => ElementSize::Void,
            1 => ElementSize::Bit,
            2 => ElementSize::Byte,
            3 => ElementSize::TwoBytes,
            4 => ElementSize::FourBytes,
            5 => ElementSize::EightBytes,
            6 => ElementSize::Pointer,
            _ => ElementSize::InlineComposite,
        }
    }

    pub fn code(self) -> u32 {
        self as u32
    }

    /// Bits of body data per element. Pointer and inline-composite elements
    /// are not measured in data bits and report 0 here; `Pointer` elements
    /// occupy one word each.
    pub fn data_bits(self) -> u32 {
        match self {
            ElementSize::Void => 0,
            ElementSize::Bit => 1,
            ElementSize::Byte => 8,
            ElementSize::TwoBytes => 16,
            ElementSize::FourBytes => 32,
            ElementSize::EightBytes => 64,
            ElementSize::Pointer => 0,
            ElementSize::InlineComposite => 0,
        }
    }
}

/// Size of a struct: data section and pointer section, in words.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StructSize {
    pub data: u16,
    pub ptrs: u16,
}

impl StructSize {
    pub const fn new(data: u16, ptrs: u16) -> StructSize {
        StructSize { data, ptrs }
    }

    pub fn total(&self) -> u32 {
        self.data as u32 + self.ptrs as u32
    }
}

/// Resolved layout of a list body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListLayout {
    /// Fixed-width elements, including `Pointer` (one word each) and `Void`
    /// (zero body words regardless of count).
    Prim { elem: ElementSize, count: u32 },
    /// Structs laid out contiguously behind a tag word. The tag is a
    /// struct-kind preamble whose offset field holds the element count.
    Composite { count: u32, elem_size: StructSize },
}

impl ListLayout {
    pub fn count(&self) -> u32 {
        match *self {
            ListLayout::Prim { count, .. } => count,
            ListLayout::Composite { count, .. } => count,
        }
    }

    /// Body words occupied by the elements, excluding the composite tag.
    pub fn body_words(&self) -> u32 {
        match *self {
            ListLayout::Prim { elem: ElementSize::Pointer, count } => count,
            ListLayout::Prim { elem, count } => {
                let bits = elem.data_bits() as u64 * count as u64;
                bits.div_ceil(64) as u32
            }
            ListLayout::Composite { count, elem_size } => count * elem_size.total(),
        }
    }
}

/// One decoded pointer preamble.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawPointer {
    Null,
    Struct {
        offset: i32,
        size: StructSize,
    },
    List {
        offset: i32,
        elem: ElementSize,
        /// Element count, except for inline-composite lists where this is
        /// the total body word count (the tag holds the element count).
        count: u32,
    },
    Far {
        /// Unsigned word offset of the landing pad in `segment`.
        offset: u32,
        segment: SegmentId,
        double: bool,
    },
    Capability {
        index: u32,
    },
}

impl RawPointer {
    /// Parse one little-endian preamble word.
    ///
    /// The all-zero word is Null. Kind bits 3 decode as a capability only in
    /// the canonical pattern (entire low half == 3); every other kind-3 word
    /// is reserved and rejected.
    pub fn decode(word: u64) -> Result<RawPointer, &'static str> {
        if word == 0 {
            return Ok(RawPointer::Null);
        }
        let lo = word as u32;
        let hi = (word >> 32) as u32;
        match lo & 3 {
            0 => Ok(RawPointer::Struct {
                offset: (lo as i32) >> 2,
                size: StructSize::new(hi as u16, (hi >> 16) as u16),
            }),
            1 => Ok(RawPointer::List {
                offset: (lo as i32) >> 2,
                elem: ElementSize::from_code(hi & 7),
                count: hi >> 3,
            }),
            2 => Ok(RawPointer::Far {
                offset: lo >> 3,
                segment: hi,
                double: lo & 4 != 0,
            }),
            _ => {
                if lo == 3 {
                    Ok(RawPointer::Capability { index: hi })
                } else {
                    Err("reserved pointer kind")
                }
            }
        }
    }

    /// The inverse of [`RawPointer::decode`].
    pub fn encode(&self) -> u64 {
        match *self {
            RawPointer::Null => 0,
            RawPointer::Struct { offset, size } => {
                let lo = ((offset as u32) << 2) as u64;
                let hi = size.data as u64 | ((size.ptrs as u64) << 16);
                lo | (hi << 32)
            }
            RawPointer::List { offset, elem, count } => {
                let lo = (((offset as u32) << 2) | 1) as u64;
                let hi = ((count as u64) << 3) | elem.code() as u64;
                lo | (hi << 32)
            }
            RawPointer::Far { offset, segment, double } => {
                let lo = ((offset << 3) | ((double as u32) << 2) | 2) as u64;
                lo | ((segment as u64) << 32)
            }
            RawPointer::Capability { index } => 3 | ((index as u64) << 32),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word(bytes: [u8; 8]) -> u64 {
        u64::from_le_bytes(bytes)
    }

    #[test]
    fn struct_pointer_encodes_to_known_bytes() {
        // offset=3, data_words=2, ptr_words=1
        let p = RawPointer::Struct {
            offset: 3,
            size: StructSize::new(2, 1),
        };
        assert_eq!(
            p.encode().to_le_bytes(),
            [0x0C, 0x00, 0x00, 0x00, 0x02, 0x00, 0x01, 0x00]
        );
        assert_eq!(RawPointer::decode(p.encode()).unwrap(), p);
    }

    #[test]
    fn negative_struct_offset_round_trips() {
        let p = RawPointer::Struct {
            offset: -1,
            size: StructSize::new(0, 0),
        };
        let w = p.encode();
        assert_eq!(w as u32, 0xffff_fffc);
        assert_eq!(RawPointer::decode(w).unwrap(), p);
    }

    #[test]
    fn single_far_decodes() {
        // Far to segment 1, offset 0.
        let w = word([0x02, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00]);
        assert_eq!(
            RawPointer::decode(w).unwrap(),
            RawPointer::Far {
                offset: 0,
                segment: 1,
                double: false
            }
        );
    }

    #[test]
    fn double_far_bit_is_carried() {
        let p = RawPointer::Far {
            offset: 9,
            segment: 4,
            double: true,
        };
        assert_eq!(RawPointer::decode(p.encode()).unwrap(), p);
    }

    #[test]
    fn all_zero_is_null() {
        assert_eq!(RawPointer::decode(0).unwrap(), RawPointer::Null);
        assert_eq!(RawPointer::Null.encode(), 0);
    }

    #[test]
    fn capability_pattern_and_reserved_patterns() {
        let cap = RawPointer::Capability { index: 7 };
        assert_eq!(RawPointer::decode(cap.encode()).unwrap(), cap);
        // Kind bits 3 with any extra low bits set is reserved.
        assert!(RawPointer::decode(0x0b).is_err());
        assert!(RawPointer::decode(0x0000_0001_0000_0007).is_err());
    }

    #[test]
    fn list_round_trip_all_element_sizes() {
        for code in 0..8 {
            let p = RawPointer::List {
                offset: -6,
                elem: ElementSize::from_code(code),
                count: 1000,
            };
            assert_eq!(RawPointer::decode(p.encode()).unwrap(), p);
        }
    }

    #[test]
    fn body_words_per_layout() {
        let prim = |elem, count| ListLayout::Prim { elem, count };
        assert_eq!(prim(ElementSize::Void, 1000).body_words(), 0);
        assert_eq!(prim(ElementSize::Bit, 4).body_words(), 1);
        // Exactly a multiple of 64 bits occupies exactly bits/64 words.
        assert_eq!(prim(ElementSize::Bit, 128).body_words(), 2);
        assert_eq!(prim(ElementSize::Byte, 9).body_words(), 2);
        assert_eq!(prim(ElementSize::Pointer, 3).body_words(), 3);
        let composite = ListLayout::Composite {
            count: 4,
            elem_size: StructSize::new(1, 2),
        };
        assert_eq!(composite.body_words(), 12);
    }
}
