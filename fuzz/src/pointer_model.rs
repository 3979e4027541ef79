//! Round-trip model for pointer preambles.
//!
//! Two directions: arbitrary decodable words must re-encode to the same
//! bits, and structured pointers must survive encode → decode unchanged.

use capstan_core::{ElementSize, RawPointer, StructSize};

/// Structured generator input for a pointer.
#[derive(Debug, Clone, Copy)]
pub enum PointerSpec {
    Null,
    Struct { offset: i32, data: u16, ptrs: u16 },
    List { offset: i32, elem_code: u8, count: u32 },
    Far { offset: u32, segment: u32, double: bool },
    Capability { index: u32 },
}

/// Clamp generator fields into the ranges the wire encoding can carry.
pub fn normalize(spec: PointerSpec) -> RawPointer {
    match spec {
        PointerSpec::Null => RawPointer::Null,
        PointerSpec::Struct { offset, data, ptrs } => RawPointer::Struct {
            // Offsets are 30-bit signed on the wire.
            offset: (offset << 2) >> 2,
            size: StructSize::new(data, ptrs),
        },
        PointerSpec::List { offset, elem_code, count } => RawPointer::List {
            offset: (offset << 2) >> 2,
            elem: ElementSize::from_code(elem_code as u32),
            count: count & ((1 << 29) - 1),
        },
        PointerSpec::Far { offset, segment, double } => RawPointer::Far {
            offset: offset & ((1 << 29) - 1),
            segment,
            double,
        },
        PointerSpec::Capability { index } => RawPointer::Capability { index },
    }
}

/// encode → decode must be identity on normalized pointers.
pub fn verify_structured(spec: PointerSpec) -> Result<(), String> {
    let pointer = normalize(spec);
    let word = pointer.encode();
    match RawPointer::decode(word) {
        Ok(decoded) if decoded == pointer => Ok(()),
        Ok(decoded) => Err(format!(
            "encode/decode mismatch: {pointer:?} became {decoded:?} via {word:#018x}"
        )),
        Err(e) => Err(format!("encoded pointer failed to decode: {pointer:?}: {e}")),
    }
}

/// Every decodable word must re-encode to the same bits; a zero-offset
/// struct encoding of all-zero fields is the one legal aliasing (it IS the
/// null word).
pub fn verify_raw_word(word: u64) -> Result<(), String> {
    match RawPointer::decode(word) {
        Err(_) => Ok(()), // reserved patterns are allowed to be rejected
        Ok(decoded) => {
            let reencoded = decoded.encode();
            if reencoded == word {
                Ok(())
            } else {
                Err(format!(
                    "decode/encode mismatch: {word:#018x} became {reencoded:#018x} ({decoded:?})"
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structured_corners() {
        let specs = [
            PointerSpec::Null,
            PointerSpec::Struct { offset: 0, data: 0, ptrs: 0 },
            PointerSpec::Struct { offset: -1, data: u16::MAX, ptrs: u16::MAX },
            PointerSpec::Struct { offset: (1 << 29) - 1, data: 1, ptrs: 2 },
            PointerSpec::List { offset: -(1 << 29), elem_code: 7, count: u32::MAX },
            PointerSpec::List { offset: 5, elem_code: 1, count: 0 },
            PointerSpec::Far { offset: u32::MAX, segment: u32::MAX, double: true },
            PointerSpec::Capability { index: u32::MAX },
        ];
        for spec in specs {
            verify_structured(spec).unwrap();
        }
    }

    #[test]
    fn raw_word_sweep() {
        for word in [
            0u64,
            1,
            2,
            3,
            0x0001_0002_0000_000C, // struct: offset 3, data 2, ptrs 1
            u64::MAX,
            0x0000_0001_0000_0002, // far to segment 1
            0xffff_ffff_ffff_fffc, // struct, offset -1
        ] {
            verify_raw_word(word).unwrap();
        }
    }

    #[test]
    fn null_aliases_zero_struct() {
        // A struct pointer with every field zero encodes to the null word,
        // and the null word decodes to Null.
        let p = RawPointer::Struct { offset: 0, size: StructSize::new(0, 0) };
        assert_eq!(p.encode(), 0);
        assert_eq!(RawPointer::decode(0).unwrap(), RawPointer::Null);
    }
}
