//! Deep copy: turn any reference into a contiguous self-contained image.
//!
//! Used when forwarding a payload between messages (call params into an
//! outgoing call, results into a return) and for producing standalone blobs.
//! The copy rebuilds the object in the destination arena depth-first, so
//! every emitted child pointer is recomputed relative to its new slot and
//! the result is self-contained by construction.

use crate::arena::SegmentId;
use crate::error::{Error, Result};
use crate::layout::{ElementSize, ListLayout, StructSize};
use crate::refs::{Message, Ref, RefKind};

/// Copy `root` out of `src` into a standalone single-segment blob.
///
/// Word 0 of the blob is a synthetic root pointer; reading the blob as a
/// message yields a structurally-equal object. A null ref copies to one
/// zero word.
pub fn copy_to_blob(src: &Message, root: Ref) -> Result<Vec<u8>> {
    let mut dst = Message::new();
    let (segment, slot) = dst.arena_mut().alloc(0, 1)?;
    copy_into(src, root, &mut dst, segment, slot)?;
    Ok(dst.segments()[0].clone())
}

/// Copy `r` from `src` into `dst` at `slot`, an undecoded pointer slot
/// previously obtained from [`Message::ptr`]. Returns the new reference.
pub fn deep_copy(src: &Message, r: Ref, dst: &mut Message, slot: Ref) -> Result<Ref> {
    copy_into(src, r, dst, slot.segment, slot.pos as u32)
}

fn copy_into(
    src: &Message,
    r: Ref,
    dst: &mut Message,
    dst_segment: SegmentId,
    slot_pos: u32,
) -> Result<Ref> {
    // A ref read with far-following disabled may still be a far; resolve it
    // before copying so the image holds no far pointers.
    let r = match r.kind {
        RefKind::Far { .. } => src.read_ref(r.segment, r.pos as u32, true)?,
        _ => r,
    };
    match r.kind {
        RefKind::Null => {
            let out = Ref {
                segment: dst_segment,
                pos: slot_pos as i32,
                offset: 0,
                kind: RefKind::Null,
            };
            dst.write_ref_at(dst_segment, slot_pos, out)?;
            Ok(out)
        }
        RefKind::Interface { .. } => {
            // Capability pointers travel verbatim; the cap-table index is
            // scoped to the enclosing payload, which moves with the copy.
            let out = Ref {
                segment: dst_segment,
                pos: slot_pos as i32,
                offset: 0,
                kind: r.kind,
            };
            dst.write_ref_at(dst_segment, slot_pos, out)?;
            Ok(out)
        }
        RefKind::Struct(size) => {
            let data = dst.arena_mut().alloc_in(dst_segment, size.total())?;
            copy_struct_body(src, r, size, dst, dst_segment, data)?;
            let out = Ref {
                segment: dst_segment,
                pos: slot_pos as i32,
                offset: data as i32 - slot_pos as i32 - 1,
                kind: r.kind,
            };
            dst.write_ref_at(dst_segment, slot_pos, out)?;
            Ok(out)
        }
        RefKind::List(layout @ ListLayout::Prim { elem: ElementSize::Pointer, count }) => {
            let data = dst.arena_mut().alloc_in(dst_segment, layout.body_words())?;
            for i in 0..count {
                let child = src.read_ref(r.segment, r.data_pos() + i, true)?;
                copy_into(src, child, dst, dst_segment, data + i)?;
            }
            finish_list(dst, dst_segment, slot_pos, data, layout)
        }
        RefKind::List(layout @ ListLayout::Prim { .. }) => {
            let words = layout.body_words();
            let data = dst.arena_mut().alloc_in(dst_segment, words)?;
            if words > 0 {
                let bytes = src.arena().get(r.segment, r.data_pos(), words)?.to_vec();
                dst.arena_mut().update(dst_segment, data, &bytes)?;
            }
            finish_list(dst, dst_segment, slot_pos, data, layout)
        }
        RefKind::List(layout @ ListLayout::Composite { count, elem_size }) => {
            let tag_pos = dst
                .arena_mut()
                .alloc_in(dst_segment, layout.body_words() + 1)?;
            // The tag is a struct preamble whose offset field is the count.
            let tag = crate::layout::RawPointer::Struct {
                offset: count as i32,
                size: elem_size,
            };
            dst.arena_mut().write_word(dst_segment, tag_pos, tag.encode())?;

            let stride = elem_size.total();
            for i in 0..count {
                let elem = Ref {
                    segment: r.segment,
                    pos: -1,
                    offset: (r.data_pos() + 1 + i * stride) as i32,
                    kind: RefKind::Struct(elem_size),
                };
                let dst_data = tag_pos + 1 + i * stride;
                copy_struct_body(src, elem, elem_size, dst, dst_segment, dst_data)?;
            }
            finish_list(dst, dst_segment, slot_pos, tag_pos, layout)
        }
        RefKind::Far { .. } => Err(Error::MalformedPointer {
            segment: r.segment,
            pos: r.pos as i64,
            reason: "unresolved far pointer in copy",
        }),
    }
}

/// Copy a struct's data words and recurse over its pointer section into a
/// body already allocated at `dst_data`.
fn copy_struct_body(
    src: &Message,
    r: Ref,
    size: StructSize,
    dst: &mut Message,
    dst_segment: SegmentId,
    dst_data: u32,
) -> Result<()> {
    if size.data > 0 {
        let bytes = src
            .arena()
            .get(r.segment, r.data_pos(), size.data as u32)?
            .to_vec();
        dst.arena_mut().update(dst_segment, dst_data, &bytes)?;
    }
    for idx in 0..size.ptrs {
        let child = src.read_struct_ptr(r, idx)?;
        copy_into(
            src,
            child,
            dst,
            dst_segment,
            dst_data + size.data as u32 + idx as u32,
        )?;
    }
    Ok(())
}

fn finish_list(
    dst: &mut Message,
    dst_segment: SegmentId,
    slot_pos: u32,
    data: u32,
    layout: ListLayout,
) -> Result<Ref> {
    let out = Ref {
        segment: dst_segment,
        pos: slot_pos as i32,
        offset: data as i32 - slot_pos as i32 - 1,
        kind: RefKind::List(layout),
    };
    dst.write_ref_at(dst_segment, slot_pos, out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::RawPointer;

    #[test]
    fn null_copies_to_one_zero_word() {
        let msg = Message::new();
        let blob = copy_to_blob(&msg, Ref::NULL).unwrap();
        assert_eq!(blob, vec![0u8; 8]);
    }

    #[test]
    fn nested_struct_blob_reads_standalone() {
        let mut msg = Message::new();
        let root = msg.init_root(StructSize::new(1, 2)).unwrap();
        msg.write_struct_data(root, 0, 64, 41).unwrap();
        let child = msg.init_struct(root, 1, StructSize::new(1, 1)).unwrap();
        msg.write_struct_data(child, 0, 32, 42).unwrap();
        msg.write_text(child, 0, "deep").unwrap();

        let blob = copy_to_blob(&msg, root).unwrap();
        let standalone = Message::from_segments(vec![blob]).unwrap();
        let root2 = standalone.root().unwrap();
        assert_eq!(standalone.read_struct_data(root2, 0, 64, 0).unwrap(), 41);
        assert!(standalone.read_struct_ptr(root2, 0).unwrap().is_null());
        let child2 = standalone.read_struct_ptr(root2, 1).unwrap();
        assert_eq!(standalone.read_struct_data(child2, 0, 32, 0).unwrap(), 42);
        let text = standalone.read_struct_ptr(child2, 0).unwrap();
        assert_eq!(standalone.read_text(text).unwrap(), "deep");
    }

    #[test]
    fn primitive_and_pointer_lists_survive_the_copy() {
        let mut msg = Message::new();
        let root = msg.init_root(StructSize::new(0, 2)).unwrap();
        let nums = msg
            .alloc_list(root, 0, ListLayout::Prim { elem: ElementSize::FourBytes, count: 3 })
            .unwrap();
        for i in 0..3 {
            msg.write_list_prim(nums, i, 100 + i as u64).unwrap();
        }
        let texts = msg
            .alloc_list(root, 1, ListLayout::Prim { elem: ElementSize::Pointer, count: 2 })
            .unwrap();
        // Populate the pointer list by copying text objects into its slots.
        let mut scratch = Message::new();
        let sroot = scratch.init_root(StructSize::new(0, 1)).unwrap();
        let t = scratch.write_text(sroot, 0, "one").unwrap();
        let slot0 = Ref { segment: texts.segment, pos: texts.data_pos() as i32, offset: 0, kind: RefKind::Null };
        deep_copy(&scratch, t, &mut msg, slot0).unwrap();

        let blob = copy_to_blob(&msg, root).unwrap();
        let standalone = Message::from_segments(vec![blob]).unwrap();
        let root2 = standalone.root().unwrap();
        let nums2 = standalone.read_struct_ptr(root2, 0).unwrap();
        assert_eq!(standalone.read_list_prim(nums2, 2).unwrap(), 102);
        let texts2 = standalone.read_struct_ptr(root2, 1).unwrap();
        assert_eq!(
            standalone.read_text(standalone.read_list_ptr(texts2, 0).unwrap()).unwrap(),
            "one"
        );
        assert!(standalone.read_list_ptr(texts2, 1).unwrap().is_null());
    }

    #[test]
    fn composite_list_survives_the_copy() {
        let mut msg = Message::new();
        let root = msg.init_root(StructSize::new(0, 1)).unwrap();
        let layout = ListLayout::Composite { count: 2, elem_size: StructSize::new(1, 1) };
        let list = msg.alloc_list(root, 0, layout).unwrap();
        let crate::refs::ListView::Structs(elems) = msg.read_list(list).unwrap() else {
            panic!("expected structs");
        };
        for (i, e) in elems.iter().enumerate() {
            msg.write_struct_data(*e, 0, 64, i as u64).unwrap();
            msg.write_text(*e, 0, &format!("elem{i}")).unwrap();
        }

        let blob = copy_to_blob(&msg, root).unwrap();
        let standalone = Message::from_segments(vec![blob]).unwrap();
        let list2 = standalone
            .read_struct_ptr(standalone.root().unwrap(), 0)
            .unwrap();
        let crate::refs::ListView::Structs(elems2) = standalone.read_list(list2).unwrap() else {
            panic!("expected structs");
        };
        assert_eq!(elems2.len(), 2);
        for (i, e) in elems2.iter().enumerate() {
            assert_eq!(standalone.read_struct_data(*e, 0, 64, 0).unwrap(), i as u64);
            let t = standalone.read_struct_ptr(*e, 0).unwrap();
            assert_eq!(standalone.read_text(t).unwrap(), format!("elem{i}"));
        }
    }

    #[test]
    fn far_targets_are_inlined_by_the_copy() {
        // Build a two-segment message by hand: root far-points into segment 1.
        let far = RawPointer::Far { offset: 0, segment: 1, double: false };
        let pad = RawPointer::Struct { offset: 0, size: StructSize::new(1, 0) };
        let seg0 = far.encode().to_le_bytes().to_vec();
        let mut seg1 = pad.encode().to_le_bytes().to_vec();
        seg1.extend_from_slice(&55u64.to_le_bytes());
        let msg = Message::from_segments(vec![seg0, seg1]).unwrap();

        let blob = copy_to_blob(&msg, msg.root().unwrap()).unwrap();
        let standalone = Message::from_segments(vec![blob]).unwrap();
        let root = standalone.root().unwrap();
        assert_eq!(root.segment, 0);
        assert_eq!(standalone.read_struct_data(root, 0, 64, 0).unwrap(), 55);
    }

    #[test]
    fn capability_pointers_copy_verbatim() {
        let mut msg = Message::new();
        let root = msg.init_root(StructSize::new(0, 1)).unwrap();
        msg.write_cap_ptr(root, 0, 3).unwrap();

        let blob = copy_to_blob(&msg, root).unwrap();
        let standalone = Message::from_segments(vec![blob]).unwrap();
        let cap = standalone
            .read_struct_ptr(standalone.root().unwrap(), 0)
            .unwrap();
        assert_eq!(cap.kind, RefKind::Interface { cap: 3 });
    }
}
