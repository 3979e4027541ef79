//! The RPC message schema, hand-laid over the wire-format engine.
//!
//! Every session message is a `Message` struct with a union tag in its data
//! word and the variant body behind pointer 0. Layout constants below are
//! the protocol; both ends of a session speak them bit-for-bit.

use capstan_core::{copy, ListLayout, ListView, Message, Ref, RefKind, StructSize};

use crate::capability::TransformOp;
use crate::error::RpcError;

/// Union tags of the top-level `Message` struct.
pub mod tag {
    pub const UNIMPLEMENTED: u16 = 0;
    pub const ABORT: u16 = 1;
    pub const CALL: u16 = 2;
    pub const RETURN: u16 = 3;
    pub const FINISH: u16 = 4;
    pub const RESOLVE: u16 = 5;
    pub const RELEASE: u16 = 6;
    pub const RESTORE: u16 = 7;
}

// Struct layouts. Data windows are (bit_align, bit_len) pairs in the
// comments alongside each decoder.
const MESSAGE: StructSize = StructSize::new(1, 1);
const CALL: StructSize = StructSize::new(2, 2);
const TARGET: StructSize = StructSize::new(1, 1);
const PROMISED_ANSWER: StructSize = StructSize::new(1, 1);
const OP: StructSize = StructSize::new(1, 0);
const PAYLOAD: StructSize = StructSize::new(0, 2);
const CAP_DESCRIPTOR: StructSize = StructSize::new(1, 1);
const RETURN: StructSize = StructSize::new(1, 1);
const FINISH: StructSize = StructSize::new(1, 0);
const RELEASE: StructSize = StructSize::new(1, 0);
const RESTORE: StructSize = StructSize::new(1, 1);
const EXCEPTION: StructSize = StructSize::new(1, 1);

/// Cap-descriptor union tags.
mod cap_tag {
    pub const NONE: u16 = 0;
    pub const SENDER_HOSTED: u16 = 1;
    pub const SENDER_PROMISE: u16 = 2;
    pub const RECEIVER_HOSTED: u16 = 3;
    pub const RECEIVER_ANSWER: u16 = 4;
    pub const THIRD_PARTY_HOSTED: u16 = 5;
}

/// A capability as it appears in a payload's cap table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapDescriptor {
    None,
    SenderHosted(u32),
    SenderPromise(u32),
    ReceiverHosted(u32),
    ReceiverAnswer { question_id: u32, transform: Vec<TransformOp> },
    ThirdPartyHosted,
}

/// A call's target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetMsg {
    ImportedCap(u32),
    PromisedAnswer { question_id: u32, transform: Vec<TransformOp> },
}

#[derive(Debug)]
pub struct CallMsg {
    pub question_id: u32,
    pub interface_id: u64,
    pub method_id: u16,
    pub target: TargetMsg,
    /// Root of the params content inside the received message.
    pub content: Ref,
    pub cap_table: Vec<CapDescriptor>,
}

#[derive(Debug)]
pub enum ReturnBody {
    Results { content: Ref, cap_table: Vec<CapDescriptor> },
    Exception { reason: String },
}

#[derive(Debug)]
pub struct ReturnMsg {
    pub answer_id: u32,
    pub release_param_caps: bool,
    pub body: ReturnBody,
}

/// One decoded session message.
#[derive(Debug)]
pub enum WireMessage {
    /// The peer could not handle one of our messages; carries the question
    /// id of the echoed call/restore when one is present.
    Unimplemented { question_id: Option<u32> },
    Abort { reason: String },
    Call(CallMsg),
    Return(ReturnMsg),
    Finish { question_id: u32, release_result_caps: bool },
    Release { id: u32, count: u32 },
    Restore { question_id: u32, object_id: String },
    /// A tag this level does not handle (`resolve` included); the session
    /// echoes the original back as `unimplemented`.
    Unsupported { tag: u16 },
}

/// What goes into a payload's content slot.
pub enum PayloadContent<'a> {
    None,
    /// Deep-copy an object out of another message.
    Copy(&'a Message, Ref),
    /// The content root is a bare capability pointer.
    Capability(u32),
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

fn new_message(msg_tag: u16) -> Result<(Message, Ref), RpcError> {
    let mut msg = Message::new();
    let root = msg.init_root(MESSAGE)?;
    msg.write_struct_data(root, 0, 16, msg_tag as u64)?;
    Ok((msg, root))
}

fn write_transform(
    msg: &mut Message,
    parent: Ref,
    idx: u16,
    ops: &[TransformOp],
) -> Result<(), RpcError> {
    if ops.is_empty() {
        return Ok(());
    }
    let layout = ListLayout::Composite { count: ops.len() as u32, elem_size: OP };
    let list = msg.alloc_list(parent, idx, layout)?;
    let ListView::Structs(elems) = msg.read_list(list)? else {
        return Err(RpcError::Protocol("transform list must be composite"));
    };
    for (op, elem) in ops.iter().zip(elems) {
        match op {
            TransformOp::Noop => msg.write_struct_data(elem, 0, 16, 0)?,
            TransformOp::GetPointerField(n) => {
                msg.write_struct_data(elem, 0, 16, 1)?;
                msg.write_struct_data(elem, 16, 16, *n as u64)?;
            }
        }
    }
    Ok(())
}

fn write_target(
    msg: &mut Message,
    parent: Ref,
    idx: u16,
    target: &TargetMsg,
) -> Result<(), RpcError> {
    let t = msg.init_struct(parent, idx, TARGET)?;
    match target {
        TargetMsg::ImportedCap(id) => {
            msg.write_struct_data(t, 0, 32, *id as u64)?;
            msg.write_struct_data(t, 32, 16, 0)?;
        }
        TargetMsg::PromisedAnswer { question_id, transform } => {
            msg.write_struct_data(t, 32, 16, 1)?;
            let pa = msg.init_struct(t, 0, PROMISED_ANSWER)?;
            msg.write_struct_data(pa, 0, 32, *question_id as u64)?;
            write_transform(msg, pa, 0, transform)?;
        }
    }
    Ok(())
}

fn write_payload(
    msg: &mut Message,
    parent: Ref,
    idx: u16,
    content: PayloadContent<'_>,
    cap_table: &[CapDescriptor],
) -> Result<(), RpcError> {
    let p = msg.init_struct(parent, idx, PAYLOAD)?;
    match content {
        PayloadContent::None => {}
        PayloadContent::Copy(src, r) => {
            let slot = msg.ptr(p, 0)?;
            copy::deep_copy(src, r, msg, slot)?;
        }
        PayloadContent::Capability(index) => {
            msg.write_cap_ptr(p, 0, index)?;
        }
    }
    if cap_table.is_empty() {
        return Ok(());
    }
    let layout = ListLayout::Composite {
        count: cap_table.len() as u32,
        elem_size: CAP_DESCRIPTOR,
    };
    let list = msg.alloc_list(p, 1, layout)?;
    let ListView::Structs(elems) = msg.read_list(list)? else {
        return Err(RpcError::Protocol("cap table must be composite"));
    };
    for (d, elem) in cap_table.iter().zip(elems) {
        match d {
            CapDescriptor::None => {
                msg.write_struct_data(elem, 0, 16, cap_tag::NONE as u64)?;
            }
            CapDescriptor::SenderHosted(id) => {
                msg.write_struct_data(elem, 0, 16, cap_tag::SENDER_HOSTED as u64)?;
                msg.write_struct_data(elem, 32, 32, *id as u64)?;
            }
            CapDescriptor::SenderPromise(id) => {
                msg.write_struct_data(elem, 0, 16, cap_tag::SENDER_PROMISE as u64)?;
                msg.write_struct_data(elem, 32, 32, *id as u64)?;
            }
            CapDescriptor::ReceiverHosted(id) => {
                msg.write_struct_data(elem, 0, 16, cap_tag::RECEIVER_HOSTED as u64)?;
                msg.write_struct_data(elem, 32, 32, *id as u64)?;
            }
            CapDescriptor::ReceiverAnswer { question_id, transform } => {
                msg.write_struct_data(elem, 0, 16, cap_tag::RECEIVER_ANSWER as u64)?;
                let pa = msg.init_struct(elem, 0, PROMISED_ANSWER)?;
                msg.write_struct_data(pa, 0, 32, *question_id as u64)?;
                write_transform(msg, pa, 0, transform)?;
            }
            CapDescriptor::ThirdPartyHosted => {
                msg.write_struct_data(elem, 0, 16, cap_tag::THIRD_PARTY_HOSTED as u64)?;
            }
        }
    }
    Ok(())
}

pub fn encode_call(
    question_id: u32,
    interface_id: u64,
    method_id: u16,
    target: &TargetMsg,
    params: PayloadContent<'_>,
    cap_table: &[CapDescriptor],
) -> Result<Message, RpcError> {
    let (mut msg, root) = new_message(tag::CALL)?;
    let call = msg.init_struct(root, 0, CALL)?;
    msg.write_struct_data(call, 0, 32, question_id as u64)?;
    msg.write_struct_data(call, 32, 16, method_id as u64)?;
    msg.write_struct_data(call, 64, 64, interface_id)?;
    write_target(&mut msg, call, 0, target)?;
    write_payload(&mut msg, call, 1, params, cap_table)?;
    Ok(msg)
}

pub fn encode_return_results(
    answer_id: u32,
    release_param_caps: bool,
    content: PayloadContent<'_>,
    cap_table: &[CapDescriptor],
) -> Result<Message, RpcError> {
    let (mut msg, root) = new_message(tag::RETURN)?;
    let ret = msg.init_struct(root, 0, RETURN)?;
    msg.write_struct_data(ret, 0, 32, answer_id as u64)?;
    msg.write_struct_data(ret, 32, 1, release_param_caps as u64)?;
    msg.write_struct_data(ret, 48, 16, 0)?;
    write_payload(&mut msg, ret, 0, content, cap_table)?;
    Ok(msg)
}

pub fn encode_return_exception(answer_id: u32, reason: &str) -> Result<Message, RpcError> {
    let (mut msg, root) = new_message(tag::RETURN)?;
    let ret = msg.init_struct(root, 0, RETURN)?;
    msg.write_struct_data(ret, 0, 32, answer_id as u64)?;
    msg.write_struct_data(ret, 48, 16, 1)?;
    let exc = msg.init_struct(ret, 0, EXCEPTION)?;
    msg.write_text(exc, 0, reason)?;
    Ok(msg)
}

pub fn encode_finish(question_id: u32, release_result_caps: bool) -> Result<Message, RpcError> {
    let (mut msg, root) = new_message(tag::FINISH)?;
    let fin = msg.init_struct(root, 0, FINISH)?;
    msg.write_struct_data(fin, 0, 32, question_id as u64)?;
    msg.write_struct_data(fin, 32, 1, release_result_caps as u64)?;
    Ok(msg)
}

pub fn encode_release(id: u32, count: u32) -> Result<Message, RpcError> {
    let (mut msg, root) = new_message(tag::RELEASE)?;
    let rel = msg.init_struct(root, 0, RELEASE)?;
    msg.write_struct_data(rel, 0, 32, id as u64)?;
    msg.write_struct_data(rel, 32, 32, count as u64)?;
    Ok(msg)
}

pub fn encode_restore(question_id: u32, object_id: &str) -> Result<Message, RpcError> {
    let (mut msg, root) = new_message(tag::RESTORE)?;
    let res = msg.init_struct(root, 0, RESTORE)?;
    msg.write_struct_data(res, 0, 32, question_id as u64)?;
    msg.write_text(res, 0, object_id)?;
    Ok(msg)
}

/// Echo a message we could not handle.
pub fn encode_unimplemented(original: &Message) -> Result<Message, RpcError> {
    let (mut msg, root) = new_message(tag::UNIMPLEMENTED)?;
    let slot = msg.ptr(root, 0)?;
    copy::deep_copy(original, original.root()?, &mut msg, slot)?;
    Ok(msg)
}

pub fn encode_abort(reason: &str) -> Result<Message, RpcError> {
    let (mut msg, root) = new_message(tag::ABORT)?;
    let exc = msg.init_struct(root, 0, EXCEPTION)?;
    msg.write_text(exc, 0, reason)?;
    Ok(msg)
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

fn read_transform(msg: &Message, pa: Ref) -> Result<Vec<TransformOp>, RpcError> {
    let list = msg.read_struct_ptr(pa, 0)?;
    if list.is_null() {
        return Ok(Vec::new());
    }
    let ListView::Structs(elems) = msg.read_list(list)? else {
        return Err(RpcError::Protocol("transform list must be composite"));
    };
    let mut ops = Vec::with_capacity(elems.len());
    for elem in elems {
        let op_tag = msg.read_struct_data(elem, 0, 16, 0)?;
        ops.push(match op_tag {
            0 => TransformOp::Noop,
            1 => TransformOp::GetPointerField(msg.read_struct_data(elem, 16, 16, 0)? as u16),
            _ => return Err(RpcError::Protocol("unknown transform op")),
        });
    }
    Ok(ops)
}

fn read_promised_answer(msg: &Message, pa: Ref) -> Result<(u32, Vec<TransformOp>), RpcError> {
    let question_id = msg.read_struct_data(pa, 0, 32, 0)? as u32;
    Ok((question_id, read_transform(msg, pa)?))
}

fn read_target(msg: &Message, t: Ref) -> Result<TargetMsg, RpcError> {
    match msg.read_struct_data(t, 32, 16, 0)? {
        0 => Ok(TargetMsg::ImportedCap(msg.read_struct_data(t, 0, 32, 0)? as u32)),
        1 => {
            let pa = msg.read_struct_ptr(t, 0)?;
            let (question_id, transform) = read_promised_answer(msg, pa)?;
            Ok(TargetMsg::PromisedAnswer { question_id, transform })
        }
        _ => Err(RpcError::Protocol("unknown call target")),
    }
}

fn read_cap_table(msg: &Message, payload: Ref) -> Result<Vec<CapDescriptor>, RpcError> {
    let list = msg.read_struct_ptr(payload, 1)?;
    if list.is_null() {
        return Ok(Vec::new());
    }
    let ListView::Structs(elems) = msg.read_list(list)? else {
        return Err(RpcError::Protocol("cap table must be composite"));
    };
    let mut caps = Vec::with_capacity(elems.len());
    for elem in elems {
        let d_tag = msg.read_struct_data(elem, 0, 16, 0)? as u16;
        let id = msg.read_struct_data(elem, 32, 32, 0)? as u32;
        caps.push(match d_tag {
            cap_tag::NONE => CapDescriptor::None,
            cap_tag::SENDER_HOSTED => CapDescriptor::SenderHosted(id),
            cap_tag::SENDER_PROMISE => CapDescriptor::SenderPromise(id),
            cap_tag::RECEIVER_HOSTED => CapDescriptor::ReceiverHosted(id),
            cap_tag::RECEIVER_ANSWER => {
                let pa = msg.read_struct_ptr(elem, 0)?;
                let (question_id, transform) = read_promised_answer(msg, pa)?;
                CapDescriptor::ReceiverAnswer { question_id, transform }
            }
            cap_tag::THIRD_PARTY_HOSTED => CapDescriptor::ThirdPartyHosted,
            _ => return Err(RpcError::Protocol("unknown cap descriptor")),
        });
    }
    Ok(caps)
}

fn read_exception(msg: &Message, exc: Ref) -> Result<String, RpcError> {
    let reason = msg.read_struct_ptr(exc, 0)?;
    Ok(msg.read_text(reason)?)
}

/// Question id carried by an echoed message, for matching an
/// `unimplemented` reply back to its question.
fn echoed_question_id(msg: &Message, root: Ref) -> Option<u32> {
    let msg_tag = msg.read_struct_data(root, 0, 16, u64::MAX).ok()? as u16;
    let body = msg.read_struct_ptr(root, 0).ok()?;
    match msg_tag {
        tag::CALL | tag::RESTORE | tag::FINISH => {
            Some(msg.read_struct_data(body, 0, 32, 0).ok()? as u32)
        }
        _ => None,
    }
}

/// Decode one received session message.
pub fn decode_message(msg: &Message) -> Result<WireMessage, RpcError> {
    let root = msg.root()?;
    let msg_tag = msg.read_struct_data(root, 0, 16, 0)? as u16;
    let body = msg.read_struct_ptr(root, 0)?;
    match msg_tag {
        tag::UNIMPLEMENTED => Ok(WireMessage::Unimplemented {
            question_id: echoed_question_id(msg, body),
        }),
        tag::ABORT => Ok(WireMessage::Abort {
            reason: read_exception(msg, body)?,
        }),
        tag::CALL => {
            let question_id = msg.read_struct_data(body, 0, 32, 0)? as u32;
            let method_id = msg.read_struct_data(body, 32, 16, 0)? as u16;
            let interface_id = msg.read_struct_data(body, 64, 64, 0)?;
            let target = read_target(msg, msg.read_struct_ptr(body, 0)?)?;
            let payload = msg.read_struct_ptr(body, 1)?;
            let content = msg.read_struct_ptr(payload, 0)?;
            let cap_table = read_cap_table(msg, payload)?;
            Ok(WireMessage::Call(CallMsg {
                question_id,
                interface_id,
                method_id,
                target,
                content,
                cap_table,
            }))
        }
        tag::RETURN => {
            let answer_id = msg.read_struct_data(body, 0, 32, 0)? as u32;
            let release_param_caps = msg.read_struct_data(body, 32, 1, 0)? != 0;
            let body_kind = msg.read_struct_data(body, 48, 16, 0)?;
            let inner = msg.read_struct_ptr(body, 0)?;
            let ret_body = match body_kind {
                0 => ReturnBody::Results {
                    content: msg.read_struct_ptr(inner, 0)?,
                    cap_table: read_cap_table(msg, inner)?,
                },
                1 => ReturnBody::Exception {
                    reason: read_exception(msg, inner)?,
                },
                _ => return Err(RpcError::Protocol("unknown return body")),
            };
            Ok(WireMessage::Return(ReturnMsg {
                answer_id,
                release_param_caps,
                body: ret_body,
            }))
        }
        tag::FINISH => Ok(WireMessage::Finish {
            question_id: msg.read_struct_data(body, 0, 32, 0)? as u32,
            // Absent data defaults to releasing, the protocol default.
            release_result_caps: msg.read_struct_data(body, 32, 1, 1)? != 0,
        }),
        tag::RELEASE => Ok(WireMessage::Release {
            id: msg.read_struct_data(body, 0, 32, 0)? as u32,
            count: msg.read_struct_data(body, 32, 32, 1)? as u32,
        }),
        tag::RESTORE => {
            let question_id = msg.read_struct_data(body, 0, 32, 0)? as u32;
            let object_id = msg.read_text(msg.read_struct_ptr(body, 0)?)?;
            Ok(WireMessage::Restore { question_id, object_id })
        }
        other => Ok(WireMessage::Unsupported { tag: other }),
    }
}

/// True when a content root carries a bare capability pointer; returns its
/// cap-table index.
pub fn content_cap_index(r: Ref) -> Option<u32> {
    match r.kind {
        RefKind::Interface { cap } => Some(cap),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_round_trips() {
        let mut params = Message::new();
        let proot = params.init_root(StructSize::new(1, 1)).unwrap();
        params.write_struct_data(proot, 0, 32, 77).unwrap();
        params.write_cap_ptr(proot, 0, 0).unwrap();

        let target = TargetMsg::PromisedAnswer {
            question_id: 9,
            transform: vec![TransformOp::GetPointerField(1)],
        };
        let cap_table = vec![
            CapDescriptor::SenderHosted(3),
            CapDescriptor::ReceiverAnswer {
                question_id: 9,
                transform: vec![TransformOp::Noop, TransformOp::GetPointerField(0)],
            },
        ];
        let msg = encode_call(
            5,
            0xdead_beef_cafe,
            2,
            &target,
            PayloadContent::Copy(&params, proot),
            &cap_table,
        )
        .unwrap();

        // Encoded bytes survive framing.
        let bytes = capstan_core::write_message(msg.segments());
        let mut parser = capstan_core::FrameParser::new();
        parser.feed(&bytes);
        let segs = parser.next_message().unwrap().unwrap();
        let msg = Message::from_segments(segs).unwrap();

        let WireMessage::Call(call) = decode_message(&msg).unwrap() else {
            panic!("expected call");
        };
        assert_eq!(call.question_id, 5);
        assert_eq!(call.interface_id, 0xdead_beef_cafe);
        assert_eq!(call.method_id, 2);
        assert_eq!(call.target, target);
        assert_eq!(call.cap_table, cap_table);
        assert_eq!(msg.read_struct_data(call.content, 0, 32, 0).unwrap(), 77);
        let cap = msg.read_struct_ptr(call.content, 0).unwrap();
        assert_eq!(content_cap_index(cap), Some(0));
    }

    #[test]
    fn return_results_round_trips() {
        let mut results = Message::new();
        let rroot = results.init_root(StructSize::new(1, 0)).unwrap();
        results.write_struct_data(rroot, 0, 64, 12345).unwrap();

        let msg = encode_return_results(
            8,
            false,
            PayloadContent::Copy(&results, rroot),
            &[CapDescriptor::SenderHosted(1)],
        )
        .unwrap();
        let WireMessage::Return(ret) = decode_message(&msg).unwrap() else {
            panic!("expected return");
        };
        assert_eq!(ret.answer_id, 8);
        assert!(!ret.release_param_caps);
        let ReturnBody::Results { content, cap_table } = ret.body else {
            panic!("expected results");
        };
        assert_eq!(msg.read_struct_data(content, 0, 64, 0).unwrap(), 12345);
        assert_eq!(cap_table, vec![CapDescriptor::SenderHosted(1)]);
    }

    #[test]
    fn return_exception_round_trips() {
        let msg = encode_return_exception(3, "no such method").unwrap();
        let WireMessage::Return(ret) = decode_message(&msg).unwrap() else {
            panic!("expected return");
        };
        let ReturnBody::Exception { reason } = ret.body else {
            panic!("expected exception");
        };
        assert_eq!(reason, "no such method");
    }

    #[test]
    fn finish_release_restore_round_trip() {
        let msg = encode_finish(11, true).unwrap();
        assert!(matches!(
            decode_message(&msg).unwrap(),
            WireMessage::Finish { question_id: 11, release_result_caps: true }
        ));

        let msg = encode_finish(12, false).unwrap();
        assert!(matches!(
            decode_message(&msg).unwrap(),
            WireMessage::Finish { question_id: 12, release_result_caps: false }
        ));

        let msg = encode_release(4, 2).unwrap();
        assert!(matches!(
            decode_message(&msg).unwrap(),
            WireMessage::Release { id: 4, count: 2 }
        ));

        let msg = encode_restore(1, "calculator").unwrap();
        let WireMessage::Restore { question_id, object_id } = decode_message(&msg).unwrap()
        else {
            panic!("expected restore");
        };
        assert_eq!((question_id, object_id.as_str()), (1, "calculator"));
    }

    #[test]
    fn restore_return_carries_a_bare_capability() {
        let msg = encode_return_results(
            0,
            false,
            PayloadContent::Capability(0),
            &[CapDescriptor::SenderHosted(7)],
        )
        .unwrap();
        let WireMessage::Return(ret) = decode_message(&msg).unwrap() else {
            panic!("expected return");
        };
        let ReturnBody::Results { content, cap_table } = ret.body else {
            panic!("expected results");
        };
        assert_eq!(content_cap_index(content), Some(0));
        assert_eq!(cap_table, vec![CapDescriptor::SenderHosted(7)]);
    }

    #[test]
    fn unimplemented_echo_names_the_question() {
        let call = encode_call(
            42,
            1,
            0,
            &TargetMsg::ImportedCap(0),
            PayloadContent::None,
            &[],
        )
        .unwrap();
        let echo = encode_unimplemented(&call).unwrap();
        let WireMessage::Unimplemented { question_id } = decode_message(&echo).unwrap() else {
            panic!("expected unimplemented");
        };
        assert_eq!(question_id, Some(42));
    }

    #[test]
    fn unsupported_tags_surface_as_unsupported() {
        let (msg, _) = new_message(tag::RESOLVE).unwrap();
        assert!(matches!(
            decode_message(&msg).unwrap(),
            WireMessage::Unsupported { tag: tag::RESOLVE }
        ));
    }

    #[test]
    fn abort_round_trips() {
        let msg = encode_abort("protocol violation").unwrap();
        let WireMessage::Abort { reason } = decode_message(&msg).unwrap() else {
            panic!("expected abort");
        };
        assert_eq!(reason, "protocol violation");
    }
}
