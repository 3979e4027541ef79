//! Payloads: user content plus its capability table.
//!
//! A payload pairs a content root inside a message with the ordered table
//! of capabilities its interface fields index into. Inbound payloads share
//! the received message; outbound payloads are built locally and deep-copied
//! into the session message at send time.

use std::sync::Arc;

use capstan_core::{Message, Ref, RefKind, StructSize};
use futures::future::BoxFuture;

use crate::capability::Capability;
use crate::error::RpcError;

/// Content root plus capability table. Cheap to clone: the message is
/// shared, the refs are plain values.
#[derive(Debug, Clone)]
pub struct Payload {
    pub message: Arc<Message>,
    pub root: Ref,
    pub caps: Vec<Capability>,
}

impl Payload {
    /// An empty payload (null content, no capabilities).
    pub fn empty() -> Payload {
        Payload {
            message: Arc::new(Message::new()),
            root: Ref::NULL,
            caps: Vec::new(),
        }
    }

    /// A payload whose content root is a bare capability (the shape of a
    /// restore answer). No backing storage is needed: the root ref is
    /// synthetic and only its kind is ever read.
    pub fn of_capability(cap: Capability) -> Payload {
        Payload {
            message: Arc::new(Message::new()),
            root: Ref {
                segment: 0,
                pos: -1,
                offset: 0,
                kind: RefKind::Interface { cap: 0 },
            },
            caps: vec![cap],
        }
    }

    /// The capability a bare-capability payload carries (a restore answer).
    pub fn capability(&self) -> Result<Capability, RpcError> {
        match self.root.kind {
            RefKind::Interface { cap } => self
                .caps
                .get(cap as usize)
                .cloned()
                .ok_or(RpcError::Protocol("cap index out of table range")),
            _ => Err(RpcError::Protocol("payload root is not a capability")),
        }
    }

    /// Resolve the capability stored at pointer field `idx` of the content
    /// root.
    pub fn cap_at(&self, idx: u16) -> Result<Capability, RpcError> {
        let r = self.message.read_struct_ptr(self.root, idx)?;
        match r.kind {
            RefKind::Interface { cap } => self
                .caps
                .get(cap as usize)
                .cloned()
                .ok_or(RpcError::Protocol("cap index out of table range")),
            _ => Err(RpcError::Protocol("field does not hold a capability")),
        }
    }
}

/// Builder for an outbound payload (call results, or params via
/// [`Request`]).
#[derive(Debug)]
pub struct PayloadBuilder {
    pub message: Message,
    pub root: Ref,
    caps: Vec<Capability>,
}

impl PayloadBuilder {
    /// Start a payload whose content root is a struct of the given size.
    pub fn new(size: StructSize) -> Result<PayloadBuilder, RpcError> {
        let mut message = Message::new();
        let root = message.init_root(size)?;
        Ok(PayloadBuilder {
            message,
            root,
            caps: Vec::new(),
        })
    }

    /// Attach a capability to the payload's table and point pointer field
    /// `idx` at it. Returns the cap-table index.
    pub fn set_cap(&mut self, idx: u16, cap: Capability) -> Result<u32, RpcError> {
        let index = self.caps.len() as u32;
        self.message.write_cap_ptr(self.root, idx, index)?;
        self.caps.push(cap);
        Ok(index)
    }

    pub fn finish(self) -> Payload {
        Payload {
            message: Arc::new(self.message),
            root: self.root,
            caps: self.caps,
        }
    }
}

/// An outbound call being assembled: params payload plus method identity.
#[derive(Debug)]
pub struct Request {
    pub params: PayloadBuilder,
    pub interface_id: u64,
    pub method_id: u16,
}

impl Request {
    pub fn new(
        interface_id: u64,
        method_id: u16,
        params_size: StructSize,
    ) -> Result<Request, RpcError> {
        Ok(Request {
            params: PayloadBuilder::new(params_size)?,
            interface_id,
            method_id,
        })
    }

    /// Build from a method descriptor produced by the schema adapter.
    pub fn for_method(method: &capstan_core::MethodDescriptor) -> Result<Request, RpcError> {
        Request::new(method.interface_id, method.method_id, method.params)
    }
}

/// A local object the vat can dispatch calls to.
///
/// Implementations decode `params`, do the work, and build a results
/// payload; the vat serializes it into the return.
pub trait CapabilityServer: Send + Sync {
    fn call(
        &self,
        interface_id: u64,
        method_id: u16,
        params: Payload,
    ) -> BoxFuture<'static, Result<Payload, RpcError>>;
}

/// Resolves `restore` object ids to capabilities. The only persistence
/// hook this level carries.
pub trait Restorer: Send + Sync {
    fn restore(&self, object_id: &str) -> Result<Arc<dyn CapabilityServer>, RpcError>;
}
