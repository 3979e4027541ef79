//! capstan: a segmented wire-format engine with a capability RPC vat.
//!
//! # Quick start
//!
//! Build and read messages with the core engine:
//!
//! ```
//! use capstan::{Message, StructSize};
//!
//! let mut msg = Message::new();
//! let root = msg.init_root(StructSize::new(1, 1)).unwrap();
//! msg.write_struct_data(root, 0, 32, 7).unwrap();
//! msg.write_text(root, 0, "payload").unwrap();
//! let bytes = capstan::write_message(msg.segments());
//! # assert!(!bytes.is_empty());
//! ```
//!
//! Run an RPC session over any transport:
//!
//! ```ignore
//! use capstan::prelude::*;
//!
//! let (client_side, server_side) = capstan::MemTransport::pair();
//! let client = Vat::spawn(client_side, VatOptions::default());
//! let server = Vat::spawn(server_side, VatOptions {
//!     restorer: Some(my_restorer),
//!     ..VatOptions::default()
//! });
//!
//! let mut question = client.import_capability("calculator").await?;
//! let calculator = question.wait(None).await?.capability()?;
//! let mut answer = client.send(calculator, request).await?;
//! let results = answer.wait(None).await?;
//! ```
//!
//! # Transports
//!
//! The session speaks byte chunks through the [`Transport`] trait; framing
//! is handled inside the vat. The in-memory transport ships behind the
//! `mem` feature (on by default) for tests and in-process wiring.

// Re-export the wire-format engine.
pub use capstan_core::{
    copy_to_blob, deep_copy, write_message, ElementSize, Error, FieldDescriptor, FieldSlot,
    FrameParser, ListLayout, ListView, Message, MethodDescriptor, NodeKind, Object,
    ObjectBuilder, RawPointer, Ref, RefKind, SchemaAdapter, SchemaNode, SegmentArena,
    SegmentId, StaticSchema, StructSize, Transport, TransportError,
};

// Re-export the RPC session engine.
pub use capstan_rpc::{
    Capability, CapabilityServer, Payload, PayloadBuilder, PendingQuestion, PromiseVariant,
    Request, Restorer, RpcError, TransformOp, Vat, VatOptions, VatStats,
};

#[cfg(feature = "mem")]
pub use capstan_transport_mem::MemTransport;

/// Prelude module for convenient imports.
///
/// ```ignore
/// use capstan::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        Capability, CapabilityServer, Message, Payload, PayloadBuilder, Request, Restorer,
        RpcError, StructSize, TransformOp, Transport, Vat, VatOptions,
    };
}
