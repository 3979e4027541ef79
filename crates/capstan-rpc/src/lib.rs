//! capstan-rpc: the capability RPC session engine.
//!
//! One [`Vat`] per connection. The vat owns the four session tables
//! (questions, answers, imports, exports), translates capability handles
//! to and from wire descriptors, and drives promise pipelining and the
//! finish/release lifecycle. Wire messages ride the `capstan-core` engine;
//! bytes move over any [`capstan_core::Transport`].
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use capstan_rpc::{Vat, VatOptions, Request};
//!
//! let vat = Vat::spawn(transport, VatOptions::default());
//! let mut question = vat.import_capability("calculator").await?;
//! let calculator = question.wait(None).await?.capability()?;
//!
//! let request = Request::new(CALCULATOR_ID, METHOD_ADD, PARAMS_SIZE)?;
//! let mut answer = vat.send(calculator, request).await?;
//! let results = answer.wait(None).await?;
//! ```

pub mod capability;
pub mod error;
pub mod payload;
pub mod tables;
pub mod vat;
pub mod wire;

pub use capability::{Capability, PromiseVariant, TransformOp};
pub use error::RpcError;
pub use payload::{CapabilityServer, Payload, PayloadBuilder, Request, Restorer};
pub use tables::{AnswerId, ExportId, ImportId, QuestionId};
pub use vat::{PendingQuestion, Vat, VatOptions, VatStats};
