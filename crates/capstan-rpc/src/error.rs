//! RPC error types.

/// Errors surfaced by the vat to callers and method implementations.
///
/// The vat survives single-message errors; only transport failure and an
/// explicit stop are terminal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RpcError {
    /// A wire-format error from the reference engine.
    #[error(transparent)]
    Wire(#[from] capstan_core::Error),

    /// A call targeted an export id this vat never handed out.
    #[error("unknown capability id {id}")]
    UnknownCapability { id: u32 },

    /// The target of a pipelined call failed to resolve.
    #[error("pipelined call target failed to resolve: {reason}")]
    PromiseBroken { reason: String },

    /// The transport died; every outstanding question fails with this.
    #[error("transport failed: {0}")]
    TransportFailed(String),

    /// The peer answered with `unimplemented`, or sent a descriptor this
    /// level does not support.
    #[error("not implemented by the peer")]
    Unimplemented,

    /// The peer returned an exception.
    #[error("remote exception: {reason}")]
    Remote { reason: String },

    /// The session was stopped before the operation completed.
    #[error("session stopped")]
    Stopped,

    /// `wait` gave up; the question itself is still outstanding.
    #[error("timed out waiting for an answer")]
    WaitTimeout,

    /// The peer violated the protocol.
    #[error("protocol violation: {0}")]
    Protocol(&'static str),
}
