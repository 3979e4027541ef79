//! The transport seam.
//!
//! A transport moves opaque byte chunks between two peers; the session owns
//! framing, so chunks need not align with message boundaries. Concrete
//! transports (sockets, TLS) are external collaborators; the in-memory
//! transport crate exists for tests.

use std::future::Future;

/// Errors a transport can surface. Any error is terminal for the session
/// that owns the transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The peer closed, or the transport was closed locally.
    #[error("transport closed")]
    Closed,

    /// An underlying I/O failure.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A bidirectional byte-chunk transport.
///
/// `send` must be non-blocking or bounded; a send that cannot complete is an
/// error, not an indefinite stall.
pub trait Transport: Send + Sync {
    /// Transmit one chunk.
    fn send(&self, bytes: Vec<u8>) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Receive the next chunk. Resolves to [`TransportError::Closed`] once
    /// the peer is gone.
    fn recv(&self) -> impl Future<Output = Result<Vec<u8>, TransportError>> + Send;

    /// Close both directions.
    fn close(&self) -> impl Future<Output = Result<(), TransportError>> + Send;
}
