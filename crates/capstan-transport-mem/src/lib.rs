//! capstan-transport-mem: in-process transport for testing.
//!
//! Two bounded byte channels joined back to back. Chunks arrive exactly as
//! sent, which deliberately exercises the session's streaming frame parser
//! with arbitrary chunk boundaries.

use capstan_core::{Transport, TransportError};
use parking_lot::Mutex as SyncMutex;
use tokio::sync::{mpsc, Mutex as AsyncMutex};

/// Depth of each direction's channel, in chunks.
const CHANNEL_DEPTH: usize = 64;

/// One end of an in-memory transport pair.
pub struct MemTransport {
    /// Dropped on close so the peer's pending `recv` observes the hangup.
    tx: SyncMutex<Option<mpsc::Sender<Vec<u8>>>>,
    rx: AsyncMutex<mpsc::Receiver<Vec<u8>>>,
}

impl MemTransport {
    /// Create a connected pair: bytes sent on one end arrive on the other.
    pub fn pair() -> (MemTransport, MemTransport) {
        let (a_tx, a_rx) = mpsc::channel(CHANNEL_DEPTH);
        let (b_tx, b_rx) = mpsc::channel(CHANNEL_DEPTH);
        (
            MemTransport {
                tx: SyncMutex::new(Some(a_tx)),
                rx: AsyncMutex::new(b_rx),
            },
            MemTransport {
                tx: SyncMutex::new(Some(b_tx)),
                rx: AsyncMutex::new(a_rx),
            },
        )
    }

    pub fn is_closed(&self) -> bool {
        self.tx.lock().is_none()
    }
}

impl Transport for MemTransport {
    async fn send(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        let tx = self.tx.lock().clone().ok_or(TransportError::Closed)?;
        tx.send(bytes).await.map_err(|_| TransportError::Closed)
    }

    async fn recv(&self) -> Result<Vec<u8>, TransportError> {
        let mut rx = self.rx.lock().await;
        rx.recv().await.ok_or(TransportError::Closed)
    }

    async fn close(&self) -> Result<(), TransportError> {
        // Dropping the sender hangs up our outbound direction; the peer's
        // recv drains buffered chunks and then reports Closed.
        self.tx.lock().take();
        self.rx.lock().await.close();
        Ok(())
    }
}
