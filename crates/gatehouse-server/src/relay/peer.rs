//! Outbound half of a live stream.
//!
//! A [`PeerHandle`] is the cloneable, non-owning reference the registry keeps
//! for a connected client or agent: an ordered packet queue drained by the
//! stream's writer task, plus the stream's shutdown signal.

use gatehouse_core::{GateError, GateResult, Packet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone)]
pub struct PeerHandle {
    /// Process-unique stream id, used to tell a superseded binding apart.
    id: u64,
    tx: mpsc::Sender<Packet>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl PeerHandle {
    /// Create a handle and the receiver its writer task drains.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Packet>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (shutdown, _) = watch::channel(false);
        let handle = Self {
            id: NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed),
            tx,
            shutdown: Arc::new(shutdown),
        };
        (handle, rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Queue a packet for the peer. Packets are delivered in send order.
    pub async fn send(&self, packet: Packet) -> GateResult<()> {
        self.tx
            .send(packet)
            .await
            .map_err(|_| GateError::Transport(format!("stream {} is closed", self.id)))
    }

    /// Queue a packet without waiting for room. A full queue means the peer
    /// is not draining its stream.
    pub fn try_send(&self, packet: Packet) -> Result<(), TrySendError<Packet>> {
        self.tx.try_send(packet)
    }

    /// Fire the stream's shutdown signal. The read loop bound to this stream
    /// returns at its next iteration.
    pub fn close(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow() || self.tx.is_closed()
    }

    /// Subscribe to the shutdown signal.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }
}
