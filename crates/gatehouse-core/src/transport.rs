//! Abstract packet source for gatehouse streams.
//!
//! The relay reads through this trait so the same dispatch loops run over
//! WebSocket connections and in-memory channels.

use crate::error::GateResult;
use crate::packet::Packet;
use std::future::Future;
use std::pin::Pin;

/// Boxed `Send` future, used where traits must stay object safe.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The read half of a duplex packet stream.
pub trait PacketSource: Send {
    /// Read the next packet.
    ///
    /// `Ok(None)` is end-of-stream. `Err(GateError::Canceled)` means the peer
    /// went away on purpose; any other error is a transport failure.
    fn recv(&mut self) -> BoxFuture<'_, GateResult<Option<Packet>>>;
}
