//! gatehouse-core: Shared protocol library for the gatehouse access gateway.
//!
//! Provides the packet envelope exchanged on every stream, reserved spec keys,
//! the CBOR codec for side-channel values, the gateway error taxonomy, the
//! abstract packet source trait, and HMAC bearer tokens.

pub mod codec;
pub mod error;
pub mod packet;
pub mod token;
pub mod transport;

// Re-export commonly used items at crate root.
pub use codec::{cbor_decode, cbor_encode};
pub use error::{GateError, GateResult, StatusCode};
pub use packet::{AgentConnectionParams, Packet, PacketType};
pub use token::{create_token, generate_secret, verify_token};
pub use transport::{BoxFuture, PacketSource};
