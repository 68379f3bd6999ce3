//! Relay between client streams and agent streams.

pub mod agent;
pub mod client;
pub mod peer;
pub mod registry;

pub use peer::PeerHandle;
pub use registry::SessionRegistry;
