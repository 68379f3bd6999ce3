//! Stream transports. Only WebSocket (optionally over TLS) is wired in.

pub mod websocket;
