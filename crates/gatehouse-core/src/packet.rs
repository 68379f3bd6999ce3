//! The packet envelope exchanged on every client and agent stream.
//!
//! A packet is a type tag, a `spec` side-channel of control metadata keyed by
//! string, and an opaque payload the relay never interprets.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Session id injected by the gateway into every routed packet.
pub const SPEC_GATEWAY_SESSION_ID: &str = "gateway.session_id";
/// Backend category of the resolved connection.
pub const SPEC_CONNECTION_TYPE: &str = "gateway.connection_type";
/// CBOR-encoded `Vec<String>` of arguments supplied by the client.
pub const SPEC_CLIENT_EXEC_ARGS: &str = "client.exec_args";
/// CBOR-encoded [`AgentConnectionParams`].
pub const SPEC_AGENT_CONNECTION_PARAMS: &str = "agent.connection_params";

/// Packet type tag. Serialized as its string name so that application types
/// the gateway does not know about pass through unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum PacketType {
    KeepAlive,
    GatewayConnect,
    AgentConnect,
    ExecArgs,
    Data,
    CloseSession,
    Other(String),
}

impl PacketType {
    pub fn as_str(&self) -> &str {
        match self {
            PacketType::KeepAlive => "KeepAlive",
            PacketType::GatewayConnect => "GatewayConnect",
            PacketType::AgentConnect => "AgentConnect",
            PacketType::ExecArgs => "ExecArgs",
            PacketType::Data => "Data",
            PacketType::CloseSession => "CloseSession",
            PacketType::Other(tag) => tag,
        }
    }
}

impl From<PacketType> for String {
    fn from(t: PacketType) -> String {
        match t {
            PacketType::Other(tag) => tag,
            known => known.as_str().to_string(),
        }
    }
}

impl From<String> for PacketType {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "KeepAlive" => PacketType::KeepAlive,
            "GatewayConnect" => PacketType::GatewayConnect,
            "AgentConnect" => PacketType::AgentConnect,
            "ExecArgs" => PacketType::ExecArgs,
            "Data" => PacketType::Data,
            "CloseSession" => PacketType::CloseSession,
            _ => PacketType::Other(tag),
        }
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The wire-independent message unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    #[serde(rename = "type")]
    pub packet_type: PacketType,
    #[serde(default, with = "byte_map")]
    pub spec: HashMap<String, Vec<u8>>,
    #[serde(default, with = "byte_buf")]
    pub payload: Vec<u8>,
}

impl Packet {
    /// Create a packet with an empty spec.
    pub fn new(packet_type: PacketType, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            packet_type,
            spec: HashMap::new(),
            payload: payload.into(),
        }
    }

    /// Builder-style spec insertion.
    pub fn with_spec(mut self, key: &str, value: impl Into<Vec<u8>>) -> Self {
        self.set_spec(key, value);
        self
    }

    /// Insert or overwrite a spec entry.
    pub fn set_spec(&mut self, key: &str, value: impl Into<Vec<u8>>) {
        self.spec.insert(key.to_string(), value.into());
    }

    /// Read a spec entry as UTF-8. Returns `None` when absent or not UTF-8.
    pub fn spec_str(&self, key: &str) -> Option<&str> {
        self.spec
            .get(key)
            .and_then(|v| std::str::from_utf8(v).ok())
    }

    /// Session id carried under [`SPEC_GATEWAY_SESSION_ID`], if any.
    pub fn session_id(&self) -> Option<&str> {
        self.spec_str(SPEC_GATEWAY_SESSION_ID)
            .filter(|s| !s.is_empty())
    }

    pub fn is_keep_alive(&self) -> bool {
        self.packet_type == PacketType::KeepAlive
    }
}

/// Parameters the agent needs to start a connection for a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConnectionParams {
    /// Resolved secret / environment map of the connection.
    pub env_vars: HashMap<String, String>,
    /// argv configured on the connection.
    pub cmd_list: Vec<String>,
    /// Extra arguments supplied by the client.
    pub client_args: Vec<String>,
}

// ── Byte-string serde helpers ────────────────────────────────────────

mod byte_buf {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let buf: ByteBuf = Deserialize::deserialize(deserializer)?;
        Ok(buf.0)
    }

    /// Accepts a CBOR byte string, or an integer array from older peers.
    pub struct ByteBuf(pub Vec<u8>);

    impl<'de> Deserialize<'de> for ByteBuf {
        fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
        where
            D: Deserializer<'de>,
        {
            struct ByteBufVisitor;

            impl<'de> serde::de::Visitor<'de> for ByteBufVisitor {
                type Value = ByteBuf;

                fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                    formatter.write_str("bytes")
                }

                fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E> {
                    Ok(ByteBuf(v.to_vec()))
                }

                fn visit_byte_buf<E>(self, v: Vec<u8>) -> Result<Self::Value, E> {
                    Ok(ByteBuf(v))
                }

                fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
                where
                    A: serde::de::SeqAccess<'de>,
                {
                    let mut bytes = Vec::with_capacity(seq.size_hint().unwrap_or(0));
                    while let Some(b) = seq.next_element::<u8>()? {
                        bytes.push(b);
                    }
                    Ok(ByteBuf(bytes))
                }
            }

            deserializer.deserialize_any(ByteBufVisitor)
        }
    }
}

mod byte_map {
    use super::byte_buf::ByteBuf;
    use serde::ser::SerializeMap;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::HashMap;

    struct Bytes<'a>(&'a [u8]);

    impl Serialize for Bytes<'_> {
        fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            serializer.serialize_bytes(self.0)
        }
    }

    pub fn serialize<S>(map: &HashMap<String, Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut out = serializer.serialize_map(Some(map.len()))?;
        for (key, value) in map {
            out.serialize_entry(key, &Bytes(value))?;
        }
        out.end()
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<HashMap<String, Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: HashMap<String, ByteBuf> = Deserialize::deserialize(deserializer)?;
        Ok(raw.into_iter().map(|(k, v)| (k, v.0)).collect())
    }
}
