//! Sessions the gateway has opened on this agent.

use anyhow::{Context, Result};
use gatehouse_core::packet::{SPEC_AGENT_CONNECTION_PARAMS, SPEC_CONNECTION_TYPE};
use gatehouse_core::{cbor_decode, AgentConnectionParams, Packet, PacketType};
use std::collections::HashMap;

/// What a packet did to the session table.
#[derive(Debug, PartialEq, Eq)]
pub enum Event {
    Opened {
        session_id: String,
        connection_type: String,
    },
    Closed {
        session_id: String,
    },
    Data {
        session_id: String,
        bytes: usize,
    },
    /// Packet without a usable session id.
    Ignored,
}

#[derive(Debug)]
pub struct OpenSession {
    pub params: AgentConnectionParams,
}

#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: HashMap<String, OpenSession>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn get(&self, session_id: &str) -> Option<&OpenSession> {
        self.sessions.get(session_id)
    }

    /// Apply one packet from the gateway.
    pub fn apply(&mut self, packet: &Packet) -> Result<Event> {
        let Some(session_id) = packet.session_id() else {
            return Ok(Event::Ignored);
        };
        let session_id = session_id.to_string();

        match packet.packet_type {
            PacketType::AgentConnect => {
                let raw = packet
                    .spec
                    .get(SPEC_AGENT_CONNECTION_PARAMS)
                    .context("agent connect without connection params")?;
                let params: AgentConnectionParams =
                    cbor_decode(raw).context("decoding connection params")?;
                let connection_type = packet
                    .spec_str(SPEC_CONNECTION_TYPE)
                    .unwrap_or_default()
                    .to_string();
                self.sessions
                    .insert(session_id.clone(), OpenSession { params });
                Ok(Event::Opened {
                    session_id,
                    connection_type,
                })
            }
            PacketType::CloseSession => {
                self.sessions.remove(&session_id);
                Ok(Event::Closed { session_id })
            }
            _ => Ok(Event::Data {
                session_id,
                bytes: packet.payload.len(),
            }),
        }
    }
}
