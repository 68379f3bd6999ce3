//! Client-facing dispatch loop.

use crate::gateway::Gateway;
use crate::handshake::ClientSession;
use crate::plugins::ReceiveContext;
use crate::relay::PeerHandle;
use gatehouse_core::packet::{
    SPEC_AGENT_CONNECTION_PARAMS, SPEC_CLIENT_EXEC_ARGS, SPEC_CONNECTION_TYPE,
    SPEC_GATEWAY_SESSION_ID,
};
use gatehouse_core::{
    cbor_decode, cbor_encode, AgentConnectionParams, GateError, GateResult, Packet, PacketSource,
    PacketType,
};
use tracing::{debug, error, warn};

impl Gateway {
    /// Relay packets from a bound client to its agent until the stream ends.
    ///
    /// `Ok` covers end-of-stream, client cancellation and the stream's own
    /// shutdown signal. Every return leads to the session's teardown.
    pub(crate) async fn client_loop<S: PacketSource>(
        &self,
        session: &ClientSession,
        source: &mut S,
    ) -> GateResult<()> {
        let session_id = session.session_id();
        let mut shutdown = session.handle.shutdown_signal();
        let ctx = ReceiveContext {
            session_id: session_id.to_string(),
            org_id: session.record.org_id.clone(),
            connection_name: session.connection.name.clone(),
        };

        loop {
            if *shutdown.borrow() {
                debug!(session_id = %session_id, "client stream shut down");
                return Ok(());
            }

            let next = tokio::select! {
                biased;
                _ = shutdown.changed() => continue,
                next = source.recv() => next,
            };

            let mut packet = match next {
                Ok(Some(packet)) => packet,
                Ok(None) => {
                    debug!(session_id = %session_id, "client stream ended");
                    return Ok(());
                }
                Err(GateError::Canceled) => {
                    debug!(session_id = %session_id, "client canceled the stream");
                    return Ok(());
                }
                Err(e) => {
                    error!(session_id = %session_id, error = %e, "failed receiving client packet");
                    return Err(GateError::Internal(
                        "internal error, failed receiving client packet".into(),
                    ));
                }
            };

            if packet.is_keep_alive() {
                continue;
            }

            // Never trust a client-supplied session id.
            packet.set_spec(SPEC_GATEWAY_SESSION_ID, session_id.as_bytes());

            let agent_id = &session.connection.agent_id;
            let Some(agent) = self.registry.lookup_agent(agent_id).await else {
                warn!(session_id = %session_id, agent_id = %agent_id, "agent is not connected");
                return Err(GateError::FailedPrecondition(format!(
                    "agent not found for {agent_id}"
                )));
            };

            if let Err(e) = self.hooks.on_receive(&ctx, &packet).await {
                warn!(session_id = %session_id, error = %e, "plugin rejected packet");
                return Err(GateError::Internal(
                    "packet rejected, contact the administrator".into(),
                ));
            }

            // Backpressure from the agent stalls only this session, and never
            // past its shutdown signal.
            tokio::select! {
                biased;
                _ = shutdown.changed() => continue,
                processed = self.process_client_packet(session, packet, &agent) => processed?,
            }
        }
    }

    async fn process_client_packet(
        &self,
        session: &ClientSession,
        packet: Packet,
        agent: &PeerHandle,
    ) -> GateResult<()> {
        let session_id = session.session_id();
        match packet.packet_type {
            PacketType::GatewayConnect => {
                let client_args = match packet.spec.get(SPEC_CLIENT_EXEC_ARGS) {
                    Some(raw) => cbor_decode::<Vec<String>>(raw).unwrap_or_else(|e| {
                        warn!(session_id = %session_id, error = %e, "failed decoding client exec args");
                        Vec::new()
                    }),
                    None => Vec::new(),
                };
                let params = AgentConnectionParams {
                    env_vars: session.connection.secret.clone(),
                    cmd_list: session.connection.command.clone(),
                    client_args,
                };
                let encoded = cbor_encode(&params).map_err(|e| {
                    error!(session_id = %session_id, error = %e, "failed encoding agent connection params");
                    GateError::Internal("internal error, failed encoding connection params".into())
                })?;

                let notice = Packet::new(PacketType::AgentConnect, Vec::new())
                    .with_spec(SPEC_GATEWAY_SESSION_ID, session_id.as_bytes())
                    .with_spec(
                        SPEC_CONNECTION_TYPE,
                        session.connection.connection_type.as_bytes(),
                    )
                    .with_spec(SPEC_AGENT_CONNECTION_PARAMS, encoded);
                if let Err(e) = agent.send(notice).await {
                    warn!(session_id = %session_id, error = %e, "failed sending agent connect");
                }
            }
            PacketType::AgentConnect => {
                // Connection params only ever come from the gateway.
                warn!(session_id = %session_id, "dropping client-originated agent connect packet");
            }
            _ => {
                let packet_type = packet.packet_type.clone();
                if let Err(e) = agent.send(packet).await {
                    warn!(session_id = %session_id, packet_type = %packet_type, error = %e, "failed forwarding packet to agent");
                }
            }
        }
        Ok(())
    }
}
