//! Agent-facing handshake and dispatch loop.
//!
//! Agents bind by agent id; a second stream for the same id supersedes the
//! first. Packets read from an agent are routed to the client session named
//! by their `gateway.session_id` spec entry.

use crate::gateway::Gateway;
use crate::relay::PeerHandle;
use crate::store::AgentRecord;
use gatehouse_core::{GateError, GateResult, PacketSource};
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, info, warn};

impl Gateway {
    /// Authenticate an agent stream, bind it and relay until it ends.
    pub async fn serve_agent<S: PacketSource>(
        &self,
        token: &str,
        mut source: S,
        handle: PeerHandle,
    ) -> GateResult<()> {
        let agent = match self.store.find_agent_by_token(token).await {
            Ok(Some(agent)) => agent,
            Ok(None) => {
                warn!("agent presented an unknown token");
                return Err(GateError::Unauthenticated("invalid agent token".into()));
            }
            Err(e) => {
                error!(error = %e, "failed looking up agent");
                return Err(GateError::Internal("failed looking up agent".into()));
            }
        };

        let stream_id = handle.id();
        if let Some(previous) = self.registry.bind_agent(&agent.id, handle.clone()).await {
            info!(agent_id = %agent.id, stale_stream = previous.id(), "superseding agent stream");
            previous.close();
        }
        info!(agent_id = %agent.id, name = %agent.name, stream_id, "agent connected");

        let result = self.agent_loop(&agent, &mut source, &handle).await;

        self.registry.unbind_agent(&agent.id, stream_id).await;
        handle.close();
        match &result {
            Ok(()) => info!(agent_id = %agent.id, stream_id, "agent disconnected"),
            Err(e) => info!(agent_id = %agent.id, stream_id, error = %e, "agent stream ended with error"),
        }
        result
    }

    async fn agent_loop<S: PacketSource>(
        &self,
        agent: &AgentRecord,
        source: &mut S,
        handle: &PeerHandle,
    ) -> GateResult<()> {
        let mut shutdown = handle.shutdown_signal();
        loop {
            if *shutdown.borrow() {
                debug!(agent_id = %agent.id, "agent stream shut down");
                return Ok(());
            }

            let next = tokio::select! {
                biased;
                _ = shutdown.changed() => continue,
                next = source.recv() => next,
            };

            let packet = match next {
                Ok(Some(packet)) => packet,
                Ok(None) | Err(GateError::Canceled) => {
                    debug!(agent_id = %agent.id, "agent stream ended");
                    return Ok(());
                }
                Err(e) => {
                    error!(agent_id = %agent.id, error = %e, "failed receiving agent packet");
                    return Err(GateError::Internal(
                        "internal error, failed receiving agent packet".into(),
                    ));
                }
            };

            if packet.is_keep_alive() {
                continue;
            }

            let Some(session_id) = packet.session_id() else {
                debug!(agent_id = %agent.id, packet_type = %packet.packet_type, "dropping agent packet without session id");
                continue;
            };
            let Some(binding) = self.registry.lookup(session_id).await else {
                debug!(agent_id = %agent.id, session_id = %session_id, "dropping packet for unknown session");
                continue;
            };
            if binding.connection.agent_id != agent.id {
                warn!(
                    agent_id = %agent.id,
                    session_id = %session_id,
                    "agent sent packet for a session it does not serve"
                );
                continue;
            }

            if binding.handle.is_closed() {
                debug!(session_id = %session_id, "client stream is closing, dropping packet");
                continue;
            }

            let session_id = session_id.to_string();
            match binding.handle.try_send(packet) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    // A stalled client must not hold up the other sessions on this agent.
                    warn!(session_id = %session_id, agent_id = %agent.id, "client is not draining its stream, closing session");
                    binding.handle.close();
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(session_id = %session_id, "client stream closed, dropping packet");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::relay::PeerHandle;
    use crate::testutil::{client_meta, fixture, source, AGENT_ID, AGENT_TOKEN};
    use gatehouse_core::packet::SPEC_GATEWAY_SESSION_ID;
    use gatehouse_core::{GateError, Packet, PacketType};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn unknown_token_is_unauthenticated() {
        let fx = fixture(vec![]);
        let (_tx, src) = source();
        let (handle, _rx) = PeerHandle::channel(8);

        let err = fx.gateway.serve_agent("nope", src, handle).await.unwrap_err();
        assert!(matches!(err, GateError::Unauthenticated(_)));
        assert_eq!(fx.gateway.registry().agent_count().await, 0);
    }

    #[tokio::test]
    async fn end_of_stream_unbinds_agent() {
        let fx = fixture(vec![]);
        let (tx, src) = source();
        drop(tx);
        let (handle, _rx) = PeerHandle::channel(8);

        fx.gateway.serve_agent(AGENT_TOKEN, src, handle).await.unwrap();
        assert!(fx.gateway.registry().lookup_agent(AGENT_ID).await.is_none());
    }

    #[tokio::test]
    async fn second_agent_stream_supersedes_first() {
        let fx = fixture(vec![]);
        let (_tx1, src1) = source();
        let (first, _rx1) = PeerHandle::channel(8);
        let first_id = first.id();

        let gateway = fx.gateway.clone();
        let stale = tokio::spawn(async move { gateway.serve_agent(AGENT_TOKEN, src1, first).await });
        while fx.gateway.registry().lookup_agent(AGENT_ID).await.is_none() {
            tokio::task::yield_now().await;
        }

        let (_tx2, src2) = source();
        let (second, _rx2) = PeerHandle::channel(8);
        let second_id = second.id();
        let gateway = fx.gateway.clone();
        let fresh = tokio::spawn(async move { gateway.serve_agent(AGENT_TOKEN, src2, second).await });

        // The first loop sees its shutdown signal and exits cleanly.
        assert!(stale.await.unwrap().is_ok());
        let current = fx.gateway.registry().lookup_agent(AGENT_ID).await.unwrap();
        assert_eq!(current.id(), second_id);
        assert_ne!(current.id(), first_id);

        current.close();
        assert!(fresh.await.unwrap().is_ok());
        assert!(fx.gateway.registry().lookup_agent(AGENT_ID).await.is_none());
    }

    #[tokio::test]
    async fn routes_replies_to_owning_session() {
        let fx = fixture(vec![]);
        let (agent_tx, agent_src) = source();
        let (agent_handle, mut agent_rx) = PeerHandle::channel(16);
        let gateway = fx.gateway.clone();
        let agent_task =
            tokio::spawn(async move { gateway.serve_agent(AGENT_TOKEN, agent_src, agent_handle).await });
        while fx.gateway.registry().lookup_agent(AGENT_ID).await.is_none() {
            tokio::task::yield_now().await;
        }

        let (client_tx, client_src) = source();
        let (client_handle, mut client_rx) = PeerHandle::channel(16);
        let gateway = fx.gateway.clone();
        let client_task = tokio::spawn(async move {
            gateway
                .serve_client(client_meta("shell"), client_src, client_handle)
                .await
        });

        client_tx
            .send(Ok(Packet::new(PacketType::Data, b"ping".to_vec())))
            .unwrap();
        let request = agent_rx.recv().await.unwrap();
        let session_id = request.session_id().unwrap().to_string();

        agent_tx
            .send(Ok(Packet::new(PacketType::Data, b"pong".to_vec())
                .with_spec(SPEC_GATEWAY_SESSION_ID, session_id.as_bytes())))
            .unwrap();
        // Unknown session and missing session id are dropped without ending the agent.
        agent_tx
            .send(Ok(Packet::new(PacketType::Data, b"lost".to_vec())
                .with_spec(SPEC_GATEWAY_SESSION_ID, "no-such-session")))
            .unwrap();
        agent_tx
            .send(Ok(Packet::new(PacketType::Data, b"orphan".to_vec())))
            .unwrap();
        agent_tx
            .send(Ok(Packet::new(PacketType::Data, b"again".to_vec())
                .with_spec(SPEC_GATEWAY_SESSION_ID, session_id.as_bytes())))
            .unwrap();

        assert_eq!(client_rx.recv().await.unwrap().payload, b"pong");
        assert_eq!(client_rx.recv().await.unwrap().payload, b"again");

        drop(client_tx);
        assert!(client_task.await.unwrap().is_ok());
        let close = agent_rx.recv().await.unwrap();
        assert_eq!(close.packet_type, PacketType::CloseSession);
        assert_eq!(close.session_id(), Some(session_id.as_str()));

        drop(agent_tx);
        assert!(agent_task.await.unwrap().is_ok());
        assert_eq!(fx.gateway.registry().agent_count().await, 0);
    }

    #[tokio::test]
    async fn stalled_client_does_not_block_other_sessions() {
        let fx = fixture(vec![]);
        let registry = fx.gateway.registry();
        let (stalled, _stalled_rx) = PeerHandle::channel(1);
        registry
            .bind("s1", stalled.clone(), Arc::new(crate::testutil::connection()))
            .await
            .unwrap();
        let (healthy, mut healthy_rx) = PeerHandle::channel(8);
        registry
            .bind("s2", healthy, Arc::new(crate::testutil::connection()))
            .await
            .unwrap();

        let (tx, src) = source();
        for (session, body) in [("s1", "a"), ("s1", "b"), ("s2", "c")] {
            tx.send(Ok(Packet::new(PacketType::Data, body.as_bytes().to_vec())
                .with_spec(SPEC_GATEWAY_SESSION_ID, session)))
                .unwrap();
        }
        drop(tx);
        let (handle, _rx) = PeerHandle::channel(8);

        tokio::time::timeout(
            Duration::from_secs(2),
            fx.gateway.serve_agent(AGENT_TOKEN, src, handle),
        )
        .await
        .expect("agent loop must not block on a full client queue")
        .unwrap();

        assert_eq!(healthy_rx.try_recv().unwrap().payload, b"c");
        assert!(stalled.is_closed());
    }

    #[tokio::test]
    async fn foreign_agent_cannot_reach_session() {
        let fx = fixture(vec![]);
        let (client_handle, mut client_rx) = PeerHandle::channel(8);
        fx.gateway
            .registry()
            .bind("s1", client_handle, Arc::new(crate::testutil::connection()))
            .await
            .unwrap();

        let (tx, src) = source();
        tx.send(Ok(Packet::new(PacketType::Data, b"x".to_vec())
            .with_spec(SPEC_GATEWAY_SESSION_ID, "s1")))
            .unwrap();
        drop(tx);
        let (handle, _rx) = PeerHandle::channel(8);

        fx.gateway
            .serve_agent(crate::testutil::OTHER_AGENT_TOKEN, src, handle)
            .await
            .unwrap();
        assert!(client_rx.try_recv().is_err());
    }
}
