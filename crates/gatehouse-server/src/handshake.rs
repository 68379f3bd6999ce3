//! Client session handshake and lifecycle.
//!
//! One handshake runs per inbound client stream:
//!
//! ```text
//! NEW → AUTHENTICATING → AUTHORIZING → CONNECT_HOOK → BOUND → RELAYING
//!     → DISCONNECTING → CLOSED
//! ```
//!
//! Any failure before BOUND goes straight to CLOSED: nothing is bound, no
//! `connected` record is left behind and the agent never hears about the
//! session. Once BOUND, every exit from RELAYING funnels through
//! [`Gateway::teardown`].

use crate::gateway::Gateway;
use crate::plugins::{ConnectParams, DisconnectParams};
use crate::relay::PeerHandle;
use crate::store::{ClientRecord, ClientStatus, Connection};
use gatehouse_core::packet::SPEC_GATEWAY_SESSION_ID;
use gatehouse_core::{GateError, GateResult, Packet, PacketSource, PacketType};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Transport-level metadata presented by a connecting client.
#[derive(Debug, Clone, Default)]
pub struct ClientMetadata {
    /// Bearer token, without the `Bearer ` prefix.
    pub token: String,
    pub hostname: String,
    pub machine_id: String,
    pub kernel_version: String,
    pub connection_name: String,
    pub remote: Option<IpAddr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    New,
    Authenticating,
    Authorizing,
    ConnectHook,
    Bound,
    Relaying,
    Disconnecting,
    Closed,
}

/// A bound client session, owned by the task relaying its stream.
pub struct ClientSession {
    pub record: ClientRecord,
    /// Connection snapshot pinned at handshake time.
    pub connection: Arc<Connection>,
    pub handle: PeerHandle,
}

impl ClientSession {
    pub fn session_id(&self) -> &str {
        &self.record.session_id
    }
}

fn advance(state: &mut SessionState, next: SessionState, connection_name: &str) {
    debug!(connection = %connection_name, from = ?*state, to = ?next, "client handshake");
    *state = next;
}

impl Gateway {
    /// Run a client stream from handshake to cleanup.
    ///
    /// The returned error is the terminal status for the client; `Ok` means
    /// the session ended gracefully.
    pub async fn serve_client<S: PacketSource>(
        &self,
        meta: ClientMetadata,
        mut source: S,
        handle: PeerHandle,
    ) -> GateResult<()> {
        let name = meta.connection_name.clone();
        let mut state = SessionState::New;

        let session = match self.establish(&meta, handle, &mut state).await {
            Ok(session) => session,
            Err(e) => {
                advance(&mut state, SessionState::Closed, &name);
                return Err(e);
            }
        };

        advance(&mut state, SessionState::Relaying, &name);
        let result = self.client_loop(&session, &mut source).await;

        advance(&mut state, SessionState::Disconnecting, &name);
        self.teardown(session, &result).await;
        advance(&mut state, SessionState::Closed, &name);
        result
    }

    /// Authenticate, authorize, run connect hooks, persist and bind.
    async fn establish(
        &self,
        meta: &ClientMetadata,
        handle: PeerHandle,
        state: &mut SessionState,
    ) -> GateResult<ClientSession> {
        let name = meta.connection_name.as_str();

        advance(state, SessionState::Authenticating, name);
        let subject = self.identity.exchange_token(&meta.token, meta.remote).await?;

        advance(state, SessionState::Authorizing, name);
        let ctx = self.identity.resolve_user_context(&subject).await?;
        let conn = self.identity.resolve_connection(&ctx, name).await?;

        let session_id = Uuid::new_v4().to_string();
        let mut record = ClientRecord {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.clone(),
            org_id: ctx.org.id.clone(),
            user_id: ctx.user.id.clone(),
            agent_id: conn.agent_id.clone(),
            connection_id: conn.id.clone(),
            hostname: meta.hostname.clone(),
            machine_id: meta.machine_id.clone(),
            kernel_version: meta.kernel_version.clone(),
            status: ClientStatus::Connected,
        };

        advance(state, SessionState::ConnectHook, name);
        let params = ConnectParams {
            session_id: session_id.clone(),
            connection_id: conn.id.clone(),
            connection_name: name.to_string(),
            connection_type: conn.connection_type.clone(),
            org_id: ctx.org.id.clone(),
            user_id: ctx.user.id.clone(),
            hostname: meta.hostname.clone(),
            machine_id: meta.machine_id.clone(),
            kernel_version: meta.kernel_version.clone(),
        };
        if let Err(e) = self.hooks.on_connect(&params, &ctx).await {
            warn!(session_id = %session_id, error = %e, "plugin refused to accept connection");
            return Err(GateError::FailedPrecondition(e.to_string()));
        }

        self.store
            .persist_client(&record)
            .await
            .map_err(|e| GateError::Internal(format!("failed persisting client record: {e}")))?;

        let connection = Arc::new(conn);
        if let Err(e) = self
            .registry
            .bind(&session_id, handle.clone(), connection.clone())
            .await
        {
            record.status = ClientStatus::Disconnected;
            if let Err(pe) = self.store.persist_client(&record).await {
                error!(session_id = %session_id, error = %pe, "failed persisting client record");
            }
            return Err(e);
        }
        advance(state, SessionState::Bound, name);

        info!(
            session_id = %session_id,
            user_id = %record.user_id,
            connection = %name,
            hostname = %meta.hostname,
            machine_id = %meta.machine_id,
            kernel_version = %meta.kernel_version,
            "client connected"
        );

        Ok(ClientSession {
            record,
            connection,
            handle,
        })
    }

    /// Run disconnect hooks, unbind, persist `disconnected`, tell the agent.
    ///
    /// Takes the session by value so it runs exactly once per bound session.
    pub(crate) async fn teardown(&self, mut session: ClientSession, result: &GateResult<()>) {
        let session_id = session.session_id().to_string();
        let error = match result {
            Ok(()) => None,
            Err(e) => Some(e.to_string()),
        };

        let params = DisconnectParams {
            session_id: session_id.clone(),
            org_id: session.record.org_id.clone(),
            error,
        };
        if let Err(e) = self.hooks.on_disconnect(&params).await {
            warn!(session_id = %session_id, error = %e, "failed processing plugin on-disconnect phase");
        }

        self.registry.unbind(&session_id).await;
        session.handle.close();

        session.record.status = ClientStatus::Disconnected;
        if let Err(e) = self.store.persist_client(&session.record).await {
            error!(session_id = %session_id, error = %e, "failed persisting client record");
        }

        if let Some(agent) = self.registry.lookup_agent(&session.connection.agent_id).await {
            let notice = Packet::new(PacketType::CloseSession, Vec::new())
                .with_spec(SPEC_GATEWAY_SESSION_ID, session_id.as_bytes());
            if let Err(e) = agent.try_send(notice) {
                debug!(session_id = %session_id, error = %e, "could not notify agent of session close");
            }
        }

        match result {
            Ok(()) => info!(session_id = %session_id, "client disconnected"),
            Err(e) => info!(session_id = %session_id, error = %e, "client session ended with error"),
        }
    }
}
