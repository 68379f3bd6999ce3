//! Test harness: channel-backed packet sources and a seeded gateway.

use crate::auth::{HmacTokenProvider, IdentityGate, RateLimiter};
use crate::config::{AgentEntry, ConnectionEntry, UserEntry};
use crate::gateway::Gateway;
use crate::handshake::ClientMetadata;
use crate::plugins::{HookChain, Plugin};
use crate::relay::SessionRegistry;
use crate::relay::PeerHandle;
use crate::store::{
    AgentRecord, ClientRecord, ClientStatus, Connection, MemoryStore, SecretProvider, Store,
    UserContext,
};
use gatehouse_core::{BoxFuture, GateError, GateResult, Packet, PacketSource};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

pub const SECRET: &[u8] = b"gatehouse-test-secret";
pub const AGENT_ID: &str = "a1";
pub const AGENT_TOKEN: &str = "agent-token-1";
pub const OTHER_AGENT_TOKEN: &str = "agent-token-2";

/// A [`PacketSource`] fed from an unbounded channel. Dropping the sender is
/// end-of-stream.
pub struct ChannelSource {
    rx: mpsc::UnboundedReceiver<GateResult<Packet>>,
}

impl PacketSource for ChannelSource {
    fn recv(&mut self) -> BoxFuture<'_, GateResult<Option<Packet>>> {
        Box::pin(async move {
            match self.rx.recv().await {
                Some(Ok(packet)) => Ok(Some(packet)),
                Some(Err(e)) => Err(e),
                None => Ok(None),
            }
        })
    }
}

pub fn source() -> (mpsc::UnboundedSender<GateResult<Packet>>, ChannelSource) {
    let (tx, rx) = mpsc::unbounded_channel();
    (tx, ChannelSource { rx })
}

pub struct Fixture {
    pub gateway: Arc<Gateway>,
    pub store: Arc<MemoryStore>,
}

fn connection_entry() -> ConnectionEntry {
    ConnectionEntry {
        id: "conn-shell".into(),
        org_id: "org-1".into(),
        name: "shell".into(),
        command: vec!["run".into()],
        connection_type: "command-line".into(),
        provider: SecretProvider::Database,
        secret: HashMap::from([("X".to_string(), "1".to_string())]),
        agent_id: AGENT_ID.into(),
        created_by: "id-alice".into(),
    }
}

/// The `shell` connection as the store resolves it.
pub fn connection() -> Connection {
    let entry = connection_entry();
    Connection {
        id: entry.id,
        org_id: entry.org_id,
        name: entry.name,
        command: entry.command,
        connection_type: entry.connection_type,
        secret_provider: entry.provider,
        secret: entry.secret,
        agent_id: entry.agent_id,
        created_by: entry.created_by,
    }
}

/// Gateway with user `alice`, connection `shell` served by agent `a1`, and
/// a second agent `a2`.
pub fn fixture(plugins: Vec<Arc<dyn Plugin>>) -> Fixture {
    fixture_with_fault(plugins, None)
}

/// Like [`fixture`], with the store misbehaving as `fault` says.
pub fn fixture_with_fault(plugins: Vec<Arc<dyn Plugin>>, fault: Option<Fault>) -> Fixture {
    let users = [UserEntry {
        id: "id-alice".into(),
        org_id: "org-1".into(),
        subject: "alice".into(),
        email: "alice@example.com".into(),
        groups: vec!["dev".into()],
    }];
    let agents = [
        AgentEntry {
            id: AGENT_ID.into(),
            org_id: "org-1".into(),
            name: "primary".into(),
            token: AGENT_TOKEN.into(),
        },
        AgentEntry {
            id: "a2".into(),
            org_id: "org-1".into(),
            name: "secondary".into(),
            token: OTHER_AGENT_TOKEN.into(),
        },
    ];
    let store = Arc::new(MemoryStore::new(&users, &[connection_entry()], &agents));
    let registry = Arc::new(SessionRegistry::new());
    let backing: Arc<dyn Store> = match fault {
        Some(fault) => Arc::new(FaultyStore {
            inner: store.clone(),
            registry: registry.clone(),
            fault,
        }),
        None => store.clone(),
    };

    let identity = IdentityGate::new(
        Arc::new(HmacTokenProvider::new(SECRET.to_vec())),
        backing.clone(),
        false,
        RateLimiter::new(1000, 60),
    );
    let mut hooks = HookChain::new();
    for plugin in plugins {
        hooks.register(plugin);
    }
    let gateway = Gateway::new(registry, identity, backing, hooks);
    Fixture {
        gateway: Arc::new(gateway),
        store,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Every `persist_client` fails.
    Persist,
    /// A `connected` write first binds another stream under the same session id.
    SessionCollision,
}

/// Delegates to a [`MemoryStore`] and injects one [`Fault`].
struct FaultyStore {
    inner: Arc<MemoryStore>,
    registry: Arc<SessionRegistry>,
    fault: Fault,
}

impl Store for FaultyStore {
    fn find_user_by_subject<'a>(
        &'a self,
        subject: &'a str,
    ) -> BoxFuture<'a, GateResult<Option<UserContext>>> {
        self.inner.find_user_by_subject(subject)
    }

    fn find_connection<'a>(
        &'a self,
        ctx: &'a UserContext,
        name: &'a str,
    ) -> BoxFuture<'a, GateResult<Option<Connection>>> {
        self.inner.find_connection(ctx, name)
    }

    fn find_agent_by_token<'a>(
        &'a self,
        token: &'a str,
    ) -> BoxFuture<'a, GateResult<Option<AgentRecord>>> {
        self.inner.find_agent_by_token(token)
    }

    fn persist_client<'a>(&'a self, record: &'a ClientRecord) -> BoxFuture<'a, GateResult<()>> {
        Box::pin(async move {
            match self.fault {
                Fault::Persist => Err(GateError::Internal("disk full".into())),
                Fault::SessionCollision => {
                    if record.status == ClientStatus::Connected {
                        let (squatter, _rx) = PeerHandle::channel(1);
                        self.registry
                            .bind(&record.session_id, squatter, Arc::new(connection()))
                            .await?;
                    }
                    self.inner.persist_client(record).await
                }
            }
        })
    }
}

/// Metadata for `alice` requesting `connection_name`.
pub fn client_meta(connection_name: &str) -> ClientMetadata {
    ClientMetadata {
        token: HmacTokenProvider::new(SECRET.to_vec())
            .mint("alice", 3600)
            .unwrap(),
        hostname: "laptop".into(),
        machine_id: "m-1".into(),
        kernel_version: "6.1.0".into(),
        connection_name: connection_name.into(),
        remote: None,
    }
}
