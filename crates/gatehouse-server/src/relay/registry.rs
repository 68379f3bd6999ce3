//! Session registry: live client streams by session id, live agent streams by
//! agent id.
//!
//! Both maps sit behind one mutex so a lookup never observes one map updated
//! and the other stale. Nothing here awaits I/O while holding the lock.

use super::peer::PeerHandle;
use crate::store::Connection;
use gatehouse_core::{GateError, GateResult};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// A bound client stream and the connection snapshot it was authorized for.
#[derive(Debug, Clone)]
pub struct ClientBinding {
    pub handle: PeerHandle,
    pub connection: Arc<Connection>,
}

#[derive(Default)]
struct Bindings {
    clients: HashMap<String, ClientBinding>,
    agents: HashMap<String, PeerHandle>,
}

/// Registry of live client and agent streams.
#[derive(Default)]
pub struct SessionRegistry {
    inner: Mutex<Bindings>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a client stream under `session_id`.
    ///
    /// Session ids are minted per handshake, so an occupied id is rejected
    /// rather than overwritten.
    pub async fn bind(
        &self,
        session_id: &str,
        handle: PeerHandle,
        connection: Arc<Connection>,
    ) -> GateResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.clients.contains_key(session_id) {
            return Err(GateError::FailedPrecondition(format!(
                "session {session_id} is already bound"
            )));
        }
        inner
            .clients
            .insert(session_id.to_string(), ClientBinding { handle, connection });
        debug!(session_id = %session_id, "client stream bound");
        Ok(())
    }

    /// Remove the client binding. Returns whether anything was removed;
    /// unbinding an absent session is a no-op.
    pub async fn unbind(&self, session_id: &str) -> bool {
        let removed = self.inner.lock().await.clients.remove(session_id).is_some();
        if removed {
            debug!(session_id = %session_id, "client stream unbound");
        }
        removed
    }

    pub async fn lookup(&self, session_id: &str) -> Option<ClientBinding> {
        self.inner.lock().await.clients.get(session_id).cloned()
    }

    /// Bind an agent stream, superseding any stream already bound to the id.
    ///
    /// Returns the superseded handle; the caller must close it so its read
    /// loop stops routing.
    pub async fn bind_agent(&self, agent_id: &str, handle: PeerHandle) -> Option<PeerHandle> {
        let stream_id = handle.id();
        let previous = self
            .inner
            .lock()
            .await
            .agents
            .insert(agent_id.to_string(), handle);
        info!(agent_id = %agent_id, stream_id, superseded = previous.is_some(), "agent stream bound");
        previous
    }

    /// Remove the agent binding only if it still belongs to `stream_id`.
    pub async fn unbind_agent(&self, agent_id: &str, stream_id: u64) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.agents.get(agent_id) {
            Some(current) if current.id() == stream_id => {
                inner.agents.remove(agent_id);
                debug!(agent_id = %agent_id, stream_id, "agent stream unbound");
                true
            }
            _ => false,
        }
    }

    pub async fn lookup_agent(&self, agent_id: &str) -> Option<PeerHandle> {
        self.inner.lock().await.agents.get(agent_id).cloned()
    }

    /// Number of bound client sessions.
    pub async fn session_count(&self) -> usize {
        self.inner.lock().await.clients.len()
    }

    /// Number of bound agents.
    pub async fn agent_count(&self) -> usize {
        self.inner.lock().await.agents.len()
    }

    /// Close every bound stream (server shutdown).
    pub async fn close_all(&self) {
        let inner = self.inner.lock().await;
        for binding in inner.clients.values() {
            binding.handle.close();
        }
        for agent in inner.agents.values() {
            agent.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SecretProvider;
    use std::collections::HashSet;

    fn connection() -> Arc<Connection> {
        Arc::new(Connection {
            id: "conn-1".into(),
            org_id: "org-1".into(),
            name: "shell".into(),
            command: vec!["bash".into()],
            connection_type: "command-line".into(),
            secret_provider: SecretProvider::Database,
            secret: HashMap::new(),
            agent_id: "agent-1".into(),
            created_by: String::new(),
        })
    }

    #[tokio::test]
    async fn duplicate_session_bind_is_rejected() {
        let registry = SessionRegistry::new();
        let (first, _r1) = PeerHandle::channel(1);
        let (second, _r2) = PeerHandle::channel(1);

        registry.bind("s1", first.clone(), connection()).await.unwrap();
        let err = registry.bind("s1", second, connection()).await.unwrap_err();
        assert!(matches!(err, GateError::FailedPrecondition(_)));

        assert_eq!(registry.session_count().await, 1);
        assert_eq!(registry.lookup("s1").await.unwrap().handle.id(), first.id());
    }

    #[tokio::test]
    async fn unbind_is_idempotent() {
        let registry = SessionRegistry::new();
        let (handle, _rx) = PeerHandle::channel(1);
        registry.bind("s1", handle, connection()).await.unwrap();

        assert!(registry.unbind("s1").await);
        assert!(!registry.unbind("s1").await);
        assert!(registry.lookup("s1").await.is_none());
        assert_eq!(registry.session_count().await, 0);
    }

    #[tokio::test]
    async fn agent_rebind_supersedes() {
        let registry = SessionRegistry::new();
        let (old, _r1) = PeerHandle::channel(1);
        let (new, _r2) = PeerHandle::channel(1);

        assert!(registry.bind_agent("agent-1", old.clone()).await.is_none());
        let superseded = registry.bind_agent("agent-1", new.clone()).await.unwrap();
        assert_eq!(superseded.id(), old.id());
        assert_eq!(registry.lookup_agent("agent-1").await.unwrap().id(), new.id());
        assert_eq!(registry.agent_count().await, 1);
    }

    #[tokio::test]
    async fn stale_agent_unbind_keeps_new_binding() {
        let registry = SessionRegistry::new();
        let (old, _r1) = PeerHandle::channel(1);
        let (new, _r2) = PeerHandle::channel(1);
        registry.bind_agent("agent-1", old.clone()).await;
        registry.bind_agent("agent-1", new.clone()).await;

        assert!(!registry.unbind_agent("agent-1", old.id()).await);
        assert!(registry.lookup_agent("agent-1").await.is_some());
        assert!(registry.unbind_agent("agent-1", new.id()).await);
        assert!(registry.lookup_agent("agent-1").await.is_none());
    }

    #[tokio::test]
    async fn close_all_fires_every_signal() {
        let registry = SessionRegistry::new();
        let (client, _r1) = PeerHandle::channel(1);
        let (agent, _r2) = PeerHandle::channel(1);
        registry.bind("s1", client.clone(), connection()).await.unwrap();
        registry.bind_agent("agent-1", agent.clone()).await;

        registry.close_all().await;
        assert!(*client.shutdown_signal().borrow());
        assert!(*agent.shutdown_signal().borrow());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_sessions_do_not_interfere() {
        let registry = Arc::new(SessionRegistry::new());
        let mut tasks = Vec::new();
        for i in 0..64 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let id = format!("s{i}");
                let (handle, rx) = PeerHandle::channel(1);
                registry.bind(&id, handle, connection()).await.unwrap();
                tokio::task::yield_now().await;
                if i % 3 == 0 {
                    assert!(registry.unbind(&id).await);
                }
                drop(rx);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let expected: HashSet<String> = (0..64)
            .filter(|i| i % 3 != 0)
            .map(|i| format!("s{i}"))
            .collect();
        assert_eq!(registry.session_count().await, expected.len());
        for id in &expected {
            assert!(registry.lookup(id).await.is_some(), "{id} should still be bound");
        }
        for i in (0..64).filter(|i| i % 3 == 0) {
            assert!(registry.lookup(&format!("s{i}")).await.is_none());
        }
    }
}
