//! In-memory store seeded from the config file.

use super::{
    AgentRecord, ClientRecord, Connection, Org, SecretProvider, Store, User, UserContext,
};
#[cfg(test)]
use super::ClientStatus;
use crate::config::{AgentEntry, ConnectionEntry, UserEntry};
use gatehouse_core::{BoxFuture, GateError, GateResult};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Default)]
struct ClientTable {
    records: HashMap<String, ClientRecord>,
    /// Every status write in order, as `(client id, status)`.
    #[cfg(test)]
    history: Vec<(String, ClientStatus)>,
}

pub struct MemoryStore {
    users: HashMap<String, User>,
    connections: Vec<ConnectionEntry>,
    agents: HashMap<String, AgentRecord>,
    clients: Mutex<ClientTable>,
}

impl MemoryStore {
    pub fn new(users: &[UserEntry], connections: &[ConnectionEntry], agents: &[AgentEntry]) -> Self {
        let users = users
            .iter()
            .map(|u| {
                (
                    u.subject.clone(),
                    User {
                        id: u.id.clone(),
                        org_id: u.org_id.clone(),
                        subject: u.subject.clone(),
                        email: u.email.clone(),
                        groups: u.groups.clone(),
                    },
                )
            })
            .collect();
        let agents = agents
            .iter()
            .map(|a| {
                (
                    a.token.clone(),
                    AgentRecord {
                        id: a.id.clone(),
                        org_id: a.org_id.clone(),
                        name: a.name.clone(),
                    },
                )
            })
            .collect();
        Self {
            users,
            connections: connections.to_vec(),
            agents,
            clients: Mutex::new(ClientTable::default()),
        }
    }
}

fn resolve_secret(entry: &ConnectionEntry) -> GateResult<HashMap<String, String>> {
    match entry.provider {
        SecretProvider::Database => Ok(entry.secret.clone()),
        SecretProvider::Env => entry
            .secret
            .iter()
            .map(|(key, var)| {
                std::env::var(var)
                    .map(|value| (key.clone(), value))
                    .map_err(|_| {
                        GateError::Internal(format!(
                            "connection {:?}: secret variable {var} is not set",
                            entry.name
                        ))
                    })
            })
            .collect(),
    }
}

impl Store for MemoryStore {
    fn find_user_by_subject<'a>(
        &'a self,
        subject: &'a str,
    ) -> BoxFuture<'a, GateResult<Option<UserContext>>> {
        Box::pin(async move {
            Ok(self.users.get(subject).map(|user| UserContext {
                org: Org {
                    id: user.org_id.clone(),
                },
                user: user.clone(),
            }))
        })
    }

    fn find_connection<'a>(
        &'a self,
        ctx: &'a UserContext,
        name: &'a str,
    ) -> BoxFuture<'a, GateResult<Option<Connection>>> {
        Box::pin(async move {
            let Some(entry) = self
                .connections
                .iter()
                .find(|c| c.name == name && c.org_id == ctx.org.id)
            else {
                return Ok(None);
            };
            Ok(Some(Connection {
                id: entry.id.clone(),
                org_id: entry.org_id.clone(),
                name: entry.name.clone(),
                command: entry.command.clone(),
                connection_type: entry.connection_type.clone(),
                secret_provider: entry.provider,
                secret: resolve_secret(entry)?,
                agent_id: entry.agent_id.clone(),
                created_by: entry.created_by.clone(),
            }))
        })
    }

    fn find_agent_by_token<'a>(
        &'a self,
        token: &'a str,
    ) -> BoxFuture<'a, GateResult<Option<AgentRecord>>> {
        Box::pin(async move { Ok(self.agents.get(token).cloned()) })
    }

    fn persist_client<'a>(&'a self, record: &'a ClientRecord) -> BoxFuture<'a, GateResult<()>> {
        Box::pin(async move {
            let mut table = self.clients.lock().await;
            #[cfg(test)]
            table.history.push((record.id.clone(), record.status));
            table.records.insert(record.id.clone(), record.clone());
            debug!(client_id = %record.id, status = ?record.status, "client record persisted");
            Ok(())
        })
    }
}

#[cfg(test)]
impl MemoryStore {
    /// Current record for a client id.
    pub async fn client(&self, id: &str) -> Option<ClientRecord> {
        self.clients.lock().await.records.get(id).cloned()
    }

    pub async fn records(&self) -> Vec<ClientRecord> {
        self.clients.lock().await.records.values().cloned().collect()
    }

    /// Ordered status writes for one client id.
    pub async fn status_history(&self, id: &str) -> Vec<ClientStatus> {
        self.clients
            .lock()
            .await
            .history
            .iter()
            .filter(|(cid, _)| cid == id)
            .map(|(_, status)| *status)
            .collect()
    }
}
