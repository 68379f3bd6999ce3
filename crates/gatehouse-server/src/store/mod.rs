//! Persistence capabilities consumed by the gateway, and the records they
//! deal in.
//!
//! The relay only needs four lookups/writes; [`MemoryStore`] is the
//! config-seeded implementation the binary ships with.

pub mod memory;

pub use memory::MemoryStore;

use gatehouse_core::{BoxFuture, GateResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: String,
    pub org_id: String,
    /// Subject issued by the identity provider.
    pub subject: String,
    pub email: String,
    pub groups: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Org {
    pub id: String,
}

/// Caller identity resolved once per handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserContext {
    pub user: User,
    pub org: Org,
}

/// Where a connection's secret values come from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecretProvider {
    /// Values are stored with the connection.
    #[default]
    Database,
    /// Each value names a process environment variable holding the secret.
    Env,
}

/// A connection configuration snapshot. Sessions pin the snapshot resolved at
/// handshake time; it never changes under a live session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub id: String,
    pub org_id: String,
    pub name: String,
    /// argv the agent executes.
    pub command: Vec<String>,
    /// Backend category, forwarded to the agent as-is.
    pub connection_type: String,
    pub secret_provider: SecretProvider,
    /// Resolved environment / secret map.
    pub secret: HashMap<String, String>,
    pub agent_id: String,
    pub created_by: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRecord {
    pub id: String,
    pub org_id: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientStatus {
    Connected,
    Disconnected,
}

/// One client session as persisted by the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRecord {
    pub id: String,
    pub session_id: String,
    pub org_id: String,
    pub user_id: String,
    pub agent_id: String,
    pub connection_id: String,
    pub hostname: String,
    pub machine_id: String,
    pub kernel_version: String,
    pub status: ClientStatus,
}

/// Lookup and persistence operations the relay depends on.
pub trait Store: Send + Sync {
    /// Resolve the user and org for an identity-provider subject.
    fn find_user_by_subject<'a>(
        &'a self,
        subject: &'a str,
    ) -> BoxFuture<'a, GateResult<Option<UserContext>>>;

    /// Find a connection by name within the caller's org, with secrets resolved.
    fn find_connection<'a>(
        &'a self,
        ctx: &'a UserContext,
        name: &'a str,
    ) -> BoxFuture<'a, GateResult<Option<Connection>>>;

    /// Resolve the agent presenting `token`.
    fn find_agent_by_token<'a>(
        &'a self,
        token: &'a str,
    ) -> BoxFuture<'a, GateResult<Option<AgentRecord>>>;

    /// Upsert a client record.
    fn persist_client<'a>(&'a self, record: &'a ClientRecord) -> BoxFuture<'a, GateResult<()>>;
}
