//! Per-session audit trail.
//!
//! Appends newline-delimited JSON events to `<dir>/<session_id>.jsonl`.
//! Auditing is best-effort: write failures are logged and never veto.

use super::{ConnectParams, DisconnectParams, HookResult, Plugin, ReceiveContext};
use crate::store::UserContext;
use gatehouse_core::{BoxFuture, Packet};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::error;

/// Events written to the audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    Connect {
        user_id: String,
        connection: String,
        connection_type: String,
        hostname: String,
    },
    Receive {
        packet_type: String,
        payload_size: usize,
    },
    Disconnect {
        error: Option<String>,
    },
}

/// A single timestamped line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp_ms: u64,
    pub session_id: String,
    pub org_id: String,
    #[serde(flatten)]
    pub event: AuditEvent,
}

pub struct AuditPlugin {
    dir: PathBuf,
}

impl AuditPlugin {
    pub const NAME: &'static str = "audit";

    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn path_for(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{session_id}.jsonl"))
    }

    async fn record(&self, session_id: &str, org_id: &str, event: AuditEvent) {
        let entry = AuditEntry {
            timestamp_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            session_id: session_id.to_string(),
            org_id: org_id.to_string(),
            event,
        };
        let path = self.path_for(session_id);
        match serde_json::to_string(&entry) {
            Ok(mut line) => {
                line.push('\n');
                if let Err(e) = append_line(&path, &line).await {
                    error!(path = %path.display(), error = %e, "failed to write audit event");
                }
            }
            Err(e) => error!(error = %e, "failed to serialize audit event"),
        }
    }
}

async fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

#[cfg(test)]
async fn load_audit(path: &Path) -> std::io::Result<Vec<AuditEntry>> {
    let content = tokio::fs::read_to_string(path).await?;
    let mut entries = Vec::new();
    for line in content.lines().filter(|l| !l.trim().is_empty()) {
        match serde_json::from_str::<AuditEntry>(line) {
            Ok(entry) => entries.push(entry),
            Err(e) => error!(error = %e, "skipping malformed audit line"),
        }
    }
    Ok(entries)
}

impl Plugin for AuditPlugin {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn on_connect<'a>(
        &'a self,
        params: &'a ConnectParams,
        _ctx: &'a UserContext,
    ) -> BoxFuture<'a, HookResult> {
        Box::pin(async move {
            let event = AuditEvent::Connect {
                user_id: params.user_id.clone(),
                connection: params.connection_name.clone(),
                connection_type: params.connection_type.clone(),
                hostname: params.hostname.clone(),
            };
            self.record(&params.session_id, &params.org_id, event).await;
            Ok(())
        })
    }

    fn on_receive<'a>(
        &'a self,
        ctx: &'a ReceiveContext,
        packet: &'a Packet,
    ) -> BoxFuture<'a, HookResult> {
        Box::pin(async move {
            let event = AuditEvent::Receive {
                packet_type: packet.packet_type.to_string(),
                payload_size: packet.payload.len(),
            };
            self.record(&ctx.session_id, &ctx.org_id, event).await;
            Ok(())
        })
    }

    fn on_disconnect<'a>(&'a self, params: &'a DisconnectParams) -> BoxFuture<'a, HookResult> {
        Box::pin(async move {
            let event = AuditEvent::Disconnect {
                error: params.error.clone(),
            };
            self.record(&params.session_id, &params.org_id, event).await;
            Ok(())
        })
    }
}
