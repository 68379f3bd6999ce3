//! Interception hook chain.
//!
//! Plugins observe or veto a session at three points:
//!
//! - **connect**: after authorization, before the session is bound or the
//!   agent notified. A veto aborts the handshake with no side effects.
//! - **receive**: for every non-keep-alive client packet before it is
//!   forwarded. A veto ends the session.
//! - **disconnect**: once per teardown. Failures are logged by the caller and
//!   never block cleanup.
//!
//! Plugins run in registration order and the first veto in a phase wins.

pub mod access_control;
pub mod audit;

pub use access_control::AccessControlPlugin;
pub use audit::AuditPlugin;

use crate::store::UserContext;
use gatehouse_core::{BoxFuture, Packet};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Session attributes handed to connect hooks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectParams {
    pub session_id: String,
    pub connection_id: String,
    pub connection_name: String,
    pub connection_type: String,
    pub org_id: String,
    pub user_id: String,
    pub hostname: String,
    pub machine_id: String,
    pub kernel_version: String,
}

/// Per-session context handed to receive hooks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveContext {
    pub session_id: String,
    pub org_id: String,
    pub connection_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectParams {
    pub session_id: String,
    pub org_id: String,
    /// Error that ended the session, if it did not end gracefully.
    pub error: Option<String>,
}

/// A hook refused the session or packet.
#[derive(Debug, Clone, Error)]
#[error("plugin {plugin} rejected: {reason}")]
pub struct PluginRejected {
    pub plugin: String,
    pub reason: String,
}

impl PluginRejected {
    pub fn new(plugin: &str, reason: impl Into<String>) -> Self {
        Self {
            plugin: plugin.to_string(),
            reason: reason.into(),
        }
    }
}

pub type HookResult = Result<(), PluginRejected>;

/// An interception plugin. Every phase accepts by default.
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn on_connect<'a>(
        &'a self,
        _params: &'a ConnectParams,
        _ctx: &'a UserContext,
    ) -> BoxFuture<'a, HookResult> {
        Box::pin(async { Ok(()) })
    }

    fn on_receive<'a>(
        &'a self,
        _ctx: &'a ReceiveContext,
        _packet: &'a Packet,
    ) -> BoxFuture<'a, HookResult> {
        Box::pin(async { Ok(()) })
    }

    fn on_disconnect<'a>(&'a self, _params: &'a DisconnectParams) -> BoxFuture<'a, HookResult> {
        Box::pin(async { Ok(()) })
    }
}

/// Ordered list of plugins.
#[derive(Clone, Default)]
pub struct HookChain {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl HookChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a plugin; it runs after those already registered.
    pub fn register(&mut self, plugin: Arc<dyn Plugin>) {
        debug!(plugin = %plugin.name(), "plugin registered");
        self.plugins.push(plugin);
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub async fn on_connect(&self, params: &ConnectParams, ctx: &UserContext) -> HookResult {
        for plugin in &self.plugins {
            plugin.on_connect(params, ctx).await?;
        }
        Ok(())
    }

    pub async fn on_receive(&self, ctx: &ReceiveContext, packet: &Packet) -> HookResult {
        for plugin in &self.plugins {
            plugin.on_receive(ctx, packet).await?;
        }
        Ok(())
    }

    pub async fn on_disconnect(&self, params: &DisconnectParams) -> HookResult {
        for plugin in &self.plugins {
            plugin.on_disconnect(params).await?;
        }
        Ok(())
    }
}
