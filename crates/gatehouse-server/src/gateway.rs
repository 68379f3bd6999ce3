//! The relay component: owns the registry, identity gate, store and hooks,
//! and is shared by every client and agent stream task.

use crate::auth::IdentityGate;
use crate::plugins::HookChain;
use crate::relay::SessionRegistry;
use crate::store::Store;
use std::sync::Arc;

pub struct Gateway {
    pub(crate) registry: Arc<SessionRegistry>,
    pub(crate) identity: IdentityGate,
    pub(crate) store: Arc<dyn Store>,
    pub(crate) hooks: HookChain,
}

impl Gateway {
    pub fn new(
        registry: Arc<SessionRegistry>,
        identity: IdentityGate,
        store: Arc<dyn Store>,
        hooks: HookChain,
    ) -> Self {
        Self {
            registry,
            identity,
            store,
            hooks,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn identity(&self) -> &IdentityGate {
        &self.identity
    }
}
