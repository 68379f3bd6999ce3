//! Group-based access control on connect.
//!
//! A connection listed in the rules may only be opened by users sharing at
//! least one group with its allow-list. Unlisted connections are open.

use super::{ConnectParams, HookResult, Plugin, PluginRejected};
use crate::store::UserContext;
use gatehouse_core::BoxFuture;
use std::collections::HashMap;
use tracing::info;

pub struct AccessControlPlugin {
    /// Connection name → allowed groups.
    rules: HashMap<String, Vec<String>>,
}

impl AccessControlPlugin {
    pub const NAME: &'static str = "access_control";

    pub fn new(rules: HashMap<String, Vec<String>>) -> Self {
        Self { rules }
    }

    fn check(&self, params: &ConnectParams, ctx: &UserContext) -> HookResult {
        let Some(allowed) = self.rules.get(&params.connection_name) else {
            return Ok(());
        };
        if ctx.user.groups.iter().any(|g| allowed.contains(g)) {
            return Ok(());
        }
        info!(
            session_id = %params.session_id,
            user_id = %params.user_id,
            connection = %params.connection_name,
            "access denied by group rules"
        );
        Err(PluginRejected::new(
            Self::NAME,
            format!(
                "user {} has no access to connection {}",
                ctx.user.email, params.connection_name
            ),
        ))
    }
}

impl Plugin for AccessControlPlugin {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn on_connect<'a>(
        &'a self,
        params: &'a ConnectParams,
        ctx: &'a UserContext,
    ) -> BoxFuture<'a, HookResult> {
        Box::pin(async move { self.check(params, ctx) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Org, User};

    fn ctx(groups: &[&str]) -> UserContext {
        UserContext {
            user: User {
                id: "u1".into(),
                org_id: "o1".into(),
                subject: "alice".into(),
                email: "alice@example.com".into(),
                groups: groups.iter().map(|g| g.to_string()).collect(),
            },
            org: Org { id: "o1".into() },
        }
    }

    fn params(connection: &str) -> ConnectParams {
        ConnectParams {
            session_id: "s1".into(),
            connection_id: "c1".into(),
            connection_name: connection.into(),
            connection_type: "postgres".into(),
            org_id: "o1".into(),
            user_id: "u1".into(),
            hostname: String::new(),
            machine_id: String::new(),
            kernel_version: String::new(),
        }
    }

    fn plugin() -> AccessControlPlugin {
        AccessControlPlugin::new(HashMap::from([(
            "prod-db".to_string(),
            vec!["dba".to_string(), "sre".to_string()],
        )]))
    }

    #[tokio::test]
    async fn member_of_allowed_group_passes() {
        assert!(plugin().on_connect(&params("prod-db"), &ctx(&["sre"])).await.is_ok());
    }

    #[tokio::test]
    async fn non_member_is_rejected() {
        let err = plugin()
            .on_connect(&params("prod-db"), &ctx(&["dev"]))
            .await
            .unwrap_err();
        assert_eq!(err.plugin, AccessControlPlugin::NAME);
    }

    #[tokio::test]
    async fn unlisted_connection_is_open() {
        assert!(plugin().on_connect(&params("staging"), &ctx(&[])).await.is_ok());
    }
}
