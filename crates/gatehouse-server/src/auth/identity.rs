//! Identity & authorization gate.
//!
//! Turns a bearer token into a subject, the subject into a user/org context,
//! and a connection name into a connection snapshot. Runs once per handshake.

use super::rate_limit::RateLimiter;
use crate::store::{Connection, Store, UserContext};
use gatehouse_core::{create_token, verify_token, BoxFuture, GateError, GateResult};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Subject every token maps to in dev mode.
pub const DEV_SUBJECT: &str = "test-user";

/// Verifies access tokens issued by an identity provider.
pub trait IdentityProvider: Send + Sync {
    /// Return the token's subject, or `Unauthenticated`.
    fn verify_access_token<'a>(&'a self, token: &'a str) -> BoxFuture<'a, GateResult<String>>;
}

/// Provider for HMAC-signed bearer tokens minted with the gateway secret.
pub struct HmacTokenProvider {
    secret: Vec<u8>,
}

impl HmacTokenProvider {
    pub fn new(secret: Vec<u8>) -> Self {
        Self { secret }
    }

    /// Issue a token for `subject` valid for `ttl_secs`.
    pub fn mint(&self, subject: &str, ttl_secs: u64) -> GateResult<String> {
        create_token(&self.secret, subject, ttl_secs)
    }
}

impl IdentityProvider for HmacTokenProvider {
    fn verify_access_token<'a>(&'a self, token: &'a str) -> BoxFuture<'a, GateResult<String>> {
        Box::pin(async move { verify_token(&self.secret, token) })
    }
}

pub struct IdentityGate {
    provider: Arc<dyn IdentityProvider>,
    store: Arc<dyn Store>,
    /// Explicit bypass; never inferred from the token.
    dev_mode: bool,
    limiter: Mutex<RateLimiter>,
}

impl IdentityGate {
    pub fn new(
        provider: Arc<dyn IdentityProvider>,
        store: Arc<dyn Store>,
        dev_mode: bool,
        limiter: RateLimiter,
    ) -> Self {
        Self {
            provider,
            store,
            dev_mode,
            limiter: Mutex::new(limiter),
        }
    }

    /// Exchange a bearer token for a subject.
    pub async fn exchange_token(&self, token: &str, remote: Option<IpAddr>) -> GateResult<String> {
        if let Some(ip) = remote {
            if !self.limiter.lock().await.check_ip(&ip) {
                warn!(remote = %ip, "token exchange rate limited");
                return Err(GateError::Unauthenticated(
                    "too many authentication attempts".into(),
                ));
            }
        }
        if self.dev_mode {
            return Ok(DEV_SUBJECT.to_string());
        }
        if token.is_empty() {
            return Err(GateError::Unauthenticated("missing bearer token".into()));
        }
        self.provider.verify_access_token(token).await.map_err(|e| {
            debug!(error = %e, "token verification failed");
            GateError::Unauthenticated("invalid authentication".into())
        })
    }

    /// Resolve the user and org for a subject. Unknown subjects and lookup
    /// failures are both reported as `Unauthenticated`.
    pub async fn resolve_user_context(&self, subject: &str) -> GateResult<UserContext> {
        match self.store.find_user_by_subject(subject).await {
            Ok(Some(ctx)) => Ok(ctx),
            Ok(None) => Err(GateError::Unauthenticated("invalid authentication".into())),
            Err(e) => {
                warn!(subject = %subject, error = %e, "user lookup failed");
                Err(GateError::Unauthenticated("invalid authentication".into()))
            }
        }
    }

    /// Resolve a connection by name for the caller.
    pub async fn resolve_connection(&self, ctx: &UserContext, name: &str) -> GateResult<Connection> {
        match self.store.find_connection(ctx, name).await {
            Ok(Some(conn)) => Ok(conn),
            Ok(None) => Err(GateError::NotFound(format!("connection '{name}' not found"))),
            Err(e) => Err(GateError::Internal(e.to_string())),
        }
    }

    /// Run token exchange, user resolution and connection resolution,
    /// stopping at the first failure.
    #[cfg(test)]
    pub async fn authorize(
        &self,
        token: &str,
        remote: Option<IpAddr>,
        connection_name: &str,
    ) -> GateResult<(UserContext, Connection)> {
        let subject = self.exchange_token(token, remote).await?;
        let ctx = self.resolve_user_context(&subject).await?;
        let conn = self.resolve_connection(&ctx, connection_name).await?;
        Ok((ctx, conn))
    }

    /// Drop expired rate-limit entries.
    pub async fn gc(&self) -> usize {
        let mut limiter = self.limiter.lock().await;
        limiter.gc();
        limiter.tracked_keys()
    }
}
