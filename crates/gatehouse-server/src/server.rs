//! Core server: accepts TCP connections, optionally terminates TLS, and hands
//! each stream to the WebSocket transport.

use crate::config::ServerConfig;
use crate::gateway::Gateway;
use crate::transport::websocket;
use gatehouse_core::{GateError, GateResult};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

/// Interval between rate-limiter sweeps.
const GC_INTERVAL: Duration = Duration::from_secs(60);

pub struct GatewayServer {
    gateway: Arc<Gateway>,
    listen: SocketAddr,
    channel_capacity: usize,
    tls: Option<TlsAcceptor>,
}

impl GatewayServer {
    pub fn new(
        config: &ServerConfig,
        gateway: Arc<Gateway>,
        tls: Option<Arc<rustls::ServerConfig>>,
    ) -> Self {
        Self {
            gateway,
            listen: config.listen,
            channel_capacity: config.channel_capacity,
            tls: tls.map(TlsAcceptor::from),
        }
    }

    /// Accept connections until `shutdown` resolves, then close every bound
    /// stream.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> GateResult<()> {
        let listener = TcpListener::bind(self.listen)
            .await
            .map_err(|e| GateError::Transport(format!("bind {} failed: {e}", self.listen)))?;
        self.serve(listener, shutdown).await
    }

    /// Like [`run`](Self::run) on an already bound listener.
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()>,
    ) -> GateResult<()> {
        let local = listener.local_addr()?;
        info!(addr = %local, tls = self.tls.is_some(), "gatehouse ready");

        let gc_gateway = self.gateway.clone();
        let gc = tokio::spawn(async move {
            let mut interval = tokio::time::interval(GC_INTERVAL);
            loop {
                interval.tick().await;
                let tracked = gc_gateway.identity().gc().await;
                debug!(tracked, "rate limiter sweep");
            }
        });

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok((tcp, remote)) => self.spawn_connection(tcp, remote),
                    Err(e) => warn!(error = %e, "TCP accept failed"),
                },
            }
        }

        gc.abort();
        let registry = self.gateway.registry();
        let sessions = registry.session_count().await;
        let agents = registry.agent_count().await;
        info!(sessions, agents, "closing bound streams");
        registry.close_all().await;
        Ok(())
    }

    fn spawn_connection(&self, tcp: TcpStream, remote: SocketAddr) {
        let gateway = self.gateway.clone();
        let capacity = self.channel_capacity;
        let tls = self.tls.clone();
        tokio::spawn(async move {
            let result = match tls {
                Some(acceptor) => match acceptor.accept(tcp).await {
                    Ok(stream) => websocket::serve_connection(gateway, stream, remote, capacity).await,
                    Err(e) => Err(GateError::Transport(format!("TLS handshake failed: {e}"))),
                },
                None => websocket::serve_connection(gateway, tcp, remote, capacity).await,
            };
            if let Err(e) = result {
                debug!(remote = %remote, error = %e, "connection ended with error");
            }
        });
    }
}
