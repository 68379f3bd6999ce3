//! gatehouse: access gateway.
//!
//! Accepts WebSocket streams from clients and agents, authenticates and
//! authorizes each client session, and relays packets between a client and
//! the agent serving its connection.

mod auth;
mod config;
mod gateway;
mod handshake;
mod plugins;
mod relay;
mod server;
mod store;
#[cfg(test)]
mod testutil;
mod tls;
mod transport;

use auth::{HmacTokenProvider, IdentityGate, RateLimiter};
use clap::{Parser, Subcommand};
use config::{Overrides, ServerConfig};
use gatehouse_core::{generate_secret, GateError, GateResult};
use gateway::Gateway;
use plugins::{AccessControlPlugin, AuditPlugin, HookChain};
use relay::SessionRegistry;
use server::GatewayServer;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use store::MemoryStore;
use tracing::{error, info, warn};

/// gatehouse: access gateway
#[derive(Parser, Debug)]
#[command(name = "gatehouse", version, about = "Access gateway relaying client sessions to agents")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Config file path
    #[arg(long, default_value = "~/.gatehouse/config.toml")]
    config: String,

    /// Listen address, e.g. 0.0.0.0:8010
    #[arg(long)]
    listen: Option<String>,

    /// TLS certificate (PEM)
    #[arg(long)]
    cert: Option<String>,

    /// TLS private key (PEM)
    #[arg(long)]
    key: Option<String>,

    /// Generate self-signed certificate for development
    #[arg(long)]
    generate_cert: bool,

    /// Authenticate every bearer token as the fixed test subject
    #[arg(long)]
    dev_mode: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Mint a bearer token for a subject using the configured secret
    Token {
        /// Subject the token identifies
        subject: String,

        /// Lifetime in seconds
        #[arg(long, default_value_t = 3600)]
        ttl: u64,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    if let Err(e) = run(cli).await {
        error!(error = %e, "gatehouse failed");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> GateResult<()> {
    let (cert, key) = if cli.generate_cert {
        let dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".gatehouse");
        let (c, k) = tls::generate_dev_cert(&dir)?;
        info!(cert = %c.display(), key = %k.display(), "generated self-signed certificate");
        (
            Some(c.to_string_lossy().into_owned()),
            Some(k.to_string_lossy().into_owned()),
        )
    } else {
        (cli.cert, cli.key)
    };

    let config = ServerConfig::load(
        Some(Path::new(&cli.config)),
        Overrides {
            listen: cli.listen,
            cert,
            key,
            dev_mode: cli.dev_mode,
        },
    )?;

    if let Some(Command::Token { subject, ttl }) = cli.command {
        let secret = config.token_secret.clone().ok_or_else(|| {
            GateError::Config("auth.token_secret must be set to mint tokens".into())
        })?;
        let token = HmacTokenProvider::new(secret).mint(&subject, ttl)?;
        println!("{token}");
        return Ok(());
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        listen = %config.listen,
        "starting gatehouse"
    );

    let tls = match (&config.cert_path, &config.key_path) {
        (Some(cert), Some(key)) => Some(Arc::new(tls::load_server_config(cert, key)?)),
        _ => {
            warn!("no TLS certificate configured, serving plain WebSocket");
            None
        }
    };

    let gateway = Arc::new(build_gateway(&config)?);
    GatewayServer::new(&config, gateway, tls)
        .run(shutdown_signal())
        .await?;

    info!("gatehouse stopped");
    Ok(())
}

/// Wire the store, identity gate and plugins from config.
fn build_gateway(config: &ServerConfig) -> GateResult<Gateway> {
    let store = Arc::new(MemoryStore::new(
        &config.users,
        &config.connections,
        &config.agents,
    ));
    info!(
        users = config.users.len(),
        connections = config.connections.len(),
        agents = config.agents.len(),
        "store loaded"
    );

    let secret = match &config.token_secret {
        Some(secret) => secret.clone(),
        None => {
            warn!("no auth.token_secret configured, generated an ephemeral one; tokens will not survive a restart");
            generate_secret()?
        }
    };
    let identity = IdentityGate::new(
        Arc::new(HmacTokenProvider::new(secret)),
        store.clone(),
        config.dev_mode,
        RateLimiter::new(config.rate_limit_attempts, config.rate_limit_window_secs),
    );

    let mut hooks = HookChain::new();
    if !config.access_control.is_empty() {
        hooks.register(Arc::new(AccessControlPlugin::new(
            config.access_control.clone(),
        )));
    }
    if let Some(dir) = &config.audit_dir {
        info!(path = %dir.display(), "audit trail enabled");
        hooks.register(Arc::new(AuditPlugin::new(dir.clone())));
    }
    if hooks.is_empty() {
        info!("no plugins configured");
    } else {
        info!(plugins = hooks.len(), "hook chain ready");
    }

    Ok(Gateway::new(
        Arc::new(SessionRegistry::new()),
        identity,
        store,
        hooks,
    ))
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }

    info!("received shutdown signal");
}
