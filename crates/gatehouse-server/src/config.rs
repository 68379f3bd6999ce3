//! Gateway configuration: TOML file + CLI overrides.

use crate::store::SecretProvider;
use gatehouse_core::{GateError, GateResult};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub plugins: PluginsSection,
    #[serde(default)]
    pub users: Vec<UserEntry>,
    #[serde(default)]
    pub connections: Vec<ConnectionEntry>,
    #[serde(default)]
    pub agents: Vec<AgentEntry>,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_listen")]
    pub listen: String,
    pub cert: Option<String>,
    pub key: Option<String>,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            cert: None,
            key: None,
            channel_capacity: default_channel_capacity(),
        }
    }
}

/// `[auth]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthSection {
    /// Accept any bearer token as the fixed `test-user` subject.
    #[serde(default)]
    pub dev_mode: bool,
    /// HMAC secret used to sign and verify bearer tokens.
    pub token_secret: Option<String>,
    #[serde(default = "default_rate_limit_attempts")]
    pub rate_limit_attempts: u32,
    #[serde(default = "default_rate_limit_window")]
    pub rate_limit_window_secs: u64,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            dev_mode: false,
            token_secret: None,
            rate_limit_attempts: default_rate_limit_attempts(),
            rate_limit_window_secs: default_rate_limit_window(),
        }
    }
}

/// `[plugins]` section of the config TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PluginsSection {
    /// Directory for per-session audit logs. Auditing is off when unset.
    pub audit_dir: Option<String>,
    /// Connection name -> groups allowed to open it.
    #[serde(default)]
    pub access_control: HashMap<String, Vec<String>>,
}

/// `[[users]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct UserEntry {
    pub id: String,
    pub org_id: String,
    pub subject: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub groups: Vec<String>,
}

/// `[[connections]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionEntry {
    pub id: String,
    pub org_id: String,
    pub name: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(rename = "type", default = "default_connection_type")]
    pub connection_type: String,
    #[serde(default)]
    pub provider: SecretProvider,
    #[serde(default)]
    pub secret: HashMap<String, String>,
    pub agent_id: String,
    #[serde(default)]
    pub created_by: String,
}

/// `[[agents]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentEntry {
    pub id: String,
    pub org_id: String,
    #[serde(default)]
    pub name: String,
    pub token: String,
}

fn default_listen() -> String {
    "0.0.0.0:8010".to_string()
}
fn default_channel_capacity() -> usize {
    256
}
fn default_rate_limit_attempts() -> u32 {
    20
}
fn default_rate_limit_window() -> u64 {
    60
}
fn default_connection_type() -> String {
    "command-line".to_string()
}

/// Command-line values that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub listen: Option<String>,
    pub cert: Option<String>,
    pub key: Option<String>,
    pub dev_mode: bool,
}

/// Resolved gateway configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    pub channel_capacity: usize,
    pub dev_mode: bool,
    pub token_secret: Option<Vec<u8>>,
    pub rate_limit_attempts: u32,
    pub rate_limit_window_secs: u64,
    pub audit_dir: Option<PathBuf>,
    pub access_control: HashMap<String, Vec<String>>,
    pub users: Vec<UserEntry>,
    pub connections: Vec<ConnectionEntry>,
    pub agents: Vec<AgentEntry>,
}

impl ServerConfig {
    /// Load config from a TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, overrides: Overrides) -> GateResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    parse(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };
        Self::resolve(file_config, overrides)
    }

    /// Merge a parsed file with CLI overrides.
    pub fn resolve(file: ConfigFile, overrides: Overrides) -> GateResult<Self> {
        let listen_str = overrides.listen.unwrap_or(file.server.listen);
        let listen: SocketAddr = listen_str
            .parse()
            .map_err(|e| GateError::Config(format!("invalid listen address {listen_str:?}: {e}")))?;

        let cert = overrides.cert.or(file.server.cert);
        let key = overrides.key.or(file.server.key);
        if cert.is_some() != key.is_some() {
            return Err(GateError::Config(
                "both cert and key are required to enable TLS".into(),
            ));
        }

        let dev_mode = overrides.dev_mode || file.auth.dev_mode;
        if dev_mode {
            warn!("dev mode enabled: every bearer token authenticates as test-user");
        }

        Ok(Self {
            listen,
            cert_path: cert.as_deref().map(expand_tilde_str),
            key_path: key.as_deref().map(expand_tilde_str),
            channel_capacity: file.server.channel_capacity,
            dev_mode,
            token_secret: file.auth.token_secret.map(String::into_bytes),
            rate_limit_attempts: file.auth.rate_limit_attempts,
            rate_limit_window_secs: file.auth.rate_limit_window_secs,
            audit_dir: file.plugins.audit_dir.as_deref().map(expand_tilde_str),
            access_control: file.plugins.access_control,
            users: file.users,
            connections: file.connections,
            agents: file.agents,
        })
    }
}

/// Parse config TOML.
pub fn parse(content: &str) -> GateResult<ConfigFile> {
    toml::from_str::<ConfigFile>(content)
        .map_err(|e| GateError::Config(format!("config parse error: {e}")))
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
