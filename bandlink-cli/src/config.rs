//! Load config from file and environment.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use bandlink_core::{HandshakeConfig, TransferConfig, CHUNK_BYTES, STORAGE_QUOTA};
use serde::Deserialize;

/// Host configuration. File: ~/.config/bandlink/config.toml or /etc/bandlink/config.toml.
/// Env overrides: BANDLINK_BIND_ADDR, BANDLINK_PEER_ADDR, BANDLINK_PEER_ID,
/// BANDLINK_HANDSHAKE_TIMEOUT_MS, BANDLINK_HEARTBEAT_TIMEOUT_MS, BANDLINK_CHUNK_BYTES,
/// BANDLINK_STORAGE_QUOTA, BANDLINK_LOG.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Local UDP address (default 0.0.0.0:45680).
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,
    /// Where the peer listens (default 127.0.0.1:45681).
    #[serde(default = "default_peer_addr")]
    pub peer_addr: SocketAddr,
    /// Peer application id used as the envelope destination.
    #[serde(default = "default_peer_id")]
    pub peer_id: String,
    #[serde(default = "default_timeout_ms")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    #[serde(default = "default_chunk_bytes")]
    pub chunk_bytes: u64,
    /// Device usage in bytes above which a transfer is refused.
    #[serde(default = "default_storage_quota")]
    pub storage_quota: u64,
    /// Tracing filter used when RUST_LOG is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 45680))
}
fn default_peer_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 45681))
}
fn default_peer_id() -> String {
    "com.bandbbs.ebook".into()
}
fn default_timeout_ms() -> u64 {
    3000
}
fn default_chunk_bytes() -> u64 {
    CHUNK_BYTES
}
fn default_storage_quota() -> u64 {
    STORAGE_QUOTA
}
fn default_log_level() -> String {
    "info".into()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            peer_addr: default_peer_addr(),
            peer_id: default_peer_id(),
            handshake_timeout_ms: default_timeout_ms(),
            heartbeat_timeout_ms: default_timeout_ms(),
            chunk_bytes: default_chunk_bytes(),
            storage_quota: default_storage_quota(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    pub fn handshake_config(&self) -> HandshakeConfig {
        HandshakeConfig {
            attempt_timeout: Duration::from_millis(self.handshake_timeout_ms),
            heartbeat_timeout: Duration::from_millis(self.heartbeat_timeout_ms),
        }
    }

    pub fn transfer_config(&self) -> TransferConfig {
        TransferConfig {
            chunk_bytes: self.chunk_bytes.max(1),
            storage_quota: self.storage_quota,
        }
    }

    /// Apply BANDLINK_* environment overrides. Unparseable values are ignored.
    pub fn with_env(mut self) -> Self {
        self.apply_env(|key| std::env::var(key).ok());
        self
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        override_from(&var, "BANDLINK_BIND_ADDR", &mut self.bind_addr);
        override_from(&var, "BANDLINK_PEER_ADDR", &mut self.peer_addr);
        override_from(&var, "BANDLINK_PEER_ID", &mut self.peer_id);
        override_from(&var, "BANDLINK_HANDSHAKE_TIMEOUT_MS", &mut self.handshake_timeout_ms);
        override_from(&var, "BANDLINK_HEARTBEAT_TIMEOUT_MS", &mut self.heartbeat_timeout_ms);
        override_from(&var, "BANDLINK_CHUNK_BYTES", &mut self.chunk_bytes);
        override_from(&var, "BANDLINK_STORAGE_QUOTA", &mut self.storage_quota);
        override_from(&var, "BANDLINK_LOG", &mut self.log_level);
    }
}

fn override_from<T: FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    if let Some(v) = var(key).and_then(|s| s.parse().ok()) {
        *slot = v;
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Load config: merge default, then config file (if present), then env vars. A broken
/// file is reported alongside the defaults it was replaced with.
pub fn load() -> (Config, Option<ConfigError>) {
    let (c, err) = match load_file(&config_paths()) {
        Ok(c) => (c.unwrap_or_default(), None),
        Err(e) => (Config::default(), Some(e)),
    };
    (c.with_env(), err)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/bandlink/config.toml"));
    }
    out.push(PathBuf::from("/etc/bandlink/config.toml"));
    out
}

fn load_file(paths: &[PathBuf]) -> Result<Option<Config>, ConfigError> {
    let Some(path) = paths.iter().find(|p| p.exists()) else {
        return Ok(None);
    };
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.clone(),
        source,
    })?;
    toml::from_str(&s)
        .map(Some)
        .map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })
}
