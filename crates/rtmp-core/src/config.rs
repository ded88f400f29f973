//! Configuration for rtmpd.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $RTMPD_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/rtmpd/config.toml
//!   3. ~/.config/rtmpd/config.toml

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::wire::MAX_CHUNK_SIZE;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RtmpConfig {
    /// Acknowledgement window announced to peers on connect.
    pub ack_window: u32,
    /// Client buffer length assumed until the peer sets one.
    pub buflen_ms: u32,
    pub server: ServerConfig,
    pub chunk: ChunkConfig,
    pub timeouts: TimeoutConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    /// Execution contexts. Each owns its own buffer pools.
    pub workers: usize,
    /// Applications a client may connect to. Empty = any.
    pub applications: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkConfig {
    /// Outbound chunk size, announced on connect.
    pub chunk_size: u32,
    /// Chunk-stream ids at or above this are a protocol violation.
    pub max_streams: u32,
    /// Largest message length a peer may declare.
    pub max_message: u32,
    /// Outbound queue capacity in messages.
    pub out_queue: usize,
    /// Low-priority sends are held back while fewer messages are queued.
    pub out_cork: usize,
    /// Repeat the extended timestamp on continuation chunks we send.
    pub play_time_fix: bool,
    /// Expect the extended timestamp on continuation chunks we receive.
    pub publish_time_fix: bool,
    /// Never cork, and treat a session idle for a whole ping interval as
    /// dead instead of pinging it.
    pub busy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Handshake I/O timeout.
    pub timeout_ms: u64,
    /// Keepalive interval. 0 = disabled.
    pub ping_ms: u64,
    /// How long to wait for a ping response.
    pub ping_timeout_ms: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for RtmpConfig {
    fn default() -> Self {
        Self {
            ack_window: 5_000_000,
            buflen_ms: 1000,
            server: ServerConfig::default(),
            chunk: ChunkConfig::default(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 1935)),
            workers: 1,
            applications: Vec::new(),
        }
    }
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            chunk_size: 4096,
            max_streams: 32,
            max_message: 1_048_576, // 1 MB
            out_queue: 256,
            out_cork: 32,
            play_time_fix: true,
            publish_time_fix: true,
            busy: false,
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 60_000,
            ping_ms: 60_000,
            ping_timeout_ms: 30_000,
        }
    }
}

impl TimeoutConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn ping(&self) -> Option<Duration> {
        (self.ping_ms > 0).then(|| Duration::from_millis(self.ping_ms))
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
        .join("rtmpd")
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid setting {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl RtmpConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            RtmpConfig::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("RTMPD_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&RtmpConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text)
                .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Reject values the protocol engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |key, reason: &str| ConfigError::Invalid { key, reason: reason.to_string() };
        if self.chunk.chunk_size == 0 || self.chunk.chunk_size as usize > MAX_CHUNK_SIZE {
            return Err(invalid("chunk.chunk_size", "must be within 1..=10485760"));
        }
        if self.chunk.max_streams < 3 {
            return Err(invalid("chunk.max_streams", "must admit the control and command streams"));
        }
        if self.chunk.out_queue == 0 {
            return Err(invalid("chunk.out_queue", "must be positive"));
        }
        if self.server.workers == 0 {
            return Err(invalid("server.workers", "must be positive"));
        }
        Ok(())
    }

    /// Apply RTMPD_* overrides. `lookup` resolves a variable name.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn flag(v: &str) -> bool {
            v == "true" || v == "1"
        }

        if let Some(v) = lookup("RTMPD_SERVER__LISTEN").and_then(|v| v.parse().ok()) {
            self.server.listen = v;
        }
        if let Some(v) = lookup("RTMPD_SERVER__WORKERS").and_then(|v| v.parse().ok()) {
            self.server.workers = v;
        }
        if let Some(v) = lookup("RTMPD_SERVER__APPLICATIONS") {
            self.server.applications = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(v) = lookup("RTMPD_CHUNK__CHUNK_SIZE").and_then(|v| v.parse().ok()) {
            self.chunk.chunk_size = v;
        }
        if let Some(v) = lookup("RTMPD_CHUNK__MAX_STREAMS").and_then(|v| v.parse().ok()) {
            self.chunk.max_streams = v;
        }
        if let Some(v) = lookup("RTMPD_CHUNK__MAX_MESSAGE").and_then(|v| v.parse().ok()) {
            self.chunk.max_message = v;
        }
        if let Some(v) = lookup("RTMPD_CHUNK__BUSY") {
            self.chunk.busy = flag(&v);
        }
        if let Some(v) = lookup("RTMPD_ACK_WINDOW").and_then(|v| v.parse().ok()) {
            self.ack_window = v;
        }
        if let Some(v) = lookup("RTMPD_TIMEOUTS__PING_MS").and_then(|v| v.parse().ok()) {
            self.timeouts.ping_ms = v;
        }
        if let Some(v) = lookup("RTMPD_TIMEOUTS__TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.timeouts.timeout_ms = v;
        }
    }
}
