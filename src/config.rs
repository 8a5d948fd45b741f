//! Bridge configuration.
//!
//! Settings are read as JSON, either from the `GUEST_BRIDGE_CONFIG`
//! environment variable or from a file given on the command line. Every
//! field has a default, so `{}` is a valid configuration.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Environment variable holding the JSON configuration.
pub const CONFIG_ENV: &str = "GUEST_BRIDGE_CONFIG";

/// Tunables shared by the host meta-service and the guest agent.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Upper bound on how long a long-poll request is held open.
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_seconds: u64,

    /// Largest chunk moved in a single stream request.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Unacknowledged bytes a stream may buffer before writers stall.
    #[serde(default = "default_max_buffered")]
    pub max_buffered_bytes: usize,

    /// Client-side timeout for a single HTTP request. Must exceed the
    /// long-poll timeout.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,

    /// How many times the guest retries a failed stream request.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Base backoff between retries, multiplied by the attempt number.
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,

    /// How long a completed session stays addressable.
    #[serde(default = "default_session_retention")]
    pub session_retention_seconds: u64,

    /// Interval between reaper sweeps.
    #[serde(default = "default_reaper_interval")]
    pub reaper_interval_seconds: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_timeout_seconds: default_poll_timeout(),
            chunk_size: default_chunk_size(),
            max_buffered_bytes: default_max_buffered(),
            request_timeout_seconds: default_request_timeout(),
            retry_attempts: default_retry_attempts(),
            retry_backoff_ms: default_retry_backoff(),
            session_retention_seconds: default_session_retention(),
            reaper_interval_seconds: default_reaper_interval(),
        }
    }
}

impl Config {
    /// Load configuration from `GUEST_BRIDGE_CONFIG`, or defaults if unset.
    pub fn from_env() -> Result<Self> {
        match std::env::var(CONFIG_ENV) {
            Ok(json) => Self::from_json(&json).with_context(|| format!("Failed to parse {CONFIG_ENV}")),
            Err(_) => Ok(Self::default()),
        }
    }

    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_json(&json).with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Parse configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Invalid configuration JSON")?;
        anyhow::ensure!(config.chunk_size > 0, "chunk_size must be positive");
        anyhow::ensure!(
            config.request_timeout_seconds > config.poll_timeout_seconds,
            "request_timeout_seconds ({}) must exceed poll_timeout_seconds ({})",
            config.request_timeout_seconds,
            config.poll_timeout_seconds
        );
        Ok(config)
    }

    pub const fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_seconds)
    }

    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    pub const fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub const fn session_retention(&self) -> Duration {
        Duration::from_secs(self.session_retention_seconds)
    }

    pub const fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_seconds)
    }
}

const fn default_poll_timeout() -> u64 {
    20
}

const fn default_chunk_size() -> usize {
    64 * 1024
}

const fn default_max_buffered() -> usize {
    1024 * 1024
}

const fn default_request_timeout() -> u64 {
    60
}

const fn default_retry_attempts() -> u32 {
    5
}

const fn default_retry_backoff() -> u64 {
    200
}

const fn default_session_retention() -> u64 {
    300
}

const fn default_reaper_interval() -> u64 {
    60
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_uses_defaults() {
        let config = Config::from_json("{}").unwrap();
        assert_eq!(config.poll_timeout(), Duration::from_secs(20));
        assert_eq!(config.chunk_size, 64 * 1024);
        assert_eq!(config.max_buffered_bytes, 1024 * 1024);
        assert_eq!(config.retry_attempts, 5);
        assert_eq!(config.session_retention(), Duration::from_secs(300));
    }

    #[test]
    fn partial_override() {
        let config = Config::from_json(r#"{"poll_timeout_seconds": 2, "chunk_size": 4096}"#).unwrap();
        assert_eq!(config.poll_timeout(), Duration::from_secs(2));
        assert_eq!(config.chunk_size, 4096);
        // untouched fields keep defaults
        assert_eq!(config.request_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn rejects_request_timeout_below_poll_timeout() {
        let err = Config::from_json(r#"{"poll_timeout_seconds": 30, "request_timeout_seconds": 10}"#)
            .unwrap_err();
        assert!(format!("{err:#}").contains("must exceed"));
    }

    #[test]
    fn rejects_zero_chunk_size() {
        assert!(Config::from_json(r#"{"chunk_size": 0}"#).is_err());
    }

    #[test]
    fn from_file_reads_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.json");
        std::fs::write(&path, r#"{"max_buffered_bytes": 8192}"#).unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.max_buffered_bytes, 8192);
    }

    #[test]
    fn from_file_missing() {
        let err = Config::from_file(Path::new("/nonexistent/bridge.json")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
