// =============================================================================
// Runtime Configuration — file-backed server settings with atomic save
// =============================================================================
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file. A handful of env vars override
// the file for containerized deployments.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_database_path() -> String {
    "replay.db".to_string()
}

fn default_vendor_base_url() -> String {
    "https://api.binance.com".to_string()
}

fn default_tick_interval_ms() -> u64 {
    200
}

fn default_ping_interval_secs() -> u64 {
    15
}

fn default_event_queue_capacity() -> usize {
    256
}

fn default_vendor_request_spacing_ms() -> u64 {
    100
}

// =============================================================================
// RuntimeConfig
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Address the HTTP/WebSocket server binds to.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// SQLite database file path.
    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// Base URL of the market-data vendor.
    #[serde(default = "default_vendor_base_url")]
    pub vendor_base_url: String,

    /// Real-time cadence of the paced ticker, per session.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Server ping cadence; the read deadline is twice this.
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,

    /// Bounded outbound frame queue per session. Overflow drops the client.
    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,

    /// Minimum spacing between vendor requests, process-wide.
    #[serde(default = "default_vendor_request_spacing_ms")]
    pub vendor_request_spacing_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            database_path: default_database_path(),
            vendor_base_url: default_vendor_base_url(),
            tick_interval_ms: default_tick_interval_ms(),
            ping_interval_secs: default_ping_interval_secs(),
            event_queue_capacity: default_event_queue_capacity(),
            vendor_request_spacing_ms: default_vendor_request_spacing_ms(),
        }
    }
}

impl RuntimeConfig {
    /// Load from a JSON file; missing file falls back to defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!(path = %path.display(), "no config file — using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        info!(path = %path.display(), "config loaded");
        Ok(config)
    }

    /// Atomically write the config (tmp file + rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self).context("failed to serialize config")?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("failed to rename {} into place", tmp.display()))?;
        Ok(())
    }

    /// Apply environment-variable overrides on top of the loaded file.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("REPLAY_BIND_ADDR") {
            self.bind_addr = addr;
        }
        if let Ok(path) = std::env::var("REPLAY_DATABASE_PATH") {
            self.database_path = path;
        }
        if let Ok(url) = std::env::var("REPLAY_VENDOR_URL") {
            self.vendor_base_url = url;
        }
        if let Ok(raw) = std::env::var("REPLAY_TICK_INTERVAL_MS") {
            match raw.parse() {
                Ok(ms) => self.tick_interval_ms = ms,
                Err(_) => warn!(value = %raw, "ignoring invalid REPLAY_TICK_INTERVAL_MS"),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
