// =============================================================================
// Runtime Configuration — feed endpoints, pool shape, listener addresses
// =============================================================================
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.  All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.  Credentials may be overridden
// from the environment so that secrets stay out of the file.
// =============================================================================

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_backfill_workers() -> usize {
    4
}

fn default_backfill_rate_ms() -> u64 {
    300
}

fn default_grpc_listen() -> String {
    "0.0.0.0:50051".to_string()
}

fn default_http_listen() -> String {
    "0.0.0.0:3001".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

// =============================================================================
// Credentials
// =============================================================================

/// Feed API credentials. The secret is used exclusively for HMAC request
/// signing and is never logged.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub secret: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("key", &"<redacted>")
            .field("secret", &"<redacted>")
            .finish()
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Feed connection -----------------------------------------------------

    /// WebSocket trade-feed endpoint.
    #[serde(default)]
    pub stream_endpoint: String,

    /// REST historical-trade endpoint.
    #[serde(default)]
    pub rest_endpoint: String,

    #[serde(default)]
    pub credentials: Credentials,

    // --- Backfill pool shape -------------------------------------------------

    /// Concurrent backfill workers.
    #[serde(default = "default_backfill_workers")]
    pub backfill_workers: usize,

    /// Minimum spacing between backfill fetch starts, in milliseconds.
    #[serde(default = "default_backfill_rate_ms")]
    pub backfill_rate_ms: u64,

    // --- Listeners -----------------------------------------------------------

    /// gRPC fan-out listener address.
    #[serde(default = "default_grpc_listen")]
    pub grpc_listen: String,

    /// HTTP REST listener address.
    #[serde(default = "default_http_listen")]
    pub http_listen: String,

    // --- Data layout ---------------------------------------------------------

    /// Root for reference files and the per-date backfill cache.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            stream_endpoint: String::new(),
            rest_endpoint: String::new(),
            credentials: Credentials::default(),
            backfill_workers: default_backfill_workers(),
            backfill_rate_ms: default_backfill_rate_ms(),
            grpc_listen: default_grpc_listen(),
            http_listen: default_http_listen(),
            data_dir: default_data_dir(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        info!(
            path = %path.display(),
            stream = %config.stream_endpoint,
            workers = config.backfill_workers,
            "config loaded"
        );

        Ok(config)
    }

    /// Replace credentials from `FEED_API_KEY` / `FEED_API_SECRET` when set.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(key) = std::env::var("FEED_API_KEY") {
            self.credentials.key = key;
        }
        if let Ok(secret) = std::env::var("FEED_API_SECRET") {
            self.credentials.secret = secret;
        }
    }

    /// Startup validation; failures here are configuration fatals surfaced
    /// before readiness.
    pub fn validate(&self) -> Result<()> {
        if self.stream_endpoint.is_empty() {
            anyhow::bail!("stream_endpoint is not configured");
        }
        if self.rest_endpoint.is_empty() {
            anyhow::bail!("rest_endpoint is not configured");
        }
        if self.backfill_workers == 0 {
            anyhow::bail!("backfill_workers must be at least 1");
        }
        if self.backfill_rate_ms == 0 {
            anyhow::bail!("backfill_rate_ms must be at least 1");
        }
        Ok(())
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "config saved (atomic)");
        Ok(())
    }
}
