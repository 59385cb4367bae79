//! Global configuration types for chatrelay.
//!
//! `GlobalConfig` represents the top-level `config.toml` controlling session
//! lifetimes, delivery cadence, the upstream endpoint, and per-model rates.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration.
///
/// Loaded from `~/.chatrelay/config.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalConfig {
    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Quota charged per 1k tokens, per model.
    #[serde(default)]
    pub model_rates: Vec<ModelRate>,
}

/// Session lifetime and delivery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Hard cap on a session's lifetime; the cancellation handle fires
    /// automatically after this many seconds.
    #[serde(default = "default_hard_timeout_secs")]
    pub hard_timeout_secs: u64,

    /// Inactivity after which a session is presumed dead (sweep and recovery).
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,

    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// TTL of durable snapshots.
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,

    /// Capacity of each runtime delivery queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default = "default_progress_tick_ms")]
    pub progress_tick_ms: u64,

    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,

    /// Key prefix of durable snapshots.
    #[serde(default = "default_cache_namespace")]
    pub cache_namespace: String,

    /// Maximum concurrent durable writes.
    #[serde(default = "default_snapshot_concurrency")]
    pub snapshot_concurrency: usize,

    /// Fragment emitted when the pipeline starts processing.
    #[serde(default = "default_initial_progress_label")]
    pub initial_progress_label: String,
}

fn default_hard_timeout_secs() -> u64 {
    15 * 60
}

fn default_stale_after_secs() -> u64 {
    60 * 60
}

fn default_sweep_interval_secs() -> u64 {
    10 * 60
}

fn default_retention_secs() -> u64 {
    24 * 60 * 60
}

fn default_queue_capacity() -> usize {
    100
}

fn default_progress_tick_ms() -> u64 {
    300
}

fn default_ping_interval_secs() -> u64 {
    30
}

fn default_cache_namespace() -> String {
    "chat_session".to_string()
}

fn default_snapshot_concurrency() -> usize {
    4
}

fn default_initial_progress_label() -> String {
    "Generating response...\n".to_string()
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            hard_timeout_secs: default_hard_timeout_secs(),
            stale_after_secs: default_stale_after_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            retention_secs: default_retention_secs(),
            queue_capacity: default_queue_capacity(),
            progress_tick_ms: default_progress_tick_ms(),
            ping_interval_secs: default_ping_interval_secs(),
            cache_namespace: default_cache_namespace(),
            snapshot_concurrency: default_snapshot_concurrency(),
            initial_progress_label: default_initial_progress_label(),
        }
    }
}

impl SessionConfig {
    pub fn hard_timeout(&self) -> Duration {
        Duration::from_secs(self.hard_timeout_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn progress_tick(&self) -> Duration {
        Duration::from_millis(self.progress_tick_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    /// Staleness window as a chrono duration, for comparisons against
    /// `last_activity` timestamps.
    pub fn stale_after_chrono(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_after_secs as i64)
    }
}

/// OpenAI-compatible upstream endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Name of the environment variable holding the upstream API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// How long identical requests are answered from the response cache.
    /// Zero disables the cache.
    #[serde(default)]
    pub response_cache_ttl_secs: u64,

    #[serde(default = "default_response_cache_namespace")]
    pub response_cache_namespace: String,
}

impl UpstreamConfig {
    pub fn response_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.response_cache_ttl_secs)
    }
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_response_cache_namespace() -> String {
    "chat_response".to_string()
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
            connect_timeout_secs: default_connect_timeout_secs(),
            response_cache_ttl_secs: 0,
            response_cache_namespace: default_response_cache_namespace(),
        }
    }
}

/// Quota charged per 1k tokens for one model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRate {
    pub model: String,
    pub quota_per_1k_tokens: f32,
}
