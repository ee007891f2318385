use serde::Deserialize;

use crate::error::{FactureError, FactureResult};

/// Root application configuration. Loaded from environment variables
/// with the prefix `FACTURE__`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub sync: SyncGlobalConfig,
    #[serde(default)]
    pub integrations: IntegrationsGlobalConfig,
}

/// Bind address for the (out-of-scope) HTTP layer. Kept here so the
/// routing crate and the sync daemon share one config surface.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

/// Global defaults for sync runs. Per-integration settings override these.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncGlobalConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Fixed pause between batches; the sole rate-limit avoidance mechanism.
    #[serde(default = "default_batch_delay_ms")]
    pub batch_delay_ms: u64,
    #[serde(default = "default_max_concurrent_batches")]
    pub max_concurrent_batches: usize,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IntegrationsGlobalConfig {
    #[serde(default)]
    pub hubspot: PlatformSection,
    #[serde(default)]
    pub asana: PlatformSection,
}

/// Per-platform connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct PlatformSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub base_url: String,
    #[serde(default = "default_sync_interval_minutes")]
    pub sync_interval_minutes: u64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_node_id() -> String {
    "facture-1".to_string()
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_http_port() -> u16 {
    8080
}
fn default_batch_size() -> usize {
    100
}
fn default_batch_delay_ms() -> u64 {
    250
}
fn default_max_concurrent_batches() -> usize {
    4
}
fn default_retry_attempts() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    200
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_sync_interval_minutes() -> u64 {
    15
}
fn default_timeout_ms() -> u64 {
    10_000
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            http_port: default_http_port(),
        }
    }
}

impl Default for SyncGlobalConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            batch_delay_ms: default_batch_delay_ms(),
            max_concurrent_batches: default_max_concurrent_batches(),
            retry_attempts: default_retry_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl Default for IntegrationsGlobalConfig {
    fn default() -> Self {
        Self {
            hubspot: PlatformSection::default(),
            asana: PlatformSection::default(),
        }
    }
}

impl Default for PlatformSection {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: String::new(),
            sync_interval_minutes: default_sync_interval_minutes(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            api: ApiConfig::default(),
            sync: SyncGlobalConfig::default(),
            integrations: IntegrationsGlobalConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn load() -> FactureResult<Self> {
        let builder = config::Config::builder().add_source(
            config::Environment::with_prefix("FACTURE")
                .separator("__")
                .try_parsing(true)
                .list_separator(","),
        );

        let config = builder
            .build()
            .map_err(|e| FactureError::Config(e.to_string()))?;
        config
            .try_deserialize()
            .map_err(|e| FactureError::Config(e.to_string()))
    }
}
