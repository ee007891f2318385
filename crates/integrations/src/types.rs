use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use facture_core::types::EntityType;

use crate::retry::RetryPolicy;

/// Supported external platforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Hubspot,
    Asana,
}

impl Platform {
    pub fn display_name(&self) -> &'static str {
        match self {
            Platform::Hubspot => "HubSpot",
            Platform::Asana => "Asana",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Hubspot => "hubspot",
            Platform::Asana => "asana",
        }
    }

    /// Default page size for this platform's sync operations.
    pub fn default_batch_size(&self) -> usize {
        match self {
            Platform::Hubspot => 100,
            Platform::Asana => 50,
        }
    }
}

/// Credentials held by an integration. OAuth credentials are mutated by
/// token refresh; API keys never change after setup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Credentials {
    ApiKey {
        key: String,
    },
    OAuth {
        access_token: String,
        refresh_token: String,
        expires_at: DateTime<Utc>,
    },
}

/// Configuration for one connected platform. Owned by the configuration
/// surface; sync runs read it and only token refresh mutates it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationConfig {
    pub id: Uuid,
    pub platform: Platform,
    pub credentials: Credentials,
    pub base_url: String,
    pub timeout_ms: u64,
    pub retry: RetryPolicy,
    pub sync_interval_minutes: u64,
    pub sync_enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    Pull,
    Push,
    Bidirectional,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOperation {
    Full,
    Incremental,
}

/// Status of one sync attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncRunStatus {
    Pending,
    Running,
    Success,
    Partial,
    Failed,
}

impl SyncRunStatus {
    /// Derive the attempt status from record counts.
    ///
    /// A run with nothing to process counts as success; a single record
    /// failure never makes an otherwise-productive run `Failed`.
    pub fn from_counts(processed: u64, succeeded: u64, failed: u64) -> Self {
        if failed == 0 {
            SyncRunStatus::Success
        } else if succeeded == 0 && processed > 0 {
            SyncRunStatus::Failed
        } else {
            SyncRunStatus::Partial
        }
    }
}

/// Immutable-once-finalized record of a sync attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncLogEntry {
    pub id: Uuid,
    pub integration_id: Uuid,
    pub entity_type: EntityType,
    pub operation: SyncOperation,
    pub direction: SyncDirection,
    pub status: SyncRunStatus,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub error: Option<String>,
    /// Set on nested batch entries; points at the enclosing attempt.
    pub parent_id: Option<Uuid>,
}

/// What happened to one record during a sync attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordAction {
    Created,
    Updated,
    Skipped,
    Pushed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordOutcome {
    pub external_id: Option<String>,
    pub local_id: Option<Uuid>,
    pub action: RecordAction,
    pub error: Option<String>,
}

impl RecordOutcome {
    pub fn failed(external_id: Option<String>, error: impl Into<String>) -> Self {
        Self {
            external_id,
            local_id: None,
            action: RecordAction::Failed,
            error: Some(error.into()),
        }
    }
}

/// Structured result returned to every caller of a sync run. Attempt-level
/// faults surface here as a failed status plus `error`, never as a raw
/// transport exception.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncReport {
    pub log_id: Uuid,
    pub status: SyncRunStatus,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub error: Option<String>,
    pub details: Vec<RecordOutcome>,
}

/// Options for one sync run; unset fields fall back to global config.
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    pub operation: Option<SyncOperation>,
    pub direction: Option<SyncDirection>,
    pub batch_size: Option<usize>,
    pub batch_delay_ms: Option<u64>,
    pub max_concurrent_batches: Option<usize>,
    pub modified_since: Option<DateTime<Utc>>,
}

/// Server-side filter passed to `fetch_entities`.
#[derive(Debug, Clone, Default)]
pub struct EntityFilter {
    pub modified_since: Option<DateTime<Utc>>,
    pub external_ids: Option<Vec<String>>,
    /// Page size override; the platform default applies when unset.
    pub page_size: Option<usize>,
}

/// One page of raw remote records plus the cursor for the next page.
#[derive(Debug, Clone)]
pub struct EntityPage {
    pub records: Vec<serde_json::Value>,
    pub next_cursor: Option<String>,
}

/// A mutation extracted from a verified webhook payload, routed through
/// the orchestrator's inbound path as a single-record pull.
#[derive(Debug, Clone)]
pub struct MutationIntent {
    pub entity_type: EntityType,
    pub record: serde_json::Value,
}
