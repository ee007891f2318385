//! Platform adapter contract and registry.
//!
//! One concrete adapter per platform owns that platform's auth and data
//! transfer. Adapters perform remote I/O only; the orchestrator owns all
//! local persistence.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::info;

use facture_core::types::EntityType;

use crate::error::{SyncError, SyncResult};
use crate::types::{EntityFilter, EntityPage, MutationIntent, Platform};

#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    fn platform(&self) -> Platform;

    /// Validate or obtain working credentials. `Err(Auth)` on an invalid
    /// credential; transport failures surface as `Transient`.
    async fn authenticate(&self) -> SyncResult<()>;

    /// `true` for live credentials, `false` for well-formed but revoked
    /// ones. Raises only on transport failure, never on a bad credential.
    async fn validate_connection(&self) -> SyncResult<bool>;

    /// Fetch one page of raw remote records.
    async fn fetch_entities(
        &self,
        entity_type: EntityType,
        filter: &EntityFilter,
        cursor: Option<&str>,
    ) -> SyncResult<EntityPage>;

    /// Create or update one remote record; returns the external id.
    /// Re-sending an unchanged record must be a safe no-op remotely.
    async fn upsert_entity(
        &self,
        entity_type: EntityType,
        payload: &serde_json::Value,
    ) -> SyncResult<String>;

    /// Turn a verified webhook payload into mutation intents. Platforms
    /// without webhook support keep this default.
    async fn receive_webhook(
        &self,
        _payload: &serde_json::Value,
    ) -> SyncResult<Vec<MutationIntent>> {
        Err(SyncError::TerminalRemote {
            status: 404,
            detail: format!("{} does not deliver webhooks", self.platform().as_str()),
        })
    }
}

/// Registry of live adapters, keyed by platform.
pub struct AdapterRegistry {
    adapters: DashMap<Platform, Arc<dyn PlatformAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self {
            adapters: DashMap::new(),
        }
    }

    pub fn register(&self, adapter: Arc<dyn PlatformAdapter>) {
        let platform = adapter.platform();
        info!(platform = platform.as_str(), "adapter registered");
        self.adapters.insert(platform, adapter);
    }

    pub fn get(&self, platform: Platform) -> Option<Arc<dyn PlatformAdapter>> {
        self.adapters.get(&platform).map(|entry| entry.value().clone())
    }

    pub fn platforms(&self) -> Vec<Platform> {
        self.adapters.iter().map(|entry| *entry.key()).collect()
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}
