//! Persistence boundary: the storage and audit contracts the orchestrator
//! requires, plus in-memory implementations.
//!
//! The storage schema itself lives elsewhere; these traits are what the
//! sync core consumes. The DashMap-backed implementations serve tests,
//! the demo binary, and any deployment that runs without the relational
//! store.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use facture_core::types::{CanonicalEntity, EntityType, ExternalLink, LinkSyncStatus};

use crate::error::{SyncError, SyncResult};
use crate::types::{Platform, SyncDirection, SyncLogEntry, SyncOperation, SyncRunStatus};

/// A local entity together with its per-platform remote bindings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEntity {
    pub entity: CanonicalEntity,
    /// Keyed by platform id; the map key enforces at most one link per
    /// (platform, local entity).
    #[serde(default)]
    pub links: HashMap<String, ExternalLink>,
}

impl StoredEntity {
    pub fn new(entity: CanonicalEntity) -> Self {
        Self {
            entity,
            links: HashMap::new(),
        }
    }

    pub fn link(&self, platform: Platform) -> Option<&ExternalLink> {
        self.links.get(platform.as_str())
    }

    /// Mark the entity as locally modified and awaiting a push.
    pub fn mark_dirty(&mut self, platform: Platform) {
        self.entity.updated_at = Utc::now();
        if let Some(link) = self.links.get_mut(platform.as_str()) {
            link.sync_status = LinkSyncStatus::Dirty;
        }
    }
}

/// Lookup/upsert surface the orchestrator persists through.
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn find_by_external_id(
        &self,
        platform: Platform,
        external_id: &str,
    ) -> SyncResult<Option<StoredEntity>>;

    async fn get(&self, id: Uuid) -> SyncResult<Option<StoredEntity>>;

    /// Insert or replace; binds any links carried on the record.
    async fn upsert(&self, stored: StoredEntity) -> SyncResult<Uuid>;

    /// Entities that are unsynced, locally modified, or failed for this
    /// platform; all of them are push candidates.
    async fn dirty_entities(
        &self,
        platform: Platform,
        entity_type: EntityType,
    ) -> SyncResult<Vec<StoredEntity>>;

    async fn mark_synced(
        &self,
        id: Uuid,
        platform: Platform,
        external_id: &str,
    ) -> SyncResult<()>;

    async fn mark_failed(&self, id: Uuid, platform: Platform, detail: &str) -> SyncResult<()>;
}

/// Fields needed to open an audit entry before any work happens.
#[derive(Debug, Clone)]
pub struct NewLogEntry {
    pub integration_id: Uuid,
    pub entity_type: EntityType,
    pub operation: SyncOperation,
    pub direction: SyncDirection,
    pub parent_id: Option<Uuid>,
}

#[derive(Debug, Clone)]
pub struct LogFinalization {
    pub status: SyncRunStatus,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub error: Option<String>,
}

/// Audit contract: every attempt opens an entry first and finalizes it
/// exactly once, on success, partial success, failure, and unexpected
/// faults alike.
#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn create_entry(&self, new: NewLogEntry) -> SyncResult<Uuid>;

    /// Rejects a second finalization of the same entry.
    async fn finalize_entry(&self, log_id: Uuid, fin: LogFinalization) -> SyncResult<()>;

    async fn get_entry(&self, log_id: Uuid) -> SyncResult<Option<SyncLogEntry>>;
}

// ---------------------------------------------------------------------------
// In-memory implementations
// ---------------------------------------------------------------------------

pub struct MemoryStore {
    entities: DashMap<Uuid, StoredEntity>,
    by_external: DashMap<(String, String), Uuid>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            entities: DashMap::new(),
            by_external: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn find_by_external_id(
        &self,
        platform: Platform,
        external_id: &str,
    ) -> SyncResult<Option<StoredEntity>> {
        let key = (platform.as_str().to_string(), external_id.to_string());
        let Some(id) = self.by_external.get(&key).map(|entry| *entry.value()) else {
            return Ok(None);
        };
        Ok(self.entities.get(&id).map(|entry| entry.value().clone()))
    }

    async fn get(&self, id: Uuid) -> SyncResult<Option<StoredEntity>> {
        Ok(self.entities.get(&id).map(|entry| entry.value().clone()))
    }

    async fn upsert(&self, stored: StoredEntity) -> SyncResult<Uuid> {
        let id = stored.entity.id;
        for (platform, link) in &stored.links {
            let key = (platform.clone(), link.external_id.clone());
            if let Some(existing) = self.by_external.get(&key) {
                if *existing.value() != id {
                    return Err(SyncError::validation(
                        "external_id",
                        format!(
                            "{}/{} already bound to another local entity",
                            platform, link.external_id
                        ),
                    ));
                }
            }
            self.by_external.insert(key, id);
        }
        self.entities.insert(id, stored);
        Ok(id)
    }

    async fn dirty_entities(
        &self,
        platform: Platform,
        entity_type: EntityType,
    ) -> SyncResult<Vec<StoredEntity>> {
        Ok(self
            .entities
            .iter()
            .filter(|entry| {
                let stored = entry.value();
                stored.entity.entity_type == entity_type
                    && stored
                        .link(platform)
                        .map_or(true, |link| link.sync_status != LinkSyncStatus::Synced)
            })
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn mark_synced(
        &self,
        id: Uuid,
        platform: Platform,
        external_id: &str,
    ) -> SyncResult<()> {
        let mut entry = self
            .entities
            .get_mut(&id)
            .ok_or_else(|| SyncError::validation("id", format!("unknown entity {id}")))?;
        let link = entry
            .links
            .entry(platform.as_str().to_string())
            .or_insert_with(|| ExternalLink {
                platform: platform.as_str().to_string(),
                external_id: external_id.to_string(),
                external_updated_at: None,
                sync_status: LinkSyncStatus::Synced,
                last_error: None,
            });
        link.external_id = external_id.to_string();
        link.sync_status = LinkSyncStatus::Synced;
        link.last_error = None;
        self.by_external.insert(
            (platform.as_str().to_string(), external_id.to_string()),
            id,
        );
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, platform: Platform, detail: &str) -> SyncResult<()> {
        let mut entry = self
            .entities
            .get_mut(&id)
            .ok_or_else(|| SyncError::validation("id", format!("unknown entity {id}")))?;
        let link = entry
            .links
            .entry(platform.as_str().to_string())
            .or_insert_with(|| ExternalLink {
                platform: platform.as_str().to_string(),
                external_id: String::new(),
                external_updated_at: None,
                sync_status: LinkSyncStatus::Failed,
                last_error: None,
            });
        link.sync_status = LinkSyncStatus::Failed;
        link.last_error = Some(detail.to_string());
        Ok(())
    }
}

pub struct MemoryAuditLog {
    entries: DashMap<Uuid, SyncLogEntry>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn entries_for(&self, integration_id: Uuid) -> Vec<SyncLogEntry> {
        self.entries
            .iter()
            .filter(|entry| entry.value().integration_id == integration_id)
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for MemoryAuditLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuditLog for MemoryAuditLog {
    async fn create_entry(&self, new: NewLogEntry) -> SyncResult<Uuid> {
        let id = Uuid::new_v4();
        let entry = SyncLogEntry {
            id,
            integration_id: new.integration_id,
            entity_type: new.entity_type,
            operation: new.operation,
            direction: new.direction,
            status: SyncRunStatus::Running,
            processed: 0,
            succeeded: 0,
            failed: 0,
            started_at: Utc::now(),
            finished_at: None,
            duration_ms: None,
            error: None,
            parent_id: new.parent_id,
        };
        debug!(log_id = %id, entity = entry.entity_type.as_str(), "audit entry opened");
        self.entries.insert(id, entry);
        Ok(id)
    }

    async fn finalize_entry(&self, log_id: Uuid, fin: LogFinalization) -> SyncResult<()> {
        let mut entry = self
            .entries
            .get_mut(&log_id)
            .ok_or_else(|| SyncError::validation("log_id", format!("unknown log entry {log_id}")))?;
        if entry.finished_at.is_some() {
            return Err(SyncError::Configuration(format!(
                "log entry {log_id} already finalized"
            )));
        }
        let now = Utc::now();
        entry.status = fin.status;
        entry.processed = fin.processed;
        entry.succeeded = fin.succeeded;
        entry.failed = fin.failed;
        entry.error = fin.error;
        entry.finished_at = Some(now);
        entry.duration_ms = Some((now - entry.started_at).num_milliseconds().max(0) as u64);
        Ok(())
    }

    async fn get_entry(&self, log_id: Uuid) -> SyncResult<Option<SyncLogEntry>> {
        Ok(self.entries.get(&log_id).map(|entry| entry.value().clone()))
    }
}

#[cfg(test)]
mod tests {
    use facture_core::types::EntityStatus;

    use super::*;

    fn linked(entity: CanonicalEntity, platform: Platform, external_id: &str) -> StoredEntity {
        let mut stored = StoredEntity::new(entity);
        stored.links.insert(
            platform.as_str().to_string(),
            ExternalLink {
                platform: platform.as_str().to_string(),
                external_id: external_id.to_string(),
                external_updated_at: None,
                sync_status: LinkSyncStatus::Synced,
                last_error: None,
            },
        );
        stored
    }

    #[tokio::test]
    async fn test_external_id_lookup_and_uniqueness() {
        let store = MemoryStore::new();
        let client = CanonicalEntity::client("Acme", Some("a@acme.test"));
        let id = store
            .upsert(linked(client, Platform::Hubspot, "ext-1"))
            .await
            .unwrap();

        let found = store
            .find_by_external_id(Platform::Hubspot, "ext-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.entity.id, id);

        // Binding the same external id to a different local entity is
        // rejected: at most one link per (platform, external id).
        let other = CanonicalEntity::client("Imposter", None);
        let err = store
            .upsert(linked(other, Platform::Hubspot, "ext-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Validation { .. }));
    }

    #[tokio::test]
    async fn test_dirty_query_and_marks() {
        let store = MemoryStore::new();
        let unsynced = CanonicalEntity::invoice("INV-1", 100.0, EntityStatus::Pending);
        let unsynced_id = store.upsert(StoredEntity::new(unsynced)).await.unwrap();

        let synced = CanonicalEntity::invoice("INV-2", 50.0, EntityStatus::Paid);
        let synced_id = store
            .upsert(linked(synced, Platform::Hubspot, "d-2"))
            .await
            .unwrap();

        let dirty = store
            .dirty_entities(Platform::Hubspot, EntityType::Invoice)
            .await
            .unwrap();
        assert_eq!(dirty.len(), 1);
        assert_eq!(dirty[0].entity.id, unsynced_id);

        store
            .mark_failed(synced_id, Platform::Hubspot, "rejected")
            .await
            .unwrap();
        let dirty = store
            .dirty_entities(Platform::Hubspot, EntityType::Invoice)
            .await
            .unwrap();
        // Failed entities stay push candidates for a future attempt.
        assert_eq!(dirty.len(), 2);

        store
            .mark_synced(unsynced_id, Platform::Hubspot, "d-1")
            .await
            .unwrap();
        let found = store
            .find_by_external_id(Platform::Hubspot, "d-1")
            .await
            .unwrap();
        assert!(found.is_some());
    }

    #[tokio::test]
    async fn test_finalize_exactly_once() {
        let audit = MemoryAuditLog::new();
        let log_id = audit
            .create_entry(NewLogEntry {
                integration_id: Uuid::new_v4(),
                entity_type: EntityType::Client,
                operation: SyncOperation::Incremental,
                direction: SyncDirection::Pull,
                parent_id: None,
            })
            .await
            .unwrap();

        let running = audit.get_entry(log_id).await.unwrap().unwrap();
        assert_eq!(running.status, SyncRunStatus::Running);
        assert!(running.finished_at.is_none());

        audit
            .finalize_entry(
                log_id,
                LogFinalization {
                    status: SyncRunStatus::Partial,
                    processed: 5,
                    succeeded: 4,
                    failed: 1,
                    error: None,
                },
            )
            .await
            .unwrap();

        let done = audit.get_entry(log_id).await.unwrap().unwrap();
        assert_eq!(done.status, SyncRunStatus::Partial);
        assert!(done.finished_at.is_some());
        assert!(done.duration_ms.is_some());

        // Immutable once finalized.
        let err = audit
            .finalize_entry(
                log_id,
                LogFinalization {
                    status: SyncRunStatus::Success,
                    processed: 5,
                    succeeded: 5,
                    failed: 0,
                    error: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Configuration(_)));
    }
}
