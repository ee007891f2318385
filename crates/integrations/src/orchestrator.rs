//! Sync orchestrator: composes adapters, mapper, retry, storage, and the
//! audit log into pull/push/bidirectional sync runs.
//!
//! An attempt proceeds through sequential stages (fetch, map, reconcile,
//! persist). Pull pages follow the remote cursor sequentially; push
//! batches run concurrently up to a configurable ceiling, paced by a
//! fixed inter-batch delay. Cancellation is cooperative: a flag checked
//! between batches, never aborting an in-flight call. Every attempt
//! opens an audit entry before work begins and finalizes it exactly
//! once, on any exit path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

use facture_core::config::SyncGlobalConfig;
use facture_core::types::{EntityType, ExternalLink, LinkSyncStatus};

use crate::adapter::{AdapterRegistry, PlatformAdapter};
use crate::error::{SyncError, SyncResult};
use crate::mapper::{self, MappedRecord};
use crate::retry::{with_retry, RetryPolicy};
use crate::storage::{AuditLog, EntityStore, LogFinalization, NewLogEntry, StoredEntity};
use crate::types::{
    EntityFilter, IntegrationConfig, Platform, RecordAction, RecordOutcome, SyncDirection,
    SyncOperation, SyncOptions, SyncReport, SyncRunStatus,
};

#[derive(Debug, Default)]
struct RunTotals {
    processed: u64,
    succeeded: u64,
    failed: u64,
    details: Vec<RecordOutcome>,
}

impl RunTotals {
    fn absorb(&mut self, outcome: RecordOutcome) {
        self.processed += 1;
        if outcome.action == RecordAction::Failed {
            self.failed += 1;
        } else {
            self.succeeded += 1;
        }
        self.details.push(outcome);
    }

    fn merge(&mut self, other: RunTotals) {
        self.processed += other.processed;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.details.extend(other.details);
    }
}

#[derive(Debug, Clone, Copy)]
struct ResolvedOptions {
    operation: SyncOperation,
    direction: SyncDirection,
    batch_size: usize,
    batch_delay: Duration,
    max_concurrent: usize,
    modified_since: Option<chrono::DateTime<chrono::Utc>>,
}

pub struct SyncOrchestrator {
    registry: Arc<AdapterRegistry>,
    store: Arc<dyn EntityStore>,
    audit: Arc<dyn AuditLog>,
    defaults: SyncGlobalConfig,
    cancels: DashMap<Uuid, Arc<AtomicBool>>,
}

impl SyncOrchestrator {
    pub fn new(
        registry: Arc<AdapterRegistry>,
        store: Arc<dyn EntityStore>,
        audit: Arc<dyn AuditLog>,
        defaults: SyncGlobalConfig,
    ) -> Self {
        Self {
            registry,
            store,
            audit,
            defaults,
            cancels: DashMap::new(),
        }
    }

    pub fn audit(&self) -> &Arc<dyn AuditLog> {
        &self.audit
    }

    fn resolve(&self, options: &SyncOptions) -> ResolvedOptions {
        ResolvedOptions {
            operation: options.operation.unwrap_or(SyncOperation::Incremental),
            direction: options.direction.unwrap_or(SyncDirection::Bidirectional),
            batch_size: options.batch_size.unwrap_or(self.defaults.batch_size).max(1),
            batch_delay: Duration::from_millis(
                options.batch_delay_ms.unwrap_or(self.defaults.batch_delay_ms),
            ),
            max_concurrent: options
                .max_concurrent_batches
                .unwrap_or(self.defaults.max_concurrent_batches)
                .max(1),
            modified_since: options.modified_since,
        }
    }

    /// Run one sync attempt to completion and return its report.
    pub async fn sync_entity(
        &self,
        config: &IntegrationConfig,
        entity_type: EntityType,
        options: SyncOptions,
    ) -> SyncResult<SyncReport> {
        let opts = self.resolve(&options);
        let log_id = self
            .audit
            .create_entry(NewLogEntry {
                integration_id: config.id,
                entity_type,
                operation: opts.operation,
                direction: opts.direction,
                parent_id: None,
            })
            .await?;
        self.execute(log_id, config, entity_type, opts).await
    }

    /// Start a sync attempt in the background and return its log id
    /// immediately; callers poll the audit log for progress.
    pub async fn spawn_sync(
        self: Arc<Self>,
        config: IntegrationConfig,
        entity_type: EntityType,
        options: SyncOptions,
    ) -> SyncResult<Uuid> {
        let opts = self.resolve(&options);
        let log_id = self
            .audit
            .create_entry(NewLogEntry {
                integration_id: config.id,
                entity_type,
                operation: opts.operation,
                direction: opts.direction,
                parent_id: None,
            })
            .await?;

        tokio::spawn(async move {
            // The report is already captured in the audit entry.
            let _ = self.execute(log_id, &config, entity_type, opts).await;
        });
        Ok(log_id)
    }

    /// Request cooperative cancellation of a running attempt. Returns
    /// false when the attempt is unknown or already finished.
    pub fn cancel(&self, log_id: Uuid) -> bool {
        match self.cancels.get(&log_id) {
            Some(flag) => {
                flag.store(true, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Apply verified inbound records (the webhook path) as single-record
    /// pulls, reusing the same mapping, validation, and timestamp-conflict
    /// logic as a full pull.
    pub async fn ingest_records(
        &self,
        config: &IntegrationConfig,
        entity_type: EntityType,
        records: &[Value],
    ) -> SyncResult<SyncReport> {
        let log_id = self
            .audit
            .create_entry(NewLogEntry {
                integration_id: config.id,
                entity_type,
                operation: SyncOperation::Incremental,
                direction: SyncDirection::Pull,
                parent_id: None,
            })
            .await?;

        let mut totals = RunTotals::default();
        let outcome = mapper::map_batch(config.platform, entity_type, records);
        for failure in &outcome.failures {
            totals.absorb(RecordOutcome::failed(
                failure.external_id.clone(),
                failure.error.clone(),
            ));
        }
        for mapped in outcome.mapped {
            let record = self.reconcile(config.platform, entity_type, mapped).await;
            totals.absorb(record);
        }
        self.finalize(log_id, &totals, None).await;
        Ok(self.report(log_id, totals, None))
    }

    // -- internals ---------------------------------------------------------

    async fn execute(
        &self,
        log_id: Uuid,
        config: &IntegrationConfig,
        entity_type: EntityType,
        opts: ResolvedOptions,
    ) -> SyncResult<SyncReport> {
        let cancel = Arc::new(AtomicBool::new(false));
        self.cancels.insert(log_id, cancel.clone());

        let result = self.run(log_id, config, entity_type, opts, &cancel).await;
        self.cancels.remove(&log_id);

        match result {
            Ok(totals) => {
                self.finalize(log_id, &totals, None).await;
                Ok(self.report(log_id, totals, None))
            }
            Err(err) => {
                // Attempt-level fault: the entry is still finalized and the
                // caller still gets a structured report.
                warn!(log_id = %log_id, error = %err, "sync attempt aborted");
                let detail = err.to_string();
                self.finalize_failed(log_id, &detail).await;
                Ok(SyncReport {
                    log_id,
                    status: SyncRunStatus::Failed,
                    processed: 0,
                    succeeded: 0,
                    failed: 0,
                    error: Some(detail),
                    details: Vec::new(),
                })
            }
        }
    }

    async fn run(
        &self,
        log_id: Uuid,
        config: &IntegrationConfig,
        entity_type: EntityType,
        opts: ResolvedOptions,
        cancel: &Arc<AtomicBool>,
    ) -> SyncResult<RunTotals> {
        if !config.sync_enabled {
            return Err(SyncError::Configuration(format!(
                "integration {} is disabled",
                config.id
            )));
        }
        let adapter = self.registry.get(config.platform).ok_or_else(|| {
            SyncError::Configuration(format!(
                "no adapter registered for {}",
                config.platform.as_str()
            ))
        })?;

        info!(
            log_id = %log_id,
            platform = config.platform.as_str(),
            entity = entity_type.as_str(),
            direction = ?opts.direction,
            "sync attempt started"
        );

        let mut totals = RunTotals::default();
        match opts.direction {
            SyncDirection::Pull => {
                totals.merge(self.pull(&adapter, config, entity_type, opts, cancel).await?);
            }
            SyncDirection::Push => {
                totals.merge(self.push(&adapter, config, entity_type, opts, cancel).await?);
            }
            SyncDirection::Bidirectional => {
                // One logical attempt; each phase gets a nested audit
                // entry pointing back at this one.
                let pull_id = self.child_entry(log_id, config, entity_type, opts, SyncDirection::Pull).await?;
                match self.pull(&adapter, config, entity_type, opts, cancel).await {
                    Ok(phase) => {
                        self.finalize(pull_id, &phase, None).await;
                        totals.merge(phase);
                    }
                    Err(err) => {
                        self.finalize_failed(pull_id, &err.to_string()).await;
                        return Err(err);
                    }
                }

                let push_id = self.child_entry(log_id, config, entity_type, opts, SyncDirection::Push).await?;
                match self.push(&adapter, config, entity_type, opts, cancel).await {
                    Ok(phase) => {
                        self.finalize(push_id, &phase, None).await;
                        totals.merge(phase);
                    }
                    Err(err) => {
                        self.finalize_failed(push_id, &err.to_string()).await;
                        return Err(err);
                    }
                }
            }
        }

        metrics::counter!("facture.sync.records_failed").increment(totals.failed);
        metrics::counter!("facture.sync.records_succeeded").increment(totals.succeeded);
        Ok(totals)
    }

    async fn child_entry(
        &self,
        parent_id: Uuid,
        config: &IntegrationConfig,
        entity_type: EntityType,
        opts: ResolvedOptions,
        direction: SyncDirection,
    ) -> SyncResult<Uuid> {
        self.audit
            .create_entry(NewLogEntry {
                integration_id: config.id,
                entity_type,
                operation: opts.operation,
                direction,
                parent_id: Some(parent_id),
            })
            .await
    }

    async fn pull(
        &self,
        adapter: &Arc<dyn PlatformAdapter>,
        config: &IntegrationConfig,
        entity_type: EntityType,
        opts: ResolvedOptions,
        cancel: &Arc<AtomicBool>,
    ) -> SyncResult<RunTotals> {
        let mut totals = RunTotals::default();
        let filter = EntityFilter {
            modified_since: match opts.operation {
                SyncOperation::Incremental => opts.modified_since,
                SyncOperation::Full => None,
            },
            external_ids: None,
            page_size: Some(opts.batch_size),
        };

        let mut cursor: Option<String> = None;
        loop {
            if cancel.load(Ordering::Relaxed) {
                info!("pull cancelled between batches");
                break;
            }

            let page = with_retry(&config.retry, || {
                adapter.fetch_entities(entity_type, &filter, cursor.as_deref())
            })
            .await?;

            let outcome = mapper::map_batch(config.platform, entity_type, &page.records);
            for failure in &outcome.failures {
                // Invalid records are quarantined, not retried.
                totals.absorb(RecordOutcome::failed(
                    failure.external_id.clone(),
                    failure.error.clone(),
                ));
            }
            for mapped in outcome.mapped {
                let record = self.reconcile(config.platform, entity_type, mapped).await;
                totals.absorb(record);
            }

            cursor = page.next_cursor;
            if cursor.is_none() {
                break;
            }
            tokio::time::sleep(opts.batch_delay).await;
        }
        Ok(totals)
    }

    /// Reconcile one mapped inbound record against local storage with
    /// last-writer-wins semantics. Record-level problems become failed
    /// outcomes; they never abort the attempt.
    async fn reconcile(
        &self,
        platform: Platform,
        entity_type: EntityType,
        mapped: MappedRecord,
    ) -> RecordOutcome {
        let Some(external_id) = mapped.external_id.clone() else {
            return RecordOutcome::failed(None, "record carries no external id");
        };

        let existing = match self.store.find_by_external_id(platform, &external_id).await {
            Ok(found) => found,
            Err(err) => return RecordOutcome::failed(Some(external_id), err.to_string()),
        };

        match existing {
            None => {
                let remote_ts = mapped.external_updated_at;
                let entity = mapped.into_canonical(entity_type);
                let local_id = entity.id;
                let mut stored = StoredEntity::new(entity);
                stored.links.insert(
                    platform.as_str().to_string(),
                    ExternalLink {
                        platform: platform.as_str().to_string(),
                        external_id: external_id.clone(),
                        external_updated_at: remote_ts,
                        sync_status: LinkSyncStatus::Synced,
                        last_error: None,
                    },
                );
                match self.store.upsert(stored).await {
                    Ok(_) => RecordOutcome {
                        external_id: Some(external_id),
                        local_id: Some(local_id),
                        action: RecordAction::Created,
                        error: None,
                    },
                    Err(err) => RecordOutcome::failed(Some(external_id), err.to_string()),
                }
            }
            Some(mut stored) => {
                let local_id = stored.entity.id;
                let local_ts = stored.entity.updated_at;
                let link = stored.links.get(platform.as_str()).cloned();
                let last_seen = link.as_ref().and_then(|l| l.external_updated_at);
                let locally_dirty = link
                    .as_ref()
                    .map_or(false, |l| l.sync_status != LinkSyncStatus::Synced);

                let Some(remote_ts) = mapped.external_updated_at else {
                    return RecordOutcome {
                        external_id: Some(external_id),
                        local_id: Some(local_id),
                        action: RecordAction::Skipped,
                        error: None,
                    };
                };

                // Last-writer-wins: only a remote copy strictly newer than
                // what we last saw is applied; when the local copy is dirty
                // the strictly-greater timestamp wins and an exact tie goes
                // to the remote copy.
                let threshold = last_seen.unwrap_or(local_ts);
                let apply = remote_ts > threshold && !(locally_dirty && remote_ts < local_ts);

                if !apply {
                    return RecordOutcome {
                        external_id: Some(external_id),
                        local_id: Some(local_id),
                        action: RecordAction::Skipped,
                        error: None,
                    };
                }

                mapped.apply_to(&mut stored.entity);
                let entry = stored
                    .links
                    .entry(platform.as_str().to_string())
                    .or_insert_with(|| ExternalLink {
                        platform: platform.as_str().to_string(),
                        external_id: external_id.clone(),
                        external_updated_at: None,
                        sync_status: LinkSyncStatus::Synced,
                        last_error: None,
                    });
                entry.external_updated_at = Some(remote_ts);
                entry.sync_status = LinkSyncStatus::Synced;
                entry.last_error = None;

                match self.store.upsert(stored).await {
                    Ok(_) => RecordOutcome {
                        external_id: Some(external_id),
                        local_id: Some(local_id),
                        action: RecordAction::Updated,
                        error: None,
                    },
                    Err(err) => RecordOutcome::failed(Some(external_id), err.to_string()),
                }
            }
        }
    }

    async fn push(
        &self,
        adapter: &Arc<dyn PlatformAdapter>,
        config: &IntegrationConfig,
        entity_type: EntityType,
        opts: ResolvedOptions,
        cancel: &Arc<AtomicBool>,
    ) -> SyncResult<RunTotals> {
        let mut totals = RunTotals::default();
        let candidates = self
            .store
            .dirty_entities(config.platform, entity_type)
            .await?;
        if candidates.is_empty() {
            return Ok(totals);
        }

        let batches: Vec<Vec<StoredEntity>> = candidates
            .chunks(opts.batch_size)
            .map(|chunk| chunk.to_vec())
            .collect();
        let waves = batches.chunks(opts.max_concurrent).count();

        for (wave_index, wave) in batches.chunks(opts.max_concurrent).enumerate() {
            if cancel.load(Ordering::Relaxed) {
                info!("push cancelled between batches");
                break;
            }

            let mut set = JoinSet::new();
            for batch in wave {
                set.spawn(Self::push_batch(
                    adapter.clone(),
                    self.store.clone(),
                    config.retry.clone(),
                    config.platform,
                    entity_type,
                    batch.clone(),
                ));
            }
            while let Some(joined) = set.join_next().await {
                let outcomes = joined
                    .map_err(|e| SyncError::transient(format!("push batch task failed: {e}")))??;
                for outcome in outcomes {
                    totals.absorb(outcome);
                }
            }

            if wave_index + 1 < waves {
                tokio::time::sleep(opts.batch_delay).await;
            }
        }
        Ok(totals)
    }

    /// Push one batch of local entities. Terminal record errors mark the
    /// entity failed and leave it a future push candidate; auth and
    /// configuration errors abort the attempt.
    async fn push_batch(
        adapter: Arc<dyn PlatformAdapter>,
        store: Arc<dyn EntityStore>,
        retry: RetryPolicy,
        platform: Platform,
        entity_type: EntityType,
        batch: Vec<StoredEntity>,
    ) -> SyncResult<Vec<RecordOutcome>> {
        let mut outcomes = Vec::with_capacity(batch.len());
        for stored in batch {
            let local_id = stored.entity.id;
            let known_external = stored
                .link(platform)
                .map(|l| l.external_id.clone())
                .filter(|id| !id.is_empty());

            let payload =
                match mapper::map_outbound(platform, &stored.entity, known_external.as_deref()) {
                    Ok(payload) => payload,
                    Err(err) => {
                        outcomes.push(RecordOutcome {
                            external_id: known_external,
                            local_id: Some(local_id),
                            action: RecordAction::Failed,
                            error: Some(err.to_string()),
                        });
                        continue;
                    }
                };

            match with_retry(&retry, || adapter.upsert_entity(entity_type, &payload)).await {
                // Store failures after the remote call are record-level,
                // like their counterparts on the pull side; the rest of
                // the batch proceeds.
                Ok(external_id) => {
                    match store.mark_synced(local_id, platform, &external_id).await {
                        Ok(()) => outcomes.push(RecordOutcome {
                            external_id: Some(external_id),
                            local_id: Some(local_id),
                            action: RecordAction::Pushed,
                            error: None,
                        }),
                        Err(err) => outcomes.push(RecordOutcome {
                            external_id: Some(external_id),
                            local_id: Some(local_id),
                            action: RecordAction::Failed,
                            error: Some(err.to_string()),
                        }),
                    }
                }
                Err(err @ SyncError::Auth { .. }) | Err(err @ SyncError::Configuration(_)) => {
                    // Attempt-level: no point pushing the rest of the batch.
                    return Err(err);
                }
                Err(err) => {
                    let detail = err.to_string();
                    if let Err(store_err) = store.mark_failed(local_id, platform, &detail).await {
                        warn!(
                            local_id = %local_id,
                            error = %store_err,
                            "could not record push failure on entity"
                        );
                    }
                    outcomes.push(RecordOutcome {
                        external_id: known_external,
                        local_id: Some(local_id),
                        action: RecordAction::Failed,
                        error: Some(detail),
                    });
                }
            }
        }
        Ok(outcomes)
    }

    async fn finalize(&self, log_id: Uuid, totals: &RunTotals, error: Option<String>) {
        let status = SyncRunStatus::from_counts(totals.processed, totals.succeeded, totals.failed);
        metrics::counter!("facture.sync.runs", "status" => status_label(status)).increment(1);
        if let Err(err) = self
            .audit
            .finalize_entry(
                log_id,
                LogFinalization {
                    status,
                    processed: totals.processed,
                    succeeded: totals.succeeded,
                    failed: totals.failed,
                    error,
                },
            )
            .await
        {
            warn!(log_id = %log_id, error = %err, "failed to finalize audit entry");
        }
    }

    async fn finalize_failed(&self, log_id: Uuid, detail: &str) {
        metrics::counter!("facture.sync.runs", "status" => "failed").increment(1);
        if let Err(err) = self
            .audit
            .finalize_entry(
                log_id,
                LogFinalization {
                    status: SyncRunStatus::Failed,
                    processed: 0,
                    succeeded: 0,
                    failed: 0,
                    error: Some(detail.to_string()),
                },
            )
            .await
        {
            warn!(log_id = %log_id, error = %err, "failed to finalize audit entry");
        }
    }

    fn report(&self, log_id: Uuid, totals: RunTotals, error: Option<String>) -> SyncReport {
        SyncReport {
            log_id,
            status: SyncRunStatus::from_counts(totals.processed, totals.succeeded, totals.failed),
            processed: totals.processed,
            succeeded: totals.succeeded,
            failed: totals.failed,
            error,
            details: totals.details,
        }
    }
}

fn status_label(status: SyncRunStatus) -> &'static str {
    match status {
        SyncRunStatus::Pending => "pending",
        SyncRunStatus::Running => "running",
        SyncRunStatus::Success => "success",
        SyncRunStatus::Partial => "partial",
        SyncRunStatus::Failed => "failed",
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration as ChronoDuration, Utc};
    use serde_json::json;

    use facture_core::types::{CanonicalEntity, EntityStatus};

    use crate::hubspot::{CrmWire, HubspotAdapter, HubspotTokenEndpoint};
    use crate::oauth::{TokenManager, TokenSet};
    use crate::storage::{MemoryAuditLog, MemoryStore};
    use crate::types::Credentials;

    use super::*;

    struct Harness {
        wire: Arc<CrmWire>,
        orchestrator: Arc<SyncOrchestrator>,
        store: Arc<MemoryStore>,
        audit: Arc<MemoryAuditLog>,
        config: IntegrationConfig,
    }

    fn harness() -> Harness {
        let wire = Arc::new(CrmWire::new());
        let endpoint = Arc::new(HubspotTokenEndpoint::new(wire.clone()));
        let initial = TokenSet {
            access_token: "hs-test".to_string(),
            refresh_token: "hs-test-refresh".to_string(),
            expires_at: Utc::now() + ChronoDuration::hours(1),
        };
        wire.grant_token(&initial.access_token);
        let tokens = TokenManager::new("hubspot", endpoint, initial);
        let adapter = Arc::new(HubspotAdapter::new(wire.clone(), tokens));

        let registry = Arc::new(AdapterRegistry::new());
        registry.register(adapter);

        let store = Arc::new(MemoryStore::new());
        let audit = Arc::new(MemoryAuditLog::new());
        let defaults = SyncGlobalConfig {
            batch_size: 100,
            batch_delay_ms: 1,
            max_concurrent_batches: 4,
            retry_attempts: 3,
            retry_delay_ms: 1,
            backoff_multiplier: 2.0,
        };
        let orchestrator = Arc::new(SyncOrchestrator::new(
            registry,
            store.clone() as Arc<dyn EntityStore>,
            audit.clone() as Arc<dyn AuditLog>,
            defaults,
        ));

        let config = IntegrationConfig {
            id: Uuid::new_v4(),
            platform: Platform::Hubspot,
            credentials: Credentials::OAuth {
                access_token: "hs-test".to_string(),
                refresh_token: "hs-test-refresh".to_string(),
                expires_at: Utc::now() + ChronoDuration::hours(1),
            },
            base_url: "https://api.hubapi.com".to_string(),
            timeout_ms: 10_000,
            retry: RetryPolicy {
                max_attempts: 2,
                base_delay_ms: 1,
                multiplier: 2.0,
            },
            sync_interval_minutes: 15,
            sync_enabled: true,
        };

        Harness {
            wire,
            orchestrator,
            store,
            audit,
            config,
        }
    }

    fn ts(raw: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(raw).unwrap().with_timezone(&Utc)
    }

    fn linked_client(
        name: &str,
        external_id: &str,
        local_ts: DateTime<Utc>,
        last_seen: Option<DateTime<Utc>>,
        sync_status: LinkSyncStatus,
    ) -> StoredEntity {
        let mut entity = CanonicalEntity::client(name, None);
        entity.updated_at = local_ts;
        let mut stored = StoredEntity::new(entity);
        stored.links.insert(
            Platform::Hubspot.as_str().to_string(),
            ExternalLink {
                platform: Platform::Hubspot.as_str().to_string(),
                external_id: external_id.to_string(),
                external_updated_at: last_seen,
                sync_status,
                last_error: None,
            },
        );
        stored
    }

    fn pull_options() -> SyncOptions {
        SyncOptions {
            direction: Some(SyncDirection::Pull),
            operation: Some(SyncOperation::Full),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_pull_creates_and_updates() {
        let h = harness();
        h.store
            .upsert(linked_client(
                "Stale Name",
                "c-1",
                ts("2024-03-01T00:00:00Z"),
                Some(ts("2024-03-01T00:00:00Z")),
                LinkSyncStatus::Synced,
            ))
            .await
            .unwrap();

        h.wire.seed(
            "contacts",
            vec![
                json!({"id": "c-1", "name": "Fresh Name", "updatedAt": "2024-03-02T10:00:00Z"}),
                json!({"id": "c-2", "name": "Brand New", "updatedAt": "2024-03-02T11:00:00Z"}),
            ],
        );

        let report = h
            .orchestrator
            .sync_entity(&h.config, EntityType::Client, pull_options())
            .await
            .unwrap();

        assert_eq!(report.status, SyncRunStatus::Success);
        assert_eq!(report.processed, 2);
        assert_eq!(report.succeeded, 2);

        let updated = h
            .store
            .find_by_external_id(Platform::Hubspot, "c-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.entity.name, "Fresh Name");
        let link = updated.link(Platform::Hubspot).unwrap();
        assert_eq!(link.external_updated_at, Some(ts("2024-03-02T10:00:00Z")));
        assert_eq!(link.sync_status, LinkSyncStatus::Synced);

        let created = h
            .store
            .find_by_external_id(Platform::Hubspot, "c-2")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(created.entity.name, "Brand New");

        let entry = h.audit.get_entry(report.log_id).await.unwrap().unwrap();
        assert_eq!(entry.status, SyncRunStatus::Success);
        assert!(entry.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_pull_keeps_newer_local_copy() {
        let h = harness();
        // Local copy edited after the last exchange and after the remote
        // copy's timestamp: last-writer-wins keeps the local edit.
        h.store
            .upsert(linked_client(
                "Edited Locally",
                "c-1",
                ts("2024-03-03T00:00:00Z"),
                Some(ts("2024-03-01T00:00:00Z")),
                LinkSyncStatus::Dirty,
            ))
            .await
            .unwrap();
        h.wire.seed(
            "contacts",
            vec![json!({"id": "c-1", "name": "Older Remote", "updatedAt": "2024-03-02T00:00:00Z"})],
        );

        let report = h
            .orchestrator
            .sync_entity(&h.config, EntityType::Client, pull_options())
            .await
            .unwrap();
        assert_eq!(report.status, SyncRunStatus::Success);
        assert_eq!(report.details[0].action, RecordAction::Skipped);

        let stored = h
            .store
            .find_by_external_id(Platform::Hubspot, "c-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.entity.name, "Edited Locally");
        // Still a push candidate.
        assert_eq!(
            stored.link(Platform::Hubspot).unwrap().sync_status,
            LinkSyncStatus::Dirty
        );
    }

    #[tokio::test]
    async fn test_pull_timestamp_tie_goes_to_remote() {
        let h = harness();
        let tied = ts("2024-03-02T12:00:00Z");
        h.store
            .upsert(linked_client(
                "Local Edit",
                "c-1",
                tied,
                Some(ts("2024-03-01T00:00:00Z")),
                LinkSyncStatus::Dirty,
            ))
            .await
            .unwrap();
        h.wire.seed(
            "contacts",
            vec![json!({"id": "c-1", "name": "Remote Edit", "updatedAt": "2024-03-02T12:00:00Z"})],
        );

        let report = h
            .orchestrator
            .sync_entity(&h.config, EntityType::Client, pull_options())
            .await
            .unwrap();
        assert_eq!(report.details[0].action, RecordAction::Updated);

        let stored = h
            .store
            .find_by_external_id(Platform::Hubspot, "c-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.entity.name, "Remote Edit");
    }

    #[tokio::test]
    async fn test_pull_quarantines_invalid_records() {
        let h = harness();
        h.wire.seed(
            "contacts",
            vec![
                json!({"id": "c-1", "name": "One", "updatedAt": "2024-03-02T10:00:00Z"}),
                json!({"id": "c-2", "name": "Two", "updatedAt": "2024-03-02T10:00:00Z"}),
                // A client needs a name or an email.
                json!({"id": "c-3", "updatedAt": "2024-03-02T10:00:00Z"}),
                json!({"id": "c-4", "name": "Four", "updatedAt": "2024-03-02T10:00:00Z"}),
                json!({"id": "c-5", "name": "Five", "updatedAt": "2024-03-02T10:00:00Z"}),
            ],
        );

        let report = h
            .orchestrator
            .sync_entity(&h.config, EntityType::Client, pull_options())
            .await
            .unwrap();
        assert_eq!(report.status, SyncRunStatus::Partial);
        assert_eq!(report.processed, 5);
        assert_eq!(report.succeeded, 4);
        assert_eq!(report.failed, 1);

        let failed = report
            .details
            .iter()
            .find(|o| o.action == RecordAction::Failed)
            .unwrap();
        assert_eq!(failed.external_id.as_deref(), Some("c-3"));
        assert!(failed.error.is_some());
    }

    #[tokio::test]
    async fn test_push_marks_synced() {
        let h = harness();
        let invoice = CanonicalEntity::invoice("INV-1", 100.0, EntityStatus::Pending);
        let local_id = h.store.upsert(StoredEntity::new(invoice)).await.unwrap();

        let report = h
            .orchestrator
            .sync_entity(
                &h.config,
                EntityType::Invoice,
                SyncOptions {
                    direction: Some(SyncDirection::Push),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(report.status, SyncRunStatus::Success);
        assert_eq!(report.processed, 1);
        assert_eq!(report.details[0].action, RecordAction::Pushed);

        let stored = h.store.get(local_id).await.unwrap().unwrap();
        let link = stored.link(Platform::Hubspot).unwrap();
        assert!(link.external_id.starts_with("crm-"));
        assert_eq!(link.sync_status, LinkSyncStatus::Synced);

        // Nothing left to push.
        let again = h
            .orchestrator
            .sync_entity(
                &h.config,
                EntityType::Invoice,
                SyncOptions {
                    direction: Some(SyncDirection::Push),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(again.status, SyncRunStatus::Success);
        assert_eq!(again.processed, 0);
    }

    /// Delegating store whose link updates always fail, as a relational
    /// backend would during an outage.
    struct BrokenLinkStore {
        inner: MemoryStore,
    }

    #[async_trait::async_trait]
    impl EntityStore for BrokenLinkStore {
        async fn find_by_external_id(
            &self,
            platform: Platform,
            external_id: &str,
        ) -> SyncResult<Option<StoredEntity>> {
            self.inner.find_by_external_id(platform, external_id).await
        }

        async fn get(&self, id: Uuid) -> SyncResult<Option<StoredEntity>> {
            self.inner.get(id).await
        }

        async fn upsert(&self, stored: StoredEntity) -> SyncResult<Uuid> {
            self.inner.upsert(stored).await
        }

        async fn dirty_entities(
            &self,
            platform: Platform,
            entity_type: EntityType,
        ) -> SyncResult<Vec<StoredEntity>> {
            self.inner.dirty_entities(platform, entity_type).await
        }

        async fn mark_synced(
            &self,
            _id: Uuid,
            _platform: Platform,
            _external_id: &str,
        ) -> SyncResult<()> {
            Err(SyncError::transient("link table unavailable"))
        }

        async fn mark_failed(&self, id: Uuid, platform: Platform, detail: &str) -> SyncResult<()> {
            self.inner.mark_failed(id, platform, detail).await
        }
    }

    #[tokio::test]
    async fn test_store_failure_after_push_is_record_level() {
        let h = harness();
        let store = Arc::new(BrokenLinkStore {
            inner: MemoryStore::new(),
        });
        store
            .upsert(StoredEntity::new(CanonicalEntity::invoice(
                "INV-1",
                100.0,
                EntityStatus::Pending,
            )))
            .await
            .unwrap();
        store
            .upsert(StoredEntity::new(CanonicalEntity::invoice(
                "INV-2",
                50.0,
                EntityStatus::Pending,
            )))
            .await
            .unwrap();

        let orchestrator = SyncOrchestrator::new(
            h.orchestrator.registry.clone(),
            store as Arc<dyn EntityStore>,
            h.audit.clone() as Arc<dyn AuditLog>,
            SyncGlobalConfig {
                batch_delay_ms: 1,
                retry_delay_ms: 1,
                ..SyncGlobalConfig::default()
            },
        );

        let report = orchestrator
            .sync_entity(
                &h.config,
                EntityType::Invoice,
                SyncOptions {
                    direction: Some(SyncDirection::Push),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        // Both records were attempted despite the first link failure; the
        // attempt itself completed and was finalized.
        assert_eq!(report.processed, 2);
        assert_eq!(report.failed, 2);
        assert_eq!(report.status, SyncRunStatus::Failed);
        assert!(report.error.is_none());
        assert!(report
            .details
            .iter()
            .all(|o| o.action == RecordAction::Failed && o.external_id.is_some()));

        let entry = h.audit.get_entry(report.log_id).await.unwrap().unwrap();
        assert!(entry.finished_at.is_some());
        assert_eq!(entry.processed, 2);
    }

    #[tokio::test]
    async fn test_disabled_integration_still_finalizes_log() {
        let h = harness();
        let mut config = h.config.clone();
        config.sync_enabled = false;

        let report = h
            .orchestrator
            .sync_entity(&config, EntityType::Client, pull_options())
            .await
            .unwrap();
        assert_eq!(report.status, SyncRunStatus::Failed);
        assert!(report.error.as_deref().unwrap().contains("disabled"));

        let entry = h.audit.get_entry(report.log_id).await.unwrap().unwrap();
        assert_eq!(entry.status, SyncRunStatus::Failed);
        assert!(entry.finished_at.is_some());
        assert!(entry.error.is_some());
    }

    #[tokio::test]
    async fn test_missing_adapter_is_attempt_level() {
        let h = harness();
        let mut config = h.config.clone();
        config.platform = Platform::Asana;

        let report = h
            .orchestrator
            .sync_entity(&config, EntityType::Project, pull_options())
            .await
            .unwrap();
        assert_eq!(report.status, SyncRunStatus::Failed);
        assert!(report.error.as_deref().unwrap().contains("no adapter"));
    }

    #[tokio::test]
    async fn test_bidirectional_nests_child_entries() {
        let h = harness();
        h.wire.seed(
            "deals",
            vec![json!({"id": "d-1", "dealname": "INV-9", "amount": "250", "updatedAt": "2024-03-02T10:00:00Z"})],
        );
        let invoice = CanonicalEntity::invoice("INV-2", 75.0, EntityStatus::Pending);
        h.store.upsert(StoredEntity::new(invoice)).await.unwrap();

        let report = h
            .orchestrator
            .sync_entity(
                &h.config,
                EntityType::Invoice,
                SyncOptions {
                    direction: Some(SyncDirection::Bidirectional),
                    operation: Some(SyncOperation::Full),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(report.status, SyncRunStatus::Success);
        // One pulled, one pushed.
        assert_eq!(report.processed, 2);

        let entries = h.audit.entries_for(h.config.id);
        assert_eq!(entries.len(), 3);
        let children: Vec<_> = entries
            .iter()
            .filter(|e| e.parent_id == Some(report.log_id))
            .collect();
        assert_eq!(children.len(), 2);
        assert!(children.iter().all(|e| e.finished_at.is_some()));
        assert!(children.iter().any(|e| e.direction == SyncDirection::Pull));
        assert!(children.iter().any(|e| e.direction == SyncDirection::Push));
    }

    #[tokio::test]
    async fn test_spawn_and_poll() {
        let h = harness();
        h.wire.seed(
            "contacts",
            vec![json!({"id": "c-1", "name": "Async", "updatedAt": "2024-03-02T10:00:00Z"})],
        );

        let log_id = h
            .orchestrator
            .clone()
            .spawn_sync(h.config.clone(), EntityType::Client, pull_options())
            .await
            .unwrap();

        let mut entry = None;
        for _ in 0..100 {
            let current = h.audit.get_entry(log_id).await.unwrap().unwrap();
            if current.finished_at.is_some() {
                entry = Some(current);
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let entry = entry.expect("sync did not finish in time");
        assert_eq!(entry.status, SyncRunStatus::Success);
        assert_eq!(entry.processed, 1);
    }

    #[tokio::test]
    async fn test_cancel_between_batches() {
        let h = harness();
        let many: Vec<Value> = (1..=30)
            .map(|i| json!({"id": format!("c-{i}"), "name": format!("Client {i}"), "updatedAt": "2024-03-02T10:00:00Z"}))
            .collect();
        h.wire.seed("contacts", many);

        // Small pages with a long inter-batch delay leave a wide window to
        // cancel after the first page.
        let options = SyncOptions {
            direction: Some(SyncDirection::Pull),
            operation: Some(SyncOperation::Full),
            batch_size: Some(5),
            batch_delay_ms: Some(200),
            ..Default::default()
        };
        let log_id = h
            .orchestrator
            .clone()
            .spawn_sync(h.config.clone(), EntityType::Client, options)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.orchestrator.cancel(log_id));

        let mut entry = None;
        for _ in 0..200 {
            let current = h.audit.get_entry(log_id).await.unwrap().unwrap();
            if current.finished_at.is_some() {
                entry = Some(current);
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let entry = entry.expect("cancelled sync did not finish");
        // Cancellation keeps completed work; the attempt is not a failure.
        assert!(entry.processed < 30);
        assert_eq!(entry.status, SyncRunStatus::Success);

        // The flag is gone once the attempt ends.
        assert!(!h.orchestrator.cancel(log_id));
    }

    #[tokio::test]
    async fn test_ingest_records_single_record_path() {
        let h = harness();
        let report = h
            .orchestrator
            .ingest_records(
                &h.config,
                EntityType::Client,
                &[json!({"id": "c-7", "name": "Hooked", "updatedAt": "2024-03-02T10:00:00Z"})],
            )
            .await
            .unwrap();
        assert_eq!(report.status, SyncRunStatus::Success);
        assert_eq!(report.details[0].action, RecordAction::Created);

        let stored = h
            .store
            .find_by_external_id(Platform::Hubspot, "c-7")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.entity.name, "Hooked");
    }
}
