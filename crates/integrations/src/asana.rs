//! Asana project-management adapter — personal access token auth,
//! projects and tasks.
//!
//! Same simulated-wire idiom as the CRM adapter (in production:
//! `https://app.asana.com/api/1.0` with an `Authorization: Bearer <PAT>`
//! header attached per request). API-key auth has no refresh path; a
//! rejected key is terminal until reconfigured.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use tracing::info;

use facture_core::types::EntityType;

use crate::adapter::PlatformAdapter;
use crate::error::{SyncError, SyncResult};
use crate::types::{EntityFilter, EntityPage, Platform};

#[derive(Debug, Clone)]
struct RemoteObject {
    gid: String,
    payload: Value,
    modified_at: DateTime<Utc>,
}

/// Simulated Asana wire; the client object passed to the adapter at
/// construction.
pub struct ProjectWire {
    projects: parking_lot::Mutex<Vec<RemoteObject>>,
    tasks: parking_lot::Mutex<Vec<RemoteObject>>,
    valid_keys: DashMap<String, ()>,
    id_counter: AtomicU64,
}

impl ProjectWire {
    pub fn new() -> Self {
        Self {
            projects: parking_lot::Mutex::new(Vec::new()),
            tasks: parking_lot::Mutex::new(Vec::new()),
            valid_keys: DashMap::new(),
            id_counter: AtomicU64::new(0),
        }
    }

    pub fn grant_key(&self, key: &str) {
        self.valid_keys.insert(key.to_string(), ());
    }

    pub fn revoke_key(&self, key: &str) {
        self.valid_keys.remove(key);
    }

    pub fn key_is_live(&self, key: &str) -> bool {
        self.valid_keys.contains_key(key)
    }

    fn check_key(&self, key: &str) -> SyncResult<()> {
        if self.key_is_live(key) {
            Ok(())
        } else {
            Err(SyncError::from_status(401, "asana", "personal access token rejected"))
        }
    }

    fn store(&self, kind: &str) -> SyncResult<&parking_lot::Mutex<Vec<RemoteObject>>> {
        match kind {
            "projects" => Ok(&self.projects),
            "tasks" => Ok(&self.tasks),
            other => Err(SyncError::TerminalRemote {
                status: 404,
                detail: format!("unknown resource '{other}'"),
            }),
        }
    }

    fn next_gid(&self) -> String {
        format!("pm-{}", self.id_counter.fetch_add(1, Ordering::Relaxed) + 1)
    }

    pub fn seed(&self, kind: &str, payloads: Vec<Value>) {
        let store = self.store(kind).expect("seed uses known kinds");
        let mut objects = store.lock();
        for payload in payloads {
            let gid = payload
                .get("gid")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| self.next_gid());
            let modified_at = payload
                .get("modified_at")
                .and_then(|v| v.as_str())
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(Utc::now);
            objects.push(RemoteObject {
                gid,
                payload,
                modified_at,
            });
        }
    }

    fn list(
        &self,
        kind: &str,
        key: &str,
        filter: &EntityFilter,
        cursor: Option<&str>,
        page_size: usize,
    ) -> SyncResult<EntityPage> {
        self.check_key(key)?;
        let objects = self.store(kind)?.lock();
        let filtered: Vec<&RemoteObject> = objects
            .iter()
            .filter(|o| {
                filter
                    .modified_since
                    .map_or(true, |since| o.modified_at > since)
            })
            .filter(|o| {
                filter
                    .external_ids
                    .as_ref()
                    .map_or(true, |gids| gids.iter().any(|gid| *gid == o.gid))
            })
            .collect();

        let offset: usize = match cursor {
            Some(raw) => raw.parse().map_err(|_| SyncError::TerminalRemote {
                status: 400,
                detail: format!("malformed cursor '{raw}'"),
            })?,
            None => 0,
        };

        let records: Vec<Value> = filtered
            .iter()
            .skip(offset)
            .take(page_size)
            .map(|o| o.payload.clone())
            .collect();
        let next_cursor = if offset + records.len() < filtered.len() {
            Some((offset + records.len()).to_string())
        } else {
            None
        };
        Ok(EntityPage {
            records,
            next_cursor,
        })
    }

    fn upsert(&self, kind: &str, key: &str, payload: &Value) -> SyncResult<String> {
        self.check_key(key)?;
        if !payload.is_object() {
            return Err(SyncError::TerminalRemote {
                status: 400,
                detail: "payload must be a JSON object".to_string(),
            });
        }
        let mut objects = self.store(kind)?.lock();
        let incoming = payload.get("gid").and_then(|v| v.as_str());

        if let Some(gid) = incoming {
            if let Some(existing) = objects.iter_mut().find(|o| o.gid == gid) {
                existing.payload = payload.clone();
                existing.modified_at = Utc::now();
                return Ok(gid.to_string());
            }
        }

        let gid = incoming
            .map(str::to_string)
            .unwrap_or_else(|| self.next_gid());
        let mut stored = payload.clone();
        stored["gid"] = Value::String(gid.clone());
        objects.push(RemoteObject {
            gid: gid.clone(),
            payload: stored,
            modified_at: Utc::now(),
        });
        Ok(gid)
    }
}

impl Default for ProjectWire {
    fn default() -> Self {
        Self::new()
    }
}

/// Asana adapter. The personal access token is attached per request and
/// never refreshed.
pub struct AsanaAdapter {
    wire: Arc<ProjectWire>,
    api_key: String,
}

impl AsanaAdapter {
    pub fn new(wire: Arc<ProjectWire>, api_key: String) -> Self {
        info!("Asana adapter initialized");
        Self { wire, api_key }
    }

    fn resource(entity_type: EntityType) -> SyncResult<&'static str> {
        match entity_type {
            EntityType::Project => Ok("projects"),
            EntityType::Task => Ok("tasks"),
            other => Err(SyncError::Configuration(format!(
                "asana does not sync {}",
                other.as_str()
            ))),
        }
    }
}

#[async_trait]
impl PlatformAdapter for AsanaAdapter {
    fn platform(&self) -> Platform {
        Platform::Asana
    }

    async fn authenticate(&self) -> SyncResult<()> {
        self.wire.check_key(&self.api_key)
    }

    async fn validate_connection(&self) -> SyncResult<bool> {
        Ok(self.wire.key_is_live(&self.api_key))
    }

    async fn fetch_entities(
        &self,
        entity_type: EntityType,
        filter: &EntityFilter,
        cursor: Option<&str>,
    ) -> SyncResult<EntityPage> {
        let resource = Self::resource(entity_type)?;
        let page_size = filter
            .page_size
            .unwrap_or_else(|| self.platform().default_batch_size());
        self.wire.list(resource, &self.api_key, filter, cursor, page_size)
    }

    async fn upsert_entity(
        &self,
        entity_type: EntityType,
        payload: &Value,
    ) -> SyncResult<String> {
        let resource = Self::resource(entity_type)?;
        self.wire.upsert(resource, &self.api_key, payload)
    }

    // receive_webhook keeps the default unsupported implementation.
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn live_adapter() -> (Arc<ProjectWire>, AsanaAdapter) {
        let wire = Arc::new(ProjectWire::new());
        wire.grant_key("pat-123");
        let adapter = AsanaAdapter::new(wire.clone(), "pat-123".to_string());
        (wire, adapter)
    }

    #[tokio::test]
    async fn test_api_key_auth_has_no_refresh_path() {
        let (wire, adapter) = live_adapter();
        assert!(adapter.validate_connection().await.unwrap());

        wire.revoke_key("pat-123");
        assert!(!adapter.validate_connection().await.unwrap());
        // A data call with a revoked key stays an auth error; nothing
        // refreshes it back to life.
        let err = adapter
            .fetch_entities(EntityType::Task, &EntityFilter::default(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Auth { .. }));
    }

    #[tokio::test]
    async fn test_fetch_and_upsert_tasks() {
        let (wire, adapter) = live_adapter();
        wire.seed(
            "tasks",
            vec![
                json!({"gid": "t-1", "name": "Relancer Acme", "completed": false}),
                json!({"gid": "t-2", "name": "Envoyer devis", "completed": true}),
            ],
        );

        let page = adapter
            .fetch_entities(EntityType::Task, &EntityFilter::default(), None)
            .await
            .unwrap();
        assert_eq!(page.records.len(), 2);
        assert!(page.next_cursor.is_none());

        let gid = adapter
            .upsert_entity(EntityType::Task, &json!({"name": "Nouveau suivi"}))
            .await
            .unwrap();
        assert!(gid.starts_with("pm-"));

        let updated = adapter
            .upsert_entity(
                EntityType::Task,
                &json!({"gid": gid, "name": "Nouveau suivi", "completed": true}),
            )
            .await
            .unwrap();
        assert_eq!(updated, gid);
    }

    #[tokio::test]
    async fn test_webhooks_unsupported() {
        let (_wire, adapter) = live_adapter();
        let err = adapter
            .receive_webhook(&json!({"records": []}))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::TerminalRemote { status: 404, .. }));
    }

    #[tokio::test]
    async fn test_modified_since_filter() {
        let (wire, adapter) = live_adapter();
        wire.seed(
            "projects",
            vec![
                json!({"gid": "p-1", "name": "Site web", "modified_at": "2024-01-01T00:00:00Z"}),
                json!({"gid": "p-2", "name": "Refonte", "modified_at": "2024-06-01T00:00:00Z"}),
            ],
        );
        let filter = EntityFilter {
            modified_since: Some(
                DateTime::parse_from_rfc3339("2024-03-01T00:00:00Z")
                    .unwrap()
                    .with_timezone(&Utc),
            ),
            ..Default::default()
        };
        let page = adapter
            .fetch_entities(EntityType::Project, &filter, None)
            .await
            .unwrap();
        assert_eq!(page.records.len(), 1);
        assert_eq!(page.records[0]["gid"], json!("p-2"));
    }

    #[tokio::test]
    async fn test_external_id_filter() {
        let (wire, adapter) = live_adapter();
        wire.seed(
            "tasks",
            vec![
                json!({"gid": "t-1", "name": "First"}),
                json!({"gid": "t-2", "name": "Second"}),
                json!({"gid": "t-3", "name": "Third"}),
            ],
        );
        let filter = EntityFilter {
            external_ids: Some(vec!["t-1".to_string(), "t-3".to_string()]),
            ..Default::default()
        };
        let page = adapter
            .fetch_entities(EntityType::Task, &filter, None)
            .await
            .unwrap();
        assert_eq!(page.records.len(), 2);
    }
}
