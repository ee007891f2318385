//! HubSpot CRM adapter — OAuth, clients as contacts, invoices as deals.
//!
//! The wire is simulated in-memory: `CrmWire` stands in for the HTTP
//! client plus the remote object store, shaping payloads the way the real
//! API does (in production: `GET/POST https://api.hubapi.com/crm/v3/objects/...`
//! with a bearer token). A rejected bearer token triggers a transparent
//! single-flight refresh and exactly one retry of the original call.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, info};

use facture_core::types::EntityType;

use crate::adapter::PlatformAdapter;
use crate::error::{SyncError, SyncResult};
use crate::mapper;
use crate::oauth::{TokenEndpoint, TokenManager, TokenSet};
use crate::types::{EntityFilter, EntityPage, MutationIntent, Platform};

/// One object as the remote stores it.
#[derive(Debug, Clone)]
struct RemoteObject {
    id: String,
    payload: Value,
    modified_at: DateTime<Utc>,
}

/// Simulated HubSpot wire: the explicitly constructed client object the
/// adapter owns. Holds remote state and the set of currently-live bearer
/// tokens.
pub struct CrmWire {
    contacts: parking_lot::Mutex<Vec<RemoteObject>>,
    deals: parking_lot::Mutex<Vec<RemoteObject>>,
    valid_tokens: DashMap<String, ()>,
    id_counter: AtomicU64,
}

impl CrmWire {
    pub fn new() -> Self {
        Self {
            contacts: parking_lot::Mutex::new(Vec::new()),
            deals: parking_lot::Mutex::new(Vec::new()),
            valid_tokens: DashMap::new(),
            id_counter: AtomicU64::new(0),
        }
    }

    /// Mark a bearer token as live (what the real token endpoint does
    /// server-side when it issues one).
    pub fn grant_token(&self, token: &str) {
        self.valid_tokens.insert(token.to_string(), ());
    }

    /// Revoke a bearer token; subsequent calls with it 401.
    pub fn revoke_token(&self, token: &str) {
        self.valid_tokens.remove(token);
    }

    fn check_token(&self, token: &str) -> SyncResult<()> {
        if self.valid_tokens.contains_key(token) {
            Ok(())
        } else {
            Err(SyncError::from_status(401, "hubspot", "bearer token rejected"))
        }
    }

    fn store(&self, kind: &str) -> SyncResult<&parking_lot::Mutex<Vec<RemoteObject>>> {
        match kind {
            "contacts" => Ok(&self.contacts),
            "deals" => Ok(&self.deals),
            other => Err(SyncError::TerminalRemote {
                status: 404,
                detail: format!("unknown object type '{other}'"),
            }),
        }
    }

    pub fn ping(&self, token: &str) -> bool {
        self.valid_tokens.contains_key(token)
    }

    /// Seed remote objects directly, as if another client had written them.
    pub fn seed(&self, kind: &str, payloads: Vec<Value>) {
        let store = self.store(kind).expect("seed uses known kinds");
        let mut objects = store.lock();
        for payload in payloads {
            let id = payload
                .get("id")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| self.next_id());
            let modified_at = payload
                .get("updatedAt")
                .and_then(|v| v.as_str())
                .and_then(|s| {
                    // Full timestamps keep their time of day; date-only
                    // values fall back to midnight.
                    DateTime::parse_from_rfc3339(s)
                        .ok()
                        .map(|dt| dt.with_timezone(&Utc))
                        .or_else(|| {
                            mapper::parse_date(s)
                                .and_then(|d| d.and_hms_opt(0, 0, 0))
                                .map(|ndt| DateTime::from_naive_utc_and_offset(ndt, Utc))
                        })
                })
                .unwrap_or_else(Utc::now);
            objects.push(RemoteObject {
                id,
                payload,
                modified_at,
            });
        }
    }

    fn next_id(&self) -> String {
        format!("crm-{}", self.id_counter.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn list(
        &self,
        kind: &str,
        token: &str,
        filter: &EntityFilter,
        cursor: Option<&str>,
        page_size: usize,
    ) -> SyncResult<EntityPage> {
        self.check_token(token)?;
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
                    .map_or(true, |ids| ids.iter().any(|id| *id == o.id))
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

    fn upsert(&self, kind: &str, token: &str, payload: &Value) -> SyncResult<String> {
        self.check_token(token)?;
        if !payload.is_object() {
            return Err(SyncError::TerminalRemote {
                status: 400,
                detail: "payload must be a JSON object".to_string(),
            });
        }
        let mut objects = self.store(kind)?.lock();
        let incoming_id = payload.get("id").and_then(|v| v.as_str());

        if let Some(id) = incoming_id {
            if let Some(existing) = objects.iter_mut().find(|o| o.id == id) {
                // Idempotent update; unchanged payloads are accepted as-is.
                existing.payload = payload.clone();
                existing.modified_at = Utc::now();
                return Ok(id.to_string());
            }
        }

        let id = incoming_id
            .map(str::to_string)
            .unwrap_or_else(|| self.next_id());
        let mut stored = payload.clone();
        stored["id"] = Value::String(id.clone());
        objects.push(RemoteObject {
            id: id.clone(),
            payload: stored,
            modified_at: Utc::now(),
        });
        Ok(id)
    }
}

impl Default for CrmWire {
    fn default() -> Self {
        Self::new()
    }
}

/// Simulated HubSpot token endpoint, issuing bearer tokens the wire will
/// accept. In production: `POST https://api.hubapi.com/oauth/v1/token`.
pub struct HubspotTokenEndpoint {
    wire: Arc<CrmWire>,
    issued: AtomicU64,
}

impl HubspotTokenEndpoint {
    pub fn new(wire: Arc<CrmWire>) -> Self {
        Self {
            wire,
            issued: AtomicU64::new(0),
        }
    }

    fn issue(&self) -> TokenSet {
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        let token = TokenSet {
            access_token: format!("hs-access-{n}"),
            refresh_token: format!("hs-refresh-{n}"),
            expires_at: Utc::now() + Duration::hours(6),
        };
        self.wire.grant_token(&token.access_token);
        token
    }

    pub fn issued_count(&self) -> u64 {
        self.issued.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenEndpoint for HubspotTokenEndpoint {
    async fn exchange_code(&self, code: &str, _state: &str) -> SyncResult<TokenSet> {
        if code.is_empty() {
            return Err(SyncError::auth("hubspot", "empty authorization code"));
        }
        Ok(self.issue())
    }

    async fn refresh(&self, refresh_token: &str) -> SyncResult<TokenSet> {
        if refresh_token.is_empty() {
            return Err(SyncError::auth("hubspot", "refresh token revoked"));
        }
        debug!("hubspot refresh token exchanged");
        Ok(self.issue())
    }
}

/// HubSpot adapter. Owns its wire client and token manager; never touches
/// local storage.
pub struct HubspotAdapter {
    wire: Arc<CrmWire>,
    tokens: TokenManager,
}

impl HubspotAdapter {
    pub fn new(wire: Arc<CrmWire>, tokens: TokenManager) -> Self {
        info!("HubSpot adapter initialized");
        Self { wire, tokens }
    }

    fn object_kind(entity_type: EntityType) -> SyncResult<&'static str> {
        match entity_type {
            EntityType::Client => Ok("contacts"),
            EntityType::Invoice => Ok("deals"),
            other => Err(SyncError::Configuration(format!(
                "hubspot does not sync {}",
                other.as_str()
            ))),
        }
    }

    /// Run one authenticated call. On a 401 the token is refreshed
    /// (single-flighted) and the call re-issued exactly once.
    async fn with_auth<T, F, Fut>(&self, mut call: F) -> SyncResult<T>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        let token = self.tokens.access_token().await?;
        match call(token.clone()).await {
            Err(SyncError::Auth { .. }) => {
                let fresh = self.tokens.refresh_after_unauthorized(&token).await?;
                call(fresh).await
            }
            other => other,
        }
    }
}

#[async_trait]
impl PlatformAdapter for HubspotAdapter {
    fn platform(&self) -> Platform {
        Platform::Hubspot
    }

    async fn authenticate(&self) -> SyncResult<()> {
        self.with_auth(|token| async move {
            if self.wire.ping(&token) {
                Ok(())
            } else {
                Err(SyncError::from_status(401, "hubspot", "token not accepted"))
            }
        })
        .await
    }

    async fn validate_connection(&self) -> SyncResult<bool> {
        // Revoked-but-well-formed credentials answer false, never Err.
        match self.authenticate().await {
            Ok(()) => Ok(true),
            Err(SyncError::Auth { .. }) => Ok(false),
            Err(other) => Err(other),
        }
    }

    async fn fetch_entities(
        &self,
        entity_type: EntityType,
        filter: &EntityFilter,
        cursor: Option<&str>,
    ) -> SyncResult<EntityPage> {
        let kind = Self::object_kind(entity_type)?;
        let page_size = filter
            .page_size
            .unwrap_or_else(|| self.platform().default_batch_size());
        self.with_auth(|token| async move {
            self.wire.list(kind, &token, filter, cursor, page_size)
        })
        .await
    }

    async fn upsert_entity(
        &self,
        entity_type: EntityType,
        payload: &Value,
    ) -> SyncResult<String> {
        let kind = Self::object_kind(entity_type)?;
        self.with_auth(|token| async move { self.wire.upsert(kind, &token, payload) })
            .await
    }

    async fn receive_webhook(&self, payload: &Value) -> SyncResult<Vec<MutationIntent>> {
        let subscription = payload
            .get("subscription")
            .and_then(|v| v.as_str())
            .ok_or_else(|| SyncError::validation("subscription", "missing in webhook payload"))?;
        let entity_type = match subscription {
            "contact" => EntityType::Client,
            "deal" => EntityType::Invoice,
            other => {
                return Err(SyncError::validation(
                    "subscription",
                    format!("unknown subscription '{other}'"),
                ))
            }
        };
        let records = payload
            .get("records")
            .and_then(|v| v.as_array())
            .ok_or_else(|| SyncError::validation("records", "missing in webhook payload"))?;
        Ok(records
            .iter()
            .cloned()
            .map(|record| MutationIntent {
                entity_type,
                record,
            })
            .collect())
    }
}
