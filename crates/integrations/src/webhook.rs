//! Webhook receiver: signature-verified inbound events routed through the
//! orchestrator's single-record pull path.
//!
//! Signatures are HMAC-SHA256 over the raw request body, hex encoded, with
//! a per-platform shared secret. A payload that fails verification is
//! rejected before any parsing, mutates nothing, and leaves no audit
//! entry.

use std::sync::Arc;

use dashmap::DashMap;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use tracing::{info, warn};

use facture_core::types::EntityType;

use crate::adapter::AdapterRegistry;
use crate::error::{SyncError, SyncResult};
use crate::orchestrator::SyncOrchestrator;
use crate::types::{IntegrationConfig, MutationIntent, Platform, SyncReport};

type HmacSha256 = Hmac<Sha256>;

/// Hex HMAC-SHA256 tag for an outbound body; what a sending platform
/// computes, and what tests use to forge valid requests.
pub fn sign_payload(secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("hmac accepts keys of any length");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time verification of a hex signature against the raw body.
pub fn verify_signature(secret: &str, body: &[u8], signature: &str) -> bool {
    let Ok(provided) = hex::decode(signature.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&provided).is_ok()
}

/// Per-platform webhook registration: the shared secret plus the
/// integration the inbound records belong to.
#[derive(Clone)]
pub struct WebhookEndpoint {
    pub secret: String,
    pub config: IntegrationConfig,
}

/// Outcome of one accepted webhook delivery.
#[derive(Debug)]
pub struct WebhookAck {
    pub reports: Vec<SyncReport>,
}

impl WebhookAck {
    pub fn processed(&self) -> u64 {
        self.reports.iter().map(|r| r.processed).sum()
    }
}

pub struct WebhookReceiver {
    orchestrator: Arc<SyncOrchestrator>,
    registry: Arc<AdapterRegistry>,
    endpoints: DashMap<Platform, WebhookEndpoint>,
}

impl WebhookReceiver {
    pub fn new(orchestrator: Arc<SyncOrchestrator>, registry: Arc<AdapterRegistry>) -> Self {
        Self {
            orchestrator,
            registry,
            endpoints: DashMap::new(),
        }
    }

    pub fn register(&self, platform: Platform, endpoint: WebhookEndpoint) {
        info!(platform = platform.as_str(), "webhook endpoint registered");
        self.endpoints.insert(platform, endpoint);
    }

    /// Handle one delivery: verify, parse, and apply.
    ///
    /// Verification happens against the raw bytes before any JSON parsing.
    /// A bad signature returns an auth error and the attempt leaves no
    /// trace in storage or the audit log.
    pub async fn handle(
        &self,
        platform: Platform,
        signature: &str,
        body: &[u8],
    ) -> SyncResult<WebhookAck> {
        let endpoint = self
            .endpoints
            .get(&platform)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                SyncError::Configuration(format!(
                    "no webhook endpoint registered for {}",
                    platform.as_str()
                ))
            })?;

        if !verify_signature(&endpoint.secret, body, signature) {
            metrics::counter!("facture.webhook.rejected", "platform" => platform.as_str())
                .increment(1);
            warn!(platform = platform.as_str(), "webhook signature rejected");
            return Err(SyncError::auth(platform.as_str(), "webhook signature mismatch"));
        }

        let payload: Value = serde_json::from_slice(body)
            .map_err(|e| SyncError::validation("body", format!("malformed webhook JSON: {e}")))?;

        let adapter = self.registry.get(platform).ok_or_else(|| {
            SyncError::Configuration(format!(
                "no adapter registered for {}",
                platform.as_str()
            ))
        })?;
        let intents = adapter.receive_webhook(&payload).await?;
        metrics::counter!("facture.webhook.accepted", "platform" => platform.as_str())
            .increment(1);

        let mut reports = Vec::new();
        for (entity_type, records) in group_by_entity(intents) {
            let report = self
                .orchestrator
                .ingest_records(&endpoint.config, entity_type, &records)
                .await?;
            reports.push(report);
        }
        Ok(WebhookAck { reports })
    }
}

/// HTTP status an edge layer should answer with for a handler result:
/// 200 on accept, 401 on a rejected signature, 500 for any processing
/// error. Redelivery is the sending platform's concern.
pub fn response_status<T>(result: &SyncResult<T>) -> u16 {
    match result {
        Ok(_) => 200,
        Err(SyncError::Auth { .. }) => 401,
        Err(_) => 500,
    }
}

fn group_by_entity(intents: Vec<MutationIntent>) -> Vec<(EntityType, Vec<Value>)> {
    let mut groups: Vec<(EntityType, Vec<Value>)> = Vec::new();
    for intent in intents {
        match groups.iter_mut().find(|(ty, _)| *ty == intent.entity_type) {
            Some((_, records)) => records.push(intent.record),
            None => groups.push((intent.entity_type, vec![intent.record])),
        }
    }
    groups
}
