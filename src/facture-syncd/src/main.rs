//! Facture sync daemon — keeps local invoicing data and connected
//! third-party platforms in step.
//!
//! Main entry point: builds the adapters for every enabled platform and
//! drives periodic bidirectional sync runs until shutdown.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::Parser;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use facture_core::config::AppConfig;
use facture_core::types::EntityType;
use facture_integrations::asana::{AsanaAdapter, ProjectWire};
use facture_integrations::hubspot::{CrmWire, HubspotAdapter, HubspotTokenEndpoint};
use facture_integrations::oauth::{TokenManager, TokenSet};
use facture_integrations::storage::{AuditLog, EntityStore, MemoryAuditLog, MemoryStore};
use facture_integrations::types::{Credentials, SyncDirection, SyncOptions};
use facture_integrations::{
    AdapterRegistry, IntegrationConfig, Platform, RetryPolicy, SyncOrchestrator,
};

const DEMO_API_KEY: &str = "pm-demo-key";

#[derive(Parser, Debug)]
#[command(name = "facture-syncd")]
#[command(about = "Third-party platform sync daemon for Facture invoicing")]
#[command(version)]
struct Cli {
    /// Node identifier (overrides config)
    #[arg(long, env = "FACTURE__NODE_ID")]
    node_id: Option<String>,

    /// Sync interval in minutes (overrides per-platform config)
    #[arg(long, env = "FACTURE__SYNC_INTERVAL_MINUTES")]
    interval: Option<u64>,

    /// Run a single sync pass and exit
    #[arg(long, default_value_t = false)]
    once: bool,

    /// Start with empty remote stores instead of demo data
    #[arg(long, default_value_t = false)]
    skip_seed: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "facture_syncd=info,facture_integrations=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("facture-syncd starting up");

    let mut config = AppConfig::load().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(minutes) = cli.interval {
        config.integrations.hubspot.sync_interval_minutes = minutes;
        config.integrations.asana.sync_interval_minutes = minutes;
    }

    info!(
        node_id = %config.node_id,
        batch_size = config.sync.batch_size,
        hubspot_enabled = config.integrations.hubspot.enabled,
        asana_enabled = config.integrations.asana.enabled,
        "Configuration loaded"
    );

    // The wires are the in-process stand-ins for the remote APIs; both
    // are constructed up front so webhook and sync traffic share state.
    let crm_wire = Arc::new(CrmWire::new());
    let pm_wire = Arc::new(ProjectWire::new());
    pm_wire.grant_key(DEMO_API_KEY);
    if !cli.skip_seed {
        seed_remotes(&crm_wire, &pm_wire);
    }

    let registry = Arc::new(AdapterRegistry::new());
    let mut integrations: Vec<IntegrationConfig> = Vec::new();

    if config.integrations.hubspot.enabled {
        let endpoint = Arc::new(HubspotTokenEndpoint::new(crm_wire.clone()));
        let tokens = TokenManager::new(
            Platform::Hubspot.as_str(),
            endpoint,
            TokenSet {
                access_token: String::new(),
                refresh_token: "hs-bootstrap".to_string(),
                // Forces a refresh on first use.
                expires_at: Utc::now(),
            },
        );
        registry.register(Arc::new(HubspotAdapter::new(crm_wire.clone(), tokens)));
        let section = &config.integrations.hubspot;
        integrations.push(IntegrationConfig {
            id: Uuid::new_v4(),
            platform: Platform::Hubspot,
            credentials: Credentials::OAuth {
                access_token: String::new(),
                refresh_token: "hs-bootstrap".to_string(),
                expires_at: Utc::now(),
            },
            base_url: section.base_url.clone(),
            timeout_ms: section.timeout_ms,
            retry: retry_from(&config),
            sync_interval_minutes: section.sync_interval_minutes,
            sync_enabled: true,
        });
    }

    if config.integrations.asana.enabled {
        registry.register(Arc::new(AsanaAdapter::new(
            pm_wire.clone(),
            DEMO_API_KEY.to_string(),
        )));
        let section = &config.integrations.asana;
        integrations.push(IntegrationConfig {
            id: Uuid::new_v4(),
            platform: Platform::Asana,
            credentials: Credentials::ApiKey {
                key: DEMO_API_KEY.to_string(),
            },
            base_url: section.base_url.clone(),
            timeout_ms: section.timeout_ms,
            retry: retry_from(&config),
            sync_interval_minutes: section.sync_interval_minutes,
            sync_enabled: true,
        });
    }

    if integrations.is_empty() {
        warn!("No integrations enabled; set FACTURE__INTEGRATIONS__HUBSPOT__ENABLED=true or FACTURE__INTEGRATIONS__ASANA__ENABLED=true");
        return Ok(());
    }

    let store = Arc::new(MemoryStore::new());
    let audit = Arc::new(MemoryAuditLog::new());
    let orchestrator = Arc::new(SyncOrchestrator::new(
        registry,
        store.clone() as Arc<dyn EntityStore>,
        audit.clone() as Arc<dyn AuditLog>,
        config.sync.clone(),
    ));

    info!(
        integrations = integrations.len(),
        "facture-syncd ready, entering sync loop"
    );

    let mut last_pass: Option<DateTime<Utc>> = None;
    loop {
        let pass_started = Utc::now();
        run_pass(&orchestrator, &integrations, last_pass).await;
        last_pass = Some(pass_started);

        if cli.once {
            info!(entities = store.len(), "single pass complete");
            return Ok(());
        }

        let minutes = integrations
            .iter()
            .map(|i| i.sync_interval_minutes)
            .min()
            .unwrap_or(15)
            .max(1);
        let sleep = tokio::time::sleep(std::time::Duration::from_secs(minutes * 60));
        tokio::select! {
            _ = sleep => {}
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                return Ok(());
            }
        }
    }
}

fn retry_from(config: &AppConfig) -> RetryPolicy {
    RetryPolicy {
        max_attempts: config.sync.retry_attempts,
        base_delay_ms: config.sync.retry_delay_ms,
        multiplier: config.sync.backoff_multiplier,
    }
}

/// One bidirectional pass over every configured integration and entity
/// type it can sync. Reports are logged; the audit trail holds the rest.
async fn run_pass(
    orchestrator: &Arc<SyncOrchestrator>,
    integrations: &[IntegrationConfig],
    modified_since: Option<DateTime<Utc>>,
) {
    for integration in integrations {
        let entity_types: &[EntityType] = match integration.platform {
            Platform::Hubspot => &[EntityType::Client, EntityType::Invoice],
            Platform::Asana => &[EntityType::Project, EntityType::Task],
        };
        for &entity_type in entity_types {
            let options = SyncOptions {
                direction: Some(SyncDirection::Bidirectional),
                modified_since,
                ..Default::default()
            };
            match orchestrator
                .sync_entity(integration, entity_type, options)
                .await
            {
                Ok(report) => info!(
                    platform = integration.platform.as_str(),
                    entity = entity_type.as_str(),
                    status = ?report.status,
                    processed = report.processed,
                    succeeded = report.succeeded,
                    failed = report.failed,
                    "sync pass finished"
                ),
                Err(e) => warn!(
                    platform = integration.platform.as_str(),
                    entity = entity_type.as_str(),
                    error = %e,
                    "sync pass could not start"
                ),
            }
        }
    }
}

/// Demo data, as if customers had already been working in both platforms.
fn seed_remotes(crm: &CrmWire, pm: &ProjectWire) {
    crm.seed(
        "contacts",
        vec![
            json!({"id": "c-1001", "name": "Atelier Lumière", "email": "compta@lumiere.example", "updatedAt": "2026-08-20T09:15:00Z"}),
            json!({"id": "c-1002", "name": "Nordwind GmbH", "email": "billing@nordwind.example", "updatedAt": "2026-08-22T14:40:00Z"}),
        ],
    );
    crm.seed(
        "deals",
        vec![
            json!({"id": "d-2001", "dealname": "INV-2026-0042", "amount": "1 850,00 €", "dealstage": "paid", "updatedAt": "2026-08-21T08:00:00Z"}),
        ],
    );
    pm.seed(
        "projects",
        vec![
            json!({"gid": "p-3001", "name": "Site redesign", "modified_at": "2026-08-19T11:00:00Z"}),
        ],
    );
    pm.seed(
        "tasks",
        vec![
            json!({"gid": "t-4001", "name": "Draft quotation", "completed": false, "modified_at": "2026-08-23T16:20:00Z"}),
        ],
    );
}
