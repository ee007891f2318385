//! Third-party platform sync — field mapping, OAuth and API-key adapters,
//! retry, the bidirectional orchestrator, and the webhook receiver.

pub mod adapter;
pub mod asana;
pub mod error;
pub mod hubspot;
pub mod mapper;
pub mod oauth;
pub mod orchestrator;
pub mod retry;
pub mod storage;
pub mod types;
pub mod webhook;

pub use adapter::{AdapterRegistry, PlatformAdapter};
pub use error::{SyncError, SyncResult};
pub use orchestrator::SyncOrchestrator;
pub use retry::{with_retry, RetryPolicy};
pub use storage::{AuditLog, EntityStore, MemoryAuditLog, MemoryStore};
pub use types::{IntegrationConfig, Platform, SyncDirection, SyncOptions, SyncReport};
pub use webhook::{WebhookEndpoint, WebhookReceiver};
