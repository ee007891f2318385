use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of business object a canonical entity represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Client,
    Invoice,
    Project,
    Task,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Client => "client",
            EntityType::Invoice => "invoice",
            EntityType::Project => "project",
            EntityType::Task => "task",
        }
    }
}

/// Lifecycle status of a canonical entity, normalized from the many
/// vocabularies the external platforms use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityStatus {
    Draft,
    Pending,
    Active,
    Paid,
    Overdue,
    Cancelled,
    Completed,
}

impl EntityStatus {
    /// Map a remote status string onto the fixed vocabulary. Unknown
    /// values fall back to `Pending`.
    pub fn normalize(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "draft" | "brouillon" => EntityStatus::Draft,
            "pending" | "open" | "sent" | "awaiting" | "todo" | "not_started" => {
                EntityStatus::Pending
            }
            "active" | "in_progress" | "inprogress" | "ongoing" | "current" => {
                EntityStatus::Active
            }
            "paid" | "settled" | "payee" => EntityStatus::Paid,
            "overdue" | "late" | "past_due" => EntityStatus::Overdue,
            "cancelled" | "canceled" | "void" | "annulee" => EntityStatus::Cancelled,
            "completed" | "complete" | "done" | "closed" | "won" => EntityStatus::Completed,
            _ => EntityStatus::Pending,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityStatus::Draft => "draft",
            EntityStatus::Pending => "pending",
            EntityStatus::Active => "active",
            EntityStatus::Paid => "paid",
            EntityStatus::Overdue => "overdue",
            EntityStatus::Cancelled => "cancelled",
            EntityStatus::Completed => "completed",
        }
    }
}

/// Platform-agnostic local representation of a business object.
///
/// `name` carries the client name, invoice number, or project/task title
/// depending on `entity_type`. Fields with no canonical slot live in the
/// open `extra` map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalEntity {
    pub id: Uuid,
    pub entity_type: EntityType,
    pub name: String,
    pub email: Option<String>,
    pub amount: Option<f64>,
    pub status: EntityStatus,
    pub issued_on: Option<NaiveDate>,
    pub due_on: Option<NaiveDate>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl CanonicalEntity {
    pub fn client(name: &str, email: Option<&str>) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity_type: EntityType::Client,
            name: name.to_string(),
            email: email.map(str::to_string),
            amount: None,
            status: EntityStatus::Active,
            issued_on: None,
            due_on: None,
            updated_at: Utc::now(),
            extra: HashMap::new(),
        }
    }

    pub fn invoice(number: &str, amount: f64, status: EntityStatus) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity_type: EntityType::Invoice,
            name: number.to_string(),
            email: None,
            amount: Some(amount),
            status,
            issued_on: None,
            due_on: None,
            updated_at: Utc::now(),
            extra: HashMap::new(),
        }
    }

    pub fn task(title: &str, status: EntityStatus) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity_type: EntityType::Task,
            name: title.to_string(),
            email: None,
            amount: None,
            status,
            issued_on: None,
            due_on: None,
            updated_at: Utc::now(),
            extra: HashMap::new(),
        }
    }
}

/// Synchronization state of one local entity against one platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkSyncStatus {
    Synced,
    Dirty,
    Failed,
}

/// Binding between a local entity and its remote counterpart.
///
/// At most one link exists per (platform, local entity); the storage
/// layer keys on that pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalLink {
    pub platform: String,
    pub external_id: String,
    /// Remote-side modification timestamp recorded at the last sync;
    /// the last-writer-wins comparison point.
    pub external_updated_at: Option<DateTime<Utc>>,
    pub sync_status: LinkSyncStatus,
    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_normalization() {
        assert_eq!(EntityStatus::normalize("Paid"), EntityStatus::Paid);
        assert_eq!(EntityStatus::normalize("IN_PROGRESS"), EntityStatus::Active);
        assert_eq!(EntityStatus::normalize("done"), EntityStatus::Completed);
        assert_eq!(EntityStatus::normalize("brouillon"), EntityStatus::Draft);
        // Unknown vocabulary falls back to the explicit default.
        assert_eq!(
            EntityStatus::normalize("something-else"),
            EntityStatus::Pending
        );
    }

    #[test]
    fn test_entity_constructors() {
        let client = CanonicalEntity::client("Acme", Some("a@acme.test"));
        assert_eq!(client.entity_type, EntityType::Client);
        assert_eq!(client.email.as_deref(), Some("a@acme.test"));

        let invoice = CanonicalEntity::invoice("INV-2024-007", 1234.56, EntityStatus::Pending);
        assert_eq!(invoice.entity_type, EntityType::Invoice);
        assert_eq!(invoice.amount, Some(1234.56));
    }
}
