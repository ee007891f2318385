//! Bidirectional field mapper between canonical entities and platform
//! payload shapes.
//!
//! Inbound extraction walks an ordered candidate-name list per field
//! (first non-null wins) with dot-path lookup for nested shapes, then
//! coerces values: dates parsed to ISO, monetary strings stripped of
//! symbols and separators, statuses normalized through the fixed
//! vocabulary. Outbound is the inverse static field-name mapping; money
//! is rounded to 2 decimals at this boundary only.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde_json::Value;

use facture_core::types::{CanonicalEntity, EntityStatus, EntityType};

use crate::error::{SyncError, SyncResult};
use crate::types::Platform;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Email,
    Money,
    Date,
    Status,
}

/// Declarative local<->remote correspondence for one canonical field.
///
/// `remote` is always itself a member of `candidates`, which makes
/// re-mapping already-mapped data idempotent.
#[derive(Debug, Clone, Copy)]
pub struct MappingRule {
    pub canonical: &'static str,
    pub candidates: &'static [&'static str],
    pub remote: &'static str,
    pub kind: FieldKind,
}

const HUBSPOT_CLIENT: &[MappingRule] = &[
    MappingRule {
        canonical: "name",
        candidates: &["name", "properties.firstname", "company"],
        remote: "name",
        kind: FieldKind::Text,
    },
    MappingRule {
        canonical: "email",
        candidates: &["email", "properties.email"],
        remote: "email",
        kind: FieldKind::Email,
    },
    MappingRule {
        canonical: "status",
        candidates: &["status", "properties.lifecyclestage", "lifecyclestage"],
        remote: "status",
        kind: FieldKind::Status,
    },
];

const HUBSPOT_INVOICE: &[MappingRule] = &[
    MappingRule {
        canonical: "name",
        candidates: &["name", "invoice_number", "properties.dealname", "dealname"],
        remote: "name",
        kind: FieldKind::Text,
    },
    MappingRule {
        canonical: "amount",
        candidates: &["amount", "properties.amount", "total"],
        remote: "amount",
        kind: FieldKind::Money,
    },
    MappingRule {
        canonical: "status",
        candidates: &["status", "properties.dealstage", "dealstage"],
        remote: "status",
        kind: FieldKind::Status,
    },
    MappingRule {
        canonical: "issued_on",
        candidates: &["issued_on", "issue_date", "createdate"],
        remote: "issued_on",
        kind: FieldKind::Date,
    },
    MappingRule {
        canonical: "due_on",
        candidates: &["due_on", "due_date", "closedate"],
        remote: "due_on",
        kind: FieldKind::Date,
    },
];

const ASANA_PROJECT: &[MappingRule] = &[
    MappingRule {
        canonical: "name",
        candidates: &["name", "title"],
        remote: "name",
        kind: FieldKind::Text,
    },
    MappingRule {
        canonical: "status",
        candidates: &["status", "current_status.text", "archived"],
        remote: "status",
        kind: FieldKind::Status,
    },
    MappingRule {
        canonical: "due_on",
        candidates: &["due_on", "due_date"],
        remote: "due_on",
        kind: FieldKind::Date,
    },
];

const ASANA_TASK: &[MappingRule] = &[
    MappingRule {
        canonical: "name",
        candidates: &["name", "title"],
        remote: "name",
        kind: FieldKind::Text,
    },
    MappingRule {
        canonical: "status",
        candidates: &["status", "completed"],
        remote: "status",
        kind: FieldKind::Status,
    },
    MappingRule {
        canonical: "due_on",
        candidates: &["due_on", "due_at", "due_date"],
        remote: "due_on",
        kind: FieldKind::Date,
    },
];

/// Static rule table for one (platform, entity type) pair. `None` means
/// the platform does not carry that entity type.
pub fn rules_for(platform: Platform, entity_type: EntityType) -> Option<&'static [MappingRule]> {
    match (platform, entity_type) {
        (Platform::Hubspot, EntityType::Client) => Some(HUBSPOT_CLIENT),
        (Platform::Hubspot, EntityType::Invoice) => Some(HUBSPOT_INVOICE),
        (Platform::Asana, EntityType::Project) => Some(ASANA_PROJECT),
        (Platform::Asana, EntityType::Task) => Some(ASANA_TASK),
        _ => None,
    }
}

fn external_id_candidates(platform: Platform) -> &'static [&'static str] {
    match platform {
        Platform::Hubspot => &["id", "vid", "objectId", "external_id"],
        Platform::Asana => &["gid", "id", "external_id"],
    }
}

fn updated_at_candidates(platform: Platform) -> &'static [&'static str] {
    match platform {
        Platform::Hubspot => &[
            "updatedAt",
            "updated_at",
            "properties.hs_lastmodifieddate",
            "hs_lastmodifieddate",
        ],
        Platform::Asana => &["modified_at", "updated_at", "updatedAt"],
    }
}

/// Remote field the external id is written under on the outbound side.
pub fn external_id_field(platform: Platform) -> &'static str {
    match platform {
        Platform::Hubspot => "id",
        Platform::Asana => "gid",
    }
}

/// A record mapped into canonical field names with coerced values.
#[derive(Debug, Clone)]
pub struct MappedRecord {
    pub external_id: Option<String>,
    pub external_updated_at: Option<DateTime<Utc>>,
    pub fields: HashMap<String, Value>,
}

#[derive(Debug, Clone)]
pub struct RuleViolation {
    pub field: String,
    pub detail: String,
}

#[derive(Debug, Clone)]
pub struct BatchFailure {
    pub index: usize,
    pub external_id: Option<String>,
    pub error: String,
}

/// Result of mapping a batch: one record's failure never blocks the rest.
#[derive(Debug, Default)]
pub struct BatchMapOutcome {
    pub mapped: Vec<MappedRecord>,
    pub failures: Vec<BatchFailure>,
}

/// Resolve an ordered candidate list against a raw payload; dot-separated
/// candidates descend into nested objects. First non-null hit wins.
fn lookup<'a>(raw: &'a Value, candidates: &[&str]) -> Option<&'a Value> {
    for candidate in candidates {
        let mut current = raw;
        let mut found = true;
        for segment in candidate.split('.') {
            match current.get(segment) {
                Some(next) => current = next,
                None => {
                    found = false;
                    break;
                }
            }
        }
        if found && !current.is_null() {
            return Some(current);
        }
    }
    None
}

fn value_to_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Strip currency symbols, spaces, and grouping separators from a
/// monetary string; normalize the decimal separator to a dot.
pub fn parse_money(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, ',' | '.' | '-'))
        .collect();
    if cleaned.is_empty() {
        return None;
    }

    let last_comma = cleaned.rfind(',');
    let last_dot = cleaned.rfind('.');
    let normalized = match (last_comma, last_dot) {
        (Some(c), Some(d)) => {
            // The later separator is the decimal one; the other groups.
            let (decimal, group) = if c > d { (',', '.') } else { ('.', ',') };
            cleaned
                .chars()
                .filter(|&ch| ch != group)
                .map(|ch| if ch == decimal { '.' } else { ch })
                .collect::<String>()
        }
        (Some(c), None) => {
            let digits_after = cleaned.len() - c - 1;
            if cleaned.matches(',').count() == 1 && (1..=2).contains(&digits_after) {
                cleaned.replacen(',', ".", 1)
            } else {
                cleaned.replace(',', "")
            }
        }
        (None, Some(d)) => {
            let digits_after = cleaned.len() - d - 1;
            if cleaned.matches('.').count() == 1 && (1..=2).contains(&digits_after) {
                cleaned
            } else {
                cleaned.replace('.', "")
            }
        }
        (None, None) => cleaned,
    };

    normalized.parse::<f64>().ok()
}

/// Parse a date in ISO date, RFC 3339, or `dd/mm/yyyy` form.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(date);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.date_naive());
    }
    NaiveDate::parse_from_str(raw, "%d/%m/%Y").ok()
}

fn parse_datetime(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc));
            }
            if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
                return date.and_hms_opt(0, 0, 0).map(|ndt| Utc.from_utc_datetime(&ndt));
            }
            s.parse::<i64>().ok().and_then(epoch_to_datetime)
        }
        Value::Number(n) => n.as_i64().and_then(epoch_to_datetime),
        _ => None,
    }
}

fn epoch_to_datetime(raw: i64) -> Option<DateTime<Utc>> {
    // Anything past ~2286 in seconds is taken as milliseconds.
    if raw > 10_000_000_000 {
        Utc.timestamp_millis_opt(raw).single()
    } else {
        Utc.timestamp_opt(raw, 0).single()
    }
}

fn coerce(value: &Value, kind: FieldKind, field: &str) -> SyncResult<Value> {
    match kind {
        FieldKind::Text => match value {
            Value::String(s) => Ok(Value::String(s.trim().to_string())),
            Value::Number(n) => Ok(Value::String(n.to_string())),
            other => Err(SyncError::validation(
                field,
                format!("expected text, got {other}"),
            )),
        },
        FieldKind::Email => match value {
            Value::String(s) => Ok(Value::String(s.trim().to_lowercase())),
            other => Err(SyncError::validation(
                field,
                format!("expected email string, got {other}"),
            )),
        },
        FieldKind::Money => match value {
            Value::Number(n) => n
                .as_f64()
                .map(|f| Value::from(f))
                .ok_or_else(|| SyncError::validation(field, "non-finite amount")),
            Value::String(s) => parse_money(s)
                .map(Value::from)
                .ok_or_else(|| SyncError::validation(field, format!("unparseable amount '{s}'"))),
            other => Err(SyncError::validation(
                field,
                format!("expected amount, got {other}"),
            )),
        },
        FieldKind::Date => match value {
            Value::String(s) => parse_date(s)
                .map(|d| Value::String(d.format("%Y-%m-%d").to_string()))
                .ok_or_else(|| SyncError::validation(field, format!("unparseable date '{s}'"))),
            Value::Number(n) => n
                .as_i64()
                .and_then(epoch_to_datetime)
                .map(|dt| Value::String(dt.date_naive().format("%Y-%m-%d").to_string()))
                .ok_or_else(|| SyncError::validation(field, "unparseable epoch date")),
            other => Err(SyncError::validation(
                field,
                format!("expected date, got {other}"),
            )),
        },
        FieldKind::Status => match value {
            Value::String(s) => Ok(Value::String(
                EntityStatus::normalize(s).as_str().to_string(),
            )),
            // Task-style completion flags.
            Value::Bool(true) => Ok(Value::String(EntityStatus::Completed.as_str().into())),
            Value::Bool(false) => Ok(Value::String(EntityStatus::Pending.as_str().into())),
            other => Err(SyncError::validation(
                field,
                format!("expected status, got {other}"),
            )),
        },
    }
}

/// Map a raw remote record into canonical field names.
pub fn map_inbound(
    platform: Platform,
    entity_type: EntityType,
    raw: &Value,
) -> SyncResult<MappedRecord> {
    let rules = rules_for(platform, entity_type).ok_or_else(|| {
        SyncError::Configuration(format!(
            "{} does not sync {}",
            platform.as_str(),
            entity_type.as_str()
        ))
    })?;

    if !raw.is_object() {
        return Err(SyncError::validation("record", "payload is not a JSON object"));
    }

    let external_id = lookup(raw, external_id_candidates(platform)).and_then(value_to_id);
    let external_updated_at =
        lookup(raw, updated_at_candidates(platform)).and_then(parse_datetime);

    let mut fields = HashMap::new();
    for rule in rules {
        if let Some(value) = lookup(raw, rule.candidates) {
            let coerced = coerce(value, rule.kind, rule.canonical)?;
            fields.insert(rule.canonical.to_string(), coerced);
        }
    }

    Ok(MappedRecord {
        external_id,
        external_updated_at,
        fields,
    })
}

/// Required-field rules, used to quarantine bad records instead of
/// aborting a batch.
pub fn validate(mapped: &MappedRecord, entity_type: EntityType) -> Vec<RuleViolation> {
    let mut violations = Vec::new();
    let has = |name: &str| {
        mapped
            .fields
            .get(name)
            .map(|v| !v.is_null() && v.as_str().map_or(true, |s| !s.is_empty()))
            .unwrap_or(false)
    };

    match entity_type {
        EntityType::Client => {
            if !has("name") && !has("email") {
                violations.push(RuleViolation {
                    field: "name".to_string(),
                    detail: "no name or email could be extracted".to_string(),
                });
            }
        }
        EntityType::Invoice => {
            if !has("name") {
                violations.push(RuleViolation {
                    field: "name".to_string(),
                    detail: "invoice number missing".to_string(),
                });
            }
            if !has("amount") {
                violations.push(RuleViolation {
                    field: "amount".to_string(),
                    detail: "amount missing".to_string(),
                });
            }
        }
        EntityType::Project | EntityType::Task => {
            if !has("name") {
                violations.push(RuleViolation {
                    field: "name".to_string(),
                    detail: "title missing".to_string(),
                });
            }
        }
    }
    violations
}

/// Map a batch inbound. Partial-success semantics: failures are recorded
/// per index with whatever id was extractable, never dropped silently.
pub fn map_batch(
    platform: Platform,
    entity_type: EntityType,
    records: &[Value],
) -> BatchMapOutcome {
    let mut outcome = BatchMapOutcome::default();
    for (index, raw) in records.iter().enumerate() {
        let external_id = lookup(raw, external_id_candidates(platform)).and_then(value_to_id);
        match map_inbound(platform, entity_type, raw) {
            Ok(mapped) => {
                let violations = validate(&mapped, entity_type);
                if violations.is_empty() {
                    outcome.mapped.push(mapped);
                } else {
                    let detail = violations
                        .iter()
                        .map(|v| format!("{}: {}", v.field, v.detail))
                        .collect::<Vec<_>>()
                        .join("; ");
                    outcome.failures.push(BatchFailure {
                        index,
                        external_id,
                        error: detail,
                    });
                }
            }
            Err(err) => outcome.failures.push(BatchFailure {
                index,
                external_id,
                error: err.to_string(),
            }),
        }
    }
    outcome
}

fn round2(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}

/// Map a canonical entity into the platform's payload shape. Money is
/// rounded to 2 decimals here and nowhere earlier.
pub fn map_outbound(
    platform: Platform,
    entity: &CanonicalEntity,
    external_id: Option<&str>,
) -> SyncResult<Value> {
    let rules = rules_for(platform, entity.entity_type).ok_or_else(|| {
        SyncError::Configuration(format!(
            "{} does not sync {}",
            platform.as_str(),
            entity.entity_type.as_str()
        ))
    })?;

    let mut out = serde_json::Map::new();
    for rule in rules {
        let value = match rule.canonical {
            "name" => Some(Value::String(entity.name.clone())),
            "email" => entity.email.clone().map(Value::String),
            "amount" => entity.amount.map(|a| Value::from(round2(a))),
            "status" => Some(Value::String(entity.status.as_str().to_string())),
            "issued_on" => entity
                .issued_on
                .map(|d| Value::String(d.format("%Y-%m-%d").to_string())),
            "due_on" => entity
                .due_on
                .map(|d| Value::String(d.format("%Y-%m-%d").to_string())),
            other => entity.extra.get(other).cloned(),
        };
        if let Some(value) = value {
            out.insert(rule.remote.to_string(), value);
        }
    }
    if let Some(id) = external_id {
        out.insert(
            external_id_field(platform).to_string(),
            Value::String(id.to_string()),
        );
    }
    Ok(Value::Object(out))
}

impl MappedRecord {
    fn text(&self, name: &str) -> Option<String> {
        self.fields
            .get(name)
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }

    /// Build a fresh canonical entity from the mapped fields.
    pub fn into_canonical(self, entity_type: EntityType) -> CanonicalEntity {
        let mut entity = CanonicalEntity {
            id: uuid::Uuid::new_v4(),
            entity_type,
            name: self.text("name").or_else(|| self.text("email")).unwrap_or_default(),
            email: self.text("email"),
            amount: self.fields.get("amount").and_then(|v| v.as_f64()),
            status: self
                .text("status")
                .map(|s| EntityStatus::normalize(&s))
                .unwrap_or(EntityStatus::Pending),
            issued_on: self.text("issued_on").and_then(|s| parse_date(&s)),
            due_on: self.text("due_on").and_then(|s| parse_date(&s)),
            updated_at: self.external_updated_at.unwrap_or_else(Utc::now),
            extra: HashMap::new(),
        };
        for (key, value) in self.fields {
            if !matches!(
                key.as_str(),
                "name" | "email" | "amount" | "status" | "issued_on" | "due_on"
            ) {
                entity.extra.insert(key, value);
            }
        }
        entity
    }

    /// Overwrite an existing local entity with the remote copy's fields.
    pub fn apply_to(&self, entity: &mut CanonicalEntity) {
        if let Some(name) = self.text("name") {
            entity.name = name;
        }
        if let Some(email) = self.text("email") {
            entity.email = Some(email);
        }
        if let Some(amount) = self.fields.get("amount").and_then(|v| v.as_f64()) {
            entity.amount = Some(amount);
        }
        if let Some(status) = self.text("status") {
            entity.status = EntityStatus::normalize(&status);
        }
        if let Some(date) = self.text("issued_on").and_then(|s| parse_date(&s)) {
            entity.issued_on = Some(date);
        }
        if let Some(date) = self.text("due_on").and_then(|s| parse_date(&s)) {
            entity.due_on = Some(date);
        }
        if let Some(ts) = self.external_updated_at {
            entity.updated_at = ts;
        }
    }
}
