//! Error taxonomy for integration sync runs.
//!
//! Record-level errors (`Validation`, `TerminalRemote`) are captured into
//! batch results and never abort an attempt. Attempt-level errors
//! (`Configuration`, an `Auth` that survives a refresh) abort the attempt
//! but are caught at the orchestrator boundary, which always finalizes the
//! audit entry with a failed status.

use thiserror::Error;

pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Error, Debug, Clone)]
pub enum SyncError {
    /// Invalid or expired credential. Retryable only via token refresh.
    #[error("authentication failed for {platform}: {detail}")]
    Auth { platform: String, detail: String },

    /// Timeout, connection reset, 5xx or 429. Safe to retry.
    #[error("transient remote failure: {detail}")]
    Transient { detail: String, status: Option<u16> },

    /// Record failed mapping or required-field validation. The batch
    /// continues; the record is quarantined.
    #[error("validation failed on '{field}': {detail}")]
    Validation { field: String, detail: String },

    /// Non-retryable remote rejection (4xx other than 401/408/429).
    #[error("remote rejected request ({status}): {detail}")]
    TerminalRemote { status: u16, detail: String },

    /// Missing or inconsistent integration configuration. Fails fast
    /// before any network traffic.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl SyncError {
    /// Whether the retry wrapper may re-issue the failed call.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Transient { .. })
    }

    /// Classify an HTTP-style status code into the taxonomy.
    pub fn from_status(status: u16, platform: &str, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        match status {
            401 | 403 => SyncError::Auth {
                platform: platform.to_string(),
                detail,
            },
            408 | 429 => SyncError::Transient {
                detail,
                status: Some(status),
            },
            500..=599 => SyncError::Transient {
                detail,
                status: Some(status),
            },
            _ => SyncError::TerminalRemote { status, detail },
        }
    }

    pub fn transient(detail: impl Into<String>) -> Self {
        SyncError::Transient {
            detail: detail.into(),
            status: None,
        }
    }

    pub fn validation(field: impl Into<String>, detail: impl Into<String>) -> Self {
        SyncError::Validation {
            field: field.into(),
            detail: detail.into(),
        }
    }

    pub fn auth(platform: impl Into<String>, detail: impl Into<String>) -> Self {
        SyncError::Auth {
            platform: platform.into(),
            detail: detail.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            SyncError::from_status(429, "hubspot", "rate limited"),
            SyncError::Transient {
                status: Some(429),
                ..
            }
        ));
        assert!(matches!(
            SyncError::from_status(503, "hubspot", "unavailable"),
            SyncError::Transient { .. }
        ));
        assert!(matches!(
            SyncError::from_status(401, "hubspot", "expired"),
            SyncError::Auth { .. }
        ));
        assert!(matches!(
            SyncError::from_status(422, "hubspot", "bad field"),
            SyncError::TerminalRemote { status: 422, .. }
        ));
    }

    #[test]
    fn test_retryability() {
        assert!(SyncError::transient("reset").is_retryable());
        assert!(SyncError::from_status(500, "asana", "boom").is_retryable());
        assert!(!SyncError::from_status(404, "asana", "gone").is_retryable());
        assert!(!SyncError::auth("asana", "revoked").is_retryable());
        assert!(!SyncError::validation("name", "missing").is_retryable());
        assert!(!SyncError::Configuration("no base_url".into()).is_retryable());
    }
}
