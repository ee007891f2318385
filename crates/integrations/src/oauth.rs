//! OAuth plumbing: authorization URL, code exchange, and a per-integration
//! token manager that single-flights refreshes.
//!
//! Concurrent syncs for the same integration must never race a refresh:
//! the refresh token is rotated by the provider on use, so duplicate
//! refresh calls invalidate each other. All token access goes through one
//! `tokio::sync::Mutex`; callers that arrive during an in-flight refresh
//! await the lock and observe the refreshed token instead of issuing
//! their own call.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

use crate::error::{SyncError, SyncResult};

/// An OAuth access/refresh token pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

impl TokenSet {
    /// Expired, with a small skew margin so a token about to lapse is
    /// refreshed before it 401s mid-request.
    pub fn is_expired(&self) -> bool {
        Utc::now() + Duration::seconds(30) >= self.expires_at
    }
}

/// The provider's token endpoint. One implementation per OAuth platform;
/// tests substitute counting fakes.
#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    async fn exchange_code(&self, code: &str, state: &str) -> SyncResult<TokenSet>;
    async fn refresh(&self, refresh_token: &str) -> SyncResult<TokenSet>;
}

/// Build the provider authorization URL. `state` is caller-supplied and
/// embedded unchanged; the callback must return it verbatim.
pub fn authorization_url(
    base: &str,
    client_id: &str,
    redirect_uri: &str,
    state: &str,
) -> SyncResult<Url> {
    let mut url = Url::parse(base)
        .map_err(|e| SyncError::Configuration(format!("bad authorize url '{base}': {e}")))?;
    url.query_pairs_mut()
        .append_pair("client_id", client_id)
        .append_pair("redirect_uri", redirect_uri)
        .append_pair("response_type", "code")
        .append_pair("state", state);
    Ok(url)
}

/// Per-integration OAuth token holder with single-flight refresh.
pub struct TokenManager {
    platform: String,
    endpoint: Arc<dyn TokenEndpoint>,
    token: tokio::sync::Mutex<TokenSet>,
}

impl TokenManager {
    pub fn new(platform: &str, endpoint: Arc<dyn TokenEndpoint>, initial: TokenSet) -> Self {
        Self {
            platform: platform.to_string(),
            endpoint,
            token: tokio::sync::Mutex::new(initial),
        }
    }

    /// Complete the OAuth handshake: exchange the authorization code and
    /// install the resulting token set. The caller passes back the same
    /// opaque `state` it supplied to [`authorization_url`].
    pub async fn install_from_code(&self, code: &str, state: &str) -> SyncResult<()> {
        let fresh = self.endpoint.exchange_code(code, state).await?;
        let mut guard = self.token.lock().await;
        *guard = fresh;
        info!(platform = %self.platform, "OAuth code exchanged, tokens installed");
        Ok(())
    }

    /// Current access token, refreshed first if expired. The expiry check
    /// is re-done under the lock, so concurrent callers share one refresh.
    pub async fn access_token(&self) -> SyncResult<String> {
        let mut guard = self.token.lock().await;
        if guard.is_expired() {
            debug!(platform = %self.platform, "access token expired, refreshing");
            *guard = self.endpoint.refresh(&guard.refresh_token).await?;
        }
        Ok(guard.access_token.clone())
    }

    /// Refresh after the remote rejected `stale` with a 401. If another
    /// caller already refreshed while we waited on the lock, reuse its
    /// result; refreshes are never chained.
    pub async fn refresh_after_unauthorized(&self, stale: &str) -> SyncResult<String> {
        let mut guard = self.token.lock().await;
        if guard.access_token != stale {
            return Ok(guard.access_token.clone());
        }
        debug!(platform = %self.platform, "401 on current token, refreshing");
        *guard = self.endpoint.refresh(&guard.refresh_token).await?;
        Ok(guard.access_token.clone())
    }

    /// Snapshot of the stored token set, for persisting back into the
    /// integration config.
    pub async fn current(&self) -> TokenSet {
        self.token.lock().await.clone()
    }
}
