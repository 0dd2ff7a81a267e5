//! Access-credential resolution with transparent refresh.
//!
//! The resolver hands out a plaintext access token for exactly one dispatch
//! attempt; nothing is cached across calls. When the stored token is expired
//! or about to expire it runs the provider's refresh exchange first and
//! persists the rotated envelopes before returning.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

use slack_api_module::SlackClient;

use crate::credential_store::{CredentialRecord, CredentialStore, CredentialStoreError};
use crate::vault::{TokenVault, VaultError};

/// Tokens expiring within this window are refreshed before use.
pub const REFRESH_BUFFER_MINUTES: i64 = 30;
/// Fallback access-token lifetime when the provider omits `expires_in`.
const DEFAULT_GRANT_LIFETIME_SECS: i64 = 12 * 60 * 60;

/// OAuth application identity used for the refresh exchange.
#[derive(Debug, Clone)]
pub struct OAuthApp {
    pub client_id: String,
    pub client_secret: String,
}

/// A usable access credential, valid for the current dispatch attempt.
#[derive(Debug, Clone)]
pub struct AccessCredential {
    pub user_id: String,
    pub team_id: String,
    pub access_token: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("user {0} is not connected to a Slack workspace")]
    NotConnected(String),
    #[error("access token for user {0} is expired and no refresh token is stored")]
    RefreshUnavailable(String),
    #[error("token refresh for user {0} failed: {1}")]
    RefreshRejected(String, String),
    #[error("credential store error: {0}")]
    Store(#[from] CredentialStoreError),
    #[error("credential vault error: {0}")]
    Vault(#[from] VaultError),
}

pub struct CredentialResolver<C: CredentialStore> {
    store: Arc<C>,
    vault: TokenVault,
    slack: Arc<SlackClient>,
    oauth: OAuthApp,
}

impl<C: CredentialStore> CredentialResolver<C> {
    pub fn new(store: Arc<C>, vault: TokenVault, slack: Arc<SlackClient>, oauth: OAuthApp) -> Self {
        Self {
            store,
            vault,
            slack,
            oauth,
        }
    }

    /// Return a valid access credential for `user_id`, refreshing the stored
    /// token first when it expires within the buffer window.
    pub fn resolve(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<AccessCredential, ResolveError> {
        let record = self
            .store
            .find_by_user(user_id)?
            .ok_or_else(|| ResolveError::NotConnected(user_id.to_string()))?;

        let record = if needs_refresh(&record, now) {
            debug!("access token for user {} expires soon; refreshing", user_id);
            self.refresh(record, now)?
        } else {
            record
        };

        let access_token = self.vault.open(&record.encrypted_access_token)?;
        Ok(AccessCredential {
            user_id: record.user_id,
            team_id: record.team_id,
            access_token,
        })
    }

    /// Run the refresh-token exchange and persist the rotated envelopes.
    /// Nothing is written unless the provider accepts the exchange.
    fn refresh(
        &self,
        record: CredentialRecord,
        now: DateTime<Utc>,
    ) -> Result<CredentialRecord, ResolveError> {
        let refresh_envelope = record
            .encrypted_refresh_token
            .as_deref()
            .ok_or_else(|| ResolveError::RefreshUnavailable(record.user_id.clone()))?;
        let refresh_token = self.vault.open(refresh_envelope)?;

        let grant = self
            .slack
            .refresh_access_token(&self.oauth.client_id, &self.oauth.client_secret, &refresh_token)
            .map_err(|err| {
                warn!("token refresh for user {} failed: {}", record.user_id, err);
                ResolveError::RefreshRejected(record.user_id.clone(), err.to_string())
            })?;

        let expires_at =
            now + Duration::seconds(grant.expires_in.unwrap_or(DEFAULT_GRANT_LIFETIME_SECS));
        let encrypted_access = self.vault.seal(&grant.access_token)?;
        let encrypted_refresh = match grant.refresh_token.as_deref() {
            Some(token) => Some(self.vault.seal(token)?),
            None => None,
        };

        self.store.update_tokens(
            &record.user_id,
            &encrypted_access,
            encrypted_refresh.as_deref(),
            Some(expires_at),
            now,
        )?;
        info!("refreshed access token for user {}", record.user_id);

        Ok(CredentialRecord {
            user_id: record.user_id,
            team_id: record.team_id,
            encrypted_access_token: encrypted_access,
            encrypted_refresh_token: encrypted_refresh.or(record.encrypted_refresh_token),
            token_expires_at: Some(expires_at),
            created_at: record.created_at,
            updated_at: now,
        })
    }
}

fn needs_refresh(record: &CredentialRecord, now: DateTime<Utc>) -> bool {
    match record.token_expires_at {
        Some(expires_at) => expires_at <= now + Duration::minutes(REFRESH_BUFFER_MINUTES),
        None => false,
    }
}
