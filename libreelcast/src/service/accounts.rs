//! Connected accounts and OAuth state nonces
//!
//! Tokens are encrypted before they reach the database and are only ever
//! decrypted for a vendor call. The code exchange itself happens elsewhere;
//! this service stores what it produced, guards the `state` round trip and
//! runs refresh grants for tokens about to expire.

use std::sync::Arc;

use base64::engine::{general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info};
use uuid::Uuid;

use crate::crypto::TokenCipher;
use crate::db::Database;
use crate::error::{CryptoError, ReelcastError, Result};
use crate::platforms::PublishAdapter;
use crate::types::{ConnectedAccount, OAuthState, Platform, OAUTH_STATE_TTL_SECS};

/// What an OAuth callback hands over for storage
#[derive(Debug)]
pub struct NewAccount {
    pub user_id: String,
    pub platform: Platform,
    pub external_account_id: String,
    pub display_name: Option<String>,
    pub access_token: SecretString,
    pub refresh_token: Option<SecretString>,
    pub expires_at: Option<i64>,
    pub scopes: Vec<String>,
    pub metadata: serde_json::Value,
}

/// A token expiring within this many seconds is refreshed before use
pub const REFRESH_LEEWAY_SECS: i64 = 60;

/// True if the account's token is expired or close to it and can be refreshed
pub fn needs_refresh(account: &ConnectedAccount, now: i64) -> bool {
    account.refresh_token_encrypted.is_some()
        && account
            .expires_at
            .is_some_and(|expires_at| expires_at <= now + REFRESH_LEEWAY_SECS)
}

#[derive(Clone)]
pub struct AccountService {
    db: Arc<Database>,
    cipher: std::result::Result<Arc<TokenCipher>, CryptoError>,
}

impl AccountService {
    pub fn new(db: Arc<Database>, cipher: std::result::Result<TokenCipher, CryptoError>) -> Self {
        Self {
            db,
            cipher: cipher.map(Arc::new),
        }
    }

    pub(crate) fn with_shared_cipher(
        db: Arc<Database>,
        cipher: std::result::Result<Arc<TokenCipher>, CryptoError>,
    ) -> Self {
        Self { db, cipher }
    }

    /// Store or refresh an account. The user's first account on a platform
    /// becomes its primary.
    pub async fn connect(&self, account: NewAccount) -> Result<ConnectedAccount> {
        let cipher = self.cipher.as_ref().map_err(|e| e.clone())?;
        let token_encrypted = cipher.encrypt(account.access_token.expose_secret())?;
        let refresh_token_encrypted = account
            .refresh_token
            .as_ref()
            .map(|token| cipher.encrypt(token.expose_secret()))
            .transpose()?;

        let is_primary = self
            .db
            .resolve_account(&account.user_id, account.platform)
            .await?
            .is_none();

        let now = chrono::Utc::now().timestamp();
        let stored = self
            .db
            .upsert_account(&ConnectedAccount {
                id: Uuid::new_v4().to_string(),
                user_id: account.user_id,
                platform: account.platform,
                external_account_id: account.external_account_id,
                display_name: account.display_name,
                token_encrypted,
                refresh_token_encrypted,
                expires_at: account.expires_at,
                scopes: account.scopes,
                metadata: account.metadata,
                is_primary,
                created_at: now,
                updated_at: now,
            })
            .await?;

        info!(
            platform = %stored.platform,
            account_id = %stored.id,
            primary = stored.is_primary,
            "account connected"
        );
        Ok(stored)
    }

    /// Run the refresh grant for `account` through `adapter` and store the
    /// new credentials.
    ///
    /// Returns `Ok(None)` when there is no refresh token on file or the
    /// platform does not refresh this way; the stored token stays in use.
    pub async fn refresh(
        &self,
        account: &ConnectedAccount,
        adapter: &dyn PublishAdapter,
    ) -> Result<Option<ConnectedAccount>> {
        let Some(refresh_encrypted) = account.refresh_token_encrypted.as_deref() else {
            return Ok(None);
        };
        let cipher = self.cipher.as_ref().map_err(|e| e.clone())?;
        let refresh_token = cipher.decrypt(refresh_encrypted)?;

        let Some(refreshed) = adapter.refresh_token(&refresh_token).await? else {
            debug!(platform = %account.platform, "platform has no refresh grant");
            return Ok(None);
        };

        let token_encrypted = cipher.encrypt(refreshed.access_token.expose_secret())?;
        let rotated = refreshed
            .refresh_token
            .as_ref()
            .map(|token| cipher.encrypt(token.expose_secret()))
            .transpose()?;

        let now = chrono::Utc::now().timestamp();
        let expires_at = refreshed.expires_in.map(|secs| now + secs);
        let updated = self
            .db
            .update_account_tokens(
                &account.id,
                &token_encrypted,
                rotated.as_deref(),
                expires_at,
                now,
            )
            .await?
            .ok_or_else(|| ReelcastError::NotFound(format!("Account not found: {}", account.id)))?;

        info!(
            platform = %updated.platform,
            account_id = %updated.id,
            rotated = rotated.is_some(),
            "access token refreshed"
        );
        Ok(Some(updated))
    }

    pub async fn set_primary(&self, user_id: &str, account_id: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        if !self.db.set_primary_account(user_id, account_id, now).await? {
            return Err(ReelcastError::NotFound(format!(
                "Account not found: {}",
                account_id
            )));
        }
        Ok(())
    }

    pub async fn disconnect(&self, user_id: &str, account_id: &str) -> Result<()> {
        if !self.db.delete_account(user_id, account_id).await? {
            return Err(ReelcastError::NotFound(format!(
                "Account not found: {}",
                account_id
            )));
        }
        info!(account_id, "account disconnected");
        Ok(())
    }

    pub async fn list(&self, user_id: &str) -> Result<Vec<ConnectedAccount>> {
        self.db.list_accounts(user_id).await
    }

    /// Start an authorization: returns the state to send to the vendor
    pub async fn begin_oauth(&self, user_id: &str, platform: Platform, now: i64) -> Result<OAuthState> {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);

        let state = OAuthState {
            state: URL_SAFE_NO_PAD.encode(bytes),
            user_id: user_id.to_string(),
            platform,
            created_at: now,
            expires_at: now + OAUTH_STATE_TTL_SECS,
        };
        self.db.insert_oauth_state(&state).await?;
        Ok(state)
    }

    /// Redeem a state from a callback. Each state works once.
    pub async fn consume_oauth(&self, state: &str, now: i64) -> Result<OAuthState> {
        match self.db.take_oauth_state(state).await? {
            Some(stored) if stored.expires_at > now => Ok(stored),
            _ => Err(ReelcastError::InvalidInput(
                "Invalid or expired OAuth state".to_string(),
            )),
        }
    }

    pub async fn purge_expired_oauth(&self, now: i64) -> Result<u64> {
        self.db.purge_expired_oauth_states(now).await
    }
}
