//! Token lifecycle manager.
//!
//! Decides on every call whether the stored token can be handed out, must be
//! refreshed first, or requires the user to re-authenticate. Refreshes are
//! single-flight: one in progress at a time, and callers that queued behind a
//! refresh pick up its result from storage instead of issuing their own.

use super::{TokenSet, TokenState, TokenStore};
use crate::error::{AuthError, StorageError};
use crate::oauth::OAuthExchanger;
use chrono::{Duration, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RefreshOutcome {
    Refreshed,
    /// Token endpoint refused the refresh token
    Rejected,
    /// Transport or persistence failure
    Failed,
}

#[derive(Debug)]
struct RefreshRecord {
    refresh_token: String,
    outcome: RefreshOutcome,
}

/// Process-wide refresh lock for the single credential identity.
///
/// Holds the outcome of the last refresh attempt so that callers queued
/// behind a failed refresh do not repeat it.
#[derive(Debug, Default)]
pub struct RefreshGate {
    last: Mutex<Option<RefreshRecord>>,
    /// Bumped after every completed refresh attempt
    generation: AtomicU64,
}

impl RefreshGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of refresh attempts completed through this gate.
    pub fn attempts(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }
}

/// Hands out usable token sets.
pub struct TokenManager {
    store: Arc<dyn TokenStore>,
    exchanger: OAuthExchanger,
    refresh_buffer: Duration,
    gate: Arc<RefreshGate>,
}

impl TokenManager {
    /// # Arguments
    /// * `store` - Storage-of-record, re-read on every call
    /// * `exchanger` - Performs the refresh grant
    /// * `refresh_buffer` - Tokens expiring within this window are refreshed
    /// * `gate` - Shared refresh lock
    pub fn new(
        store: Arc<dyn TokenStore>,
        exchanger: OAuthExchanger,
        refresh_buffer: Duration,
        gate: Arc<RefreshGate>,
    ) -> Self {
        Self {
            store,
            exchanger,
            refresh_buffer,
            gate,
        }
    }

    pub fn exchanger(&self) -> &OAuthExchanger {
        &self.exchanger
    }

    /// Return a token set that is not about to expire, refreshing if needed.
    ///
    /// # Returns
    /// * `Ok(Some(tokens))` - Usable now
    /// * `Ok(None)` - No token, unreadable token, or refresh failed: the user
    ///   must go through the authorization-code flow
    /// * `Err(StorageError)` - The store could not be read, or a refreshed
    ///   token could not be persisted
    pub async fn ensure_valid_token(&self) -> Result<Option<TokenSet>, StorageError> {
        let Some(tokens) = self.load_usable().await? else {
            info!("No stored tokens, authorization required");
            return Ok(None);
        };
        if tokens.state_at(Utc::now(), self.refresh_buffer) == TokenState::Valid {
            return Ok(Some(tokens));
        }

        let observed_generation = self.gate.generation.load(Ordering::Acquire);
        let mut last = self.gate.last.lock().await;

        // Re-read: a refresh by another task or process may have landed while we waited
        let Some(tokens) = self.load_usable().await? else {
            return Ok(None);
        };
        if tokens.state_at(Utc::now(), self.refresh_buffer) == TokenState::Valid {
            debug!("Token refreshed by a concurrent caller");
            return Ok(Some(tokens));
        }

        if let Some(record) = last.as_ref() {
            if record.refresh_token == tokens.refresh_token {
                match record.outcome {
                    RefreshOutcome::Rejected => {
                        debug!("Stored refresh token was already rejected, re-authentication required");
                        return Ok(None);
                    }
                    RefreshOutcome::Failed
                        if self.gate.generation.load(Ordering::Acquire) != observed_generation =>
                    {
                        debug!("Concurrent refresh failed, not repeating it");
                        return Ok(None);
                    }
                    _ => {}
                }
            }
        }

        info!(expires_at = %tokens.expires_at, "Access token expiring, refreshing");
        let result = self.exchanger.refresh(&tokens.refresh_token).await;
        self.gate.generation.fetch_add(1, Ordering::AcqRel);

        let (outcome, value) = match result {
            Ok(new_tokens) => (RefreshOutcome::Refreshed, Ok(Some(new_tokens))),
            Err(AuthError::Storage(e)) => {
                warn!(error = %e, "Refreshed tokens could not be persisted");
                (RefreshOutcome::Failed, Err(e))
            }
            Err(e @ AuthError::Rejected { .. }) => {
                warn!(error = %e, "Refresh token rejected, re-authentication required");
                (RefreshOutcome::Rejected, Ok(None))
            }
            Err(e) => {
                warn!(error = %e, "Token refresh failed");
                (RefreshOutcome::Failed, Ok(None))
            }
        };

        *last = Some(RefreshRecord {
            refresh_token: tokens.refresh_token,
            outcome,
        });
        value
    }

    /// Current state of the stored token, without refreshing.
    pub async fn state(&self) -> Result<TokenState, StorageError> {
        let Some(tokens) = self.load_usable().await? else {
            return Ok(TokenState::Missing);
        };

        let last = self.gate.last.lock().await;
        let rejected = last.as_ref().is_some_and(|record| {
            record.outcome == RefreshOutcome::Rejected
                && record.refresh_token == tokens.refresh_token
        });
        if rejected {
            return Ok(TokenState::RefreshFailed);
        }

        Ok(tokens.state_at(Utc::now(), self.refresh_buffer))
    }

    /// The stored token set as-is, for status displays. Corrupt records read as `None`.
    pub async fn stored_tokens(&self) -> Result<Option<TokenSet>, StorageError> {
        self.load_usable().await
    }

    async fn load_usable(&self) -> Result<Option<TokenSet>, StorageError> {
        match self.store.load().await {
            Ok(tokens) => Ok(tokens),
            Err(StorageError::Corrupt(reason)) => {
                warn!(
                    backend = %self.store.backend(),
                    reason = %reason,
                    "Stored token record unreadable, treating as missing"
                );
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::Credentials;
    use crate::token::LocalFileStore;

    fn tokens_expiring_in(seconds: i64) -> TokenSet {
        TokenSet {
            access_token: "stored_access".to_string(),
            refresh_token: "stored_refresh".to_string(),
            token_type: "Bearer".to_string(),
            expires_in: 1800,
            expires_at: Utc::now() + Duration::seconds(seconds),
            scope: None,
            id_token: None,
        }
    }

    fn manager_for(store: Arc<dyn TokenStore>, token_url: String) -> TokenManager {
        let exchanger = OAuthExchanger::new(
            reqwest::Client::new(),
            token_url,
            Credentials {
                client_id: "id".to_string(),
                client_secret: "secret".to_string(),
                redirect_uri: "https://127.0.0.1".to_string(),
            },
            Arc::clone(&store),
        );
        TokenManager::new(store, exchanger, Duration::minutes(2), Arc::new(RefreshGate::new()))
    }

    #[tokio::test]
    async fn test_state_reports_missing_and_valid() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn TokenStore> = Arc::new(LocalFileStore::new(dir.path().join("t.json")));
        let manager = manager_for(Arc::clone(&store), "http://127.0.0.1:1/token".to_string());

        assert_eq!(manager.state().await.unwrap(), TokenState::Missing);

        store.save(&tokens_expiring_in(3600)).await.unwrap();
        assert_eq!(manager.state().await.unwrap(), TokenState::Valid);

        store.save(&tokens_expiring_in(30)).await.unwrap();
        assert_eq!(manager.state().await.unwrap(), TokenState::RefreshDue);
    }

    #[tokio::test]
    async fn test_rejected_refresh_is_sticky_until_new_tokens() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/token")
            .with_status(400)
            .with_body(r#"{"error":"invalid_grant"}"#)
            .expect(1)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn TokenStore> = Arc::new(LocalFileStore::new(dir.path().join("t.json")));
        store.save(&tokens_expiring_in(30)).await.unwrap();
        let manager = manager_for(Arc::clone(&store), format!("{}/token", server.url()));

        assert!(manager.ensure_valid_token().await.unwrap().is_none());
        assert_eq!(manager.state().await.unwrap(), TokenState::RefreshFailed);

        // Same stale refresh token: no second call to the token endpoint
        assert!(manager.ensure_valid_token().await.unwrap().is_none());
        mock.assert_async().await;

        // Re-authentication stores a new set; state follows it
        let mut fresh = tokens_expiring_in(3600);
        fresh.refresh_token = "new_refresh".to_string();
        store.save(&fresh).await.unwrap();
        assert_eq!(manager.state().await.unwrap(), TokenState::Valid);
    }
}
