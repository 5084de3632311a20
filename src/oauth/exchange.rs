//! OAuth token exchange logic.
//!
//! Handles the authorization-code grant and the refresh-token grant. Both
//! post form data with HTTP Basic client authentication, persist the issued
//! token set, and never retry: a rejected code or refresh token does not
//! become valid by asking again.

use crate::credentials::Credentials;
use crate::error::{AuthError, GrantType};
use crate::token::{TokenSet, TokenStore};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::StatusCode;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// OAuth token response (standard OAuth 2.0)
#[derive(Deserialize, Debug)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    id_token: Option<String>,
}

impl TokenResponse {
    /// Converts the relative `expires_in` to an absolute expiry at `received_at`.
    ///
    /// `previous_refresh_token` is kept when the server does not rotate it.
    fn into_token_set(
        self,
        grant: GrantType,
        received_at: DateTime<Utc>,
        previous_refresh_token: Option<&str>,
    ) -> Result<TokenSet, AuthError> {
        let invalid = |reason: &str| AuthError::InvalidResponse {
            grant,
            reason: reason.to_string(),
        };

        let expires_in = self.expires_in.ok_or_else(|| invalid("expires_in missing"))?;
        if expires_in <= 0 {
            return Err(invalid("expires_in must be positive"));
        }
        let expires_at = Duration::try_seconds(expires_in)
            .and_then(|lifetime| received_at.checked_add_signed(lifetime))
            .ok_or_else(|| invalid("expires_in out of range"))?;
        let refresh_token = match (self.refresh_token, previous_refresh_token) {
            (Some(token), _) if !token.is_empty() => token,
            (_, Some(previous)) => previous.to_string(),
            _ => return Err(invalid("refresh_token missing")),
        };

        Ok(TokenSet {
            access_token: self.access_token,
            refresh_token,
            token_type: self.token_type.unwrap_or_else(|| "Bearer".to_string()),
            expires_in,
            expires_at,
            scope: self.scope,
            id_token: self.id_token,
        })
    }
}

/// Performs token grants and persists the results.
pub struct OAuthExchanger {
    http_client: reqwest::Client,
    token_url: String,
    credentials: Credentials,
    store: Arc<dyn TokenStore>,
}

impl OAuthExchanger {
    /// # Arguments
    /// * `http_client` - Client carrying the per-request timeout
    /// * `token_url` - OAuth token endpoint URL
    /// * `credentials` - Application credentials for Basic auth
    /// * `store` - Where issued token sets are persisted
    pub fn new(
        http_client: reqwest::Client,
        token_url: impl Into<String>,
        credentials: Credentials,
        store: Arc<dyn TokenStore>,
    ) -> Self {
        Self {
            http_client,
            token_url: token_url.into(),
            credentials,
            store,
        }
    }

    /// Exchange an authorization code for a token set.
    ///
    /// # Returns
    /// * `Ok(TokenSet)` - Issued and persisted
    /// * `Err(AuthError::Rejected)` - Non-200 from the token endpoint
    /// * `Err(AuthError::Storage)` - Issued but could not be persisted
    pub async fn exchange_code(&self, code: &str) -> Result<TokenSet, AuthError> {
        let grant = GrantType::AuthorizationCode;
        let form = [
            ("grant_type", grant.as_str()),
            ("code", code),
            ("redirect_uri", self.credentials.redirect_uri.as_str()),
        ];

        let tokens = self.request_tokens(grant, &form, None).await?;
        self.store.save(&tokens).await?;

        info!(
            grant = %grant,
            expires_at = %tokens.expires_at,
            "Authorization code exchanged"
        );
        Ok(tokens)
    }

    /// Obtain a new token set with the refresh-token grant.
    ///
    /// A rejection means the refresh token is no longer usable and the user
    /// must re-authenticate.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenSet, AuthError> {
        let grant = GrantType::RefreshToken;
        let form = [
            ("grant_type", grant.as_str()),
            ("refresh_token", refresh_token),
        ];

        let tokens = self
            .request_tokens(grant, &form, Some(refresh_token))
            .await?;
        self.store.save(&tokens).await?;

        info!(
            grant = %grant,
            expires_at = %tokens.expires_at,
            rotated = tokens.refresh_token != refresh_token,
            "Access token refreshed"
        );
        Ok(tokens)
    }

    fn basic_auth_header(&self) -> String {
        let pair = format!(
            "{}:{}",
            self.credentials.client_id, self.credentials.client_secret
        );
        format!("Basic {}", BASE64.encode(pair))
    }

    async fn request_tokens(
        &self,
        grant: GrantType,
        form: &[(&str, &str)],
        previous_refresh_token: Option<&str>,
    ) -> Result<TokenSet, AuthError> {
        debug!(grant = %grant, token_url = %self.token_url, "Requesting tokens");

        let response = self
            .http_client
            .post(&self.token_url)
            .header(AUTHORIZATION, self.basic_auth_header())
            .header(ACCEPT, "application/json")
            .form(form)
            .send()
            .await
            .map_err(|source| AuthError::Transport { grant, source })?;

        let received_at = Utc::now();
        let status = response.status();
        if status != StatusCode::OK {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            warn!(grant = %grant, status = status.as_u16(), "Token endpoint rejected grant");
            return Err(AuthError::Rejected {
                grant,
                status: status.as_u16(),
                body,
            });
        }

        let body = response
            .text()
            .await
            .map_err(|source| AuthError::Transport { grant, source })?;
        let token_response: TokenResponse =
            serde_json::from_str(&body).map_err(|e| AuthError::InvalidResponse {
                grant,
                reason: e.to_string(),
            })?;

        token_response.into_token_set(grant, received_at, previous_refresh_token)
    }
}
