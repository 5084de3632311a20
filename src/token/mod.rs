//! Bearer token records and their lifecycle.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       TokenManager                       │
//! │  - Valid / RefreshDue / Missing          │
//! │  - single-flight refresh                 │
//! └─────────────────────────────────────────┘
//!          ↓                    ↓
//! ┌──────────────────┐  ┌──────────────────┐
//! │  TokenStore      │  │  OAuthExchanger  │
//! │  local | cloud   │  │  refresh grant   │
//! └──────────────────┘  └──────────────────┘
//! ```
//!
//! A [`TokenSet`] is never mutated in place: each refresh produces a new one
//! which replaces the stored record wholesale.

mod manager;
mod store;

pub use manager::{RefreshGate, TokenManager};
pub use store::{CloudSecretStore, LocalFileStore, TokenStore, TOKENS_SECRET_DESCRIPTION};

use crate::error::StorageError;
use chrono::{DateTime, Duration, Local, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// OAuth token set as issued by the authorization server.
///
/// `expires_at` is absolute. It is computed from the server's `expires_in`
/// at the moment the response is received and never recomputed.
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    /// Lifetime in seconds reported by the server when this set was issued
    pub expires_in: i64,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
}

impl fmt::Debug for TokenSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenSet")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .field("expires_at", &self.expires_at)
            .field("scope", &self.scope)
            .finish()
    }
}

/// Derived state of the stored token. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    /// No stored token (or the stored record is unreadable)
    Missing,
    /// `now < expires_at - buffer`
    Valid,
    /// Within the refresh buffer or already expired
    RefreshDue,
    /// The authorization server rejected the stored refresh token
    RefreshFailed,
}

impl fmt::Display for TokenState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TokenState::Missing => "missing",
            TokenState::Valid => "valid",
            TokenState::RefreshDue => "refresh_due",
            TokenState::RefreshFailed => "refresh_failed",
        };
        f.write_str(s)
    }
}

/// On-disk / in-secret layout. `expires_at` is read as a string so that
/// a malformed value is reported as corruption instead of a decode panic.
#[derive(Deserialize)]
struct StoredTokenSet {
    access_token: String,
    refresh_token: String,
    #[serde(default = "default_token_type")]
    token_type: String,
    #[serde(default)]
    expires_in: i64,
    #[serde(default)]
    expires_at: Option<String>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    id_token: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl TokenSet {
    /// Valid or RefreshDue at `now` with the given refresh buffer.
    pub fn state_at(&self, now: DateTime<Utc>, buffer: Duration) -> TokenState {
        if now < self.expires_at - buffer {
            TokenState::Valid
        } else {
            TokenState::RefreshDue
        }
    }

    /// Serialized form written by both storage backends.
    pub fn to_stored_json(&self) -> Result<String, StorageError> {
        serde_json::to_string_pretty(self).map_err(StorageError::Encode)
    }

    /// Decodes a stored record. Missing or unparseable `expires_at` is
    /// [`StorageError::Corrupt`].
    pub fn from_stored_json(raw: &str) -> Result<Self, StorageError> {
        let stored: StoredTokenSet =
            serde_json::from_str(raw).map_err(|e| StorageError::Corrupt(e.to_string()))?;

        let expires_at = match stored.expires_at.as_deref() {
            Some(value) => parse_expires_at(value).ok_or_else(|| {
                StorageError::Corrupt(format!("unparseable expires_at: {}", value))
            })?,
            None => return Err(StorageError::Corrupt("expires_at missing".to_string())),
        };

        Ok(Self {
            access_token: stored.access_token,
            refresh_token: stored.refresh_token,
            token_type: stored.token_type,
            expires_in: stored.expires_in,
            expires_at,
            scope: stored.scope,
            id_token: stored.id_token,
        })
    }
}

/// RFC 3339, or a naive ISO timestamp in local time (records written by
/// older tooling carry no offset).
fn parse_expires_at(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f").ok()?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}
