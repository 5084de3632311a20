//! Error types for credential resolution, token persistence, OAuth grants and
//! brokerage API calls.
//!
//! Transient upstream failures are retried inside the API client and only
//! surface as [`ApiError::Unavailable`] once the retry budget is spent.
//! Authorization failures are never retried.

use std::fmt;
use thiserror::Error;

/// Application credentials could not be resolved. Fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("{0} must be set in the environment (or available from the cloud secret store)")]
    MissingVariable(&'static str),

    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    ParseFile {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },

    #[error("failed to load credentials secret {name}: {reason}")]
    SecretStore { name: String, reason: String },

    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[source] reqwest::Error),
}

/// Token persistence failed.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("token file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode token record: {0}")]
    Encode(#[source] serde_json::Error),

    /// The stored record exists but cannot be decoded into a usable token set.
    #[error("stored token record is corrupt: {0}")]
    Corrupt(String),

    #[error("secret store request for {name} failed: {reason}")]
    SecretStore { name: String, reason: String },
}

/// Which OAuth grant an [`AuthError`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantType {
    AuthorizationCode,
    RefreshToken,
}

impl GrantType {
    /// Value of the `grant_type` form field.
    pub fn as_str(&self) -> &'static str {
        match self {
            GrantType::AuthorizationCode => "authorization_code",
            GrantType::RefreshToken => "refresh_token",
        }
    }
}

impl fmt::Display for GrantType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A token grant failed. Every variant except `Storage` means the user has to
/// re-authenticate; none of them is retried.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("token endpoint rejected {grant} grant with status {status}: {body}")]
    Rejected {
        grant: GrantType,
        status: u16,
        body: String,
    },

    #[error("failed to reach token endpoint for {grant} grant: {source}")]
    Transport {
        grant: GrantType,
        #[source]
        source: reqwest::Error,
    },

    #[error("invalid token response for {grant} grant: {reason}")]
    InvalidResponse { grant: GrantType, reason: String },

    #[error("no authorization code found in returned URL")]
    MissingCode,

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Authorization-code exchange failure.
pub type AuthExchangeError = AuthError;

/// Refresh-token grant failure.
pub type AuthRefreshError = AuthError;

/// Failure of a brokerage API call made through [`crate::ApiClient`].
#[derive(Debug, Error)]
pub enum ApiError {
    /// No usable token; the user must go through the authorization flow.
    #[error("not authenticated: re-authentication required")]
    Unauthenticated,

    #[error("upstream unavailable after {attempts} attempt(s): {reason}")]
    Unavailable { attempts: u32, reason: String },

    #[error("request rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },

    /// The request could not be built or its redirects could not be followed.
    /// Never retried.
    #[error("request could not be sent: {0}")]
    InvalidRequest(#[source] reqwest::Error),

    #[error("failed to decode response body: {0}")]
    Decode(#[source] serde_json::Error),

    #[error(transparent)]
    Storage(#[from] StorageError),
}
