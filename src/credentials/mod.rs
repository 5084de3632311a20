//! Application credential resolution.
//!
//! The OAuth client id/secret and redirect URI are resolved once per process:
//!
//! ```text
//! environment variables set? ──yes──▶ use them
//!          │ no
//!          ▼
//! running in cloud compute? ──yes──▶ read `{env}/schwab-api/credentials`,
//!          │ no                      export to the environment, use them
//!          ▼
//!   ConfigurationError
//! ```

mod secrets;

pub use secrets::{AwsSecretsClient, MemorySecretsClient, SecretsClient};

use crate::environment::StorageBackend;
use crate::error::ConfigurationError;
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{info, warn};

pub const APP_KEY_VAR: &str = "SCHWAB_APP_KEY";
pub const APP_SECRET_VAR: &str = "SCHWAB_APP_SECRET";
pub const REDIRECT_URI_VAR: &str = "SCHWAB_REDIRECT_URI";
pub const DEFAULT_REDIRECT_URI: &str = "https://127.0.0.1";

/// OAuth application credentials. Immutable once resolved.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("redirect_uri", &self.redirect_uri)
            .finish()
    }
}

impl Credentials {
    /// Reads credentials through `lookup`. Returns `None` unless both the
    /// client id and secret are present and non-empty.
    pub fn from_lookup<F>(lookup: F) -> Option<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |name: &str| lookup(name).filter(|v| !v.is_empty());
        let client_id = non_empty(APP_KEY_VAR)?;
        let client_secret = non_empty(APP_SECRET_VAR)?;
        let redirect_uri =
            non_empty(REDIRECT_URI_VAR).unwrap_or_else(|| DEFAULT_REDIRECT_URI.to_string());
        Some(Self {
            client_id,
            client_secret,
            redirect_uri,
        })
    }

    /// Publishes these credentials as process environment variables so code
    /// paths that read the environment directly observe the same values.
    fn export_to_env(&self) {
        std::env::set_var(APP_KEY_VAR, &self.client_id);
        std::env::set_var(APP_SECRET_VAR, &self.client_secret);
        std::env::set_var(REDIRECT_URI_VAR, &self.redirect_uri);
    }
}

/// Layout of the credentials secret.
#[derive(Deserialize)]
struct CredentialsSecret {
    client_id: String,
    client_secret: String,
    #[serde(default)]
    redirect_uri: Option<String>,
}

type EnvLookup = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Memoizing credential resolver.
///
/// The first successful [`resolve`](Self::resolve) is cached; later calls
/// return the cached value without touching the environment or the network.
pub struct CredentialResolver {
    backend: StorageBackend,
    secrets: Option<Arc<dyn SecretsClient>>,
    secret_name: String,
    lookup: EnvLookup,
    resolved: OnceCell<Credentials>,
}

impl CredentialResolver {
    /// # Arguments
    /// * `backend` - Result of the one-time environment probe
    /// * `secrets` - Secret store client, required for the cloud path
    /// * `secret_name` - Name of the credentials secret
    pub fn new(
        backend: StorageBackend,
        secrets: Option<Arc<dyn SecretsClient>>,
        secret_name: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            secrets,
            secret_name: secret_name.into(),
            lookup: Box::new(|name: &str| std::env::var(name).ok()),
            resolved: OnceCell::new(),
        }
    }

    /// Replace the environment lookup (tests).
    pub fn with_env_lookup<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.lookup = Box::new(lookup);
        self
    }

    pub async fn resolve(&self) -> Result<Credentials, ConfigurationError> {
        self.resolved
            .get_or_try_init(|| self.resolve_uncached())
            .await
            .cloned()
    }

    async fn resolve_uncached(&self) -> Result<Credentials, ConfigurationError> {
        if let Some(credentials) = Credentials::from_lookup(&self.lookup) {
            info!(source = "environment", "Application credentials resolved");
            return Ok(credentials);
        }

        match (&self.backend, &self.secrets) {
            (StorageBackend::CloudSecret, Some(secrets)) => {
                let credentials = self.load_from_secret(secrets.as_ref()).await?;
                credentials.export_to_env();
                info!(
                    source = "secret_store",
                    secret = %self.secret_name,
                    "Application credentials resolved"
                );
                Ok(credentials)
            }
            (StorageBackend::CloudSecret, None) => {
                warn!("Cloud environment detected but no secret store client configured");
                Err(ConfigurationError::MissingVariable(APP_KEY_VAR))
            }
            (StorageBackend::Local, _) => Err(ConfigurationError::MissingVariable(APP_KEY_VAR)),
        }
    }

    async fn load_from_secret(
        &self,
        secrets: &dyn SecretsClient,
    ) -> Result<Credentials, ConfigurationError> {
        let secret_error = |reason: String| ConfigurationError::SecretStore {
            name: self.secret_name.clone(),
            reason,
        };

        let raw = secrets
            .get_secret(&self.secret_name)
            .await
            .map_err(|e| secret_error(e.to_string()))?
            .ok_or_else(|| secret_error("secret does not exist".to_string()))?;

        let secret: CredentialsSecret =
            serde_json::from_str(&raw).map_err(|e| secret_error(e.to_string()))?;

        Ok(Credentials {
            client_id: secret.client_id,
            client_secret: secret.client_secret,
            redirect_uri: secret
                .redirect_uri
                .filter(|uri| !uri.is_empty())
                .unwrap_or_else(|| DEFAULT_REDIRECT_URI.to_string()),
        })
    }
}
