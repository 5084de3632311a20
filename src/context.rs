//! Process-wide auth state, built once at startup and passed explicitly.

use crate::client::{ApiClient, RetryPolicy};
use crate::config::BrokerConfig;
use crate::credentials::{AwsSecretsClient, CredentialResolver, Credentials, SecretsClient};
use crate::environment::{select_backend, StorageBackend};
use crate::error::ConfigurationError;
use crate::oauth::{authorization_url, OAuthExchanger};
use crate::token::{CloudSecretStore, LocalFileStore, RefreshGate, TokenManager, TokenStore};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Resolved credentials, the selected storage backend and the refresh lock.
///
/// Everything that needs a token goes through one of these; nothing reads
/// credentials or storage choices from ambient globals.
pub struct AuthContext {
    config: BrokerConfig,
    credentials: Credentials,
    store: Arc<dyn TokenStore>,
    refresh_gate: Arc<RefreshGate>,
    http_client: reqwest::Client,
}

impl AuthContext {
    /// Probe the environment, resolve credentials and open the token store.
    ///
    /// The probe runs at most once; its result is fixed for the lifetime of
    /// the returned context.
    pub async fn initialize(config: BrokerConfig) -> Result<Self, ConfigurationError> {
        let backend = select_backend(config.storage.backend, &config.probe).await;
        info!(backend = %backend, "Storage backend selected");

        let secrets: Option<Arc<dyn SecretsClient>> = match backend {
            StorageBackend::CloudSecret => {
                Some(Arc::new(AwsSecretsClient::new(&config.storage.region).await))
            }
            StorageBackend::Local => None,
        };

        Self::initialize_with(config, backend, secrets).await
    }

    /// Like [`initialize`](Self::initialize) with the backend already decided
    /// and an explicit secret store client.
    pub async fn initialize_with(
        config: BrokerConfig,
        backend: StorageBackend,
        secrets: Option<Arc<dyn SecretsClient>>,
    ) -> Result<Self, ConfigurationError> {
        let resolver = CredentialResolver::new(
            backend,
            secrets.clone(),
            config.storage.credentials_secret_name(),
        );
        let credentials = resolver.resolve().await?;

        let store: Arc<dyn TokenStore> = match (backend, secrets) {
            (StorageBackend::CloudSecret, Some(secrets)) => Arc::new(CloudSecretStore::new(
                secrets,
                config.storage.tokens_secret_name(),
            )),
            (StorageBackend::CloudSecret, None) => {
                return Err(ConfigurationError::SecretStore {
                    name: config.storage.tokens_secret_name(),
                    reason: "no secret store client configured".to_string(),
                })
            }
            (StorageBackend::Local, _) => {
                Arc::new(LocalFileStore::new(&config.storage.token_file))
            }
        };

        Self::new(config, credentials, store)
    }

    /// Assemble a context from already-resolved parts.
    pub fn new(
        config: BrokerConfig,
        credentials: Credentials,
        store: Arc<dyn TokenStore>,
    ) -> Result<Self, ConfigurationError> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.retry.request_timeout_seconds))
            .user_agent(concat!("schwab-broker/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(ConfigurationError::HttpClient)?;

        Ok(Self {
            config,
            credentials,
            store,
            refresh_gate: Arc::new(RefreshGate::new()),
            http_client,
        })
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn backend(&self) -> StorageBackend {
        self.store.backend()
    }

    pub fn store(&self) -> Arc<dyn TokenStore> {
        Arc::clone(&self.store)
    }

    pub fn refresh_gate(&self) -> Arc<RefreshGate> {
        Arc::clone(&self.refresh_gate)
    }

    /// URL the user must visit to start the authorization-code flow.
    pub fn authorization_url(&self) -> String {
        authorization_url(&self.credentials, &self.config.oauth)
    }

    pub fn exchanger(&self) -> OAuthExchanger {
        OAuthExchanger::new(
            self.http_client.clone(),
            self.config.oauth.token_url.clone(),
            self.credentials.clone(),
            Arc::clone(&self.store),
        )
    }

    /// Token manager sharing this context's store and refresh lock.
    pub fn token_manager(&self) -> TokenManager {
        TokenManager::new(
            Arc::clone(&self.store),
            self.exchanger(),
            self.config.tokens.refresh_buffer(),
            Arc::clone(&self.refresh_gate),
        )
    }

    pub fn api_client(&self, tokens: Arc<TokenManager>) -> ApiClient {
        ApiClient::new(
            self.http_client.clone(),
            self.config.api.base_url.clone(),
            tokens,
            RetryPolicy::from(&self.config.retry),
        )
    }
}
