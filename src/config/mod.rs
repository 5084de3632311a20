use crate::environment::BackendPreference;
use crate::error::ConfigurationError;
use serde::Deserialize;
use std::time::Duration;

/// Complete broker configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub oauth: OAuthConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub tokens: TokenConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Authorization server endpoints
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthConfig {
    #[serde(default = "default_token_url")]
    pub token_url: String,
    #[serde(default = "default_authorize_url")]
    pub authorize_url: String,
    #[serde(default = "default_scope")]
    pub scope: String,
}

fn default_token_url() -> String {
    "https://api.schwabapi.com/v1/oauth/token".to_string()
}

fn default_authorize_url() -> String {
    "https://api.schwabapi.com/v1/oauth/authorize".to_string()
}

fn default_scope() -> String {
    "readonly".to_string()
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            token_url: default_token_url(),
            authorize_url: default_authorize_url(),
            scope: default_scope(),
        }
    }
}

/// Brokerage API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_base_url")]
    pub base_url: String,
}

fn default_api_base_url() -> String {
    "https://api.schwabapi.com".to_string()
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_api_base_url(),
        }
    }
}

/// Token storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// `auto` probes the execution environment once at startup
    #[serde(default)]
    pub backend: BackendPreference,
    #[serde(default = "default_token_file")]
    pub token_file: String,
    /// Scopes the cloud secret names (`{env}/schwab-api/...`)
    #[serde(default = "default_deployment_environment")]
    pub deployment_environment: String,
    #[serde(default = "default_region")]
    pub region: String,
}

fn default_token_file() -> String {
    "cs_tokens.json".to_string()
}

fn default_deployment_environment() -> String {
    "production".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: BackendPreference::default(),
            token_file: default_token_file(),
            deployment_environment: default_deployment_environment(),
            region: default_region(),
        }
    }
}

impl StorageConfig {
    /// Secret holding the persisted token set.
    pub fn tokens_secret_name(&self) -> String {
        format!("{}/schwab-api/tokens", self.deployment_environment)
    }

    /// Secret holding the application credentials.
    pub fn credentials_secret_name(&self) -> String {
        format!("{}/schwab-api/credentials", self.deployment_environment)
    }
}

/// Instance metadata probe configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ProbeConfig {
    #[serde(default = "default_metadata_url")]
    pub metadata_url: String,
    #[serde(default = "default_probe_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_metadata_url() -> String {
    "http://169.254.169.254".to_string()
}

fn default_probe_timeout_ms() -> u64 {
    2000
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            metadata_url: default_metadata_url(),
            timeout_ms: default_probe_timeout_ms(),
        }
    }
}

impl ProbeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Token lifecycle configuration
#[derive(Debug, Clone, Deserialize)]
pub struct TokenConfig {
    /// Tokens expiring within this window are refreshed before use
    #[serde(default = "default_refresh_buffer")]
    pub refresh_buffer_seconds: i64,
}

/// Upper bound for `refresh_buffer_seconds` (one day).
pub const MAX_REFRESH_BUFFER_SECONDS: i64 = 86_400;

fn default_refresh_buffer() -> i64 {
    120
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            refresh_buffer_seconds: default_refresh_buffer(),
        }
    }
}

impl TokenConfig {
    /// Refresh buffer, clamped to `0..=MAX_REFRESH_BUFFER_SECONDS`.
    pub fn refresh_buffer(&self) -> chrono::Duration {
        let seconds = self
            .refresh_buffer_seconds
            .clamp(0, MAX_REFRESH_BUFFER_SECONDS);
        chrono::Duration::try_seconds(seconds).unwrap_or_else(chrono::Duration::zero)
    }
}

/// Retry policy for outbound brokerage calls
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
    /// Used when a 429 carries no parseable `Retry-After`
    #[serde(default = "default_retry_after")]
    pub default_retry_after_seconds: u64,
    /// Retry sequences older than this re-validate the token before the final attempt
    #[serde(default = "default_revalidate_after")]
    pub revalidate_after_seconds: u64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_max_backoff_ms() -> u64 {
    32_000
}

fn default_request_timeout() -> u64 {
    10
}

fn default_retry_after() -> u64 {
    60
}

fn default_revalidate_after() -> u64 {
    120
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            request_timeout_seconds: default_request_timeout(),
            default_retry_after_seconds: default_retry_after(),
            revalidate_after_seconds: default_revalidate_after(),
        }
    }
}

impl BrokerConfig {
    /// Overlay environment variables on top of this configuration.
    ///
    /// Unparseable values are reported rather than silently ignored, since a
    /// typo here would otherwise switch storage backends unnoticed.
    pub fn with_env_overrides(mut self) -> Result<Self, ConfigurationError> {
        if let Ok(v) = std::env::var("ENVIRONMENT") {
            self.storage.deployment_environment = v;
        }
        if let Ok(v) = std::env::var("AWS_REGION") {
            self.storage.region = v;
        }
        if let Ok(v) = std::env::var("SCHWAB_TOKEN_FILE") {
            self.storage.token_file = v;
        }
        if let Ok(v) = std::env::var("SCHWAB_STORAGE_BACKEND") {
            self.storage.backend = v
                .parse()
                .map_err(|_| ConfigurationError::InvalidValue {
                    name: "SCHWAB_STORAGE_BACKEND",
                    value: v.clone(),
                })?;
        }
        if let Ok(v) = std::env::var("SCHWAB_API_BASE_URL") {
            self.api.base_url = v;
        }
        Ok(self)
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Result<Self, ConfigurationError> {
        Self::default().with_env_overrides()
    }
}

/// Load configuration from TOML file
pub fn load_config(path: &str) -> Result<BrokerConfig, ConfigurationError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigurationError::ReadFile {
        path: path.to_string(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigurationError::ParseFile {
        path: path.to_string(),
        source,
    })
}
