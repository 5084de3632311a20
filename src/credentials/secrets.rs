//! Cloud secret store access.
//!
//! The Credential Resolver and the cloud token store both go through
//! [`SecretsClient`], so neither depends on the AWS SDK directly.

use crate::error::StorageError;
use async_trait::async_trait;
use aws_sdk_secretsmanager::error::DisplayErrorContext;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tracing::debug;

/// Named-secret storage.
#[async_trait]
pub trait SecretsClient: Send + Sync {
    /// Returns `Ok(None)` when the secret does not exist.
    async fn get_secret(&self, name: &str) -> Result<Option<String>, StorageError>;

    /// Replaces the secret value. Returns `Ok(false)` when the secret does not exist.
    async fn update_secret(&self, name: &str, value: &str) -> Result<bool, StorageError>;

    async fn create_secret(
        &self,
        name: &str,
        value: &str,
        description: &str,
    ) -> Result<(), StorageError>;
}

/// AWS Secrets Manager client for a single region.
pub struct AwsSecretsClient {
    client: aws_sdk_secretsmanager::Client,
}

impl AwsSecretsClient {
    /// Builds a client from the default AWS credential chain (instance role on EC2).
    pub async fn new(region: &str) -> Self {
        let config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(region.to_string()))
            .load()
            .await;
        Self {
            client: aws_sdk_secretsmanager::Client::new(&config),
        }
    }
}

fn secret_error(name: &str, reason: String) -> StorageError {
    StorageError::SecretStore {
        name: name.to_string(),
        reason,
    }
}

#[async_trait]
impl SecretsClient for AwsSecretsClient {
    async fn get_secret(&self, name: &str) -> Result<Option<String>, StorageError> {
        match self.client.get_secret_value().secret_id(name).send().await {
            Ok(output) => Ok(output.secret_string().map(str::to_string)),
            Err(err) => {
                let err = err.into_service_error();
                if err.is_resource_not_found_exception() {
                    debug!(secret = %name, "Secret does not exist");
                    Ok(None)
                } else {
                    Err(secret_error(name, DisplayErrorContext(&err).to_string()))
                }
            }
        }
    }

    async fn update_secret(&self, name: &str, value: &str) -> Result<bool, StorageError> {
        match self
            .client
            .update_secret()
            .secret_id(name)
            .secret_string(value)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(err) => {
                let err = err.into_service_error();
                if err.is_resource_not_found_exception() {
                    Ok(false)
                } else {
                    Err(secret_error(name, DisplayErrorContext(&err).to_string()))
                }
            }
        }
    }

    async fn create_secret(
        &self,
        name: &str,
        value: &str,
        description: &str,
    ) -> Result<(), StorageError> {
        self.client
            .create_secret()
            .name(name)
            .secret_string(value)
            .description(description)
            .send()
            .await
            .map_err(|err| secret_error(name, DisplayErrorContext(&err).to_string()))?;
        Ok(())
    }
}

/// In-process secret store.
///
/// Stands in for the cloud store in tests and local dry runs; counts writes so
/// callers can check which path a save took.
#[derive(Default)]
pub struct MemorySecretsClient {
    secrets: Mutex<HashMap<String, String>>,
    updates: AtomicUsize,
    creates: AtomicUsize,
}

impl MemorySecretsClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate a secret.
    pub fn insert(&self, name: &str, value: &str) {
        self.lock().insert(name.to_string(), value.to_string());
    }

    /// Current raw value of a secret.
    pub fn value(&self, name: &str) -> Option<String> {
        self.lock().get(name).cloned()
    }

    /// Number of successful in-place updates.
    pub fn update_count(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    /// Number of secrets created.
    pub fn create_count(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.secrets.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl SecretsClient for MemorySecretsClient {
    async fn get_secret(&self, name: &str) -> Result<Option<String>, StorageError> {
        Ok(self.lock().get(name).cloned())
    }

    async fn update_secret(&self, name: &str, value: &str) -> Result<bool, StorageError> {
        let mut secrets = self.lock();
        match secrets.get_mut(name) {
            Some(existing) => {
                *existing = value.to_string();
                self.updates.fetch_add(1, Ordering::SeqCst);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn create_secret(
        &self,
        name: &str,
        value: &str,
        _description: &str,
    ) -> Result<(), StorageError> {
        let mut secrets = self.lock();
        if secrets.contains_key(name) {
            return Err(secret_error(name, "secret already exists".to_string()));
        }
        secrets.insert(name.to_string(), value.to_string());
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
