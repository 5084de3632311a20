//! Token persistence backends.
//!
//! Both backends store the same JSON record and replace it wholesale on every
//! save, so a reader never observes a partially written token set.

use super::TokenSet;
use crate::credentials::SecretsClient;
use crate::environment::StorageBackend;
use crate::error::StorageError;
use async_trait::async_trait;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

pub const TOKENS_SECRET_DESCRIPTION: &str = "Charles Schwab API tokens";

/// Storage-of-record for the current token set.
///
/// Implementations never cache: every `load` reads the backing store, since
/// other processes may have written a newer record.
#[async_trait]
pub trait TokenStore: Send + Sync {
    fn backend(&self) -> StorageBackend;

    /// Returns `Ok(None)` when nothing has been stored yet.
    async fn load(&self) -> Result<Option<TokenSet>, StorageError>;

    async fn save(&self, tokens: &TokenSet) -> Result<(), StorageError>;
}

/// JSON file on local disk, replaced atomically via temp file + rename.
pub struct LocalFileStore {
    path: PathBuf,
}

impl LocalFileStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> StorageError {
        StorageError::Io {
            path: self.path.display().to_string(),
            source,
        }
    }
}

/// Write `contents` to a temp file in the target directory, then rename it
/// over `path`. Rename within one directory is atomic.
fn write_atomically(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[async_trait]
impl TokenStore for LocalFileStore {
    fn backend(&self) -> StorageBackend {
        StorageBackend::Local
    }

    async fn load(&self) -> Result<Option<TokenSet>, StorageError> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No token file");
                return Ok(None);
            }
            Err(e) => return Err(self.io_error(e)),
        };
        TokenSet::from_stored_json(&raw).map(Some)
    }

    async fn save(&self, tokens: &TokenSet) -> Result<(), StorageError> {
        let contents = tokens.to_stored_json()?;
        let path = self.path.clone();

        tokio::task::spawn_blocking(move || write_atomically(&path, contents.as_bytes()))
            .await
            .map_err(|e| self.io_error(std::io::Error::other(e)))?
            .map_err(|e| self.io_error(e))?;

        info!(
            backend = %StorageBackend::Local,
            path = %self.path.display(),
            expires_at = %tokens.expires_at,
            "Tokens saved"
        );
        Ok(())
    }
}

/// Named secret in the cloud secret store.
pub struct CloudSecretStore {
    secrets: Arc<dyn SecretsClient>,
    secret_name: String,
}

impl CloudSecretStore {
    /// # Arguments
    /// * `secrets` - Secret store client
    /// * `secret_name` - Usually `{deployment_environment}/schwab-api/tokens`
    pub fn new(secrets: Arc<dyn SecretsClient>, secret_name: impl Into<String>) -> Self {
        Self {
            secrets,
            secret_name: secret_name.into(),
        }
    }

    pub fn secret_name(&self) -> &str {
        &self.secret_name
    }
}

#[async_trait]
impl TokenStore for CloudSecretStore {
    fn backend(&self) -> StorageBackend {
        StorageBackend::CloudSecret
    }

    async fn load(&self) -> Result<Option<TokenSet>, StorageError> {
        match self.secrets.get_secret(&self.secret_name).await? {
            Some(raw) => TokenSet::from_stored_json(&raw).map(Some),
            None => {
                debug!(secret = %self.secret_name, "No tokens secret");
                Ok(None)
            }
        }
    }

    async fn save(&self, tokens: &TokenSet) -> Result<(), StorageError> {
        let contents = tokens.to_stored_json()?;

        if self
            .secrets
            .update_secret(&self.secret_name, &contents)
            .await?
        {
            info!(
                backend = %StorageBackend::CloudSecret,
                secret = %self.secret_name,
                expires_at = %tokens.expires_at,
                "Tokens updated"
            );
            return Ok(());
        }

        match self
            .secrets
            .create_secret(&self.secret_name, &contents, TOKENS_SECRET_DESCRIPTION)
            .await
        {
            Ok(()) => {
                info!(
                    backend = %StorageBackend::CloudSecret,
                    secret = %self.secret_name,
                    expires_at = %tokens.expires_at,
                    "Tokens secret created"
                );
                Ok(())
            }
            // Another process created it between our update and create
            Err(create_err) => {
                if self
                    .secrets
                    .update_secret(&self.secret_name, &contents)
                    .await?
                {
                    Ok(())
                } else {
                    Err(create_err)
                }
            }
        }
    }
}
