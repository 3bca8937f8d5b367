//! Pluggable credential persistence.
//!
//! Every backend implements [`CredentialStore`]: five operations plus a
//! `probe` availability check used at startup. Only `get` ever returns secret
//! material; `list` and diagnostics return identifying pairs only.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::BackendConfig;
use crate::core::ProxyError;

mod cli_vault;
mod encrypted_file;
mod memory;

pub use cli_vault::CliVaultStore;
pub use encrypted_file::EncryptedFileStore;
pub use memory::MemoryStore;

/// Errors from credential backends.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend cannot be reached or is locked.
    #[error("backend unavailable: {reason}")]
    Unavailable {
        /// Why the backend is unavailable.
        reason: String,
    },

    /// The persisted ciphertext envelope is malformed.
    #[error("store file has invalid format: {reason}")]
    InvalidFormat {
        /// Which part is malformed.
        reason: String,
    },

    /// Decryption failed integrity verification (wrong password or tampering).
    #[error("store integrity check failed")]
    Integrity,

    /// File or pipe error.
    #[error("store i/o error")]
    Io(#[from] std::io::Error),

    /// (De)serializing the credential map failed.
    #[error("store serialization error")]
    Serialize(#[from] serde_json::Error),

    /// An external vault process reported a failure.
    #[error("vault backend error: {message}")]
    Backend {
        /// Trimmed stderr or failure description.
        message: String,
    },
}

/// A secret value that refuses to appear in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    /// Wrap a secret string.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Plaintext access for explicit use sites (header construction, tests).
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

/// Contract shared by all credential backends.
///
/// `(service, key)` addresses one secret. Implementations provide their own
/// locking; callers may invoke operations concurrently.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Fetch a secret, or `None` when absent.
    async fn get(&self, service: &str, key: &str) -> Result<Option<Secret>, StoreError>;

    /// Store or replace a secret with optional opaque metadata.
    async fn set(
        &self,
        service: &str,
        key: &str,
        secret: &str,
        metadata: Option<serde_json::Value>,
    ) -> Result<(), StoreError>;

    /// Remove a secret. Returns whether anything was deleted.
    async fn delete(&self, service: &str, key: &str) -> Result<bool, StoreError>;

    /// Identifying `(service, key)` pairs, optionally filtered by service.
    /// Never returns secret values.
    async fn list(&self, service: Option<&str>) -> Result<Vec<(String, String)>, StoreError>;

    /// Whether a secret exists without reading it.
    async fn exists(&self, service: &str, key: &str) -> Result<bool, StoreError> {
        Ok(self.get(service, key).await?.is_some())
    }

    /// Availability check used for startup diagnostics.
    async fn probe(&self) -> Result<(), StoreError>;

    /// Stable backend name for the handshake and diagnostics.
    fn name(&self) -> &'static str;
}

/// Construct and probe the configured backend.
///
/// A failed probe is fatal: the broker never silently degrades to an
/// in-memory store.
pub async fn open_store(config: &BackendConfig) -> Result<Arc<dyn CredentialStore>, ProxyError> {
    let store: Arc<dyn CredentialStore> = match config {
        BackendConfig::Memory => Arc::new(MemoryStore::new()),
        BackendConfig::EncryptedFile { path, password } => {
            Arc::new(EncryptedFileStore::new(path.clone(), password.clone()))
        }
        BackendConfig::CliVault { cli_path } => Arc::new(CliVaultStore::new(cli_path.clone())),
    };

    store
        .probe()
        .await
        .map_err(|err| ProxyError::BackendUnavailable {
            backend: config.name().to_owned(),
            reason: err.to_string(),
        })?;

    Ok(store)
}
