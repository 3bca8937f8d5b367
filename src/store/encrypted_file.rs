//! Whole-map encrypted file store.
//!
//! The entire credential map is one AES-256-GCM envelope
//! (`salt:nonce:tag:ciphertext`) at a configured path. Every mutation
//! re-encrypts with a fresh salt and nonce and lands atomically
//! (temp file, fsync, rename). Reads decrypt lazily on first access and keep
//! the plaintext map cached. Cross-process concurrent mutation is out of
//! scope (last write wins).

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::crypto::{self, CryptoError};
use crate::utils::paths;

use super::{CredentialStore, Secret, StoreError};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredCredential {
    secret: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    metadata: Option<serde_json::Value>,
}

type CredentialMap = BTreeMap<String, BTreeMap<String, StoredCredential>>;

/// File-backed store sealed under a passphrase.
pub struct EncryptedFileStore {
    path: PathBuf,
    password: String,
    // None until first access; Some thereafter. The mutex also serializes
    // mutations within this process.
    cache: Mutex<Option<CredentialMap>>,
}

impl std::fmt::Debug for EncryptedFileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedFileStore")
            .field("path", &self.path)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl EncryptedFileStore {
    /// Create a store over `path`, sealed under `password`.
    #[must_use]
    pub fn new(path: PathBuf, password: String) -> Self {
        Self {
            path,
            password,
            cache: Mutex::new(None),
        }
    }

    fn map_crypto_err(err: CryptoError) -> StoreError {
        match err {
            CryptoError::InvalidFormat { reason } => StoreError::InvalidFormat { reason },
            CryptoError::IntegrityFailure => StoreError::Integrity,
            other => StoreError::Backend {
                message: other.to_string(),
            },
        }
    }

    async fn load(&self) -> Result<CredentialMap, StoreError> {
        if !tokio::fs::try_exists(&self.path).await? {
            return Ok(CredentialMap::new());
        }
        let envelope = tokio::fs::read_to_string(&self.path).await?;
        let plaintext = crypto::decrypt_with_password(envelope.trim(), &self.password)
            .map_err(Self::map_crypto_err)?;
        Ok(serde_json::from_slice(&plaintext)?)
    }

    async fn ensure_loaded<'a>(
        &self,
        cache: &'a mut Option<CredentialMap>,
    ) -> Result<&'a mut CredentialMap, StoreError> {
        if cache.is_none() {
            *cache = Some(self.load().await?);
        }
        Ok(cache.get_or_insert_with(CredentialMap::new))
    }

    async fn persist(&self, map: &CredentialMap) -> Result<(), StoreError> {
        let plaintext = serde_json::to_vec(map)?;
        let envelope = crypto::encrypt_with_password(&plaintext, &self.password)
            .map_err(Self::map_crypto_err)?;

        if let Some(parent) = self.path.parent() {
            paths::create_private_dir(parent)?;
        }

        let tmp = self.path.with_extension("enc.tmp");
        let mut file = tokio::fs::File::create(&tmp).await?;
        paths::set_private_file_mode(&tmp)?;
        file.write_all(envelope.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for EncryptedFileStore {
    async fn get(&self, service: &str, key: &str) -> Result<Option<Secret>, StoreError> {
        let mut cache = self.cache.lock().await;
        let map = self.ensure_loaded(&mut cache).await?;
        Ok(map
            .get(service)
            .and_then(|keys| keys.get(key))
            .map(|c| Secret::new(c.secret.clone())))
    }

    async fn set(
        &self,
        service: &str,
        key: &str,
        secret: &str,
        metadata: Option<serde_json::Value>,
    ) -> Result<(), StoreError> {
        let mut cache = self.cache.lock().await;
        let map = self.ensure_loaded(&mut cache).await?;
        map.entry(service.to_owned()).or_default().insert(
            key.to_owned(),
            StoredCredential {
                secret: secret.to_owned(),
                metadata,
            },
        );
        let snapshot = map.clone();
        self.persist(&snapshot).await
    }

    async fn delete(&self, service: &str, key: &str) -> Result<bool, StoreError> {
        let mut cache = self.cache.lock().await;
        let map = self.ensure_loaded(&mut cache).await?;

        let removed = map
            .get_mut(service)
            .is_some_and(|keys| keys.remove(key).is_some());
        if removed {
            if map.get(service).is_some_and(BTreeMap::is_empty) {
                map.remove(service);
            }
            let snapshot = map.clone();
            self.persist(&snapshot).await?;
        }
        Ok(removed)
    }

    async fn list(&self, service: Option<&str>) -> Result<Vec<(String, String)>, StoreError> {
        let mut cache = self.cache.lock().await;
        let map = self.ensure_loaded(&mut cache).await?;
        Ok(map
            .iter()
            .filter(|(svc, _)| service.is_none_or(|wanted| wanted == svc.as_str()))
            .flat_map(|(svc, keys)| keys.keys().map(move |k| (svc.clone(), k.clone())))
            .collect())
    }

    async fn probe(&self) -> Result<(), StoreError> {
        // A present file must decrypt under the configured password; a
        // missing file is a valid empty store.
        let mut cache = self.cache.lock().await;
        self.ensure_loaded(&mut cache).await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "encrypted-file"
    }
}
