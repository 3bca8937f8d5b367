//! Process-local credential map. Testing and embedded use only; a long-lived
//! broker never selects this backend.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{CredentialStore, Secret, StoreError};

#[derive(Debug, Clone)]
struct StoredCredential {
    secret: String,
    #[allow(dead_code, reason = "kept opaquely per the store contract")]
    metadata: Option<serde_json::Value>,
}

/// In-memory `(service, key) -> secret` map with standard semantics.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<(String, String), StoredCredential>>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn get(&self, service: &str, key: &str) -> Result<Option<Secret>, StoreError> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(&(service.to_owned(), key.to_owned()))
            .map(|c| Secret::new(c.secret.clone())))
    }

    async fn set(
        &self,
        service: &str,
        key: &str,
        secret: &str,
        metadata: Option<serde_json::Value>,
    ) -> Result<(), StoreError> {
        let mut entries = self.entries.write().await;
        entries.insert(
            (service.to_owned(), key.to_owned()),
            StoredCredential {
                secret: secret.to_owned(),
                metadata,
            },
        );
        Ok(())
    }

    async fn delete(&self, service: &str, key: &str) -> Result<bool, StoreError> {
        let mut entries = self.entries.write().await;
        Ok(entries
            .remove(&(service.to_owned(), key.to_owned()))
            .is_some())
    }

    async fn list(&self, service: Option<&str>) -> Result<Vec<(String, String)>, StoreError> {
        let entries = self.entries.read().await;
        Ok(entries
            .keys()
            .filter(|(svc, _)| service.is_none_or(|wanted| wanted == svc))
            .cloned()
            .collect())
    }

    async fn probe(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_delete_round_trip() {
        let store = MemoryStore::new();

        store
            .set("anthropic", "api_key", "sk-ant-TEST", None)
            .await
            .unwrap();
        let secret = store.get("anthropic", "api_key").await.unwrap().unwrap();
        assert_eq!(secret.expose(), "sk-ant-TEST");

        assert!(store.delete("anthropic", "api_key").await.unwrap());
        assert!(!store.delete("anthropic", "api_key").await.unwrap());
        assert!(store.get("anthropic", "api_key").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_filters_by_service_and_hides_secrets() {
        let store = MemoryStore::new();
        store.set("twilio", "account_sid", "ACx", None).await.unwrap();
        store.set("twilio", "auth_token", "ty", None).await.unwrap();
        store.set("github", "token", "ghp_x", None).await.unwrap();

        let all = store.list(None).await.unwrap();
        assert_eq!(all.len(), 3);

        let twilio = store.list(Some("twilio")).await.unwrap();
        assert_eq!(
            twilio,
            vec![
                ("twilio".to_owned(), "account_sid".to_owned()),
                ("twilio".to_owned(), "auth_token".to_owned()),
            ]
        );
    }

    #[tokio::test]
    async fn test_exists() {
        let store = MemoryStore::new();
        assert!(!store.exists("slack", "bot_token").await.unwrap());
        store.set("slack", "bot_token", "xoxb-1", None).await.unwrap();
        assert!(store.exists("slack", "bot_token").await.unwrap());
    }
}
