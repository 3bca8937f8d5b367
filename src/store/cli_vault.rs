//! Process-keyed store backed by a password-manager CLI.
//!
//! `(service, key)` maps to a backend-native reference under the fixed
//! `aquaman/` namespace. The CLI holds the secrets; this store only shells
//! out. Invocations are serialized, and secrets travel over stdin and stdout
//! pipes only - never argv.

use std::process::Stdio;

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::{CredentialStore, Secret, StoreError};

/// Fixed namespace prefix for vault references owned by aquaman.
const NAMESPACE: &str = "aquaman";

/// A vault reference `aquaman/<service>/<key>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct VaultRef {
    service: String,
    key: String,
}

impl VaultRef {
    fn new(service: &str, key: &str) -> Self {
        Self {
            service: service.to_owned(),
            key: key.to_owned(),
        }
    }

    fn reference(&self) -> String {
        format!("{NAMESPACE}/{}/{}", self.service, self.key)
    }

    /// Parse a `aquaman/<service>/<key>` line from `list` output.
    fn parse(line: &str) -> Option<Self> {
        let mut parts = line.trim().splitn(3, '/');
        let (ns, service, key) = (parts.next()?, parts.next()?, parts.next()?);
        if ns != NAMESPACE || service.is_empty() || key.is_empty() {
            return None;
        }
        Some(Self::new(service, key))
    }
}

#[derive(Serialize)]
struct SetPayload<'a> {
    secret: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<&'a serde_json::Value>,
}

/// Store over an external vault CLI (`get`/`set`/`delete`/`list` verbs).
#[derive(Debug)]
pub struct CliVaultStore {
    cli_path: String,
    // External CLIs are not safe to invoke concurrently (session caches,
    // agent sockets); one invocation at a time.
    invocation: Mutex<()>,
}

impl CliVaultStore {
    /// Create a store shelling out to `cli_path`.
    #[must_use]
    pub fn new(cli_path: String) -> Self {
        Self {
            cli_path,
            invocation: Mutex::new(()),
        }
    }

    async fn run(&self, args: &[&str], stdin_payload: Option<&[u8]>) -> Result<String, StoreError> {
        let _serialized = self.invocation.lock().await;

        let mut command = tokio::process::Command::new(&self.cli_path);
        command
            .args(args)
            .stdin(if stdin_payload.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|err| StoreError::Unavailable {
            reason: format!("failed to execute {}: {err}", self.cli_path),
        })?;

        if let Some(payload) = stdin_payload {
            let Some(mut stdin) = child.stdin.take() else {
                return Err(StoreError::Backend {
                    message: "vault CLI stdin unavailable".to_owned(),
                });
            };
            stdin.write_all(payload).await?;
            stdin.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(StoreError::Backend {
                message: stderr.trim().to_owned(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
    }
}

#[async_trait]
impl CredentialStore for CliVaultStore {
    async fn get(&self, service: &str, key: &str) -> Result<Option<Secret>, StoreError> {
        let vault_ref = VaultRef::new(service, key).reference();
        match self.run(&["get", &vault_ref], None).await {
            Ok(value) if value.is_empty() => Ok(None),
            Ok(value) => Ok(Some(Secret::new(value))),
            // A missing item is a normal miss, not a backend failure.
            Err(StoreError::Backend { message }) if message.contains("not found") => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn set(
        &self,
        service: &str,
        key: &str,
        secret: &str,
        metadata: Option<serde_json::Value>,
    ) -> Result<(), StoreError> {
        let vault_ref = VaultRef::new(service, key).reference();
        let payload = serde_json::to_vec(&SetPayload {
            secret,
            metadata: metadata.as_ref(),
        })?;
        self.run(&["set", &vault_ref], Some(&payload)).await?;
        Ok(())
    }

    async fn delete(&self, service: &str, key: &str) -> Result<bool, StoreError> {
        let vault_ref = VaultRef::new(service, key).reference();
        match self.run(&["delete", &vault_ref], None).await {
            Ok(_) => Ok(true),
            Err(StoreError::Backend { message }) if message.contains("not found") => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn list(&self, service: Option<&str>) -> Result<Vec<(String, String)>, StoreError> {
        let output = self.run(&["list", NAMESPACE], None).await?;
        Ok(output
            .lines()
            .filter_map(VaultRef::parse)
            .filter(|r| service.is_none_or(|wanted| wanted == r.service))
            .map(|r| (r.service, r.key))
            .collect())
    }

    async fn probe(&self) -> Result<(), StoreError> {
        let status = tokio::process::Command::new(&self.cli_path)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|err| StoreError::Unavailable {
                reason: format!("{} not found: {err}", self.cli_path),
            })?;

        if status.success() {
            Ok(())
        } else {
            Err(StoreError::Unavailable {
                reason: format!("{} exited with {status}", self.cli_path),
            })
        }
    }

    fn name(&self) -> &'static str {
        "cli-vault"
    }
}
