//! Resolved broker configuration.
//!
//! Configuration *parsing* (YAML/JSON config trees, wizards) lives outside
//! the core; the broker consumes this resolved record, built from environment
//! variables by [`ProxyConfig::from_env`].

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::core::ProxyError;
use crate::utils::paths;

/// Default upstream connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Where the broker listens.
#[derive(Debug, Clone)]
pub enum ListenerConfig {
    /// Unix domain socket at the given path (preferred; file mode 0600).
    Unix {
        /// Socket path.
        path: PathBuf,
    },
    /// Loopback TCP, optionally wrapped in TLS.
    Tcp {
        /// Bind host (loopback).
        host: String,
        /// Bind port (0 picks an ephemeral port).
        port: u16,
        /// TLS material; `None` serves plain HTTP.
        tls: Option<TlsConfig>,
    },
}

/// PEM-file TLS configuration. Certificates are loaded, never constructed.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    /// Certificate chain PEM path.
    pub cert_path: PathBuf,
    /// Private key PEM path (mode 0600 expected).
    pub key_path: PathBuf,
}

/// Which credential backend holds the secrets.
#[derive(Clone)]
pub enum BackendConfig {
    /// Process-local map. Testing/embedded only; never a long-lived broker.
    Memory,
    /// Whole-map AES-256-GCM file sealed under a passphrase.
    EncryptedFile {
        /// Ciphertext path.
        path: PathBuf,
        /// Passphrase for the envelope key.
        password: String,
    },
    /// Password-manager CLI engine (secrets held by an external vault).
    CliVault {
        /// CLI executable path or name.
        cli_path: String,
    },
}

impl BackendConfig {
    /// Stable backend name used in the handshake and diagnostics.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::EncryptedFile { .. } => "encrypted-file",
            Self::CliVault { .. } => "cli-vault",
        }
    }
}

impl fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory => f.write_str("Memory"),
            Self::EncryptedFile { path, .. } => f
                .debug_struct("EncryptedFile")
                .field("path", path)
                .field("password", &"<redacted>")
                .finish(),
            Self::CliVault { cli_path } => f
                .debug_struct("CliVault")
                .field("cli_path", cli_path)
                .finish(),
        }
    }
}

/// Audit log configuration.
#[derive(Debug, Clone)]
pub struct AuditConfig {
    /// When false, `append` returns `None` and nothing touches disk.
    pub enabled: bool,
    /// Log root directory (`current.jsonl`, `archive/`, `integrity/`).
    pub dir: PathBuf,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: paths::audit_dir(),
        }
    }
}

/// The resolved broker configuration record.
#[derive(Clone)]
pub struct ProxyConfig {
    /// Listen endpoint.
    pub listener: ListenerConfig,
    /// Shared secret authenticating clients; `None` disables client auth.
    pub client_token: Option<String>,
    /// Credential backend selection.
    pub backend: BackendConfig,
    /// Audit settings.
    pub audit: AuditConfig,
    /// Optional user service-definition TOML consumed by the registry.
    pub services_file: Option<PathBuf>,
    /// When set, only these services are routable.
    pub allowed_services: Option<HashSet<String>>,
    /// Upstream connect timeout.
    pub connect_timeout: Duration,
}

impl fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("listener", &self.listener)
            .field(
                "client_token",
                &self.client_token.as_ref().map(|_| "<redacted>"),
            )
            .field("backend", &self.backend)
            .field("audit", &self.audit)
            .field("services_file", &self.services_file)
            .field("allowed_services", &self.allowed_services)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl ProxyConfig {
    /// Build the resolved record from `AQUAMAN_*` environment variables.
    ///
    /// Fatal misconfiguration (unknown backend, missing backend secrets,
    /// unparsable port) surfaces as [`ProxyError::Config`].
    pub fn from_env() -> Result<Self, ProxyError> {
        let listener = if let Some(socket) = env_var("AQUAMAN_SOCKET") {
            ListenerConfig::Unix {
                path: PathBuf::from(socket),
            }
        } else {
            let host = env_var("AQUAMAN_HOST").unwrap_or_else(|| "127.0.0.1".to_owned());
            let port = match env_var("AQUAMAN_PORT") {
                Some(raw) => raw.parse::<u16>().map_err(|_| ProxyError::Config {
                    message: format!("AQUAMAN_PORT is not a valid port: {raw}"),
                })?,
                None => 0,
            };
            let tls = match (env_var("AQUAMAN_TLS_CERT"), env_var("AQUAMAN_TLS_KEY")) {
                (Some(cert), Some(key)) => Some(TlsConfig {
                    cert_path: PathBuf::from(cert),
                    key_path: PathBuf::from(key),
                }),
                (None, None) => None,
                _ => {
                    return Err(ProxyError::Config {
                        message: "AQUAMAN_TLS_CERT and AQUAMAN_TLS_KEY must be set together"
                            .to_owned(),
                    });
                }
            };
            ListenerConfig::Tcp { host, port, tls }
        };

        let backend = match env_var("AQUAMAN_BACKEND").as_deref() {
            None | Some("encrypted-file") => {
                let path = env_var("AQUAMAN_STORE_PATH")
                    .map_or_else(paths::store_path, PathBuf::from);
                let password =
                    env_var("AQUAMAN_STORE_PASSWORD").ok_or_else(|| ProxyError::Config {
                        message: "AQUAMAN_STORE_PASSWORD is required for the encrypted-file backend"
                            .to_owned(),
                    })?;
                BackendConfig::EncryptedFile { path, password }
            }
            Some("memory") => BackendConfig::Memory,
            Some("cli-vault") => BackendConfig::CliVault {
                cli_path: env_var("AQUAMAN_VAULT_CLI").unwrap_or_else(|| "op".to_owned()),
            },
            Some(other) => {
                return Err(ProxyError::Config {
                    message: format!("unknown credential backend: {other}"),
                });
            }
        };

        let audit = AuditConfig {
            enabled: env_var("AQUAMAN_AUDIT_DISABLED").is_none(),
            dir: env_var("AQUAMAN_AUDIT_DIR").map_or_else(paths::audit_dir, PathBuf::from),
        };

        let allowed_services = env_var("AQUAMAN_ALLOWED_SERVICES").map(|raw| {
            raw.split(',')
                .map(|s| s.trim().to_owned())
                .filter(|s| !s.is_empty())
                .collect::<HashSet<_>>()
        });

        let connect_timeout = match env_var("AQUAMAN_CONNECT_TIMEOUT_SECS") {
            Some(raw) => {
                let secs = raw.parse::<u64>().map_err(|_| ProxyError::Config {
                    message: format!("AQUAMAN_CONNECT_TIMEOUT_SECS is not a number: {raw}"),
                })?;
                Duration::from_secs(secs)
            }
            None => DEFAULT_CONNECT_TIMEOUT,
        };

        Ok(Self {
            listener,
            client_token: env_var("AQUAMAN_CLIENT_TOKEN"),
            backend,
            audit,
            services_file: env_var("AQUAMAN_SERVICES_FILE").map(PathBuf::from),
            allowed_services,
            connect_timeout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_names() {
        assert_eq!(BackendConfig::Memory.name(), "memory");
        assert_eq!(
            BackendConfig::EncryptedFile {
                path: PathBuf::from("/tmp/x"),
                password: "pw".to_owned(),
            }
            .name(),
            "encrypted-file"
        );
        assert_eq!(
            BackendConfig::CliVault {
                cli_path: "op".to_owned(),
            }
            .name(),
            "cli-vault"
        );
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let config = ProxyConfig {
            listener: ListenerConfig::Tcp {
                host: "127.0.0.1".to_owned(),
                port: 0,
                tls: None,
            },
            client_token: Some("super-secret-token".to_owned()),
            backend: BackendConfig::EncryptedFile {
                path: PathBuf::from("/tmp/creds.enc"),
                password: "hunter2".to_owned(),
            },
            audit: AuditConfig::default(),
            services_file: None,
            allowed_services: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        };

        let rendered = format!("{config:?}");
        assert!(!rendered.contains("super-secret-token"));
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }
}
