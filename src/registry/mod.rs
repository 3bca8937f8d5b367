//! Service registry: resolves a service name to its upstream and auth recipe.
//!
//! Sources, low to high priority: the built-in catalogue, then an optional
//! user-provided TOML file that may add services or override built-ins by
//! name. The registry itself is an immutable snapshot; [`SharedRegistry`]
//! republishes snapshots atomically so in-flight requests keep the map they
//! started with.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;

mod builtin;

pub use builtin::builtin_services;

/// Valid service names: one path segment, no separators or dots.
#[must_use]
pub fn is_valid_service_name(name: &str) -> bool {
    static NAME_RE: std::sync::LazyLock<regex::Regex> = std::sync::LazyLock::new(|| {
        #[expect(clippy::expect_used, reason = "static pattern")]
        regex::Regex::new(r"^[A-Za-z0-9_\-]+$").expect("valid regex")
    });
    NAME_RE.is_match(name)
}

/// One header/credential injection pair for [`AuthMode::HeaderMulti`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HeaderPair {
    /// Header name to set.
    pub header: String,
    /// Optional value prefix (e.g. `"Bearer "`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    /// Which secret to read.
    pub credential_key: String,
}

/// How the upstream expects its credential.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AuthMode {
    /// Single header: `<header>: <prefix><secret>`.
    Header {
        /// Header name.
        header: String,
        /// Optional value prefix.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prefix: Option<String>,
        /// Which secret to read.
        credential_key: String,
    },
    /// Several headers injected simultaneously, in declaration order.
    HeaderMulti {
        /// The pairs to inject.
        pairs: Vec<HeaderPair>,
    },
    /// Secret embedded in the path: `/<prefix><secret>/<tail>`.
    UrlPath {
        /// Path prefix before the secret (e.g. `"bot"`).
        prefix: String,
        /// Which secret to read.
        credential_key: String,
    },
    /// `Authorization: Basic base64(<username_key> ":" <password_key>)`.
    Basic {
        /// Secret used as the username (e.g. `account_sid`).
        username_key: String,
        /// Secret used as the password (e.g. `auth_token`).
        password_key: String,
    },
    /// Registered for at-rest storage only; live traffic is rejected.
    None,
}

/// The immutable recipe for one upstream service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceSpec {
    /// Identifier; matches the first request path segment.
    pub name: String,
    /// Absolute base URL; scheme must be http or https.
    pub upstream: String,
    /// Authentication recipe.
    pub auth: AuthMode,
    /// Hostname patterns (`a.b.c` exact, `*.b.c` wildcard) for the
    /// client-side interceptor.
    #[serde(default)]
    pub host_patterns: Vec<String>,
}

/// Shape of the user service-definition TOML file.
#[derive(Debug, Deserialize)]
struct ServiceFile {
    #[serde(default)]
    services: Vec<ServiceSpec>,
}

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The user service file could not be read.
    #[error("failed to read service file {path}")]
    Read {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The user service file could not be parsed.
    #[error("failed to parse service file {path}: {message}")]
    Parse {
        /// File path.
        path: PathBuf,
        /// Parser message.
        message: String,
    },

    /// One or more specs failed validation.
    #[error("invalid service definitions: {}", errors.join("; "))]
    Invalid {
        /// All collected validation errors.
        errors: Vec<String>,
    },
}

/// Case-insensitive host-pattern match.
///
/// `*.example.com` matches subdomains but intentionally not the apex; add a
/// second exact pattern when both should match.
#[must_use]
pub fn host_matches(pattern: &str, host: &str) -> bool {
    let pattern = pattern.to_ascii_lowercase();
    let host = host.to_ascii_lowercase();
    if let Some(rest) = pattern.strip_prefix('*') {
        // "*.example.com" -> ".example.com" suffix match
        host.ends_with(rest)
    } else {
        host == pattern
    }
}

/// An immutable registry snapshot.
#[derive(Debug, Clone)]
pub struct ServiceRegistry {
    services: BTreeMap<String, ServiceSpec>,
    user_names: BTreeSet<String>,
}

impl ServiceRegistry {
    /// Build a registry from the builtin catalogue plus an optional user file.
    pub fn load(user_file: Option<&Path>) -> Result<Self, RegistryError> {
        let mut services = BTreeMap::new();
        for spec in builtin_services() {
            services.insert(spec.name.clone(), spec);
        }

        let mut user_names = BTreeSet::new();
        if let Some(path) = user_file {
            for spec in Self::read_user_file(path)? {
                user_names.insert(spec.name.clone());
                services.insert(spec.name.clone(), spec);
            }
        }

        Ok(Self {
            services,
            user_names,
        })
    }

    fn read_user_file(path: &Path) -> Result<Vec<ServiceSpec>, RegistryError> {
        let raw = std::fs::read_to_string(path).map_err(|source| RegistryError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let file: ServiceFile = toml::from_str(&raw).map_err(|err| RegistryError::Parse {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;

        let mut errors = Vec::new();
        let mut seen = BTreeSet::new();
        for spec in &file.services {
            if !seen.insert(spec.name.clone()) {
                errors.push(format!("duplicate service name '{}'", spec.name));
            }
            if let Err(spec_errors) = Self::validate(spec) {
                errors.extend(spec_errors);
            }
        }
        if errors.is_empty() {
            Ok(file.services)
        } else {
            Err(RegistryError::Invalid { errors })
        }
    }

    /// Resolve a service by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ServiceSpec> {
        self.services.get(name)
    }

    /// Whether a service is registered.
    #[must_use]
    pub fn has(&self, name: &str) -> bool {
        self.services.contains_key(name)
    }

    /// All registered specs.
    #[must_use]
    pub fn all(&self) -> Vec<&ServiceSpec> {
        self.services.values().collect()
    }

    /// Registered service names.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.services.keys().cloned().collect()
    }

    /// The union of all host patterns, each resolving to exactly one service.
    ///
    /// When a user-provided service declares a pattern a built-in already
    /// owns, the user one wins.
    #[must_use]
    pub fn host_map(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        let (user, builtin): (Vec<_>, Vec<_>) = self
            .services
            .values()
            .partition(|s| self.user_names.contains(&s.name));
        for spec in builtin.into_iter().chain(user) {
            for pattern in &spec.host_patterns {
                map.insert(pattern.to_ascii_lowercase(), spec.name.clone());
            }
        }
        map
    }

    /// Validate one spec: scheme, name charset, per-mode required fields.
    pub fn validate(spec: &ServiceSpec) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if !is_valid_service_name(&spec.name) {
            errors.push(format!(
                "service name '{}' must match [A-Za-z0-9_-]+",
                spec.name
            ));
        }

        match reqwest::Url::parse(&spec.upstream) {
            Ok(url) if url.scheme() == "http" || url.scheme() == "https" => {}
            Ok(url) => errors.push(format!(
                "service '{}' upstream scheme must be http or https, got '{}'",
                spec.name,
                url.scheme()
            )),
            Err(_) => errors.push(format!(
                "service '{}' upstream is not an absolute URL",
                spec.name
            )),
        }

        match &spec.auth {
            AuthMode::Header {
                header,
                credential_key,
                ..
            } => {
                if header.is_empty() || credential_key.is_empty() {
                    errors.push(format!(
                        "service '{}' header auth requires header and credential_key",
                        spec.name
                    ));
                }
            }
            AuthMode::HeaderMulti { pairs } => {
                if pairs.is_empty() {
                    errors.push(format!(
                        "service '{}' header_multi auth requires at least one pair",
                        spec.name
                    ));
                }
                for pair in pairs {
                    if pair.header.is_empty() || pair.credential_key.is_empty() {
                        errors.push(format!(
                            "service '{}' header_multi pair requires header and credential_key",
                            spec.name
                        ));
                    }
                }
            }
            AuthMode::UrlPath {
                prefix,
                credential_key,
            } => {
                if prefix.is_empty() || credential_key.is_empty() {
                    errors.push(format!(
                        "service '{}' url_path auth requires prefix and credential_key",
                        spec.name
                    ));
                }
            }
            AuthMode::Basic {
                username_key,
                password_key,
            } => {
                if username_key.is_empty() || password_key.is_empty() {
                    errors.push(format!(
                        "service '{}' basic auth requires username_key and password_key",
                        spec.name
                    ));
                }
            }
            AuthMode::None => {}
        }

        for pattern in &spec.host_patterns {
            let body = pattern.strip_prefix("*.").unwrap_or(pattern);
            if body.is_empty() || body.contains('*') || body.contains('/') {
                errors.push(format!(
                    "service '{}' host pattern '{pattern}' is invalid",
                    spec.name
                ));
            }
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    /// Validate a user service file without loading it into a registry.
    pub fn validate_config_file(path: &Path) -> Result<(), Vec<String>> {
        match Self::read_user_file(path) {
            Ok(_) => Ok(()),
            Err(RegistryError::Invalid { errors }) => Err(errors),
            Err(other) => Err(vec![other.to_string()]),
        }
    }
}

/// Atomically swappable registry handle shared across request handlers.
#[derive(Debug)]
pub struct SharedRegistry {
    inner: RwLock<Arc<ServiceRegistry>>,
    user_file: Option<PathBuf>,
}

impl SharedRegistry {
    /// Build the initial snapshot.
    pub fn load(user_file: Option<PathBuf>) -> Result<Self, RegistryError> {
        let registry = ServiceRegistry::load(user_file.as_deref())?;
        Ok(Self {
            inner: RwLock::new(Arc::new(registry)),
            user_file,
        })
    }

    /// The current snapshot. Handlers clone this once per request; a
    /// concurrent [`Self::reload`] never changes the map mid-request.
    #[must_use]
    pub fn snapshot(&self) -> Arc<ServiceRegistry> {
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        Arc::clone(&self.inner.read().expect("registry lock poisoned"))
    }

    /// Re-read the user file and publish a new snapshot.
    ///
    /// On failure the previous snapshot stays visible.
    pub fn reload(&self) -> Result<(), RegistryError> {
        let fresh = Arc::new(ServiceRegistry::load(self.user_file.as_deref())?);
        #[expect(clippy::expect_used, reason = "lock poisoning is unrecoverable")]
        let mut guard = self.inner.write().expect("registry lock poisoned");
        *guard = fresh;
        Ok(())
    }
}
