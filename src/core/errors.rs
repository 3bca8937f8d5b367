//! Core error taxonomy with rich context for debugging.
//!
//! Every error that can become visible at the HTTP boundary lives here so the
//! status mapping stays in one place. Module-local failures (store, audit,
//! crypto) carry their own error types and are converted at the boundary.

use thiserror::Error;

/// Errors raised by the credential broker.
///
/// The broker never leaks secret material or internal paths through these
/// messages; anything sensitive stays in the structured log fields.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Malformed or incomplete configuration. Fatal at startup.
    #[error("configuration error: {message}")]
    Config {
        /// What is wrong with the configuration.
        message: String,
    },

    /// The credential backend cannot be reached or is locked.
    ///
    /// The broker refuses to start in this state; it never falls back to an
    /// in-memory store.
    #[error("credential backend '{backend}' is unavailable: {reason}")]
    BackendUnavailable {
        /// The configured backend name.
        backend: String,
        /// Why the backend is unavailable.
        reason: String,
    },

    /// The store resolved but holds no secret for `(service, key)`.
    #[error("{service}/{key} not found")]
    CredentialNotFound {
        /// The requested service.
        service: String,
        /// The missing credential key.
        key: String,
    },

    /// Client authentication failed. Deliberately carries no detail.
    #[error("client authentication failed")]
    ClientAuthFailure,

    /// The first path segment names a service the registry does not know.
    #[error("No configuration for service: {name}")]
    UnknownService {
        /// The requested service name.
        name: String,
    },

    /// The first path segment is not a valid service name.
    #[error("invalid service name")]
    InvalidServiceName,

    /// The service is registered for at-rest storage only.
    #[error("service '{service}' is configured for at-rest storage only")]
    AtRestOnly {
        /// The requested service.
        service: String,
    },

    /// Opening the upstream connection failed.
    #[error("upstream connection failed for '{service}'")]
    UpstreamConnect {
        /// The requested service.
        service: String,
        /// The underlying client error.
        #[source]
        source: reqwest::Error,
    },

    /// The upstream did not answer within the connect timeout.
    #[error("upstream timeout for '{service}'")]
    UpstreamTimeout {
        /// The requested service.
        service: String,
    },

    /// The upstream connection was torn down mid-exchange.
    #[error("upstream aborted for '{service}'")]
    UpstreamAbort {
        /// The requested service.
        service: String,
        /// The underlying client error.
        #[source]
        source: reqwest::Error,
    },

    /// A hash chain or AEAD tag failed to verify. Never recovered
    /// automatically.
    #[error("integrity failure: {message}")]
    Integrity {
        /// What failed to verify.
        message: String,
    },

    /// File or socket error.
    #[error("i/o error")]
    Io {
        /// The underlying error.
        #[from]
        source: std::io::Error,
    },

    /// Anything that should never surface as-is to a client.
    #[error("internal error")]
    Internal {
        /// The underlying error.
        #[source]
        source: anyhow::Error,
    },
}

impl ProxyError {
    /// The HTTP status this error maps to at the broker boundary.
    #[must_use]
    pub fn status(&self) -> http::StatusCode {
        use http::StatusCode;
        match self {
            Self::AtRestOnly { .. } => StatusCode::BAD_REQUEST,
            Self::CredentialNotFound { .. } => StatusCode::UNAUTHORIZED,
            Self::ClientAuthFailure => StatusCode::FORBIDDEN,
            Self::UnknownService { .. } | Self::InvalidServiceName => StatusCode::NOT_FOUND,
            Self::UpstreamConnect { .. } | Self::UpstreamAbort { .. } => StatusCode::BAD_GATEWAY,
            Self::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// A remediation hint for errors that have an obvious operator fix.
    #[must_use]
    pub fn fix(&self) -> Option<String> {
        match self {
            Self::CredentialNotFound { service, key } => {
                Some(format!("Run: aquaman credentials add {service} {key}"))
            }
            _ => None,
        }
    }

    /// Short machine-readable label recorded in audit entries.
    #[must_use]
    pub fn audit_label(&self) -> &'static str {
        match self {
            Self::Config { .. } => "config_error",
            Self::BackendUnavailable { .. } => "backend_unavailable",
            Self::CredentialNotFound { .. } => "credential_not_found",
            Self::ClientAuthFailure => "client_auth_failure",
            Self::UnknownService { .. } => "unknown_service",
            Self::InvalidServiceName => "invalid_service_name",
            Self::AtRestOnly { .. } => "at_rest_only",
            Self::UpstreamConnect { .. } => "upstream_connect",
            Self::UpstreamTimeout { .. } => "upstream_timeout",
            Self::UpstreamAbort { .. } => "upstream_abort",
            Self::Integrity { .. } => "integrity_failure",
            Self::Io { .. } => "io_error",
            Self::Internal { .. } => "internal_error",
        }
    }
}
