//! Request forwarding: routing, credential injection, and streaming.
//!
//! One upstream request per inbound request. The response body streams
//! through without buffering, so SSE and chunked responses pass unreframed
//! and client back-pressure propagates to the upstream read. Dropping the
//! handler future (client disconnect) drops the upstream stream with it.

use axum::body::Body;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{StatusCode, Uri};

use crate::audit::{AuditKind, AuditLogger, CredentialOperation, credential_access_data};
use crate::core::ProxyError;
use crate::registry::{AuthMode, HeaderPair, ServiceSpec, is_valid_service_name};
use crate::store::CredentialStore;

use super::server::{AppState, client_authorized, error_response};

/// Caller-context headers consumed by the broker (never forwarded).
pub(crate) const SESSION_HEADER: &str = "x-aquaman-session";
pub(crate) const AGENT_HEADER: &str = "x-aquaman-agent";
/// Client-auth header consumed by the broker (never forwarded).
pub(crate) const TOKEN_HEADER: &str = "x-aquaman-token";

/// Hop-by-hop headers dropped from upstream responses.
fn is_hop_by_hop(header: &str) -> bool {
    matches!(
        header.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

fn context_value(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .unwrap_or("proxy")
        .to_owned()
}

/// Catch-all handler: everything that is not `/_health` or `/_hostmap`.
pub(crate) async fn proxy_handler(
    State(state): State<AppState>,
    req: http::Request<Body>,
) -> Response {
    if !client_authorized(&state.config, req.headers()) {
        // Deliberately plain text with no detail; no audit entry either, so
        // an unauthenticated caller cannot grow the log.
        return (StatusCode::FORBIDDEN, "Forbidden").into_response();
    }

    let session_id = context_value(req.headers(), SESSION_HEADER);
    let agent_id = context_value(req.headers(), AGENT_HEADER);

    match handle_forward(&state, req, &session_id, &agent_id).await {
        Ok(response) => response,
        Err((err, audited_service)) => {
            if let Some(service) = audited_service {
                let data = credential_access_data(
                    &service,
                    CredentialOperation::Read,
                    false,
                    Some(err.audit_label()),
                );
                if let Err(audit_err) = state
                    .audit
                    .append(AuditKind::CredentialAccess, &session_id, &agent_id, data)
                    .await
                {
                    tracing::error!(error = %audit_err, "failed to audit rejected request");
                }
            }
            tracing::warn!(error = %err, status = %err.status(), "request rejected");
            error_response(&err)
        }
    }
}

/// Emits a best-effort `client_cancelled` entry when the handler future is
/// dropped before an outcome was recorded.
struct CancelAudit {
    audit: AuditLogger,
    service: String,
    session_id: String,
    agent_id: String,
    armed: bool,
}

impl CancelAudit {
    fn new(audit: AuditLogger, service: &str, session_id: &str, agent_id: &str) -> Self {
        Self {
            audit,
            service: service.to_owned(),
            session_id: session_id.to_owned(),
            agent_id: agent_id.to_owned(),
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CancelAudit {
    fn drop(&mut self) {
        if self.armed {
            self.audit.append_background(
                AuditKind::CredentialAccess,
                &self.session_id,
                &self.agent_id,
                credential_access_data(
                    &self.service,
                    CredentialOperation::Read,
                    false,
                    Some("client_cancelled"),
                ),
            );
        }
    }
}

type Rejection = (ProxyError, Option<String>);

async fn handle_forward(
    state: &AppState,
    req: http::Request<Body>,
    session_id: &str,
    agent_id: &str,
) -> Result<Response, Rejection> {
    let (service_name, tail) = parse_service_path(req.uri()).map_err(|err| (err, None))?;

    if let Some(allowed) = &state.config.allowed_services {
        if !allowed.contains(&service_name) {
            return Err((
                ProxyError::UnknownService {
                    name: service_name.clone(),
                },
                None,
            ));
        }
    }

    // One snapshot per request; a concurrent reload does not change the map
    // under our feet.
    let registry = state.registry.snapshot();
    let spec = registry
        .get(&service_name)
        .ok_or_else(|| {
            (
                ProxyError::UnknownService {
                    name: service_name.clone(),
                },
                None,
            )
        })?
        .clone();

    if matches!(spec.auth, AuthMode::None) {
        // No upstream socket is ever opened for at-rest services.
        return Err((
            ProxyError::AtRestOnly {
                service: service_name.clone(),
            },
            Some(service_name),
        ));
    }

    // From here on a cancelled client leaves a trace in the log.
    let mut cancel_guard =
        CancelAudit::new(state.audit.clone(), &service_name, session_id, agent_id);

    let result = forward_to_upstream(state, req, &spec, &tail, session_id, agent_id).await;
    cancel_guard.disarm();
    result.map_err(|err| (err, Some(service_name)))
}

async fn forward_to_upstream(
    state: &AppState,
    req: http::Request<Body>,
    spec: &ServiceSpec,
    tail: &str,
    session_id: &str,
    agent_id: &str,
) -> Result<Response, ProxyError> {
    let auth = resolve_auth(state.store.as_ref(), spec).await?;
    let url = build_upstream_url(spec, &auth, tail, req.uri().query())?;

    let (parts, body) = req.into_parts();

    let mut request = state
        .client
        .request(parts.method, url)
        .body(reqwest::Body::wrap_stream(body.into_data_stream()));

    request = request.headers(forwarded_headers(&parts.headers, &auth));
    if let ResolvedAuth::Headers(pairs) = &auth {
        for (name, value) in pairs {
            request = request.header(name, value);
        }
    }

    let upstream = request.send().await.map_err(|err| {
        if err.is_timeout() {
            ProxyError::UpstreamTimeout {
                service: spec.name.clone(),
            }
        } else if err.is_connect() {
            ProxyError::UpstreamConnect {
                service: spec.name.clone(),
                source: err,
            }
        } else {
            ProxyError::UpstreamAbort {
                service: spec.name.clone(),
                source: err,
            }
        }
    })?;

    let status = upstream.status();
    let success = status.as_u16() < 400;

    // The credential_access entry commits before the first response byte, so
    // a durability failure is observable instead of silently dropped.
    let data = credential_access_data(
        &spec.name,
        CredentialOperation::Read,
        success,
        (!success)
            .then(|| format!("upstream_status_{}", status.as_u16()))
            .as_deref(),
    );
    state
        .audit
        .append(AuditKind::CredentialAccess, session_id, agent_id, data)
        .await
        .map_err(|err| ProxyError::Internal { source: err.into() })?;

    let mut builder = Response::builder().status(status);
    for (name, value) in upstream.headers() {
        if !is_hop_by_hop(name.as_str()) {
            builder = builder.header(name, value);
        }
    }
    builder
        .body(Body::from_stream(upstream.bytes_stream()))
        .map_err(|err| ProxyError::Internal { source: err.into() })
}

/// Split `/<service>/<tail>` and validate the service segment.
///
/// The segment comes from the raw request path, so any percent-encoded byte
/// still contains `%` and fails the charset check; encoded `/`, `.`, and
/// control characters never reach the registry.
fn parse_service_path(uri: &Uri) -> Result<(String, String), ProxyError> {
    let path = uri.path();
    let trimmed = path.strip_prefix('/').unwrap_or(path);
    let (service, tail) = match trimmed.split_once('/') {
        Some((service, tail)) => (service, tail),
        None => (trimmed, ""),
    };

    if service.is_empty() || !is_valid_service_name(service) {
        return Err(ProxyError::InvalidServiceName);
    }
    Ok((service.to_owned(), tail.to_owned()))
}

/// Credentials resolved into their injection shape.
#[derive(Debug)]
enum ResolvedAuth {
    /// Headers to set on the upstream request, in stable order.
    Headers(Vec<(HeaderName, HeaderValue)>),
    /// Secret spliced into the forwarded path.
    UrlPath { prefix: String, secret: String },
}

fn sensitive_value(raw: &str) -> Result<HeaderValue, ProxyError> {
    let mut value = HeaderValue::from_str(raw).map_err(|err| ProxyError::Internal {
        source: anyhow::anyhow!("credential is not a valid header value: {err}"),
    })?;
    value.set_sensitive(true);
    Ok(value)
}

fn header_name(raw: &str) -> Result<HeaderName, ProxyError> {
    raw.parse::<HeaderName>().map_err(|err| ProxyError::Internal {
        source: anyhow::anyhow!("invalid auth header name: {err}"),
    })
}

async fn lookup(
    store: &dyn CredentialStore,
    service: &str,
    key: &str,
) -> Result<String, ProxyError> {
    let secret = store
        .get(service, key)
        .await
        .map_err(|err| ProxyError::BackendUnavailable {
            backend: store.name().to_owned(),
            reason: err.to_string(),
        })?
        .ok_or_else(|| ProxyError::CredentialNotFound {
            service: service.to_owned(),
            key: key.to_owned(),
        })?;
    Ok(secret.expose().to_owned())
}

async fn resolve_auth(
    store: &dyn CredentialStore,
    spec: &ServiceSpec,
) -> Result<ResolvedAuth, ProxyError> {
    match &spec.auth {
        AuthMode::Header {
            header,
            prefix,
            credential_key,
        } => {
            let secret = lookup(store, &spec.name, credential_key).await?;
            let value = format!("{}{secret}", prefix.as_deref().unwrap_or(""));
            Ok(ResolvedAuth::Headers(vec![(
                header_name(header)?,
                sensitive_value(&value)?,
            )]))
        }
        AuthMode::HeaderMulti { pairs } => {
            let mut headers = Vec::with_capacity(pairs.len());
            for HeaderPair {
                header,
                prefix,
                credential_key,
            } in pairs
            {
                let secret = lookup(store, &spec.name, credential_key).await?;
                let value = format!("{}{secret}", prefix.as_deref().unwrap_or(""));
                headers.push((header_name(header)?, sensitive_value(&value)?));
            }
            Ok(ResolvedAuth::Headers(headers))
        }
        AuthMode::Basic {
            username_key,
            password_key,
        } => {
            let username = lookup(store, &spec.name, username_key).await?;
            let password = lookup(store, &spec.name, password_key).await?;
            let encoded = BASE64.encode(format!("{username}:{password}"));
            Ok(ResolvedAuth::Headers(vec![(
                http::header::AUTHORIZATION,
                sensitive_value(&format!("Basic {encoded}"))?,
            )]))
        }
        AuthMode::UrlPath {
            prefix,
            credential_key,
        } => {
            let secret = lookup(store, &spec.name, credential_key).await?;
            Ok(ResolvedAuth::UrlPath {
                prefix: prefix.clone(),
                secret,
            })
        }
        AuthMode::None => Err(ProxyError::AtRestOnly {
            service: spec.name.clone(),
        }),
    }
}

fn build_upstream_url(
    spec: &ServiceSpec,
    auth: &ResolvedAuth,
    tail: &str,
    query: Option<&str>,
) -> Result<reqwest::Url, ProxyError> {
    let mut url = reqwest::Url::parse(&spec.upstream).map_err(|err| ProxyError::Internal {
        source: anyhow::anyhow!("registered upstream is not a valid URL: {err}"),
    })?;

    let base = url.path().trim_end_matches('/').to_owned();
    let forwarded = match auth {
        ResolvedAuth::UrlPath { prefix, secret } => {
            format!("{base}/{prefix}{secret}/{tail}")
        }
        ResolvedAuth::Headers(_) => format!("{base}/{tail}"),
    };
    url.set_path(&forwarded);
    url.set_query(query);
    Ok(url)
}

/// Copy inbound headers, dropping everything the broker owns or injects.
///
/// `Content-Length`/`Transfer-Encoding` are preserved as received so the
/// body streams with its original framing; hop-by-hop filtering applies to
/// the response side only.
fn forwarded_headers(inbound: &HeaderMap, auth: &ResolvedAuth) -> HeaderMap {
    let injected: Vec<&HeaderName> = match auth {
        ResolvedAuth::Headers(pairs) => pairs.iter().map(|(name, _)| name).collect(),
        ResolvedAuth::UrlPath { .. } => Vec::new(),
    };

    let mut headers = HeaderMap::new();
    for (name, value) in inbound {
        let lowered = name.as_str();
        if lowered == "host"
            || lowered == TOKEN_HEADER
            || lowered == SESSION_HEADER
            || lowered == AGENT_HEADER
            || name == http::header::AUTHORIZATION
            || injected.iter().any(|inj| *inj == name)
        {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers
}
