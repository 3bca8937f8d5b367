//! Client-side fetch interceptor.
//!
//! Runs inside the agent process. Instead of monkey-patching a global HTTP
//! client, the agent's outbound calls go through the [`HttpClient`] trait;
//! [`FetchInterceptor`] is the wrapping implementation that consults the
//! broker's host map. Traffic for known third-party hosts is rewritten to
//! the broker (with any caller-supplied auth stripped); everything else
//! passes through to the original client untouched.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HeaderMap, HeaderValue};
use http::{Method, StatusCode};
use http_body_util::{BodyExt as _, Full};
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tokio::net::UnixStream;

use crate::proxy::ConnectionInfo;

/// Reserved hostname meaning "send via the configured broker regardless of
/// DNS". Lets SDK base URLs (`ANTHROPIC_BASE_URL=http://aquaman.local/anthropic`)
/// route through the broker.
pub const SENTINEL_HOST: &str = "aquaman.local";

/// Header carrying the shared client token.
const TOKEN_HEADER: &str = "x-aquaman-token";

/// Interceptor-side errors.
#[derive(Debug, Error)]
pub enum InterceptError {
    /// The wrapped HTTP client failed.
    #[error("outbound request failed")]
    Http(#[from] reqwest::Error),

    /// Socket-path transport failed.
    #[error("broker socket request failed")]
    Hyper(#[from] hyper::Error),

    /// Connecting to the broker socket failed.
    #[error("broker socket unavailable")]
    Io(#[from] std::io::Error),

    /// The request could not be represented after rewriting.
    #[error("invalid outbound request: {message}")]
    InvalidRequest {
        /// What went wrong.
        message: String,
    },
}

/// One outbound request, normalized for the choke point.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    /// HTTP method.
    pub method: Method,
    /// Absolute target URL.
    pub url: reqwest::Url,
    /// Request headers.
    pub headers: HeaderMap,
    /// Request body.
    pub body: Bytes,
}

/// The response handed back to the agent.
#[derive(Debug)]
pub struct OutboundResponse {
    /// Status code.
    pub status: StatusCode,
    /// Response headers.
    pub headers: HeaderMap,
    /// Response body.
    pub body: Bytes,
}

/// The choke point every outbound HTTP call passes through.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Execute one request.
    async fn execute(&self, req: OutboundRequest) -> Result<OutboundResponse, InterceptError>;
}

/// Plain passthrough client over reqwest.
#[derive(Debug, Clone)]
pub struct ReqwestClient {
    inner: reqwest::Client,
}

impl ReqwestClient {
    /// Wrap an existing reqwest client.
    #[must_use]
    pub fn new(inner: reqwest::Client) -> Self {
        Self { inner }
    }
}

impl Default for ReqwestClient {
    fn default() -> Self {
        Self::new(reqwest::Client::new())
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn execute(&self, req: OutboundRequest) -> Result<OutboundResponse, InterceptError> {
        let response = self
            .inner
            .request(req.method, req.url)
            .headers(req.headers)
            .body(req.body)
            .send()
            .await?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;
        Ok(OutboundResponse {
            status,
            headers,
            body,
        })
    }
}

/// Minimal HTTP/1.1 client over a Unix domain socket, for socket-path
/// brokers.
#[derive(Debug, Clone)]
pub struct UnixHttpClient {
    socket_path: PathBuf,
}

impl UnixHttpClient {
    /// Client for the broker socket at `socket_path`.
    #[must_use]
    pub fn new(socket_path: PathBuf) -> Self {
        Self { socket_path }
    }

    /// Send one request over a fresh connection.
    pub async fn request(
        &self,
        method: Method,
        path_and_query: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<OutboundResponse, InterceptError> {
        let stream = UnixStream::connect(&self.socket_path).await?;
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
        tokio::spawn(async move {
            if let Err(err) = conn.await {
                tracing::debug!(error = %err, "broker socket connection closed");
            }
        });

        let mut builder = http::Request::builder()
            .method(method)
            .uri(path_and_query)
            .header(http::header::HOST, SENTINEL_HOST);
        for (name, value) in headers {
            builder = builder.header(name, value);
        }
        let request = builder
            .body(Full::new(body))
            .map_err(|err| InterceptError::InvalidRequest {
                message: err.to_string(),
            })?;

        let response = sender.send_request(request).await?;
        let (parts, body) = response.into_parts();
        let body = body.collect().await?.to_bytes();
        Ok(OutboundResponse {
            status: parts.status,
            headers: parts.headers,
            body,
        })
    }
}

/// Where the broker listens, from the interceptor's point of view.
#[derive(Debug, Clone)]
pub enum BrokerEndpoint {
    /// TCP base URL (`http://127.0.0.1:8402/`).
    Tcp {
        /// Base URL of the broker.
        base_url: reqwest::Url,
    },
    /// Unix domain socket path.
    Unix {
        /// Socket path.
        socket_path: PathBuf,
    },
}

impl BrokerEndpoint {
    /// Derive the endpoint from a broker handshake record.
    #[must_use]
    pub fn from_connection_info(info: &ConnectionInfo) -> Option<Self> {
        if let Some(socket_path) = &info.socket_path {
            return Some(Self::Unix {
                socket_path: PathBuf::from(socket_path),
            });
        }
        let base = info.base_url.clone().or_else(|| {
            Some(format!(
                "{}://{}:{}/",
                info.protocol,
                info.host.as_deref()?,
                info.port?
            ))
        })?;
        reqwest::Url::parse(&base)
            .ok()
            .map(|base_url| Self::Tcp { base_url })
    }
}

/// Case-insensitive hostname matcher over the broker's host map.
#[derive(Debug, Clone, Default)]
pub struct HostMatcher {
    exact: HashMap<String, String>,
    // (".suffix", service); longest suffix wins.
    wildcards: Vec<(String, String)>,
}

impl HostMatcher {
    /// Build from `pattern -> service` pairs.
    pub fn new<I, K, V>(host_map: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut exact = HashMap::new();
        let mut wildcards = Vec::new();
        for (pattern, service) in host_map {
            let pattern = pattern.as_ref().to_ascii_lowercase();
            if let Some(suffix) = pattern.strip_prefix('*') {
                wildcards.push((suffix.to_owned(), service.into()));
            } else {
                exact.insert(pattern, service.into());
            }
        }
        Self { exact, wildcards }
    }

    /// The service owning `host`, if any. Exact patterns win over wildcards;
    /// among wildcards the longest suffix wins.
    #[must_use]
    pub fn resolve(&self, host: &str) -> Option<&str> {
        let host = host.to_ascii_lowercase();
        if let Some(service) = self.exact.get(&host) {
            return Some(service);
        }
        self.wildcards
            .iter()
            .filter(|(suffix, _)| host.ends_with(suffix.as_str()))
            .max_by_key(|(suffix, _)| suffix.len())
            .map(|(_, service)| service.as_str())
    }
}

/// The wrapping [`HttpClient`] that redirects known hosts into the broker.
pub struct FetchInterceptor {
    inner: Arc<dyn HttpClient>,
    matcher: HostMatcher,
    endpoint: BrokerEndpoint,
    client_token: Option<String>,
    active: AtomicBool,
}

impl std::fmt::Debug for FetchInterceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchInterceptor")
            .field("matcher", &self.matcher)
            .field("endpoint", &self.endpoint)
            .field("client_token", &self.client_token.as_ref().map(|_| "<redacted>"))
            .field("active", &self.active)
            .finish()
    }
}

enum Route {
    /// Not ours: hand to the original client untouched.
    Passthrough,
    /// Broker's own endpoint: token only, no rewrite.
    BrokerDirect,
    /// Rewrite to `/<service>/<path>` on the broker.
    Broker { path_and_query: String },
}

impl FetchInterceptor {
    /// Build an (initially inactive) interceptor around the agent's client.
    pub fn new(
        inner: Arc<dyn HttpClient>,
        endpoint: BrokerEndpoint,
        host_map: impl IntoIterator<Item = (String, String)>,
        client_token: Option<String>,
    ) -> Self {
        Self {
            inner,
            matcher: HostMatcher::new(host_map),
            endpoint,
            client_token,
            active: AtomicBool::new(false),
        }
    }

    /// Start intercepting. Idempotent.
    pub fn activate(&self) {
        if !self.active.swap(true, Ordering::SeqCst) {
            tracing::debug!("fetch interceptor activated");
        }
    }

    /// Stop intercepting; the original client behavior is restored exactly.
    /// Idempotent.
    pub fn deactivate(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            tracing::debug!("fetch interceptor deactivated");
        }
    }

    /// Whether interception is active.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn broker_host(&self) -> Option<(String, Option<u16>)> {
        match &self.endpoint {
            BrokerEndpoint::Tcp { base_url } => base_url
                .host_str()
                .map(|h| (h.to_ascii_lowercase(), base_url.port_or_known_default())),
            BrokerEndpoint::Unix { .. } => None,
        }
    }

    fn route(&self, url: &reqwest::Url) -> Route {
        let Some(host) = url.host_str() else {
            return Route::Passthrough;
        };
        let host = host.to_ascii_lowercase();

        if let Some((broker_host, broker_port)) = self.broker_host() {
            if host == broker_host && url.port_or_known_default() == broker_port {
                return Route::BrokerDirect;
            }
        }

        let path = url.path();
        let query = url.query().map(|q| format!("?{q}")).unwrap_or_default();

        if host == SENTINEL_HOST {
            // The sentinel base URL already carries the service segment.
            return Route::Broker {
                path_and_query: format!("{path}{query}"),
            };
        }

        match self.matcher.resolve(&host) {
            Some(service) => Route::Broker {
                path_and_query: format!("/{service}{path}{query}"),
            },
            None => Route::Passthrough,
        }
    }

    fn attach_token(&self, headers: &mut HeaderMap) {
        if let Some(token) = &self.client_token {
            if let Ok(mut value) = HeaderValue::from_str(token) {
                value.set_sensitive(true);
                headers.insert(TOKEN_HEADER, value);
            }
        }
    }

    /// Strip credentials the agent may have attached; the broker injects the
    /// real ones.
    fn strip_auth(headers: &mut HeaderMap) {
        headers.remove(http::header::AUTHORIZATION);
        headers.remove("x-api-key");
    }

    async fn send_to_broker(
        &self,
        method: Method,
        path_and_query: String,
        mut headers: HeaderMap,
        body: Bytes,
    ) -> Result<OutboundResponse, InterceptError> {
        Self::strip_auth(&mut headers);
        self.attach_token(&mut headers);

        match &self.endpoint {
            BrokerEndpoint::Unix { socket_path } => {
                UnixHttpClient::new(socket_path.clone())
                    .request(method, &path_and_query, &headers, body)
                    .await
            }
            BrokerEndpoint::Tcp { base_url } => {
                let mut url = base_url.clone();
                let (path, query) = match path_and_query.split_once('?') {
                    Some((path, query)) => (path, Some(query)),
                    None => (path_and_query.as_str(), None),
                };
                url.set_path(path);
                url.set_query(query);
                self.inner
                    .execute(OutboundRequest {
                        method,
                        url,
                        headers,
                        body,
                    })
                    .await
            }
        }
    }
}

#[async_trait]
impl HttpClient for FetchInterceptor {
    async fn execute(&self, req: OutboundRequest) -> Result<OutboundResponse, InterceptError> {
        if !self.is_active() {
            return self.inner.execute(req).await;
        }

        match self.route(&req.url) {
            Route::Passthrough => self.inner.execute(req).await,
            Route::BrokerDirect => {
                let mut req = req;
                self.attach_token(&mut req.headers);
                self.inner.execute(req).await
            }
            Route::Broker { path_and_query } => {
                tracing::debug!(
                    url = %req.url,
                    rewritten = %path_and_query,
                    "redirecting request through broker"
                );
                self.send_to_broker(req.method, path_and_query, req.headers, req.body)
                    .await
            }
        }
    }
}
