//! The broker HTTP server.
//!
//! Binds a Unix socket (preferred), loopback TCP, or TLS-wrapped TCP
//! endpoint, serves `/_health` and `/_hostmap`, and hands everything else to
//! the forwarding handler. Shutdown drains in-flight requests and flushes the
//! audit queue; an unexpected audit-writer exit also brings the broker down,
//! because serving without durability is not acceptable.

use std::collections::BTreeMap;
use std::io::BufReader;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context as _;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use http::header::HeaderMap;
use http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::{TcpListener, UnixListener};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::audit::AuditLogger;
use crate::config::{ListenerConfig, ProxyConfig, TlsConfig};
use crate::core::ProxyError;
use crate::crypto;
use crate::registry::SharedRegistry;
use crate::store::{self, CredentialStore};
use crate::utils::paths;

use super::forward::{self, TOKEN_HEADER};

/// Shared state for request handlers.
#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) config: Arc<ProxyConfig>,
    pub(crate) registry: Arc<SharedRegistry>,
    pub(crate) store: Arc<dyn CredentialStore>,
    pub(crate) audit: AuditLogger,
    pub(crate) client: reqwest::Client,
    pub(crate) started_at: Instant,
}

/// The startup handshake record, emitted as a single JSON line on stdout.
///
/// This is the contract between the broker process and its lifecycle
/// manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    /// Always true in an emitted record.
    pub ready: bool,
    /// Unix socket path, when serving over a socket.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<String>,
    /// TCP host, when serving over TCP.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    /// Bound TCP port, when serving over TCP.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Convenience base URL for TCP endpoints.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// `"unix"`, `"http"`, or `"https"`.
    pub protocol: String,
    /// Registered service names.
    pub services: Vec<String>,
    /// Active credential backend name.
    pub backend: String,
    /// `pattern -> service` map for the client-side interceptor.
    pub host_map: BTreeMap<String, String>,
    /// Broker version.
    pub version: String,
}

enum BoundListener {
    Unix { listener: UnixListener, path: std::path::PathBuf },
    Tcp { listener: TcpListener, tls: Option<TlsAcceptor> },
}

/// A bound, not-yet-serving broker.
#[expect(
    missing_debug_implementations,
    reason = "contains non-Debug listener/acceptor state"
)]
pub struct ProxyServer {
    state: AppState,
    listener: BoundListener,
}

impl ProxyServer {
    /// Open the store (probing it), build the registry and audit log, and
    /// bind the configured endpoint.
    pub async fn bind(config: ProxyConfig) -> anyhow::Result<Self> {
        let store = store::open_store(&config.backend).await?;
        let registry = Arc::new(SharedRegistry::load(config.services_file.clone())?);
        let audit = AuditLogger::initialize(&config.audit)
            .await
            .context("failed to initialize audit log")?;

        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("failed to build upstream client")?;

        let listener = match &config.listener {
            ListenerConfig::Unix { path } => {
                if let Some(parent) = path.parent() {
                    paths::create_private_dir(parent)?;
                }
                // A stale socket from a dead broker would fail the bind.
                let _ = std::fs::remove_file(path);
                let listener = UnixListener::bind(path)
                    .with_context(|| format!("failed to bind {}", path.display()))?;
                paths::set_private_file_mode(path)?;
                tracing::info!(socket = %path.display(), "broker listening on unix socket");
                BoundListener::Unix {
                    listener,
                    path: path.clone(),
                }
            }
            ListenerConfig::Tcp { host, port, tls } => {
                let listener = TcpListener::bind((host.as_str(), *port))
                    .await
                    .with_context(|| format!("failed to bind {host}:{port}"))?;
                let tls = match tls {
                    Some(tls_config) => {
                        let server_config = load_tls_config(tls_config)?;
                        Some(TlsAcceptor::from(Arc::new(server_config)))
                    }
                    None => None,
                };
                tracing::info!(
                    addr = %listener.local_addr()?,
                    tls = tls.is_some(),
                    "broker listening on tcp"
                );
                BoundListener::Tcp { listener, tls }
            }
        };

        Ok(Self {
            state: AppState {
                config: Arc::new(config),
                registry,
                store,
                audit,
                client,
                started_at: Instant::now(),
            },
            listener,
        })
    }

    /// The handshake record for the bound endpoint.
    pub fn connection_info(&self) -> anyhow::Result<ConnectionInfo> {
        let registry = self.state.registry.snapshot();
        let (socket_path, host, port, base_url, protocol) = match &self.listener {
            BoundListener::Unix { path, .. } => (
                Some(path.to_string_lossy().into_owned()),
                None,
                None,
                None,
                "unix".to_owned(),
            ),
            BoundListener::Tcp { listener, tls } => {
                let addr = listener.local_addr()?;
                let scheme = if tls.is_some() { "https" } else { "http" };
                (
                    None,
                    Some(addr.ip().to_string()),
                    Some(addr.port()),
                    Some(format!("{scheme}://{addr}/")),
                    scheme.to_owned(),
                )
            }
        };

        Ok(ConnectionInfo {
            ready: true,
            socket_path,
            host,
            port,
            base_url,
            protocol,
            services: registry.names(),
            backend: self.state.config.backend.name().to_owned(),
            host_map: registry.host_map(),
            version: env!("CARGO_PKG_VERSION").to_owned(),
        })
    }

    /// Serve until `shutdown` fires (or the audit writer dies), then drain
    /// and flush.
    pub async fn serve(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let state = self.state;
        let audit = state.audit.clone();

        let app = Router::new()
            .route("/_health", get(health))
            .route("/_hostmap", get(hostmap))
            .fallback(forward::proxy_handler)
            .layer(TraceLayer::new_for_http())
            .with_state(state);

        // Either the external shutdown signal or an unexpected writer exit
        // stops the listener.
        let effective = CancellationToken::new();
        {
            let external = shutdown.clone();
            let effective = effective.clone();
            let audit = audit.clone();
            tokio::spawn(async move {
                match audit.writer_exited() {
                    Some(writer_exit) => {
                        tokio::select! {
                            () = external.cancelled() => {}
                            () = writer_exit.cancelled() => {
                                if !audit.is_stopping() {
                                    tracing::error!(
                                        "audit writer exited unexpectedly; stopping broker"
                                    );
                                }
                            }
                        }
                    }
                    None => external.cancelled().await,
                }
                effective.cancel();
            });
        }
        let graceful = effective.clone().cancelled_owned();

        let result = match self.listener {
            BoundListener::Unix { listener, path } => {
                let served = axum::serve(listener, app)
                    .with_graceful_shutdown(graceful)
                    .await;
                let _ = std::fs::remove_file(&path);
                served.map_err(Into::into)
            }
            BoundListener::Tcp {
                listener,
                tls: None,
            } => axum::serve(listener, app)
                .with_graceful_shutdown(graceful)
                .await
                .map_err(Into::into),
            BoundListener::Tcp {
                listener,
                tls: Some(acceptor),
            } => serve_tls(listener, acceptor, app, effective.clone()).await,
        };

        tracing::info!("broker stopped accepting; flushing audit log");
        audit.stop().await;
        result
    }
}

/// Check the shared client token (constant-time). No configured token means
/// no enforcement (test/embedded mode).
pub(crate) fn client_authorized(config: &ProxyConfig, headers: &HeaderMap) -> bool {
    let Some(expected) = &config.client_token else {
        return true;
    };

    let presented = headers
        .get(TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .or_else(|| {
            headers
                .get(http::header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
        });

    match presented {
        Some(token) => crypto::constant_time_eq(token.as_bytes(), expected.as_bytes()),
        None => false,
    }
}

/// Map a [`ProxyError`] to its wire shape: JSON `{error, fix?}` for
/// structured causes, plain `Forbidden` for client-auth failures.
pub(crate) fn error_response(err: &ProxyError) -> Response {
    if matches!(err, ProxyError::ClientAuthFailure) {
        return (StatusCode::FORBIDDEN, "Forbidden").into_response();
    }

    let mut body = json!({ "error": err.to_string() });
    if let (Some(fix), Some(obj)) = (err.fix(), body.as_object_mut()) {
        obj.insert("fix".to_owned(), serde_json::Value::String(fix));
    }
    (err.status(), Json(body)).into_response()
}

/// `GET /_health`: liveness without authentication.
async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "uptime": state.started_at.elapsed().as_secs(),
        "services": state.registry.snapshot().names(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// `GET /_hostmap`: the interceptor's host map; client-auth enforced when
/// configured (unlike `/_health`).
async fn hostmap(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if !client_authorized(&state.config, &headers) {
        return (StatusCode::FORBIDDEN, "Forbidden").into_response();
    }
    Json(state.registry.snapshot().host_map()).into_response()
}

fn load_tls_config(tls: &TlsConfig) -> anyhow::Result<rustls::ServerConfig> {
    let cert_file = std::fs::File::open(&tls.cert_path)
        .with_context(|| format!("failed to open certificate {}", tls.cert_path.display()))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<Result<Vec<_>, _>>()
        .context("failed to parse certificate chain")?;

    let key_file = std::fs::File::open(&tls.key_path)
        .with_context(|| format!("failed to open private key {}", tls.key_path.display()))?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .context("failed to parse private key")?
        .ok_or_else(|| anyhow::anyhow!("no private key in {}", tls.key_path.display()))?;

    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("invalid TLS certificate/key pair")?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(config)
}

async fn serve_tls(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    app: Router,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let mut connections = tokio::task::JoinSet::new();

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let acceptor = acceptor.clone();
                let app = app.clone();
                let shutdown = shutdown.clone();
                connections.spawn(async move {
                    let tls_stream = match acceptor.accept(stream).await {
                        Ok(tls_stream) => tls_stream,
                        Err(err) => {
                            tracing::debug!(error = %err, peer = %peer, "TLS handshake failed");
                            return;
                        }
                    };
                    let service = hyper_util::service::TowerToHyperService::new(app);
                    let builder = hyper_util::server::conn::auto::Builder::new(
                        hyper_util::rt::TokioExecutor::new(),
                    );
                    let conn = builder.serve_connection_with_upgrades(
                        hyper_util::rt::TokioIo::new(tls_stream),
                        service,
                    );
                    tokio::pin!(conn);

                    tokio::select! {
                        result = conn.as_mut() => {
                            if let Err(err) = result {
                                tracing::debug!(error = %err, peer = %peer, "connection error");
                            }
                        }
                        () = shutdown.cancelled() => {
                            // Stop taking new requests, finish the one in
                            // flight, then close.
                            conn.as_mut().graceful_shutdown();
                            if let Err(err) = conn.as_mut().await {
                                tracing::debug!(error = %err, peer = %peer, "connection error");
                            }
                        }
                    }
                });
            }
            // Reap finished connection tasks so the set does not grow with
            // the broker's lifetime.
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    // Drain in-flight connections before the caller flushes the audit log,
    // matching the graceful shutdown the axum-served listeners provide.
    while connections.join_next().await.is_some() {}
    Ok(())
}
