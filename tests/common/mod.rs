#![allow(
    clippy::allow_attributes,
    reason = "test files use allow for non-guaranteed lints"
)]
#![allow(clippy::expect_used, reason = "test code")]
#![allow(clippy::unwrap_used, reason = "test code")]
#![allow(dead_code, reason = "not every integration suite uses every helper")]

//! Shared helpers: a capturing mock upstream and an in-process broker.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use aquaman::audit::AuditEntry;
use aquaman::config::{AuditConfig, BackendConfig, ListenerConfig, ProxyConfig};
use aquaman::proxy::{ConnectionInfo, ProxyServer};
use aquaman::store::{CredentialStore, EncryptedFileStore};

pub const STORE_PASSWORD: &str = "test-passphrase";

/// One request as seen by the mock upstream.
#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub headers: http::HeaderMap,
    pub body: Bytes,
}

/// A local upstream that records everything it receives.
pub struct MockUpstream {
    pub addr: SocketAddr,
    pub requests: Arc<Mutex<Vec<CapturedRequest>>>,
    shutdown: CancellationToken,
}

impl MockUpstream {
    pub async fn spawn() -> Self {
        let requests: Arc<Mutex<Vec<CapturedRequest>>> = Arc::new(Mutex::new(Vec::new()));
        let captured = Arc::clone(&requests);

        let app = Router::new().fallback(move |req: http::Request<Body>| {
            let captured = Arc::clone(&captured);
            async move {
                let (parts, body) = req.into_parts();
                let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap_or_default();
                captured.lock().await.push(CapturedRequest {
                    method: parts.method.to_string(),
                    path: parts.uri.path().to_owned(),
                    query: parts.uri.query().map(str::to_owned),
                    headers: parts.headers,
                    body: bytes,
                });

                if parts.uri.path().ends_with("/stream") {
                    // Chunked SSE-style body; the broker must pass it through
                    // without reframing.
                    let chunks: Vec<Result<Bytes, std::io::Error>> = vec![
                        Ok(Bytes::from_static(b"data: one\n\n")),
                        Ok(Bytes::from_static(b"data: two\n\n")),
                        Ok(Bytes::from_static(b"data: [DONE]\n\n")),
                    ];
                    return Response::builder()
                        .status(200)
                        .header("content-type", "text/event-stream")
                        .body(Body::from_stream(futures::stream::iter(chunks)))
                        .unwrap();
                }

                axum::Json(serde_json::json!({"ok": true})).into_response()
            }
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(token.cancelled_owned())
                .await
                .unwrap();
        });

        Self {
            addr,
            requests,
            shutdown,
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub async fn captured(&self) -> Vec<CapturedRequest> {
        self.requests.lock().await.clone()
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}

/// Write a service-definition file pointing every test service at `upstream`.
pub fn write_services_file(dir: &Path, upstream: &str) -> PathBuf {
    let path = dir.join("services.toml");
    let contents = format!(
        r#"
[[services]]
name = "anthropic"
upstream = "{upstream}"
host_patterns = ["api.anthropic.com"]

[services.auth]
mode = "header"
header = "x-api-key"
credential_key = "api_key"

[[services]]
name = "telegram"
upstream = "{upstream}"
host_patterns = ["api.telegram.org"]

[services.auth]
mode = "url_path"
prefix = "bot"
credential_key = "bot_token"

[[services]]
name = "twilio"
upstream = "{upstream}"
host_patterns = ["api.twilio.com"]

[services.auth]
mode = "basic"
username_key = "account_sid"
password_key = "auth_token"

[[services]]
name = "supabase"
upstream = "{upstream}"
host_patterns = ["*.supabase.co"]

[services.auth]
mode = "header_multi"

[[services.auth.pairs]]
header = "apikey"
credential_key = "service_key"

[[services.auth.pairs]]
header = "Authorization"
prefix = "Bearer "
credential_key = "service_key"

[[services]]
name = "vault-only"
upstream = "{upstream}"

[services.auth]
mode = "none"
"#
    );
    std::fs::write(&path, contents).unwrap();
    path
}

/// Seed the encrypted file store the broker will open.
pub async fn seed_store(store_path: &Path) {
    let store = EncryptedFileStore::new(store_path.to_path_buf(), STORE_PASSWORD.to_owned());
    store
        .set("anthropic", "api_key", "sk-ant-TEST", None)
        .await
        .unwrap();
    store
        .set("telegram", "bot_token", "123:ABC", None)
        .await
        .unwrap();
    store
        .set("twilio", "account_sid", "ACx", None)
        .await
        .unwrap();
    store.set("twilio", "auth_token", "ty", None).await.unwrap();
    store
        .set("supabase", "service_key", "sb-secret", None)
        .await
        .unwrap();
}

/// Broker configuration over a TCP loopback listener.
pub fn broker_config(
    dir: &Path,
    services_file: PathBuf,
    client_token: Option<&str>,
) -> ProxyConfig {
    ProxyConfig {
        listener: ListenerConfig::Tcp {
            host: "127.0.0.1".to_owned(),
            port: 0,
            tls: None,
        },
        client_token: client_token.map(str::to_owned),
        backend: BackendConfig::EncryptedFile {
            path: dir.join("credentials.enc"),
            password: STORE_PASSWORD.to_owned(),
        },
        audit: AuditConfig {
            enabled: true,
            dir: dir.join("audit"),
        },
        services_file: Some(services_file),
        allowed_services: None,
        connect_timeout: Duration::from_secs(10),
    }
}

/// An in-process broker under test.
pub struct TestBroker {
    pub info: ConnectionInfo,
    shutdown: CancellationToken,
    handle: JoinHandle<anyhow::Result<()>>,
}

impl TestBroker {
    pub async fn spawn(config: ProxyConfig) -> Self {
        let server = ProxyServer::bind(config).await.unwrap();
        let info = server.connection_info().unwrap();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(server.serve(shutdown.clone()));
        Self {
            info,
            shutdown,
            handle,
        }
    }

    pub fn base_url(&self) -> String {
        self.info.base_url.clone().expect("tcp broker has a base url")
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        let _ = self.handle.await;
    }
}

/// Parse every audit entry the broker wrote so far.
pub fn read_audit_entries(dir: &Path) -> Vec<AuditEntry> {
    let active = dir.join("audit").join("current.jsonl");
    if !active.exists() {
        return Vec::new();
    }
    std::fs::read_to_string(active)
        .unwrap()
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}
