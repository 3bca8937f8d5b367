#![allow(
    clippy::allow_attributes,
    reason = "test files use allow for non-guaranteed lints"
)]
#![allow(clippy::expect_used, reason = "test code")]
#![allow(clippy::unwrap_used, reason = "test code")]

//! End-to-end broker tests against a local capturing upstream.

mod common;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use common::{
    MockUpstream, TestBroker, broker_config, read_audit_entries, seed_store, write_services_file,
};

use aquaman::audit::AuditKind;

struct Harness {
    upstream: MockUpstream,
    broker: TestBroker,
    dir: tempfile::TempDir,
    client: reqwest::Client,
}

async fn harness(client_token: Option<&str>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let upstream = MockUpstream::spawn().await;
    let services_file = write_services_file(dir.path(), &upstream.url());
    seed_store(&dir.path().join("credentials.enc")).await;

    let config = broker_config(dir.path(), services_file, client_token);
    let broker = TestBroker::spawn(config).await;

    Harness {
        upstream,
        broker,
        dir,
        client: reqwest::Client::new(),
    }
}

impl Harness {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.broker.base_url().trim_end_matches('/'), path)
    }

    async fn teardown(self) {
        self.broker.stop().await;
        self.upstream.stop();
    }
}

#[tokio::test]
async fn test_anthropic_header_auth_end_to_end() {
    let h = harness(None).await;

    let response = h
        .client
        .post(h.url("/anthropic/v1/messages"))
        // A stale key from the agent must be replaced, not duplicated.
        .header("x-api-key", "sk-stale-agent-key")
        .json(&serde_json::json!({"model": "t"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let captured = h.upstream.captured().await;
    assert_eq!(captured.len(), 1);
    let seen = &captured[0];
    assert_eq!(seen.method, "POST");
    assert_eq!(seen.path, "/v1/messages");
    let api_keys: Vec<_> = seen.headers.get_all("x-api-key").iter().collect();
    assert_eq!(api_keys.len(), 1, "exactly one injected auth header");
    assert_eq!(api_keys[0], "sk-ant-TEST");
    assert!(
        seen.headers.get("authorization").is_none(),
        "no Authorization header may reach the upstream"
    );
    assert_eq!(seen.body.as_ref(), br#"{"model":"t"}"#);

    // Exactly one credential_access entry, success=true.
    let entries = read_audit_entries(h.dir.path());
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].kind, AuditKind::CredentialAccess);
    assert_eq!(entries[0].data["service"], "anthropic");
    assert_eq!(entries[0].data["operation"], "read");
    assert_eq!(entries[0].data["success"], true);

    h.teardown().await;
}

#[tokio::test]
async fn test_telegram_url_path_auth() {
    let h = harness(None).await;

    let response = h
        .client
        .post(h.url("/telegram/sendMessage"))
        .json(&serde_json::json!({"chat_id": 7}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let captured = h.upstream.captured().await;
    assert_eq!(captured.len(), 1);
    assert_eq!(captured[0].path, "/bot123:ABC/sendMessage");
    assert!(captured[0].headers.get("authorization").is_none());

    h.teardown().await;
}

#[tokio::test]
async fn test_twilio_basic_auth() {
    let h = harness(None).await;

    let response = h
        .client
        .get(h.url("/twilio/2010-04-01/Accounts"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let captured = h.upstream.captured().await;
    let expected = format!("Basic {}", BASE64.encode("ACx:ty"));
    assert_eq!(
        captured[0].headers.get("authorization").unwrap(),
        expected.as_str()
    );

    h.teardown().await;
}

#[tokio::test]
async fn test_header_multi_injects_both_headers() {
    let h = harness(None).await;

    let response = h
        .client
        .get(h.url("/supabase/rest/v1/rows"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let captured = h.upstream.captured().await;
    assert_eq!(captured[0].headers.get("apikey").unwrap(), "sb-secret");
    assert_eq!(
        captured[0].headers.get("authorization").unwrap(),
        "Bearer sb-secret"
    );

    h.teardown().await;
}

#[tokio::test]
async fn test_missing_credential_is_401_with_fix() {
    let h = harness(None).await;

    // "openai" is a builtin service, but the seeded store has no key for it.
    let response = h
        .client
        .post(h.url("/openai/v1/chat/completions"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
    assert_eq!(
        response
            .headers()
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap(),
        "application/json"
    );
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "openai/api_key not found");
    assert_eq!(body["fix"], "Run: aquaman credentials add openai api_key");

    // No upstream connection was opened.
    assert!(h.upstream.captured().await.is_empty());

    // The rejection is audited.
    let entries = read_audit_entries(h.dir.path());
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].data["success"], false);
    assert_eq!(entries[0].data["error"], "credential_not_found");

    h.teardown().await;
}

#[tokio::test]
async fn test_client_auth_rejects_without_token() {
    let h = harness(Some("secret-token-T")).await;

    let response = h
        .client
        .post(h.url("/anthropic/v1/messages"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 403);
    assert_eq!(response.text().await.unwrap(), "Forbidden");

    // Nothing reached the upstream and no successful access was audited.
    assert!(h.upstream.captured().await.is_empty());
    let entries = read_audit_entries(h.dir.path());
    assert!(
        entries
            .iter()
            .all(|e| e.data["success"] != serde_json::Value::Bool(true)),
        "no credential_access entry may be success=true"
    );

    h.teardown().await;
}

#[tokio::test]
async fn test_client_auth_accepts_token_and_strips_it_upstream() {
    let h = harness(Some("secret-token-T")).await;

    let response = h
        .client
        .post(h.url("/anthropic/v1/messages"))
        .header("x-aquaman-token", "secret-token-T")
        .json(&serde_json::json!({"model": "t"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let captured = h.upstream.captured().await;
    assert!(
        captured[0].headers.get("x-aquaman-token").is_none(),
        "the client token must never travel upstream"
    );

    h.teardown().await;
}

#[tokio::test]
async fn test_unknown_and_invalid_service_names_are_404() {
    let h = harness(None).await;

    let response = h.client.get(h.url("/nope/v1")).send().await.unwrap();
    assert_eq!(response.status(), 404);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "No configuration for service: nope");

    for bad in ["/bad.name/x", "/sp%2Face/x", "/..%2f../x"] {
        let response = h.client.get(h.url(bad)).send().await.unwrap();
        assert_eq!(response.status(), 404, "expected 404 for {bad}");
    }

    assert!(h.upstream.captured().await.is_empty());
    h.teardown().await;
}

#[tokio::test]
async fn test_at_rest_only_service_is_400_without_upstream_socket() {
    let h = harness(None).await;

    let response = h
        .client
        .post(h.url("/vault-only/anything"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    assert!(
        h.upstream.captured().await.is_empty(),
        "no upstream socket may be opened for at-rest services"
    );

    let entries = read_audit_entries(h.dir.path());
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].data["success"], false);

    h.teardown().await;
}

#[tokio::test]
async fn test_streaming_response_passes_through() {
    let h = harness(None).await;

    let response = h
        .client
        .get(h.url("/anthropic/v1/stream"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/event-stream"
    );
    let body = response.text().await.unwrap();
    assert_eq!(body, "data: one\n\ndata: two\n\ndata: [DONE]\n\n");

    h.teardown().await;
}

#[tokio::test]
async fn test_body_framing_headers_reach_upstream_unchanged() {
    let h = harness(None).await;

    // Fixed-length body: the inbound Content-Length travels upstream as-is.
    let body = "hello broker";
    let response = h
        .client
        .post(h.url("/anthropic/v1/messages"))
        .body(body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    // Streamed body: the client sends chunked and the upstream must see it.
    let chunks: Vec<Result<bytes::Bytes, std::io::Error>> = vec![
        Ok(bytes::Bytes::from_static(b"part-one")),
        Ok(bytes::Bytes::from_static(b"part-two")),
    ];
    let response = h
        .client
        .post(h.url("/anthropic/v1/messages"))
        .body(reqwest::Body::wrap_stream(futures::stream::iter(chunks)))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let captured = h.upstream.captured().await;
    assert_eq!(captured.len(), 2);

    assert_eq!(
        captured[0]
            .headers
            .get("content-length")
            .map(|v| v.to_str().unwrap()),
        Some(body.len().to_string().as_str()),
        "inbound Content-Length must be preserved as received"
    );
    assert_eq!(captured[0].body.as_ref(), body.as_bytes());

    assert_eq!(
        captured[1]
            .headers
            .get("transfer-encoding")
            .map(|v| v.to_str().unwrap()),
        Some("chunked"),
        "inbound Transfer-Encoding must be preserved as received"
    );
    assert_eq!(captured[1].body.as_ref(), b"part-onepart-two");

    h.teardown().await;
}

#[tokio::test]
async fn test_query_strings_are_preserved() {
    let h = harness(None).await;

    let response = h
        .client
        .get(h.url("/anthropic/v1/models?limit=5&after=m1"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let captured = h.upstream.captured().await;
    assert_eq!(captured[0].path, "/v1/models");
    assert_eq!(captured[0].query.as_deref(), Some("limit=5&after=m1"));

    h.teardown().await;
}

#[tokio::test]
async fn test_health_needs_no_auth_but_hostmap_does() {
    let h = harness(Some("tok")).await;

    let health = h.client.get(h.url("/_health")).send().await.unwrap();
    assert_eq!(health.status(), 200);
    let body: serde_json::Value = health.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert!(body["services"].as_array().unwrap().iter().any(|s| s == "anthropic"));

    let denied = h.client.get(h.url("/_hostmap")).send().await.unwrap();
    assert_eq!(denied.status(), 403);

    let allowed = h
        .client
        .get(h.url("/_hostmap"))
        .header("authorization", "Bearer tok")
        .send()
        .await
        .unwrap();
    assert_eq!(allowed.status(), 200);
    let map: serde_json::Value = allowed.json().await.unwrap();
    assert_eq!(map["api.anthropic.com"], "anthropic");
    assert_eq!(map["*.supabase.co"], "supabase");

    h.teardown().await;
}

#[tokio::test]
async fn test_upstream_down_is_502_and_audited() {
    let dir = tempfile::tempdir().unwrap();
    // Point the services file at a port nothing listens on.
    let services_file = write_services_file(dir.path(), "http://127.0.0.1:9");
    seed_store(&dir.path().join("credentials.enc")).await;
    let broker = TestBroker::spawn(broker_config(dir.path(), services_file, None)).await;
    let base = broker.info.base_url.clone().unwrap();

    let response = reqwest::Client::new()
        .post(format!("{}anthropic/v1/messages", base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 502);

    let entries = read_audit_entries(dir.path());
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].data["success"], false);
    assert_eq!(entries[0].data["error"], "upstream_connect");

    broker.stop().await;
}

#[tokio::test]
async fn test_connection_info_contract() {
    let h = harness(None).await;

    let info = &h.broker.info;
    assert!(info.ready);
    assert_eq!(info.protocol, "http");
    assert!(info.port.is_some());
    assert_eq!(info.backend, "encrypted-file");
    assert!(info.services.iter().any(|s| s == "telegram"));
    assert_eq!(
        info.host_map.get("api.telegram.org").map(String::as_str),
        Some("telegram")
    );

    // The handshake line round-trips.
    let line = serde_json::to_string(info).unwrap();
    let parsed: aquaman::proxy::ConnectionInfo = serde_json::from_str(&line).unwrap();
    assert!(parsed.ready);

    h.teardown().await;
}

#[tokio::test]
async fn test_service_allowlist_hides_other_services() {
    let dir = tempfile::tempdir().unwrap();
    let upstream = common::MockUpstream::spawn().await;
    let services_file = write_services_file(dir.path(), &upstream.url());
    seed_store(&dir.path().join("credentials.enc")).await;

    let mut config = broker_config(dir.path(), services_file, None);
    config.allowed_services = Some(["telegram".to_owned()].into_iter().collect());
    let broker = TestBroker::spawn(config).await;
    let base = broker.info.base_url.clone().unwrap();
    let client = reqwest::Client::new();

    // Registered and seeded, but not allowlisted.
    let response = client
        .post(format!("{base}anthropic/v1/messages"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
    assert!(upstream.captured().await.is_empty());

    // Allowlisted service still works.
    let response = client
        .post(format!("{base}telegram/sendMessage"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(upstream.captured().await[0].path, "/bot123:ABC/sendMessage");

    broker.stop().await;
    upstream.stop();
}

#[tokio::test]
async fn test_audit_chain_verifies_after_traffic() {
    let h = harness(None).await;

    for _ in 0..3 {
        let _ = h
            .client
            .post(h.url("/anthropic/v1/messages"))
            .send()
            .await
            .unwrap();
    }
    let _ = h.client.get(h.url("/nope/x")).send().await.unwrap();

    let report = aquaman::audit::verify_directory(&h.dir.path().join("audit")).unwrap();
    assert!(report.valid, "errors: {:?}", report.errors);
    assert_eq!(report.entry_count, 3);

    h.teardown().await;
}
