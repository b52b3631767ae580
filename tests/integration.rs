//! Integration tests for mail-ingest.

use mail_ingest::{
    start_server, Backend, EmailRecord, ListFilter, MemoryBackend, MemoryStore, Phase, Pool,
    PoolConfig, RunningServer, ServerOptions, ShutdownOutcome, StorageError,
};
use reqwest::{Client, Response, StatusCode};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

const TOKEN: &str = "s3cret-token";

const DKIM_MESSAGE: &str = "DKIM-Signature: v=1; a=rsa-sha256; d=a.com; s=sel;\r\n\
\tbh=abc=; b=xyz\r\n\
DKIM-Signature: v=1; a=rsa-sha256; d=b.com; s=sel; bh=def=; b=uvw\r\n\
From: Alice <alice@a.com>\r\n\
To: bob@example.org\r\n\
Subject: Signed\r\n\
\x20twice\r\n\
Return-Path: <bounce@a.com>\r\n\
\r\n\
Body text\r\n";

fn options() -> ServerOptions {
    ServerOptions {
        listen: SocketAddr::from(([127, 0, 0, 1], 0)),
        auth_token: TOKEN.to_string(),
        rate_per_minute: 0,
        ..ServerOptions::default()
    }
}

/// Memory backend that takes `delay` per store.
struct SlowBackend {
    inner: MemoryBackend,
    delay: Duration,
}

impl Backend for SlowBackend {
    fn store(&mut self, record: &EmailRecord) -> Result<String, StorageError> {
        std::thread::sleep(self.delay);
        self.inner.store(record)
    }

    fn retrieve(&mut self, location: &str) -> Result<EmailRecord, StorageError> {
        self.inner.retrieve(location)
    }

    fn list(&mut self, filter: ListFilter) -> Result<Vec<String>, StorageError> {
        self.inner.list(filter)
    }

    fn delete(&mut self, location: &str) -> Result<(), StorageError> {
        self.inner.delete(location)
    }
}

struct PanicBackend;

impl Backend for PanicBackend {
    fn store(&mut self, _record: &EmailRecord) -> Result<String, StorageError> {
        panic!("backend exploded");
    }

    fn retrieve(&mut self, location: &str) -> Result<EmailRecord, StorageError> {
        Err(StorageError::NotFound(location.to_string()))
    }

    fn list(&mut self, _filter: ListFilter) -> Result<Vec<String>, StorageError> {
        Ok(Vec::new())
    }

    fn delete(&mut self, location: &str) -> Result<(), StorageError> {
        Err(StorageError::NotFound(location.to_string()))
    }
}

async fn start_memory(opts: ServerOptions) -> (RunningServer, MemoryStore, String) {
    let store = MemoryStore::new(100);
    let factory_store = store.clone();
    let pool = Pool::new(PoolConfig::default(), move || Ok(factory_store.backend()));
    let server = start_server(opts, pool).await.unwrap();
    let base = format!("http://{}", server.addr);
    (server, store, base)
}

async fn start_slow(
    opts: ServerOptions,
    config: PoolConfig,
    delay: Duration,
) -> (RunningServer, MemoryStore, String) {
    let store = MemoryStore::new(100);
    let factory_store = store.clone();
    let pool = Pool::new(config, move || {
        Ok(SlowBackend {
            inner: factory_store.backend(),
            delay,
        })
    });
    let server = start_server(opts, pool).await.unwrap();
    let base = format!("http://{}", server.addr);
    (server, store, base)
}

fn simple_payload() -> Value {
    json!({
        "sender": "a@x.com",
        "recipient": "b@y.com",
        "subject": "S",
        "body": "hi",
    })
}

async fn submit_json(client: &Client, base: &str, payload: &Value) -> Response {
    client
        .post(format!("{base}/mail/inbound"))
        .bearer_auth(TOKEN)
        .json(payload)
        .send()
        .await
        .unwrap()
}

async fn submit_raw(client: &Client, base: &str, raw: &str, headers: &[(&str, &str)]) -> Response {
    let mut req = client
        .post(format!("{base}/email"))
        .bearer_auth(TOKEN)
        .header("content-type", "message/rfc822")
        .body(raw.to_string());
    for (name, value) in headers {
        req = req.header(*name, *value);
    }
    req.send().await.unwrap()
}

fn stored(store: &MemoryStore, location: &str) -> EmailRecord {
    store.backend().retrieve(location).unwrap()
}

#[tokio::test]
async fn test_accepts_json_submission_and_stores_it() {
    let (server, store, base) = start_memory(options()).await;
    let client = Client::new();

    let resp = submit_json(&client, &base, &simple_payload()).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let request_id = resp
        .headers()
        .get("x-request-id")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    let body: Value = resp.json().await.unwrap();

    assert_eq!(body["status"], "success");
    let message_id = body["message_id"].as_str().unwrap();
    assert!(!message_id.is_empty());
    assert_eq!(message_id, request_id);
    assert!(body["timestamp"].as_str().is_some());

    let record = stored(&store, body["stored_at"].as_str().unwrap());
    assert_eq!(record.sender, "a@x.com");
    assert_eq!(record.recipient, "b@y.com");
    assert_eq!(record.subject.as_deref(), Some("S"));
    assert_eq!(record.body.as_deref(), Some("hi"));

    server.shutdown().await;
}

#[tokio::test]
async fn test_request_ids_are_unique_and_ignore_caller_ids() {
    let (server, _store, base) = start_memory(options()).await;
    let client = Client::new();

    let mut ids = Vec::new();
    for _ in 0..3 {
        let resp = client
            .post(format!("{base}/mail/inbound"))
            .bearer_auth(TOKEN)
            .header("x-request-id", "caller-chosen")
            .json(&simple_payload())
            .send()
            .await
            .unwrap();
        let body: Value = resp.json().await.unwrap();
        ids.push(body["message_id"].as_str().unwrap().to_string());
    }
    assert!(ids.iter().all(|id| id != "caller-chosen"));
    let unique: HashSet<_> = ids.iter().collect();
    assert_eq!(unique.len(), 3);

    server.shutdown().await;
}

#[tokio::test]
async fn test_rejects_missing_or_wrong_token() {
    let (server, store, base) = start_memory(options()).await;
    let client = Client::new();

    let resp = client
        .post(format!("{base}/mail/inbound"))
        .json(&simple_payload())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "unauthorized");

    let resp = client
        .post(format!("{base}/email"))
        .bearer_auth("not-the-token")
        .json(&simple_payload())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = client
        .post(format!("{base}/email"))
        .header("authorization", format!("Basic {TOKEN}"))
        .json(&simple_payload())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    assert!(store.is_empty());
    server.shutdown().await;
}

#[tokio::test]
async fn test_wrong_method_on_submission_route() {
    let (server, _store, base) = start_memory(options()).await;
    let client = Client::new();

    let resp = client
        .get(format!("{base}/mail/inbound"))
        .bearer_auth(TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "method_not_allowed");

    // Authentication is checked first
    let resp = client
        .put(format!("{base}/email"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    server.shutdown().await;
}

#[tokio::test]
async fn test_returns_404_for_unknown_paths() {
    let (server, _store, base) = start_memory(options()).await;
    let resp = Client::new()
        .get(format!("{base}/nope"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    server.shutdown().await;
}

#[tokio::test]
async fn test_rate_limit_denies_past_burst() {
    let opts = ServerOptions {
        rate_per_minute: 1,
        burst: 3,
        ..options()
    };
    let (server, store, base) = start_memory(opts).await;
    let client = Client::new();

    for _ in 0..3 {
        let resp = submit_json(&client, &base, &simple_payload()).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    let resp = submit_json(&client, &base, &simple_payload()).await;
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = resp
        .headers()
        .get("retry-after")
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(retry_after >= 1);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "rate_limited");
    assert_eq!(store.len(), 3);

    // Status endpoints are not limited
    let resp = client.get(format!("{base}/health")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    server.shutdown().await;
}

#[tokio::test]
async fn test_raw_message_keeps_dkim_signature_order() {
    let (server, store, base) = start_memory(options()).await;
    let client = Client::new();

    let resp = submit_raw(&client, &base, DKIM_MESSAGE, &[]).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();

    let record = stored(&store, body["stored_at"].as_str().unwrap());
    assert_eq!(record.sender, "alice@a.com");
    assert_eq!(record.recipient, "bob@example.org");
    assert_eq!(record.subject.as_deref(), Some("Signed twice"));
    let dkim = &record.authentication.dkim;
    assert_eq!(dkim.signed_by, vec!["a.com", "b.com"]);
    assert_eq!(dkim.signatures.len(), 2);
    assert_eq!(dkim.from_domain.as_deref(), Some("a.com"));
    assert_eq!(
        record.authentication.dmarc.return_path.as_deref(),
        Some("<bounce@a.com>")
    );

    server.shutdown().await;
}

#[tokio::test]
async fn test_sniffs_raw_message_without_content_type() {
    let (server, store, base) = start_memory(options()).await;
    let resp = Client::new()
        .post(format!("{base}/mail/inbound"))
        .bearer_auth(TOKEN)
        .body(DKIM_MESSAGE)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    let record = stored(&store, body["stored_at"].as_str().unwrap());
    assert_eq!(record.sender, "alice@a.com");
    server.shutdown().await;
}

#[tokio::test]
async fn test_sidecar_headers_override_message_headers() {
    let (server, store, base) = start_memory(options()).await;
    let client = Client::new();

    let resp = submit_raw(
        &client,
        &base,
        DKIM_MESSAGE,
        &[
            ("X-Original-Sender", "envelope@relay.example"),
            ("X-Original-Client-Address", "192.0.2.10"),
            ("X-Original-Helo", "mx.relay.example"),
            ("X-Original-Queue-Id", "Q123"),
        ],
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();

    let record = stored(&store, body["stored_at"].as_str().unwrap());
    assert_eq!(record.sender, "envelope@relay.example");
    assert_eq!(record.recipient, "bob@example.org");
    assert_eq!(record.connection_info.client_address.as_deref(), Some("192.0.2.10"));
    assert_eq!(record.authentication.spf.client_ip.as_deref(), Some("192.0.2.10"));
    assert_eq!(
        record.authentication.spf.helo_domain.as_deref(),
        Some("mx.relay.example")
    );
    assert_eq!(
        record.sidecar.get("x-original-queue-id").map(String::as_str),
        Some("Q123")
    );

    // Same override through the JSON + raw path
    let resp = client
        .post(format!("{base}/mail/inbound"))
        .bearer_auth(TOKEN)
        .header("X-Original-Sender", "envelope@relay.example")
        .json(&json!({ "raw": DKIM_MESSAGE }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    let record = stored(&store, body["stored_at"].as_str().unwrap());
    assert_eq!(record.sender, "envelope@relay.example");
    assert_eq!(record.authentication.dkim.signed_by, vec!["a.com", "b.com"]);

    server.shutdown().await;
}

#[tokio::test]
async fn test_malformed_json_is_bad_request() {
    let (server, store, base) = start_memory(options()).await;
    let client = Client::new();

    let resp = client
        .post(format!("{base}/mail/inbound"))
        .bearer_auth(TOKEN)
        .header("content-type", "application/json")
        .body(r#"{"sender": "a@x.com", "#)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "bad_request");

    // Sniffed JSON is never downgraded to a raw parse
    let resp = client
        .post(format!("{base}/mail/inbound"))
        .bearer_auth(TOKEN)
        .body("  {not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = submit_raw(&client, &base, "   \r\n", &[]).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    assert!(store.is_empty());
    server.shutdown().await;
}

#[tokio::test]
async fn test_validation_errors_list_fields() {
    let (server, store, base) = start_memory(options()).await;
    let client = Client::new();

    let resp = submit_json(
        &client,
        &base,
        &json!({ "sender": "", "recipient": "b@y.com\u{7}" }),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "validation_error");
    let fields: Vec<&str> = body["details"]
        .as_array()
        .unwrap()
        .iter()
        .map(|d| d["field"].as_str().unwrap())
        .collect();
    assert_eq!(fields, vec!["sender", "recipient"]);

    assert!(store.is_empty());
    server.shutdown().await;
}

#[tokio::test]
async fn test_health_and_metrics() {
    let (server, _store, base) = start_memory(options()).await;
    let client = Client::new();

    let health: Value = client
        .get(format!("{base}/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["version"], env!("CARGO_PKG_VERSION"));
    assert!(health["uptime"].is_string());

    let metrics: Value = client
        .get(format!("{base}/metrics"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(metrics["total_emails"], 0);
    assert!(metrics["last_received"].is_null());

    let payload = simple_payload();
    let bytes = serde_json::to_vec(&payload).unwrap().len();
    submit_json(&client, &base, &payload).await;

    let metrics: Value = client
        .get(format!("{base}/metrics"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(metrics["total_emails"], 1);
    assert_eq!(metrics["total_bytes"], bytes);
    assert!(metrics["last_received"].is_string());
    assert!(metrics["start_time"].is_string());
    assert!(metrics["uptime_seconds"].is_u64());
    assert_eq!(metrics["active_requests"], 0);
    assert_eq!(metrics["shutting_down"], false);

    let text = client
        .get(format!("{base}/metrics/prometheus"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(text.contains("mail_ingest_requests_total{outcome=\"success\"}"));
    assert!(text.contains("mail_ingest_request_duration_seconds"));

    server.shutdown().await;
}

#[tokio::test]
async fn test_chunked_body_size_is_recorded() {
    let (server, _store, base) = start_memory(options()).await;
    let client = Client::new();

    let payload = serde_json::to_vec(&simple_payload()).unwrap();
    let chunks = vec![Ok::<_, std::io::Error>(payload)];
    let resp = client
        .post(format!("{base}/mail/inbound"))
        .bearer_auth(TOKEN)
        .header("content-type", "application/json")
        .body(reqwest::Body::wrap_stream(futures_util::stream::iter(chunks)))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let text = client
        .get(format!("{base}/metrics/prometheus"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(text.contains("mail_ingest_request_body_bytes_count 1"));

    server.shutdown().await;
}

#[tokio::test]
async fn test_drain_finishes_admitted_request_and_refuses_new_ones() {
    let opts = ServerOptions {
        shutdown_timeout: Duration::from_secs(10),
        drain_report_interval: Duration::from_millis(50),
        ..options()
    };
    let (server, store, base) =
        start_slow(opts, PoolConfig::default(), Duration::from_millis(500)).await;
    let lifecycle = server.lifecycle();
    let client = Client::new();

    let first = tokio::spawn({
        let client = client.clone();
        let base = base.clone();
        async move { submit_json(&client, &base, &simple_payload()).await.status() }
    });
    for _ in 0..200 {
        if lifecycle.in_flight() == 1 {
            break;
        }
        sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(lifecycle.in_flight(), 1);

    let shutdown = tokio::spawn(server.shutdown());
    while !lifecycle.is_draining() {
        sleep(Duration::from_millis(5)).await;
    }

    let resp = submit_json(&client, &base, &simple_payload()).await;
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "unavailable");

    let metrics: Value = client
        .get(format!("{base}/metrics"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(metrics["shutting_down"], true);

    assert_eq!(first.await.unwrap(), StatusCode::OK);
    assert_eq!(shutdown.await.unwrap(), ShutdownOutcome::Clean);
    assert_eq!(lifecycle.phase(), Phase::Stopped);
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn test_forced_shutdown_reports_stragglers() {
    let opts = ServerOptions {
        shutdown_timeout: Duration::from_millis(100),
        ..options()
    };
    let (server, _store, base) =
        start_slow(opts, PoolConfig::default(), Duration::from_secs(1)).await;
    let lifecycle = server.lifecycle();
    let metrics = server.metrics();

    let straggler = tokio::spawn(async move {
        Client::new()
            .post(format!("{base}/mail/inbound"))
            .bearer_auth(TOKEN)
            .json(&simple_payload())
            .send()
            .await
            .ok()
            .map(|resp| resp.status())
    });
    for _ in 0..200 {
        if lifecycle.in_flight() == 1 {
            break;
        }
        sleep(Duration::from_millis(5)).await;
    }

    assert_eq!(
        server.shutdown().await,
        ShutdownOutcome::Forced { remaining: 1 }
    );
    assert_eq!(lifecycle.phase(), Phase::Stopped);

    // The abandoned request must not be reported as accepted
    let status = straggler.await.unwrap();
    assert_ne!(status, Some(StatusCode::OK));
    assert_eq!(lifecycle.in_flight(), 0);
    assert_eq!(metrics.snapshot().total_emails, 0);
}

#[tokio::test]
async fn test_slow_request_times_out() {
    let opts = ServerOptions {
        request_timeout: Duration::from_millis(100),
        ..options()
    };
    let (server, _store, base) =
        start_slow(opts, PoolConfig::default(), Duration::from_millis(500)).await;
    let lifecycle = server.lifecycle();

    let resp = submit_json(&Client::new(), &base, &simple_payload()).await;
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "timeout");
    assert_eq!(lifecycle.in_flight(), 0);

    server.shutdown().await;
}

#[tokio::test]
async fn test_pool_exhaustion_is_storage_error() {
    let config = PoolConfig {
        max_size: 1,
        max_idle: 1,
        acquire_timeout: Duration::from_millis(50),
    };
    let (server, _store, base) = start_slow(options(), config, Duration::from_millis(400)).await;
    let client = Client::new();

    let payload_a = simple_payload();
    let payload_b = simple_payload();
    let (a, b) = tokio::join!(
        submit_json(&client, &base, &payload_a),
        submit_json(&client, &base, &payload_b),
    );
    let mut statuses = vec![a.status(), b.status()];
    statuses.sort();
    assert_eq!(
        statuses,
        vec![StatusCode::OK, StatusCode::INTERNAL_SERVER_ERROR]
    );
    let failed = if a.status() == StatusCode::OK { b } else { a };
    let body: Value = failed.json().await.unwrap();
    assert_eq!(body["error"], "storage_error");
    assert!(!body["message"].as_str().unwrap().contains("timed out"));

    server.shutdown().await;
}

#[tokio::test]
async fn test_backend_panic_is_contained() {
    let pool = Pool::new(PoolConfig::default(), || Ok(PanicBackend));
    let server = start_server(options(), pool).await.unwrap();
    let base = format!("http://{}", server.addr);
    let client = Client::new();

    let resp = submit_json(&client, &base, &simple_payload()).await;
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "internal_error");
    assert_eq!(server.lifecycle().in_flight(), 0);

    let resp = client.get(format!("{base}/health")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    server.shutdown().await;
}

#[tokio::test]
async fn test_factory_panic_is_contained_and_pool_recovers() {
    let store = MemoryStore::new(10);
    let factory_store = store.clone();
    let exploded = Arc::new(AtomicBool::new(false));
    let config = PoolConfig {
        max_size: 1,
        max_idle: 0,
        acquire_timeout: Duration::from_millis(500),
    };
    let pool = Pool::new(config, move || {
        if !exploded.swap(true, Ordering::SeqCst) {
            panic!("factory exploded");
        }
        Ok(factory_store.backend())
    });
    let server = start_server(options(), pool).await.unwrap();
    let base = format!("http://{}", server.addr);
    let client = Client::new();

    let resp = submit_json(&client, &base, &simple_payload()).await;
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "internal_error");
    assert_eq!(server.lifecycle().in_flight(), 0);

    // The single slot was released, so the next submission gets a handle
    let resp = submit_json(&client, &base, &simple_payload()).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(store.len(), 1);

    server.shutdown().await;
}

#[tokio::test]
async fn test_rejects_empty_auth_token() {
    let pool = Pool::new(PoolConfig::default(), || Ok(MemoryStore::new(1).backend()));
    let opts = ServerOptions {
        auth_token: String::new(),
        ..options()
    };
    assert!(start_server(opts, pool).await.is_err());
}
