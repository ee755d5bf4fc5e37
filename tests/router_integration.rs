//! End-to-end scenarios exercised against the full `axum::Router`
//! (no real socket, via `tower::ServiceExt::oneshot`) plus, for the
//! forwarder scenarios, a real loopback socket standing in for the
//! wireless adapter.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use relaycore::auth::{DeviceCredentialStore, DEVICE_FP_HEADER, DEVICE_TOKEN_HEADER};
use relaycore::config::Config;
use relaycore::forwarder::{self, ForwarderConfig};
use relaycore::ids::IdsEngine;
use relaycore::metrics::Metrics;
use relaycore::queue::QueueStore;
use relaycore::ratelimit::SlidingWindowLimiter;
use relaycore::state::AppState;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

fn test_state() -> (AppState, String, String, tempfile::TempDir) {
    let cfg = Config::default();
    let devices = DeviceCredentialStore::new();
    let token = devices.provision("dev-1");
    let tmp = tempfile::tempdir().unwrap();
    let state = AppState {
        queue: Arc::new(QueueStore::open_in_memory(cfg.max_queue_size).unwrap()),
        ids: Arc::new(IdsEngine::new(
            cfg.ids.clone(),
            tmp.path().join("susp.log").to_string_lossy().to_string(),
        )),
        auth_limiter: Arc::new(SlidingWindowLimiter::new(
            cfg.auth_rate_limit.window_seconds,
            cfg.auth_rate_limit.max_attempts_per_window,
        )),
        devices: Arc::new(devices),
        metrics: Arc::new(Metrics::new()),
        config: Arc::new(cfg),
    };
    (state, "dev-1".to_string(), token, tmp)
}

fn envelope_body(msg_id: &str, ttl: i64, sender_fp: &str) -> String {
    format!(
        r#"{{"version":"1.0","header":{{"sender_fp":"{sender_fp}","recipient_fp":"peer-2","msg_id":"{msg_id}","nonce":"MDEyMzQ1Njc4OWFi","ttl":{ttl},"ts":{ts}}},"ciphertext":"aGVsbG8="}}"#,
        ts = chrono::Utc::now().timestamp()
    )
}

async fn post_json(
    app: Router,
    path: &str,
    fp: &str,
    token: &str,
    body: String,
) -> (StatusCode, Value) {
    let req = Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/json")
        .header(DEVICE_FP_HEADER, fp)
        .header(DEVICE_TOKEN_HEADER, token)
        .body(Body::from(body))
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    let v: Value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, v)
}

/// S1 — happy local send, forwarder drains it to a stub adapter, the
/// row becomes delivered and disappears from `outgoing_chunks`.
#[tokio::test(flavor = "multi_thread")]
async fn s1_happy_local_send_then_delivered() {
    let (state, fp, token, _tmp) = test_state();
    let queue = state.queue.clone();
    let metrics = state.metrics.clone();
    let app = relaycore::api::router(state);

    let msg_id = uuid::Uuid::new_v4().to_string();
    let (status, body) = post_json(
        app.clone(),
        "/v1/router/enqueue",
        &fp,
        &token,
        envelope_body(&msg_id, 5, "peer-1"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["queued"], true);
    assert_eq!(body["msg_id"], msg_id);

    // Stub adapter: always returns 200 {"queued": true}.
    let adapter = Router::new().route(
        "/v1/ble/send_chunk",
        post(|| async { Json(json!({"queued": true})) }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, adapter).await.unwrap();
    });

    let client = reqwest::Client::new();
    let cfg = ForwarderConfig {
        interval: Duration::from_millis(50),
        max_retries: 5,
        max_ttl: 8,
        base_backoff_ms: 10,
        ble_send_url: format!("http://{addr}/v1/ble/send_chunk"),
        send_timeout: Duration::from_secs(2),
    };
    forwarder::run_once(&queue, &client, &cfg, &metrics).await;

    let (status, body) = {
        let req = Request::builder()
            .method("GET")
            .uri("/v1/router/outgoing_chunks")
            .header(DEVICE_FP_HEADER, &fp)
            .header(DEVICE_TOKEN_HEADER, &token)
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice::<Value>(&bytes).unwrap())
    };
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["items"].as_array().unwrap().len(), 0);
}

/// S2 — TTL expired on ingress returns 410 and logs a suspicious event.
#[tokio::test]
async fn s2_ttl_expired_on_ingress() {
    let (state, fp, token, _tmp) = test_state();
    let ids = state.ids.clone();
    let app = relaycore::api::router(state);

    let msg_id = uuid::Uuid::new_v4().to_string();
    let chunk: Value = serde_json::from_str(&envelope_body(&msg_id, 0, "peer-1")).unwrap();
    let body = json!({ "chunk": chunk }).to_string();

    let (status, _) = post_json(app, "/v1/router/on_chunk_received", &fp, &token, body).await;
    assert_eq!(status, StatusCode::GONE);

    let events = ids.tail_log(10).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["event"], "TTL_EXPIRED");
}

/// S3 — duplicate ingress: first call is final/accepted, second is a
/// drop, both with HTTP 200.
#[tokio::test]
async fn s3_duplicate_ingress_is_dropped_not_errored() {
    let (state, fp, token, _tmp) = test_state();
    let app = relaycore::api::router(state);

    let msg_id = uuid::Uuid::new_v4().to_string();
    let chunk: Value = serde_json::from_str(&envelope_body(&msg_id, 4, "peer-1")).unwrap();
    let body = json!({ "chunk": chunk }).to_string();

    let (status1, body1) = post_json(
        app.clone(),
        "/v1/router/on_chunk_received",
        &fp,
        &token,
        body.clone(),
    )
    .await;
    assert_eq!(status1, StatusCode::OK);
    assert_eq!(body1["accepted"], true);
    assert_eq!(body1["action"], "final");

    let (status2, body2) =
        post_json(app, "/v1/router/on_chunk_received", &fp, &token, body).await;
    assert_eq!(status2, StatusCode::OK);
    assert_eq!(body2["accepted"], false);
    assert_eq!(body2["action"], "drop");
}

/// S4 — a storm of ingress calls from one sender_fp: only the first
/// MAX_MSGS_PER_WINDOW are accepted, the remainder are dropped.
#[tokio::test]
async fn s4_rate_limit_storm_caps_acceptance() {
    let (state, fp, token, _tmp) = test_state();
    let cap = state.config.ids.max_msgs_per_window as usize;
    let app = relaycore::api::router(state);

    let mut accepted = 0usize;
    let mut dropped = 0usize;
    for _ in 0..(cap + 20) {
        let msg_id = uuid::Uuid::new_v4().to_string();
        let chunk: Value = serde_json::from_str(&envelope_body(&msg_id, 4, "storm-peer")).unwrap();
        let body = json!({ "chunk": chunk }).to_string();
        let (status, resp) = post_json(
            app.clone(),
            "/v1/router/on_chunk_received",
            &fp,
            &token,
            body,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        if resp["accepted"] == true {
            accepted += 1;
        } else {
            dropped += 1;
        }
    }
    assert_eq!(accepted, cap);
    assert_eq!(dropped, 20);
}

/// S5 — an adapter that always fails drives retries up to MAX_RETRIES,
/// after which the row is dropped and disappears from outgoing_chunks.
#[tokio::test(flavor = "multi_thread")]
async fn s5_retry_backoff_to_max_retries() {
    let (state, fp, token, _tmp) = test_state();
    let queue = state.queue.clone();
    let metrics = state.metrics.clone();
    let max_retries = state.config.max_retries;
    let app = relaycore::api::router(state);

    let msg_id = uuid::Uuid::new_v4().to_string();
    let (status, _) = post_json(
        app,
        "/v1/router/enqueue",
        &fp,
        &token,
        envelope_body(&msg_id, 5, "peer-1"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let failures = Arc::new(AtomicUsize::new(0));
    let failures_clone = failures.clone();
    let adapter = Router::new().route(
        "/v1/ble/send_chunk",
        post(move || {
            failures_clone.fetch_add(1, Ordering::SeqCst);
            async { StatusCode::INTERNAL_SERVER_ERROR }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, adapter).await.unwrap();
    });

    let client = reqwest::Client::new();
    let cfg = ForwarderConfig {
        interval: Duration::from_millis(10),
        max_retries,
        max_ttl: 8,
        base_backoff_ms: 1, // negligible, so the backoff gate never blocks this test
        ble_send_url: format!("http://{addr}/v1/ble/send_chunk"),
        send_timeout: Duration::from_secs(2),
    };

    for _ in 0..(max_retries + 1) {
        forwarder::run_once(&queue, &client, &cfg, &metrics).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert!(queue.get_outgoing().unwrap().is_empty());
    assert!(failures.load(Ordering::SeqCst) as i64 >= max_retries);
}

/// S6 — peer blocking after the suspicious-event threshold, with
/// auto-unblock once `block_peer_ttl_seconds` has elapsed.
#[tokio::test]
async fn s6_peer_blocking_and_auto_unblock() {
    use relaycore::config::IdsConfig;

    let tmp = tempfile::tempdir().unwrap();
    let ids = IdsEngine::new(
        IdsConfig {
            window_seconds: 5,
            max_msgs_per_window: 100,
            duplicate_suppression_ttl: 600,
            block_peer_after: 3,
            block_peer_ttl_seconds: 10,
        },
        tmp.path().join("susp.log").to_string_lossy().to_string(),
    );

    ids.log_suspicious("RATE_LIMIT", "peer-x", "m-1", "x").await;
    ids.log_suspicious("RATE_LIMIT", "peer-x", "m-2", "x").await;
    ids.log_suspicious("RATE_LIMIT", "peer-x", "m-3", "x").await;

    assert!(ids.is_rate_limited_at("peer-x", 0));
    assert!(!ids.is_rate_limited_at("peer-x", 20));
}
