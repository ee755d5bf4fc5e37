//! Ingress API — the HTTP surface: enqueue, on_chunk_received,
//! mark_delivered, outgoing_chunks, and three debug-gated admin
//! endpoints (stats, queue_debug, ids_log_tail).

use crate::auth::{DEVICE_FP_HEADER, DEVICE_TOKEN_HEADER};
use crate::envelope::{Envelope, Freshness};
use crate::errors::ApiError;
use crate::metrics::Metrics;
use crate::queue::EnqueueOutcome;
use crate::state::AppState;
use axum::{
    extract::{ConnectInfo, Query, State},
    http::HeaderMap,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/router/enqueue", post(enqueue))
        .route("/v1/router/on_chunk_received", post(on_chunk_received))
        .route("/v1/router/mark_delivered", post(mark_delivered))
        .route("/v1/router/outgoing_chunks", get(outgoing_chunks))
        .route("/v1/router/stats", get(stats))
        .route("/v1/router/queue_debug", get(queue_debug))
        .route("/v1/router/ids_log_tail", get(ids_log_tail))
        .with_state(state)
}

/// Device authentication + pre-auth rate limiting.
/// Returns the authenticated device fingerprint.
async fn require_device_auth(
    state: &AppState,
    headers: &HeaderMap,
    remote_ip: std::net::IpAddr,
) -> Result<String, ApiError> {
    let auth_key = format!("auth:{remote_ip}");
    if !state.auth_limiter.check_now(&auth_key) {
        Metrics::inc(&state.metrics.auth_rejected);
        return Err(ApiError::AuthRateLimited);
    }

    let device_fp = headers
        .get(DEVICE_FP_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::Unauthorized)?;
    let token = headers
        .get(DEVICE_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::Unauthorized)?;

    if !state.devices.authenticate(device_fp, token) {
        Metrics::inc(&state.metrics.auth_rejected);
        return Err(ApiError::Unauthorized);
    }
    Ok(device_fp.to_string())
}

fn client_ip(headers: &HeaderMap, connect_info: Option<SocketAddr>) -> std::net::IpAddr {
    // Trust a forwarded header only if the adapter sits behind a known
    // proxy; otherwise fall back to the socket peer address.
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse().ok())
        .or_else(|| connect_info.map(|a| a.ip()))
        .unwrap_or(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED))
}

fn require_debug(state: &AppState) -> Result<(), ApiError> {
    if state.config.debug_mode {
        Ok(())
    } else {
        Err(ApiError::NotFound)
    }
}

// ---------------------------------------------------------------------------
// POST /v1/router/enqueue
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct EnqueueResponse {
    queued: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    msg_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'static str>,
}

async fn enqueue(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<impl IntoResponse, ApiError> {
    require_device_auth(&state, &headers, client_ip(&headers, connect_info.map(|ci| ci.0))).await?;

    let mut envelope = Envelope::parse(&body)?;
    let cfg = &state.config;

    let ttl = envelope.resolve_and_check_ttl(cfg.ttl_default, cfg.ttl_min, cfg.max_ttl)?;
    envelope.decode_ciphertext(cfg.max_ciphertext_bytes)?;

    let now = chrono::Utc::now().timestamp();
    match envelope.freshness(now, cfg.max_ts_skew_seconds, cfg.max_msg_age_seconds) {
        Freshness::TooFarFuture => {
            return Err(ApiError::InvalidInput("ts is too far in the future".into()))
        }
        Freshness::TooOld => {
            Metrics::inc(&state.metrics.enqueue_too_old);
            return Ok(Json(EnqueueResponse {
                queued: false,
                msg_id: None,
                reason: Some("too_old"),
            })
            .into_response());
        }
        Freshness::Ok => {}
    }

    if state.ids.is_duplicate(&envelope.header.msg_id) {
        Metrics::inc(&state.metrics.enqueue_duplicate);
        return Ok(Json(EnqueueResponse {
            queued: false,
            msg_id: None,
            reason: Some("duplicate"),
        })
        .into_response());
    }

    let envelope_json = envelope.to_canonical_json()?;
    let outcome = state
        .queue
        .enqueue(&envelope.header.msg_id, &envelope_json, ttl)
        .map_err(|e| ApiError::DbError(e.to_string()))?;

    let _ = state
        .queue
        .record_seen(&envelope.header.msg_id, now);

    match outcome {
        EnqueueOutcome::Queued => {
            Metrics::inc(&state.metrics.enqueued_ok);
            Ok(Json(EnqueueResponse {
                queued: true,
                msg_id: Some(envelope.header.msg_id),
                reason: None,
            })
            .into_response())
        }
        EnqueueOutcome::Duplicate => {
            Metrics::inc(&state.metrics.enqueue_duplicate);
            Ok(Json(EnqueueResponse {
                queued: false,
                msg_id: None,
                reason: Some("duplicate"),
            })
            .into_response())
        }
    }
}

// ---------------------------------------------------------------------------
// POST /v1/router/on_chunk_received
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct LinkMeta {
    #[serde(default = "default_peer")]
    peer: String,
    #[allow(dead_code)]
    #[serde(default)]
    rssi: Option<i32>,
}

fn default_peer() -> String {
    "unknown".to_string()
}

#[derive(Deserialize)]
struct OnChunkReceivedRequest {
    chunk: serde_json::Value,
    #[serde(default)]
    link_meta: Option<LinkMeta>,
}

#[derive(Serialize)]
struct OnChunkReceivedResponse {
    accepted: bool,
    action: &'static str,
}

async fn on_chunk_received(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<impl IntoResponse, ApiError> {
    require_device_auth(&state, &headers, client_ip(&headers, connect_info.map(|ci| ci.0))).await?;

    let req: OnChunkReceivedRequest = serde_json::from_slice(&body)
        .map_err(|e| ApiError::InvalidInput(format!("invalid request body: {e}")))?;
    let link_peer = req
        .link_meta
        .map(|m| m.peer)
        .unwrap_or_else(default_peer);

    let chunk_bytes = serde_json::to_vec(&req.chunk)
        .map_err(|e| ApiError::InvalidInput(format!("invalid chunk: {e}")))?;

    let envelope = match Envelope::parse(&chunk_bytes) {
        Ok(env) => env,
        Err(_) => {
            state
                .ids
                .log_suspicious("INVALID_ENVELOPE", &link_peer, "unknown", "failed to parse envelope")
                .await;
            Metrics::inc(&state.metrics.ingress_invalid);
            return Err(ApiError::InvalidInput("invalid envelope from adapter".into()));
        }
    };

    let msg_id = envelope.header.msg_id.clone();
    let sender_fp = envelope.header.sender_fp.clone();
    let cfg = &state.config;

    // Freshness guard, defense in depth: the same skew/age policy used
    // on the local-send path also applies to wireless ingress.
    let now = chrono::Utc::now().timestamp();
    match envelope.freshness(now, cfg.max_ts_skew_seconds, cfg.max_msg_age_seconds) {
        Freshness::TooFarFuture | Freshness::TooOld => {
            state
                .ids
                .log_suspicious("STALE_ENVELOPE", &sender_fp, &msg_id, "freshness check failed")
                .await;
            return Err(ApiError::InvalidInput("envelope failed freshness check".into()));
        }
        Freshness::Ok => {}
    }

    // TTL guard.
    let ttl = envelope.require_ttl()?;
    if ttl <= 0 {
        state
            .ids
            .log_suspicious("TTL_EXPIRED", &sender_fp, &msg_id, "received with ttl <= 0")
            .await;
        Metrics::inc(&state.metrics.ingress_ttl_expired);
        return Err(ApiError::TtlExpired);
    }
    if ttl > cfg.max_ttl {
        return Err(ApiError::InvalidInput("ttl exceeds max_ttl".into()));
    }

    // Duplicate suppression.
    if envelope.routing.dup_suppress && state.ids.is_duplicate(&msg_id) {
        state
            .ids
            .log_suspicious("DUPLICATE", &sender_fp, &msg_id, "duplicate msg_id seen")
            .await;
        Metrics::inc(&state.metrics.ingress_duplicate_drop);
        return Ok(Json(OnChunkReceivedResponse {
            accepted: false,
            action: "drop",
        }));
    }

    // Per-peer rate limiting, keyed on sender_fp — never link_meta.peer.
    if state.ids.is_rate_limited(&sender_fp) {
        state
            .ids
            .log_suspicious("RATE_LIMIT", &sender_fp, &msg_id, "per-peer rate limit exceeded")
            .await;
        Metrics::inc(&state.metrics.ingress_rate_limited_drop);
        return Ok(Json(OnChunkReceivedResponse {
            accepted: false,
            action: "drop",
        }));
    }

    let _ = state.queue.record_seen(&msg_id, now);

    if cfg.forwarding_enabled {
        Metrics::inc(&state.metrics.ingress_forward);
        Ok(Json(OnChunkReceivedResponse {
            accepted: true,
            action: "forward",
        }))
    } else {
        Metrics::inc(&state.metrics.ingress_final);
        Ok(Json(OnChunkReceivedResponse {
            accepted: true,
            action: "final",
        }))
    }
}

// ---------------------------------------------------------------------------
// POST /v1/router/mark_delivered
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct MarkDeliveredRequest {
    row_id: Option<i64>,
}

async fn mark_delivered(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Json(req): Json<MarkDeliveredRequest>,
) -> Result<impl IntoResponse, ApiError> {
    require_device_auth(&state, &headers, client_ip(&headers, connect_info.map(|ci| ci.0))).await?;
    let row_id = req
        .row_id
        .ok_or_else(|| ApiError::InvalidInput("row_id required".into()))?;
    state
        .queue
        .mark_delivered(row_id)
        .map_err(|e| ApiError::DbError(e.to_string()))?;
    Ok(Json(json!({ "ok": true })))
}

// ---------------------------------------------------------------------------
// GET /v1/router/outgoing_chunks?limit=N
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

async fn outgoing_chunks(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Query(q): Query<LimitQuery>,
) -> Result<impl IntoResponse, ApiError> {
    require_device_auth(&state, &headers, client_ip(&headers, connect_info.map(|ci| ci.0))).await?;
    let rows = state
        .queue
        .get_outgoing_limit(q.limit.unwrap_or(50))
        .map_err(|e| ApiError::DbError(e.to_string()))?;
    let items: Vec<_> = rows
        .into_iter()
        .map(|r| json!({ "row_id": r.row_id, "chunk": serde_json::from_str::<serde_json::Value>(&r.envelope_json).unwrap_or(json!(null)) }))
        .collect();
    Ok(Json(json!({ "items": items })))
}

// ---------------------------------------------------------------------------
// GET /v1/router/stats  (debug-gated)
// ---------------------------------------------------------------------------

async fn stats(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    require_device_auth(&state, &headers, client_ip(&headers, connect_info.map(|ci| ci.0))).await?;
    require_debug(&state)?;
    let (total_queued, total_retries) = state
        .queue
        .stats()
        .map_err(|e| ApiError::DbError(e.to_string()))?;
    Ok(Json(state.metrics.snapshot(total_queued, total_retries)))
}

// ---------------------------------------------------------------------------
// GET /v1/router/queue_debug  (debug-gated)
// ---------------------------------------------------------------------------

async fn queue_debug(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    require_device_auth(&state, &headers, client_ip(&headers, connect_info.map(|ci| ci.0))).await?;
    require_debug(&state)?;
    let rows = state
        .queue
        .debug_dump()
        .map_err(|e| ApiError::DbError(e.to_string()))?;
    let items: Vec<_> = rows
        .into_iter()
        .map(|r| {
            json!({
                "row_id": r.row_id,
                "msg_id": r.msg_id,
                "status": r.status.as_str(),
                "delivered": r.delivered,
                "ttl": r.ttl,
                "retries": r.retries,
                "last_update": r.last_update,
            })
        })
        .collect();
    Ok(Json(json!({ "items": items })))
}

// ---------------------------------------------------------------------------
// GET /v1/router/ids_log_tail?limit=N  (debug-gated)
// ---------------------------------------------------------------------------

async fn ids_log_tail(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Query(q): Query<LimitQuery>,
) -> Result<impl IntoResponse, ApiError> {
    require_device_auth(&state, &headers, client_ip(&headers, connect_info.map(|ci| ci.0))).await?;
    require_debug(&state)?;
    let events = state.ids.tail_log(q.limit.unwrap_or(50)).await;
    Ok(Json(json!({ "events": events })))
}
