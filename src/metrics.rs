//! Structured in-process counters exposed via `GET /v1/router/stats`.
//!
//! Atomic counters read out into a serde `Json` response, covering the
//! service's accept/drop taxonomy.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Metrics {
    pub enqueued_ok: AtomicU64,
    pub enqueue_duplicate: AtomicU64,
    pub enqueue_too_old: AtomicU64,
    pub ingress_final: AtomicU64,
    pub ingress_forward: AtomicU64,
    pub ingress_duplicate_drop: AtomicU64,
    pub ingress_rate_limited_drop: AtomicU64,
    pub ingress_ttl_expired: AtomicU64,
    pub ingress_invalid: AtomicU64,
    pub delivered: AtomicU64,
    pub dropped_ttl_expired: AtomicU64,
    pub dropped_max_retries: AtomicU64,
    pub dropped_invalid_envelope: AtomicU64,
    pub retries_total: AtomicU64,
    pub auth_rejected: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Serialize)]
pub struct MetricsSnapshot {
    pub enqueued_ok: u64,
    pub enqueue_duplicate: u64,
    pub enqueue_too_old: u64,
    pub ingress_final: u64,
    pub ingress_forward: u64,
    pub ingress_duplicate_drop: u64,
    pub ingress_rate_limited_drop: u64,
    pub ingress_ttl_expired: u64,
    pub ingress_invalid: u64,
    pub delivered: u64,
    pub dropped_ttl_expired: u64,
    pub dropped_max_retries: u64,
    pub dropped_invalid_envelope: u64,
    pub retries_total: u64,
    pub auth_rejected: u64,
    pub total_queued: i64,
    pub total_retries: i64,
}

impl Metrics {
    pub fn snapshot(&self, total_queued: i64, total_retries: i64) -> MetricsSnapshot {
        MetricsSnapshot {
            enqueued_ok: self.enqueued_ok.load(Ordering::Relaxed),
            enqueue_duplicate: self.enqueue_duplicate.load(Ordering::Relaxed),
            enqueue_too_old: self.enqueue_too_old.load(Ordering::Relaxed),
            ingress_final: self.ingress_final.load(Ordering::Relaxed),
            ingress_forward: self.ingress_forward.load(Ordering::Relaxed),
            ingress_duplicate_drop: self.ingress_duplicate_drop.load(Ordering::Relaxed),
            ingress_rate_limited_drop: self.ingress_rate_limited_drop.load(Ordering::Relaxed),
            ingress_ttl_expired: self.ingress_ttl_expired.load(Ordering::Relaxed),
            ingress_invalid: self.ingress_invalid.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped_ttl_expired: self.dropped_ttl_expired.load(Ordering::Relaxed),
            dropped_max_retries: self.dropped_max_retries.load(Ordering::Relaxed),
            dropped_invalid_envelope: self.dropped_invalid_envelope.load(Ordering::Relaxed),
            retries_total: self.retries_total.load(Ordering::Relaxed),
            auth_rejected: self.auth_rejected.load(Ordering::Relaxed),
            total_queued,
            total_retries,
        }
    }
}
