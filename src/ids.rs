//! IDS Engine — sliding-window rate limiting, duplicate
//! suppression, peer blocking, and an anonymized suspicious-event log.
//!
//! Keys exclusively on `header.sender_fp` — never on `link_meta.peer`,
//! which is only a link-layer hint and easily spoofed by a hostile peer.

use crate::config::IdsConfig;
use crate::ratelimit::{now_secs, SlidingWindowLimiter};
use dashmap::DashMap;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex as AsyncMutex;

fn anonymize(value: &str) -> String {
    let digest = Sha256::digest(value.as_bytes());
    hex_prefix(&digest, 16)
}

fn hex_prefix(bytes: &[u8], hex_chars: usize) -> String {
    let mut s = String::with_capacity(hex_chars);
    for b in bytes {
        if s.len() >= hex_chars {
            break;
        }
        s.push_str(&format!("{:02x}", b));
    }
    s.truncate(hex_chars);
    s
}

#[derive(Serialize)]
struct SuspiciousRecord<'a> {
    ts: String,
    event: &'a str,
    peer: String,
    msg_id: String,
    detail: &'a str,
}

pub struct IdsEngine {
    cfg: IdsConfig,
    limiter: SlidingWindowLimiter,
    seen_msg_ids: DashMap<String, u64>,
    suspicious_counts: DashMap<String, AtomicU32>,
    blocked_peers: DashMap<String, u64>,
    log_path: String,
    log_writer: Arc<AsyncMutex<()>>,
}

impl IdsEngine {
    pub fn new(cfg: IdsConfig, log_path: impl Into<String>) -> Self {
        Self {
            limiter: SlidingWindowLimiter::new(cfg.window_seconds, cfg.max_msgs_per_window),
            cfg,
            seen_msg_ids: DashMap::new(),
            suspicious_counts: DashMap::new(),
            blocked_peers: DashMap::new(),
            log_path: log_path.into(),
            log_writer: Arc::new(AsyncMutex::new(())),
        }
    }

    /// Duplicate suppression keyed on `msg_id`, with lazy TTL eviction.
    pub fn is_duplicate(&self, msg_id: &str) -> bool {
        self.is_duplicate_at(msg_id, now_secs())
    }

    pub fn is_duplicate_at(&self, msg_id: &str, now: u64) -> bool {
        let ttl = self.cfg.duplicate_suppression_ttl;
        self.seen_msg_ids
            .retain(|_, seen_at| now.saturating_sub(*seen_at) < ttl);
        if self.seen_msg_ids.contains_key(msg_id) {
            true
        } else {
            self.seen_msg_ids.insert(msg_id.to_string(), now);
            false
        }
    }

    /// Remembers a `msg_id` as seen without returning its duplicate
    /// verdict. Used to seed in-memory state from the durable replay
    /// log on startup so a restart does not forget recent history.
    pub fn remember_seen(&self, msg_id: &str, seen_at: u64) {
        self.seen_msg_ids.insert(msg_id.to_string(), seen_at);
    }

    /// Sliding-window rate limit + block check, keyed on `sender_fp`.
    pub fn is_rate_limited(&self, peer: &str) -> bool {
        self.is_rate_limited_at(peer, now_secs())
    }

    pub fn is_rate_limited_at(&self, peer: &str, now: u64) -> bool {
        if let Some(block_until) = self.blocked_peers.get(peer) {
            if now < *block_until {
                return true;
            }
        }
        // Auto-unblock: once now >= block_until, the peer simply falls
        // through to the ordinary sliding-window check below.
        self.blocked_peers.remove_if(peer, |_, until| now >= *until);

        !self.limiter.check(peer, now)
    }

    /// Append one anonymized suspicious event; increments the peer's
    /// suspicious counter and installs a block once the threshold is
    /// reached. Anonymization happens here, before anything touches
    /// disk — raw identifiers are never written, even transiently.
    pub async fn log_suspicious(&self, event_type: &str, peer: &str, msg_id: &str, detail: &str) {
        self.bump_suspicious_and_maybe_block(peer, now_secs());

        let record = SuspiciousRecord {
            ts: chrono::Utc::now().to_rfc3339(),
            event: event_type,
            peer: anonymize(peer),
            msg_id: anonymize(msg_id),
            detail,
        };
        if let Ok(line) = serde_json::to_string(&record) {
            let _guard = self.log_writer.lock().await;
            if let Ok(mut f) = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.log_path)
                .await
            {
                let _ = f.write_all(line.as_bytes()).await;
                let _ = f.write_all(b"\n").await;
                let _ = f.sync_data().await;
            } else {
                tracing::error!(path = %self.log_path, "failed to open suspicious log for append");
            }
        }
    }

    fn bump_suspicious_and_maybe_block(&self, peer: &str, now: u64) {
        let counter = self
            .suspicious_counts
            .entry(peer.to_string())
            .or_insert_with(|| AtomicU32::new(0));
        let count = counter.fetch_add(1, Ordering::SeqCst) + 1;
        if count >= self.cfg.block_peer_after {
            self.blocked_peers
                .insert(peer.to_string(), now + self.cfg.block_peer_ttl_seconds);
        }
    }

    pub fn is_blocked(&self, peer: &str, now: u64) -> bool {
        self.blocked_peers
            .get(peer)
            .map(|until| now < *until)
            .unwrap_or(false)
    }

    /// Read the last `limit` lines of the anonymized suspicious log.
    pub async fn tail_log(&self, limit: usize) -> Vec<serde_json::Value> {
        let contents = match tokio::fs::read_to_string(&self.log_path).await {
            Ok(c) => c,
            Err(_) => return Vec::new(),
        };
        contents
            .lines()
            .rev()
            .take(limit)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(tmp: &std::path::Path) -> IdsEngine {
        IdsEngine::new(
            IdsConfig {
                window_seconds: 5,
                max_msgs_per_window: 3,
                duplicate_suppression_ttl: 600,
                block_peer_after: 3,
                block_peer_ttl_seconds: 10,
            },
            tmp.join("suspicious.log").to_string_lossy().to_string(),
        )
    }

    #[test]
    fn duplicate_detected_only_once_per_ttl_window() {
        let tmp = tempfile::tempdir().unwrap();
        let ids = engine(tmp.path());
        assert!(!ids.is_duplicate_at("m-1", 100));
        assert!(ids.is_duplicate_at("m-1", 101));
        assert!(ids.is_duplicate_at("m-1", 699));
        // Past the TTL window, it's forgotten and treated as fresh again.
        assert!(!ids.is_duplicate_at("m-1", 701));
    }

    #[test]
    fn rate_limit_caps_per_peer_window() {
        let tmp = tempfile::tempdir().unwrap();
        let ids = engine(tmp.path());
        assert!(!ids.is_rate_limited_at("peer-a", 100));
        assert!(!ids.is_rate_limited_at("peer-a", 100));
        assert!(!ids.is_rate_limited_at("peer-a", 100));
        assert!(ids.is_rate_limited_at("peer-a", 100));
        // unrelated peer is unaffected
        assert!(!ids.is_rate_limited_at("peer-b", 100));
    }

    #[tokio::test]
    async fn blocking_after_threshold_and_auto_unblock() {
        let tmp = tempfile::tempdir().unwrap();
        let ids = engine(tmp.path());
        ids.log_suspicious("RATE_LIMIT", "peer-a", "m-1", "x").await;
        ids.log_suspicious("RATE_LIMIT", "peer-a", "m-2", "x").await;
        ids.log_suspicious("RATE_LIMIT", "peer-a", "m-3", "x").await;
        assert!(ids.is_blocked("peer-a", 0));
        assert!(ids.is_rate_limited_at("peer-a", 1));
        // After block_peer_ttl_seconds with no further activity, unblocked.
        assert!(!ids.is_rate_limited_at("peer-a", 11));
    }

    #[tokio::test]
    async fn suspicious_log_never_contains_raw_identifiers() {
        let tmp = tempfile::tempdir().unwrap();
        let ids = engine(tmp.path());
        ids.log_suspicious("DUPLICATE", "peer-secret", "msg-secret", "dup")
            .await;
        let events = ids.tail_log(10).await;
        assert_eq!(events.len(), 1);
        let raw = serde_json::to_string(&events[0]).unwrap();
        assert!(!raw.contains("peer-secret"));
        assert!(!raw.contains("msg-secret"));
    }
}
