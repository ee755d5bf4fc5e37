//! Forwarder Loop — background task draining the Queue Store to
//! the wireless adapter with bounded retry and exponential backoff.
//!
//! Six-step drain pass per row: backoff gate, parse guard, TTL guard,
//! retry budget, hop bookkeeping, then a single bounded-timeout send.

use crate::envelope::Envelope;
use crate::metrics::Metrics;
use crate::queue::{QueueStatus, QueueStore};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

pub struct ForwarderConfig {
    pub interval: Duration,
    pub max_retries: i64,
    pub max_ttl: i64,
    pub base_backoff_ms: u64,
    pub ble_send_url: String,
    pub send_timeout: Duration,
}

#[derive(Serialize)]
struct SendBody<'a> {
    chunk: &'a Envelope,
}

/// Runs one drain pass over `get_outgoing()`.
pub async fn run_once(
    store: &QueueStore,
    client: &reqwest::Client,
    cfg: &ForwarderConfig,
    metrics: &Metrics,
) {
    let rows = match store.get_outgoing() {
        Ok(rows) => rows,
        Err(e) => {
            tracing::error!(error = %e, "forwarder: failed to list outgoing rows");
            return;
        }
    };

    let now = chrono::Utc::now().timestamp();

    for row in rows {
        // 1. Backoff gate.
        if row.retries > 0 {
            let required = (cfg.base_backoff_ms as f64) * 2f64.powi((row.retries - 1) as i32);
            let elapsed_ms = (now - row.last_update).max(0) as f64 * 1000.0;
            if elapsed_ms < required {
                continue;
            }
        }

        // 2. Parse guard.
        let mut envelope = match Envelope::parse(row.envelope_json.as_bytes()) {
            Ok(env) => env,
            Err(e) => {
                tracing::warn!(row_id = row.row_id, error = %e, "forwarder: invalid envelope, dropping");
                let _ = store.mark_dropped(row.row_id, QueueStatus::InvalidEnvelope);
                Metrics::inc(&metrics.dropped_invalid_envelope);
                continue;
            }
        };

        // 3. TTL guard. A row with no ttl at all never should have made
        // it past enqueue, so treat it the same as an invalid envelope.
        let ttl = match envelope.header.ttl {
            Some(t) => t,
            None => {
                tracing::warn!(row_id = row.row_id, "forwarder: envelope missing ttl, dropping");
                let _ = store.mark_dropped(row.row_id, QueueStatus::InvalidEnvelope);
                Metrics::inc(&metrics.dropped_invalid_envelope);
                continue;
            }
        };
        if ttl <= 0 || ttl > cfg.max_ttl {
            tracing::info!(row_id = row.row_id, msg_id = %envelope.header.msg_id, "forwarder: dropping expired ttl");
            let _ = store.mark_dropped(row.row_id, QueueStatus::TtlExpired);
            Metrics::inc(&metrics.dropped_ttl_expired);
            continue;
        }

        // 4. Retry budget.
        if row.retries >= cfg.max_retries {
            tracing::info!(row_id = row.row_id, msg_id = %envelope.header.msg_id, "forwarder: max retries exceeded");
            let _ = store.mark_dropped(row.row_id, QueueStatus::MaxRetries);
            Metrics::inc(&metrics.dropped_max_retries);
            continue;
        }

        // 5. Hop bookkeeping (in-memory only; not persisted unless delivered).
        envelope.header.ttl = Some(ttl - 1);
        envelope.header.hop_count += 1;

        // 6. Send.
        let body = SendBody { chunk: &envelope };
        let send_result = client
            .post(&cfg.ble_send_url)
            .timeout(cfg.send_timeout)
            .json(&body)
            .send()
            .await;

        match send_result {
            Ok(resp) if resp.status().is_success() => {
                tracing::info!(row_id = row.row_id, msg_id = %envelope.header.msg_id, "forwarder: delivered");
                let _ = store.mark_delivered(row.row_id);
                Metrics::inc(&metrics.delivered);
            }
            Ok(resp) => {
                tracing::warn!(row_id = row.row_id, status = %resp.status(), "forwarder: adapter returned non-200");
                let _ = store.increment_retry(row.row_id);
                Metrics::inc(&metrics.retries_total);
            }
            Err(e) => {
                tracing::warn!(row_id = row.row_id, error = %e, "forwarder: send failed");
                let _ = store.increment_retry(row.row_id);
                Metrics::inc(&metrics.retries_total);
            }
        }
    }
}

/// Spawns the periodic forwarder task. The returned handle can be
/// `.abort()`-ed at shutdown.
pub fn spawn(
    store: Arc<QueueStore>,
    client: reqwest::Client,
    cfg: ForwarderConfig,
    metrics: Arc<Metrics>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(cfg.interval);
        loop {
            interval.tick().await;
            run_once(&store, &client, &cfg, &metrics).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::WIRE_VERSION;

    fn sample_envelope_json(ttl: i64) -> String {
        format!(
            r#"{{"version":"{}","header":{{"sender_fp":"a","recipient_fp":"b","msg_id":"{}","nonce":"MDEyMzQ1Njc4OWFi","ttl":{},"ts":1700000000}},"ciphertext":"aGVsbG8="}}"#,
            WIRE_VERSION,
            uuid::Uuid::new_v4(),
            ttl
        )
    }

    #[tokio::test]
    async fn drops_rows_with_expired_ttl() {
        let store = QueueStore::open_in_memory(100).unwrap();
        store.enqueue("m-1", &sample_envelope_json(0), 0).unwrap();
        let client = reqwest::Client::new();
        let cfg = ForwarderConfig {
            interval: Duration::from_secs(2),
            max_retries: 5,
            max_ttl: 8,
            base_backoff_ms: 500,
            ble_send_url: "http://127.0.0.1:1/unused".to_string(),
            send_timeout: Duration::from_millis(50),
        };
        let metrics = Metrics::new();
        run_once(&store, &client, &cfg, &metrics).await;
        assert!(store.get_outgoing().unwrap().is_empty());
    }

    #[tokio::test]
    async fn drops_rows_past_retry_budget() {
        let store = QueueStore::open_in_memory(100).unwrap();
        store.enqueue("m-1", &sample_envelope_json(4), 4).unwrap();
        let row_id = store.get_outgoing().unwrap()[0].row_id;
        for _ in 0..5 {
            store.increment_retry(row_id).unwrap();
        }
        let client = reqwest::Client::new();
        let cfg = ForwarderConfig {
            interval: Duration::from_secs(2),
            max_retries: 5,
            max_ttl: 8,
            base_backoff_ms: 500,
            ble_send_url: "http://127.0.0.1:1/unused".to_string(),
            send_timeout: Duration::from_millis(50),
        };
        let metrics = Metrics::new();
        run_once(&store, &client, &cfg, &metrics).await;
        assert!(store.get_outgoing().unwrap().is_empty());
    }

    #[tokio::test]
    async fn backoff_gate_skips_row_before_deadline() {
        let store = QueueStore::open_in_memory(100).unwrap();
        store.enqueue("m-1", &sample_envelope_json(4), 4).unwrap();
        let row_id = store.get_outgoing().unwrap()[0].row_id;
        store.increment_retry(row_id).unwrap();
        let client = reqwest::Client::new();
        let cfg = ForwarderConfig {
            interval: Duration::from_secs(2),
            max_retries: 5,
            max_ttl: 8,
            base_backoff_ms: 500_000, // effectively never ready within this test
            ble_send_url: "http://127.0.0.1:1/unused".to_string(),
            send_timeout: Duration::from_millis(50),
        };
        let metrics = Metrics::new();
        run_once(&store, &client, &cfg, &metrics).await;
        // Row should still be present (skipped, not dropped or retried further).
        let rows = store.get_outgoing().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].retries, 1);
    }
}
