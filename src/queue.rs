//! Queue Store — a durable, single-writer queue of envelopes
//! backed by SQLite (`rusqlite`, bundled).
//!
//! All mutating operations go through a single `Mutex<Connection>` so
//! concurrent HTTP handlers and the forwarder never interleave writes;
//! readers see committed state only.

use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    Queued,
    Delivered,
    TtlExpired,
    MaxRetries,
    InvalidEnvelope,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Queued => "queued",
            QueueStatus::Delivered => "delivered",
            QueueStatus::TtlExpired => "ttl_expired",
            QueueStatus::MaxRetries => "max_retries",
            QueueStatus::InvalidEnvelope => "invalid_envelope",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, QueueStatus::Queued)
    }

    fn from_str(s: &str) -> Self {
        match s {
            "delivered" => QueueStatus::Delivered,
            "ttl_expired" => QueueStatus::TtlExpired,
            "max_retries" => QueueStatus::MaxRetries,
            "invalid_envelope" => QueueStatus::InvalidEnvelope,
            _ => QueueStatus::Queued,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub row_id: i64,
    pub msg_id: String,
    pub envelope_json: String,
    pub ttl: i64,
    pub retries: i64,
    pub status: QueueStatus,
    pub delivered: bool,
    pub last_update: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    Duplicate,
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue is at capacity")]
    CapacityExceeded,
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

pub struct QueueStore {
    conn: Mutex<Connection>,
    max_queue_size: i64,
}

impl QueueStore {
    pub fn open(path: &str, max_queue_size: i64) -> Result<Self, QueueError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
            max_queue_size,
        };
        store.init()?;
        Ok(store)
    }

    pub fn open_in_memory(max_queue_size: i64) -> Result<Self, QueueError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
            max_queue_size,
        };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<(), QueueError> {
        let conn = self.conn.lock().unwrap();
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                msg_id TEXT UNIQUE NOT NULL,
                envelope_json TEXT NOT NULL,
                delivered INTEGER NOT NULL DEFAULT 0,
                retries INTEGER NOT NULL DEFAULT 0,
                ttl INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'queued',
                last_update INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS replay_log (
                msg_id TEXT PRIMARY KEY,
                seen_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS devices (
                device_fp TEXT PRIMARY KEY,
                token_hash BLOB NOT NULL
            );",
        )?;
        Ok(())
    }

    /// Persists a provisioned device's hashed token, so the next process
    /// start (not just the current one) accepts it.
    pub fn register_device(&self, device_fp: &str, token_hash: &[u8; 32]) -> Result<(), QueueError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO devices (device_fp, token_hash) VALUES (?1, ?2)
             ON CONFLICT(device_fp) DO UPDATE SET token_hash = excluded.token_hash",
            params![device_fp, token_hash.as_slice()],
        )?;
        Ok(())
    }

    /// All persisted device credentials, used to seed the in-memory
    /// `DeviceCredentialStore` on startup.
    pub fn load_devices(&self) -> Result<Vec<(String, [u8; 32])>, QueueError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT device_fp, token_hash FROM devices")?;
        let rows = stmt
            .query_map([], |row| {
                let fp: String = row.get(0)?;
                let blob: Vec<u8> = row.get(1)?;
                let mut hash = [0u8; 32];
                if blob.len() == 32 {
                    hash.copy_from_slice(&blob);
                }
                Ok((fp, hash))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }

    /// Insert a new row. Duplicate `msg_id` is reported, never overwritten.
    pub fn enqueue(
        &self,
        msg_id: &str,
        envelope_json: &str,
        ttl: i64,
    ) -> Result<EnqueueOutcome, QueueError> {
        let conn = self.conn.lock().unwrap();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM queue WHERE status = 'queued'", [], |r| {
                r.get(0)
            })?;
        if count >= self.max_queue_size {
            return Err(QueueError::CapacityExceeded);
        }

        let existing: Option<i64> = conn
            .query_row(
                "SELECT id FROM queue WHERE msg_id = ?1",
                params![msg_id],
                |r| r.get(0),
            )
            .optional()?;
        if existing.is_some() {
            return Ok(EnqueueOutcome::Duplicate);
        }

        conn.execute(
            "INSERT INTO queue (msg_id, envelope_json, ttl, status, last_update)
             VALUES (?1, ?2, ?3, 'queued', ?4)",
            params![msg_id, envelope_json, ttl, Self::now()],
        )?;
        Ok(EnqueueOutcome::Queued)
    }

    /// Rows with `delivered = 0` and non-terminal status, FIFO by `row_id`.
    pub fn get_outgoing(&self) -> Result<Vec<QueueEntry>, QueueError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, msg_id, envelope_json, retries, ttl, status, last_update
             FROM queue
             WHERE delivered = 0 AND status = 'queued'
             ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                let status: String = row.get(5)?;
                Ok(QueueEntry {
                    row_id: row.get(0)?,
                    msg_id: row.get(1)?,
                    envelope_json: row.get(2)?,
                    retries: row.get(3)?,
                    ttl: row.get(4)?,
                    status: QueueStatus::from_str(&status),
                    delivered: false,
                    last_update: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get_outgoing_limit(&self, limit: usize) -> Result<Vec<QueueEntry>, QueueError> {
        let mut rows = self.get_outgoing()?;
        rows.truncate(limit);
        Ok(rows)
    }

    pub fn mark_delivered(&self, row_id: i64) -> Result<(), QueueError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE queue SET delivered = 1, status = 'delivered', last_update = ?2
             WHERE id = ?1 AND status != 'delivered'",
            params![row_id, Self::now()],
        )?;
        Ok(())
    }

    pub fn mark_dropped(&self, row_id: i64, reason: QueueStatus) -> Result<(), QueueError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE queue SET delivered = 0, status = ?2, last_update = ?3 WHERE id = ?1",
            params![row_id, reason.as_str(), Self::now()],
        )?;
        Ok(())
    }

    pub fn increment_retry(&self, row_id: i64) -> Result<(), QueueError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE queue SET retries = retries + 1, last_update = ?2 WHERE id = ?1",
            params![row_id, Self::now()],
        )?;
        Ok(())
    }

    pub fn stats(&self) -> Result<(i64, i64), QueueError> {
        let rows = self.get_outgoing()?;
        let total = rows.len() as i64;
        let retries: i64 = rows.iter().map(|r| r.retries).sum();
        Ok((total, retries))
    }

    pub fn debug_dump(&self) -> Result<Vec<QueueEntry>, QueueError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, msg_id, envelope_json, retries, ttl, status, delivered, last_update
             FROM queue ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                let status: String = row.get(5)?;
                let delivered: i64 = row.get(6)?;
                Ok(QueueEntry {
                    row_id: row.get(0)?,
                    msg_id: row.get(1)?,
                    envelope_json: row.get(2)?,
                    retries: row.get(3)?,
                    ttl: row.get(4)?,
                    status: QueueStatus::from_str(&status),
                    delivered: delivered != 0,
                    last_update: row.get(7)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Replay-log durability for duplicate suppression: record a seen
    /// `msg_id` so a restart doesn't resurrect it as fresh.
    pub fn record_seen(&self, msg_id: &str, seen_at: i64) -> Result<(), QueueError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO replay_log (msg_id, seen_at) VALUES (?1, ?2)
             ON CONFLICT(msg_id) DO UPDATE SET seen_at = excluded.seen_at",
            params![msg_id, seen_at],
        )?;
        Ok(())
    }

    pub fn prune_replay_log(&self, older_than: i64) -> Result<(), QueueError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM replay_log WHERE seen_at < ?1",
            params![older_than],
        )?;
        Ok(())
    }

    /// All replay-log entries, used to seed the in-memory IDS dedup map
    /// on startup.
    pub fn load_replay_log(&self) -> Result<Vec<(String, i64)>, QueueError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT msg_id, seen_at FROM replay_log")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
