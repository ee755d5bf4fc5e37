//! Envelope Model — canonical validated structure for every message
//! in flight. Crypto is opaque here: the routing core never decrypts
//! `ciphertext`, it only validates shape, bounds, and freshness.

use crate::errors::ApiError;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

pub const WIRE_VERSION: &str = "1.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeHeader {
    pub sender_fp: String,
    pub recipient_fp: String,
    pub msg_id: String,
    pub nonce: String,
    #[serde(default)]
    pub ttl: Option<i64>,
    #[serde(default)]
    pub hop_count: i64,
    pub ts: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkInfo {
    #[serde(default)]
    pub index: u32,
    #[serde(default = "default_chunk_total")]
    pub total: u32,
}

fn default_chunk_total() -> u32 {
    1
}

impl Default for ChunkInfo {
    fn default() -> Self {
        Self {
            index: 0,
            total: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingMeta {
    #[serde(default)]
    pub priority: Priority,
    #[serde(default = "default_dup_suppress")]
    pub dup_suppress: bool,
}

fn default_dup_suppress() -> bool {
    true
}

impl Default for RoutingMeta {
    fn default() -> Self {
        Self {
            priority: Priority::Normal,
            dup_suppress: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default = "default_version")]
    pub version: String,
    pub header: EnvelopeHeader,
    pub ciphertext: String,
    #[serde(default)]
    pub chunks: ChunkInfo,
    #[serde(default)]
    pub routing: RoutingMeta,
}

fn default_version() -> String {
    WIRE_VERSION.to_string()
}

/// Freshness verdict for a parsed envelope, relative to "now".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Ok,
    TooFarFuture,
    TooOld,
}

impl Envelope {
    /// Parse raw JSON bytes into a validated `Envelope`.
    ///
    /// Unknown top-level fields are tolerated; unknown fields inside
    /// `header` are simply never read by this struct, so they cannot
    /// influence routing semantics either way.
    pub fn parse(body: &[u8]) -> Result<Self, ApiError> {
        let env: Envelope = serde_json::from_slice(body)
            .map_err(|e| ApiError::InvalidInput(format!("invalid envelope: {e}")))?;
        env.validate_shape()?;
        Ok(env)
    }

    fn validate_shape(&self) -> Result<(), ApiError> {
        if self.version != WIRE_VERSION {
            return Err(ApiError::InvalidInput(format!(
                "unsupported envelope version: {}",
                self.version
            )));
        }
        if uuid::Uuid::parse_str(&self.header.msg_id).is_err() {
            return Err(ApiError::InvalidInput("msg_id must be a uuid-v4".into()));
        }
        base64::engine::general_purpose::STANDARD
            .decode(&self.header.nonce)
            .map_err(|_| ApiError::InvalidInput("nonce is not valid base64".into()))?;
        if self.header.hop_count < 0 {
            return Err(ApiError::InvalidInput("hop_count must be non-negative".into()));
        }
        Ok(())
    }

    /// Decoded ciphertext bytes, checked against `max_ciphertext_bytes`.
    pub fn decode_ciphertext(&self, max_bytes: usize) -> Result<Vec<u8>, ApiError> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(&self.ciphertext)
            .map_err(|_| ApiError::InvalidInput("ciphertext is not valid base64".into()))?;
        if bytes.len() > max_bytes {
            return Err(ApiError::TooLarge(format!(
                "ciphertext exceeds max size of {max_bytes} bytes"
            )));
        }
        Ok(bytes)
    }

    /// Resolves `header.ttl` against `ttl_default` ("if ttl is missing,
    /// set to ttl_default") and checks the result
    /// against `[ttl_min, ttl_max]`. Returns the resolved ttl.
    pub fn resolve_and_check_ttl(
        &mut self,
        ttl_default: i64,
        ttl_min: i64,
        ttl_max: i64,
    ) -> Result<i64, ApiError> {
        let ttl = self.header.ttl.unwrap_or(ttl_default);
        if ttl < ttl_min || ttl > ttl_max {
            return Err(ApiError::InvalidInput(format!(
                "ttl must be between {ttl_min} and {ttl_max}"
            )));
        }
        self.header.ttl = Some(ttl);
        Ok(ttl)
    }

    /// `ttl` as required by the wireless-ingress path, where a missing
    /// value is itself invalid (only the local-send path defaults it).
    pub fn require_ttl(&self) -> Result<i64, ApiError> {
        self.header
            .ttl
            .ok_or_else(|| ApiError::InvalidInput("ttl is required".into()))
    }

    /// Freshness check: `ts` must be within
    /// `[now - max_msg_age, now + max_ts_skew]`.
    pub fn freshness(&self, now: i64, max_ts_skew: i64, max_msg_age: i64) -> Freshness {
        if self.header.ts > now + max_ts_skew {
            Freshness::TooFarFuture
        } else if now - self.header.ts > max_msg_age {
            Freshness::TooOld
        } else {
            Freshness::Ok
        }
    }

    /// Stable JSON rendering used as the canonical queue representation.
    pub fn to_canonical_json(&self) -> Result<String, ApiError> {
        serde_json::to_string(self)
            .map_err(|e| ApiError::Internal(format!("failed to serialize envelope: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json(ttl: i64, ts: i64) -> String {
        format!(
            r#"{{"version":"1.0","header":{{"sender_fp":"abc","recipient_fp":"def","msg_id":"{}","nonce":"{}","ttl":{},"ts":{}}},"ciphertext":"{}"}}"#,
            uuid::Uuid::new_v4(),
            base64::engine::general_purpose::STANDARD.encode(b"0123456789ab"),
            ttl,
            ts,
            base64::engine::general_purpose::STANDARD.encode(b"hello world")
        )
    }

    #[test]
    fn parses_minimal_valid_envelope() {
        let json = sample_json(4, 1_700_000_000);
        let env = Envelope::parse(json.as_bytes()).expect("should parse");
        assert_eq!(env.header.ttl, Some(4));
        assert_eq!(env.chunks.total, 1);
        assert_eq!(env.routing.priority, Priority::Normal);
        assert!(env.routing.dup_suppress);
    }

    #[test]
    fn rejects_bad_version() {
        let json = sample_json(4, 1_700_000_000).replace("1.0", "2.0");
        assert!(Envelope::parse(json.as_bytes()).is_err());
    }

    #[test]
    fn rejects_non_uuid_msg_id() {
        let json = r#"{"version":"1.0","header":{"sender_fp":"abc","recipient_fp":"def","msg_id":"not-a-uuid","nonce":"MDEyMzQ1Njc4OWFi","ttl":4,"ts":1700000000},"ciphertext":"aGVsbG8="}"#;
        assert!(Envelope::parse(json.as_bytes()).is_err());
    }

    #[test]
    fn rejects_oversized_ciphertext() {
        let json = sample_json(4, 1_700_000_000);
        let env = Envelope::parse(json.as_bytes()).unwrap();
        assert!(env.decode_ciphertext(4).is_err());
        assert!(env.decode_ciphertext(4096).is_ok());
    }

    #[test]
    fn ttl_bounds_are_enforced() {
        let mut env = Envelope::parse(sample_json(1, 1_700_000_000).as_bytes()).unwrap();
        assert!(env.resolve_and_check_ttl(4, 1, 8).is_ok());
        let mut env2 = Envelope::parse(sample_json(0, 1_700_000_000).as_bytes()).unwrap();
        assert!(env2.resolve_and_check_ttl(4, 1, 8).is_err());
        let mut env3 = Envelope::parse(sample_json(9, 1_700_000_000).as_bytes()).unwrap();
        assert!(env3.resolve_and_check_ttl(4, 1, 8).is_err());
    }

    #[test]
    fn missing_ttl_resolves_to_default() {
        let json = r#"{"version":"1.0","header":{"sender_fp":"abc","recipient_fp":"def","msg_id":"5eb63bbb-e012-43e4-8b6a-bd5f9f3e3e2a","nonce":"MDEyMzQ1Njc4OWFi","ts":1700000000},"ciphertext":"aGVsbG8="}"#;
        let mut env = Envelope::parse(json.as_bytes()).unwrap();
        assert!(env.header.ttl.is_none());
        let resolved = env.resolve_and_check_ttl(4, 1, 8).unwrap();
        assert_eq!(resolved, 4);
        assert_eq!(env.header.ttl, Some(4));
    }

    #[test]
    fn require_ttl_rejects_missing_ttl_on_ingress() {
        let json = r#"{"version":"1.0","header":{"sender_fp":"abc","recipient_fp":"def","msg_id":"5eb63bbb-e012-43e4-8b6a-bd5f9f3e3e2a","nonce":"MDEyMzQ1Njc4OWFi","ts":1700000000},"ciphertext":"aGVsbG8="}"#;
        let env = Envelope::parse(json.as_bytes()).unwrap();
        assert!(env.require_ttl().is_err());
    }

    #[test]
    fn freshness_accepts_exact_skew_boundary() {
        let now = 1_700_001_000;
        let env = Envelope::parse(sample_json(4, now + 300).as_bytes()).unwrap();
        assert_eq!(env.freshness(now, 300, 3600), Freshness::Ok);
        let env2 = Envelope::parse(sample_json(4, now + 301).as_bytes()).unwrap();
        assert_eq!(env2.freshness(now, 300, 3600), Freshness::TooFarFuture);
    }

    #[test]
    fn freshness_accepts_exact_age_boundary() {
        let now = 1_700_001_000;
        let env = Envelope::parse(sample_json(4, now - 3600).as_bytes()).unwrap();
        assert_eq!(env.freshness(now, 300, 3600), Freshness::Ok);
        let env2 = Envelope::parse(sample_json(4, now - 3601).as_bytes()).unwrap();
        assert_eq!(env2.freshness(now, 300, 3600), Freshness::TooOld);
    }
}
