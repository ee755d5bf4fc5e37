//! Device credential store and constant-time token verification.
//!
//! A device is identified by `X-Device-Fp`, authenticated by
//! `X-Device-Token` checked against a stored SHA-256 hash. Verification
//! never compares raw tokens.

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

pub const DEVICE_FP_HEADER: &str = "x-device-fp";
pub const DEVICE_TOKEN_HEADER: &str = "x-device-token";

#[derive(Debug, Clone)]
pub struct DeviceCredential {
    pub device_fp: String,
    pub token_hash: [u8; 32],
}

pub fn hash_token(token: &str) -> [u8; 32] {
    let digest = Sha256::digest(token.as_bytes());
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

pub fn verify_token(token: &str, expected_hash: &[u8; 32]) -> bool {
    if token.is_empty() {
        return false;
    }
    let computed = hash_token(token);
    computed.ct_eq(expected_hash).into()
}

/// In-memory registry of provisioned devices.
///
/// Provisioning (adding new devices) is an ambient operational concern,
/// not part of the public HTTP surface; it's reached through
/// `DeviceCredentialStore::provision` from tests and the `router
/// provision` CLI subcommand only.
#[derive(Debug, Default)]
pub struct DeviceCredentialStore {
    devices: DashMap<String, DeviceCredential>,
}

impl DeviceCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device with a pre-hashed token (used when loading from config).
    pub fn register_hashed(&self, device_fp: impl Into<String>, token_hash: [u8; 32]) {
        let device_fp = device_fp.into();
        self.devices.insert(
            device_fp.clone(),
            DeviceCredential {
                device_fp,
                token_hash,
            },
        );
    }

    /// Provision a brand-new device, returning the plaintext token once.
    /// Only the hash is retained.
    pub fn provision(&self, device_fp: impl Into<String>) -> String {
        use rand::RngCore;
        let mut raw = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut raw);
        let token = base64::Engine::encode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, raw);
        self.register_hashed(device_fp, hash_token(&token));
        token
    }

    pub fn authenticate(&self, device_fp: &str, token: &str) -> bool {
        match self.devices.get(device_fp) {
            Some(cred) => verify_token(token, &cred.token_hash),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provisioned_device_authenticates_with_its_token() {
        let store = DeviceCredentialStore::new();
        let token = store.provision("dev-1");
        assert!(store.authenticate("dev-1", &token));
        assert!(!store.authenticate("dev-1", "wrong-token"));
        assert!(!store.authenticate("unknown-device", &token));
    }

    #[test]
    fn empty_token_never_verifies() {
        let hash = hash_token("something");
        assert!(!verify_token("", &hash));
    }
}
