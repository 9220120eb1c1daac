//! Cryptographic operations for the ledger
//!
//! This module provides:
//! - ILP hash-lock checks (SHA-256 preimage condition/fulfilment)
//! - BLAKE3 content hashes for duplicate detection

use crate::types::{Condition, Fulfilment, TransferRequest};
use crate::{Error, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// ILP preimages and condition digests are exactly 32 bytes
pub const PREIMAGE_LEN: usize = 32;

/// Content hash used by the duplicate-check tables
pub type PayloadHash = [u8; 32];

fn decode_32(encoded: &str) -> Option<[u8; PREIMAGE_LEN]> {
    let bytes = URL_SAFE_NO_PAD.decode(encoded.trim_end_matches('=')).ok()?;
    bytes.try_into().ok()
}

impl Condition {
    /// Well-formed conditions decode to a 32-byte digest
    pub fn validate(&self) -> Result<()> {
        decode_32(&self.0)
            .map(|_| ())
            .ok_or_else(|| Error::Validation("Condition must be a base64url SHA-256 digest".into()))
    }

    /// Condition locking the given preimage
    pub fn from_preimage(preimage: &[u8; PREIMAGE_LEN]) -> Self {
        Condition(URL_SAFE_NO_PAD.encode(Sha256::digest(preimage)))
    }
}

impl Fulfilment {
    /// Wrap a raw preimage
    pub fn from_preimage(preimage: &[u8; PREIMAGE_LEN]) -> Self {
        Fulfilment(URL_SAFE_NO_PAD.encode(preimage))
    }

    /// Random preimage (payee side, simulators and tests)
    pub fn random() -> Self {
        Self::from_preimage(&rand::random::<[u8; PREIMAGE_LEN]>())
    }

    /// Condition this fulfilment opens, `None` if it is not a 32-byte preimage
    pub fn condition(&self) -> Option<Condition> {
        decode_32(&self.0).map(|preimage| Condition::from_preimage(&preimage))
    }

    /// Does SHA-256(preimage) equal the condition digest
    pub fn matches(&self, condition: &Condition) -> bool {
        let Some(preimage) = decode_32(&self.0) else {
            return false;
        };
        let Some(expected) = decode_32(&condition.0) else {
            return false;
        };
        let digest: [u8; 32] = Sha256::digest(preimage).into();
        digest == expected
    }
}

/// BLAKE3 over the canonical JSON encoding of a value
pub fn payload_hash<T: Serialize>(value: &T) -> Result<PayloadHash> {
    let canonical = serde_json::to_vec(value)?;
    Ok(*blake3::hash(&canonical).as_bytes())
}

impl TransferRequest {
    /// Duplicate-check hash of this prepare request
    pub fn payload_hash(&self) -> Result<PayloadHash> {
        payload_hash(self)
    }
}
