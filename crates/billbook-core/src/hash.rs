//! Payload fingerprints.
//!
//! `serde_json` keeps object keys sorted, so two payloads with the same
//! fields and values hash identically regardless of construction order.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// SHA-256 of the payload's JSON encoding, hex encoded.
pub fn payload_hash(payload: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_hash_ignores_key_order() {
        let a = json!({"name": "Tea", "price_cents": 150});
        let b = json!({"price_cents": 150, "name": "Tea"});
        assert_eq!(payload_hash(&a), payload_hash(&b));
    }

    #[test]
    fn test_hash_detects_value_change() {
        let a = json!({"name": "Tea", "price_cents": 150});
        let b = json!({"name": "Tea", "price_cents": 151});
        assert_ne!(payload_hash(&a), payload_hash(&b));
        assert_eq!(payload_hash(&a).len(), 64);
    }
}
