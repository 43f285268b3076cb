//! Deterministic randomness for the fake coordinator.
//!
//! HMAC-SHA256 keyed by a local secret: the same request always yields the
//! same value, so demo runs and tests are reproducible, while different
//! requests yield unrelated values.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// ```text
/// output = HMAC-SHA256(secret, seed || slot_le || request_id_le)
/// ```
pub fn compute_randomness(secret: &[u8], seed: &[u8; 32], slot: u64, request_id: u64) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts keys of any size");

    mac.update(seed);
    mac.update(&slot.to_le_bytes());
    mac.update(&request_id.to_le_bytes());

    mac.finalize().into_bytes().into()
}
