//! Stable hashing used by percentage branch splits and retry jitter.
//!
//! Both need a value that is uniformly distributed but fully determined by
//! its inputs: a run must land on the same branch arm on every evaluation,
//! and a retry must compute the same jitter on replay.

use sha2::{Digest, Sha256};

/// Hash `key` into a bucket in `0..modulus`.
///
/// Uses the first 8 bytes of SHA-256, which is uniform enough for A/B
/// splits and cheap enough to recompute on every inspection.
pub fn stable_bucket(key: &str, modulus: u64) -> u64 {
    let digest = Sha256::digest(key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix) % modulus
}
