//! # Identity
//!
//! Deterministic digests used by the cache: one derived from a resource URL
//! (the cache key and on-disk file name) and one derived from content bytes
//! (used to detect unchanged downloads).

use sha2::{Digest, Sha256};

/// Length in characters of every id and fingerprint produced here.
pub const DIGEST_HEX_LEN: usize = 64;

/// Derive the resource identifier for a URL.
///
/// The URL is hashed exactly as given, so `http://h/a` and `http://h/a/`
/// are different resources. The result is safe to use as a file name.
pub fn resource_id(url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    hex::encode(hasher.finalize())
}

/// Fingerprint a blob of content bytes.
pub fn content_fingerprint(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}
