//! Identity and hashing helpers

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// SHA-256 content hash used for event fingerprints.
pub type ContentHash = [u8; 32];

/// Compute SHA-256 hash of content.
pub fn compute_content_hash(content: &[u8]) -> ContentHash {
    let mut hasher = Sha256::new();
    hasher.update(content);
    let result = hasher.finalize();
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&result);
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_is_deterministic() {
        let a = compute_content_hash(b"INSERT:n1");
        let b = compute_content_hash(b"INSERT:n1");
        let c = compute_content_hash(b"INSERT:n2");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
