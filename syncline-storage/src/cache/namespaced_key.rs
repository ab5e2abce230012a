//! Namespaced cache keys.
//!
//! Every entry the store writes lives under a namespace prefix so that
//! [`clear`](super::CacheStore::clear) can remove exactly the entries this
//! layer owns and nothing else sharing the storage medium.

use syncline_core::{compute_content_hash, CacheKey};

/// Default namespace prefix.
pub const DEFAULT_NAMESPACE: &str = "@appejv_cache:";

/// LMDB rejects keys longer than this many bytes.
const MAX_KEY_BYTES: usize = 511;

/// Ends the namespace component. Namespaces must not contain it.
pub const NAMESPACE_TERMINATOR: char = '\0';

/// Marker placed between the namespace and a hashed key.
const HASHED_MARKER: &str = "#sha256:";

/// A cache key bound to a namespace.
///
/// # Binary Format
///
/// `[namespace bytes][0x00][canonical key bytes]`. Canonical keys that would
/// push the encoded form past LMDB's key limit are replaced by
/// `[namespace][0x00]#sha256:[hex digest of the key]`, which keeps the
/// namespace prefix intact for prefix scans. The terminator keeps namespace
/// `a:` from matching keys stored under `a:b`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NamespacedKey {
    namespace: String,
    key: CacheKey,
}

impl NamespacedKey {
    pub fn new(namespace: impl Into<String>, key: CacheKey) -> Self {
        Self {
            namespace: namespace.into(),
            key,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Encode this key for storage.
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Self::namespace_prefix(&self.namespace);
        if bytes.len() + self.key.as_str().len() <= MAX_KEY_BYTES {
            bytes.extend_from_slice(self.key.as_str().as_bytes());
            return bytes;
        }

        let digest = hex::encode(compute_content_hash(self.key.as_str().as_bytes()));
        bytes.extend_from_slice(HASHED_MARKER.as_bytes());
        bytes.extend_from_slice(digest.as_bytes());
        bytes
    }

    /// Prefix shared by every key in `namespace`, terminator included.
    pub fn namespace_prefix(namespace: &str) -> Vec<u8> {
        let mut prefix = Vec::with_capacity(namespace.len() + 1);
        prefix.extend_from_slice(namespace.as_bytes());
        prefix.push(NAMESPACE_TERMINATOR as u8);
        prefix
    }
}
