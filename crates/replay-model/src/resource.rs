//! Binary resource descriptors and the resolved record handed to the sink

use crate::hash::ContentHash;
use crate::record::MutationRecord;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// An encoded binary resource, immutable once created
///
/// Shared via `Arc` between the cache and every record referencing it;
/// reference counting lives in the cache, not here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    /// Digest of the encoded payload
    pub content_hash: ContentHash,
    /// Compressed payload bytes
    pub encoded_bytes: Vec<u8>,
    /// Payload media type, e.g. `image/webp`
    pub mime_type: String,
}

impl ResourceDescriptor {
    /// Create a descriptor, digesting the encoded payload
    #[must_use]
    pub fn new(encoded_bytes: Vec<u8>, mime_type: impl Into<String>) -> Self {
        Self {
            content_hash: ContentHash::digest(&encoded_bytes),
            encoded_bytes,
            mime_type: mime_type.into(),
        }
    }

    /// Create a descriptor under a caller-supplied content hash
    ///
    /// Used when the hash was computed over the raw (pre-encode) payload
    /// and must stay stable across encoder versions.
    #[must_use]
    pub fn with_hash(
        content_hash: ContentHash,
        encoded_bytes: Vec<u8>,
        mime_type: impl Into<String>,
    ) -> Self {
        Self {
            content_hash,
            encoded_bytes,
            mime_type: mime_type.into(),
        }
    }

    /// Size of the encoded payload in bytes
    #[inline]
    #[must_use]
    pub fn byte_size(&self) -> u64 {
        self.encoded_bytes.len() as u64
    }
}

/// Raw (uncompressed) resource payload supplied by the traversal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResource {
    /// Uncompressed payload bytes
    pub bytes: Vec<u8>,
    /// Media type of the payload once encoded
    pub mime_type: String,
}

impl RawResource {
    /// Create a raw payload
    #[must_use]
    pub fn new(bytes: Vec<u8>, mime_type: impl Into<String>) -> Self {
        Self {
            bytes,
            mime_type: mime_type.into(),
        }
    }

    /// Content hash of the raw payload
    #[must_use]
    pub fn content_hash(&self) -> ContentHash {
        ContentHash::digest(&self.bytes)
    }
}

/// A fully resolved record, emitted to the sink in sequence order
#[derive(Debug, Clone)]
pub struct ResolvedRecord {
    /// Capture order
    pub sequence: u64,
    /// Capture timestamp, milliseconds since epoch
    pub timestamp_ms: u64,
    /// The element-level operations for this tick
    pub mutation: MutationRecord,
    /// Descriptors for every resource the mutation references, hash-ordered
    pub resources: Vec<Arc<ResourceDescriptor>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_digests_payload() {
        let descriptor = ResourceDescriptor::new(vec![1, 2, 3], "image/webp");
        assert_eq!(descriptor.content_hash, ContentHash::digest(&[1, 2, 3]));
        assert_eq!(descriptor.byte_size(), 3);
    }

    #[test]
    fn with_hash_keeps_caller_hash() {
        let hash = ContentHash::digest(b"raw payload");
        let descriptor = ResourceDescriptor::with_hash(hash, vec![9, 9], "image/webp");
        assert_eq!(descriptor.content_hash, hash);
        assert_ne!(descriptor.content_hash, ContentHash::digest(&[9, 9]));
    }
}
