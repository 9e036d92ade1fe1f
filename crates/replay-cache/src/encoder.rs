//! Encoding seam
//!
//! The cache never compresses bytes itself; it delegates to a
//! [`ResourceEncoder`] supplied at construction. Production embeds a real
//! codec behind this trait; tests plug in counting, failing or stalling
//! encoders.

use async_trait::async_trait;
use replay_model::RawResource;

/// External compression/encoding step for raw resource payloads
///
/// May be slow; the cache bounds every call with its configured timeout.
#[async_trait]
pub trait ResourceEncoder: Send + Sync + 'static {
    /// Encode a raw payload into its compressed wire form
    ///
    /// # Errors
    /// Returns an error if the payload cannot be encoded; the owning
    /// element then degrades to a placeholder downstream.
    async fn encode(&self, raw: &RawResource) -> Result<Vec<u8>, EncodeError>;
}

/// Encoding failure reported by a [`ResourceEncoder`]
#[derive(Debug, Clone, thiserror::Error)]
#[error("encode failed: {0}")]
pub struct EncodeError(pub String);

impl EncodeError {
    /// Create an error from any displayable cause
    #[must_use]
    pub fn new(cause: impl std::fmt::Display) -> Self {
        Self(cause.to_string())
    }
}

/// Encoder that returns the raw bytes unchanged
///
/// Stands in for a real codec in tests and examples.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughEncoder;

#[async_trait]
impl ResourceEncoder for PassthroughEncoder {
    async fn encode(&self, raw: &RawResource) -> Result<Vec<u8>, EncodeError> {
        Ok(raw.bytes.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn passthrough_returns_input() {
        let raw = RawResource::new(vec![1, 2, 3], "image/webp");
        let encoded = PassthroughEncoder.encode(&raw).await.unwrap();
        assert_eq!(encoded, vec![1, 2, 3]);
    }
}
