//! Resource caching for the capture pipeline
//!
//! A session's binary resources (bitmaps, fonts) repeat heavily across
//! snapshots. This crate deduplicates them by content hash: each distinct
//! payload is encoded exactly once, shared via `Arc`, reference-counted
//! while records still reference it and evicted least-recently-used once
//! unreferenced and over the byte budget.
//!
//! See [`ResourceCache`] for the resolution protocol and [`ResourceEncoder`]
//! for the pluggable compression seam.

mod cache;
mod encoder;

pub use cache::{
    CacheConfig, CacheStats, PendingToken, Resolution, ResourceCache, ResourceError,
};
pub use encoder::{EncodeError, PassthroughEncoder, ResourceEncoder};
