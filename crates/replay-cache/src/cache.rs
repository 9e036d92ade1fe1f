//! Content-addressed resource cache
//!
//! Maps a content hash to its encoded resource descriptor. Concurrent
//! requests for the same hash collapse onto a single encode: the first
//! miss reserves the slot under the cache lock (test-and-set) and every
//! caller gets a [`PendingToken`] that resolves when the encode lands.
//! Eviction is least-recently-used among entries whose refcount reached
//! zero, triggered when the encoded byte total exceeds the budget.

use crate::encoder::ResourceEncoder;
use parking_lot::Mutex;
use replay_model::{ContentHash, RawResource, ResourceDescriptor};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// Tunables for the resource cache
#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    /// Budget for cached encoded bytes; exceeding it triggers eviction
    pub max_total_bytes: u64,
    /// Upper bound on a single encode; slower resolutions fail
    pub encode_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_total_bytes: 10 * 1024 * 1024,
            encode_timeout: Duration::from_secs(5),
        }
    }
}

/// Cache performance counters
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    /// Resolutions served synchronously from a resolved entry
    pub hits: u64,
    /// Resolutions that required (or joined) an encode
    pub misses: u64,
    /// Entries dropped under byte-budget pressure
    pub evictions: u64,
    /// Encodes that failed or timed out
    pub failed_encodes: u64,
}

/// Failure modes of resource resolution
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResourceError {
    /// The external encoder rejected the payload
    #[error("resource encoding failed: {0}")]
    EncodeFailed(String),

    /// The encode did not finish within the configured bound
    #[error("resource encoding timed out")]
    Timeout,

    /// A miss had no raw payload to encode
    #[error("no raw payload available for resource {0}")]
    MissingPayload(ContentHash),

    /// The cache went away before the resolution settled
    #[error("resource resolution cancelled")]
    Cancelled,
}

type WaiterTx = oneshot::Sender<Result<Arc<ResourceDescriptor>, ResourceError>>;
type WaiterRx = oneshot::Receiver<Result<Arc<ResourceDescriptor>, ResourceError>>;

/// Outcome of [`ResourceCache::resolve`]
#[derive(Debug)]
pub enum Resolution {
    /// The descriptor was already cached; refcount has been taken
    Hit(Arc<ResourceDescriptor>),
    /// An encode is in flight; await the token for the outcome
    Pending(PendingToken),
}

/// Handle to an in-flight resolution
///
/// Resolves once the single encode for this hash settles. Dropping the
/// token abandons the wait; an abandoned waiter takes no refcount.
#[derive(Debug)]
pub struct PendingToken {
    hash: ContentHash,
    rx: WaiterRx,
}

impl PendingToken {
    /// Hash this token is waiting on
    #[inline]
    #[must_use]
    pub fn content_hash(&self) -> ContentHash {
        self.hash
    }

    /// Wait for the resolution outcome
    ///
    /// On success the returned descriptor carries one refcount for this
    /// waiter.
    ///
    /// # Errors
    /// Returns the encode failure, timeout, or cancellation.
    pub async fn wait(self) -> Result<Arc<ResourceDescriptor>, ResourceError> {
        self.rx.await.unwrap_or(Err(ResourceError::Cancelled))
    }
}

enum Slot {
    /// Reserved: one encode is in flight, waiters queue here
    Pending { waiters: Vec<WaiterTx> },
    /// Settled descriptor with live-reference bookkeeping
    Resolved {
        descriptor: Arc<ResourceDescriptor>,
        ref_count: u64,
        last_used: u64,
    },
}

struct CacheState {
    slots: HashMap<ContentHash, Slot>,
    total_bytes: u64,
    /// Logical LRU clock, bumped on every touch
    clock: u64,
    stats: CacheStats,
}

struct CacheInner {
    state: Mutex<CacheState>,
    encoder: Arc<dyn ResourceEncoder>,
    config: CacheConfig,
}

/// Content-addressed, size-bounded resource cache
///
/// Explicitly owned: construct one per pipeline and pass it around by
/// clone (clones share state). Safe under concurrent `resolve`/`release`
/// from worker tasks; the single lock is never held across an await.
#[derive(Clone)]
pub struct ResourceCache {
    inner: Arc<CacheInner>,
}

impl fmt::Debug for ResourceCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ResourceCache")
            .field("entries", &state.slots.len())
            .field("total_bytes", &state.total_bytes)
            .field("stats", &state.stats)
            .finish()
    }
}

impl ResourceCache {
    /// Create a cache around an encoder
    #[must_use]
    pub fn new(config: CacheConfig, encoder: Arc<dyn ResourceEncoder>) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                state: Mutex::new(CacheState {
                    slots: HashMap::new(),
                    total_bytes: 0,
                    clock: 0,
                    stats: CacheStats::default(),
                }),
                encoder,
                config,
            }),
        }
    }

    /// Resolve a content hash, taking one reference on the resource
    ///
    /// A cached hash returns [`Resolution::Hit`] synchronously. Otherwise
    /// the slot is reserved, `payload` is consulted for the raw bytes and
    /// a single encode is spawned; concurrent callers for the same hash
    /// join the same encode. Must be called within a tokio runtime.
    pub fn resolve<F>(&self, hash: ContentHash, payload: F) -> Resolution
    where
        F: FnOnce() -> Option<RawResource>,
    {
        let mut to_encode = None;
        let mut payload_missing = false;

        let resolution = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            state.clock += 1;
            let now = state.clock;

            match state.slots.get_mut(&hash) {
                Some(Slot::Resolved {
                    descriptor,
                    ref_count,
                    last_used,
                }) => {
                    *ref_count += 1;
                    *last_used = now;
                    state.stats.hits += 1;
                    Resolution::Hit(Arc::clone(descriptor))
                }
                Some(Slot::Pending { waiters }) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    state.stats.misses += 1;
                    Resolution::Pending(PendingToken { hash, rx })
                }
                None => {
                    state.stats.misses += 1;
                    let (tx, rx) = oneshot::channel();
                    state.slots.insert(hash, Slot::Pending { waiters: vec![tx] });
                    match payload() {
                        Some(raw) => to_encode = Some(raw),
                        None => payload_missing = true,
                    }
                    Resolution::Pending(PendingToken { hash, rx })
                }
            }
        };

        if payload_missing {
            self.inner
                .settle_failure(hash, ResourceError::MissingPayload(hash));
        } else if let Some(raw) = to_encode {
            self.spawn_encode(hash, raw);
        }
        resolution
    }

    /// Drop one reference to a resolved resource
    ///
    /// At refcount zero the entry stays cached and becomes eligible for
    /// eviction; it is not removed immediately.
    pub fn release(&self, hash: ContentHash) {
        let mut guard = self.inner.state.lock();
        if let Some(Slot::Resolved { ref_count, .. }) = guard.slots.get_mut(&hash) {
            *ref_count = ref_count.saturating_sub(1);
        }
    }

    /// Whether a resolved descriptor is cached for this hash
    #[must_use]
    pub fn contains(&self, hash: ContentHash) -> bool {
        matches!(
            self.inner.state.lock().slots.get(&hash),
            Some(Slot::Resolved { .. })
        )
    }

    /// Current refcount of a resolved entry
    #[must_use]
    pub fn ref_count(&self, hash: ContentHash) -> Option<u64> {
        match self.inner.state.lock().slots.get(&hash) {
            Some(Slot::Resolved { ref_count, .. }) => Some(*ref_count),
            _ => None,
        }
    }

    /// Total encoded bytes currently cached
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.inner.state.lock().total_bytes
    }

    /// Performance counters
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.inner.state.lock().stats
    }

    fn spawn_encode(&self, hash: ContentHash, raw: RawResource) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let timeout = inner.config.encode_timeout;
            match tokio::time::timeout(timeout, inner.encoder.encode(&raw)).await {
                Ok(Ok(bytes)) => inner.settle_success(hash, bytes, raw.mime_type),
                Ok(Err(err)) => {
                    tracing::warn!(hash = %hash.short(), error = %err, "resource encode failed");
                    inner.settle_failure(hash, ResourceError::EncodeFailed(err.to_string()));
                }
                Err(_) => {
                    tracing::warn!(hash = %hash.short(), "resource encode timed out");
                    inner.settle_failure(hash, ResourceError::Timeout);
                }
            }
        });
    }
}

impl CacheInner {
    fn settle_success(&self, hash: ContentHash, bytes: Vec<u8>, mime_type: String) {
        let descriptor = Arc::new(ResourceDescriptor::with_hash(hash, bytes, mime_type));
        let size = descriptor.byte_size();

        let mut guard = self.state.lock();
        let state = &mut *guard;
        match state.slots.remove(&hash) {
            Some(Slot::Pending { waiters }) => {
                state.clock += 1;
                let now = state.clock;
                let mut refs = 0u64;
                for waiter in waiters {
                    // A dropped waiter takes no reference.
                    if waiter.send(Ok(Arc::clone(&descriptor))).is_ok() {
                        refs += 1;
                    }
                }
                state.slots.insert(
                    hash,
                    Slot::Resolved {
                        descriptor,
                        ref_count: refs,
                        last_used: now,
                    },
                );
                state.total_bytes += size;
                Self::evict_over_budget(state, self.config.max_total_bytes);
            }
            Some(other) => {
                state.slots.insert(hash, other);
            }
            None => {}
        }
    }

    fn settle_failure(&self, hash: ContentHash, error: ResourceError) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        match state.slots.remove(&hash) {
            Some(Slot::Pending { waiters }) => {
                state.stats.failed_encodes += 1;
                for waiter in waiters {
                    let _ = waiter.send(Err(error.clone()));
                }
            }
            Some(other) => {
                state.slots.insert(hash, other);
            }
            None => {}
        }
    }

    /// Evict refcount-zero entries, oldest first, until within budget
    ///
    /// Entries with live references are never removed; if everything is
    /// pinned the cache may stay over budget.
    fn evict_over_budget(state: &mut CacheState, budget: u64) {
        while state.total_bytes > budget {
            let victim = state
                .slots
                .iter()
                .filter_map(|(hash, slot)| match slot {
                    Slot::Resolved {
                        ref_count: 0,
                        last_used,
                        descriptor,
                    } => Some((*last_used, *hash, descriptor.byte_size())),
                    _ => None,
                })
                .min();
            let Some((_, hash, size)) = victim else {
                break;
            };
            state.slots.remove(&hash);
            state.total_bytes -= size;
            state.stats.evictions += 1;
            tracing::debug!(hash = %hash.short(), bytes = size, "evicted resource");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::{EncodeError, PassthroughEncoder};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingEncoder {
        calls: AtomicUsize,
        delay: Duration,
    }

    impl CountingEncoder {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay,
            })
        }
    }

    #[async_trait]
    impl ResourceEncoder for CountingEncoder {
        async fn encode(&self, raw: &RawResource) -> Result<Vec<u8>, EncodeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(raw.bytes.clone())
        }
    }

    struct FailingEncoder;

    #[async_trait]
    impl ResourceEncoder for FailingEncoder {
        async fn encode(&self, _raw: &RawResource) -> Result<Vec<u8>, EncodeError> {
            Err(EncodeError::new("corrupt bitmap"))
        }
    }

    struct StalledEncoder;

    #[async_trait]
    impl ResourceEncoder for StalledEncoder {
        async fn encode(&self, _raw: &RawResource) -> Result<Vec<u8>, EncodeError> {
            std::future::pending().await
        }
    }

    fn raw(payload: &[u8]) -> RawResource {
        RawResource::new(payload.to_vec(), "image/webp")
    }

    fn cache_with(encoder: Arc<dyn ResourceEncoder>) -> ResourceCache {
        ResourceCache::new(CacheConfig::default(), encoder)
    }

    async fn settle(cache: &ResourceCache, payload: &[u8]) -> Arc<ResourceDescriptor> {
        let resource = raw(payload);
        let hash = resource.content_hash();
        match cache.resolve(hash, || Some(resource)) {
            Resolution::Pending(token) => token.wait().await.unwrap(),
            Resolution::Hit(descriptor) => descriptor,
        }
    }

    #[tokio::test]
    async fn miss_then_hit() {
        let cache = cache_with(Arc::new(PassthroughEncoder));
        let descriptor = settle(&cache, b"pixels").await;
        let hash = descriptor.content_hash;

        match cache.resolve(hash, || None) {
            Resolution::Hit(hit) => assert_eq!(hit, descriptor),
            Resolution::Pending(_) => panic!("expected a hit after settle"),
        }
        assert_eq!(cache.ref_count(hash), Some(2));
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn concurrent_requests_share_one_encode() {
        let encoder = CountingEncoder::new(Duration::from_millis(20));
        let cache = cache_with(encoder.clone());
        let resource = raw(b"shared pixels");
        let hash = resource.content_hash();

        let first = cache.resolve(hash, || Some(resource.clone()));
        let second = cache.resolve(hash, || Some(resource.clone()));
        let third = cache.resolve(hash, || Some(resource));

        for resolution in [first, second, third] {
            match resolution {
                Resolution::Pending(token) => {
                    let descriptor = token.wait().await.unwrap();
                    assert_eq!(descriptor.content_hash, hash);
                }
                Resolution::Hit(_) => panic!("encode should still be in flight"),
            }
        }
        assert_eq!(encoder.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.ref_count(hash), Some(3));
    }

    #[tokio::test]
    async fn missing_payload_fails_fast() {
        let cache = cache_with(Arc::new(PassthroughEncoder));
        let hash = ContentHash::digest(b"never supplied");

        let Resolution::Pending(token) = cache.resolve(hash, || None) else {
            panic!("unknown hash cannot hit");
        };
        assert_eq!(token.wait().await, Err(ResourceError::MissingPayload(hash)));
        assert!(!cache.contains(hash));
        assert_eq!(cache.stats().failed_encodes, 1);
    }

    #[tokio::test]
    async fn encode_failure_releases_reservation() {
        let cache = cache_with(Arc::new(FailingEncoder));
        let resource = raw(b"bad pixels");
        let hash = resource.content_hash();

        let Resolution::Pending(token) = cache.resolve(hash, || Some(resource.clone())) else {
            panic!("first resolve must miss");
        };
        assert!(matches!(token.wait().await, Err(ResourceError::EncodeFailed(_))));

        // Reservation is gone: a later resolve attempts a fresh encode.
        assert!(matches!(
            cache.resolve(hash, || Some(resource)),
            Resolution::Pending(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_encode_times_out() {
        let config = CacheConfig {
            encode_timeout: Duration::from_millis(500),
            ..CacheConfig::default()
        };
        let cache = ResourceCache::new(config, Arc::new(StalledEncoder));
        let resource = raw(b"stuck pixels");
        let hash = resource.content_hash();

        let Resolution::Pending(token) = cache.resolve(hash, || Some(resource)) else {
            panic!("first resolve must miss");
        };
        assert_eq!(token.wait().await, Err(ResourceError::Timeout));
        assert_eq!(cache.stats().failed_encodes, 1);
    }

    #[tokio::test]
    async fn lru_eviction_skips_referenced_entries() {
        let config = CacheConfig {
            max_total_bytes: 10,
            ..CacheConfig::default()
        };
        let cache = ResourceCache::new(config, Arc::new(PassthroughEncoder));

        let pinned = settle(&cache, &[1u8; 6]).await;
        let idle = settle(&cache, &[2u8; 6]).await;
        cache.release(idle.content_hash);

        // 12 bytes cached against a 10-byte budget; only the idle entry
        // may go.
        let over = settle(&cache, &[3u8; 6]).await;
        assert!(cache.contains(pinned.content_hash));
        assert!(cache.contains(over.content_hash));
        assert!(!cache.contains(idle.content_hash));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test]
    async fn eviction_prefers_least_recently_used() {
        let config = CacheConfig {
            max_total_bytes: 12,
            ..CacheConfig::default()
        };
        let cache = ResourceCache::new(config, Arc::new(PassthroughEncoder));

        let first = settle(&cache, &[1u8; 4]).await;
        let second = settle(&cache, &[2u8; 4]).await;
        cache.release(first.content_hash);
        cache.release(second.content_hash);

        // Touch `first` so `second` is the oldest idle entry.
        let Resolution::Hit(_) = cache.resolve(first.content_hash, || None) else {
            panic!("expected hit");
        };
        cache.release(first.content_hash);

        let _third = settle(&cache, &[3u8; 8]).await;
        assert!(cache.contains(first.content_hash));
        assert!(!cache.contains(second.content_hash));
    }

    #[tokio::test]
    async fn pinned_entries_survive_concurrent_churn() {
        let config = CacheConfig {
            max_total_bytes: 64,
            ..CacheConfig::default()
        };
        let cache = ResourceCache::new(config, Arc::new(PassthroughEncoder));

        let mut handles = Vec::new();
        for worker in 0u8..8 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                for round in 0u8..40 {
                    let payload = vec![worker % 4; 32];
                    let resource = RawResource::new(payload, "image/webp");
                    let hash = resource.content_hash();
                    let descriptor = match cache.resolve(hash, || Some(resource)) {
                        Resolution::Hit(d) => d,
                        Resolution::Pending(token) => token.wait().await.unwrap(),
                    };
                    // While this task holds a reference, the entry must
                    // remain cached.
                    assert!(cache.ref_count(descriptor.content_hash).unwrap_or(0) >= 1);
                    if round % 3 == 0 {
                        tokio::task::yield_now().await;
                    }
                    cache.release(hash);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(cache.stats().failed_encodes == 0);
    }
}
