//! Capture pipeline facade
//!
//! Wires the resolver, cache and merge queue together behind one entry
//! point. The external capture trigger calls [`CapturePipeline::handle_capture`]
//! once per tick, from a single thread; everything slow (encoding, sink
//! I/O) happens on tokio tasks behind the cache and queue.

use crate::config::PipelineConfig;
use crate::error::{CaptureError, QueueError};
use crate::queue::RecordQueue;
use crate::sink::RecordSink;
use parking_lot::Mutex;
use replay_cache::{Resolution, ResourceCache, ResourceEncoder};
use replay_model::{ContentHash, ElementKind, Operation, RawResource, Snapshot};
use replay_resolver::{released_resources, MutationResolver};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

/// The capture-and-delivery pipeline
///
/// Owns its cache and queue explicitly; dropping the pipeline (after
/// [`shutdown`](Self::shutdown)) tears everything down. Construct within
/// a tokio runtime.
pub struct CapturePipeline {
    resolver: MutationResolver,
    cache: ResourceCache,
    queue: RecordQueue,
    /// Last committed snapshot; the diff baseline for the next tick
    baseline: Mutex<Option<Snapshot>>,
}

impl CapturePipeline {
    /// Create a pipeline delivering resolved records to `sink`
    #[must_use]
    pub fn new(
        config: PipelineConfig,
        encoder: Arc<dyn ResourceEncoder>,
        sink: Arc<dyn RecordSink>,
    ) -> Self {
        let cache = ResourceCache::new(config.cache, encoder);
        let queue = RecordQueue::new(config.max_pending_sequences, cache.clone(), sink);
        Self {
            resolver: MutationResolver::new(),
            cache,
            queue,
            baseline: Mutex::new(None),
        }
    }

    /// Process one capture tick
    ///
    /// Validates the snapshot, diffs it against the committed baseline,
    /// resolves every newly referenced resource against the cache
    /// (`payloads` supplies raw bytes for hashes seen for the first time)
    /// and admits the record to the merge queue. The baseline is committed
    /// only for accepted ticks; a rejected tick leaves the pipeline
    /// exactly as it was.
    ///
    /// # Errors
    /// Returns the rejection reason for this tick. The pipeline stays
    /// healthy and the next tick is processed normally.
    pub fn handle_capture(
        &self,
        snapshot: Snapshot,
        mut payloads: HashMap<ContentHash, RawResource>,
    ) -> Result<(), CaptureError> {
        snapshot.validate()?;

        let mut baseline = self.baseline.lock();
        self.reconcile_degraded(&mut baseline);
        if let Some(previous) = baseline.as_ref() {
            if snapshot.sequence <= previous.sequence {
                tracing::warn!(
                    sequence = snapshot.sequence,
                    last_accepted = previous.sequence,
                    "dropping non-advancing capture"
                );
                return Err(QueueError::SequenceRegression {
                    sequence: snapshot.sequence,
                    last_accepted: previous.sequence,
                }
                .into());
            }
        }
        if self.queue.is_saturated() {
            return Err(QueueError::Backpressure {
                pending: self.queue.pending_len(),
            }
            .into());
        }

        let record = self.resolver.resolve(baseline.as_ref(), &snapshot);
        let released = baseline
            .as_ref()
            .map(|previous| released_resources(previous, &record))
            .unwrap_or_default();

        // One cache reference per introduced occurrence. The payload
        // provider only runs for a hash's first-ever miss.
        let mut hits = Vec::new();
        let mut pending = Vec::new();
        for operation in &record.operations {
            let introduced = match operation {
                Operation::Add(element) => element.resource_ref,
                Operation::Update { changes, .. } => changes.resource_ref.flatten(),
                Operation::Remove(_) | Operation::Move { .. } => None,
            };
            let Some(hash) = introduced else {
                continue;
            };
            match self.cache.resolve(hash, || payloads.remove(&hash)) {
                Resolution::Hit(descriptor) => hits.push(descriptor),
                Resolution::Pending(token) => pending.push(token),
            }
        }

        let hit_hashes: Vec<ContentHash> = hits.iter().map(|d| d.content_hash).collect();
        match self.queue.enqueue(record, hits, pending) {
            Ok(()) => {
                for hash in released {
                    self.cache.release(hash);
                }
                *baseline = Some(snapshot);
                Ok(())
            }
            Err(err) => {
                // Undo the hit references; dropped tokens never took any.
                for hash in hit_hashes {
                    self.cache.release(hash);
                }
                Err(err.into())
            }
        }
    }

    /// Stop accepting captures and release held resources
    ///
    /// Pending sequences are discarded without emission; cache references
    /// held by the committed baseline are released. Idempotent.
    pub fn shutdown(&self) {
        self.queue.shutdown();
        let mut baseline = self.baseline.lock();
        self.reconcile_degraded(&mut baseline);
        if let Some(snapshot) = baseline.take() {
            for element in &snapshot.elements {
                if let Some(hash) = element.resource_ref {
                    self.cache.release(hash);
                }
            }
            tracing::info!(
                sequence = snapshot.sequence,
                "pipeline shut down; baseline released"
            );
        }
    }

    /// Mirror resource-failure degradations into the committed baseline
    ///
    /// An element whose encode failed holds no cache reference, and its
    /// emitted form is a placeholder. The baseline must agree: with the
    /// reference cleared, removing the element later releases nothing,
    /// and a snapshot that still shows the resource diffs as a fresh
    /// introduction, retrying the encode.
    fn reconcile_degraded(&self, baseline: &mut Option<Snapshot>) {
        let degraded = self.queue.take_degraded();
        if degraded.is_empty() {
            return;
        }
        let Some(snapshot) = baseline.as_mut() else {
            return;
        };
        for (id, hash) in degraded {
            let Some(element) = snapshot.elements.iter_mut().find(|e| e.id == id) else {
                continue;
            };
            if element.resource_ref == Some(hash) {
                element.kind = ElementKind::Placeholder;
                element.resource_ref = None;
            }
        }
    }

    /// The pipeline's resource cache, e.g. for stats inspection
    #[must_use]
    pub fn cache(&self) -> &ResourceCache {
        &self.cache
    }

    /// Whether the merge queue is currently refusing captures
    #[must_use]
    pub fn is_saturated(&self) -> bool {
        self.queue.is_saturated()
    }

    /// Watch queue saturation, e.g. to pause the capture trigger
    #[must_use]
    pub fn saturation_watch(&self) -> watch::Receiver<bool> {
        self.queue.saturation_watch()
    }

    /// Sequence of the committed baseline, if any tick was accepted yet
    #[must_use]
    pub fn baseline_sequence(&self) -> Option<u64> {
        self.baseline.lock().as_ref().map(|s| s.sequence)
    }
}
