//! Record merge queue
//!
//! Mutation records arrive in capture order but their resources settle in
//! arbitrary order. Each admitted sequence moves through a small state
//! machine: awaiting resources while any pending token is outstanding,
//! ready once all settled, emitted only when every earlier sequence has
//! been emitted first. Emission order toward the sink is therefore
//! strictly ascending regardless of encode interleaving.
//!
//! The pending map sits behind one `parking_lot` mutex; sink I/O runs on
//! a separate emitter task fed through an mpsc channel so the critical
//! section never awaits.

use crate::error::QueueError;
use crate::sink::RecordSink;
use parking_lot::Mutex;
use replay_cache::{PendingToken, ResourceCache, ResourceError};
use replay_model::{
    ContentHash, ElementId, ElementKind, MutationRecord, Operation, ResolvedRecord,
    ResourceDescriptor,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// One admitted sequence waiting for its resources
struct PendingRecord {
    mutation: MutationRecord,
    /// Unsettled resolutions per hash; empty means ready
    outstanding: BTreeMap<ContentHash, u32>,
    /// Successfully settled descriptors, keyed for hash-ordered emission
    resources: BTreeMap<ContentHash, Arc<ResourceDescriptor>>,
    /// Hashes whose encode failed; their elements degrade to placeholders
    failed: BTreeSet<ContentHash>,
}

impl PendingRecord {
    fn is_ready(&self) -> bool {
        self.outstanding.is_empty()
    }
}

struct QueueState {
    pending: BTreeMap<u64, PendingRecord>,
    last_accepted: Option<u64>,
    shutting_down: bool,
    /// Taken on shutdown; a missing sender drops ready records silently
    emit_tx: Option<mpsc::UnboundedSender<ResolvedRecord>>,
    /// Elements degraded by a resource failure, awaiting baseline
    /// reconciliation by the owning pipeline
    degraded: Vec<(ElementId, ContentHash)>,
}

struct QueueInner {
    state: Mutex<QueueState>,
    saturated_tx: watch::Sender<bool>,
    max_pending: usize,
    cache: ResourceCache,
}

/// Sequence-ordered merge queue in front of a [`RecordSink`]
///
/// Cheap to clone; clones share the queue. Construct within a tokio
/// runtime, the emitter task is spawned immediately.
#[derive(Clone)]
pub struct RecordQueue {
    inner: Arc<QueueInner>,
}

impl RecordQueue {
    /// Create a queue delivering to `sink`
    #[must_use]
    pub fn new(max_pending: usize, cache: ResourceCache, sink: Arc<dyn RecordSink>) -> Self {
        let (emit_tx, mut emit_rx) = mpsc::unbounded_channel::<ResolvedRecord>();
        tokio::spawn(async move {
            while let Some(record) = emit_rx.recv().await {
                let sequence = record.sequence;
                if let Err(err) = sink.deliver(record).await {
                    tracing::warn!(sequence, error = %err, "sink rejected record");
                }
            }
            tracing::debug!("record emitter stopped");
        });

        let (saturated_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState {
                    pending: BTreeMap::new(),
                    last_accepted: None,
                    shutting_down: false,
                    emit_tx: Some(emit_tx),
                    degraded: Vec::new(),
                }),
                saturated_tx,
                max_pending,
                cache,
            }),
        }
    }

    /// Admit a record together with its resolved and in-flight resources
    ///
    /// `hits` carry one descriptor per already-cached occurrence; each
    /// `pending` token is awaited on its own task and reported back. The
    /// record emits once every token settles and all earlier sequences
    /// have emitted. Tokens of a rejected record are dropped, which
    /// abandons their waits without taking cache references.
    ///
    /// # Errors
    /// Rejects on shutdown, non-advancing sequence numbers, and queue
    /// saturation.
    pub fn enqueue(
        &self,
        mutation: MutationRecord,
        hits: Vec<Arc<ResourceDescriptor>>,
        pending: Vec<PendingToken>,
    ) -> Result<(), QueueError> {
        let sequence = mutation.sequence;
        {
            let mut state = self.inner.state.lock();
            if state.shutting_down {
                return Err(QueueError::ShuttingDown);
            }
            if let Some(last_accepted) = state.last_accepted {
                if sequence <= last_accepted {
                    tracing::warn!(sequence, last_accepted, "dropping non-advancing capture");
                    return Err(QueueError::SequenceRegression {
                        sequence,
                        last_accepted,
                    });
                }
            }
            if state.pending.len() >= self.inner.max_pending {
                return Err(QueueError::Backpressure {
                    pending: state.pending.len(),
                });
            }

            state.last_accepted = Some(sequence);
            let mut record = PendingRecord {
                mutation,
                outstanding: BTreeMap::new(),
                resources: BTreeMap::new(),
                failed: BTreeSet::new(),
            };
            for descriptor in hits {
                record.resources.insert(descriptor.content_hash, descriptor);
            }
            for token in &pending {
                *record.outstanding.entry(token.content_hash()).or_insert(0) += 1;
            }
            tracing::debug!(
                sequence,
                outstanding = pending.len(),
                "record admitted"
            );
            state.pending.insert(sequence, record);
            self.refresh_saturation(&state);
        }

        for token in pending {
            let queue = self.clone();
            tokio::spawn(async move {
                let hash = token.content_hash();
                let outcome = token.wait().await;
                queue.complete_resource(sequence, hash, outcome);
            });
        }
        self.try_emit();
        Ok(())
    }

    /// Whether the queue is currently refusing new sequences
    #[must_use]
    pub fn is_saturated(&self) -> bool {
        *self.inner.saturated_tx.borrow()
    }

    /// Watch the saturation flag, e.g. to pause the capture trigger
    #[must_use]
    pub fn saturation_watch(&self) -> watch::Receiver<bool> {
        self.inner.saturated_tx.subscribe()
    }

    /// Sequences admitted but not yet emitted
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    /// Discard all pending sequences and stop the emitter
    ///
    /// Nothing partial is emitted; cache references already taken by
    /// discarded records are released by the owning pipeline via its
    /// baseline teardown.
    pub fn shutdown(&self) {
        let mut state = self.inner.state.lock();
        state.shutting_down = true;
        state.emit_tx = None;
        let discarded = state.pending.len();
        state.pending.clear();
        self.refresh_saturation(&state);
        if discarded > 0 {
            tracing::info!(discarded, "record queue shut down with pending sequences");
        }
    }

    /// Elements whose resource failed since the last call
    ///
    /// The pipeline drains this on every tick and mirrors the placeholder
    /// degradation into its committed baseline, so a failed reference is
    /// never released against a reference some later element acquired.
    #[must_use]
    pub fn take_degraded(&self) -> Vec<(ElementId, ContentHash)> {
        std::mem::take(&mut self.inner.state.lock().degraded)
    }

    /// Record the outcome of one awaited resolution
    fn complete_resource(
        &self,
        sequence: u64,
        hash: ContentHash,
        outcome: Result<Arc<ResourceDescriptor>, ResourceError>,
    ) {
        {
            let mut state = self.inner.state.lock();
            let mut affected = Vec::new();
            {
                let Some(record) = state.pending.get_mut(&sequence) else {
                    // The record was discarded at shutdown; give back the
                    // reference this delivery took.
                    drop(state);
                    if outcome.is_ok() {
                        self.inner.cache.release(hash);
                    }
                    return;
                };

                if let Some(count) = record.outstanding.get_mut(&hash) {
                    *count -= 1;
                    if *count == 0 {
                        record.outstanding.remove(&hash);
                    }
                }
                match outcome {
                    Ok(descriptor) => {
                        record.resources.insert(hash, descriptor);
                    }
                    Err(err) => {
                        tracing::warn!(
                            sequence,
                            hash = %hash.short(),
                            error = %err,
                            "resource failed; element degrades to placeholder"
                        );
                        record.failed.insert(hash);
                        affected = degraded_targets(&record.mutation, hash);
                    }
                }
            }
            state
                .degraded
                .extend(affected.into_iter().map(|id| (id, hash)));
        }
        self.try_emit();
    }

    /// Drain ready records from the front of the pending map
    ///
    /// Draining and forwarding stay in one critical section: two racing
    /// callers could otherwise each drain a batch and interleave their
    /// sends, reordering the stream. The channel is unbounded, so the
    /// send never blocks under the lock.
    fn try_emit(&self) {
        let mut state = self.inner.state.lock();
        while let Some(entry) = state.pending.first_entry() {
            if !entry.get().is_ready() {
                break;
            }
            let (_, record) = entry.remove_entry();
            let resolved = finalize(record);
            tracing::debug!(
                sequence = resolved.sequence,
                resources = resolved.resources.len(),
                "record emitted"
            );
            if let Some(emit_tx) = &state.emit_tx {
                if emit_tx.send(resolved).is_err() {
                    tracing::warn!("record emitter is gone; dropping record");
                }
            }
        }
        self.refresh_saturation(&state);
    }

    fn refresh_saturation(&self, state: &QueueState) {
        let saturated = !state.shutting_down && state.pending.len() >= self.inner.max_pending;
        self.inner.saturated_tx.send_if_modified(|current| {
            let changed = *current != saturated;
            *current = saturated;
            changed
        });
    }
}

/// Elements in a record that introduced the given hash
fn degraded_targets(mutation: &MutationRecord, hash: ContentHash) -> Vec<ElementId> {
    mutation
        .operations
        .iter()
        .filter_map(|operation| match operation {
            Operation::Add(element) if element.resource_ref == Some(hash) => Some(element.id),
            Operation::Update { id, changes } if changes.resource_ref == Some(Some(hash)) => {
                Some(*id)
            }
            _ => None,
        })
        .collect()
}

/// Turn a ready record into its emitted form
///
/// Operations referencing a failed hash are rewritten in place: an added
/// element becomes a placeholder without a reference, an update that
/// introduced the hash now clears the reference and degrades the kind.
fn finalize(record: PendingRecord) -> ResolvedRecord {
    let PendingRecord {
        mut mutation,
        resources,
        failed,
        ..
    } = record;

    if !failed.is_empty() {
        for operation in &mut mutation.operations {
            match operation {
                Operation::Add(element) => {
                    if element.resource_ref.is_some_and(|hash| failed.contains(&hash)) {
                        element.kind = ElementKind::Placeholder;
                        element.resource_ref = None;
                    }
                }
                Operation::Update { changes, .. } => {
                    if let Some(Some(hash)) = changes.resource_ref {
                        if failed.contains(&hash) {
                            changes.kind = Some(ElementKind::Placeholder);
                            changes.resource_ref = Some(None);
                        }
                    }
                }
                Operation::Remove(_) | Operation::Move { .. } => {}
            }
        }
    }

    ResolvedRecord {
        sequence: mutation.sequence,
        timestamp_ms: mutation.timestamp_ms,
        resources: resources.into_values().collect(),
        mutation,
    }
}
