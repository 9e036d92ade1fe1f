//! Record sink seam
//!
//! The pipeline ends at a [`RecordSink`]: production wires in persistence
//! or an uploader, tests use [`MemorySink`]. Delivery runs on a dedicated
//! emitter task, so a slow sink never blocks record merging.

use crate::error::SinkError;
use async_trait::async_trait;
use parking_lot::Mutex;
use replay_model::ResolvedRecord;
use std::sync::Arc;
use tokio::sync::Notify;

/// Receives fully resolved records in strictly ascending sequence order
#[async_trait]
pub trait RecordSink: Send + Sync + 'static {
    /// Deliver one record
    ///
    /// # Errors
    /// A delivery failure is logged by the emitter and the stream
    /// continues with the next record.
    async fn deliver(&self, record: ResolvedRecord) -> Result<(), SinkError>;
}

/// Sink that collects records in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<ResolvedRecord>>,
    arrived: Notify,
}

impl MemorySink {
    /// Create a shared in-memory sink
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Snapshot of everything delivered so far
    #[must_use]
    pub fn records(&self) -> Vec<ResolvedRecord> {
        self.records.lock().clone()
    }

    /// Sequences delivered so far, in delivery order
    #[must_use]
    pub fn sequences(&self) -> Vec<u64> {
        self.records.lock().iter().map(|r| r.sequence).collect()
    }

    /// Wait until at least `count` records have been delivered
    pub async fn wait_for(&self, count: usize) {
        loop {
            let arrived = self.arrived.notified();
            if self.records.lock().len() >= count {
                return;
            }
            arrived.await;
        }
    }
}

#[async_trait]
impl RecordSink for MemorySink {
    async fn deliver(&self, record: ResolvedRecord) -> Result<(), SinkError> {
        self.records.lock().push(record);
        self.arrived.notify_waiters();
        Ok(())
    }
}
