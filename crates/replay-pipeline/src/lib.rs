//! Record merging and the capture pipeline facade
//!
//! The last stage of session-replay capture: mutation records whose
//! resources resolve asynchronously are merged back into a single
//! stream, emitted to a [`RecordSink`] in strictly ascending sequence
//! order. [`CapturePipeline`] is the entry point the capture trigger
//! drives; [`RecordQueue`] is the merge engine underneath it.

mod config;
mod error;
mod pipeline;
mod queue;
mod sink;

pub use config::PipelineConfig;
pub use error::{CaptureError, QueueError, SinkError};
pub use pipeline::CapturePipeline;
pub use queue::RecordQueue;
pub use sink::{MemorySink, RecordSink};
