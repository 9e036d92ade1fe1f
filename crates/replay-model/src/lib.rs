//! Session-replay data model
//!
//! Immutable data describing captured frames and the change records
//! derived from them.
//!
//! # Core Concepts
//!
//! - [`VisualElement`]: one on-screen element, flattened (parent/child as data)
//! - [`Snapshot`]: one captured frame, a root-first ordered element list
//! - [`MutationRecord`] / [`Operation`]: minimal diff between two snapshots
//! - [`ContentHash`]: Blake3 digest content-addressing binary resources
//! - [`ResourceDescriptor`]: an encoded resource shared across records

mod element;
mod hash;
mod record;
mod resource;
mod snapshot;

pub use element::{Bounds, ElementId, ElementKind, StyleMap, VisualElement};
pub use hash::{ContentHash, HashError};
pub use record::{ApplyError, ChangedFields, MutationRecord, Operation};
pub use resource::{RawResource, ResolvedRecord, ResourceDescriptor};
pub use snapshot::{Snapshot, SnapshotError};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
