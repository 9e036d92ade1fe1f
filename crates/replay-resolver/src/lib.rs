//! Mutation resolver
//!
//! Compares two captured snapshots (or a snapshot against nothing) and
//! produces the minimal ordered set of element-level operations turning
//! the old tree into the new one.
//!
//! Output is deterministic: operations are grouped as removes, moves,
//! updates, adds. Moves and updates are sorted by element id. Removes
//! follow the previous snapshot's order reversed (child before parent)
//! and adds follow the current snapshot's order (parent before child),
//! so applying the record sequentially never references an element that
//! is not yet present. No hash-map iteration order leaks into the output.

use replay_model::{
    ChangedFields, ContentHash, ElementId, MutationRecord, Operation, Snapshot, VisualElement,
};
use std::collections::{BTreeMap, BTreeSet};

/// Diffs two ordered element lists into a [`MutationRecord`]
///
/// Stateless and pure: the same pair of snapshots always produces an
/// identical record.
#[derive(Debug, Clone, Copy, Default)]
pub struct MutationResolver;

impl MutationResolver {
    /// Create a resolver
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Compute the mutation record turning `previous` into `current`
    ///
    /// A `None` previous snapshot is the first capture: every element of
    /// `current` is emitted as an `Add`, in the snapshot's own root-first
    /// order.
    #[must_use]
    pub fn resolve(&self, previous: Option<&Snapshot>, current: &Snapshot) -> MutationRecord {
        let Some(previous) = previous else {
            return MutationRecord {
                sequence: current.sequence,
                timestamp_ms: current.timestamp_ms,
                operations: current.elements.iter().cloned().map(Operation::Add).collect(),
            };
        };

        let prev_by_id: BTreeMap<ElementId, &VisualElement> =
            previous.elements.iter().map(|e| (e.id, e)).collect();
        let curr_by_id: BTreeMap<ElementId, &VisualElement> =
            current.elements.iter().map(|e| (e.id, e)).collect();

        let mut operations = Vec::new();

        // Removes, child before parent (reverse of root-first order).
        for element in previous.elements.iter().rev() {
            if !curr_by_id.contains_key(&element.id) {
                operations.push(Operation::Remove(element.id));
            }
        }

        // Moves by ascending id.
        for (id, current_element) in &curr_by_id {
            if let Some(prev_element) = prev_by_id.get(id) {
                if prev_element.position() != current_element.position() {
                    operations.push(Operation::Move {
                        id: *id,
                        new_parent: current_element.parent_id,
                        new_sibling_index: current_element.sibling_index,
                    });
                }
            }
        }

        // Updates by ascending id, carrying only the changed fields.
        for (id, current_element) in &curr_by_id {
            if let Some(prev_element) = prev_by_id.get(id) {
                let changes = changed_fields(prev_element, current_element);
                if !changes.is_empty() {
                    operations.push(Operation::Update { id: *id, changes });
                }
            }
        }

        // Adds, parent before child (the current snapshot's own order).
        for element in &current.elements {
            if !prev_by_id.contains_key(&element.id) {
                operations.push(Operation::Add(element.clone()));
            }
        }

        MutationRecord {
            sequence: current.sequence,
            timestamp_ms: current.timestamp_ms,
            operations,
        }
    }
}

/// Content hashes a record newly references
///
/// These are the resources the merge engine must resolve before the
/// record can be emitted: references carried by `Add` operations and
/// references introduced by `Update` operations.
#[must_use]
pub fn referenced_resources(record: &MutationRecord) -> BTreeSet<ContentHash> {
    let mut hashes = BTreeSet::new();
    for operation in &record.operations {
        match operation {
            Operation::Add(element) => {
                if let Some(hash) = element.resource_ref {
                    hashes.insert(hash);
                }
            }
            Operation::Update { changes, .. } => {
                if let Some(Some(hash)) = changes.resource_ref {
                    hashes.insert(hash);
                }
            }
            Operation::Remove(_) | Operation::Move { .. } => {}
        }
    }
    hashes
}

/// Content hashes a record stops referencing, one entry per element
///
/// Covers elements removed outright and updates that swap or clear a
/// reference. The caller releases each returned hash against the cache.
#[must_use]
pub fn released_resources(baseline: &Snapshot, record: &MutationRecord) -> Vec<ContentHash> {
    let prev_by_id: BTreeMap<ElementId, &VisualElement> =
        baseline.elements.iter().map(|e| (e.id, e)).collect();

    let mut released = Vec::new();
    for operation in &record.operations {
        match operation {
            Operation::Remove(id) => {
                if let Some(hash) = prev_by_id.get(id).and_then(|e| e.resource_ref) {
                    released.push(hash);
                }
            }
            Operation::Update { id, changes } => {
                if changes.resource_ref.is_some() {
                    if let Some(hash) = prev_by_id.get(id).and_then(|e| e.resource_ref) {
                        released.push(hash);
                    }
                }
            }
            Operation::Add(_) | Operation::Move { .. } => {}
        }
    }
    released
}

fn changed_fields(prev: &VisualElement, current: &VisualElement) -> ChangedFields {
    let mut changes = ChangedFields::default();
    if prev.kind != current.kind {
        // Stable ids are expected to keep their kind; reflect the change
        // anyway so the emitted record reproduces the new tree.
        tracing::warn!(
            id = %current.id,
            previous = ?prev.kind,
            current = ?current.kind,
            "element changed kind between snapshots"
        );
        changes.kind = Some(current.kind);
    }
    if prev.bounds != current.bounds {
        changes.bounds = Some(current.bounds);
    }
    if prev.style != current.style {
        changes.style = Some(current.style.clone());
    }
    if prev.resource_ref != current.resource_ref {
        changes.resource_ref = Some(current.resource_ref);
    }
    changes
}
