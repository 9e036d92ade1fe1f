//! Mutation records
//!
//! A [`MutationRecord`] is the minimal set of element-level operations
//! turning one committed snapshot into the next. Applying the operations
//! in order to the previous tree yields exactly the new tree;
//! [`MutationRecord::apply`] implements that replay and backs the diff
//! correctness tests.

use crate::element::{Bounds, ElementId, ElementKind, StyleMap, VisualElement};
use crate::hash::ContentHash;
use crate::snapshot::Snapshot;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Field-level changes carried by an [`Operation::Update`]
///
/// Only fields that actually differ from the baseline are present.
/// `resource_ref` is doubly optional so "reference cleared" is
/// representable distinctly from "reference unchanged".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangedFields {
    /// Element kind changed (also set when an element degrades to a placeholder)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ElementKind>,
    /// Bounds changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounds: Option<Bounds>,
    /// Style attributes changed (full replacement value)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<StyleMap>,
    /// Resource reference changed; inner `None` clears the reference
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_ref: Option<Option<ContentHash>>,
}

impl ChangedFields {
    /// Whether no field changed
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.kind.is_none()
            && self.bounds.is_none()
            && self.style.is_none()
            && self.resource_ref.is_none()
    }
}

/// One element-level operation within a mutation record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// Element entered the frame
    Add(VisualElement),
    /// Element left the frame
    Remove(ElementId),
    /// Element attributes changed in place
    Update {
        /// Target element
        id: ElementId,
        /// Only the fields that differ
        changes: ChangedFields,
    },
    /// Element moved to a new structural position
    Move {
        /// Target element
        id: ElementId,
        /// New parent, `None` for root level
        new_parent: Option<ElementId>,
        /// New position among siblings
        new_sibling_index: u32,
    },
}

impl Operation {
    /// The element this operation targets
    #[inline]
    #[must_use]
    pub fn target_id(&self) -> ElementId {
        match self {
            Self::Add(element) => element.id,
            Self::Remove(id) | Self::Update { id, .. } | Self::Move { id, .. } => *id,
        }
    }
}

/// Ordered operations turning the previous committed tree into the new one
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationRecord {
    /// Capture order of the snapshot this record produces
    pub sequence: u64,
    /// Capture timestamp of that snapshot
    pub timestamp_ms: u64,
    /// Operations in application order
    pub operations: Vec<Operation>,
}

impl MutationRecord {
    /// Whether the record carries no operations (identical frames)
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Replay the record onto a baseline snapshot
    ///
    /// Operations are applied sequentially to an id-keyed arena built from
    /// the baseline. Parent links are data, so a `Move` or `Add` may name a
    /// parent added later in the same record; totality is checked once all
    /// operations are applied. The result is linearized in canonical
    /// depth-first order.
    ///
    /// # Errors
    /// Returns an error if an operation targets a missing element, adds a
    /// duplicate id, or the final tree has a dangling parent reference.
    pub fn apply(&self, baseline: &Snapshot) -> Result<Snapshot, ApplyError> {
        let mut arena: BTreeMap<ElementId, VisualElement> = baseline.to_arena();

        for operation in &self.operations {
            match operation {
                Operation::Remove(id) => {
                    arena.remove(id).ok_or(ApplyError::MissingElement(*id))?;
                }
                Operation::Move {
                    id,
                    new_parent,
                    new_sibling_index,
                } => {
                    let element =
                        arena.get_mut(id).ok_or(ApplyError::MissingElement(*id))?;
                    element.parent_id = *new_parent;
                    element.sibling_index = *new_sibling_index;
                }
                Operation::Update { id, changes } => {
                    let element =
                        arena.get_mut(id).ok_or(ApplyError::MissingElement(*id))?;
                    if let Some(kind) = changes.kind {
                        element.kind = kind;
                    }
                    if let Some(bounds) = changes.bounds {
                        element.bounds = bounds;
                    }
                    if let Some(style) = &changes.style {
                        element.style = style.clone();
                    }
                    if let Some(resource_ref) = changes.resource_ref {
                        element.resource_ref = resource_ref;
                    }
                }
                Operation::Add(element) => {
                    if arena.insert(element.id, element.clone()).is_some() {
                        return Err(ApplyError::DuplicateElement(element.id));
                    }
                }
            }
        }

        for element in arena.values() {
            if let Some(parent) = element.parent_id {
                if !arena.contains_key(&parent) {
                    return Err(ApplyError::DanglingParent {
                        child: element.id,
                        parent,
                    });
                }
            }
        }

        Ok(Snapshot::from_arena(self.sequence, self.timestamp_ms, &arena))
    }
}

/// Errors from replaying a mutation record
#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    /// Operation targets an element absent from the tree
    #[error("operation targets missing element {0}")]
    MissingElement(ElementId),

    /// `Add` for an id already present
    #[error("element {0} added twice")]
    DuplicateElement(ElementId),

    /// Final tree references a parent that does not exist
    #[error("element {child} references missing parent {parent}")]
    DanglingParent {
        /// Element carrying the reference
        child: ElementId,
        /// Missing parent id
        parent: ElementId,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::Bounds;
    use pretty_assertions::assert_eq;

    fn shape(id: u64) -> VisualElement {
        VisualElement::new(ElementId(id), ElementKind::Shape, Bounds::new(0, 0, 10, 10))
    }

    fn record(operations: Vec<Operation>) -> MutationRecord {
        MutationRecord {
            sequence: 2,
            timestamp_ms: 100,
            operations,
        }
    }

    #[test]
    fn apply_add_remove_update() {
        let baseline = Snapshot::new(1, 0, vec![shape(1), shape(2)]);
        let record = record(vec![
            Operation::Remove(ElementId(2)),
            Operation::Update {
                id: ElementId(1),
                changes: ChangedFields {
                    bounds: Some(Bounds::new(5, 5, 10, 10)),
                    ..ChangedFields::default()
                },
            },
            Operation::Add(shape(3)),
        ]);

        let result = record.apply(&baseline).unwrap();
        let ids: Vec<u64> = result.elements.iter().map(|e| e.id.0).collect();
        assert_eq!(ids, vec![1, 3]);
        assert_eq!(result.get(ElementId(1)).unwrap().bounds, Bounds::new(5, 5, 10, 10));
        assert_eq!(result.sequence, 2);
    }

    #[test]
    fn apply_move_may_reference_parent_added_later() {
        let baseline = Snapshot::new(1, 0, vec![shape(1)]);
        let record = record(vec![
            Operation::Move {
                id: ElementId(1),
                new_parent: Some(ElementId(9)),
                new_sibling_index: 0,
            },
            Operation::Add(shape(9)),
        ]);

        let result = record.apply(&baseline).unwrap();
        let ids: Vec<u64> = result.elements.iter().map(|e| e.id.0).collect();
        assert_eq!(ids, vec![9, 1]);
    }

    #[test]
    fn apply_rejects_missing_target() {
        let baseline = Snapshot::new(1, 0, vec![shape(1)]);
        let record = record(vec![Operation::Remove(ElementId(5))]);
        assert!(matches!(
            record.apply(&baseline),
            Err(ApplyError::MissingElement(ElementId(5)))
        ));
    }

    #[test]
    fn apply_rejects_dangling_parent() {
        let baseline = Snapshot::new(1, 0, vec![shape(1)]);
        let record = record(vec![Operation::Move {
            id: ElementId(1),
            new_parent: Some(ElementId(9)),
            new_sibling_index: 0,
        }]);
        assert!(matches!(
            record.apply(&baseline),
            Err(ApplyError::DanglingParent { child: ElementId(1), parent: ElementId(9) })
        ));
    }

    #[test]
    fn update_clearing_resource_ref() {
        let hash = ContentHash::digest(b"img");
        let image = VisualElement::new(ElementId(1), ElementKind::Image, Bounds::default())
            .with_resource(hash);
        let baseline = Snapshot::new(1, 0, vec![image]);
        let record = record(vec![Operation::Update {
            id: ElementId(1),
            changes: ChangedFields {
                kind: Some(ElementKind::Placeholder),
                resource_ref: Some(None),
                ..ChangedFields::default()
            },
        }]);

        let result = record.apply(&baseline).unwrap();
        let element = result.get(ElementId(1)).unwrap();
        assert_eq!(element.kind, ElementKind::Placeholder);
        assert_eq!(element.resource_ref, None);
    }
}
