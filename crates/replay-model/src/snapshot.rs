//! Captured frames
//!
//! A [`Snapshot`] is one capture tick: a flat, root-first ordered list of
//! visual elements plus the sequence number and capture timestamp assigned
//! by the trigger.

use crate::element::{ElementId, ElementKind, VisualElement};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

/// One captured frame
///
/// Element order is root-first: every `parent_id` refers to an element
/// that appears earlier in the list. The traversal collaborator guarantees
/// this; [`Snapshot::validate`] re-checks it at the pipeline boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Monotonically increasing capture order
    pub sequence: u64,
    /// Capture wall-clock time, milliseconds since epoch
    pub timestamp_ms: u64,
    /// Elements in root-first order
    pub elements: Vec<VisualElement>,
}

impl Snapshot {
    /// Create a snapshot from pre-ordered elements
    #[must_use]
    pub fn new(sequence: u64, timestamp_ms: u64, elements: Vec<VisualElement>) -> Self {
        Self {
            sequence,
            timestamp_ms,
            elements,
        }
    }

    /// Check the snapshot invariants
    ///
    /// - element ids are unique
    /// - every `parent_id` refers to an element appearing earlier in the list
    /// - only `Image` elements carry a `resource_ref`
    ///
    /// # Errors
    /// Returns the first violated invariant.
    pub fn validate(&self) -> Result<(), SnapshotError> {
        let mut seen: HashSet<ElementId> = HashSet::with_capacity(self.elements.len());
        for element in &self.elements {
            if !seen.insert(element.id) {
                return Err(SnapshotError::DuplicateId(element.id));
            }
            if let Some(parent) = element.parent_id {
                if !seen.contains(&parent) {
                    return Err(SnapshotError::UnknownParent {
                        child: element.id,
                        parent,
                    });
                }
            }
            if element.resource_ref.is_some() && element.kind != ElementKind::Image {
                return Err(SnapshotError::ResourceOnNonImage(element.id));
            }
        }
        Ok(())
    }

    /// Look up an element by id
    #[must_use]
    pub fn get(&self, id: ElementId) -> Option<&VisualElement> {
        self.elements.iter().find(|e| e.id == id)
    }

    /// Index elements by id
    #[must_use]
    pub fn by_id(&self) -> HashMap<ElementId, &VisualElement> {
        self.elements.iter().map(|e| (e.id, e)).collect()
    }

    /// Elements as an id-keyed arena
    #[must_use]
    pub fn to_arena(&self) -> BTreeMap<ElementId, VisualElement> {
        self.elements.iter().map(|e| (e.id, e.clone())).collect()
    }

    /// Rebuild a snapshot from an arena in canonical order
    ///
    /// Canonical order is a depth-first walk from the roots, siblings
    /// ordered by `(sibling_index, id)`. Elements whose parent is missing
    /// from the arena are skipped; callers validate totality separately.
    #[must_use]
    pub fn from_arena(
        sequence: u64,
        timestamp_ms: u64,
        arena: &BTreeMap<ElementId, VisualElement>,
    ) -> Self {
        let mut children: BTreeMap<Option<ElementId>, Vec<&VisualElement>> = BTreeMap::new();
        for element in arena.values() {
            children.entry(element.parent_id).or_default().push(element);
        }
        for siblings in children.values_mut() {
            siblings.sort_by_key(|e| (e.sibling_index, e.id));
        }

        let mut elements = Vec::with_capacity(arena.len());
        let mut stack: Vec<&VisualElement> = children.get(&None).into_iter().flatten().rev().copied().collect();
        while let Some(element) = stack.pop() {
            elements.push(element.clone());
            if let Some(kids) = children.get(&Some(element.id)) {
                stack.extend(kids.iter().rev().copied());
            }
        }
        Self::new(sequence, timestamp_ms, elements)
    }

    /// The same snapshot with elements in canonical depth-first order
    #[must_use]
    pub fn canonical(&self) -> Self {
        Self::from_arena(self.sequence, self.timestamp_ms, &self.to_arena())
    }

    /// Number of captured elements
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// Whether the frame is empty
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
}

/// Snapshot invariant violations
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    /// The same element id appears twice
    #[error("duplicate element id {0}")]
    DuplicateId(ElementId),

    /// A child references a parent that does not appear earlier in the list
    #[error("element {child} references parent {parent} which does not precede it")]
    UnknownParent {
        /// Element carrying the reference
        child: ElementId,
        /// Referenced parent id
        parent: ElementId,
    },

    /// A non-image element carries a resource reference
    #[error("element {0} carries a resource reference but is not an image")]
    ResourceOnNonImage(ElementId),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::Bounds;
    use crate::hash::ContentHash;
    use pretty_assertions::assert_eq;

    fn shape(id: u64) -> VisualElement {
        VisualElement::new(ElementId(id), ElementKind::Shape, Bounds::new(0, 0, 10, 10))
    }

    #[test]
    fn validate_accepts_root_first_order() {
        let snapshot = Snapshot::new(
            1,
            0,
            vec![
                shape(1),
                shape(2).with_parent(ElementId(1), 0),
                shape(3).with_parent(ElementId(1), 1),
            ],
        );
        assert!(snapshot.validate().is_ok());
    }

    #[test]
    fn validate_rejects_duplicate_id() {
        let snapshot = Snapshot::new(1, 0, vec![shape(1), shape(1)]);
        assert!(matches!(
            snapshot.validate(),
            Err(SnapshotError::DuplicateId(ElementId(1)))
        ));
    }

    #[test]
    fn validate_rejects_forward_parent_reference() {
        let snapshot = Snapshot::new(1, 0, vec![shape(2).with_parent(ElementId(1), 0), shape(1)]);
        assert!(matches!(
            snapshot.validate(),
            Err(SnapshotError::UnknownParent { child: ElementId(2), parent: ElementId(1) })
        ));
    }

    #[test]
    fn validate_rejects_resource_on_shape() {
        let element = shape(1).with_resource(ContentHash::digest(b"x"));
        let snapshot = Snapshot::new(1, 0, vec![element]);
        assert!(matches!(
            snapshot.validate(),
            Err(SnapshotError::ResourceOnNonImage(ElementId(1)))
        ));
    }

    #[test]
    fn canonical_orders_siblings_by_index() {
        let snapshot = Snapshot::new(
            1,
            0,
            vec![
                shape(1),
                shape(3).with_parent(ElementId(1), 1),
                shape(2).with_parent(ElementId(1), 0),
            ],
        );
        let canonical = snapshot.canonical();
        let ids: Vec<u64> = canonical.elements.iter().map(|e| e.id.0).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(canonical.validate().is_ok());
    }

    #[test]
    fn canonical_walks_depth_first() {
        let snapshot = Snapshot::new(
            1,
            0,
            vec![
                shape(1),
                shape(4),
                shape(2).with_parent(ElementId(1), 0),
                shape(3).with_parent(ElementId(2), 0),
            ],
        );
        let ids: Vec<u64> = snapshot.canonical().elements.iter().map(|e| e.id.0).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
    }
}
