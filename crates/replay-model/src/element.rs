//! Visual element descriptors
//!
//! One captured frame is a flat, ordered list of [`VisualElement`]s.
//! Parent/child structure is expressed as data (`parent_id` plus
//! `sibling_index`) rather than pointers, so elements are plain records
//! keyed by a stable id.

use crate::hash::ContentHash;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};

/// Stable element identifier, unique within one snapshot
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ElementId(pub u64);

impl Display for ElementId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What an element renders as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementKind {
    /// Solid shape (backgrounds, dividers, buttons without text)
    Shape,
    /// Text run
    Text,
    /// Bitmap-backed element carrying a resource reference
    Image,
    /// Degraded stand-in when the real content is unavailable or masked
    Placeholder,
    /// Grouping element with no visual content of its own
    Container,
}

/// Element position and size in device-independent units
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Bounds {
    /// Left edge
    pub x: i32,
    /// Top edge
    pub y: i32,
    /// Horizontal extent
    pub width: i32,
    /// Vertical extent
    pub height: i32,
}

impl Bounds {
    /// Create bounds from position and size
    #[inline]
    #[must_use]
    pub const fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self { x, y, width, height }
    }
}

/// Opaque style attributes, compared by value
///
/// A sorted map keeps comparison and serialization deterministic.
pub type StyleMap = BTreeMap<String, String>;

/// One on-screen element as captured by the traversal collaborator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisualElement {
    /// Stable identifier, unique within the snapshot
    pub id: ElementId,
    /// Visual role of the element
    pub kind: ElementKind,
    /// Position and size
    pub bounds: Bounds,
    /// Opaque style attributes
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub style: StyleMap,
    /// Content hash of the backing binary resource (`Image` elements only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_ref: Option<ContentHash>,
    /// Parent element, `None` for roots
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<ElementId>,
    /// Position among siblings under the same parent
    #[serde(default)]
    pub sibling_index: u32,
}

impl VisualElement {
    /// Create a root-level element with empty style
    #[must_use]
    pub fn new(id: ElementId, kind: ElementKind, bounds: Bounds) -> Self {
        Self {
            id,
            kind,
            bounds,
            style: StyleMap::new(),
            resource_ref: None,
            parent_id: None,
            sibling_index: 0,
        }
    }

    /// Attach the element under a parent at the given sibling position
    #[must_use]
    pub fn with_parent(mut self, parent: ElementId, sibling_index: u32) -> Self {
        self.parent_id = Some(parent);
        self.sibling_index = sibling_index;
        self
    }

    /// Set the backing resource reference
    #[must_use]
    pub fn with_resource(mut self, hash: ContentHash) -> Self {
        self.resource_ref = Some(hash);
        self
    }

    /// Add a style attribute
    #[must_use]
    pub fn with_style(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.style.insert(key.into(), value.into());
        self
    }

    /// Structural position as a single comparable value
    #[inline]
    #[must_use]
    pub fn position(&self) -> (Option<ElementId>, u32) {
        (self.parent_id, self.sibling_index)
    }
}
