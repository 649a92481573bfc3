//! Hierarchical field layout of a structured record.
//!
//! A [`FieldTree`] assigns every field a stable pre-order offset and a span
//! (the count of fields in its subtree, itself included). Leaves have span 1.
//! Offsets are stable for the lifetime of the tree, which is what lets a
//! [`crate::bitset::ChangeVector`] address fields positionally.

use serde::{Deserialize, Serialize};

use crate::error::{FluxResult, ValidationError};
use crate::value::{ScalarKind, Value};

/// Deadband polarity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadbandMode {
    /// Threshold is an absolute delta.
    Absolute,
    /// Threshold is a percentage of the current value.
    Percent,
}

/// A minimum change a numeric field must make before it is considered
/// significant. Declared per field on the record, or supplied per
/// subscription; [`crate::monitor::resolve_deadband`] merges the two.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Deadband {
    /// Absolute or percentage threshold.
    pub mode: DeadbandMode,
    /// The threshold itself.
    pub value: f64,
}

impl Deadband {
    /// An absolute deadband.
    #[must_use]
    pub const fn absolute(value: f64) -> Self {
        Self {
            mode: DeadbandMode::Absolute,
            value,
        }
    }

    /// A percentage deadband.
    #[must_use]
    pub const fn percent(value: f64) -> Self {
        Self {
            mode: DeadbandMode::Percent,
            value,
        }
    }
}

/// Whether a field is a scalar leaf or an interior structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Leaf carrying a [`Value`].
    Scalar(ScalarKind),
    /// Interior node; its value slot holds [`Value::Null`].
    Struct,
}

/// One node of a [`FieldTree`].
#[derive(Debug, Clone)]
pub struct FieldNode {
    name: String,
    kind: FieldKind,
    offset: usize,
    span: usize,
    parent: Option<usize>,
    children: Vec<usize>,
    deadband: Option<Deadband>,
}

impl FieldNode {
    /// Field name (empty for the root).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Scalar or structure.
    #[must_use]
    pub const fn kind(&self) -> FieldKind {
        self.kind
    }

    /// Stable pre-order offset.
    #[must_use]
    pub const fn offset(&self) -> usize {
        self.offset
    }

    /// Count of fields in this subtree, itself included.
    #[must_use]
    pub const fn span(&self) -> usize {
        self.span
    }

    /// Parent offset, `None` for the root.
    #[must_use]
    pub const fn parent(&self) -> Option<usize> {
        self.parent
    }

    /// Offsets of the immediate children.
    #[must_use]
    pub fn children(&self) -> &[usize] {
        &self.children
    }

    /// Deadband default declared on the record for this field.
    #[must_use]
    pub const fn deadband(&self) -> Option<Deadband> {
        self.deadband
    }

    /// True for span-1 scalar nodes.
    #[must_use]
    pub const fn is_leaf(&self) -> bool {
        matches!(self.kind, FieldKind::Scalar(_))
    }
}

/// Hierarchical field layout with stable offsets and spans.
#[derive(Debug, Clone)]
pub struct FieldTree {
    name: String,
    nodes: Vec<FieldNode>,
    timestamp: Option<usize>,
}

impl FieldTree {
    /// Starts building a tree for a record called `name`.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> TreeBuilder {
        TreeBuilder::new(name.into())
    }

    /// Record name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Total number of fields, the root structure included.
    #[must_use]
    pub fn field_count(&self) -> usize {
        self.nodes.len()
    }

    /// The node at `offset`. Panics if out of range.
    #[must_use]
    pub fn node(&self, offset: usize) -> &FieldNode {
        &self.nodes[offset]
    }

    /// True when `offset` addresses a scalar leaf.
    #[must_use]
    pub fn is_leaf(&self, offset: usize) -> bool {
        self.nodes[offset].is_leaf()
    }

    /// The designated timestamp field as `(offset, span)`, if declared.
    #[must_use]
    pub const fn timestamp_range(&self) -> Option<(usize, usize)> {
        match self.timestamp {
            Some(offset) => Some((offset, 1)),
            None => None,
        }
    }

    /// Offset of the designated timestamp field.
    #[must_use]
    pub const fn timestamp_offset(&self) -> Option<usize> {
        self.timestamp
    }

    /// Resolves a dotted path such as `"alarm.severity"`. The empty path
    /// addresses the root structure.
    #[must_use]
    pub fn find(&self, path: &str) -> Option<usize> {
        if path.is_empty() {
            return Some(0);
        }
        let mut current = 0usize;
        for segment in path.split('.') {
            let next = self.nodes[current]
                .children
                .iter()
                .copied()
                .find(|&c| self.nodes[c].name == segment)?;
            current = next;
        }
        Some(current)
    }

    /// Dotted path of the field at `offset` (empty for the root).
    #[must_use]
    pub fn path(&self, offset: usize) -> String {
        let mut segments = Vec::new();
        let mut current = offset;
        while let Some(parent) = self.nodes[current].parent {
            segments.push(self.nodes[current].name.as_str());
            current = parent;
        }
        segments.reverse();
        segments.join(".")
    }

    /// Ascending iterator over the leaf offsets inside the subtree rooted at
    /// `offset`.
    pub fn leaves_in(&self, offset: usize) -> impl Iterator<Item = usize> + '_ {
        let span = self.nodes[offset].span;
        (offset..offset + span).filter(move |&i| self.nodes[i].is_leaf())
    }

    /// True if `candidate` is a strict ancestor of `offset`.
    #[must_use]
    pub fn is_ancestor(&self, candidate: usize, offset: usize) -> bool {
        let mut current = self.nodes[offset].parent;
        while let Some(p) = current {
            if p == candidate {
                return true;
            }
            current = self.nodes[p].parent;
        }
        false
    }
}

enum BuildKind {
    Scalar {
        kind: ScalarKind,
        deadband: Option<Deadband>,
        designated_timestamp: bool,
    },
    Group(Vec<BuildNode>),
}

struct BuildNode {
    name: String,
    kind: BuildKind,
}

/// Builder assembling a [`FieldTree`] top down.
///
/// Consumes and returns itself so declarations chain:
///
/// ```
/// use fieldflux::{Deadband, FieldTree, ScalarKind};
///
/// let tree = FieldTree::builder("powerSupply")
///     .scalar("value", ScalarKind::Float)
///     .scalar_with_deadband("current", ScalarKind::Float, Deadband::absolute(0.05))
///     .group("alarm", |g| {
///         g.scalar("severity", ScalarKind::Int)
///             .scalar("message", ScalarKind::String)
///     })
///     .timestamp("timeStamp")
///     .build()
///     .unwrap();
/// assert_eq!(tree.field_count(), 7);
/// ```
pub struct TreeBuilder {
    name: String,
    children: Vec<BuildNode>,
}

impl TreeBuilder {
    fn new(name: String) -> Self {
        Self {
            name,
            children: Vec::new(),
        }
    }

    /// Adds a scalar leaf.
    #[must_use]
    pub fn scalar(mut self, name: impl Into<String>, kind: ScalarKind) -> Self {
        self.children.push(BuildNode {
            name: name.into(),
            kind: BuildKind::Scalar {
                kind,
                deadband: None,
                designated_timestamp: false,
            },
        });
        self
    }

    /// Adds a scalar leaf with a record-declared deadband default.
    #[must_use]
    pub fn scalar_with_deadband(
        mut self,
        name: impl Into<String>,
        kind: ScalarKind,
        deadband: Deadband,
    ) -> Self {
        self.children.push(BuildNode {
            name: name.into(),
            kind: BuildKind::Scalar {
                kind,
                deadband: Some(deadband),
                designated_timestamp: false,
            },
        });
        self
    }

    /// Adds the record's designated timestamp leaf. At most one per tree.
    #[must_use]
    pub fn timestamp(mut self, name: impl Into<String>) -> Self {
        self.children.push(BuildNode {
            name: name.into(),
            kind: BuildKind::Scalar {
                kind: ScalarKind::Timestamp,
                deadband: None,
                designated_timestamp: true,
            },
        });
        self
    }

    /// Adds an interior structure populated by `f`.
    #[must_use]
    pub fn group(mut self, name: impl Into<String>, f: impl FnOnce(Self) -> Self) -> Self {
        let inner = f(Self::new(String::new()));
        self.children.push(BuildNode {
            name: name.into(),
            kind: BuildKind::Group(inner.children),
        });
        self
    }

    /// Assigns offsets and spans and validates the layout.
    ///
    /// # Errors
    ///
    /// Rejects duplicate sibling names and more than one designated
    /// timestamp field.
    pub fn build(self) -> FluxResult<FieldTree> {
        let mut nodes = Vec::new();
        nodes.push(FieldNode {
            name: String::new(),
            kind: FieldKind::Struct,
            offset: 0,
            span: 0,
            parent: None,
            children: Vec::new(),
            deadband: None,
        });
        let mut timestamp = None;
        let root_name = self.name.clone();
        Self::emit(&mut nodes, 0, &root_name, &self.children, &mut timestamp)?;
        nodes[0].span = nodes.len();
        Ok(FieldTree {
            name: self.name,
            nodes,
            timestamp,
        })
    }

    fn emit(
        nodes: &mut Vec<FieldNode>,
        parent: usize,
        parent_name: &str,
        children: &[BuildNode],
        timestamp: &mut Option<usize>,
    ) -> FluxResult<()> {
        for (i, child) in children.iter().enumerate() {
            if children[..i].iter().any(|c| c.name == child.name) {
                return Err(ValidationError::DuplicateField {
                    name: child.name.clone(),
                    parent: parent_name.to_string(),
                }
                .into());
            }
            let offset = nodes.len();
            match &child.kind {
                BuildKind::Scalar {
                    kind,
                    deadband,
                    designated_timestamp,
                } => {
                    if *designated_timestamp {
                        if timestamp.is_some() {
                            return Err(ValidationError::DuplicateField {
                                name: child.name.clone(),
                                parent: "timestamp designation".to_string(),
                            }
                            .into());
                        }
                        *timestamp = Some(offset);
                    }
                    nodes.push(FieldNode {
                        name: child.name.clone(),
                        kind: FieldKind::Scalar(*kind),
                        offset,
                        span: 1,
                        parent: Some(parent),
                        children: Vec::new(),
                        deadband: *deadband,
                    });
                    nodes[parent].children.push(offset);
                }
                BuildKind::Group(grandchildren) => {
                    nodes.push(FieldNode {
                        name: child.name.clone(),
                        kind: FieldKind::Struct,
                        offset,
                        span: 0,
                        parent: Some(parent),
                        children: Vec::new(),
                        deadband: None,
                    });
                    nodes[parent].children.push(offset);
                    Self::emit(nodes, offset, &child.name, grandchildren, timestamp)?;
                    nodes[offset].span = nodes.len() - offset;
                }
            }
        }
        Ok(())
    }
}

/// Positional value storage for one field tree.
///
/// Indexed by field offset; interior nodes hold [`Value::Null`].
#[derive(Debug, Clone, PartialEq)]
pub struct FieldData {
    values: Vec<Value>,
}

impl FieldData {
    /// Default-initialized data for `tree`.
    #[must_use]
    pub fn for_tree(tree: &FieldTree) -> Self {
        let values = (0..tree.field_count())
            .map(|offset| match tree.node(offset).kind() {
                FieldKind::Scalar(kind) => kind.default_value(),
                FieldKind::Struct => Value::Null,
            })
            .collect();
        Self { values }
    }

    /// Number of value slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True when the data covers no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Value at `offset`. Panics if out of range.
    #[must_use]
    pub fn get(&self, offset: usize) -> &Value {
        &self.values[offset]
    }

    /// Replaces the value at `offset` without any type checking; record
    /// transactions perform the checked writes.
    pub fn set(&mut self, offset: usize, value: Value) {
        self.values[offset] = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree() -> FieldTree {
        FieldTree::builder("powerSupply")
            .scalar("value", ScalarKind::Float)
            .group("alarm", |g| {
                g.scalar("severity", ScalarKind::Int)
                    .scalar("message", ScalarKind::String)
            })
            .timestamp("timeStamp")
            .build()
            .unwrap()
    }

    #[test]
    fn offsets_are_preorder() {
        let tree = sample_tree();
        assert_eq!(tree.field_count(), 6);
        assert_eq!(tree.find(""), Some(0));
        assert_eq!(tree.find("value"), Some(1));
        assert_eq!(tree.find("alarm"), Some(2));
        assert_eq!(tree.find("alarm.severity"), Some(3));
        assert_eq!(tree.find("alarm.message"), Some(4));
        assert_eq!(tree.find("timeStamp"), Some(5));
        assert_eq!(tree.find("alarm.missing"), None);
    }

    #[test]
    fn spans_cover_subtrees() {
        let tree = sample_tree();
        assert_eq!(tree.node(0).span(), 6);
        assert_eq!(tree.node(2).span(), 3);
        assert_eq!(tree.node(1).span(), 1);
    }

    #[test]
    fn paths_invert_find() {
        let tree = sample_tree();
        for offset in 0..tree.field_count() {
            assert_eq!(tree.find(&tree.path(offset)), Some(offset));
        }
    }

    #[test]
    fn ancestor_walks() {
        let tree = sample_tree();
        assert!(tree.is_ancestor(0, 3));
        assert!(tree.is_ancestor(2, 3));
        assert!(!tree.is_ancestor(3, 2));
        assert!(!tree.is_ancestor(1, 3));
    }

    #[test]
    fn timestamp_designation() {
        let tree = sample_tree();
        assert_eq!(tree.timestamp_range(), Some((5, 1)));
    }

    #[test]
    fn duplicate_sibling_rejected() {
        let err = FieldTree::builder("r")
            .scalar("value", ScalarKind::Float)
            .scalar("value", ScalarKind::Int)
            .build()
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn leaves_in_subtree() {
        let tree = sample_tree();
        assert_eq!(tree.leaves_in(2).collect::<Vec<_>>(), vec![3, 4]);
        assert_eq!(tree.leaves_in(0).collect::<Vec<_>>(), vec![1, 3, 4, 5]);
        assert_eq!(tree.leaves_in(1).collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn default_data_matches_kinds() {
        let tree = sample_tree();
        let data = FieldData::for_tree(&tree);
        assert_eq!(data.get(0), &Value::Null);
        assert_eq!(data.get(1), &Value::Float(0.0));
        assert_eq!(data.get(3), &Value::Int(0));
    }
}
