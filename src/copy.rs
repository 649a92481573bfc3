//! Subset copies of a record for individual subscriptions.
//!
//! A subscription rarely wants the whole record. A [`FieldSelector`] names
//! the subtrees it cares about; [`FieldCopy`] carries the induced private
//! tree plus the offset mapping back into record space, and moves data in
//! either direction guided by a change vector.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::bitset::ChangeVector;
use crate::error::{FluxResult, ValidationError};
use crate::field::{FieldData, FieldKind, FieldTree, TreeBuilder};
use crate::record::{Record, RecordTxn};

/// Names the record subtrees a subscription observes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldSelector {
    paths: Vec<String>,
}

impl FieldSelector {
    /// Selects the entire record.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Selects the named subtrees (dotted paths).
    pub fn fields<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            paths: paths.into_iter().map(Into::into).collect(),
        }
    }

    /// True when the whole record is selected.
    #[must_use]
    pub fn is_all(&self) -> bool {
        self.paths.is_empty()
    }

    /// The selected paths.
    #[must_use]
    pub fn paths(&self) -> &[String] {
        &self.paths
    }
}

/// A subscription's private view of a record subset.
///
/// Copy offsets are pre-order offsets of the induced subtree; every copy
/// offset maps to exactly one record offset.
#[derive(Debug, Clone)]
pub struct FieldCopy {
    record_tree: Arc<FieldTree>,
    tree: Arc<FieldTree>,
    to_record: Vec<usize>,
}

impl FieldCopy {
    /// Builds the induced copy for `selector` over `record`'s tree.
    ///
    /// # Errors
    ///
    /// Any selector path that does not resolve in the record tree rejects
    /// the copy.
    pub fn new(record: &Record, selector: &FieldSelector) -> FluxResult<Self> {
        let record_tree = Arc::clone(record.tree());
        // Mark every included record node: selected subtrees plus their
        // ancestor chain, so the copy preserves intermediate structure.
        let mut included = vec![false; record_tree.field_count()];
        if selector.is_all() {
            included.fill(true);
        } else {
            for path in selector.paths() {
                let offset = record_tree
                    .find(path)
                    .ok_or_else(|| ValidationError::UnknownField { path: path.clone() })?;
                let span = record_tree.node(offset).span();
                for i in offset..offset + span {
                    included[i] = true;
                }
                let mut current = record_tree.node(offset).parent();
                while let Some(p) = current {
                    included[p] = true;
                    current = record_tree.node(p).parent();
                }
            }
        }

        let mut builder = FieldTree::builder(record_tree.name());
        builder = Self::emit(&record_tree, 0, &included, builder);
        let tree = builder.build()?;

        // The copy is the induced subtree in pre-order, so walking both
        // trees in include order yields the offset mapping directly.
        let mut to_record = Vec::with_capacity(tree.field_count());
        for (record_offset, inc) in included.iter().enumerate() {
            if *inc {
                to_record.push(record_offset);
            }
        }
        debug_assert_eq!(to_record.len(), tree.field_count());

        Ok(Self {
            record_tree,
            tree: Arc::new(tree),
            to_record,
        })
    }

    fn emit(
        record_tree: &FieldTree,
        offset: usize,
        included: &[bool],
        mut builder: TreeBuilder,
    ) -> TreeBuilder {
        for &child in record_tree.node(offset).children() {
            if !included[child] {
                continue;
            }
            let node = record_tree.node(child);
            match node.kind() {
                FieldKind::Scalar(kind) => {
                    builder = if record_tree.timestamp_offset() == Some(child) {
                        builder.timestamp(node.name())
                    } else if let Some(db) = node.deadband() {
                        builder.scalar_with_deadband(node.name(), kind, db)
                    } else {
                        builder.scalar(node.name(), kind)
                    };
                }
                FieldKind::Struct => {
                    builder = builder.group(node.name(), |g| {
                        Self::emit(record_tree, child, included, g)
                    });
                }
            }
        }
        builder
    }

    /// The copy-space tree.
    #[must_use]
    pub fn tree(&self) -> &Arc<FieldTree> {
        &self.tree
    }

    /// The record tree this copy was induced from.
    #[must_use]
    pub fn record_tree(&self) -> &Arc<FieldTree> {
        &self.record_tree
    }

    /// Record offset backing a copy offset.
    #[must_use]
    pub fn record_offset(&self, copy_offset: usize) -> usize {
        self.to_record[copy_offset]
    }

    /// Translates raw record-space bits into copy-space leaf bits.
    ///
    /// A copy leaf is marked when its record field's own bit, or any record
    /// ancestor's shorthand bit, is set. `out` must be copy-sized; it is
    /// cleared first.
    pub fn map_record_bits_into(&self, raw: &ChangeVector, out: &mut ChangeVector) {
        out.clear_all();
        for copy_offset in 0..self.tree.field_count() {
            if !self.tree.is_leaf(copy_offset) {
                continue;
            }
            let record_offset = self.to_record[copy_offset];
            if raw.test(record_offset) {
                out.set(copy_offset);
                continue;
            }
            let mut current = self.record_tree.node(record_offset).parent();
            while let Some(p) = current {
                if raw.test(p) {
                    out.set(copy_offset);
                    break;
                }
                current = self.record_tree.node(p).parent();
            }
        }
    }

    /// Allocating variant of [`FieldCopy::map_record_bits_into`].
    #[must_use]
    pub fn map_record_bits(&self, raw: &ChangeVector) -> ChangeVector {
        let mut out = ChangeVector::new(self.tree.field_count());
        self.map_record_bits_into(raw, &mut out);
        out
    }

    /// Copies record values into copy-space data for every leaf bit set in
    /// `bits` (copy space, leaf level).
    pub fn update_copy_from_record(
        &self,
        dst: &mut FieldData,
        record_data: &FieldData,
        bits: &ChangeVector,
    ) {
        for copy_offset in bits.iter() {
            if self.tree.is_leaf(copy_offset) {
                dst.set(
                    copy_offset,
                    record_data.get(self.to_record[copy_offset]).clone(),
                );
            }
        }
    }

    /// Pushes copy-space values back into the record through a transaction,
    /// for every leaf under a set bit in `bits` (copy space, shorthand bits
    /// allowed).
    ///
    /// # Errors
    ///
    /// Propagates transaction write failures (kind mismatches).
    pub fn update_record_from_copy(
        &self,
        txn: &mut RecordTxn<'_>,
        src: &FieldData,
        bits: &ChangeVector,
    ) -> FluxResult<()> {
        for copy_offset in bits.iter() {
            for leaf in self.tree.leaves_in(copy_offset) {
                txn.put_at(self.to_record[leaf], src.get(leaf).clone())?;
            }
        }
        Ok(())
    }
}
