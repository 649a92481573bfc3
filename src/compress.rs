//! Structural consolidation of change vectors.
//!
//! [`compress`] normalizes a [`ChangeVector`] against a tree so that "whole
//! subtree changed" is one parent bit instead of every leaf bit, while
//! partial updates stay field-precise. [`materialize`] is the inverse: it
//! expands interior shorthand bits onto the descendant leaves, which is the
//! form the copy utilities and trigger coverage checks consume.

use crate::bitset::ChangeVector;
use crate::field::FieldTree;

/// Consolidates `bits` in place. Returns true iff any bit remains set.
///
/// Post-order: an interior node whose own bit is set sheds all descendant
/// bits as redundant; an interior node all of whose children report "fully
/// changed" absorbs them into its own bit. Leaves report their own bit.
pub fn compress(bits: &mut ChangeVector, tree: &FieldTree) -> bool {
    compress_node(bits, tree, 0)
}

fn compress_node(bits: &mut ChangeVector, tree: &FieldTree, offset: usize) -> bool {
    let span = tree.node(offset).span();
    if span == 1 {
        return bits.test(offset);
    }
    if bits.test(offset) {
        bits.clear_range(offset + 1, offset + span);
        return true;
    }

    let mut any = false;
    let mut all_consolidated = true;
    for &child in tree.node(offset).children() {
        if compress_node(bits, tree, child) {
            any = true;
        }
        if !bits.test(child) {
            all_consolidated = false;
        }
    }

    if all_consolidated {
        bits.set(offset);
        bits.clear_range(offset + 1, offset + span);
        return true;
    }
    any
}

/// Expands `bits` onto descendant leaves, writing into `out`.
///
/// `out` is cleared first and must cover the same offsets. Interior offsets
/// end up clear; a set interior bit becomes set bits on every leaf below it.
pub fn materialize_into(bits: &ChangeVector, tree: &FieldTree, out: &mut ChangeVector) {
    assert_eq!(bits.len(), out.len(), "change vector length mismatch");
    out.clear_all();
    for offset in bits.iter() {
        for leaf in tree.leaves_in(offset) {
            out.set(leaf);
        }
    }
}

/// Allocating variant of [`materialize_into`].
#[must_use]
pub fn materialize(bits: &ChangeVector, tree: &FieldTree) -> ChangeVector {
    let mut out = ChangeVector::new(bits.len());
    materialize_into(bits, tree, &mut out);
    out
}
