//! Staging of right-hand-side blocks for the level phase of the multiply.
//!
//! Staging replays the packing traversal over the right hand side instead of
//! the matrix: for every off-diagonal block packed at some level, it stacks a
//! copy of the corresponding "top" rows of the right hand side and records the
//! span of leaf blocks forming the corresponding "bottom" destination. Both
//! passes iterate the same materialized plan, so the staged entries line up
//! with the packed slot order position for position.
//!
//! Staging reads the right hand side before the leaf phase mutates it: the
//! off-diagonal contributions are products against the original values of the
//! top rows, and those values are destroyed by the in-place leaf multiplies.
//! Copying them up front also makes every level update read only from frozen
//! storage, which is what allows updates within a level to run in parallel.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use dyn_stack::PodStack;
use faer_core::{debug_assert, temp_mat_uninit, ComplexField, Entity, Mat, MatMut};
use faer_core::{unzipped, zipped};
use reborrow::*;

use crate::pack::PackedTriangular;

/// Staged counterpart of one packed shape group.
pub(crate) struct StagedGroup<'a, E: Entity> {
    /// Stacked copies of the top rows, `(block_cols * block_count) × rhs_ncols`.
    pub tops: MatMut<'a, E>,
    /// Leaf index span of each block's bottom destination, in discovery order.
    pub bot_spans: Vec<(usize, usize)>,
    /// Slot id of each entry; mirrors the packed group's slot order.
    pub slot_ids: Vec<usize>,
}

/// Staged counterpart of one packed level.
pub(crate) struct StagedLevel<'a, E: Entity> {
    pub groups: BTreeMap<(usize, usize), StagedGroup<'a, E>>,
}

/// Stages the right hand side for every level of `packed` at once, carving
/// the stacked top operands from `stack`.
///
/// `blocks` must already have been validated against the packed leaf layout.
pub(crate) fn stage_rhs<'a, E: ComplexField>(
    packed: &PackedTriangular<E>,
    blocks: &[Mat<E>],
    rhs_ncols: usize,
    stack: PodStack<'a>,
) -> Vec<StagedLevel<'a, E>> {
    let mut stack = stack;

    let mut staged = Vec::with_capacity(packed.depth());
    for level in packed.levels() {
        let mut groups = BTreeMap::new();
        for ((m, k), group) in level.groups() {
            let count = group.block_count();
            let (tops, rest) = temp_mat_uninit::<E>(k * count, rhs_ncols, stack);
            stack = rest;
            groups.insert(
                (m, k),
                StagedGroup {
                    tops,
                    bot_spans: Vec::with_capacity(count),
                    slot_ids: Vec::with_capacity(count),
                },
            );
        }
        staged.push(StagedLevel { groups });
    }

    // same pre-order walk as the fill pass of the builder
    for node in &packed.plan().splits {
        let shape = (node.bot_size, node.top_size);
        let group = staged[node.level - 1].groups.get_mut(&shape).unwrap();

        let base = group.slot_ids.len() * node.top_size;
        let mut row = 0;
        for leaf in node.top_leaves.0..node.top_leaves.1 {
            let src = blocks[leaf].as_ref();
            zipped!(
                group
                    .tops
                    .rb_mut()
                    .submatrix_mut(base + row, 0, src.nrows(), rhs_ncols),
                src
            )
            .for_each(|unzipped!(mut dst, src)| dst.write(src.read()));
            row += src.nrows();
        }
        debug_assert!(row == node.top_size);

        // staged entries must pair with the packed stack position for position
        debug_assert!(
            packed.levels()[node.level - 1].group(shape).unwrap().slot_ids()[group.slot_ids.len()]
                == node.slot
        );

        group.bot_spans.push(node.bot_leaves);
        group.slot_ids.push(node.slot);
    }

    staged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pack::pack_lower;
    use assert2::assert;
    use dyn_stack::{GlobalPodBuffer, StackReq};
    use faer_core::Mat;

    #[test]
    fn staged_tops_hold_original_rows() {
        let n = 8;
        let a = Mat::<f64>::from_fn(n, n, |i, j| if j <= i { (i * n + j) as f64 } else { 0.0 });
        let x = Mat::<f64>::from_fn(n, 3, |i, j| (10 * i + j) as f64);

        let packed = pack_lower(a.as_ref(), 2).unwrap();
        let blocks = (0..4)
            .map(|b| Mat::from_fn(2, 3, |i, j| x.read(2 * b + i, j)))
            .collect::<Vec<_>>();

        let mut mem = GlobalPodBuffer::new(StackReq::new_aligned::<f64>(1024, 64));
        let staged = stage_rhs(&packed, &blocks, 3, PodStack::new(&mut mem));

        // level 1: a single 4×4 block whose top operand is rows 0..4 of x
        let level1 = &staged[0].groups[&(4, 4)];
        assert!(level1.bot_spans == [(2, 4)]);
        assert!(level1.slot_ids == [0]);
        for i in 0..4 {
            for j in 0..3 {
                assert!(level1.tops.rb().read(i, j) == x.read(i, j));
            }
        }

        // level 2: two 2×2 blocks; tops are rows 0..2 and rows 4..6 of x
        let level2 = &staged[1].groups[&(2, 2)];
        assert!(level2.bot_spans == [(1, 2), (3, 4)]);
        assert!(level2.slot_ids == [1, 2]);
        for i in 0..2 {
            for j in 0..3 {
                assert!(level2.tops.rb().read(i, j) == x.read(i, j));
                assert!(level2.tops.rb().read(2 + i, j) == x.read(4 + i, j));
            }
        }
    }
}
