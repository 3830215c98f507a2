//! Application of a packed lower triangular matrix to a right hand side.
//!
//! The multiply runs in two phases. The leaf phase applies each diagonal leaf
//! block to its right-hand-side block in place; all leaf multiplies touch
//! disjoint storage. The level phase then walks the hierarchy from the
//! coarsest level to the finest, accumulating every off-diagonal block's
//! contribution into the leaf blocks below it. The "top" operands of those
//! contributions are staged copies of the original right hand side (see
//! [`crate::stage`]), so within one level every update reads frozen data and
//! writes its own disjoint span of leaves; levels themselves are strict
//! barriers.

use alloc::vec::Vec;

use dyn_stack::{PodStack, SizeOverflow, StackReq};
use faer_core::mul::matmul;
use faer_core::{
    assert, debug_assert, for_each_raw, temp_mat_req, unzipped, zipped, ComplexField, Entity, Mat,
    MatRef, Parallelism, Ptr,
};
use reborrow::*;

use crate::pack::PackedTriangular;
use crate::stage::stage_rhs;
use crate::trmm::trmm_lower_in_place;
use crate::ShapeMismatchError;

/// Computes the size and alignment of the workspace required by
/// [`multiply_in_place`] for right hand sides with `rhs_ncols` columns.
pub fn multiply_in_place_req<E: Entity>(
    packed: &PackedTriangular<E>,
    rhs_ncols: usize,
    parallelism: Parallelism,
) -> Result<StackReq, SizeOverflow> {
    let _ = parallelism;
    let mut req = StackReq::empty();
    for level in packed.levels() {
        for ((_, k), group) in level.groups() {
            req = req.try_and(temp_mat_req::<E>(k * group.block_count(), rhs_ncols)?)?;
        }
    }
    Ok(req)
}

fn check_rhs<E: ComplexField>(
    packed: &PackedTriangular<E>,
    blocks: &[Mat<E>],
) -> Result<usize, ShapeMismatchError> {
    if blocks.len() != packed.leaf_count() {
        return Err(ShapeMismatchError::BlockCount {
            expected: packed.leaf_count(),
            found: blocks.len(),
        });
    }

    let rhs_ncols = blocks.first().map(|block| block.ncols()).unwrap_or(0);
    for (index, (block, leaf)) in blocks.iter().zip(packed.leaves()).enumerate() {
        if block.nrows() != leaf.nrows() {
            return Err(ShapeMismatchError::BlockRows {
                index,
                expected: leaf.nrows(),
                found: block.nrows(),
            });
        }
        if block.ncols() != rhs_ncols {
            return Err(ShapeMismatchError::BlockCols {
                index,
                expected: rhs_ncols,
                found: block.ncols(),
            });
        }
    }

    Ok(rhs_ncols)
}

struct LevelUpdate<'a, E: Entity> {
    stacked: MatRef<'a, E>,
    top: MatRef<'a, E>,
    bot_span: (usize, usize),
}

/// Computes `blocks = L × blocks` in place, where `L` is the lower triangular
/// matrix represented by `packed` and `blocks` is its right hand side split
/// into per-leaf blocks (as produced by [`split_rhs`]).
///
/// # Errors
///
/// Returns a [`ShapeMismatchError`] if `blocks` does not match the packed leaf
/// layout: wrong block count, a block whose row count differs from its leaf's
/// dimension, or inconsistent column counts. The right hand side is not
/// modified when an error is returned.
///
/// # Panics
///
/// Panics if the provided memory in `stack` is insufficient (see
/// [`multiply_in_place_req`]).
#[track_caller]
pub fn multiply_in_place<E: ComplexField>(
    packed: &PackedTriangular<E>,
    blocks: &mut [Mat<E>],
    parallelism: Parallelism,
    stack: PodStack<'_>,
) -> Result<(), ShapeMismatchError> {
    let rhs_ncols = check_rhs(packed, blocks)?;

    // the off-diagonal updates multiply against the right hand side as it was
    // on entry; the copies must be staged before the leaf phase overwrites it
    let staged = stage_rhs(packed, blocks, rhs_ncols, stack);

    // leaf phase
    {
        let leaf_count = packed.leaf_count();
        let inner = if leaf_count > 1 {
            Parallelism::None
        } else {
            parallelism
        };
        let blocks_ptr = Ptr(blocks.as_mut_ptr());
        for_each_raw(
            leaf_count,
            |idx| {
                let block = unsafe { &mut *{ blocks_ptr }.0.add(idx) };
                trmm_lower_in_place(packed.leaves()[idx].as_ref(), block.as_mut(), inner);
            },
            parallelism,
        );
    }

    // level phase, coarsest to finest
    for (level, staged_level) in packed.levels().iter().zip(&staged) {
        let mut updates = Vec::new();
        for ((m, k), group) in level.groups() {
            let staged_group = &staged_level.groups[&(m, k)];
            debug_assert!(staged_group.bot_spans.len() == group.block_count());

            for (idx, &offset) in group.row_offsets().iter().enumerate() {
                updates.push(LevelUpdate {
                    stacked: group.stacked().submatrix(offset, 0, m, k),
                    top: staged_group.tops.rb().submatrix(idx * k, 0, k, rhs_ncols),
                    bot_span: staged_group.bot_spans[idx],
                });
            }
        }

        let inner = if updates.len() > 1 {
            Parallelism::None
        } else {
            parallelism
        };
        let blocks_ptr = Ptr(blocks.as_mut_ptr());
        for_each_raw(
            updates.len(),
            |idx| {
                let update = &updates[idx];
                // distinct updates within one level write disjoint leaf spans
                let mut row = 0;
                for leaf in update.bot_span.0..update.bot_span.1 {
                    let block = unsafe { &mut *{ blocks_ptr }.0.add(leaf) };
                    let nrows = block.nrows();
                    matmul(
                        block.as_mut(),
                        update.stacked.subrows(row, nrows),
                        update.top,
                        Some(E::faer_one()),
                        E::faer_one(),
                        inner,
                    );
                    row += nrows;
                }
            },
            parallelism,
        );
    }

    Ok(())
}

/// Computes `dst = L × src`, where `L` is the lower triangular matrix
/// represented by `packed` and both right hand sides are split into per-leaf
/// blocks. `src` is left untouched.
///
/// # Errors
///
/// Returns a [`ShapeMismatchError`] if either block sequence does not match
/// the packed leaf layout, or if `dst` and `src` have different column counts.
///
/// # Panics
///
/// Panics if the provided memory in `stack` is insufficient (see
/// [`multiply_in_place_req`]).
#[track_caller]
pub fn multiply<E: ComplexField>(
    dst: &mut [Mat<E>],
    packed: &PackedTriangular<E>,
    src: &[Mat<E>],
    parallelism: Parallelism,
    stack: PodStack<'_>,
) -> Result<(), ShapeMismatchError> {
    let src_ncols = check_rhs(packed, src)?;
    let dst_ncols = check_rhs(packed, dst)?;
    if dst_ncols != src_ncols {
        return Err(ShapeMismatchError::BlockCols {
            index: 0,
            expected: src_ncols,
            found: dst_ncols,
        });
    }

    for (dst, src) in dst.iter_mut().zip(src) {
        zipped!(dst.as_mut(), src.as_ref()).for_each(|unzipped!(mut dst, src)| dst.write(src.read()));
    }
    multiply_in_place(packed, dst, parallelism, stack)
}

/// Partitions a dense right hand side into owned per-leaf blocks matching the
/// leaf layout of `packed`.
///
/// # Panics
///
/// Panics if `rhs.nrows()` differs from the packed dimension.
#[track_caller]
pub fn split_rhs<E: ComplexField>(
    rhs: MatRef<'_, E>,
    packed: &PackedTriangular<E>,
) -> Vec<Mat<E>> {
    assert!(rhs.nrows() == packed.dim());

    let mut blocks = Vec::with_capacity(packed.leaf_count());
    let mut row = 0;
    for size in packed.leaf_dims() {
        let src = rhs.submatrix(row, 0, size, rhs.ncols());
        blocks.push(Mat::from_fn(size, rhs.ncols(), |i, j| src.read(i, j)));
        row += size;
    }
    blocks
}

/// Reassembles per-leaf right-hand-side blocks into one dense block, in leaf
/// order.
///
/// # Panics
///
/// Panics if the blocks have inconsistent column counts.
#[track_caller]
pub fn gather_rhs<E: ComplexField>(blocks: &[Mat<E>]) -> Mat<E> {
    let ncols = blocks.first().map(|block| block.ncols()).unwrap_or(0);
    let nrows = blocks.iter().map(|block| block.nrows()).sum();

    let mut out = Mat::<E>::zeros(nrows, ncols);
    let mut row = 0;
    for block in blocks {
        assert!(block.ncols() == ncols);
        zipped!(
            out.as_mut().submatrix_mut(row, 0, block.nrows(), ncols),
            block.as_ref()
        )
        .for_each(|unzipped!(mut dst, src)| dst.write(src.read()));
        row += block.nrows();
    }
    out
}
