//! Packing of a dense lower triangular matrix into its level-grouped block
//! hierarchy.
//!
//! [`pack_lower`] bisects the matrix recursively: every internal node of the
//! bisection tree contributes one rectangular off-diagonal block (bottom rows
//! × top columns), and every node at the final depth contributes one square
//! diagonal leaf. Off-diagonal blocks of the same shape found at the same
//! level are stacked vertically into a single operand so that the multiply
//! driver can apply a whole level with few large dense products.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use faer_core::{unzipped, zipped, ComplexField, Entity, Mat, MatRef};

use crate::tree::{bisect_plan, BisectPlan};
use crate::{ConfigurationError, TriangularKind};

/// All off-diagonal blocks of one shape discovered at one level, stacked into
/// a single tall operand.
#[derive(Clone, Debug)]
pub struct ShapeGroup<E: Entity> {
    stacked: Mat<E>,
    row_offsets: Vec<usize>,
    slot_ids: Vec<usize>,
}

impl<E: Entity> ShapeGroup<E> {
    /// Number of off-diagonal blocks stacked in this group.
    #[inline]
    pub fn block_count(&self) -> usize {
        self.row_offsets.len()
    }

    /// The stacked operand, of dimensions `(block_rows * block_count,
    /// block_cols)`.
    #[inline]
    pub fn stacked(&self) -> MatRef<'_, E> {
        self.stacked.as_ref()
    }

    /// Starting row of each constituent block within [`Self::stacked`], in
    /// discovery order. Consecutive offsets differ by exactly the block row
    /// count.
    #[inline]
    pub fn row_offsets(&self) -> &[usize] {
        &self.row_offsets
    }

    /// Identifier of each constituent block, in discovery order. Slot ids are
    /// unique across the whole packed structure and tie a stacked block to the
    /// right-hand-side ranges staged for it.
    #[inline]
    pub fn slot_ids(&self) -> &[usize] {
        &self.slot_ids
    }
}

/// One level of the packed hierarchy: its shape groups, plus the sub-range
/// sizes produced by every bisection performed at this level.
#[derive(Clone, Debug)]
pub struct Level<E: Entity> {
    groups: BTreeMap<(usize, usize), ShapeGroup<E>>,
    top_sizes: Vec<usize>,
    bot_sizes: Vec<usize>,
}

impl<E: Entity> Level<E> {
    /// Iterates over the `(rows, cols)` shapes present at this level, with
    /// their groups, in ascending shape order.
    #[inline]
    pub fn groups(&self) -> impl Iterator<Item = ((usize, usize), &ShapeGroup<E>)> + '_ {
        self.groups.iter().map(|(&shape, group)| (shape, group))
    }

    /// The group holding blocks of the given `(rows, cols)` shape, if any.
    #[inline]
    pub fn group(&self, shape: (usize, usize)) -> Option<&ShapeGroup<E>> {
        self.groups.get(&shape)
    }

    /// Top sub-range size of each bisection performed at this level, in
    /// left-to-right node order.
    #[inline]
    pub fn top_sizes(&self) -> &[usize] {
        &self.top_sizes
    }

    /// Bottom sub-range size of each bisection performed at this level, in
    /// left-to-right node order.
    #[inline]
    pub fn bot_sizes(&self) -> &[usize] {
        &self.bot_sizes
    }
}

/// The frozen hierarchical representation of a lower triangular matrix.
///
/// Built once by [`pack_lower`], then read-only: it may be shared across any
/// number of concurrent multiplies.
#[derive(Clone, Debug)]
pub struct PackedTriangular<E: Entity> {
    levels: Vec<Level<E>>,
    leaves: Vec<Mat<E>>,
    dim: usize,
    depth: usize,
    kind: TriangularKind,
    plan: BisectPlan,
}

impl<E: Entity> PackedTriangular<E> {
    /// Dimension of the packed matrix.
    #[inline]
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Bisection depth the matrix was packed with.
    #[inline]
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Which triangular half this structure represents.
    #[inline]
    pub fn kind(&self) -> TriangularKind {
        self.kind
    }

    /// The levels of the hierarchy, coarsest first.
    #[inline]
    pub fn levels(&self) -> &[Level<E>] {
        &self.levels
    }

    /// The square diagonal leaf blocks, in traversal order (top sub-range
    /// first, recursively).
    #[inline]
    pub fn leaves(&self) -> &[Mat<E>] {
        &self.leaves
    }

    /// Number of diagonal leaf blocks, i.e. `2^depth`.
    #[inline]
    pub fn leaf_count(&self) -> usize {
        self.leaves.len()
    }

    /// Dimension of each leaf block, in leaf order.
    #[inline]
    pub fn leaf_dims(&self) -> impl Iterator<Item = usize> + '_ {
        self.leaves.iter().map(|leaf| leaf.nrows())
    }

    #[inline]
    pub(crate) fn plan(&self) -> &BisectPlan {
        &self.plan
    }
}

/// Packs the lower triangular part of `matrix` into a level-grouped block
/// hierarchy of the given bisection depth.
///
/// Entries strictly above the diagonal are never read. A depth of `0` packs
/// the whole matrix as a single leaf.
///
/// # Errors
///
/// - [`ConfigurationError::NonSquare`] if `matrix` is not square.
/// - [`ConfigurationError::DepthTooLarge`] if `2^depth` exceeds the matrix
///   dimension, which would produce empty leaves.
#[track_caller]
pub fn pack_lower<E: ComplexField>(
    matrix: MatRef<'_, E>,
    depth: usize,
) -> Result<PackedTriangular<E>, ConfigurationError> {
    let n = matrix.nrows();
    if n != matrix.ncols() {
        return Err(ConfigurationError::NonSquare {
            nrows: n,
            ncols: matrix.ncols(),
        });
    }
    if depth > 0 && (depth >= usize::BITS as usize || n >> depth == 0) {
        return Err(ConfigurationError::DepthTooLarge { depth, dim: n });
    }

    let plan = bisect_plan(n, depth);

    let mut leaves = Vec::with_capacity(plan.leaves.len());
    for leaf in &plan.leaves {
        let src = matrix.submatrix(leaf.start, leaf.start, leaf.size, leaf.size);
        leaves.push(Mat::from_fn(leaf.size, leaf.size, |i, j| {
            if j <= i {
                src.read(i, j)
            } else {
                E::faer_zero()
            }
        }));
    }

    let mut levels = (0..depth)
        .map(|_| Level {
            groups: BTreeMap::new(),
            top_sizes: Vec::new(),
            bot_sizes: Vec::new(),
        })
        .collect::<Vec<Level<E>>>();

    // counting pass: pre-size each stacked operand before any block is copied
    let mut counts = alloc::vec![BTreeMap::<(usize, usize), usize>::new(); depth];
    for node in &plan.splits {
        let level = &mut levels[node.level - 1];
        level.top_sizes.push(node.top_size);
        level.bot_sizes.push(node.bot_size);
        *counts[node.level - 1]
            .entry((node.bot_size, node.top_size))
            .or_insert(0) += 1;
    }
    for (level, counts) in levels.iter_mut().zip(&counts) {
        for (&(m, k), &count) in counts {
            level.groups.insert(
                (m, k),
                ShapeGroup {
                    stacked: Mat::zeros(m * count, k),
                    row_offsets: Vec::with_capacity(count),
                    slot_ids: Vec::with_capacity(count),
                },
            );
        }
    }

    // fill pass: pre-order over the plan, so per-level discovery order is
    // left to right and matches the staged right-hand-side order
    for node in &plan.splits {
        let (m, k) = (node.bot_size, node.top_size);
        let group = levels[node.level - 1].groups.get_mut(&(m, k)).unwrap();
        let offset = group.row_offsets.len() * m;

        let src = matrix.submatrix(node.start + node.top_size, node.start, m, k);
        zipped!(
            group.stacked.as_mut().submatrix_mut(offset, 0, m, k),
            src
        )
        .for_each(|unzipped!(mut dst, src)| dst.write(src.read()));

        group.row_offsets.push(offset);
        group.slot_ids.push(node.slot);
    }

    Ok(PackedTriangular {
        levels,
        leaves,
        dim: n,
        depth,
        kind: TriangularKind::Lower,
        plan,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert2::assert;
    use faer_core::Mat;
    use rand::random;

    fn random_lower(n: usize) -> Mat<f64> {
        Mat::from_fn(n, n, |i, j| if j <= i { random::<f64>() } else { 0.0 })
    }

    #[test]
    fn leaf_coverage() {
        for (n, depth) in [(8, 0), (8, 2), (8, 3), (7, 2), (33, 4), (1, 0)] {
            let a = random_lower(n);
            let packed = pack_lower(a.as_ref(), depth).unwrap();

            assert!(packed.dim() == n);
            assert!(packed.depth() == depth);
            assert!(packed.kind() == TriangularKind::Lower);
            assert!(packed.leaf_count() == 1usize << depth);
            assert!(packed.leaf_dims().sum::<usize>() == n);
            assert!(packed.levels().len() == depth);
        }
    }

    #[test]
    fn depth_zero_single_leaf() {
        let a = random_lower(5);
        let packed = pack_lower(a.as_ref(), 0).unwrap();

        assert!(packed.leaf_count() == 1);
        let leaf = &packed.leaves()[0];
        for i in 0..5 {
            for j in 0..5 {
                let expected = if j <= i { a.read(i, j) } else { 0.0 };
                assert!(leaf.read(i, j) == expected);
            }
        }
    }

    #[test]
    fn upper_triangle_is_ignored() {
        let n = 8;
        let lower = random_lower(n);
        let garbage = Mat::from_fn(n, n, |i, j| {
            if j <= i {
                lower.read(i, j)
            } else {
                random::<f64>() + 1.0
            }
        });

        let a = pack_lower(lower.as_ref(), 2).unwrap();
        let b = pack_lower(garbage.as_ref(), 2).unwrap();

        for (la, lb) in a.leaves().iter().zip(b.leaves()) {
            for i in 0..la.nrows() {
                for j in 0..la.ncols() {
                    assert!(la.read(i, j) == lb.read(i, j));
                }
            }
        }
    }

    #[test]
    fn shape_group_consistency() {
        for (n, depth) in [(8, 2), (7, 2), (24, 3), (33, 5)] {
            let a = random_lower(n);
            let packed = pack_lower(a.as_ref(), depth).unwrap();

            let mut seen_slots = alloc::vec::Vec::new();
            for level in packed.levels() {
                assert!(level.top_sizes().len() == level.bot_sizes().len());
                for ((m, k), group) in level.groups() {
                    assert!(group.row_offsets().len() == group.slot_ids().len());
                    assert!(group.stacked().nrows() == m * group.block_count());
                    assert!(group.stacked().ncols() == k);
                    for (idx, &offset) in group.row_offsets().iter().enumerate() {
                        assert!(offset == idx * m);
                    }
                    seen_slots.extend_from_slice(group.slot_ids());
                }
            }

            // slot ids are globally unique
            seen_slots.sort_unstable();
            let before = seen_slots.len();
            seen_slots.dedup();
            assert!(seen_slots.len() == before);
            assert!(before == (1usize << depth) - 1);
        }
    }

    #[test]
    fn packing_is_deterministic() {
        let a = random_lower(24);
        let x = pack_lower(a.as_ref(), 3).unwrap();
        let y = pack_lower(a.as_ref(), 3).unwrap();

        assert!(x.leaf_dims().collect::<Vec<_>>() == y.leaf_dims().collect::<Vec<_>>());
        for (lx, ly) in x.levels().iter().zip(y.levels()) {
            assert!(lx.top_sizes() == ly.top_sizes());
            assert!(lx.bot_sizes() == ly.bot_sizes());
            let sx = lx.groups().map(|(shape, _)| shape).collect::<Vec<_>>();
            let sy = ly.groups().map(|(shape, _)| shape).collect::<Vec<_>>();
            assert!(sx == sy);
            for (shape, gx) in lx.groups() {
                let gy = ly.group(shape).unwrap();
                assert!(gx.row_offsets() == gy.row_offsets());
                assert!(gx.slot_ids() == gy.slot_ids());
                for i in 0..gx.stacked().nrows() {
                    for j in 0..gx.stacked().ncols() {
                        assert!(gx.stacked().read(i, j) == gy.stacked().read(i, j));
                    }
                }
            }
        }
    }

    #[test]
    fn eight_by_eight_structure() {
        let a = random_lower(8);
        let packed = pack_lower(a.as_ref(), 2).unwrap();

        assert!(packed.leaf_dims().collect::<Vec<_>>() == [2, 2, 2, 2]);

        // level 1: one 4×4 off-diagonal block
        let level1 = &packed.levels()[0];
        assert!(level1.top_sizes() == [4]);
        assert!(level1.bot_sizes() == [4]);
        let group = level1.group((4, 4)).unwrap();
        assert!(group.block_count() == 1);
        assert!(group.slot_ids() == [0]);
        for i in 0..4 {
            for j in 0..4 {
                assert!(group.stacked().read(i, j) == a.read(4 + i, j));
            }
        }

        // level 2: two 2×2 off-diagonal blocks stacked in traversal order
        let level2 = &packed.levels()[1];
        assert!(level2.top_sizes() == [2, 2]);
        assert!(level2.bot_sizes() == [2, 2]);
        let group = level2.group((2, 2)).unwrap();
        assert!(group.block_count() == 2);
        assert!(group.row_offsets() == [0, 2]);
        assert!(group.slot_ids() == [1, 2]);
        for i in 0..2 {
            for j in 0..2 {
                assert!(group.stacked().read(i, j) == a.read(2 + i, j));
                assert!(group.stacked().read(2 + i, j) == a.read(6 + i, 4 + j));
            }
        }
    }

    #[test]
    fn non_square_is_rejected() {
        let a = Mat::<f64>::zeros(3, 5);
        let err = pack_lower(a.as_ref(), 1).unwrap_err();
        assert!(err == ConfigurationError::NonSquare { nrows: 3, ncols: 5 });
    }

    #[test]
    fn excessive_depth_is_rejected() {
        let a = random_lower(6);
        let err = pack_lower(a.as_ref(), 3).unwrap_err();
        assert!(err == ConfigurationError::DepthTooLarge { depth: 3, dim: 6 });

        // depth 2 still fits: leaves of sizes 2, 1, 2, 1
        let packed = pack_lower(a.as_ref(), 2).unwrap();
        assert!(packed.leaf_dims().collect::<Vec<_>>() == [2, 1, 2, 1]);
    }
}
