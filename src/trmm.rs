//! In-place dense lower-triangular × dense multiply.
//!
//! This is the primitive applied to every diagonal leaf block during the leaf
//! phase of the packed multiply, and the whole-matrix path when a structure is
//! packed at depth 0.

use faer_core::mul::matmul;
use faer_core::{assert, join_raw, ComplexField, MatMut, MatRef, Parallelism};
use reborrow::*;

const RECURSION_THRESHOLD: usize = 4;

fn trmm_lower_base_case<E: ComplexField>(tril: MatRef<'_, E>, mut rhs: MatMut<'_, E>) {
    let n = tril.nrows();
    let p = rhs.ncols();

    // rows are overwritten bottom to top, so every read of row j <= i still
    // sees the original value
    for i in (0..n).rev() {
        for col in 0..p {
            let mut acc = E::faer_zero();
            for j in 0..=i {
                acc = acc.faer_add(tril.read(i, j).faer_mul(rhs.read(j, col)));
            }
            rhs.write(i, col, acc);
        }
    }
}

fn trmm_lower_in_place_impl<E: ComplexField>(
    tril: MatRef<'_, E>,
    rhs: MatMut<'_, E>,
    parallelism: Parallelism,
) {
    let n = tril.nrows();
    let p = rhs.ncols();

    if p > 64 && n <= 128 {
        let (rhs_left, rhs_right) = rhs.split_at_col_mut(p / 2);
        join_raw(
            |parallelism| trmm_lower_in_place_impl(tril, rhs_left, parallelism),
            |parallelism| trmm_lower_in_place_impl(tril, rhs_right, parallelism),
            parallelism,
        );
        return;
    }

    if n <= RECURSION_THRESHOLD {
        trmm_lower_base_case(tril, rhs);
        return;
    }

    let bs = n / 2;
    let (tril_top_left, _, tril_bot_left, tril_bot_right) = tril.split_at(bs, bs);
    let (rhs_top, mut rhs_bot) = rhs.split_at_row_mut(bs);

    // bottom half first: its off-diagonal update must read the top rows at
    // their original values
    trmm_lower_in_place_impl(tril_bot_right, rhs_bot.rb_mut(), parallelism);
    matmul(
        rhs_bot,
        tril_bot_left,
        rhs_top.rb(),
        Some(E::faer_one()),
        E::faer_one(),
        parallelism,
    );
    trmm_lower_in_place_impl(tril_top_left, rhs_top, parallelism);
}

/// Computes `rhs = tril × rhs` in place, where `tril` is interpreted as a
/// lower triangular matrix (diagonal included). Its strictly upper triangular
/// part is not accessed.
///
/// # Panics
///
/// - Panics if `tril` is not a square matrix.
/// - Panics if `rhs.nrows() != tril.ncols()`.
#[track_caller]
pub fn trmm_lower_in_place<E: ComplexField>(
    tril: MatRef<'_, E>,
    rhs: MatMut<'_, E>,
    parallelism: Parallelism,
) {
    assert!(all(
        tril.nrows() == tril.ncols(),
        rhs.nrows() == tril.ncols(),
    ));

    trmm_lower_in_place_impl(tril, rhs, parallelism);
}
