//! `trigemm` multiplies a dense lower triangular matrix against a dense right
//! hand side, in place, by turning the triangular access pattern into regular
//! dense matrix products.
//!
//! The matrix is recursively bisected into a binary hierarchy of square
//! diagonal blocks and rectangular off-diagonal blocks. Off-diagonal blocks of
//! identical shape discovered at the same level of the hierarchy are stacked
//! into a single tall operand, so that one level of the hierarchy is applied
//! with a handful of large GEMM calls instead of many small ones.
//!
//! The packing step runs once per matrix and produces a frozen
//! [`PackedTriangular`] structure; the multiply step can then be applied to any
//! number of right hand sides, sequentially or concurrently.
//!
//! ```
//! use dyn_stack::{GlobalPodBuffer, PodStack};
//! use faer_core::{Mat, Parallelism};
//! use trigemm::{gather_rhs, multiply_in_place, multiply_in_place_req, pack_lower, split_rhs};
//!
//! let n = 8;
//! let a = Mat::<f64>::from_fn(n, n, |i, j| if j <= i { 1.0 / (i + j + 1) as f64 } else { 0.0 });
//! let x = Mat::<f64>::from_fn(n, 2, |_, _| 1.0);
//!
//! let packed = pack_lower(a.as_ref(), 2).unwrap();
//! let mut blocks = split_rhs(x.as_ref(), &packed);
//!
//! let mut mem = GlobalPodBuffer::new(
//!     multiply_in_place_req::<f64>(&packed, 2, Parallelism::None).unwrap(),
//! );
//! multiply_in_place(
//!     &packed,
//!     &mut blocks,
//!     Parallelism::None,
//!     PodStack::new(&mut mem),
//! )
//! .unwrap();
//!
//! let y = gather_rhs(&blocks);
//! assert_eq!(y.nrows(), n);
//! ```

#![cfg_attr(not(feature = "std"), no_std)]
#![allow(clippy::too_many_arguments)]

extern crate alloc;

mod stage;
mod tree;

pub mod mul;
pub mod pack;
pub mod trmm;

pub use mul::{gather_rhs, multiply, multiply_in_place, multiply_in_place_req, split_rhs};
pub use pack::{pack_lower, Level, PackedTriangular, ShapeGroup};
pub use trmm::trmm_lower_in_place;

/// Which triangular half of the input matrix a packed structure represents.
///
/// Only the lower half is currently implemented; the discriminant exists so
/// that packed structures remain self-describing if an upper variant is added.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TriangularKind {
    /// Lower triangular: entries strictly above the diagonal are ignored.
    Lower,
}

/// Error produced when a matrix cannot be packed with the requested
/// parameters.
///
/// Packing fails atomically: no partial structure is ever returned.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConfigurationError {
    /// The input matrix is not square.
    NonSquare {
        /// Number of rows of the rejected input.
        nrows: usize,
        /// Number of columns of the rejected input.
        ncols: usize,
    },
    /// The bisection depth would produce empty leaf blocks, i.e.
    /// `2^depth > dim`.
    DepthTooLarge {
        /// The requested bisection depth.
        depth: usize,
        /// The dimension of the input matrix.
        dim: usize,
    },
}

impl core::fmt::Display for ConfigurationError {
    #[inline]
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Debug::fmt(self, f)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for ConfigurationError {}

/// Error produced when a sequence of right hand side blocks does not match the
/// leaf layout of a packed structure.
///
/// The mismatch is detected before any block is written, so the right hand
/// side is left untouched when a multiply returns this error.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ShapeMismatchError {
    /// The number of blocks differs from the number of leaves.
    BlockCount {
        /// Number of leaves in the packed structure.
        expected: usize,
        /// Number of blocks supplied by the caller.
        found: usize,
    },
    /// A block's row count differs from the corresponding leaf dimension.
    BlockRows {
        /// Index of the offending block.
        index: usize,
        /// Dimension of the corresponding leaf.
        expected: usize,
        /// Row count of the supplied block.
        found: usize,
    },
    /// A block's column count differs from the other blocks'.
    BlockCols {
        /// Index of the offending block.
        index: usize,
        /// Column count of the first block.
        expected: usize,
        /// Column count of the supplied block.
        found: usize,
    },
}

impl core::fmt::Display for ShapeMismatchError {
    #[inline]
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Debug::fmt(self, f)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for ShapeMismatchError {}
