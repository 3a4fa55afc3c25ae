//! Memory layouts: linear-offset functions from logical (row, column)
//! coordinates into the flat storage of a tensor.
//!
//! Two families live here. The linear layouts ([`RowMajor`], [`ColumnMajor`])
//! describe global-memory matrices with an arbitrary leading dimension. The
//! fractal layouts ([`Zn`], [`Nz`], [`Zz`]) describe on-chip scratch where data
//! is blocked into 512-byte fractals whose inner and outer orderings differ
//! per pool. [`PaddingRowMajor`]/[`PaddingColumnMajor`] block a matrix into
//! aligned tiles in global memory so later stage copies stay aligned.
//!
//! Every layout exposes `offset(coord)` and a `tile(...)` restriction that
//! keeps the stride vector while shrinking the shape, so a tile view addresses
//! the exact same storage as the parent.

use crate::coord::{ceil_div, round_up, MatrixCoord};

/// Bytes in one C0 lane (the innermost hardware vector of a fractal).
pub const BYTE_PER_C0: u32 = 32;
/// C0 lanes stacked per fractal.
pub const C0_NUM_PER_FRACTAL: u32 = 16;
/// Bytes in one full fractal.
pub const BYTE_PER_FRACTAL: u32 = BYTE_PER_C0 * C0_NUM_PER_FRACTAL;

/// Elements of `E` per C0 lane.
#[inline]
pub const fn elem_per_c0<E>() -> u32 {
    BYTE_PER_C0 / std::mem::size_of::<E>() as u32
}

/// Elements of `E` per fractal.
#[inline]
pub const fn elem_per_fractal<E>() -> u32 {
    BYTE_PER_FRACTAL / std::mem::size_of::<E>() as u32
}

/// Maps logical matrix coordinates to linear element offsets.
pub trait Layout: Copy {
    fn offset(&self, coord: MatrixCoord) -> i64;
}

/// Row-major matrix with an explicit leading dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowMajor {
    shape: MatrixCoord,
    /// Elements between adjacent rows.
    ld: i64,
}

impl RowMajor {
    pub const fn new(rows: u32, cols: u32) -> Self {
        RowMajor { shape: MatrixCoord::new(rows, cols), ld: cols as i64 }
    }

    pub const fn with_ld(rows: u32, cols: u32, ld: i64) -> Self {
        RowMajor { shape: MatrixCoord::new(rows, cols), ld }
    }

    /// Layout of a staging buffer in the vector-core scratch pool, where each
    /// row is padded out to a whole number of 32-byte lanes.
    pub fn make_layout_in_ub<E>(shape: MatrixCoord) -> Self {
        let ld = round_up(shape.column(), elem_per_c0::<E>()) as i64;
        RowMajor::with_ld(shape.row(), shape.column(), ld)
    }

    /// Restrict to a tile: same strides, smaller shape.
    pub const fn tile(&self, tile_shape: MatrixCoord) -> Self {
        RowMajor { shape: tile_shape, ld: self.ld }
    }

    #[inline]
    pub const fn rows(&self) -> u32 {
        self.shape.row()
    }

    #[inline]
    pub const fn cols(&self) -> u32 {
        self.shape.column()
    }

    #[inline]
    pub const fn ld(&self) -> i64 {
        self.ld
    }

    /// Elements of backing storage the layout spans.
    pub const fn capacity(&self) -> u64 {
        self.shape.row() as u64 * self.ld as u64
    }
}

impl Layout for RowMajor {
    #[inline]
    fn offset(&self, coord: MatrixCoord) -> i64 {
        coord.row() as i64 * self.ld + coord.column() as i64
    }
}

/// Column-major matrix with an explicit leading dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnMajor {
    shape: MatrixCoord,
    /// Elements between adjacent columns.
    ld: i64,
}

impl ColumnMajor {
    pub const fn new(rows: u32, cols: u32) -> Self {
        ColumnMajor { shape: MatrixCoord::new(rows, cols), ld: rows as i64 }
    }

    pub const fn with_ld(rows: u32, cols: u32, ld: i64) -> Self {
        ColumnMajor { shape: MatrixCoord::new(rows, cols), ld }
    }

    pub const fn tile(&self, tile_shape: MatrixCoord) -> Self {
        ColumnMajor { shape: tile_shape, ld: self.ld }
    }

    #[inline]
    pub const fn rows(&self) -> u32 {
        self.shape.row()
    }

    #[inline]
    pub const fn cols(&self) -> u32 {
        self.shape.column()
    }

    #[inline]
    pub const fn ld(&self) -> i64 {
        self.ld
    }

    pub const fn capacity(&self) -> u64 {
        self.shape.column() as u64 * self.ld as u64
    }
}

impl Layout for ColumnMajor {
    #[inline]
    fn offset(&self, coord: MatrixCoord) -> i64 {
        coord.row() as i64 + coord.column() as i64 * self.ld
    }
}

/// Shape/stride body shared by the four-rank fractal layouts.
///
/// `shape = [rows_in_fractal, rows_by_fractal, cols_in_fractal,
/// cols_by_fractal]`, with a stride per component. Which component carries the
/// big stride is what distinguishes [`Zn`] from [`Nz`] from [`Zz`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fractal {
    org_shape: MatrixCoord,
    shape: [u32; 4],
    stride: [i64; 4],
}

impl Fractal {
    #[inline]
    fn offset(&self, coord: MatrixCoord) -> i64 {
        let r = coord.row() as i64;
        let c = coord.column() as i64;
        let rows_in = self.shape[0] as i64;
        let cols_in = self.shape[2] as i64;
        r / rows_in * self.stride[1]
            + c / cols_in * self.stride[3]
            + (r % rows_in) * self.stride[0]
            + (c % cols_in) * self.stride[2]
    }

    /// Offset at fractal granularity: inner coordinates are ignored.
    #[inline]
    fn fractal_offset(&self, coord: MatrixCoord) -> i64 {
        coord.row() as i64 / self.shape[0] as i64 * self.stride[1]
            + coord.column() as i64 / self.shape[2] as i64 * self.stride[3]
    }

    fn tile(&self, tile_org_shape: MatrixCoord) -> Self {
        Fractal {
            org_shape: tile_org_shape,
            shape: [
                self.shape[0],
                ceil_div(tile_org_shape.row(), self.shape[0]),
                self.shape[2],
                ceil_div(tile_org_shape.column(), self.shape[2]),
            ],
            stride: self.stride,
        }
    }
}

/// Fractal layout that is row-major inside each fractal and column-major
/// across fractals. The matrix-core layout for operand A in L0 and for the
/// accumulator in L0C.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Zn(Fractal);

impl Zn {
    pub fn make_layout<E>(org_rows: u32, org_cols: u32) -> Self {
        let per_c0 = elem_per_c0::<E>();
        let per_fractal = elem_per_fractal::<E>();
        let rows_round = round_up(org_rows, C0_NUM_PER_FRACTAL);
        let cols_round = round_up(org_cols, per_c0);
        Zn(Fractal {
            org_shape: MatrixCoord::new(org_rows, org_cols),
            shape: [
                C0_NUM_PER_FRACTAL,
                rows_round / C0_NUM_PER_FRACTAL,
                per_c0,
                cols_round / per_c0,
            ],
            stride: [
                per_c0 as i64,
                per_fractal as i64,
                1,
                (rows_round * per_c0) as i64,
            ],
        })
    }

    /// Accumulator layout in L0C: 16x16 f32 fractals regardless of the input
    /// element width.
    pub fn make_layout_in_l0c(shape: MatrixCoord) -> Self {
        let f = C0_NUM_PER_FRACTAL;
        Zn(Fractal {
            org_shape: shape,
            shape: [f, ceil_div(shape.row(), f), f, ceil_div(shape.column(), f)],
            stride: [
                f as i64,
                (f * f) as i64,
                1,
                (round_up(shape.row(), f) * f) as i64,
            ],
        })
    }

    pub fn tile(&self, tile_org_shape: MatrixCoord) -> Self {
        Zn(self.0.tile(tile_org_shape))
    }

    #[inline]
    pub fn org_shape(&self) -> MatrixCoord {
        self.0.org_shape
    }

    #[inline]
    pub fn shape(&self, idx: usize) -> u32 {
        self.0.shape[idx]
    }

    #[inline]
    pub fn stride(&self, idx: usize) -> i64 {
        self.0.stride[idx]
    }

    /// Elements of backing storage the layout spans.
    pub fn capacity(&self) -> u64 {
        self.0.stride[3] as u64 * self.0.shape[3] as u64
    }
}

impl Layout for Zn {
    #[inline]
    fn offset(&self, coord: MatrixCoord) -> i64 {
        self.0.offset(coord)
    }
}

/// Fractal layout that is column-major inside each fractal and row-major
/// across fractals. The matrix-core layout for operand B in L0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Nz(Fractal);

impl Nz {
    pub fn make_layout<E>(org_rows: u32, org_cols: u32) -> Self {
        let per_c0 = elem_per_c0::<E>();
        let per_fractal = elem_per_fractal::<E>();
        let rows_round = round_up(org_rows, per_c0);
        let cols_round = round_up(org_cols, C0_NUM_PER_FRACTAL);
        Nz(Fractal {
            org_shape: MatrixCoord::new(org_rows, org_cols),
            shape: [
                per_c0,
                rows_round / per_c0,
                C0_NUM_PER_FRACTAL,
                cols_round / C0_NUM_PER_FRACTAL,
            ],
            stride: [
                1,
                (cols_round * per_c0) as i64,
                per_c0 as i64,
                per_fractal as i64,
            ],
        })
    }

    pub fn tile(&self, tile_org_shape: MatrixCoord) -> Self {
        Nz(self.0.tile(tile_org_shape))
    }

    #[inline]
    pub fn org_shape(&self) -> MatrixCoord {
        self.0.org_shape
    }

    #[inline]
    pub fn shape(&self, idx: usize) -> u32 {
        self.0.shape[idx]
    }

    #[inline]
    pub fn stride(&self, idx: usize) -> i64 {
        self.0.stride[idx]
    }

    pub fn capacity(&self) -> u64 {
        self.0.stride[1] as u64 * self.0.shape[1] as u64
    }
}

impl Layout for Nz {
    #[inline]
    fn offset(&self, coord: MatrixCoord) -> i64 {
        self.0.offset(coord)
    }
}

/// Fractal layout that is row-major both inside and across fractals, used for
/// staging in L1. Offsets are fractal-granular: the layout addresses whole
/// fractals, and the caller moves data fractal by fractal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Zz(Fractal);

impl Zz {
    pub fn make_layout<E>(org_rows: u32, org_cols: u32) -> Self {
        let per_c0 = elem_per_c0::<E>();
        let per_fractal = elem_per_fractal::<E>();
        let rows_round = round_up(org_rows, C0_NUM_PER_FRACTAL);
        let cols_round = round_up(org_cols, per_c0);
        Zz(Fractal {
            org_shape: MatrixCoord::new(org_rows, org_cols),
            shape: [
                C0_NUM_PER_FRACTAL,
                rows_round / C0_NUM_PER_FRACTAL,
                per_c0,
                cols_round / per_c0,
            ],
            stride: [
                per_c0 as i64,
                (cols_round * C0_NUM_PER_FRACTAL) as i64,
                1,
                per_fractal as i64,
            ],
        })
    }

    #[inline]
    pub fn org_shape(&self) -> MatrixCoord {
        self.0.org_shape
    }

    #[inline]
    pub fn shape(&self, idx: usize) -> u32 {
        self.0.shape[idx]
    }

    #[inline]
    pub fn stride(&self, idx: usize) -> i64 {
        self.0.stride[idx]
    }
}

impl Layout for Zz {
    #[inline]
    fn offset(&self, coord: MatrixCoord) -> i64 {
        self.0.fractal_offset(coord)
    }
}

/// Row-major within aligned blocks and row-major across blocks. Written by
/// the padding prologue so the matrix core reads fully aligned tiles even when
/// the source matrix is not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaddingRowMajor {
    org_shape: MatrixCoord,
    shape: [u32; 4],
    stride: [i64; 4],
}

impl PaddingRowMajor {
    pub fn new(org_rows: u32, org_cols: u32, block_rows: u32, block_cols: u32) -> Self {
        PaddingRowMajor {
            org_shape: MatrixCoord::new(org_rows, org_cols),
            shape: [
                block_rows,
                ceil_div(org_rows, block_rows),
                block_cols,
                ceil_div(org_cols, block_cols),
            ],
            stride: [
                block_cols as i64,
                block_rows as i64 * round_up(org_cols, block_cols) as i64,
                1,
                (block_rows * block_cols) as i64,
            ],
        }
    }

    /// Restrict to a tile: same strides, smaller shape.
    pub fn tile(&self, tile_shape: MatrixCoord) -> Self {
        PaddingRowMajor {
            org_shape: tile_shape,
            shape: [
                self.shape[0],
                ceil_div(tile_shape.row(), self.shape[0]),
                self.shape[2],
                ceil_div(tile_shape.column(), self.shape[2]),
            ],
            stride: self.stride,
        }
    }

    #[inline]
    pub fn org_shape(&self) -> MatrixCoord {
        self.org_shape
    }

    #[inline]
    pub fn block_rows(&self) -> u32 {
        self.shape[0]
    }

    #[inline]
    pub fn block_cols(&self) -> u32 {
        self.shape[2]
    }

    /// Elements of padded storage the layout spans.
    pub fn capacity(&self) -> u64 {
        round_up(self.org_shape.row(), self.shape[0]) as u64
            * round_up(self.org_shape.column(), self.shape[2]) as u64
    }
}

impl Layout for PaddingRowMajor {
    #[inline]
    fn offset(&self, coord: MatrixCoord) -> i64 {
        let r = coord.row() as i64;
        let c = coord.column() as i64;
        let block_rows = self.shape[0] as i64;
        let block_cols = self.shape[2] as i64;
        r / block_rows * self.stride[1]
            + c / block_cols * self.stride[3]
            + r % block_rows * self.stride[0]
            + c % block_cols
    }
}

/// Column-major within aligned blocks and column-major across blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaddingColumnMajor {
    org_shape: MatrixCoord,
    shape: [u32; 4],
    stride: [i64; 4],
}

impl PaddingColumnMajor {
    pub fn new(org_rows: u32, org_cols: u32, block_rows: u32, block_cols: u32) -> Self {
        PaddingColumnMajor {
            org_shape: MatrixCoord::new(org_rows, org_cols),
            shape: [
                block_rows,
                ceil_div(org_rows, block_rows),
                block_cols,
                ceil_div(org_cols, block_cols),
            ],
            stride: [
                1,
                (block_rows * block_cols) as i64,
                block_rows as i64,
                round_up(org_rows, block_rows) as i64 * block_cols as i64,
            ],
        }
    }

    /// Restrict to a tile: same strides, smaller shape.
    pub fn tile(&self, tile_shape: MatrixCoord) -> Self {
        PaddingColumnMajor {
            org_shape: tile_shape,
            shape: [
                self.shape[0],
                ceil_div(tile_shape.row(), self.shape[0]),
                self.shape[2],
                ceil_div(tile_shape.column(), self.shape[2]),
            ],
            stride: self.stride,
        }
    }

    #[inline]
    pub fn org_shape(&self) -> MatrixCoord {
        self.org_shape
    }

    #[inline]
    pub fn block_rows(&self) -> u32 {
        self.shape[0]
    }

    #[inline]
    pub fn block_cols(&self) -> u32 {
        self.shape[2]
    }

    pub fn capacity(&self) -> u64 {
        round_up(self.org_shape.row(), self.shape[0]) as u64
            * round_up(self.org_shape.column(), self.shape[2]) as u64
    }
}

impl Layout for PaddingColumnMajor {
    #[inline]
    fn offset(&self, coord: MatrixCoord) -> i64 {
        let r = coord.row() as i64;
        let c = coord.column() as i64;
        let block_rows = self.shape[0] as i64;
        let block_cols = self.shape[2] as i64;
        r / block_rows * self.stride[1]
            + c / block_cols * self.stride[3]
            + r % block_rows
            + c % block_cols * self.stride[2]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use half::f16;
    use std::collections::HashSet;

    // Walks every in-bounds coordinate and checks the offset map is injective
    // and stays inside the layout's span.
    fn assert_bijective<L: Layout>(layout: &L, rows: u32, cols: u32, span: u64) {
        let mut seen = HashSet::new();
        for r in 0..rows {
            for c in 0..cols {
                let off = layout.offset(MatrixCoord::new(r, c));
                assert!(off >= 0, "negative offset at ({}, {})", r, c);
                assert!(
                    (off as u64) < span,
                    "offset {} out of span {} at ({}, {})",
                    off,
                    span,
                    r,
                    c
                );
                assert!(seen.insert(off), "duplicate offset {} at ({}, {})", off, r, c);
            }
        }
    }

    #[test]
    fn test_row_major_offsets() {
        let l = RowMajor::new(37, 129);
        assert_eq!(l.offset(MatrixCoord::new(0, 0)), 0);
        assert_eq!(l.offset(MatrixCoord::new(1, 0)), 129);
        assert_eq!(l.offset(MatrixCoord::new(2, 5)), 2 * 129 + 5);
        assert_bijective(&l, 37, 129, l.capacity());
    }

    #[test]
    fn test_column_major_offsets() {
        let l = ColumnMajor::new(37, 129);
        assert_eq!(l.offset(MatrixCoord::new(0, 1)), 37);
        assert_eq!(l.offset(MatrixCoord::new(5, 2)), 5 + 2 * 37);
        assert_bijective(&l, 37, 129, l.capacity());
    }

    #[test]
    fn test_zn_bijective_unaligned() {
        let l = Zn::make_layout::<f16>(37, 129);
        assert_bijective(&l, 37, 129, l.capacity());
    }

    #[test]
    fn test_nz_bijective_unaligned() {
        let l = Nz::make_layout::<f16>(37, 129);
        assert_bijective(&l, 37, 129, l.capacity());
    }

    #[test]
    fn test_zn_l0c_bijective() {
        let l = Zn::make_layout_in_l0c(MatrixCoord::new(37, 45));
        let span = l.stride(3) as u64 * l.shape(3) as u64;
        assert_bijective(&l, 37, 45, span);
    }

    #[test]
    fn test_zz_fractal_granular() {
        // Offsets move only at fractal boundaries, and distinct fractal
        // origins get distinct offsets.
        let l = Zz::make_layout::<f16>(64, 64);
        assert_eq!(l.offset(MatrixCoord::new(0, 0)), l.offset(MatrixCoord::new(15, 15)));
        let mut seen = HashSet::new();
        for fr in 0..4 {
            for fc in 0..4 {
                let off = l.offset(MatrixCoord::new(fr * 16, fc * 16));
                assert!(seen.insert(off), "fractal ({}, {}) offset collides", fr, fc);
            }
        }
    }

    #[test]
    fn test_padding_row_major_bijective() {
        let l = PaddingRowMajor::new(37, 129, 16, 32);
        assert_bijective(&l, 37, 129, l.capacity());
    }

    #[test]
    fn test_padding_column_major_bijective() {
        let l = PaddingColumnMajor::new(37, 129, 16, 32);
        assert_bijective(&l, 37, 129, l.capacity());
    }

    #[test]
    fn test_tile_preserves_addressing() {
        // A tile view must address the same storage as the parent layout.
        let parent = RowMajor::new(128, 256);
        let tile = parent.tile(MatrixCoord::new(32, 64));
        let base = parent.offset(MatrixCoord::new(96, 128));
        for r in 0..32 {
            for c in 0..64 {
                assert_eq!(
                    base + tile.offset(MatrixCoord::new(r, c)),
                    parent.offset(MatrixCoord::new(96 + r, 128 + c))
                );
            }
        }

        let parent = Zn::make_layout::<f16>(128, 256);
        let tile = parent.tile(MatrixCoord::new(32, 64));
        let base = parent.offset(MatrixCoord::new(32, 64));
        for r in 0..32 {
            for c in 0..64 {
                assert_eq!(
                    base + tile.offset(MatrixCoord::new(r, c)),
                    parent.offset(MatrixCoord::new(32 + r, 64 + c)),
                    "fractal tile diverges at ({}, {})",
                    r,
                    c
                );
            }
        }

        // Padding tiles anchor at block-aligned origins.
        let parent = PaddingRowMajor::new(96, 160, 32, 32);
        let tile = parent.tile(MatrixCoord::new(32, 160));
        let base = parent.offset(MatrixCoord::new(64, 0));
        for r in 0..32 {
            for c in 0..160 {
                assert_eq!(
                    base + tile.offset(MatrixCoord::new(r, c)),
                    parent.offset(MatrixCoord::new(64 + r, c)),
                    "padding tile diverges at ({}, {})",
                    r,
                    c
                );
            }
        }
    }

    #[test]
    fn test_ub_layout_rounds_rows_to_lanes() {
        // 32-byte lanes hold 16 f16 elements, so a 37-column row pads to 48.
        let l = RowMajor::make_layout_in_ub::<f16>(MatrixCoord::new(8, 37));
        assert_eq!(l.ld(), 48);
        assert_eq!(l.offset(MatrixCoord::new(1, 0)), 48);
    }
}
