//! Fixed-rank coordinate tuples for shapes and positions.
//!
//! A [`Coord`] is used both as an *extent* (how big) and as a *position*
//! (where); the meaning is contextual, exactly as in the tile arithmetic it
//! feeds. All arithmetic is elementwise and the rank is fixed at compile time.

use std::ops::{Add, Div, Index, IndexMut, Mul, Rem, Sub};

/// Fixed-rank tuple of `u32` indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Coord<const R: usize>(pub [u32; R]);

impl<const R: usize> Default for Coord<R> {
    fn default() -> Self {
        Self::zero()
    }
}

impl<const R: usize> Coord<R> {
    /// All components zero.
    pub const fn zero() -> Self {
        Coord([0; R])
    }

    /// All components set to `value`.
    pub const fn splat(value: u32) -> Self {
        Coord([value; R])
    }

    /// Componentwise minimum.
    pub fn min(self, other: Self) -> Self {
        let mut out = [0u32; R];
        for i in 0..R {
            out[i] = self.0[i].min(other.0[i]);
        }
        Coord(out)
    }

    /// Product of all components. Useful for element counts.
    pub fn product(self) -> u64 {
        self.0.iter().map(|&v| v as u64).product()
    }

    /// Componentwise ceiling division.
    pub fn ceil_div(self, divisor: Self) -> Self {
        let mut out = [0u32; R];
        for i in 0..R {
            debug_assert!(divisor.0[i] > 0, "ceil_div by zero in component {}", i);
            out[i] = self.0[i].div_ceil(divisor.0[i]);
        }
        Coord(out)
    }
}

impl<const R: usize> Index<usize> for Coord<R> {
    type Output = u32;

    #[inline]
    fn index(&self, idx: usize) -> &u32 {
        &self.0[idx]
    }
}

impl<const R: usize> IndexMut<usize> for Coord<R> {
    #[inline]
    fn index_mut(&mut self, idx: usize) -> &mut u32 {
        &mut self.0[idx]
    }
}

macro_rules! coord_elementwise_op {
    ($trait:ident, $method:ident) => {
        impl<const R: usize> $trait for Coord<R> {
            type Output = Coord<R>;

            fn $method(self, rhs: Self) -> Coord<R> {
                let mut out = [0u32; R];
                for i in 0..R {
                    out[i] = self.0[i].$method(rhs.0[i]);
                }
                Coord(out)
            }
        }
    };
}

coord_elementwise_op!(Add, add);
coord_elementwise_op!(Sub, sub);
coord_elementwise_op!(Mul, mul);
coord_elementwise_op!(Div, div);
coord_elementwise_op!(Rem, rem);

/// Round `value` up to the next multiple of `align`.
#[inline]
pub const fn round_up(value: u32, align: u32) -> u32 {
    assert!(align > 0);
    value.div_ceil(align) * align
}

/// Ceiling division for scalar extents.
#[inline]
pub const fn ceil_div(value: u32, divisor: u32) -> u32 {
    assert!(divisor > 0);
    value.div_ceil(divisor)
}

/// A (row, column) coordinate over a 2-D matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MatrixCoord(pub Coord<2>);

impl MatrixCoord {
    pub const fn new(row: u32, column: u32) -> Self {
        MatrixCoord(Coord([row, column]))
    }

    #[inline]
    pub const fn row(&self) -> u32 {
        self.0 .0[0]
    }

    #[inline]
    pub const fn column(&self) -> u32 {
        self.0 .0[1]
    }
}

/// An (m, n, k) coordinate over a GEMM problem or tile grid.
///
/// `m`/`n` index the output dimensions, `k` the reduction dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct GemmCoord(pub Coord<3>);

impl GemmCoord {
    pub const fn new(m: u32, n: u32, k: u32) -> Self {
        GemmCoord(Coord([m, n, k]))
    }

    #[inline]
    pub const fn m(&self) -> u32 {
        self.0 .0[0]
    }

    #[inline]
    pub const fn n(&self) -> u32 {
        self.0 .0[1]
    }

    #[inline]
    pub const fn k(&self) -> u32 {
        self.0 .0[2]
    }

    /// The (m, n) face of the coordinate, dropping k.
    pub const fn mn(&self) -> MatrixCoord {
        MatrixCoord::new(self.m(), self.n())
    }

    /// The (m, k) face, as used for addressing operand A.
    pub const fn mk(&self) -> MatrixCoord {
        MatrixCoord::new(self.m(), self.k())
    }

    /// The (k, n) face, as used for addressing operand B.
    pub const fn kn(&self) -> MatrixCoord {
        MatrixCoord::new(self.k(), self.n())
    }
}

/// An (m, n) coordinate for GEMV problems: `m` output rows, `n` the
/// reduction length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct GemvCoord(pub Coord<2>);

impl GemvCoord {
    pub const fn new(m: u32, n: u32) -> Self {
        GemvCoord(Coord([m, n]))
    }

    #[inline]
    pub const fn m(&self) -> u32 {
        self.0 .0[0]
    }

    #[inline]
    pub const fn n(&self) -> u32 {
        self.0 .0[1]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_elementwise_ops() {
        let a = Coord([6, 9, 12]);
        let b = Coord([2, 3, 5]);
        assert_eq!(a + b, Coord([8, 12, 17]));
        assert_eq!(a - b, Coord([4, 6, 7]));
        assert_eq!(a * b, Coord([12, 27, 60]));
        assert_eq!(a / b, Coord([3, 3, 2]));
        assert_eq!(a % b, Coord([0, 0, 2]));
    }

    #[test]
    fn test_ceil_div() {
        let shape = Coord([100, 65]);
        let tile = Coord([32, 32]);
        assert_eq!(shape.ceil_div(tile), Coord([4, 3]));
        assert_eq!(ceil_div(1, 16), 1);
        assert_eq!(ceil_div(16, 16), 1);
        assert_eq!(ceil_div(17, 16), 2);
    }

    #[test]
    fn test_round_up() {
        assert_eq!(round_up(0, 16), 0);
        assert_eq!(round_up(1, 16), 16);
        assert_eq!(round_up(16, 16), 16);
        assert_eq!(round_up(37, 16), 48);
    }

    #[test]
    fn test_gemm_coord_faces() {
        let c = GemmCoord::new(128, 256, 64);
        assert_eq!(c.mn(), MatrixCoord::new(128, 256));
        assert_eq!(c.mk(), MatrixCoord::new(128, 64));
        assert_eq!(c.kn(), MatrixCoord::new(64, 256));
    }

    #[test]
    fn test_min_product() {
        let a = Coord([3, 10]);
        let b = Coord([5, 7]);
        assert_eq!(a.min(b), Coord([3, 7]));
        assert_eq!(a.product(), 30);
    }
}
