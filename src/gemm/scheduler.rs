//! Block schedulers: map a flat task index onto the (m, n) block grid.
//!
//! The swizzle walks the grid in bands of `swizzle_offset` rows (or columns),
//! reversing direction on every other band so consecutive tasks touch
//! neighbouring operand panels. [`SplitkScheduler`] extends the grid with a
//! k dimension carved into near-equal slices of whole k tiles.

use crate::coord::{ceil_div, GemmCoord, MatrixCoord};

/// Band orientation of the swizzle walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwizzleDirection {
    /// Bands of rows; n advances fastest.
    Zn,
    /// Bands of columns; m advances fastest.
    Nz,
}

/// Assigns output blocks to task indices for a plain GEMM.
#[derive(Debug, Clone, Copy)]
pub struct BlockScheduler {
    problem_shape: GemmCoord,
    tile_mn: MatrixCoord,
    loops_mn: MatrixCoord,
    swizzle_offset: u32,
    direction: SwizzleDirection,
}

impl BlockScheduler {
    pub fn new(
        problem_shape: GemmCoord,
        tile_mn: MatrixCoord,
        swizzle_offset: u32,
        direction: SwizzleDirection,
    ) -> Self {
        assert!(swizzle_offset > 0, "swizzle offset must be positive");
        let loops_mn = MatrixCoord::new(
            ceil_div(problem_shape.m(), tile_mn.row()),
            ceil_div(problem_shape.n(), tile_mn.column()),
        );
        BlockScheduler {
            problem_shape,
            tile_mn,
            loops_mn,
            swizzle_offset,
            direction,
        }
    }

    /// Blocks in the output grid.
    pub fn core_loops(&self) -> u32 {
        self.loops_mn.row() * self.loops_mn.column()
    }

    #[inline]
    pub fn loops_mn(&self) -> MatrixCoord {
        self.loops_mn
    }

    /// Grid coordinate of `task_idx` under the swizzle.
    pub fn block_coord(&self, task_idx: u32) -> GemmCoord {
        let inner_idx = task_idx % self.core_loops();
        let (rows, cols) = (self.loops_mn.row(), self.loops_mn.column());
        match self.direction {
            SwizzleDirection::Zn => {
                let band_loop = ceil_div(rows, self.swizzle_offset);
                let band_idx = inner_idx / (self.swizzle_offset * cols);
                let in_band_idx = inner_idx % (self.swizzle_offset * cols);
                // Last band may be narrower than the swizzle offset.
                let n_row = if band_idx == band_loop - 1 {
                    rows - self.swizzle_offset * band_idx
                } else {
                    self.swizzle_offset
                };
                let m_idx = band_idx * self.swizzle_offset + in_band_idx % n_row;
                let mut n_idx = in_band_idx / n_row;
                if band_idx % 2 == 1 {
                    n_idx = cols - n_idx - 1;
                }
                GemmCoord::new(m_idx, n_idx, 0)
            }
            SwizzleDirection::Nz => {
                let band_loop = ceil_div(cols, self.swizzle_offset);
                let band_idx = inner_idx / (self.swizzle_offset * rows);
                let in_band_idx = inner_idx % (self.swizzle_offset * rows);
                let n_col = if band_idx == band_loop - 1 {
                    cols - self.swizzle_offset * band_idx
                } else {
                    self.swizzle_offset
                };
                let mut m_idx = in_band_idx / n_col;
                let n_idx = band_idx * self.swizzle_offset + in_band_idx % n_col;
                if band_idx % 2 == 1 {
                    m_idx = rows - m_idx - 1;
                }
                GemmCoord::new(m_idx, n_idx, 0)
            }
        }
    }

    /// Actual extents of the block at `block_coord`, clamped at the problem
    /// edge. k is the full problem k.
    pub fn actual_block_shape(&self, block_coord: GemmCoord) -> GemmCoord {
        let m_actual = if block_coord.m() == self.loops_mn.row() - 1 {
            self.problem_shape.m() - block_coord.m() * self.tile_mn.row()
        } else {
            self.tile_mn.row()
        };
        let n_actual = if block_coord.n() == self.loops_mn.column() - 1 {
            self.problem_shape.n() - block_coord.n() * self.tile_mn.column()
        } else {
            self.tile_mn.column()
        };
        GemmCoord::new(m_actual, n_actual, self.problem_shape.k())
    }
}

/// Scheduler for split-K GEMM: the k tile range is carved into
/// `splitk_factor` contiguous slices of whole k tiles, each computed by a
/// different task and reduced afterwards.
#[derive(Debug, Clone, Copy)]
pub struct SplitkScheduler {
    problem_shape: GemmCoord,
    tile_shape: GemmCoord,
    loops_mnk: GemmCoord,
    splitk_factor: u32,
    swizzle_offset: u32,
    direction: SwizzleDirection,
}

impl SplitkScheduler {
    pub fn new(
        problem_shape: GemmCoord,
        tile_shape: GemmCoord,
        splitk_factor: u32,
        swizzle_offset: u32,
        direction: SwizzleDirection,
    ) -> Self {
        assert!(splitk_factor > 0, "splitk factor must be positive");
        assert!(swizzle_offset > 0, "swizzle offset must be positive");
        let loops_mnk = GemmCoord::new(
            ceil_div(problem_shape.m(), tile_shape.m()),
            ceil_div(problem_shape.n(), tile_shape.n()),
            ceil_div(problem_shape.k(), tile_shape.k()),
        );
        assert!(
            splitk_factor <= loops_mnk.k(),
            "splitk factor {} exceeds {} k tiles",
            splitk_factor,
            loops_mnk.k()
        );
        SplitkScheduler {
            problem_shape,
            tile_shape,
            loops_mnk,
            splitk_factor,
            swizzle_offset,
            direction,
        }
    }

    pub fn core_loops(&self) -> u32 {
        self.loops_mnk.m() * self.loops_mnk.n() * self.splitk_factor
    }

    #[inline]
    pub fn splitk_factor(&self) -> u32 {
        self.splitk_factor
    }

    #[inline]
    pub fn loops_mnk(&self) -> GemmCoord {
        self.loops_mnk
    }

    /// Which k slice `task_idx` works on.
    pub fn splitk_slice_idx(&self, task_idx: u32) -> u32 {
        let mn_loops = self.loops_mnk.m() * self.loops_mnk.n();
        task_idx % self.core_loops() / mn_loops
    }

    /// First k-tile index of a slice. Remainder tiles go to the leading
    /// slices, one each.
    pub fn k_idx_of_slice(&self, slice_idx: u32) -> u32 {
        let base = self.loops_mnk.k() / self.splitk_factor;
        let rem = self.loops_mnk.k() % self.splitk_factor;
        if slice_idx < rem {
            (base + 1) * slice_idx
        } else {
            slice_idx * base + rem
        }
    }

    /// Grid coordinate of `task_idx`: swizzled (m, n) plus the slice's
    /// starting k-tile index.
    pub fn block_coord(&self, task_idx: u32) -> GemmCoord {
        let k_idx = self.k_idx_of_slice(self.splitk_slice_idx(task_idx));
        let mn = BlockScheduler {
            problem_shape: self.problem_shape,
            tile_mn: MatrixCoord::new(self.tile_shape.m(), self.tile_shape.n()),
            loops_mn: MatrixCoord::new(self.loops_mnk.m(), self.loops_mnk.n()),
            swizzle_offset: self.swizzle_offset,
            direction: self.direction,
        }
        .block_coord(task_idx % (self.loops_mnk.m() * self.loops_mnk.n()));
        GemmCoord::new(mn.m(), mn.n(), k_idx)
    }

    /// Actual extents of a block: m/n clamped at the problem edge, k the
    /// element length of the slice (the last slice absorbs the k tail).
    pub fn actual_block_shape(&self, block_coord: GemmCoord, slice_idx: u32) -> GemmCoord {
        let base = self.loops_mnk.k() / self.splitk_factor;
        let rem = self.loops_mnk.k() % self.splitk_factor;
        let slice_len = if slice_idx < rem {
            (base + 1) * self.tile_shape.k()
        } else {
            base * self.tile_shape.k()
        };
        let m_actual = if block_coord.m() == self.loops_mnk.m() - 1 {
            self.problem_shape.m() - block_coord.m() * self.tile_shape.m()
        } else {
            self.tile_shape.m()
        };
        let n_actual = if block_coord.n() == self.loops_mnk.n() - 1 {
            self.problem_shape.n() - block_coord.n() * self.tile_shape.n()
        } else {
            self.tile_shape.n()
        };
        let k_actual = if slice_idx == self.splitk_factor - 1 {
            self.problem_shape.k() - block_coord.k() * self.tile_shape.k()
        } else {
            slice_len
        };
        GemmCoord::new(m_actual, n_actual, k_actual)
    }
}
