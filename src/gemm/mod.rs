//! Tiled matrix-multiply pipelines: block engines, schedulers, tile
//! primitives and the kernel drivers that assemble them.

pub mod block;
pub mod kernel;
pub mod scheduler;
pub mod tile;

use crate::arch::{ArchSpec, PoolKind};
use crate::coord::GemmCoord;
use crate::device::Element;
use crate::error::LaunchError;
use crate::layout::C0_NUM_PER_FRACTAL;

/// Tile shapes of one block pipeline: the L1 block tile and the k-slice fed
/// to the mmad unit per step.
///
/// Validated once at kernel construction; a config that passes `validate`
/// cannot overflow a scratch pool at run time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileConfig {
    /// Block tile staged in L1 per (m, n) output block and k step.
    pub l1_tile: GemmCoord,
    /// k extent of one mmad step out of L0.
    pub l0_tile_k: u32,
}

impl TileConfig {
    pub const fn new(l1_tile: GemmCoord, l0_tile_k: u32) -> Self {
        TileConfig { l1_tile, l0_tile_k }
    }

    /// Double-buffered footprint check against the pool budgets, for element
    /// type `E` with f32 accumulation.
    pub fn validate<E: Element>(&self, arch: &ArchSpec) -> Result<(), LaunchError> {
        let (m, n, k) = (self.l1_tile.m(), self.l1_tile.n(), self.l1_tile.k());
        for (name, v) in [("m", m), ("n", n), ("k", k), ("l0 k", self.l0_tile_k)] {
            if v == 0 || v % C0_NUM_PER_FRACTAL != 0 {
                return Err(LaunchError::InvalidConfig(format!(
                    "tile {} = {} must be a positive multiple of {}",
                    name, v, C0_NUM_PER_FRACTAL
                )));
            }
        }
        if self.l0_tile_k > k {
            return Err(LaunchError::InvalidConfig(format!(
                "l0 k {} exceeds l1 k {}",
                self.l0_tile_k, k
            )));
        }

        let esize = std::mem::size_of::<E>() as u32;
        let checks = [
            (PoolKind::L1, 2 * (m * k + k * n) * esize),
            (PoolKind::L0A, 2 * m * self.l0_tile_k * esize),
            (PoolKind::L0B, 2 * self.l0_tile_k * n * esize),
            (PoolKind::L0C, m * n * std::mem::size_of::<f32>() as u32),
        ];
        for (pool, needed) in checks {
            let capacity = arch.pool_capacity(pool);
            if needed > capacity {
                return Err(LaunchError::ScratchOverflow {
                    pool,
                    needed,
                    capacity,
                });
            }
        }
        Ok(())
    }

    /// Accumulator slots of `l1_tile.mn` extent that fit in L0C.
    pub fn l0c_block_num(&self, arch: &ArchSpec) -> u32 {
        let c_bytes = self.l1_tile.m() * self.l1_tile.n() * std::mem::size_of::<f32>() as u32;
        arch.l0c_bytes / c_bytes
    }
}
