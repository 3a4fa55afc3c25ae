//! Hardware model: core kinds, on-chip pool budgets, events, flags, scratch.

pub mod cross_core;
pub mod event;
pub mod resource;

pub use cross_core::{cross_core_barrier, CrossCoreFlag, CrossCoreFlagWithReverse, FlagHub, FlagId};
pub use event::{EventId, EventTable, HardEvent};
pub use resource::{LocalTensor, PoolKind, Resource};

/// Which tier of the accelerator a core belongs to.
///
/// Matrix cores own the L1/L0 staging pools and the mmad unit; vector cores
/// own the unified buffer and elementwise units. Each matrix core is paired
/// with a fixed group of vector cores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoreKind {
    Aic,
    Aiv,
}

/// Byte capacities of the on-chip scratch pools.
///
/// Pipelines validate their cumulative footprint against these at
/// construction time; nothing allocates dynamically once a kernel runs.
#[derive(Debug, Clone, Copy)]
pub struct ArchSpec {
    pub l1_bytes: u32,
    pub l0a_bytes: u32,
    pub l0b_bytes: u32,
    pub l0c_bytes: u32,
    pub ub_bytes: u32,
    pub bias_bytes: u32,
}

impl ArchSpec {
    /// The pool budget this crate targets.
    pub const fn atlas_a2() -> Self {
        ArchSpec {
            l1_bytes: 512 * 1024,
            l0a_bytes: 64 * 1024,
            l0b_bytes: 64 * 1024,
            l0c_bytes: 128 * 1024,
            ub_bytes: 192 * 1024,
            bias_bytes: 1024,
        }
    }

    pub const fn pool_capacity(&self, pool: PoolKind) -> u32 {
        match pool {
            PoolKind::L1 => self.l1_bytes,
            PoolKind::L0A => self.l0a_bytes,
            PoolKind::L0B => self.l0b_bytes,
            PoolKind::L0C => self.l0c_bytes,
            PoolKind::Ub => self.ub_bytes,
            PoolKind::Bias => self.bias_bytes,
        }
    }
}

impl Default for ArchSpec {
    fn default() -> Self {
        Self::atlas_a2()
    }
}
