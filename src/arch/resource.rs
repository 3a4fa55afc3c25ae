//! Static scratch-pool arenas and the tensor descriptors that lease them.
//!
//! Every buffer a pipeline uses is leased from a [`Resource`] up front with a
//! bump pointer; capacity violations surface as [`LaunchError::ScratchOverflow`]
//! before any data moves. A [`LocalTensor`] is a plain descriptor (pool,
//! offset, length); all reads and writes go through the owning `Resource`.

use std::marker::PhantomData;

use tracing::trace;

use crate::arch::{ArchSpec, CoreKind};
use crate::device::Element;
use crate::error::LaunchError;

/// The on-chip scratch pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolKind {
    /// Matrix-core staging cache.
    L1,
    /// Operand A feed to the mmad unit.
    L0A,
    /// Operand B feed to the mmad unit.
    L0B,
    /// Accumulator pool.
    L0C,
    /// Vector-core unified buffer.
    Ub,
    /// Bias operand pool.
    Bias,
}

impl PoolKind {
    /// Pools present on a core of the given kind.
    pub const fn for_core(kind: CoreKind) -> &'static [PoolKind] {
        match kind {
            CoreKind::Aic => &[
                PoolKind::L1,
                PoolKind::L0A,
                PoolKind::L0B,
                PoolKind::L0C,
                PoolKind::Bias,
            ],
            CoreKind::Aiv => &[PoolKind::Ub],
        }
    }
}

/// A leased window of one scratch pool, typed by element.
///
/// Copyable descriptor; the bytes live in the `Resource` the lease came from.
#[derive(Debug, Clone, Copy)]
pub struct LocalTensor<E> {
    pool: PoolKind,
    byte_offset: u32,
    elems: u32,
    _marker: PhantomData<E>,
}

impl<E: Element> LocalTensor<E> {
    #[inline]
    pub fn pool(&self) -> PoolKind {
        self.pool
    }

    #[inline]
    pub fn len(&self) -> u32 {
        self.elems
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.elems == 0
    }

    /// Sub-tensor starting `elem_offset` elements in.
    pub fn at(&self, elem_offset: u32) -> LocalTensor<E> {
        assert!(
            elem_offset <= self.elems,
            "sub-tensor offset {} exceeds length {}",
            elem_offset,
            self.elems
        );
        LocalTensor {
            pool: self.pool,
            byte_offset: self.byte_offset + elem_offset * std::mem::size_of::<E>() as u32,
            elems: self.elems - elem_offset,
            _marker: PhantomData,
        }
    }
}

struct Pool {
    kind: PoolKind,
    data: Vec<u8>,
    used: u32,
}

/// Per-core scratch memory: one fixed arena per pool the core owns.
pub struct Resource {
    pools: Vec<Pool>,
}

impl Resource {
    pub fn new(arch: &ArchSpec, core: CoreKind) -> Self {
        let pools = PoolKind::for_core(core)
            .iter()
            .map(|&kind| Pool {
                kind,
                data: vec![0u8; arch.pool_capacity(kind) as usize],
                used: 0,
            })
            .collect();
        Resource { pools }
    }

    fn pool(&self, kind: PoolKind) -> &Pool {
        self.pools
            .iter()
            .find(|p| p.kind == kind)
            .unwrap_or_else(|| panic!("pool {:?} not present on this core", kind))
    }

    fn pool_mut(&mut self, kind: PoolKind) -> &mut Pool {
        self.pools
            .iter_mut()
            .find(|p| p.kind == kind)
            .unwrap_or_else(|| panic!("pool {:?} not present on this core", kind))
    }

    /// Lease `elems` elements from `pool`. Bump allocation; leases live for
    /// the whole kernel.
    pub fn lease<E: Element>(
        &mut self,
        pool: PoolKind,
        elems: u32,
    ) -> Result<LocalTensor<E>, LaunchError> {
        let bytes = elems * std::mem::size_of::<E>() as u32;
        let p = self.pool_mut(pool);
        let capacity = p.data.len() as u32;
        let needed = p.used + bytes;
        if needed > capacity {
            return Err(LaunchError::ScratchOverflow {
                pool,
                needed,
                capacity,
            });
        }
        let byte_offset = p.used;
        p.used = needed;
        trace!(?pool, elems, byte_offset, "scratch lease");
        Ok(LocalTensor {
            pool,
            byte_offset,
            elems,
            _marker: PhantomData,
        })
    }

    /// Bytes currently leased from `pool`.
    pub fn used(&self, pool: PoolKind) -> u32 {
        self.pool(pool).used
    }

    /// Release every lease on `pool`. Outstanding descriptors become stale;
    /// callers only reset between kernel phases that share nothing.
    pub fn reset(&mut self, pool: PoolKind) {
        self.pool_mut(pool).used = 0;
    }

    #[inline]
    pub fn read<E: Element>(&self, t: &LocalTensor<E>, idx: u32) -> E {
        assert!(idx < t.elems, "read at {} past lease of {} elements", idx, t.elems);
        let start = (t.byte_offset + idx * std::mem::size_of::<E>() as u32) as usize;
        let end = start + std::mem::size_of::<E>();
        bytemuck::pod_read_unaligned(&self.pool(t.pool).data[start..end])
    }

    #[inline]
    pub fn write<E: Element>(&mut self, t: &LocalTensor<E>, idx: u32, value: E) {
        assert!(idx < t.elems, "write at {} past lease of {} elements", idx, t.elems);
        let start = (t.byte_offset + idx * std::mem::size_of::<E>() as u32) as usize;
        let end = start + std::mem::size_of::<E>();
        self.pool_mut(t.pool).data[start..end]
            .copy_from_slice(bytemuck::bytes_of(&value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use half::f16;

    fn aic_resource() -> Resource {
        Resource::new(&ArchSpec::atlas_a2(), CoreKind::Aic)
    }

    #[test]
    fn test_lease_and_access() {
        let mut res = aic_resource();
        let t: LocalTensor<f16> = res.lease(PoolKind::L1, 64).unwrap();
        res.write(&t, 3, f16::from_f32(2.5));
        assert_eq!(res.read(&t, 3).to_f32(), 2.5);
        assert_eq!(res.read(&t, 0).to_f32(), 0.0);
    }

    #[test]
    fn test_leases_do_not_overlap() {
        let mut res = aic_resource();
        let a: LocalTensor<f32> = res.lease(PoolKind::L0C, 16).unwrap();
        let b: LocalTensor<f32> = res.lease(PoolKind::L0C, 16).unwrap();
        res.write(&a, 0, 1.0);
        res.write(&b, 0, 2.0);
        assert_eq!(res.read(&a, 0), 1.0);
        assert_eq!(res.read(&b, 0), 2.0);
        assert_eq!(res.used(PoolKind::L0C), 128);
    }

    #[test]
    fn test_overflow_is_reported() {
        let mut res = aic_resource();
        let err = res.lease::<f32>(PoolKind::L0A, 64 * 1024).unwrap_err();
        match err {
            LaunchError::ScratchOverflow { pool, needed, capacity } => {
                assert_eq!(pool, PoolKind::L0A);
                assert_eq!(needed, 256 * 1024);
                assert_eq!(capacity, 64 * 1024);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_sub_tensor_addresses_parent_storage() {
        let mut res = aic_resource();
        let t: LocalTensor<f32> = res.lease(PoolKind::L1, 32).unwrap();
        let sub = t.at(8);
        res.write(&sub, 0, 7.0);
        assert_eq!(res.read(&t, 8), 7.0);
        assert_eq!(sub.len(), 24);
    }

    #[test]
    #[should_panic(expected = "not present")]
    fn test_aiv_has_no_l1() {
        let mut res = Resource::new(&ArchSpec::atlas_a2(), CoreKind::Aiv);
        let _ = res.lease::<f16>(PoolKind::L1, 1);
    }
}
