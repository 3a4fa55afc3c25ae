//! Block matmul engine with a deep L1 staging ring.
//!
//! Where [`BlockGemm`](super::BlockGemm) keeps two k tiles in flight, this
//! engine runs an L1 ring of up to four stages: a block starts by filling the
//! ring, then every consumed tile immediately frees its slot for the next
//! load. Worth it when the k extent is long relative to the mmad cost of one
//! tile; the trade is double the L1 footprint per operand.

use tracing::debug;

use crate::arch::{ArchSpec, EventId, EventTable, HardEvent, LocalTensor, PoolKind, Resource};
use crate::coord::{ceil_div, MatrixCoord};
use crate::device::{Element, GmTensor};
use crate::error::LaunchError;
use crate::gemm::block::{BlockArgs, StageRing};
use crate::gemm::tile::{
    copy_gm_region_to_local, copy_l0c_to_gm, copy_local_region_to_local, tile_mmad,
};
use crate::gemm::TileConfig;
use crate::layout::{Layout, Nz, Zn};

const L0_STAGES: u8 = 2;
pub const MAX_L1_STAGES: u8 = 4;

#[derive(Debug)]
pub struct BlockGemmPreload<E: Element> {
    config: TileConfig,
    stages: u8,
    l1_a: Vec<LocalTensor<E>>,
    l1_b: Vec<LocalTensor<E>>,
    l0_a: [LocalTensor<E>; 2],
    l0_b: [LocalTensor<E>; 2],
    l0_c: LocalTensor<f32>,
    a_l1_layout: Nz,
    b_l1_layout: Nz,
    a_l0_layout: Zn,
    b_l0_layout: Nz,
    l1_load: StageRing,
    l1_consume: StageRing,
    l0_ring: StageRing,
    k_in_slot: Vec<u32>,
    flushed: bool,
}

impl<E: Element> BlockGemmPreload<E> {
    pub fn new(
        arch: &ArchSpec,
        res: &mut Resource,
        events: &mut EventTable,
        config: TileConfig,
        stages: u8,
    ) -> Result<Self, LaunchError> {
        if stages < 2 || stages > MAX_L1_STAGES {
            return Err(LaunchError::InvalidConfig(format!(
                "l1 stage count {} outside 2..={}",
                stages, MAX_L1_STAGES
            )));
        }
        config.validate::<E>(arch)?;
        let tile = config.l1_tile;
        let a_l1_layout = Nz::make_layout::<E>(tile.m(), tile.k());
        let b_l1_layout = Nz::make_layout::<E>(tile.k(), tile.n());
        let a_l0_layout = Zn::make_layout::<E>(tile.m(), config.l0_tile_k);
        let b_l0_layout = Nz::make_layout::<E>(config.l0_tile_k, tile.n());

        // The two extra stages are on top of the double-buffered footprint
        // the config was validated against.
        let esize = std::mem::size_of::<E>() as u32;
        let deep_bytes =
            stages as u32 * (a_l1_layout.capacity() + b_l1_layout.capacity()) as u32 * esize;
        if deep_bytes > arch.l1_bytes {
            return Err(LaunchError::ScratchOverflow {
                pool: PoolKind::L1,
                needed: deep_bytes,
                capacity: arch.l1_bytes,
            });
        }

        let mut l1_a = Vec::with_capacity(stages as usize);
        let mut l1_b = Vec::with_capacity(stages as usize);
        for _ in 0..stages {
            l1_a.push(res.lease(PoolKind::L1, a_l1_layout.capacity() as u32)?);
            l1_b.push(res.lease(PoolKind::L1, b_l1_layout.capacity() as u32)?);
        }
        let l0_a = [
            res.lease(PoolKind::L0A, a_l0_layout.capacity() as u32)?,
            res.lease(PoolKind::L0A, a_l0_layout.capacity() as u32)?,
        ];
        let l0_b = [
            res.lease(PoolKind::L0B, b_l0_layout.capacity() as u32)?,
            res.lease(PoolKind::L0B, b_l0_layout.capacity() as u32)?,
        ];
        let l0_c = res.lease(PoolKind::L0C, tile.m() * tile.n())?;

        let l1_load = StageRing::new(stages, 0);
        let l0_ring = StageRing::new(L0_STAGES, 0);
        for slot in 0..stages as usize {
            events.set(HardEvent::Mte1Mte2, l1_load.event_id_of(slot, 0));
            events.set(HardEvent::Mte1Mte2, l1_load.event_id_of(slot, 1));
        }
        for slot in 0..L0_STAGES as usize {
            events.set(HardEvent::MMte1, l0_ring.event_id_of(slot, 0));
            events.set(HardEvent::MMte1, l0_ring.event_id_of(slot, 1));
        }
        debug!(stages, "preload block gemm ready");

        Ok(BlockGemmPreload {
            config,
            stages,
            l1_a,
            l1_b,
            l0_a,
            l0_b,
            l0_c,
            a_l1_layout,
            b_l1_layout,
            a_l0_layout,
            b_l0_layout,
            l1_load,
            l1_consume: StageRing::new(stages, 0),
            l0_ring,
            k_in_slot: vec![0; stages as usize],
            flushed: false,
        })
    }

    fn load_l1_tile<LA: Layout, LB: Layout>(
        &mut self,
        res: &mut Resource,
        events: &mut EventTable,
        args: &BlockArgs<E, LA, LB>,
        tile_idx: u32,
    ) {
        let tile_k = self.config.l1_tile.k();
        let k0 = tile_idx * tile_k;
        let k_actual = (args.shape.k() - k0).min(tile_k);
        let slot = self.l1_load.slot();

        events.wait(HardEvent::Mte1Mte2, self.l1_load.event_id(0));
        copy_gm_region_to_local(
            res,
            &self.l1_a[slot],
            &self.a_l1_layout,
            &args.a,
            &args.a_layout,
            MatrixCoord::new(0, k0),
            MatrixCoord::new(args.shape.m(), k_actual),
        );
        events.set(HardEvent::Mte2Mte1, self.l1_load.event_id(0));

        events.wait(HardEvent::Mte1Mte2, self.l1_load.event_id(1));
        copy_gm_region_to_local(
            res,
            &self.l1_b[slot],
            &self.b_l1_layout,
            &args.b,
            &args.b_layout,
            MatrixCoord::new(k0, 0),
            MatrixCoord::new(k_actual, args.shape.n()),
        );
        events.set(HardEvent::Mte2Mte1, self.l1_load.event_id(1));

        self.k_in_slot[slot] = k_actual;
        self.l1_load.advance();
    }

    /// Compute one output block. Unlike the two-stage engine this fills its
    /// ring per block and never reaches across block boundaries.
    pub fn run_block<Out, LA, LB, LOut>(
        &mut self,
        res: &mut Resource,
        events: &mut EventTable,
        cur: &BlockArgs<E, LA, LB>,
        out: &GmTensor<Out>,
        out_layout: &LOut,
    ) where
        Out: Element,
        LA: Layout,
        LB: Layout,
        LOut: Layout,
    {
        let tile = self.config.l1_tile;
        let l0_k = self.config.l0_tile_k;
        let k_tiles = ceil_div(cur.shape.k(), tile.k());
        let c_layout = Zn::make_layout_in_l0c(cur.shape.mn());
        let fill = (self.stages as u32).min(k_tiles);

        for t in 0..fill {
            self.load_l1_tile(res, events, cur, t);
        }

        for t in 0..k_tiles {
            let slot = self.l1_consume.slot();
            let k_here = self.k_in_slot[slot];
            events.wait(HardEvent::Mte2Mte1, self.l1_consume.event_id(0));
            events.wait(HardEvent::Mte2Mte1, self.l1_consume.event_id(1));

            let l0_steps = ceil_div(k_here, l0_k);
            for s in 0..l0_steps {
                let k0 = s * l0_k;
                let k_actual = (k_here - k0).min(l0_k);
                let l0_slot = self.l0_ring.slot();

                events.wait(HardEvent::MMte1, self.l0_ring.event_id(0));
                copy_local_region_to_local(
                    res,
                    &self.l0_a[l0_slot],
                    &self.a_l0_layout,
                    &self.l1_a[slot],
                    &self.a_l1_layout,
                    MatrixCoord::new(0, k0),
                    MatrixCoord::new(cur.shape.m(), k_actual),
                );
                events.set(HardEvent::Mte1M, self.l0_ring.event_id(0));

                events.wait(HardEvent::MMte1, self.l0_ring.event_id(1));
                copy_local_region_to_local(
                    res,
                    &self.l0_b[l0_slot],
                    &self.b_l0_layout,
                    &self.l1_b[slot],
                    &self.b_l1_layout,
                    MatrixCoord::new(k0, 0),
                    MatrixCoord::new(k_actual, cur.shape.n()),
                );
                events.set(HardEvent::Mte1M, self.l0_ring.event_id(1));

                events.wait(HardEvent::Mte1M, self.l0_ring.event_id(0));
                events.wait(HardEvent::Mte1M, self.l0_ring.event_id(1));
                if t == 0 && s == 0 && self.flushed {
                    events.wait(HardEvent::FixM, EventId(0));
                    self.flushed = false;
                }
                tile_mmad(
                    res,
                    &self.l0_c,
                    &c_layout,
                    &self.l0_a[l0_slot],
                    &self.a_l0_layout,
                    &self.l0_b[l0_slot],
                    &self.b_l0_layout,
                    cur.shape.m(),
                    cur.shape.n(),
                    k_actual,
                    t == 0 && s == 0,
                );
                events.set(HardEvent::MMte1, self.l0_ring.event_id(0));
                events.set(HardEvent::MMte1, self.l0_ring.event_id(1));
                self.l0_ring.advance();
            }

            events.set(HardEvent::Mte1Mte2, self.l1_consume.event_id(0));
            events.set(HardEvent::Mte1Mte2, self.l1_consume.event_id(1));
            self.l1_consume.advance();

            // Refill behind the consume pointer.
            if fill + t < k_tiles {
                self.load_l1_tile(res, events, cur, fill + t);
            }
        }

        events.set(HardEvent::MFix, EventId(0));
        events.wait(HardEvent::MFix, EventId(0));
        copy_l0c_to_gm(res, out, out_layout, &self.l0_c, &c_layout, cur.shape.mn(), false);
        events.set(HardEvent::FixM, EventId(0));
        self.flushed = true;
    }

    /// Drain the ring events. Balances the table after the last block.
    pub fn finish(&mut self, events: &mut EventTable) {
        for slot in 0..self.stages as usize {
            events.wait(HardEvent::Mte1Mte2, self.l1_load.event_id_of(slot, 0));
            events.wait(HardEvent::Mte1Mte2, self.l1_load.event_id_of(slot, 1));
        }
        for slot in 0..L0_STAGES as usize {
            events.wait(HardEvent::MMte1, self.l0_ring.event_id_of(slot, 0));
            events.wait(HardEvent::MMte1, self.l0_ring.event_id_of(slot, 1));
        }
        if self.flushed {
            events.wait(HardEvent::FixM, EventId(0));
            self.flushed = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::CoreKind;
    use crate::coord::GemmCoord;
    use crate::layout::RowMajor;
    use crate::test_utils::{assert_close, naive_matmul, random_f16};
    use half::f16;

    fn run(problem: GemmCoord, stages: u8) -> Vec<f32> {
        let arch = ArchSpec::atlas_a2();
        let mut res = Resource::new(&arch, CoreKind::Aic);
        let mut events = EventTable::new();
        let config = TileConfig::new(GemmCoord::new(32, 32, 32), 16);
        let mut engine: BlockGemmPreload<f16> =
            BlockGemmPreload::new(&arch, &mut res, &mut events, config, stages).unwrap();

        let a = GmTensor::from_vec(random_f16((problem.m() * problem.k()) as usize, 11));
        let b = GmTensor::from_vec(random_f16((problem.k() * problem.n()) as usize, 12));
        let d: GmTensor<f16> = GmTensor::new((problem.m() * problem.n()) as usize);
        let args = BlockArgs {
            a: a.clone(),
            a_layout: RowMajor::new(problem.m(), problem.k()),
            b: b.clone(),
            b_layout: RowMajor::new(problem.k(), problem.n()),
            shape: problem,
        };
        engine.run_block(
            &mut res,
            &mut events,
            &args,
            &d,
            &RowMajor::new(problem.m(), problem.n()),
        );
        engine.finish(&mut events);
        events.assert_quiesced();

        let expect = naive_matmul(&a.to_vec(), &b.to_vec(), problem);
        let got: Vec<f32> = d.to_vec().iter().map(|v| v.to_f32()).collect();
        assert_close(&got, &expect, 5e-2);
        got
    }

    #[test]
    fn test_deep_ring_long_k() {
        // 7 k tiles through a 4-stage ring, with a k tail.
        run(GemmCoord::new(32, 32, 200), 4);
    }

    #[test]
    fn test_ring_shallower_than_k() {
        run(GemmCoord::new(32, 32, 96), 3);
    }

    #[test]
    fn test_ring_deeper_than_k() {
        // Only 2 tiles to stage; the ring never fills.
        run(GemmCoord::new(32, 32, 64), 4);
    }

    #[test]
    fn test_stage_bounds_enforced() {
        let arch = ArchSpec::atlas_a2();
        let mut res = Resource::new(&arch, CoreKind::Aic);
        let mut events = EventTable::new();
        let config = TileConfig::new(GemmCoord::new(32, 32, 32), 16);
        let err = BlockGemmPreload::<f16>::new(&arch, &mut res, &mut events, config, 5)
            .unwrap_err();
        assert!(matches!(err, LaunchError::InvalidConfig(_)));
    }
}
