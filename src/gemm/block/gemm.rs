//! The double-buffered block matmul engine.
//!
//! One [`BlockGemm`] instance computes a stream of output blocks on a single
//! matrix core. Per block it walks the k tiles through a two-stage L1 ring,
//! slices each tile through a two-stage L0 ring into the mmad unit, and
//! flushes the f32 accumulator once at the end. While the mmad unit chews on
//! the current k tile the inbound mover stages the next one, including the
//! first tile of the *next* block when the caller hands one over.
//!
//! `UNIT_FLAG` fuses the accumulator flush with the last mmad step, skipping
//! the flush event pair. `SHUFFLE_K` rotates each block's k-tile start by its
//! task index so concurrent cores touch different operand panels.

use tracing::debug;

use crate::arch::{ArchSpec, EventId, EventTable, HardEvent, LocalTensor, PoolKind, Resource};
use crate::coord::{ceil_div, GemmCoord, MatrixCoord};
use crate::device::{Element, GmTensor};
use crate::error::LaunchError;
use crate::gemm::block::StageRing;
use crate::gemm::tile::{
    copy_gm_region_to_local, copy_l0c_to_gm, copy_local_region_to_local, tile_mmad,
};
use crate::gemm::TileConfig;
use crate::layout::{Layout, Nz, Zn};

const L1_STAGES: u8 = 2;
const L0_STAGES: u8 = 2;
/// Accumulator slots the flush events can address.
const L0C_SLOT_MAX: u32 = 4;

/// Operand views of one output block: global-memory tensors positioned at the
/// block origin, with layouts restricted to the block.
pub struct BlockArgs<E: Element, LA: Layout, LB: Layout> {
    pub a: GmTensor<E>,
    pub a_layout: LA,
    pub b: GmTensor<E>,
    pub b_layout: LB,
    /// Actual block extents (m, n, k), tails already clamped.
    pub shape: GemmCoord,
}

#[derive(Debug, Clone, Copy, Default)]
struct SlotMeta {
    m: u32,
    n: u32,
    k: u32,
}

pub struct BlockGemm<E: Element, const UNIT_FLAG: bool, const SHUFFLE_K: bool> {
    config: TileConfig,
    l1_a: [LocalTensor<E>; 2],
    l1_b: [LocalTensor<E>; 2],
    l0_a: [LocalTensor<E>; 2],
    l0_b: [LocalTensor<E>; 2],
    l0_c: Vec<LocalTensor<f32>>,
    a_l1_layout: Nz,
    b_l1_layout: Nz,
    a_l0_layout: Zn,
    b_l0_layout: Nz,
    l1_load: StageRing,
    l1_consume: StageRing,
    l0_ring: StageRing,
    meta: [SlotMeta; 2],
    flushed: Vec<bool>,
}

impl<E: Element, const UNIT_FLAG: bool, const SHUFFLE_K: bool> BlockGemm<E, UNIT_FLAG, SHUFFLE_K> {
    /// Lease every stage buffer and arm the ring events. The inbound mover
    /// and the L1-to-L0 mover start with a full set of free-slot credits.
    pub fn new(
        arch: &ArchSpec,
        res: &mut Resource,
        events: &mut EventTable,
        config: TileConfig,
    ) -> Result<Self, LaunchError> {
        config.validate::<E>(arch)?;
        let tile = config.l1_tile;
        let a_l1_layout = Nz::make_layout::<E>(tile.m(), tile.k());
        let b_l1_layout = Nz::make_layout::<E>(tile.k(), tile.n());
        let a_l0_layout = Zn::make_layout::<E>(tile.m(), config.l0_tile_k);
        let b_l0_layout = Nz::make_layout::<E>(config.l0_tile_k, tile.n());

        let l1_a = [
            res.lease(PoolKind::L1, a_l1_layout.capacity() as u32)?,
            res.lease(PoolKind::L1, a_l1_layout.capacity() as u32)?,
        ];
        let l1_b = [
            res.lease(PoolKind::L1, b_l1_layout.capacity() as u32)?,
            res.lease(PoolKind::L1, b_l1_layout.capacity() as u32)?,
        ];
        let l0_a = [
            res.lease(PoolKind::L0A, a_l0_layout.capacity() as u32)?,
            res.lease(PoolKind::L0A, a_l0_layout.capacity() as u32)?,
        ];
        let l0_b = [
            res.lease(PoolKind::L0B, b_l0_layout.capacity() as u32)?,
            res.lease(PoolKind::L0B, b_l0_layout.capacity() as u32)?,
        ];
        let l0c_slots = config.l0c_block_num(arch).min(L0C_SLOT_MAX).max(1);
        let mut l0_c = Vec::with_capacity(l0c_slots as usize);
        for _ in 0..l0c_slots {
            l0_c.push(res.lease(PoolKind::L0C, tile.m() * tile.n())?);
        }

        let l1_load = StageRing::new(L1_STAGES, 0);
        let l0_ring = StageRing::new(L0_STAGES, 0);
        for slot in 0..L1_STAGES as usize {
            events.set(HardEvent::Mte1Mte2, l1_load.event_id_of(slot, 0));
            events.set(HardEvent::Mte1Mte2, l1_load.event_id_of(slot, 1));
            events.set(HardEvent::MMte1, l0_ring.event_id_of(slot, 0));
            events.set(HardEvent::MMte1, l0_ring.event_id_of(slot, 1));
        }
        debug!(
            tile_m = tile.m(),
            tile_n = tile.n(),
            tile_k = tile.k(),
            l0_k = config.l0_tile_k,
            l0c_slots,
            unit_flag = UNIT_FLAG,
            shuffle_k = SHUFFLE_K,
            "block gemm ready"
        );

        Ok(BlockGemm {
            config,
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
            l1_consume: StageRing::new(L1_STAGES, 0),
            l0_ring,
            meta: [SlotMeta::default(); 2],
            flushed: vec![false; l0c_slots as usize],
        })
    }

    fn shuffle_start(&self, single_idx: u32, k_tiles: u32) -> u32 {
        if SHUFFLE_K {
            single_idx % k_tiles
        } else {
            0
        }
    }

    /// Stage k tile `tile_idx` of `args` into the next free L1 slot.
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

        self.meta[slot] = SlotMeta {
            m: args.shape.m(),
            n: args.shape.n(),
            k: k_actual,
        };
        self.l1_load.advance();
    }

    /// Compute one output block and flush it to `out`.
    ///
    /// `next` is the following block in this core's task sequence together
    /// with its task index; its first k tile is prefetched behind the current
    /// block's last mmad. The first call of a sequence passes
    /// `is_first_block`; later calls find their first tile already staged.
    #[allow(clippy::too_many_arguments)]
    pub fn run_block<Out, LA, LB, LOut>(
        &mut self,
        res: &mut Resource,
        events: &mut EventTable,
        cur: &BlockArgs<E, LA, LB>,
        next: Option<(&BlockArgs<E, LA, LB>, u32)>,
        out: &GmTensor<Out>,
        out_layout: &LOut,
        is_first_block: bool,
        single_idx: u32,
    ) where
        Out: Element,
        LA: Layout,
        LB: Layout,
        LOut: Layout,
    {
        let tile = self.config.l1_tile;
        let l0_k = self.config.l0_tile_k;
        let k_tiles = ceil_div(cur.shape.k(), tile.k());
        let start_tile = self.shuffle_start(single_idx, k_tiles);
        let c_slot = (single_idx % self.l0_c.len() as u32) as usize;
        let c_layout = Zn::make_layout_in_l0c(cur.shape.mn());

        if is_first_block {
            self.load_l1_tile(res, events, cur, start_tile);
        }

        for t in 0..k_tiles {
            // Prefetch behind the current tile's compute.
            if t + 1 < k_tiles {
                self.load_l1_tile(res, events, cur, (start_tile + t + 1) % k_tiles);
            } else if let Some((next_args, next_idx)) = next {
                let next_k_tiles = ceil_div(next_args.shape.k(), tile.k());
                let next_start = self.shuffle_start(next_idx, next_k_tiles);
                self.load_l1_tile(res, events, next_args, next_start);
            }

            let slot = self.l1_consume.slot();
            let meta = self.meta[slot];
            events.wait(HardEvent::Mte2Mte1, self.l1_consume.event_id(0));
            events.wait(HardEvent::Mte2Mte1, self.l1_consume.event_id(1));

            let l0_steps = ceil_div(meta.k, l0_k);
            for s in 0..l0_steps {
                let k0 = s * l0_k;
                let k_actual = (meta.k - k0).min(l0_k);
                let l0_slot = self.l0_ring.slot();

                events.wait(HardEvent::MMte1, self.l0_ring.event_id(0));
                copy_local_region_to_local(
                    res,
                    &self.l0_a[l0_slot],
                    &self.a_l0_layout,
                    &self.l1_a[slot],
                    &self.a_l1_layout,
                    MatrixCoord::new(0, k0),
                    MatrixCoord::new(meta.m, k_actual),
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
                    MatrixCoord::new(k_actual, meta.n),
                );
                events.set(HardEvent::Mte1M, self.l0_ring.event_id(1));

                events.wait(HardEvent::Mte1M, self.l0_ring.event_id(0));
                events.wait(HardEvent::Mte1M, self.l0_ring.event_id(1));
                let init = t == 0 && s == 0;
                if init && self.flushed[c_slot] {
                    // Accumulator slot still draining from an earlier block.
                    events.wait(HardEvent::FixM, EventId(c_slot as u8));
                    self.flushed[c_slot] = false;
                }
                tile_mmad(
                    res,
                    &self.l0_c[c_slot],
                    &c_layout,
                    &self.l0_a[l0_slot],
                    &self.a_l0_layout,
                    &self.l0_b[l0_slot],
                    &self.b_l0_layout,
                    meta.m,
                    meta.n,
                    k_actual,
                    init,
                );
                events.set(HardEvent::MMte1, self.l0_ring.event_id(0));
                events.set(HardEvent::MMte1, self.l0_ring.event_id(1));
                self.l0_ring.advance();
            }

            events.set(HardEvent::Mte1Mte2, self.l1_consume.event_id(0));
            events.set(HardEvent::Mte1Mte2, self.l1_consume.event_id(1));
            self.l1_consume.advance();
        }

        let flush_id = EventId(c_slot as u8);
        if UNIT_FLAG {
            // Fused store: the last mmad step carries the flush, no event
            // pair on the accumulator path.
            copy_l0c_to_gm(
                res,
                out,
                out_layout,
                &self.l0_c[c_slot],
                &c_layout,
                cur.shape.mn(),
                false,
            );
        } else {
            events.set(HardEvent::MFix, flush_id);
            events.wait(HardEvent::MFix, flush_id);
            copy_l0c_to_gm(
                res,
                out,
                out_layout,
                &self.l0_c[c_slot],
                &c_layout,
                cur.shape.mn(),
                false,
            );
            events.set(HardEvent::FixM, flush_id);
            self.flushed[c_slot] = true;
        }
    }

    /// Drain the ring events armed in [`Self::new`]. Must be called after the
    /// last block; the event table is balanced afterwards.
    pub fn finish(&mut self, events: &mut EventTable) {
        for slot in 0..L1_STAGES as usize {
            events.wait(HardEvent::Mte1Mte2, self.l1_load.event_id_of(slot, 0));
            events.wait(HardEvent::Mte1Mte2, self.l1_load.event_id_of(slot, 1));
            events.wait(HardEvent::MMte1, self.l0_ring.event_id_of(slot, 0));
            events.wait(HardEvent::MMte1, self.l0_ring.event_id_of(slot, 1));
        }
        for (slot, flushed) in self.flushed.iter_mut().enumerate() {
            if *flushed {
                events.wait(HardEvent::FixM, EventId(slot as u8));
                *flushed = false;
            }
        }
    }
}
