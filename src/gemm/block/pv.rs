//! Output pipeline for attention: O = P V for one query block.
//!
//! P is the softmaxed score matrix the vector cores wrote back to the
//! workspace, already narrowed to the operand element type. V tiles stream
//! through an L1 ping-pong alongside the matching P tiles, and the products
//! accumulate across the whole key/value sequence in a single L0C tile that
//! flushes once at the end.
//!
//! Event ids are offset from the score pipeline's so both can be armed on
//! the same core at once.

use crate::arch::{ArchSpec, EventId, EventTable, HardEvent, LocalTensor, PoolKind, Resource};
use crate::coord::{ceil_div, MatrixCoord};
use crate::device::{Element, GmTensor};
use crate::error::LaunchError;
use crate::gemm::block::qk::{AttnConfig, KvTile};
use crate::gemm::block::StageRing;
use crate::gemm::tile::{
    copy_gm_region_to_local, copy_l0c_to_gm, copy_local_region_to_local, tile_mmad,
};
use crate::layout::{Layout, Nz, RowMajor, Zn};

const PV_FIX_EVENT: EventId = EventId(2);

pub struct BlockPv<E: Element> {
    config: AttnConfig,
    l1_p: [LocalTensor<E>; 2],
    l1_v: [LocalTensor<E>; 2],
    l0_a: [LocalTensor<E>; 2],
    l0_b: [LocalTensor<E>; 2],
    l0_c: LocalTensor<f32>,
    p_layout: Nz,
    v_layout: Nz,
    a_l0_layout: Zn,
    b_l0_layout: Nz,
    l1_ring: StageRing,
    l0_ring: StageRing,
    flushed: bool,
}

impl<E: Element> BlockPv<E> {
    pub fn new(
        arch: &ArchSpec,
        res: &mut Resource,
        events: &mut EventTable,
        config: AttnConfig,
    ) -> Result<Self, LaunchError> {
        config.validate::<E>(arch)?;
        let p_layout = Nz::make_layout::<E>(config.q_tile, config.kv_tile);
        let v_layout = Nz::make_layout::<E>(config.kv_tile, config.head_dim);
        let a_l0_layout = Zn::make_layout::<E>(config.q_tile, config.split);
        let b_l0_layout = Nz::make_layout::<E>(config.split, config.head_dim);

        let l1_p = [
            res.lease(PoolKind::L1, p_layout.capacity() as u32)?,
            res.lease(PoolKind::L1, p_layout.capacity() as u32)?,
        ];
        let l1_v = [
            res.lease(PoolKind::L1, v_layout.capacity() as u32)?,
            res.lease(PoolKind::L1, v_layout.capacity() as u32)?,
        ];
        let l0_a = [
            res.lease(PoolKind::L0A, a_l0_layout.capacity() as u32)?,
            res.lease(PoolKind::L0A, a_l0_layout.capacity() as u32)?,
        ];
        let l0_b = [
            res.lease(PoolKind::L0B, b_l0_layout.capacity() as u32)?,
            res.lease(PoolKind::L0B, b_l0_layout.capacity() as u32)?,
        ];
        let l0_c = res.lease(PoolKind::L0C, config.q_tile * config.head_dim)?;

        let l1_ring = StageRing::new(2, 4);
        let l0_ring = StageRing::new(2, 4);
        for slot in 0..2 {
            events.set(HardEvent::Mte1Mte2, l1_ring.event_id_of(slot, 0));
            events.set(HardEvent::Mte1Mte2, l1_ring.event_id_of(slot, 1));
            events.set(HardEvent::MMte1, l0_ring.event_id_of(slot, 0));
            events.set(HardEvent::MMte1, l0_ring.event_id_of(slot, 1));
        }

        Ok(BlockPv {
            config,
            l1_p,
            l1_v,
            l0_a,
            l0_b,
            l0_c,
            p_layout,
            v_layout,
            a_l0_layout,
            b_l0_layout,
            l1_ring,
            l0_ring,
            flushed: false,
        })
    }

    /// Accumulate P V over all key/value tiles and flush the block's output
    /// rows to `out`. `p` holds the softmaxed scores for this block, packed
    /// `m_actual x total_rows` where tile `j` starts at its logical column.
    #[allow(clippy::too_many_arguments)]
    pub fn run_block<Out: Element>(
        &mut self,
        res: &mut Resource,
        events: &mut EventTable,
        p: &GmTensor<E>,
        p_layout: &RowMajor,
        m_actual: u32,
        kv_tiles: &[KvTile<E>],
        out: &GmTensor<Out>,
        out_layout: &RowMajor,
    ) {
        let d = self.config.head_dim;
        let c_layout = Zn::make_layout_in_l0c(MatrixCoord::new(m_actual, d));
        if self.flushed {
            events.wait(HardEvent::FixM, PV_FIX_EVENT);
            self.flushed = false;
        }

        let mut col0 = 0u32;
        for (j, tile) in kv_tiles.iter().enumerate() {
            let slot = self.l1_ring.slot();
            events.wait(HardEvent::Mte1Mte2, self.l1_ring.event_id(0));
            copy_gm_region_to_local(
                res,
                &self.l1_p[slot],
                &self.p_layout,
                p,
                p_layout,
                MatrixCoord::new(0, col0),
                MatrixCoord::new(m_actual, tile.rows),
            );
            events.set(HardEvent::Mte2Mte1, self.l1_ring.event_id(0));
            events.wait(HardEvent::Mte1Mte2, self.l1_ring.event_id(1));
            copy_gm_region_to_local(
                res,
                &self.l1_v[slot],
                &self.v_layout,
                &tile.data,
                &tile.layout,
                MatrixCoord::new(0, 0),
                MatrixCoord::new(tile.rows, d),
            );
            events.set(HardEvent::Mte2Mte1, self.l1_ring.event_id(1));
            events.wait(HardEvent::Mte2Mte1, self.l1_ring.event_id(0));
            events.wait(HardEvent::Mte2Mte1, self.l1_ring.event_id(1));

            let chunks = ceil_div(tile.rows, self.config.split);
            for c in 0..chunks {
                let r0 = c * self.config.split;
                let r_actual = (tile.rows - r0).min(self.config.split);
                let l0_slot = self.l0_ring.slot();

                events.wait(HardEvent::MMte1, self.l0_ring.event_id(0));
                copy_local_region_to_local(
                    res,
                    &self.l0_a[l0_slot],
                    &self.a_l0_layout,
                    &self.l1_p[slot],
                    &self.p_layout,
                    MatrixCoord::new(0, r0),
                    MatrixCoord::new(m_actual, r_actual),
                );
                events.set(HardEvent::Mte1M, self.l0_ring.event_id(0));

                events.wait(HardEvent::MMte1, self.l0_ring.event_id(1));
                copy_local_region_to_local(
                    res,
                    &self.l0_b[l0_slot],
                    &self.b_l0_layout,
                    &self.l1_v[slot],
                    &self.v_layout,
                    MatrixCoord::new(r0, 0),
                    MatrixCoord::new(r_actual, d),
                );
                events.set(HardEvent::Mte1M, self.l0_ring.event_id(1));

                events.wait(HardEvent::Mte1M, self.l0_ring.event_id(0));
                events.wait(HardEvent::Mte1M, self.l0_ring.event_id(1));
                tile_mmad(
                    res,
                    &self.l0_c,
                    &c_layout,
                    &self.l0_a[l0_slot],
                    &self.a_l0_layout,
                    &self.l0_b[l0_slot],
                    &self.b_l0_layout,
                    m_actual,
                    d,
                    r_actual,
                    j == 0 && c == 0,
                );
                events.set(HardEvent::MMte1, self.l0_ring.event_id(0));
                events.set(HardEvent::MMte1, self.l0_ring.event_id(1));
                self.l0_ring.advance();
            }

            events.set(HardEvent::Mte1Mte2, self.l1_ring.event_id(0));
            events.set(HardEvent::Mte1Mte2, self.l1_ring.event_id(1));
            self.l1_ring.advance();
            col0 += tile.rows;
        }

        events.set(HardEvent::MFix, PV_FIX_EVENT);
        events.wait(HardEvent::MFix, PV_FIX_EVENT);
        copy_l0c_to_gm(
            res,
            out,
            out_layout,
            &self.l0_c,
            &c_layout,
            MatrixCoord::new(m_actual, d),
            false,
        );
        events.set(HardEvent::FixM, PV_FIX_EVENT);
        self.flushed = true;
    }

    pub fn finish(&mut self, events: &mut EventTable) {
        for slot in 0..2 {
            events.wait(HardEvent::Mte1Mte2, self.l1_ring.event_id_of(slot, 0));
            events.wait(HardEvent::Mte1Mte2, self.l1_ring.event_id_of(slot, 1));
            events.wait(HardEvent::MMte1, self.l0_ring.event_id_of(slot, 0));
            events.wait(HardEvent::MMte1, self.l0_ring.event_id_of(slot, 1));
        }
        if self.flushed {
            events.wait(HardEvent::FixM, PV_FIX_EVENT);
            self.flushed = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::CoreKind;
    use crate::test_utils::{assert_close, naive_matmul, random_f16};
    use crate::coord::GemmCoord;
    use half::f16;

    #[test]
    fn test_output_matches_reference() {
        let config = AttnConfig {
            q_tile: 16,
            kv_tile: 32,
            head_dim: 64,
            split: 16,
        };
        let arch = ArchSpec::atlas_a2();
        let mut res = Resource::new(&arch, CoreKind::Aic);
        let mut events = EventTable::new();
        let mut pv: BlockPv<f16> = BlockPv::new(&arch, &mut res, &mut events, config).unwrap();

        let (m, nk, d) = (16u32, 80u32, 64u32);
        let p = GmTensor::from_vec(random_f16((m * nk) as usize, 31));
        let v = GmTensor::from_vec(random_f16((nk * d) as usize, 32));
        let v_layout = RowMajor::new(nk, d);
        let kv_tiles: Vec<KvTile<f16>> = (0..nk)
            .step_by(config.kv_tile as usize)
            .map(|row0| {
                let rows = (nk - row0).min(config.kv_tile);
                KvTile {
                    data: v.at(v_layout.offset(MatrixCoord::new(row0, 0)) as usize),
                    layout: v_layout.tile(MatrixCoord::new(rows, d)),
                    rows,
                }
            })
            .collect();
        let out: GmTensor<f32> = GmTensor::new((m * d) as usize);

        pv.run_block(
            &mut res,
            &mut events,
            &p,
            &RowMajor::new(m, nk),
            m,
            &kv_tiles,
            &out,
            &RowMajor::new(m, d),
        );
        pv.finish(&mut events);
        events.assert_quiesced();

        let expect = naive_matmul(&p.to_vec(), &v.to_vec(), GemmCoord::new(m, d, nk));
        assert_close(&out.to_vec(), &expect, 1e-2);
    }

    #[test]
    fn test_two_blocks_reuse_accumulator() {
        let config = AttnConfig {
            q_tile: 16,
            kv_tile: 16,
            head_dim: 16,
            split: 16,
        };
        let arch = ArchSpec::atlas_a2();
        let mut res = Resource::new(&arch, CoreKind::Aic);
        let mut events = EventTable::new();
        let mut pv: BlockPv<f16> = BlockPv::new(&arch, &mut res, &mut events, config).unwrap();

        let v = GmTensor::from_vec(random_f16(16 * 16, 41));
        let v_layout = RowMajor::new(16, 16);
        let out: GmTensor<f32> = GmTensor::new(16 * 16);
        for seed in [42u64, 43] {
            let p = GmTensor::from_vec(random_f16(16 * 16, seed));
            let tiles = [KvTile {
                data: v.clone(),
                layout: v_layout,
                rows: 16,
            }];
            pv.run_block(
                &mut res,
                &mut events,
                &p,
                &RowMajor::new(16, 16),
                16,
                &tiles,
                &out,
                &RowMajor::new(16, 16),
            );
            let expect = naive_matmul(&p.to_vec(), &v.to_vec(), GemmCoord::new(16, 16, 16));
            assert_close(&out.to_vec(), &expect, 1e-2);
        }
        pv.finish(&mut events);
        events.assert_quiesced();
    }
}
