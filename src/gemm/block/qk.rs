//! Score pipeline for attention: S = Q Kᵀ for one query block.
//!
//! Q is staged into L1 once per block. K tiles stream through an L1
//! ping-pong, transposed on load so the head dimension becomes the reduction
//! axis, and the head dimension itself is split into chunks that accumulate
//! in an L0C ping-pong. Each finished score tile flushes straight to the
//! score workspace in global memory, where the paired vector cores pick it
//! up for the softmax.

use crate::arch::{ArchSpec, EventId, EventTable, HardEvent, LocalTensor, PoolKind, Resource};
use crate::coord::{ceil_div, MatrixCoord};
use crate::device::{Element, GmTensor};
use crate::error::LaunchError;
use crate::gemm::block::StageRing;
use crate::gemm::tile::{
    copy_gm_region_to_local, copy_gm_region_to_local_transposed, copy_l0c_to_gm,
    copy_local_region_to_local, tile_mmad,
};
use crate::layout::{Layout, Nz, RowMajor, Zn, C0_NUM_PER_FRACTAL};

/// One tile of the key (or value) sequence. With a paged cache these views
/// point into whatever physical page holds the tile; positions stay logical.
pub struct KvTile<E: Element> {
    pub data: GmTensor<E>,
    pub layout: RowMajor,
    /// Sequence rows in this tile; the last tile may be short.
    pub rows: u32,
}

/// Tile shapes of the attention block pipelines.
#[derive(Debug, Clone, Copy)]
pub struct AttnConfig {
    /// Query rows per block.
    pub q_tile: u32,
    /// Key/value sequence rows per tile.
    pub kv_tile: u32,
    /// Head dimension.
    pub head_dim: u32,
    /// Head-dimension chunk per mmad step in the score pipeline, and
    /// reduction chunk in the output pipeline.
    pub split: u32,
}

impl AttnConfig {
    pub fn validate<E: Element>(&self, arch: &ArchSpec) -> Result<(), LaunchError> {
        for (name, v) in [
            ("q tile", self.q_tile),
            ("kv tile", self.kv_tile),
            ("head dim", self.head_dim),
            ("split", self.split),
        ] {
            if v == 0 || v % C0_NUM_PER_FRACTAL != 0 {
                return Err(LaunchError::InvalidConfig(format!(
                    "attention {} = {} must be a positive multiple of {}",
                    name, v, C0_NUM_PER_FRACTAL
                )));
            }
        }
        if self.split > self.head_dim {
            return Err(LaunchError::InvalidConfig(format!(
                "split {} exceeds head dim {}",
                self.split, self.head_dim
            )));
        }
        let esize = std::mem::size_of::<E>() as u32;
        let l1_need = (self.q_tile * self.head_dim
            + 2 * self.kv_tile * self.head_dim
            + 2 * self.q_tile * self.kv_tile)
            * esize;
        if l1_need > arch.l1_bytes {
            return Err(LaunchError::ScratchOverflow {
                pool: PoolKind::L1,
                needed: l1_need,
                capacity: arch.l1_bytes,
            });
        }
        let l0c_need = 2 * self.q_tile * self.kv_tile.max(self.head_dim) * 4;
        if l0c_need > arch.l0c_bytes {
            return Err(LaunchError::ScratchOverflow {
                pool: PoolKind::L0C,
                needed: l0c_need,
                capacity: arch.l0c_bytes,
            });
        }
        Ok(())
    }
}

const Q_EVENT: EventId = EventId(2);

pub struct BlockQk<E: Element> {
    config: AttnConfig,
    l1_q: LocalTensor<E>,
    l1_kt: [LocalTensor<E>; 2],
    l0_a: [LocalTensor<E>; 2],
    l0_b: [LocalTensor<E>; 2],
    l0_c: [LocalTensor<f32>; 2],
    q_layout: Nz,
    kt_layout: Nz,
    a_l0_layout: Zn,
    b_l0_layout: Nz,
    kv_ring: StageRing,
    l0_ring: StageRing,
    flushed: [bool; 2],
}

impl<E: Element> BlockQk<E> {
    pub fn new(
        arch: &ArchSpec,
        res: &mut Resource,
        events: &mut EventTable,
        config: AttnConfig,
    ) -> Result<Self, LaunchError> {
        config.validate::<E>(arch)?;
        let q_layout = Nz::make_layout::<E>(config.q_tile, config.head_dim);
        // K is staged transposed: head dim rows, sequence columns.
        let kt_layout = Nz::make_layout::<E>(config.head_dim, config.kv_tile);
        let a_l0_layout = Zn::make_layout::<E>(config.q_tile, config.split);
        let b_l0_layout = Nz::make_layout::<E>(config.split, config.kv_tile);

        let l1_q = res.lease(PoolKind::L1, q_layout.capacity() as u32)?;
        let l1_kt = [
            res.lease(PoolKind::L1, kt_layout.capacity() as u32)?,
            res.lease(PoolKind::L1, kt_layout.capacity() as u32)?,
        ];
        let l0_a = [
            res.lease(PoolKind::L0A, a_l0_layout.capacity() as u32)?,
            res.lease(PoolKind::L0A, a_l0_layout.capacity() as u32)?,
        ];
        let l0_b = [
            res.lease(PoolKind::L0B, b_l0_layout.capacity() as u32)?,
            res.lease(PoolKind::L0B, b_l0_layout.capacity() as u32)?,
        ];
        let l0_c = [
            res.lease(PoolKind::L0C, config.q_tile * config.kv_tile)?,
            res.lease(PoolKind::L0C, config.q_tile * config.kv_tile)?,
        ];

        let kv_ring = StageRing::new(2, 0);
        let l0_ring = StageRing::new(2, 0);
        for slot in 0..2 {
            events.set(HardEvent::Mte1Mte2, kv_ring.event_id_of(slot, 0));
            events.set(HardEvent::MMte1, l0_ring.event_id_of(slot, 0));
            events.set(HardEvent::MMte1, l0_ring.event_id_of(slot, 1));
        }
        events.set(HardEvent::Mte1Mte2, Q_EVENT);

        Ok(BlockQk {
            config,
            l1_q,
            l1_kt,
            l0_a,
            l0_b,
            l0_c,
            q_layout,
            kt_layout,
            a_l0_layout,
            b_l0_layout,
            kv_ring,
            l0_ring,
            flushed: [false; 2],
        })
    }

    /// Score one query block against `kv_tiles`, writing `m_actual x total`
    /// scores into `s` (logical sequence order, tails packed).
    #[allow(clippy::too_many_arguments)]
    pub fn run_block(
        &mut self,
        res: &mut Resource,
        events: &mut EventTable,
        q: &GmTensor<E>,
        q_layout: &RowMajor,
        m_actual: u32,
        kv_tiles: &[KvTile<E>],
        s: &GmTensor<f32>,
        s_layout: &RowMajor,
    ) {
        let d = self.config.head_dim;
        let splits = ceil_div(d, self.config.split);

        events.wait(HardEvent::Mte1Mte2, Q_EVENT);
        copy_gm_region_to_local(
            res,
            &self.l1_q,
            &self.q_layout,
            q,
            q_layout,
            MatrixCoord::new(0, 0),
            MatrixCoord::new(m_actual, d),
        );
        events.set(HardEvent::Mte2Mte1, Q_EVENT);
        events.wait(HardEvent::Mte2Mte1, Q_EVENT);

        let mut col0 = 0u32;
        for (j, tile) in kv_tiles.iter().enumerate() {
            let slot = self.kv_ring.slot();
            events.wait(HardEvent::Mte1Mte2, self.kv_ring.event_id(0));
            copy_gm_region_to_local_transposed(
                res,
                &self.l1_kt[slot],
                &self.kt_layout,
                &tile.data,
                &tile.layout,
                MatrixCoord::new(0, 0),
                MatrixCoord::new(d, tile.rows),
            );
            events.set(HardEvent::Mte2Mte1, self.kv_ring.event_id(0));
            events.wait(HardEvent::Mte2Mte1, self.kv_ring.event_id(0));

            let c_slot = j % 2;
            let c_layout = Zn::make_layout_in_l0c(MatrixCoord::new(m_actual, tile.rows));
            for e in 0..splits {
                let e0 = e * self.config.split;
                let e_actual = (d - e0).min(self.config.split);
                let l0_slot = self.l0_ring.slot();

                events.wait(HardEvent::MMte1, self.l0_ring.event_id(0));
                copy_local_region_to_local(
                    res,
                    &self.l0_a[l0_slot],
                    &self.a_l0_layout,
                    &self.l1_q,
                    &self.q_layout,
                    MatrixCoord::new(0, e0),
                    MatrixCoord::new(m_actual, e_actual),
                );
                events.set(HardEvent::Mte1M, self.l0_ring.event_id(0));

                events.wait(HardEvent::MMte1, self.l0_ring.event_id(1));
                copy_local_region_to_local(
                    res,
                    &self.l0_b[l0_slot],
                    &self.b_l0_layout,
                    &self.l1_kt[slot],
                    &self.kt_layout,
                    MatrixCoord::new(e0, 0),
                    MatrixCoord::new(e_actual, tile.rows),
                );
                events.set(HardEvent::Mte1M, self.l0_ring.event_id(1));

                events.wait(HardEvent::Mte1M, self.l0_ring.event_id(0));
                events.wait(HardEvent::Mte1M, self.l0_ring.event_id(1));
                if e == 0 && self.flushed[c_slot] {
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
                    m_actual,
                    tile.rows,
                    e_actual,
                    e == 0,
                );
                events.set(HardEvent::MMte1, self.l0_ring.event_id(0));
                events.set(HardEvent::MMte1, self.l0_ring.event_id(1));
                self.l0_ring.advance();
            }

            events.set(HardEvent::MFix, EventId(c_slot as u8));
            events.wait(HardEvent::MFix, EventId(c_slot as u8));
            copy_l0c_to_gm(
                res,
                &s.at(s_layout.offset(MatrixCoord::new(0, col0)) as usize),
                &s_layout.tile(MatrixCoord::new(m_actual, tile.rows)),
                &self.l0_c[c_slot],
                &c_layout,
                MatrixCoord::new(m_actual, tile.rows),
                false,
            );
            events.set(HardEvent::FixM, EventId(c_slot as u8));
            self.flushed[c_slot] = true;

            events.set(HardEvent::Mte1Mte2, self.kv_ring.event_id(0));
            self.kv_ring.advance();
            col0 += tile.rows;
        }

        events.set(HardEvent::Mte1Mte2, Q_EVENT);
    }

    /// Drain the armed events; balances the table.
    pub fn finish(&mut self, events: &mut EventTable) {
        for slot in 0..2 {
            events.wait(HardEvent::Mte1Mte2, self.kv_ring.event_id_of(slot, 0));
            events.wait(HardEvent::MMte1, self.l0_ring.event_id_of(slot, 0));
            events.wait(HardEvent::MMte1, self.l0_ring.event_id_of(slot, 1));
        }
        events.wait(HardEvent::Mte1Mte2, Q_EVENT);
        for (slot, flushed) in self.flushed.iter_mut().enumerate() {
            if *flushed {
                events.wait(HardEvent::FixM, EventId(slot as u8));
                *flushed = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::CoreKind;
    use crate::test_utils::{assert_close, random_f16};
    use half::f16;

    #[test]
    fn test_scores_match_reference() {
        let config = AttnConfig {
            q_tile: 16,
            kv_tile: 32,
            head_dim: 64,
            split: 32,
        };
        let arch = ArchSpec::atlas_a2();
        let mut res = Resource::new(&arch, CoreKind::Aic);
        let mut events = EventTable::new();
        let mut qk: BlockQk<f16> = BlockQk::new(&arch, &mut res, &mut events, config).unwrap();

        let (m, nk, d) = (16u32, 80u32, 64u32);
        let q = GmTensor::from_vec(random_f16((m * d) as usize, 21));
        let k = GmTensor::from_vec(random_f16((nk * d) as usize, 22));
        let k_layout = RowMajor::new(nk, d);
        let kv_tiles: Vec<KvTile<f16>> = (0..nk)
            .step_by(config.kv_tile as usize)
            .map(|row0| {
                let rows = (nk - row0).min(config.kv_tile);
                KvTile {
                    data: k.at(k_layout.offset(MatrixCoord::new(row0, 0)) as usize),
                    layout: k_layout.tile(MatrixCoord::new(rows, d)),
                    rows,
                }
            })
            .collect();
        let s: GmTensor<f32> = GmTensor::new((m * nk) as usize);
        let s_layout = RowMajor::new(m, nk);

        qk.run_block(
            &mut res,
            &mut events,
            &q,
            &RowMajor::new(m, d),
            m,
            &kv_tiles,
            &s,
            &s_layout,
        );
        qk.finish(&mut events);
        events.assert_quiesced();

        // Reference: S[i][j] = sum_p Q[i][p] * K[j][p].
        let qv = q.to_vec();
        let kv = k.to_vec();
        let mut expect = vec![0.0f32; (m * nk) as usize];
        for i in 0..m as usize {
            for j in 0..nk as usize {
                let mut acc = 0.0;
                for p in 0..d as usize {
                    acc += qv[i * d as usize + p].to_f32() * kv[j * d as usize + p].to_f32();
                }
                expect[i * nk as usize + j] = acc;
            }
        }
        assert_close(&s.to_vec(), &expect, 1e-2);
    }
}
