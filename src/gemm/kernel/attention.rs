//! Attention driver: scores on the matrix cores, softmax on the paired
//! vector cores, output on the matrix cores again.
//!
//! Each query block runs one rendezvous: the matrix core writes the f32
//! score rows to its group's workspace and posts `s_ready`; the two vector
//! cores split the rows, softmax them, write the narrowed probabilities and
//! post `p_ready`; the matrix core then accumulates P V and stores the
//! output rows. The reverse side of `s_ready` keeps the matrix core from
//! overrunning the score workspace.

use std::marker::PhantomData;

use tracing::debug;

use crate::arch::{ArchSpec, CrossCoreFlagWithReverse, FlagId};
use crate::coord::ceil_div;
use crate::coord::MatrixCoord;
use crate::device::{CoreCtx, DeviceKernel, Element, GmTensor};
use crate::epilogue::SoftmaxRows;
use crate::error::LaunchError;
use crate::gemm::block::{AttnConfig, BlockPv, BlockQk, KvTile};
use crate::layout::{Layout, RowMajor};

const FLAG_S_READY: FlagId = FlagId(0);
const FLAG_S_FREE: FlagId = FlagId(1);
const FLAG_P_READY: FlagId = FlagId(2);

/// Key/value storage the driver reads tiles from.
///
/// Paged caches keep the sequence in fixed-size pages scattered through a
/// physical pool; the page table maps logical page index to physical page.
pub enum KvCache<E: Element> {
    Contiguous {
        k: GmTensor<E>,
        v: GmTensor<E>,
        rows: u32,
    },
    Paged {
        k_pool: GmTensor<E>,
        v_pool: GmTensor<E>,
        page_table: Vec<u32>,
        page_rows: u32,
        rows: u32,
    },
}

impl<E: Element> KvCache<E> {
    pub fn rows(&self) -> u32 {
        match self {
            KvCache::Contiguous { rows, .. } => *rows,
            KvCache::Paged { rows, .. } => *rows,
        }
    }

    fn tiles(&self, head_dim: u32, kv_tile: u32, select_v: bool) -> Vec<KvTile<E>> {
        match self {
            KvCache::Contiguous { k, v, rows } => {
                let data = if select_v { v } else { k };
                let layout = RowMajor::new(*rows, head_dim);
                (0..*rows)
                    .step_by(kv_tile as usize)
                    .map(|row0| {
                        let tile_rows = (*rows - row0).min(kv_tile);
                        KvTile {
                            data: data.at(layout.offset(MatrixCoord::new(row0, 0)) as usize),
                            layout: layout.tile(MatrixCoord::new(tile_rows, head_dim)),
                            rows: tile_rows,
                        }
                    })
                    .collect()
            }
            KvCache::Paged {
                k_pool,
                v_pool,
                page_table,
                page_rows,
                rows,
            } => {
                assert_eq!(
                    kv_tile, *page_rows,
                    "paged cache requires the kv tile to match the page size"
                );
                let pool = if select_v { v_pool } else { k_pool };
                let page_len = (*page_rows * head_dim) as usize;
                (0..ceil_div(*rows, *page_rows))
                    .map(|logical| {
                        let tile_rows = (*rows - logical * page_rows).min(*page_rows);
                        let physical = page_table[logical as usize];
                        KvTile {
                            data: pool.at(physical as usize * page_len),
                            layout: RowMajor::new(tile_rows, head_dim),
                            rows: tile_rows,
                        }
                    })
                    .collect()
            }
        }
    }

    pub fn k_tiles(&self, head_dim: u32, kv_tile: u32) -> Vec<KvTile<E>> {
        self.tiles(head_dim, kv_tile, false)
    }

    pub fn v_tiles(&self, head_dim: u32, kv_tile: u32) -> Vec<KvTile<E>> {
        self.tiles(head_dim, kv_tile, true)
    }
}

pub struct AttentionParams<E: Element> {
    pub q: GmTensor<E>,
    pub q_layout: RowMajor,
    pub q_rows: u32,
    pub kv: KvCache<E>,
    /// Score scale, typically `1 / sqrt(head_dim)`.
    pub scale: f32,
    pub out: GmTensor<E>,
    pub out_layout: RowMajor,
    /// Per-group f32 score workspace, `q_tile x kv rows` each.
    pub s_ws: Vec<GmTensor<f32>>,
    /// Per-group probability workspace, same extent, operand type.
    pub p_ws: Vec<GmTensor<E>>,
}

pub struct MlaAttention<E: Element> {
    arch: ArchSpec,
    config: AttnConfig,
    _marker: PhantomData<E>,
}

impl<E: Element> MlaAttention<E> {
    pub fn new(arch: ArchSpec, config: AttnConfig) -> Result<Self, LaunchError> {
        config.validate::<E>(&arch)?;
        Ok(MlaAttention {
            arch,
            config,
            _marker: PhantomData,
        })
    }

    /// Elements of one group's score or probability workspace.
    pub fn workspace_len(&self, kv_rows: u32) -> usize {
        (self.config.q_tile * kv_rows) as usize
    }
}

impl<E: Element> DeviceKernel for MlaAttention<E> {
    type Params = AttentionParams<E>;

    fn run_aic(&self, ctx: &mut CoreCtx, params: &AttentionParams<E>) {
        let d = self.config.head_dim;
        let kv_rows = params.kv.rows();
        let k_tiles = params.kv.k_tiles(d, self.config.kv_tile);
        let v_tiles = params.kv.v_tiles(d, self.config.kv_tile);
        let ws_layout = RowMajor::new(self.config.q_tile, kv_rows);

        let mut qk: BlockQk<E> =
            match BlockQk::new(&self.arch, &mut ctx.resource, &mut ctx.events, self.config) {
                Ok(engine) => engine,
                Err(err) => panic!("score engine setup failed: {err}"),
            };
        let mut pv: BlockPv<E> =
            match BlockPv::new(&self.arch, &mut ctx.resource, &mut ctx.events, self.config) {
                Ok(engine) => engine,
                Err(err) => panic!("output engine setup failed: {err}"),
            };
        let mut s_ready = CrossCoreFlagWithReverse::new(FLAG_S_READY, FLAG_S_FREE, 1);

        let group = ctx.group();
        let blocks = ceil_div(params.q_rows, self.config.q_tile);
        let step = ctx.block_num();
        debug!(group, blocks, kv_rows, "attention core start");
        let mut blk = ctx.block_idx();
        while blk < blocks {
            let row0 = blk * self.config.q_tile;
            let m_actual = (params.q_rows - row0).min(self.config.q_tile);

            qk.run_block(
                &mut ctx.resource,
                &mut ctx.events,
                &params
                    .q
                    .at(params.q_layout.offset(MatrixCoord::new(row0, 0)) as usize),
                &params.q_layout.tile(MatrixCoord::new(m_actual, d)),
                m_actual,
                &k_tiles,
                &params.s_ws[group as usize],
                &ws_layout.tile(MatrixCoord::new(m_actual, kv_rows)),
            );
            s_ready.set_from_aic(ctx.hub(), group);
            ctx.wait_flag_from_aiv(FLAG_P_READY);

            pv.run_block(
                &mut ctx.resource,
                &mut ctx.events,
                &params.p_ws[group as usize],
                &ws_layout.tile(MatrixCoord::new(m_actual, kv_rows)),
                m_actual,
                &v_tiles,
                &params
                    .out
                    .at(params.out_layout.offset(MatrixCoord::new(row0, 0)) as usize),
                &params.out_layout.tile(MatrixCoord::new(m_actual, d)),
            );
            blk += step;
        }
        qk.finish(&mut ctx.events);
        pv.finish(&mut ctx.events);
        ctx.events.assert_quiesced();
    }

    fn run_aiv(&self, ctx: &mut CoreCtx, params: &AttentionParams<E>) {
        let kv_rows = params.kv.rows();
        let ws_layout = RowMajor::new(self.config.q_tile, kv_rows);
        let softmax: SoftmaxRows<E> = match SoftmaxRows::new(&mut ctx.resource, kv_rows) {
            Ok(stage) => stage,
            Err(err) => panic!("softmax stage setup failed: {err}"),
        };
        let mut s_ready = CrossCoreFlagWithReverse::new(FLAG_S_READY, FLAG_S_FREE, 1);

        let group = ctx.group();
        let lanes = ctx.hub().aiv_per_aic();
        let lane = ctx.subblock_idx();
        let aic_num = ctx.block_num() / lanes;
        let blocks = ceil_div(params.q_rows, self.config.q_tile);
        let mut blk = group;
        while blk < blocks {
            let row0 = blk * self.config.q_tile;
            let m_actual = (params.q_rows - row0).min(self.config.q_tile);

            s_ready.wait_on_aiv(ctx.hub(), group, lane);
            // Split the block's rows between the paired vector cores.
            let per_lane = ceil_div(m_actual, lanes);
            let r0 = (lane * per_lane).min(m_actual);
            let rows = ((lane + 1) * per_lane).min(m_actual) - r0;
            if rows > 0 {
                softmax.run(
                    &mut ctx.resource,
                    &mut ctx.events,
                    &params.s_ws[group as usize],
                    &ws_layout,
                    r0,
                    rows,
                    kv_rows,
                    params.scale,
                    &params.p_ws[group as usize],
                    &ws_layout,
                );
            }
            ctx.set_flag_to_aic(FLAG_P_READY);
            blk += aic_num;
        }
        ctx.events.assert_quiesced();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{launch, LaunchGeometry};
    use crate::test_utils::{assert_close, naive_matmul, naive_softmax_rows, random_f16};
    use crate::coord::GemmCoord;
    use half::f16;

    fn reference(
        q: &[f16],
        k: &[f16],
        v: &[f16],
        q_rows: u32,
        kv_rows: u32,
        d: u32,
        scale: f32,
    ) -> Vec<f32> {
        // S = Q Kt, row softmax, probabilities narrowed to f16 as the device
        // stores them, then P V.
        let mut s = vec![0.0f32; (q_rows * kv_rows) as usize];
        for i in 0..q_rows as usize {
            for j in 0..kv_rows as usize {
                let mut acc = 0.0;
                for p in 0..d as usize {
                    acc += q[i * d as usize + p].to_f32() * k[j * d as usize + p].to_f32();
                }
                s[i * kv_rows as usize + j] = acc;
            }
        }
        naive_softmax_rows(&mut s, q_rows as usize, kv_rows as usize, scale);
        let p: Vec<f16> = s.iter().map(|v| f16::from_f32(*v)).collect();
        naive_matmul(&p, v, GemmCoord::new(q_rows, d, kv_rows))
    }

    fn config() -> AttnConfig {
        AttnConfig {
            q_tile: 16,
            kv_tile: 32,
            head_dim: 64,
            split: 32,
        }
    }

    #[test]
    fn test_attention_contiguous_matches_reference() {
        let (q_rows, kv_rows, d) = (48u32, 80u32, 64u32);
        let scale = 1.0 / (d as f32).sqrt();
        let arch = ArchSpec::atlas_a2();
        let kernel: MlaAttention<f16> = MlaAttention::new(arch, config()).unwrap();

        let q = random_f16((q_rows * d) as usize, 101);
        let k = random_f16((kv_rows * d) as usize, 102);
        let v = random_f16((kv_rows * d) as usize, 103);
        let aic_num = 2u32;
        let ws = kernel.workspace_len(kv_rows);
        let params = AttentionParams {
            q: GmTensor::from_vec(q.clone()),
            q_layout: RowMajor::new(q_rows, d),
            q_rows,
            kv: KvCache::Contiguous {
                k: GmTensor::from_vec(k.clone()),
                v: GmTensor::from_vec(v.clone()),
                rows: kv_rows,
            },
            scale,
            out: GmTensor::new((q_rows * d) as usize),
            out_layout: RowMajor::new(q_rows, d),
            s_ws: (0..aic_num).map(|_| GmTensor::new(ws)).collect(),
            p_ws: (0..aic_num).map(|_| GmTensor::new(ws)).collect(),
        };
        launch(&arch, LaunchGeometry::new(aic_num), &kernel, &params).unwrap();

        let expect = reference(&q, &k, &v, q_rows, kv_rows, d, scale);
        let got: Vec<f32> = params.out.to_vec().iter().map(|v| v.to_f32()).collect();
        assert_close(&got, &expect, 2e-2);
    }

    #[test]
    fn test_attention_paged_matches_contiguous() {
        let (q_rows, kv_rows, d) = (32u32, 72u32, 64u32);
        let cfg = config();
        let scale = 1.0 / (d as f32).sqrt();
        let arch = ArchSpec::atlas_a2();
        let kernel: MlaAttention<f16> = MlaAttention::new(arch, cfg).unwrap();

        let q = random_f16((q_rows * d) as usize, 111);
        let k = random_f16((kv_rows * d) as usize, 112);
        let v = random_f16((kv_rows * d) as usize, 113);

        // Scatter the logical pages through a larger pool in reverse order.
        let page_rows = cfg.kv_tile;
        let pages = ceil_div(kv_rows, page_rows);
        let pool_pages = pages + 2;
        let page_len = (page_rows * d) as usize;
        let mut k_pool = vec![f16::from_f32(0.0); pool_pages as usize * page_len];
        let mut v_pool = k_pool.clone();
        let page_table: Vec<u32> = (0..pages).map(|i| pool_pages - 1 - i).collect();
        for logical in 0..pages {
            let rows = (kv_rows - logical * page_rows).min(page_rows);
            let physical = page_table[logical as usize] as usize;
            let src0 = (logical * page_rows * d) as usize;
            let len = (rows * d) as usize;
            k_pool[physical * page_len..physical * page_len + len]
                .copy_from_slice(&k[src0..src0 + len]);
            v_pool[physical * page_len..physical * page_len + len]
                .copy_from_slice(&v[src0..src0 + len]);
        }

        let run = |kv: KvCache<f16>| -> Vec<f16> {
            let ws = kernel.workspace_len(kv_rows);
            let params = AttentionParams {
                q: GmTensor::from_vec(q.clone()),
                q_layout: RowMajor::new(q_rows, d),
                q_rows,
                kv,
                scale,
                out: GmTensor::new((q_rows * d) as usize),
                out_layout: RowMajor::new(q_rows, d),
                s_ws: vec![GmTensor::new(ws)],
                p_ws: vec![GmTensor::new(ws)],
            };
            launch(&arch, LaunchGeometry::new(1), &kernel, &params).unwrap();
            params.out.to_vec()
        };

        let contiguous = run(KvCache::Contiguous {
            k: GmTensor::from_vec(k.clone()),
            v: GmTensor::from_vec(v.clone()),
            rows: kv_rows,
        });
        let paged = run(KvCache::Paged {
            k_pool: GmTensor::from_vec(k_pool),
            v_pool: GmTensor::from_vec(v_pool),
            page_table,
            page_rows,
            rows: kv_rows,
        });
        // Same logical tiles in the same order, so the results agree exactly.
        assert_eq!(contiguous, paged);
    }
}
