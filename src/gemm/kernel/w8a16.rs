//! W8A16 matmul: int8 weights, f16 activations.
//!
//! The vector cores dequantize the weight matrix into a half-precision
//! workspace, each covering a disjoint column range; a cross-core flag then
//! releases the matrix cores to run the regular block pipeline with the
//! workspace as the B operand.

use tracing::debug;

use crate::arch::{ArchSpec, FlagId};
use crate::coord::{ceil_div, GemmCoord, MatrixCoord};
use crate::device::{CoreCtx, DeviceKernel, Element, GmTensor};
use crate::error::LaunchError;
use crate::gemm::block::{BlockGemm, DequantB, DequantConfig};
use crate::gemm::kernel::optimized::block_operands;
use crate::gemm::scheduler::{BlockScheduler, SwizzleDirection};
use crate::gemm::TileConfig;
use crate::layout::{Layout, RowMajor};
use half::f16;

const FLAG_B_READY: FlagId = FlagId(0);

pub struct W8a16Params {
    pub problem: GemmCoord,
    pub a: GmTensor<f16>,
    pub a_layout: RowMajor,
    /// Quantized weights, `k x n` row-major.
    pub b_q: GmTensor<i8>,
    pub b_layout: RowMajor,
    /// Per-column quantization parameters, length `n`.
    pub scale: GmTensor<f32>,
    pub zero: GmTensor<f32>,
    pub d: GmTensor<f16>,
    pub d_layout: RowMajor,
    /// Dequantized weights, sized like `b_q`.
    pub wb: GmTensor<f16>,
    pub swizzle_offset: u32,
    pub direction: SwizzleDirection,
}

pub struct W8a16Matmul {
    arch: ArchSpec,
    config: TileConfig,
    dequant: DequantConfig,
}

impl W8a16Matmul {
    pub fn new(
        arch: ArchSpec,
        config: TileConfig,
        dequant: DequantConfig,
    ) -> Result<Self, LaunchError> {
        config.validate::<f16>(&arch)?;
        Ok(W8a16Matmul {
            arch,
            config,
            dequant,
        })
    }
}

impl DeviceKernel for W8a16Matmul {
    type Params = W8a16Params;

    fn run_aiv(&self, ctx: &mut CoreCtx, params: &W8a16Params) {
        let mut stage =
            match DequantB::new(&self.arch, &mut ctx.resource, &mut ctx.events, self.dequant) {
                Ok(stage) => stage,
                Err(err) => panic!("dequant stage setup failed: {err}"),
            };

        // Disjoint column ranges per vector core, walked in tile windows.
        let (k, n) = (params.problem.k(), params.problem.n());
        let lanes = ctx.block_num();
        let lane = ctx.block_idx();
        let per_lane = ceil_div(n, lanes);
        let col_lo = (lane * per_lane).min(n);
        let col_hi = ((lane + 1) * per_lane).min(n);
        debug!(lane, col_lo, col_hi, "dequant lane start");

        let wb_layout = params.b_layout;
        let mut col0 = col_lo;
        while col0 < col_hi {
            let cols = (col_hi - col0).min(self.dequant.n_tile);
            stage.load_params(
                &mut ctx.resource,
                &mut ctx.events,
                &params.scale,
                &params.zero,
                col0,
                cols,
            );
            let mut row0 = 0;
            while row0 < k {
                let rows = (k - row0).min(self.dequant.k_tile);
                stage.dequant_tile(
                    &mut ctx.resource,
                    &mut ctx.events,
                    &params.b_q,
                    &params.b_layout,
                    MatrixCoord::new(row0, col0),
                    MatrixCoord::new(rows, cols),
                    &params.wb,
                    &wb_layout,
                );
                row0 += rows;
            }
            col0 += cols;
        }
        stage.finish(&mut ctx.events);
        ctx.events.assert_quiesced();

        ctx.barrier_same_kind();
        ctx.set_flag_to_aic(FLAG_B_READY);
    }

    fn run_aic(&self, ctx: &mut CoreCtx, params: &W8a16Params) {
        ctx.wait_flag_from_aiv(FLAG_B_READY);

        let tile = self.config.l1_tile;
        let sched = BlockScheduler::new(
            params.problem,
            MatrixCoord::new(tile.m(), tile.n()),
            params.swizzle_offset,
            params.direction,
        );
        let mut engine: BlockGemm<f16, false, false> =
            match BlockGemm::new(&self.arch, &mut ctx.resource, &mut ctx.events, self.config) {
                Ok(engine) => engine,
                Err(err) => panic!("block engine setup failed: {err}"),
            };

        let total = sched.core_loops();
        let step = ctx.block_num();
        let mut task = ctx.block_idx();
        let mut first = true;
        while task < total {
            let cur = block_operands(
                &params.a,
                &params.a_layout,
                &params.wb,
                &params.b_layout,
                tile,
                &sched,
                task,
            );
            let next_task = task + step;
            let next = if next_task < total {
                Some(block_operands(
                    &params.a,
                    &params.a_layout,
                    &params.wb,
                    &params.b_layout,
                    tile,
                    &sched,
                    next_task,
                ))
            } else {
                None
            };
            let coord = sched.block_coord(task);
            let row0 = coord.m() * tile.m();
            let col0 = coord.n() * tile.n();
            let out = params
                .d
                .at(params.d_layout.offset(MatrixCoord::new(row0, col0)) as usize);
            let out_layout = params.d_layout.tile(cur.shape.mn());
            engine.run_block(
                &mut ctx.resource,
                &mut ctx.events,
                &cur,
                next.as_ref().map(|args| (args, next_task)),
                &out,
                &out_layout,
                first,
                task,
            );
            first = false;
            task = next_task;
        }
        engine.finish(&mut ctx.events);
        ctx.events.assert_quiesced();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{launch, LaunchGeometry};
    use crate::test_utils::{assert_close, naive_matmul, random_f16, random_f32, random_i8};

    #[test]
    fn test_w8a16_matches_dequantized_reference() {
        let problem = GemmCoord::new(48, 40, 64);
        let arch = ArchSpec::atlas_a2();
        let config = TileConfig::new(GemmCoord::new(32, 32, 32), 16);
        let dequant = DequantConfig {
            k_tile: 32,
            n_tile: 16,
        };
        let kernel = W8a16Matmul::new(arch, config, dequant).unwrap();

        let (m, n, k) = (problem.m(), problem.n(), problem.k());
        let scale: Vec<f32> = random_f32(n as usize, 121)
            .iter()
            .map(|v| v.abs() * 0.02 + 0.005)
            .collect();
        let zero = random_f32(n as usize, 122);
        let b_q = random_i8((k * n) as usize, 123);
        let params = W8a16Params {
            problem,
            a: GmTensor::from_vec(random_f16((m * k) as usize, 124)),
            a_layout: RowMajor::new(m, k),
            b_q: GmTensor::from_vec(b_q.clone()),
            b_layout: RowMajor::new(k, n),
            scale: GmTensor::from_vec(scale.clone()),
            zero: GmTensor::from_vec(zero.clone()),
            d: GmTensor::new((m * n) as usize),
            d_layout: RowMajor::new(m, n),
            wb: GmTensor::new((k * n) as usize),
            swizzle_offset: 1,
            direction: SwizzleDirection::Zn,
        };
        launch(&arch, LaunchGeometry::new(2), &kernel, &params).unwrap();

        // Reference multiplies against the f16 weights the device produced.
        let b_deq: Vec<f16> = b_q
            .iter()
            .enumerate()
            .map(|(i, &q)| {
                let col = i % n as usize;
                f16::from_f32((q as f32 - zero[col]) * scale[col])
            })
            .collect();
        let expect = naive_matmul(&params.a.to_vec(), &b_deq, problem);
        let got: Vec<f32> = params.d.to_vec().iter().map(|v| v.to_f32()).collect();
        assert_close(&got, &expect, 0.2);
    }
}
