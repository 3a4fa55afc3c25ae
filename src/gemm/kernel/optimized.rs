//! Plain GEMM driver over the double-buffered block engine.
//!
//! Tasks are dealt round-robin across the matrix cores; each core walks its
//! slice of the swizzled grid with cross-block prefetch. The vector cores
//! stay idle.

use std::marker::PhantomData;

use tracing::debug;

use crate::arch::ArchSpec;
use crate::coord::{GemmCoord, MatrixCoord};
use crate::device::{CoreCtx, DeviceKernel, Element, GmTensor};
use crate::error::LaunchError;
use crate::gemm::block::{BlockArgs, BlockGemm};
use crate::gemm::scheduler::{BlockScheduler, SwizzleDirection};
use crate::gemm::TileConfig;
use crate::layout::{Layout, RowMajor};

/// Operand views of one GEMM launch. All matrices are row-major.
pub struct MatmulParams<E: Element> {
    pub problem: GemmCoord,
    pub a: GmTensor<E>,
    pub a_layout: RowMajor,
    pub b: GmTensor<E>,
    pub b_layout: RowMajor,
    pub d: GmTensor<E>,
    pub d_layout: RowMajor,
    pub swizzle_offset: u32,
    pub direction: SwizzleDirection,
}

/// Positions one scheduled block inside row-major operands.
pub(crate) fn block_operands<E: Element>(
    a: &GmTensor<E>,
    a_layout: &RowMajor,
    b: &GmTensor<E>,
    b_layout: &RowMajor,
    tile: GemmCoord,
    sched: &BlockScheduler,
    task: u32,
) -> BlockArgs<E, RowMajor, RowMajor> {
    let coord = sched.block_coord(task);
    let actual = sched.actual_block_shape(coord);
    let row0 = coord.m() * tile.m();
    let col0 = coord.n() * tile.n();
    BlockArgs {
        a: a.at(a_layout.offset(MatrixCoord::new(row0, 0)) as usize),
        a_layout: a_layout.tile(MatrixCoord::new(actual.m(), actual.k())),
        b: b.at(b_layout.offset(MatrixCoord::new(0, col0)) as usize),
        b_layout: b_layout.tile(MatrixCoord::new(actual.k(), actual.n())),
        shape: actual,
    }
}

pub struct OptimizedMatmul<E: Element, const UNIT_FLAG: bool, const SHUFFLE_K: bool> {
    arch: ArchSpec,
    config: TileConfig,
    _marker: PhantomData<E>,
}

impl<E: Element, const UNIT_FLAG: bool, const SHUFFLE_K: bool>
    OptimizedMatmul<E, UNIT_FLAG, SHUFFLE_K>
{
    pub fn new(arch: ArchSpec, config: TileConfig) -> Result<Self, LaunchError> {
        config.validate::<E>(&arch)?;
        Ok(OptimizedMatmul {
            arch,
            config,
            _marker: PhantomData,
        })
    }
}

impl<E: Element, const UNIT_FLAG: bool, const SHUFFLE_K: bool> DeviceKernel
    for OptimizedMatmul<E, UNIT_FLAG, SHUFFLE_K>
{
    type Params = MatmulParams<E>;

    fn run_aic(&self, ctx: &mut CoreCtx, params: &MatmulParams<E>) {
        let tile = self.config.l1_tile;
        let sched = BlockScheduler::new(
            params.problem,
            MatrixCoord::new(tile.m(), tile.n()),
            params.swizzle_offset,
            params.direction,
        );
        let mut engine: BlockGemm<E, UNIT_FLAG, SHUFFLE_K> =
            match BlockGemm::new(&self.arch, &mut ctx.resource, &mut ctx.events, self.config) {
                Ok(engine) => engine,
                Err(err) => panic!("block engine setup failed: {err}"),
            };

        let total = sched.core_loops();
        let step = ctx.block_num();
        debug!(core = ctx.block_idx(), total, step, "gemm core start");
        let mut task = ctx.block_idx();
        let mut first = true;
        while task < total {
            let cur = block_operands(
                &params.a,
                &params.a_layout,
                &params.b,
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
                    &params.b,
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
    use crate::test_utils::{assert_close, naive_matmul, random_f16};
    use half::f16;

    fn run(problem: GemmCoord, aic_num: u32) -> (Vec<f32>, Vec<f32>) {
        let arch = ArchSpec::atlas_a2();
        let config = TileConfig::new(GemmCoord::new(32, 32, 32), 16);
        let kernel: OptimizedMatmul<f16, false, true> =
            OptimizedMatmul::new(arch, config).unwrap();
        let params = MatmulParams {
            problem,
            a: GmTensor::from_vec(random_f16((problem.m() * problem.k()) as usize, 61)),
            a_layout: RowMajor::new(problem.m(), problem.k()),
            b: GmTensor::from_vec(random_f16((problem.k() * problem.n()) as usize, 62)),
            b_layout: RowMajor::new(problem.k(), problem.n()),
            d: GmTensor::new((problem.m() * problem.n()) as usize),
            d_layout: RowMajor::new(problem.m(), problem.n()),
            swizzle_offset: 2,
            direction: SwizzleDirection::Zn,
        };
        launch(&arch, LaunchGeometry::new(aic_num), &kernel, &params).unwrap();
        let expect = naive_matmul(&params.a.to_vec(), &params.b.to_vec(), problem);
        let got = params.d.to_vec().iter().map(|v| v.to_f32()).collect();
        (got, expect)
    }

    #[test]
    fn test_single_core_launch() {
        let (got, expect) = run(GemmCoord::new(64, 64, 96), 1);
        assert_close(&got, &expect, 5e-2);
    }

    #[test]
    fn test_multi_core_launch_with_tails() {
        let (got, expect) = run(GemmCoord::new(112, 80, 72), 3);
        assert_close(&got, &expect, 5e-2);
    }
}
