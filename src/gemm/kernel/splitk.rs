//! Split-K GEMM: the matrix cores compute k slices into an f32 workspace,
//! then the vector cores reduce the slices and narrow into the output.
//!
//! A cross-core flag hands the workspace from the matrix side to the vector
//! side; the vector cores barrier among themselves first so every group's
//! slices are complete before any element is reduced.

use std::marker::PhantomData;

use tracing::debug;

use crate::arch::{
    ArchSpec, EventId, EventTable, FlagId, HardEvent, LocalTensor, PoolKind, Resource,
};
use crate::coord::{GemmCoord, MatrixCoord};
use crate::device::{CoreCtx, DeviceKernel, Element, GmTensor};
use crate::error::LaunchError;
use crate::gemm::block::{BlockArgs, BlockGemm};
use crate::gemm::scheduler::{SplitkScheduler, SwizzleDirection};
use crate::gemm::TileConfig;
use crate::layout::{Layout, RowMajor};

const FLAG_SLICES_DONE: FlagId = FlagId(0);
const REDUCE_EVENT: EventId = EventId(0);
/// Elements reduced per pass through the unified buffer.
const REDUCE_CHUNK: u32 = 2048;

pub struct SplitkParams<E: Element> {
    pub problem: GemmCoord,
    pub a: GmTensor<E>,
    pub a_layout: RowMajor,
    pub b: GmTensor<E>,
    pub b_layout: RowMajor,
    pub d: GmTensor<E>,
    pub d_layout: RowMajor,
    /// f32 partials, `splitk_factor` stacked `m x n` slices.
    pub workspace: GmTensor<f32>,
    pub splitk_factor: u32,
    pub swizzle_offset: u32,
    pub direction: SwizzleDirection,
}

/// Vector-core slice reduction with a narrowing store.
///
/// Accumulates in f32 and converts once at the end, so the destination
/// precision never leaks into the sum.
pub struct ReduceAdd<Out: Element> {
    ub_acc: LocalTensor<f32>,
    ub_in: LocalTensor<f32>,
    ub_out: LocalTensor<Out>,
}

impl<Out: Element> ReduceAdd<Out> {
    pub fn new(res: &mut Resource) -> Result<Self, LaunchError> {
        Ok(ReduceAdd {
            ub_acc: res.lease(PoolKind::Ub, REDUCE_CHUNK)?,
            ub_in: res.lease(PoolKind::Ub, REDUCE_CHUNK)?,
            ub_out: res.lease(PoolKind::Ub, REDUCE_CHUNK)?,
        })
    }

    /// Reduce `slices` stacked runs of `slice_len` over the element range
    /// `[start, start + len)` and store the narrowed sums into `dst`.
    #[allow(clippy::too_many_arguments)]
    pub fn reduce(
        &self,
        res: &mut Resource,
        events: &mut EventTable,
        workspace: &GmTensor<f32>,
        slices: u32,
        slice_len: usize,
        start: usize,
        len: usize,
        dst: &GmTensor<Out>,
    ) {
        let mut off = start;
        let end = start + len;
        while off < end {
            let chunk = (end - off).min(REDUCE_CHUNK as usize);
            workspace.with(|data| {
                for i in 0..chunk {
                    res.write(&self.ub_acc, i as u32, data[off + i]);
                }
            });
            events.set(HardEvent::Mte2V, REDUCE_EVENT);
            events.wait(HardEvent::Mte2V, REDUCE_EVENT);
            for s in 1..slices {
                let base = s as usize * slice_len + off;
                workspace.with(|data| {
                    for i in 0..chunk {
                        res.write(&self.ub_in, i as u32, data[base + i]);
                    }
                });
                events.set(HardEvent::Mte2V, REDUCE_EVENT);
                events.wait(HardEvent::Mte2V, REDUCE_EVENT);
                for i in 0..chunk {
                    let sum = res.read(&self.ub_acc, i as u32) + res.read(&self.ub_in, i as u32);
                    res.write(&self.ub_acc, i as u32, sum);
                }
            }
            for i in 0..chunk {
                let v = res.read(&self.ub_acc, i as u32);
                res.write(&self.ub_out, i as u32, Out::from_f32(v));
            }
            dst.with_mut(|data| {
                for i in 0..chunk {
                    data[off + i] = res.read(&self.ub_out, i as u32);
                }
            });
            events.set(HardEvent::VMte3, REDUCE_EVENT);
            events.wait(HardEvent::VMte3, REDUCE_EVENT);
            off += chunk;
        }
    }
}

pub struct SplitkMatmul<E: Element> {
    arch: ArchSpec,
    config: TileConfig,
    _marker: PhantomData<E>,
}

impl<E: Element> SplitkMatmul<E> {
    pub fn new(arch: ArchSpec, config: TileConfig) -> Result<Self, LaunchError> {
        config.validate::<E>(&arch)?;
        Ok(SplitkMatmul {
            arch,
            config,
            _marker: PhantomData,
        })
    }
}

impl<E: Element> DeviceKernel for SplitkMatmul<E> {
    type Params = SplitkParams<E>;

    fn run_aic(&self, ctx: &mut CoreCtx, params: &SplitkParams<E>) {
        let tile = self.config.l1_tile;
        let sched = SplitkScheduler::new(
            params.problem,
            tile,
            params.splitk_factor,
            params.swizzle_offset,
            params.direction,
        );
        let mut engine: BlockGemm<E, false, false> =
            match BlockGemm::new(&self.arch, &mut ctx.resource, &mut ctx.events, self.config) {
                Ok(engine) => engine,
                Err(err) => panic!("block engine setup failed: {err}"),
            };

        let (m, n) = (params.problem.m(), params.problem.n());
        let slice_len = (m as usize) * (n as usize);
        let ws_layout = RowMajor::new(m, n);
        let block_view = |task: u32| -> BlockArgs<E, RowMajor, RowMajor> {
            let coord = sched.block_coord(task);
            let slice = sched.splitk_slice_idx(task);
            let actual = sched.actual_block_shape(coord, slice);
            let row0 = coord.m() * tile.m();
            let col0 = coord.n() * tile.n();
            let k0 = coord.k() * tile.k();
            BlockArgs {
                a: params
                    .a
                    .at(params.a_layout.offset(MatrixCoord::new(row0, k0)) as usize),
                a_layout: params.a_layout.tile(MatrixCoord::new(actual.m(), actual.k())),
                b: params
                    .b
                    .at(params.b_layout.offset(MatrixCoord::new(k0, col0)) as usize),
                b_layout: params.b_layout.tile(MatrixCoord::new(actual.k(), actual.n())),
                shape: actual,
            }
        };

        let total = sched.core_loops();
        let step = ctx.block_num();
        debug!(core = ctx.block_idx(), total, "split-k core start");
        let mut task = ctx.block_idx();
        let mut first = true;
        while task < total {
            let cur = block_view(task);
            let next_task = task + step;
            let next = if next_task < total {
                Some(block_view(next_task))
            } else {
                None
            };
            let coord = sched.block_coord(task);
            let slice = sched.splitk_slice_idx(task);
            let row0 = coord.m() * tile.m();
            let col0 = coord.n() * tile.n();
            let out = params.workspace.at(
                slice as usize * slice_len
                    + ws_layout.offset(MatrixCoord::new(row0, col0)) as usize,
            );
            let out_layout = ws_layout.tile(cur.shape.mn());
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

        ctx.set_flag_to_aiv(FLAG_SLICES_DONE);
    }

    fn run_aiv(&self, ctx: &mut CoreCtx, params: &SplitkParams<E>) {
        ctx.wait_flag_from_aic(FLAG_SLICES_DONE);
        // Each vector core has seen its own matrix core finish; the barrier
        // makes that true for all of them.
        ctx.barrier_same_kind();

        let reducer: ReduceAdd<E> = match ReduceAdd::new(&mut ctx.resource) {
            Ok(reducer) => reducer,
            Err(err) => panic!("reduce stage setup failed: {err}"),
        };
        let slice_len = (params.problem.m() as usize) * (params.problem.n() as usize);
        let lanes = ctx.block_num() as usize;
        let lane = ctx.block_idx() as usize;
        let per_lane = slice_len.div_ceil(lanes);
        let start = (lane * per_lane).min(slice_len);
        let len = ((lane + 1) * per_lane).min(slice_len) - start;
        if len > 0 {
            reducer.reduce(
                &mut ctx.resource,
                &mut ctx.events,
                &params.workspace,
                params.splitk_factor,
                slice_len,
                start,
                len,
                &params.d,
            );
        }
        ctx.events.assert_quiesced();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{launch, LaunchGeometry};
    use crate::test_utils::{assert_close, naive_matmul, random_f16};
    use half::f16;

    fn run_splitk(problem: GemmCoord, factor: u32) -> (Vec<f32>, Vec<f32>) {
        let arch = ArchSpec::atlas_a2();
        let config = TileConfig::new(GemmCoord::new(32, 32, 32), 16);
        let kernel: SplitkMatmul<f16> = SplitkMatmul::new(arch, config).unwrap();
        let slice_len = (problem.m() * problem.n()) as usize;
        let params = SplitkParams {
            problem,
            a: GmTensor::from_vec(random_f16((problem.m() * problem.k()) as usize, 81)),
            a_layout: RowMajor::new(problem.m(), problem.k()),
            b: GmTensor::from_vec(random_f16((problem.k() * problem.n()) as usize, 82)),
            b_layout: RowMajor::new(problem.k(), problem.n()),
            d: GmTensor::new(slice_len),
            d_layout: RowMajor::new(problem.m(), problem.n()),
            workspace: GmTensor::new(slice_len * factor as usize),
            splitk_factor: factor,
            swizzle_offset: 1,
            direction: SwizzleDirection::Zn,
        };
        launch(&arch, LaunchGeometry::new(2), &kernel, &params).unwrap();
        let expect = naive_matmul(&params.a.to_vec(), &params.b.to_vec(), problem);
        let got = params.d.to_vec().iter().map(|v| v.to_f32()).collect();
        (got, expect)
    }

    #[test]
    fn test_splitk_matches_single_pass() {
        let (got, expect) = run_splitk(GemmCoord::new(48, 48, 192), 3);
        assert_close(&got, &expect, 5e-2);
    }

    #[test]
    fn test_splitk_non_dividing_factor_and_tail() {
        // 5 k tiles of 32 (with an element tail) over 2 slices.
        let (got, expect) = run_splitk(GemmCoord::new(48, 32, 150), 2);
        assert_close(&got, &expect, 5e-2);
    }
}
