//! GEMV kernels: `z = alpha * A x + beta * y`.
//!
//! [`GemvAiv`] runs entirely on the vector cores, each reducing a stripe of
//! rows through the unified buffer. [`GemvAic`] routes the product through
//! the matrix pipeline instead: the vector cores widen `x` into a 16-column
//! operand, the matrix cores run the block engine over it, and the vector
//! cores apply the alpha/beta combination to the first result column.

use std::marker::PhantomData;

use tracing::debug;

use crate::arch::{
    ArchSpec, EventId, EventTable, FlagId, HardEvent, LocalTensor, PoolKind, Resource,
};
use crate::coord::{GemmCoord, GemvCoord, MatrixCoord};
use crate::device::{CoreCtx, DeviceKernel, Element, GmTensor};
use crate::error::LaunchError;
use crate::gemm::block::{BlockArgs, BlockGemm};
use crate::gemm::scheduler::{BlockScheduler, SwizzleDirection};
use crate::gemm::TileConfig;
use crate::layout::{Layout, RowMajor};

const GEMV_EVENT: EventId = EventId(0);
/// Reduction elements staged per pass.
const GEMV_CHUNK: u32 = 2048;
/// Column width of the widened operand the matrix-core variant multiplies.
const AIC_LANE_COLS: u32 = 16;

const FLAG_X_READY: FlagId = FlagId(0);
const FLAG_D_READY: FlagId = FlagId(1);

pub struct GemvParams<E: Element> {
    /// `m` output rows, `n` reduction length.
    pub shape: GemvCoord,
    pub alpha: f32,
    pub beta: f32,
    pub a: GmTensor<E>,
    pub a_layout: RowMajor,
    pub x: GmTensor<E>,
    pub y: GmTensor<E>,
    pub z: GmTensor<E>,
}

pub struct GemvAiv<E: Element> {
    _marker: PhantomData<E>,
}

impl<E: Element> GemvAiv<E> {
    pub fn new() -> Self {
        GemvAiv {
            _marker: PhantomData,
        }
    }
}

impl<E: Element> Default for GemvAiv<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// One row's dot product, reduced in f32 through the unified buffer.
fn row_dot<E: Element>(
    res: &mut Resource,
    events: &mut EventTable,
    ub_a: &LocalTensor<E>,
    ub_x: &LocalTensor<E>,
    a: &GmTensor<E>,
    a_layout: &RowMajor,
    x: &GmTensor<E>,
    row: u32,
    n: u32,
) -> f32 {
    let mut acc = 0.0f32;
    let mut c0 = 0;
    while c0 < n {
        let len = (n - c0).min(GEMV_CHUNK);
        a.with(|data| {
            for i in 0..len {
                let v = data[a_layout.offset(MatrixCoord::new(row, c0 + i)) as usize];
                res.write(ub_a, i, v);
            }
        });
        x.with(|data| {
            for i in 0..len {
                res.write(ub_x, i, data[(c0 + i) as usize]);
            }
        });
        events.set(HardEvent::Mte2V, GEMV_EVENT);
        events.wait(HardEvent::Mte2V, GEMV_EVENT);
        for i in 0..len {
            acc += res.read(ub_a, i).to_f32() * res.read(ub_x, i).to_f32();
        }
        c0 += len;
    }
    acc
}

impl<E: Element> DeviceKernel for GemvAiv<E> {
    type Params = GemvParams<E>;

    fn run_aic(&self, _ctx: &mut CoreCtx, _params: &GemvParams<E>) {}

    fn run_aiv(&self, ctx: &mut CoreCtx, params: &GemvParams<E>) {
        let (m, n) = (params.shape.m(), params.shape.n());
        let ub_a: LocalTensor<E> = match ctx.resource.lease(PoolKind::Ub, GEMV_CHUNK) {
            Ok(ub) => ub,
            Err(err) => panic!("gemv stage setup failed: {err}"),
        };
        let ub_x: LocalTensor<E> = match ctx.resource.lease(PoolKind::Ub, GEMV_CHUNK) {
            Ok(ub) => ub,
            Err(err) => panic!("gemv stage setup failed: {err}"),
        };

        let step = ctx.block_num();
        debug!(lane = ctx.block_idx(), m, n, "gemv lane start");
        let mut row = ctx.block_idx();
        while row < m {
            let dot = row_dot(
                &mut ctx.resource,
                &mut ctx.events,
                &ub_a,
                &ub_x,
                &params.a,
                &params.a_layout,
                &params.x,
                row,
                n,
            );
            let yv = params.y.read(row as usize).to_f32();
            params
                .z
                .write(row as usize, E::from_f32(params.alpha * dot + params.beta * yv));
            events_store_pulse(&mut ctx.events);
            row += step;
        }
        ctx.events.assert_quiesced();
    }
}

/// Order the scalar store behind the reduction.
fn events_store_pulse(events: &mut EventTable) {
    events.set(HardEvent::VMte3, GEMV_EVENT);
    events.wait(HardEvent::VMte3, GEMV_EVENT);
}

pub struct GemvAicParams<E: Element> {
    pub shape: GemvCoord,
    pub alpha: f32,
    pub beta: f32,
    pub a: GmTensor<E>,
    pub a_layout: RowMajor,
    pub x: GmTensor<E>,
    pub y: GmTensor<E>,
    pub z: GmTensor<E>,
    /// Widened operand workspace, `n x 16`, column 0 carries `x`.
    pub xb_ws: GmTensor<E>,
    /// f32 product workspace, `m x 16`.
    pub d_ws: GmTensor<f32>,
}

#[derive(Debug)]
pub struct GemvAic<E: Element> {
    arch: ArchSpec,
    config: TileConfig,
    _marker: PhantomData<E>,
}

impl<E: Element> GemvAic<E> {
    pub fn new(arch: ArchSpec, config: TileConfig) -> Result<Self, LaunchError> {
        if config.l1_tile.n() != AIC_LANE_COLS {
            return Err(LaunchError::InvalidConfig(format!(
                "matrix-core gemv needs an n tile of {}, got {}",
                AIC_LANE_COLS,
                config.l1_tile.n()
            )));
        }
        config.validate::<E>(&arch)?;
        Ok(GemvAic {
            arch,
            config,
            _marker: PhantomData,
        })
    }
}

impl<E: Element> DeviceKernel for GemvAic<E> {
    type Params = GemvAicParams<E>;

    fn run_aiv(&self, ctx: &mut CoreCtx, params: &GemvAicParams<E>) {
        let (m, n) = (params.shape.m(), params.shape.n());
        let ub: LocalTensor<E> = match ctx.resource.lease(PoolKind::Ub, GEMV_CHUNK) {
            Ok(ub) => ub,
            Err(err) => panic!("gemv stage setup failed: {err}"),
        };
        let ws_layout = RowMajor::new(n, AIC_LANE_COLS);

        // Widen x into column 0 of the workspace; the rest stays zero.
        let step = ctx.block_num();
        let mut row = ctx.block_idx();
        while row < n {
            params.x.with(|data| {
                ctx.resource.write(&ub, 0, data[row as usize]);
            });
            ctx.events.set(HardEvent::Mte2V, GEMV_EVENT);
            ctx.events.wait(HardEvent::Mte2V, GEMV_EVENT);
            params.xb_ws.with_mut(|data| {
                data[ws_layout.offset(MatrixCoord::new(row, 0)) as usize] =
                    ctx.resource.read(&ub, 0);
            });
            events_store_pulse(&mut ctx.events);
            row += step;
        }
        ctx.barrier_same_kind();
        ctx.set_flag_to_aic(FLAG_X_READY);

        // Combine once every matrix core has filled its product rows. Each
        // lane hears only its own group's flag, so a vector barrier closes
        // the gap before rows from other groups are read.
        ctx.wait_flag_from_aic(FLAG_D_READY);
        ctx.barrier_same_kind();
        let d_layout = RowMajor::new(m, AIC_LANE_COLS);
        let mut row = ctx.block_idx();
        while row < m {
            let dot = params
                .d_ws
                .read(d_layout.offset(MatrixCoord::new(row, 0)) as usize);
            let yv = params.y.read(row as usize).to_f32();
            params
                .z
                .write(row as usize, E::from_f32(params.alpha * dot + params.beta * yv));
            events_store_pulse(&mut ctx.events);
            row += step;
        }
        ctx.events.assert_quiesced();
    }

    fn run_aic(&self, ctx: &mut CoreCtx, params: &GemvAicParams<E>) {
        ctx.wait_flag_from_aiv(FLAG_X_READY);

        let (m, n) = (params.shape.m(), params.shape.n());
        let problem = GemmCoord::new(m, AIC_LANE_COLS, n);
        let tile = self.config.l1_tile;
        let sched = BlockScheduler::new(
            problem,
            MatrixCoord::new(tile.m(), tile.n()),
            1,
            SwizzleDirection::Zn,
        );
        let mut engine: BlockGemm<E, false, false> =
            match BlockGemm::new(&self.arch, &mut ctx.resource, &mut ctx.events, self.config) {
                Ok(engine) => engine,
                Err(err) => panic!("block engine setup failed: {err}"),
            };

        let ws_layout = RowMajor::new(n, AIC_LANE_COLS);
        let d_layout = RowMajor::new(m, AIC_LANE_COLS);
        let block_view = |task: u32| -> BlockArgs<E, RowMajor, RowMajor> {
            let coord = sched.block_coord(task);
            let actual = sched.actual_block_shape(coord);
            let row0 = coord.m() * tile.m();
            BlockArgs {
                a: params
                    .a
                    .at(params.a_layout.offset(MatrixCoord::new(row0, 0)) as usize),
                a_layout: params.a_layout.tile(MatrixCoord::new(actual.m(), actual.k())),
                b: params.xb_ws.clone(),
                b_layout: ws_layout.tile(MatrixCoord::new(actual.k(), actual.n())),
                shape: actual,
            }
        };

        let total = sched.core_loops();
        let step = ctx.block_num();
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
            let row0 = coord.m() * tile.m();
            let out = params
                .d_ws
                .at(d_layout.offset(MatrixCoord::new(row0, 0)) as usize);
            let out_layout = d_layout.tile(cur.shape.mn());
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

        ctx.set_flag_to_aiv(FLAG_D_READY);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{launch, LaunchGeometry};
    use crate::test_utils::{assert_close, random_f16};
    use half::f16;

    fn reference(params_a: &[f16], x: &[f16], y: &[f16], m: u32, n: u32, alpha: f32, beta: f32) -> Vec<f32> {
        (0..m as usize)
            .map(|r| {
                let mut acc = 0.0f32;
                for c in 0..n as usize {
                    acc += params_a[r * n as usize + c].to_f32() * x[c].to_f32();
                }
                alpha * acc + beta * y[r].to_f32()
            })
            .collect()
    }

    #[test]
    fn test_gemv_aiv_matches_reference() {
        let (m, n) = (37u32, 53u32);
        let a = random_f16((m * n) as usize, 131);
        let x = random_f16(n as usize, 132);
        let y = random_f16(m as usize, 133);
        let params = GemvParams {
            shape: GemvCoord::new(m, n),
            alpha: 0.75,
            beta: -0.5,
            a: GmTensor::from_vec(a.clone()),
            a_layout: RowMajor::new(m, n),
            x: GmTensor::from_vec(x.clone()),
            y: GmTensor::from_vec(y.clone()),
            z: GmTensor::new(m as usize),
        };
        let kernel: GemvAiv<f16> = GemvAiv::new();
        launch(&ArchSpec::atlas_a2(), LaunchGeometry::new(2), &kernel, &params).unwrap();

        let expect = reference(&a, &x, &y, m, n, 0.75, -0.5);
        let got: Vec<f32> = params.z.to_vec().iter().map(|v| v.to_f32()).collect();
        assert_close(&got, &expect, 1e-2);
    }

    #[test]
    fn test_gemv_aic_matches_reference() {
        let (m, n) = (48u32, 64u32);
        let arch = ArchSpec::atlas_a2();
        let config = TileConfig::new(GemmCoord::new(32, 16, 32), 16);
        let kernel: GemvAic<f16> = GemvAic::new(arch, config).unwrap();

        let a = random_f16((m * n) as usize, 141);
        let x = random_f16(n as usize, 142);
        let y = random_f16(m as usize, 143);
        let params = GemvAicParams {
            shape: GemvCoord::new(m, n),
            alpha: 1.25,
            beta: 0.5,
            a: GmTensor::from_vec(a.clone()),
            a_layout: RowMajor::new(m, n),
            x: GmTensor::from_vec(x.clone()),
            y: GmTensor::from_vec(y.clone()),
            z: GmTensor::new(m as usize),
            xb_ws: GmTensor::new((n * AIC_LANE_COLS) as usize),
            d_ws: GmTensor::new((m * AIC_LANE_COLS) as usize),
        };
        launch(&arch, LaunchGeometry::new(2), &kernel, &params).unwrap();

        let expect = reference(&a, &x, &y, m, n, 1.25, 0.5);
        let got: Vec<f32> = params.z.to_vec().iter().map(|v| v.to_f32()).collect();
        assert_close(&got, &expect, 1e-2);
    }

    #[test]
    fn test_gemv_aic_rejects_wide_tile() {
        let arch = ArchSpec::atlas_a2();
        let config = TileConfig::new(GemmCoord::new(32, 32, 32), 16);
        let err = GemvAic::<f16>::new(arch, config).unwrap_err();
        assert!(matches!(err, LaunchError::InvalidConfig(_)));
    }
}
