//! GEMM with a vector-core padding prologue.
//!
//! When the source matrices have awkward leading dimensions the vector cores
//! first rewrite them into block-aligned padded workspaces, then the matrix
//! cores run the regular block pipeline against the padded copies. Data
//! moves through the unified buffer; a cross-core flag releases the matrix
//! cores once every stripe is written.

use std::marker::PhantomData;

use tracing::debug;

use crate::arch::{
    ArchSpec, EventId, EventTable, FlagId, HardEvent, LocalTensor, PoolKind, Resource,
};
use crate::coord::{GemmCoord, MatrixCoord};
use crate::device::{CoreCtx, DeviceKernel, Element, GmTensor};
use crate::error::LaunchError;
use crate::gemm::block::{BlockArgs, BlockGemm};
use crate::gemm::scheduler::{BlockScheduler, SwizzleDirection};
use crate::gemm::TileConfig;
use crate::layout::{Layout, PaddingRowMajor, RowMajor};

const FLAG_PADDED: FlagId = FlagId(0);
const STAGE_EVENT: EventId = EventId(0);
/// Elements staged through the unified buffer per move.
const STAGE_CHUNK: u32 = 4096;

pub struct PaddingParams<E: Element> {
    pub problem: GemmCoord,
    pub a: GmTensor<E>,
    pub a_layout: RowMajor,
    pub b: GmTensor<E>,
    pub b_layout: RowMajor,
    pub d: GmTensor<E>,
    pub d_layout: RowMajor,
    /// Padded copy of A, sized to the layout `workspace_layouts` reports.
    pub wa: GmTensor<E>,
    /// Padded copy of B.
    pub wb: GmTensor<E>,
    pub swizzle_offset: u32,
    pub direction: SwizzleDirection,
}

pub struct PaddingMatmul<E: Element> {
    arch: ArchSpec,
    config: TileConfig,
    _marker: PhantomData<E>,
}

impl<E: Element> PaddingMatmul<E> {
    pub fn new(arch: ArchSpec, config: TileConfig) -> Result<Self, LaunchError> {
        config.validate::<E>(&arch)?;
        Ok(PaddingMatmul {
            arch,
            config,
            _marker: PhantomData,
        })
    }

    /// Workspace layouts for a problem shape; the host sizes `wa`/`wb` to
    /// their capacities.
    pub fn workspace_layouts(&self, problem: GemmCoord) -> (PaddingRowMajor, PaddingRowMajor) {
        let tile = self.config.l1_tile;
        (
            PaddingRowMajor::new(problem.m(), problem.k(), tile.m(), tile.k()),
            PaddingRowMajor::new(problem.k(), problem.n(), tile.k(), tile.n()),
        )
    }
}

/// Move rows `row0, row0 + step, ...` of `src` into `dst` through a UB
/// staging buffer, rewriting between the two layouts.
#[allow(clippy::too_many_arguments)]
fn stage_rows<E: Element>(
    res: &mut Resource,
    events: &mut EventTable,
    ub: &LocalTensor<E>,
    src: &GmTensor<E>,
    src_layout: &impl Layout,
    dst: &GmTensor<E>,
    dst_layout: &impl Layout,
    shape: MatrixCoord,
    row0: u32,
    step: u32,
) {
    let mut r = row0;
    while r < shape.row() {
        let mut c0 = 0;
        while c0 < shape.column() {
            let len = (shape.column() - c0).min(STAGE_CHUNK);
            src.with(|data| {
                for i in 0..len {
                    let v = data[src_layout.offset(MatrixCoord::new(r, c0 + i)) as usize];
                    res.write(ub, i, v);
                }
            });
            events.set(HardEvent::Mte2V, STAGE_EVENT);
            events.wait(HardEvent::Mte2V, STAGE_EVENT);
            dst.with_mut(|data| {
                for i in 0..len {
                    data[dst_layout.offset(MatrixCoord::new(r, c0 + i)) as usize] =
                        res.read(ub, i);
                }
            });
            events.set(HardEvent::VMte3, STAGE_EVENT);
            events.wait(HardEvent::VMte3, STAGE_EVENT);
            c0 += len;
        }
        r += step;
    }
}

impl<E: Element> DeviceKernel for PaddingMatmul<E> {
    type Params = PaddingParams<E>;

    fn run_aiv(&self, ctx: &mut CoreCtx, params: &PaddingParams<E>) {
        let (pa, pb) = self.workspace_layouts(params.problem);
        let ub: LocalTensor<E> = match ctx.resource.lease(PoolKind::Ub, STAGE_CHUNK) {
            Ok(ub) => ub,
            Err(err) => panic!("padding stage setup failed: {err}"),
        };
        let row0 = ctx.block_idx();
        let step = ctx.block_num();
        debug!(core = row0, "padding stripes start");
        stage_rows(
            &mut ctx.resource,
            &mut ctx.events,
            &ub,
            &params.a,
            &params.a_layout,
            &params.wa,
            &pa,
            params.problem.mk(),
            row0,
            step,
        );
        stage_rows(
            &mut ctx.resource,
            &mut ctx.events,
            &ub,
            &params.b,
            &params.b_layout,
            &params.wb,
            &pb,
            params.problem.kn(),
            row0,
            step,
        );
        ctx.events.assert_quiesced();

        // Every stripe is in place once all vector cores arrive.
        ctx.barrier_same_kind();
        ctx.set_flag_to_aic(FLAG_PADDED);
    }

    fn run_aic(&self, ctx: &mut CoreCtx, params: &PaddingParams<E>) {
        ctx.wait_flag_from_aiv(FLAG_PADDED);

        let tile = self.config.l1_tile;
        let (pa, pb) = self.workspace_layouts(params.problem);
        let sched = BlockScheduler::new(
            params.problem,
            MatrixCoord::new(tile.m(), tile.n()),
            params.swizzle_offset,
            params.direction,
        );
        let mut engine: BlockGemm<E, false, false> =
            match BlockGemm::new(&self.arch, &mut ctx.resource, &mut ctx.events, self.config) {
                Ok(engine) => engine,
                Err(err) => panic!("block engine setup failed: {err}"),
            };

        let block_view = |task: u32| -> BlockArgs<E, PaddingRowMajor, PaddingRowMajor> {
            let coord = sched.block_coord(task);
            let actual = sched.actual_block_shape(coord);
            let row0 = coord.m() * tile.m();
            let col0 = coord.n() * tile.n();
            BlockArgs {
                a: params.wa.at(pa.offset(MatrixCoord::new(row0, 0)) as usize),
                a_layout: pa.tile(MatrixCoord::new(actual.m(), actual.k())),
                b: params.wb.at(pb.offset(MatrixCoord::new(0, col0)) as usize),
                b_layout: pb.tile(MatrixCoord::new(actual.k(), actual.n())),
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
