//! Implicit-GEMM 3-D convolution with a fused bias.
//!
//! The input sits in the channel-packed NDC1HWC0 device format. Each output
//! block is computed as a matmul over gathered input patches: rows are
//! flattened output positions, columns are output channels, and the
//! reduction runs over the kernel volume times the input channels. The bias
//! seeds the accumulator, so the flush needs no extra pass.

use std::marker::PhantomData;

use tracing::debug;

use crate::arch::{
    ArchSpec, EventId, EventTable, HardEvent, LocalTensor, PoolKind, Resource,
};
use crate::coord::{ceil_div, Coord, GemmCoord, MatrixCoord};
use crate::device::{CoreCtx, DeviceKernel, Element, GmTensor};
use crate::error::LaunchError;
use crate::gemm::tile::{
    copy_l0c_to_gm, copy_local_region_to_local, tile_mmad, tile_mmad_bias,
};
use crate::gemm::TileConfig;
use crate::layout::{elem_per_c0, Layout, Nz, RowMajor, Zn};

const CONV_EVENT: EventId = EventId(0);
const CONV_EVENT_B: EventId = EventId(1);

/// A position in a batched 3-D volume: (batch, depth, height, width, channel).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Conv3dCoord(pub Coord<5>);

impl Conv3dCoord {
    pub const fn new(batch: u32, depth: u32, height: u32, width: u32, channel: u32) -> Self {
        Conv3dCoord(Coord([batch, depth, height, width, channel]))
    }

    #[inline]
    pub const fn batch(&self) -> u32 {
        self.0 .0[0]
    }

    #[inline]
    pub const fn depth(&self) -> u32 {
        self.0 .0[1]
    }

    #[inline]
    pub const fn height(&self) -> u32 {
        self.0 .0[2]
    }

    #[inline]
    pub const fn width(&self) -> u32 {
        self.0 .0[3]
    }

    #[inline]
    pub const fn channel(&self) -> u32 {
        self.0 .0[4]
    }
}

/// Channel-packed volume layout: channels split into C0-element lanes, the
/// lane index innermost.
#[derive(Debug, Clone, Copy)]
pub struct Ndc1hwc0 {
    batch: u32,
    depth: u32,
    c1: u32,
    height: u32,
    width: u32,
    c0: u32,
}

impl Ndc1hwc0 {
    pub fn make_layout<E>(shape: Conv3dCoord) -> Self {
        let c0 = elem_per_c0::<E>();
        Ndc1hwc0 {
            batch: shape.batch(),
            depth: shape.depth(),
            c1: ceil_div(shape.channel(), c0),
            height: shape.height(),
            width: shape.width(),
            c0,
        }
    }

    pub fn offset(&self, coord: Conv3dCoord) -> i64 {
        let c1 = (coord.channel() / self.c0) as i64;
        let c0 = (coord.channel() % self.c0) as i64;
        ((((coord.batch() as i64 * self.depth as i64 + coord.depth() as i64) * self.c1 as i64
            + c1)
            * self.height as i64
            + coord.height() as i64)
            * self.width as i64
            + coord.width() as i64)
            * self.c0 as i64
            + c0
    }

    /// Elements of backing storage the layout spans.
    pub fn capacity(&self) -> u64 {
        self.batch as u64
            * self.depth as u64
            * self.c1 as u64
            * self.height as u64
            * self.width as u64
            * self.c0 as u64
    }
}

/// Shapes of one convolution: input volume, kernel extents and strides.
#[derive(Debug, Clone, Copy)]
pub struct ConvProblem {
    /// (batch, depth, height, width, in channels).
    pub input: Conv3dCoord,
    /// (kernel depth, kernel height, kernel width).
    pub kernel: (u32, u32, u32),
    /// Spatial strides, same order.
    pub stride: (u32, u32, u32),
    pub out_channels: u32,
}

impl ConvProblem {
    /// Output spatial extents (depth, height, width), valid convolution.
    pub fn out_dims(&self) -> (u32, u32, u32) {
        let (kd, kh, kw) = self.kernel;
        let (sd, sh, sw) = self.stride;
        (
            (self.input.depth() - kd) / sd + 1,
            (self.input.height() - kh) / sh + 1,
            (self.input.width() - kw) / sw + 1,
        )
    }

    /// The implicit-GEMM extents: flattened output positions by output
    /// channels, reduced over the kernel volume times input channels.
    pub fn gemm_shape(&self) -> GemmCoord {
        let (od, oh, ow) = self.out_dims();
        let (kd, kh, kw) = self.kernel;
        GemmCoord::new(
            self.input.batch() * od * oh * ow,
            self.out_channels,
            kd * kh * kw * self.input.channel(),
        )
    }

    /// Input coordinate feeding GEMM cell (`row`, `col`) of the patch matrix.
    fn patch_coord(&self, row: u32, col: u32) -> Conv3dCoord {
        let (od, oh, ow) = self.out_dims();
        let (kd, kh, kw) = self.kernel;
        let (sd, sh, sw) = self.stride;
        let cin = self.input.channel();

        let ow_idx = row % ow;
        let oh_idx = row / ow % oh;
        let od_idx = row / (ow * oh) % od;
        let batch = row / (ow * oh * od);

        let ci = col % cin;
        let kw_idx = col / cin % kw;
        let kh_idx = col / (cin * kw) % kh;
        let kd_idx = col / (cin * kw * kh);

        Conv3dCoord::new(
            batch,
            od_idx * sd + kd_idx,
            oh_idx * sh + kh_idx,
            ow_idx * sw + kw_idx,
            ci,
        )
    }
}

pub struct ConvBiasParams<E: Element> {
    pub problem: ConvProblem,
    pub input: GmTensor<E>,
    pub input_layout: Ndc1hwc0,
    /// Weights flattened `k x out_channels` row-major, the reduction ordered
    /// (kernel depth, kernel height, kernel width, in channel).
    pub weight: GmTensor<E>,
    pub weight_layout: RowMajor,
    /// Per-output-channel bias.
    pub bias: GmTensor<f32>,
    /// Output rows `m x out_channels` row-major, rows flattened like the
    /// patch matrix.
    pub output: GmTensor<E>,
    pub output_layout: RowMajor,
}

/// Single-buffered implicit-GEMM conv driver with the bias fused into the
/// first mmad step of every output block.
pub struct ConvBias<E: Element> {
    arch: ArchSpec,
    config: TileConfig,
    _marker: PhantomData<E>,
}

impl<E: Element> ConvBias<E> {
    pub fn new(arch: ArchSpec, config: TileConfig) -> Result<Self, LaunchError> {
        config.validate::<E>(&arch)?;
        let bias_bytes = config.l1_tile.n() * std::mem::size_of::<f32>() as u32;
        if bias_bytes > arch.bias_bytes {
            return Err(LaunchError::ScratchOverflow {
                pool: PoolKind::Bias,
                needed: bias_bytes,
                capacity: arch.bias_bytes,
            });
        }
        Ok(ConvBias {
            arch,
            config,
            _marker: PhantomData,
        })
    }
}

struct ConvScratch<E: Element> {
    l1_a: LocalTensor<E>,
    l1_b: LocalTensor<E>,
    l0_a: LocalTensor<E>,
    l0_b: LocalTensor<E>,
    l0_c: LocalTensor<f32>,
    bias: LocalTensor<f32>,
    a_l1_layout: Nz,
    b_l1_layout: Nz,
    a_l0_layout: Zn,
    b_l0_layout: Nz,
}

impl<E: Element> ConvScratch<E> {
    fn lease(res: &mut Resource, config: &TileConfig) -> Result<Self, LaunchError> {
        let tile = config.l1_tile;
        let a_l1_layout = Nz::make_layout::<E>(tile.m(), tile.k());
        let b_l1_layout = Nz::make_layout::<E>(tile.k(), tile.n());
        let a_l0_layout = Zn::make_layout::<E>(tile.m(), config.l0_tile_k);
        let b_l0_layout = Nz::make_layout::<E>(config.l0_tile_k, tile.n());
        Ok(ConvScratch {
            l1_a: res.lease(PoolKind::L1, a_l1_layout.capacity() as u32)?,
            l1_b: res.lease(PoolKind::L1, b_l1_layout.capacity() as u32)?,
            l0_a: res.lease(PoolKind::L0A, a_l0_layout.capacity() as u32)?,
            l0_b: res.lease(PoolKind::L0B, b_l0_layout.capacity() as u32)?,
            l0_c: res.lease(PoolKind::L0C, tile.m() * tile.n())?,
            bias: res.lease(PoolKind::Bias, tile.n())?,
            a_l1_layout,
            b_l1_layout,
            a_l0_layout,
            b_l0_layout,
        })
    }
}

impl<E: Element> DeviceKernel for ConvBias<E> {
    type Params = ConvBiasParams<E>;

    fn run_aic(&self, ctx: &mut CoreCtx, params: &ConvBiasParams<E>) {
        let problem = params.problem;
        let shape = problem.gemm_shape();
        let tile = self.config.l1_tile;
        let scratch = match ConvScratch::<E>::lease(&mut ctx.resource, &self.config) {
            Ok(scratch) => scratch,
            Err(err) => panic!("conv scratch setup failed: {err}"),
        };

        let blocks_m = ceil_div(shape.m(), tile.m());
        let blocks_n = ceil_div(shape.n(), tile.n());
        let total = blocks_m * blocks_n;
        let step = ctx.block_num();
        debug!(core = ctx.block_idx(), total, "conv core start");

        let mut task = ctx.block_idx();
        while task < total {
            let bm = task / blocks_n;
            let bn = task % blocks_n;
            let row0 = bm * tile.m();
            let col0 = bn * tile.n();
            let m_actual = (shape.m() - row0).min(tile.m());
            let n_actual = (shape.n() - col0).min(tile.n());

            run_conv_block(
                &mut ctx.resource,
                &mut ctx.events,
                &scratch,
                &self.config,
                &problem,
                params,
                MatrixCoord::new(row0, col0),
                MatrixCoord::new(m_actual, n_actual),
                shape.k(),
            );
            task += step;
        }
        ctx.events.assert_quiesced();
    }
}

/// Gather the patch tile, stream the weight tile, and accumulate one output
/// block seeded with the bias.
#[allow(clippy::too_many_arguments)]
fn run_conv_block<E: Element>(
    res: &mut Resource,
    events: &mut EventTable,
    scratch: &ConvScratch<E>,
    config: &TileConfig,
    problem: &ConvProblem,
    params: &ConvBiasParams<E>,
    origin: MatrixCoord,
    actual: MatrixCoord,
    k_total: u32,
) {
    let tile = config.l1_tile;
    let c_layout = Zn::make_layout_in_l0c(actual);

    // Bias for this block's output channels.
    params.bias.with(|data| {
        for j in 0..actual.column() {
            res.write(&scratch.bias, j, data[(origin.column() + j) as usize]);
        }
    });
    events.set(HardEvent::Mte2Mte1, CONV_EVENT);
    events.wait(HardEvent::Mte2Mte1, CONV_EVENT);

    let k_tiles = ceil_div(k_total, tile.k());
    for t in 0..k_tiles {
        let k0 = t * tile.k();
        let k_actual = (k_total - k0).min(tile.k());

        // Implicit im2col: each cell reads straight from the packed volume.
        params.input.with(|data| {
            for r in 0..actual.row() {
                for c in 0..k_actual {
                    let coord = problem.patch_coord(origin.row() + r, k0 + c);
                    let v = data[params.input_layout.offset(coord) as usize];
                    res.write(
                        &scratch.l1_a,
                        scratch.a_l1_layout.offset(MatrixCoord::new(r, c)) as u32,
                        v,
                    );
                }
            }
        });
        events.set(HardEvent::Mte2Mte1, CONV_EVENT);
        events.wait(HardEvent::Mte2Mte1, CONV_EVENT);

        params.weight.with(|data| {
            for r in 0..k_actual {
                for c in 0..actual.column() {
                    let src = MatrixCoord::new(k0 + r, origin.column() + c);
                    let v = data[params.weight_layout.offset(src) as usize];
                    res.write(
                        &scratch.l1_b,
                        scratch.b_l1_layout.offset(MatrixCoord::new(r, c)) as u32,
                        v,
                    );
                }
            }
        });
        events.set(HardEvent::Mte2Mte1, CONV_EVENT_B);
        events.wait(HardEvent::Mte2Mte1, CONV_EVENT_B);

        let l0_steps = ceil_div(k_actual, config.l0_tile_k);
        for s in 0..l0_steps {
            let sk0 = s * config.l0_tile_k;
            let sk_actual = (k_actual - sk0).min(config.l0_tile_k);

            copy_local_region_to_local(
                res,
                &scratch.l0_a,
                &scratch.a_l0_layout,
                &scratch.l1_a,
                &scratch.a_l1_layout,
                MatrixCoord::new(0, sk0),
                MatrixCoord::new(actual.row(), sk_actual),
            );
            events.set(HardEvent::Mte1M, CONV_EVENT);
            events.wait(HardEvent::Mte1M, CONV_EVENT);
            copy_local_region_to_local(
                res,
                &scratch.l0_b,
                &scratch.b_l0_layout,
                &scratch.l1_b,
                &scratch.b_l1_layout,
                MatrixCoord::new(sk0, 0),
                MatrixCoord::new(sk_actual, actual.column()),
            );
            events.set(HardEvent::Mte1M, CONV_EVENT_B);
            events.wait(HardEvent::Mte1M, CONV_EVENT_B);

            if t == 0 && s == 0 {
                tile_mmad_bias(
                    res,
                    &scratch.l0_c,
                    &c_layout,
                    &scratch.l0_a,
                    &scratch.a_l0_layout,
                    &scratch.l0_b,
                    &scratch.b_l0_layout,
                    &scratch.bias,
                    actual.row(),
                    actual.column(),
                    sk_actual,
                );
            } else {
                tile_mmad(
                    res,
                    &scratch.l0_c,
                    &c_layout,
                    &scratch.l0_a,
                    &scratch.a_l0_layout,
                    &scratch.l0_b,
                    &scratch.b_l0_layout,
                    actual.row(),
                    actual.column(),
                    sk_actual,
                    false,
                );
            }
        }
    }

    events.set(HardEvent::MFix, CONV_EVENT);
    events.wait(HardEvent::MFix, CONV_EVENT);
    copy_l0c_to_gm(
        res,
        &params
            .output
            .at(params.output_layout.offset(origin) as usize),
        &params.output_layout.tile(actual),
        &scratch.l0_c,
        &c_layout,
        actual,
        false,
    );
    events.set(HardEvent::FixM, CONV_EVENT);
    events.wait(HardEvent::FixM, CONV_EVENT);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{launch, LaunchGeometry};
    use crate::test_utils::{assert_close, random_f16, random_f32};
    use half::f16;

    fn naive_conv(
        problem: &ConvProblem,
        input: &[f16],
        input_layout: &Ndc1hwc0,
        weight: &[f16],
        bias: &[f32],
    ) -> Vec<f32> {
        let shape = problem.gemm_shape();
        let (m, n, k) = (shape.m(), shape.n(), shape.k());
        let w_layout = RowMajor::new(k, n);
        let mut out = vec![0.0f32; (m * n) as usize];
        for r in 0..m {
            for c in 0..n {
                let mut acc = bias[c as usize];
                for p in 0..k {
                    let coord = problem.patch_coord(r, p);
                    let iv = input[input_layout.offset(coord) as usize].to_f32();
                    let wv = weight[w_layout.offset(MatrixCoord::new(p, c)) as usize].to_f32();
                    acc += iv * wv;
                }
                out[(r * n + c) as usize] = acc;
            }
        }
        out
    }

    #[test]
    fn test_conv_bias_matches_reference() {
        let problem = ConvProblem {
            input: Conv3dCoord::new(1, 2, 4, 4, 16),
            kernel: (1, 2, 2),
            stride: (1, 1, 1),
            out_channels: 16,
        };
        let shape = problem.gemm_shape();
        assert_eq!(shape, GemmCoord::new(18, 16, 64));

        let input_layout = Ndc1hwc0::make_layout::<f16>(problem.input);
        let input = random_f16(input_layout.capacity() as usize, 151);
        let weight = random_f16((shape.k() * shape.n()) as usize, 152);
        let bias = random_f32(shape.n() as usize, 153);

        let arch = ArchSpec::atlas_a2();
        let config = TileConfig::new(GemmCoord::new(16, 16, 32), 16);
        let kernel: ConvBias<f16> = ConvBias::new(arch, config).unwrap();
        let params = ConvBiasParams {
            problem,
            input: GmTensor::from_vec(input.clone()),
            input_layout,
            weight: GmTensor::from_vec(weight.clone()),
            weight_layout: RowMajor::new(shape.k(), shape.n()),
            bias: GmTensor::from_vec(bias.clone()),
            output: GmTensor::new((shape.m() * shape.n()) as usize),
            output_layout: RowMajor::new(shape.m(), shape.n()),
        };
        launch(&arch, LaunchGeometry::new(2), &kernel, &params).unwrap();

        let expect = naive_conv(&problem, &input, &input_layout, &weight, &bias);
        let got: Vec<f32> = params.output.to_vec().iter().map(|v| v.to_f32()).collect();
        assert_close(&got, &expect, 2e-2);
    }

    #[test]
    fn test_strided_out_dims() {
        let problem = ConvProblem {
            input: Conv3dCoord::new(2, 4, 9, 9, 16),
            kernel: (2, 3, 3),
            stride: (2, 2, 2),
            out_channels: 32,
        };
        assert_eq!(problem.out_dims(), (2, 4, 4));
        assert_eq!(problem.gemm_shape(), GemmCoord::new(2 * 2 * 4 * 4, 32, 2 * 3 * 3 * 16));
    }
}
