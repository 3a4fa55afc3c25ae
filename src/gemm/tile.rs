//! Tile primitives: data movement between global memory and the scratch
//! pools, and the mmad step itself.
//!
//! Every copy is a layout-to-layout bijection over a rectangular shape; the
//! numeric result of a pipeline never depends on the storage ordering either
//! side picked. Ordering with respect to other engines is the caller's job
//! through the event table.

use tracing::trace;

use crate::arch::{LocalTensor, Resource};
use crate::coord::MatrixCoord;
use crate::device::{Element, GmTensor};
use crate::layout::{Layout, Zn};

/// Stage a tile from global memory into a scratch pool.
pub fn copy_gm_to_local<E: Element>(
    res: &mut Resource,
    dst: &LocalTensor<E>,
    dst_layout: &impl Layout,
    src: &GmTensor<E>,
    src_layout: &impl Layout,
    shape: MatrixCoord,
) {
    trace!(rows = shape.row(), cols = shape.column(), "copy gm -> local");
    src.with(|data| {
        for r in 0..shape.row() {
            for c in 0..shape.column() {
                let coord = MatrixCoord::new(r, c);
                let v = data[src_layout.offset(coord) as usize];
                res.write(dst, dst_layout.offset(coord) as u32, v);
            }
        }
    });
}

/// Stage a sub-tile of a larger global-memory region, addressing the source
/// relative to `src_origin`.
pub fn copy_gm_region_to_local<E: Element>(
    res: &mut Resource,
    dst: &LocalTensor<E>,
    dst_layout: &impl Layout,
    src: &GmTensor<E>,
    src_layout: &impl Layout,
    src_origin: MatrixCoord,
    shape: MatrixCoord,
) {
    trace!(
        rows = shape.row(),
        cols = shape.column(),
        origin_row = src_origin.row(),
        origin_col = src_origin.column(),
        "copy gm region -> local"
    );
    src.with(|data| {
        for r in 0..shape.row() {
            for c in 0..shape.column() {
                let src_coord = MatrixCoord::new(src_origin.row() + r, src_origin.column() + c);
                let v = data[src_layout.offset(src_coord) as usize];
                res.write(dst, dst_layout.offset(MatrixCoord::new(r, c)) as u32, v);
            }
        }
    });
}

/// Stage a sub-tile transposed: destination coordinate (r, c) takes the
/// source element at (c, r). The transposing load the attention pipelines use
/// to feed K as the right-hand mmad operand.
pub fn copy_gm_region_to_local_transposed<E: Element>(
    res: &mut Resource,
    dst: &LocalTensor<E>,
    dst_layout: &impl Layout,
    src: &GmTensor<E>,
    src_layout: &impl Layout,
    src_origin: MatrixCoord,
    dst_shape: MatrixCoord,
) {
    src.with(|data| {
        for r in 0..dst_shape.row() {
            for c in 0..dst_shape.column() {
                let src_coord = MatrixCoord::new(src_origin.row() + c, src_origin.column() + r);
                let v = data[src_layout.offset(src_coord) as usize];
                res.write(dst, dst_layout.offset(MatrixCoord::new(r, c)) as u32, v);
            }
        }
    });
}

/// Move a sub-tile between scratch buffers, addressing the source relative
/// to `src_origin`.
pub fn copy_local_region_to_local<E: Element>(
    res: &mut Resource,
    dst: &LocalTensor<E>,
    dst_layout: &impl Layout,
    src: &LocalTensor<E>,
    src_layout: &impl Layout,
    src_origin: MatrixCoord,
    shape: MatrixCoord,
) {
    for r in 0..shape.row() {
        for c in 0..shape.column() {
            let src_coord = MatrixCoord::new(src_origin.row() + r, src_origin.column() + c);
            let v = res.read(src, src_layout.offset(src_coord) as u32);
            res.write(dst, dst_layout.offset(MatrixCoord::new(r, c)) as u32, v);
        }
    }
}

/// Move a tile between two scratch buffers, reshaping between layouts.
pub fn copy_local_to_local<E: Element>(
    res: &mut Resource,
    dst: &LocalTensor<E>,
    dst_layout: &impl Layout,
    src: &LocalTensor<E>,
    src_layout: &impl Layout,
    shape: MatrixCoord,
) {
    for r in 0..shape.row() {
        for c in 0..shape.column() {
            let coord = MatrixCoord::new(r, c);
            let v = res.read(src, src_layout.offset(coord) as u32);
            res.write(dst, dst_layout.offset(coord) as u32, v);
        }
    }
}

/// Store a tile from a scratch pool out to global memory.
pub fn copy_local_to_gm<E: Element>(
    res: &Resource,
    dst: &GmTensor<E>,
    dst_layout: &impl Layout,
    src: &LocalTensor<E>,
    src_layout: &impl Layout,
    shape: MatrixCoord,
) {
    trace!(rows = shape.row(), cols = shape.column(), "copy local -> gm");
    dst.with_mut(|data| {
        for r in 0..shape.row() {
            for c in 0..shape.column() {
                let coord = MatrixCoord::new(r, c);
                let v = res.read(src, src_layout.offset(coord) as u32);
                data[dst_layout.offset(coord) as usize] = v;
            }
        }
    });
}

/// Flush the f32 accumulator to global memory, narrowing to `Out`.
///
/// `accumulate` adds into the destination instead of overwriting, the fused
/// store the unit-flag path relies on when a block is flushed in k-slices.
pub fn copy_l0c_to_gm<Out: Element>(
    res: &Resource,
    dst: &GmTensor<Out>,
    dst_layout: &impl Layout,
    acc: &LocalTensor<f32>,
    acc_layout: &Zn,
    shape: MatrixCoord,
    accumulate: bool,
) {
    trace!(
        rows = shape.row(),
        cols = shape.column(),
        accumulate,
        "flush l0c -> gm"
    );
    dst.with_mut(|data| {
        for r in 0..shape.row() {
            for c in 0..shape.column() {
                let coord = MatrixCoord::new(r, c);
                let v = res.read(acc, acc_layout.offset(coord) as u32);
                let slot = &mut data[dst_layout.offset(coord) as usize];
                if accumulate {
                    *slot = Out::from_f32(slot.to_f32() + v);
                } else {
                    *slot = Out::from_f32(v);
                }
            }
        }
    });
}

/// One mmad step: `c[m, n] (+)= a[m, k] * b[k, n]` with f32 accumulation.
///
/// `init` starts a fresh accumulation for this output tile; subsequent k
/// slices pass `false` and add onto the accumulator in place.
#[allow(clippy::too_many_arguments)]
pub fn tile_mmad<E: Element>(
    res: &mut Resource,
    c: &LocalTensor<f32>,
    c_layout: &Zn,
    a: &LocalTensor<E>,
    a_layout: &impl Layout,
    b: &LocalTensor<E>,
    b_layout: &impl Layout,
    m: u32,
    n: u32,
    k: u32,
    init: bool,
) {
    for i in 0..m {
        for j in 0..n {
            let c_off = c_layout.offset(MatrixCoord::new(i, j)) as u32;
            let mut acc = if init { 0.0 } else { res.read(c, c_off) };
            for p in 0..k {
                let av = res.read(a, a_layout.offset(MatrixCoord::new(i, p)) as u32);
                let bv = res.read(b, b_layout.offset(MatrixCoord::new(p, j)) as u32);
                acc += av.to_f32() * bv.to_f32();
            }
            res.write(c, c_off, acc);
        }
    }
}

/// Mmad step whose accumulator starts from a per-column bias instead of zero.
#[allow(clippy::too_many_arguments)]
pub fn tile_mmad_bias<E: Element>(
    res: &mut Resource,
    c: &LocalTensor<f32>,
    c_layout: &Zn,
    a: &LocalTensor<E>,
    a_layout: &impl Layout,
    b: &LocalTensor<E>,
    b_layout: &impl Layout,
    bias: &LocalTensor<f32>,
    m: u32,
    n: u32,
    k: u32,
) {
    for i in 0..m {
        for j in 0..n {
            let c_off = c_layout.offset(MatrixCoord::new(i, j)) as u32;
            let mut acc = res.read(bias, j);
            for p in 0..k {
                let av = res.read(a, a_layout.offset(MatrixCoord::new(i, p)) as u32);
                let bv = res.read(b, b_layout.offset(MatrixCoord::new(p, j)) as u32);
                acc += av.to_f32() * bv.to_f32();
            }
            res.write(c, c_off, acc);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{ArchSpec, CoreKind, PoolKind};
    use crate::layout::{Nz, RowMajor};
    use half::f16;

    fn aic_resource() -> Resource {
        Resource::new(&ArchSpec::atlas_a2(), CoreKind::Aic)
    }

    #[test]
    fn test_copy_roundtrip_through_fractal() {
        // GM row-major -> L1 fractal -> GM row-major must be the identity,
        // shape deliberately unaligned.
        let (rows, cols) = (19, 33);
        let src_data: Vec<f16> = (0..rows * cols)
            .map(|i| f16::from_f32(i as f32))
            .collect();
        let src = GmTensor::from_vec(src_data.clone());
        let gm_layout = RowMajor::new(rows as u32, cols as u32);
        let l1_layout = Nz::make_layout::<f16>(rows as u32, cols as u32);

        let mut res = aic_resource();
        let l1: LocalTensor<f16> = res
            .lease(PoolKind::L1, l1_layout.capacity() as u32)
            .unwrap();
        let shape = MatrixCoord::new(rows as u32, cols as u32);
        copy_gm_to_local(&mut res, &l1, &l1_layout, &src, &gm_layout, shape);

        let dst: GmTensor<f16> = GmTensor::new(rows * cols);
        copy_local_to_gm(&res, &dst, &gm_layout, &l1, &l1_layout, shape);
        assert_eq!(dst.to_vec(), src_data);
    }

    #[test]
    fn test_mmad_small_matrix() {
        let m = 2u32;
        let n = 2;
        let k = 3;
        let a_data = [1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0];
        let b_data = [7.0f32, 8.0, 9.0, 10.0, 11.0, 12.0];

        let mut res = aic_resource();
        let a: LocalTensor<f32> = res.lease(PoolKind::L0A, 6).unwrap();
        let b: LocalTensor<f32> = res.lease(PoolKind::L0B, 6).unwrap();
        for (i, &v) in a_data.iter().enumerate() {
            res.write(&a, i as u32, v);
        }
        for (i, &v) in b_data.iter().enumerate() {
            res.write(&b, i as u32, v);
        }
        let c_layout = Zn::make_layout_in_l0c(MatrixCoord::new(m, n));
        let c: LocalTensor<f32> = res
            .lease(PoolKind::L0C, (c_layout.capacity()) as u32)
            .unwrap();

        let a_layout = RowMajor::new(m, k);
        let b_layout = RowMajor::new(k, n);
        tile_mmad(&mut res, &c, &c_layout, &a, &a_layout, &b, &b_layout, m, n, k, true);

        // [[1 2 3],[4 5 6]] x [[7 8],[9 10],[11 12]]
        let expect = [[58.0, 64.0], [139.0, 154.0]];
        for i in 0..m {
            for j in 0..n {
                let off = c_layout.offset(MatrixCoord::new(i, j)) as u32;
                assert_eq!(res.read(&c, off), expect[i as usize][j as usize]);
            }
        }

        // Second slice without init accumulates.
        tile_mmad(&mut res, &c, &c_layout, &a, &a_layout, &b, &b_layout, m, n, k, false);
        let off = c_layout.offset(MatrixCoord::new(0, 0)) as u32;
        assert_eq!(res.read(&c, off), 116.0);
    }

    #[test]
    fn test_l0c_flush_narrows_and_accumulates() {
        let mut res = aic_resource();
        let shape = MatrixCoord::new(1, 2);
        let c_layout = Zn::make_layout_in_l0c(shape);
        let c: LocalTensor<f32> = res.lease(PoolKind::L0C, c_layout.capacity() as u32).unwrap();
        res.write(&c, c_layout.offset(MatrixCoord::new(0, 0)) as u32, 1.25);
        res.write(&c, c_layout.offset(MatrixCoord::new(0, 1)) as u32, 2.5);

        let dst: GmTensor<f16> = GmTensor::from_vec(vec![f16::from_f32(1.0); 2]);
        let dst_layout = RowMajor::new(1, 2);
        copy_l0c_to_gm(&res, &dst, &dst_layout, &c, &c_layout, shape, false);
        assert_eq!(dst.read(0).to_f32(), 1.25);

        copy_l0c_to_gm(&res, &dst, &dst_layout, &c, &c_layout, shape, true);
        assert_eq!(dst.read(1).to_f32(), 5.0);
    }
}
