//! Vector-core dequantization stage for W8A16 matmul.
//!
//! The weight matrix arrives as int8 with a per-column f32 scale and zero
//! point. A vector core streams weight tiles through a UB ping-pong,
//! rewrites them as `(q - zero) * scale` in f16, and stores them to a
//! half-precision workspace the matrix cores then consume as a plain B
//! operand.

use crate::arch::{ArchSpec, EventId, EventTable, HardEvent, LocalTensor, PoolKind, Resource};
use crate::coord::MatrixCoord;
use crate::device::GmTensor;
use crate::error::LaunchError;
use crate::gemm::block::StageRing;
use crate::layout::{Layout, RowMajor};

const PARAM_EVENT: EventId = EventId(4);

/// Tile shape one dequant call covers.
#[derive(Debug, Clone, Copy)]
pub struct DequantConfig {
    pub k_tile: u32,
    pub n_tile: u32,
}

impl DequantConfig {
    fn validate(&self, arch: &ArchSpec) -> Result<(), LaunchError> {
        if self.k_tile == 0 || self.n_tile == 0 {
            return Err(LaunchError::InvalidConfig(
                "dequant tile must be non-empty".to_string(),
            ));
        }
        let in_layout =
            RowMajor::make_layout_in_ub::<i8>(MatrixCoord::new(self.k_tile, self.n_tile));
        let out_layout =
            RowMajor::make_layout_in_ub::<half::f16>(MatrixCoord::new(self.k_tile, self.n_tile));
        let needed = 2 * in_layout.capacity() as u32
            + 2 * out_layout.capacity() as u32 * 2
            + 2 * self.n_tile * 4;
        if needed > arch.ub_bytes {
            return Err(LaunchError::ScratchOverflow {
                pool: PoolKind::Ub,
                needed,
                capacity: arch.ub_bytes,
            });
        }
        Ok(())
    }
}

pub struct DequantB {
    config: DequantConfig,
    ub_in: [LocalTensor<i8>; 2],
    ub_out: [LocalTensor<half::f16>; 2],
    ub_scale: LocalTensor<f32>,
    ub_zero: LocalTensor<f32>,
    in_layout: RowMajor,
    out_layout: RowMajor,
    ring: StageRing,
    params_loaded: bool,
}

impl DequantB {
    pub fn new(
        arch: &ArchSpec,
        res: &mut Resource,
        events: &mut EventTable,
        config: DequantConfig,
    ) -> Result<Self, LaunchError> {
        config.validate(arch)?;
        let in_layout =
            RowMajor::make_layout_in_ub::<i8>(MatrixCoord::new(config.k_tile, config.n_tile));
        let out_layout =
            RowMajor::make_layout_in_ub::<half::f16>(MatrixCoord::new(config.k_tile, config.n_tile));
        let ub_in = [
            res.lease(PoolKind::Ub, in_layout.capacity() as u32)?,
            res.lease(PoolKind::Ub, in_layout.capacity() as u32)?,
        ];
        let ub_out = [
            res.lease(PoolKind::Ub, out_layout.capacity() as u32)?,
            res.lease(PoolKind::Ub, out_layout.capacity() as u32)?,
        ];
        let ub_scale = res.lease(PoolKind::Ub, config.n_tile)?;
        let ub_zero = res.lease(PoolKind::Ub, config.n_tile)?;

        let ring = StageRing::new(2, 0);
        for slot in 0..2 {
            events.set(HardEvent::VMte2, ring.event_id_of(slot, 0));
            events.set(HardEvent::Mte3V, ring.event_id_of(slot, 1));
        }

        Ok(DequantB {
            config,
            ub_in,
            ub_out,
            ub_scale,
            ub_zero,
            in_layout,
            out_layout,
            ring,
            params_loaded: false,
        })
    }

    /// Stage the per-column quantization parameters for the columns this call
    /// will touch. Must run before the first `dequant_tile` and again whenever
    /// the column window moves.
    pub fn load_params(
        &mut self,
        res: &mut Resource,
        events: &mut EventTable,
        scale: &GmTensor<f32>,
        zero: &GmTensor<f32>,
        col0: u32,
        cols: u32,
    ) {
        assert!(cols <= self.config.n_tile, "param window wider than tile");
        if self.params_loaded {
            events.wait(HardEvent::VMte2, PARAM_EVENT);
        }
        scale.with(|data| {
            for c in 0..cols {
                res.write(&self.ub_scale, c, data[(col0 + c) as usize]);
            }
        });
        zero.with(|data| {
            for c in 0..cols {
                res.write(&self.ub_zero, c, data[(col0 + c) as usize]);
            }
        });
        events.set(HardEvent::Mte2V, PARAM_EVENT);
        events.wait(HardEvent::Mte2V, PARAM_EVENT);
        events.set(HardEvent::VMte2, PARAM_EVENT);
        self.params_loaded = true;
    }

    /// Dequantize one `shape` tile of `src` (addressed from `src_origin`) and
    /// store it at the same origin of `dst`. Column `c` of the tile uses
    /// parameter slot `c`, so the loaded window must match `src_origin`'s
    /// columns.
    #[allow(clippy::too_many_arguments)]
    pub fn dequant_tile(
        &mut self,
        res: &mut Resource,
        events: &mut EventTable,
        src: &GmTensor<i8>,
        src_layout: &impl Layout,
        src_origin: MatrixCoord,
        shape: MatrixCoord,
        dst: &GmTensor<half::f16>,
        dst_layout: &impl Layout,
    ) {
        assert!(self.params_loaded, "quantization parameters not staged");
        assert!(
            shape.row() <= self.config.k_tile && shape.column() <= self.config.n_tile,
            "tile exceeds dequant config"
        );
        let slot = self.ring.slot();

        events.wait(HardEvent::VMte2, self.ring.event_id(0));
        src.with(|data| {
            for r in 0..shape.row() {
                for c in 0..shape.column() {
                    let coord = MatrixCoord::new(src_origin.row() + r, src_origin.column() + c);
                    let v = data[src_layout.offset(coord) as usize];
                    res.write(
                        &self.ub_in[slot],
                        self.in_layout.offset(MatrixCoord::new(r, c)) as u32,
                        v,
                    );
                }
            }
        });
        events.set(HardEvent::Mte2V, self.ring.event_id(0));
        events.wait(HardEvent::Mte2V, self.ring.event_id(0));

        events.wait(HardEvent::Mte3V, self.ring.event_id(1));
        for r in 0..shape.row() {
            for c in 0..shape.column() {
                let off = self.in_layout.offset(MatrixCoord::new(r, c)) as u32;
                let q = res.read(&self.ub_in[slot], off) as f32;
                let scale = res.read(&self.ub_scale, c);
                let zero = res.read(&self.ub_zero, c);
                res.write(
                    &self.ub_out[slot],
                    self.out_layout.offset(MatrixCoord::new(r, c)) as u32,
                    half::f16::from_f32((q - zero) * scale),
                );
            }
        }
        events.set(HardEvent::VMte2, self.ring.event_id(0));
        events.set(HardEvent::VMte3, self.ring.event_id(1));
        events.wait(HardEvent::VMte3, self.ring.event_id(1));

        dst.with_mut(|data| {
            for r in 0..shape.row() {
                for c in 0..shape.column() {
                    let coord = MatrixCoord::new(src_origin.row() + r, src_origin.column() + c);
                    let v = res.read(
                        &self.ub_out[slot],
                        self.out_layout.offset(MatrixCoord::new(r, c)) as u32,
                    );
                    data[dst_layout.offset(coord) as usize] = v;
                }
            }
        });
        events.set(HardEvent::Mte3V, self.ring.event_id(1));
        self.ring.advance();
    }

    pub fn finish(&mut self, events: &mut EventTable) {
        for slot in 0..2 {
            events.wait(HardEvent::VMte2, self.ring.event_id_of(slot, 0));
            events.wait(HardEvent::Mte3V, self.ring.event_id_of(slot, 1));
        }
        if self.params_loaded {
            events.wait(HardEvent::VMte2, PARAM_EVENT);
            self.params_loaded = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::CoreKind;
    use crate::test_utils::{random_f32, random_i8};

    #[test]
    fn test_dequant_tile_values() {
        let arch = ArchSpec::atlas_a2();
        let mut res = Resource::new(&arch, CoreKind::Aiv);
        let mut events = EventTable::new();
        let config = DequantConfig {
            k_tile: 8,
            n_tile: 8,
        };
        let mut stage = DequantB::new(&arch, &mut res, &mut events, config).unwrap();

        let (k, n) = (20u32, 8u32);
        let src = GmTensor::from_vec(random_i8((k * n) as usize, 51));
        let scale = GmTensor::from_vec(random_f32(n as usize, 52));
        let zero = GmTensor::from_vec(random_f32(n as usize, 53));
        let dst: GmTensor<half::f16> = GmTensor::new((k * n) as usize);
        let layout = RowMajor::new(k, n);

        stage.load_params(&mut res, &mut events, &scale, &zero, 0, n);
        for row0 in (0..k).step_by(config.k_tile as usize) {
            let rows = (k - row0).min(config.k_tile);
            stage.dequant_tile(
                &mut res,
                &mut events,
                &src,
                &layout,
                MatrixCoord::new(row0, 0),
                MatrixCoord::new(rows, n),
                &dst,
                &layout,
            );
        }
        stage.finish(&mut events);
        events.assert_quiesced();

        let sv = src.to_vec();
        let sc = scale.to_vec();
        let zp = zero.to_vec();
        let got = dst.to_vec();
        for i in 0..(k * n) as usize {
            let col = i % n as usize;
            let expect = half::f16::from_f32((sv[i] as f32 - zp[col]) * sc[col]);
            assert_eq!(got[i], expect, "element {}", i);
        }
    }

    #[test]
    #[should_panic(expected = "parameters not staged")]
    fn test_dequant_without_params_panics() {
        let arch = ArchSpec::atlas_a2();
        let mut res = Resource::new(&arch, CoreKind::Aiv);
        let mut events = EventTable::new();
        let config = DequantConfig {
            k_tile: 8,
            n_tile: 8,
        };
        let mut stage = DequantB::new(&arch, &mut res, &mut events, config).unwrap();
        let src = GmTensor::from_vec(vec![0i8; 64]);
        let dst: GmTensor<half::f16> = GmTensor::new(64);
        let layout = RowMajor::new(8, 8);
        stage.dequant_tile(
            &mut res,
            &mut events,
            &src,
            &layout,
            MatrixCoord::new(0, 0),
            MatrixCoord::new(8, 8),
            &dst,
            &layout,
        );
    }
}
